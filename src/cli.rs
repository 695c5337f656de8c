use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use crate::commands;
use crate::env_loader;

#[derive(Debug, Parser)]
#[command(name = "floorsum")]
#[command(about = "Incremental conversation summarization scheduler")]
pub struct Cli {
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show cursor, backlog and binding for a conversation.
    Status(ConversationArgs),
    /// React to log growth: summarize if enough new floors exist.
    Trigger(ConversationArgs),
    /// Summarize the whole safe backlog now, up to the per-run cap.
    CatchUp(ConversationArgs),
    Reconcile(ReconcileArgs),
    /// Start fresh: treat the conversation's existing history as covered.
    Reset(ResetArgs),
    /// Ask the run in flight for a conversation to stop after its current batch.
    Abort(ConversationArgs),
    /// Read trigger events as JSON lines from stdin.
    Listen,
    Config(ConfigArgs),
}

#[derive(Debug, Args)]
pub struct ConversationArgs {
    pub conversation: String,
}

#[derive(Debug, Args)]
pub struct ReconcileArgs {
    pub conversation: String,
    /// Adopt the artifact store's progress even if it moves the cursor back.
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Args)]
pub struct ResetArgs {
    pub conversation: String,
    /// Move the cursor back to floor 0 instead of past the current log.
    #[arg(long)]
    pub rewind: bool,
}

#[derive(Debug, Args, Default)]
pub struct ConfigArgs {
    #[arg(long)]
    pub show: bool,
}

fn print_report(report: &commands::CommandReport, as_json: bool) -> Result<()> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("command: {}", report.command);
    println!("ok: {}", report.ok);
    if !report.details.is_empty() {
        println!("details:");
        for detail in &report.details {
            println!("- {detail}");
        }
    }
    if !report.issues.is_empty() {
        println!("issues:");
        for issue in &report.issues {
            println!("- {issue}");
        }
    }
    Ok(())
}

pub fn run() -> Result<()> {
    let _ = env_loader::load_dotenv();
    let cli = Cli::parse();

    let report = match &cli.command {
        Command::Status(args) => commands::status::run(&args.conversation)?,
        Command::Trigger(args) => commands::trigger::run(&commands::trigger::TriggerOptions {
            conversation: args.conversation.clone(),
            catch_up: false,
        })?,
        Command::CatchUp(args) => commands::trigger::run(&commands::trigger::TriggerOptions {
            conversation: args.conversation.clone(),
            catch_up: true,
        })?,
        Command::Reconcile(args) => {
            commands::reconcile::run(&commands::reconcile::ReconcileCommandOptions {
                conversation: args.conversation.clone(),
                force: args.force,
            })?
        }
        Command::Reset(args) => commands::reset::run(&commands::reset::ResetOptions {
            conversation: args.conversation.clone(),
            rewind: args.rewind,
        })?,
        Command::Abort(args) => commands::abort::run(&args.conversation)?,
        Command::Listen => commands::listen::run()?,
        Command::Config(args) => {
            commands::config::run(&commands::config::ConfigOptions { show: args.show })?
        }
    };

    print_report(&report, cli.json)?;

    if report.ok {
        Ok(())
    } else {
        std::process::exit(2);
    }
}
