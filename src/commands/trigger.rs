use anyhow::Result;
use std::sync::Arc;

use crate::commands::{CommandReport, describe_outcome, install_interrupt_handler, load_context};
use crate::sched::engine::{Engine, TriggerKind};

#[derive(Debug, Clone)]
pub struct TriggerOptions {
    pub conversation: String,
    pub catch_up: bool,
}

pub fn run(opts: &TriggerOptions) -> Result<CommandReport> {
    let (paths, cfg) = load_context()?;
    let kind = if opts.catch_up {
        TriggerKind::ManualCatchUp
    } else {
        TriggerKind::LogGrew
    };
    let mut report = CommandReport::new(if opts.catch_up { "catch-up" } else { "trigger" });
    report.detail(format!("conversation={}", opts.conversation));

    let engine = Arc::new(Engine::from_config(paths, &cfg)?);
    install_interrupt_handler(&engine);

    let outcome = engine.trigger(&opts.conversation, kind, &mut |progress| {
        eprintln!(
            "floorsum: batch {}/{} {} done, next_floor={}",
            progress.index + 1,
            progress.total,
            progress.batch,
            progress.next_floor
        );
    });
    describe_outcome(&mut report, &outcome);
    report.attach(&outcome)?;
    Ok(report)
}
