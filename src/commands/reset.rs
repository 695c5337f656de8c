use anyhow::Result;

use crate::commands::{CommandReport, load_context};
use crate::sched::engine::Engine;

#[derive(Debug, Clone)]
pub struct ResetOptions {
    pub conversation: String,
    pub rewind: bool,
}

pub fn run(opts: &ResetOptions) -> Result<CommandReport> {
    let (paths, cfg) = load_context()?;
    let mut report = CommandReport::new("reset");
    let engine = Engine::bookkeeping(paths, &cfg);

    let (previous, next_floor) = engine.reset(&opts.conversation, opts.rewind)?;
    report.detail(format!("conversation={}", opts.conversation));
    report.detail(format!("previous={previous}"));
    report.detail(format!("next_floor={next_floor}"));
    if opts.rewind {
        report.detail("stored summaries still count: the next trigger reconciles before planning");
    } else {
        report.detail("existing history treated as covered; only new floors will be summarized");
    }
    Ok(report)
}
