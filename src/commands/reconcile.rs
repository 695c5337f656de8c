use anyhow::Result;

use crate::commands::{CommandReport, load_context};
use crate::sched::engine::Engine;

#[derive(Debug, Clone)]
pub struct ReconcileCommandOptions {
    pub conversation: String,
    pub force: bool,
}

pub fn run(opts: &ReconcileCommandOptions) -> Result<CommandReport> {
    let (paths, cfg) = load_context()?;
    let mut report = CommandReport::new("reconcile");
    let engine = Engine::bookkeeping(paths, &cfg);

    let outcome = engine.reconcile(&opts.conversation, opts.force)?;
    report.detail(format!("conversation={}", opts.conversation));
    report.detail(format!("force={}", opts.force));
    report.detail(format!("previous={}", outcome.previous));
    report.detail(format!("next_floor={}", outcome.next_floor));
    report.detail(format!("changed={}", outcome.changed()));
    report.detail(outcome.summary());
    Ok(report)
}
