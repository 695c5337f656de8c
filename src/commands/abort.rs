use anyhow::{Context, Result};
use std::fs;

use crate::commands::CommandReport;
use crate::sched::audit;
use crate::sched::paths::resolve_paths;
use crate::sched::run_lock::active_run;

pub fn run(conversation: &str) -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let mut report = CommandReport::new("abort");
    report.detail(format!("conversation={conversation}"));

    let Some(active) = active_run(&paths, conversation)? else {
        report.detail("no run in flight; nothing to abort");
        return Ok(report);
    };

    let marker = paths.abort_marker_path(conversation);
    if let Some(parent) = marker.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(&marker, format!("{}\n", active.run_id))
        .with_context(|| format!("failed to write abort marker {}", marker.display()))?;
    audit::record(
        &paths,
        conversation,
        "abort",
        "requested",
        &format!("target_pid={} run_id={}", active.pid, active.run_id),
    );
    report.detail(format!("abort requested for pid {}", active.pid));
    report.detail("the run stops after its current batch; completed batches stay committed");
    Ok(report)
}
