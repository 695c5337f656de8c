use anyhow::Result;

use crate::commands::{CommandReport, load_context};
use crate::sched::engine::Engine;
use crate::sched::paths::conversation_file_stem;

pub fn run(conversation: &str) -> Result<CommandReport> {
    let (paths, cfg) = load_context()?;
    let mut report = CommandReport::new("status");

    report.detail(format!(
        "floorsum_home={} ({})",
        paths.home.display(),
        if paths.home_is_explicit {
            "FLOORSUM_HOME"
        } else {
            "default"
        }
    ));
    let transcript = paths
        .conversations_dir
        .join(format!("{}.jsonl", conversation_file_stem(conversation)));
    if !transcript.exists() {
        report.issue(format!("missing message log ({})", transcript.display()));
        return Ok(report);
    }

    let engine = Engine::bookkeeping(paths, &cfg);
    let status = engine.status(conversation)?;
    report.detail(format!("conversation={}", status.conversation));
    report.detail(format!("length={}", status.length));
    report.detail(format!("next_floor={}", status.next_floor));
    match status.safe_limit {
        Some(limit) => report.detail(format!("safe_limit={limit}")),
        None => report.detail("safe_limit=none (log shorter than keep_count)"),
    }
    report.detail(format!("distance={}", status.distance));
    report.detail(format!(
        "interval={} keep_count={}",
        status.interval, status.keep_count
    ));
    match status.next_batch {
        Some(batch) => report.detail(format!(
            "next_batch={batch} (floors {})",
            batch.display_range()
        )),
        None => report.detail("next_batch=none"),
    }
    report.detail(format!(
        "bound_book={}",
        status.bound_book.as_deref().unwrap_or("none")
    ));
    report.detail(format!("running={}", status.running));
    if let Some(pid) = status.running_pid {
        report.detail(format!("running_pid={pid}"));
    }
    match &status.last_event {
        Some(event) => report.detail(format!(
            "last_event={}/{} at_epoch_secs={}",
            event.phase, event.status, event.at_epoch_secs
        )),
        None => report.detail("last_event=none"),
    }
    report.attach(&status)?;
    Ok(report)
}
