pub mod abort;
pub mod config;
pub mod listen;
pub mod reconcile;
pub mod reset;
pub mod status;
pub mod trigger;

use crate::sched::config::{FloorsumConfig, load_config};
use crate::sched::engine::{Engine, TriggerOutcome};
use crate::sched::paths::{SchedPaths, resolve_paths};
use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub command: String,
    pub ok: bool,
    pub details: Vec<String>,
    pub issues: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CommandReport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ok: true,
            details: Vec::new(),
            issues: Vec::new(),
            data: None,
        }
    }

    pub fn detail(&mut self, text: impl Into<String>) {
        self.details.push(text.into());
    }

    pub fn issue(&mut self, text: impl Into<String>) {
        self.ok = false;
        self.issues.push(text.into());
    }

    pub fn attach<T: Serialize>(&mut self, data: &T) -> Result<()> {
        self.data = Some(serde_json::to_value(data)?);
        Ok(())
    }
}

pub fn load_context() -> Result<(SchedPaths, FloorsumConfig)> {
    let paths = resolve_paths()?;
    let cfg = load_config(&paths.home)?;
    Ok((paths, cfg))
}

/// Ctrl-C cancels every run in flight; each stops at its last completed batch.
pub fn install_interrupt_handler(engine: &Arc<Engine>) {
    let engine = Arc::clone(engine);
    let _ = ctrlc::set_handler(move || {
        let aborted = engine.registry().abort_all();
        eprintln!("floorsum: interrupt received, cancelling {aborted} run(s)");
    });
}

pub fn describe_outcome(report: &mut CommandReport, outcome: &TriggerOutcome) {
    report.detail(format!("outcome={}", outcome.label()));
    match outcome {
        TriggerOutcome::Busy => {
            report.detail("a run for this conversation is already in flight; trigger ignored");
        }
        TriggerOutcome::Waiting {
            next_floor,
            distance,
            interval,
        } => {
            report.detail(format!("next_floor={next_floor}"));
            report.detail(format!("distance={distance}"));
            report.detail(format!("interval={interval}"));
        }
        TriggerOutcome::Ran(run) => {
            report.detail(format!("mode={}", run.mode));
            report.detail(format!("cursor_before={}", run.cursor_before));
            report.detail(format!("cursor_after={}", run.cursor_after));
            report.detail(format!("planned={}", run.catch_up.planned.len()));
            report.detail(format!("completed={}", run.catch_up.completed.len()));
            if !run.catch_up.skipped.is_empty() {
                report.detail(format!("skipped={}", run.catch_up.skipped.len()));
            }
            for batch in &run.catch_up.completed {
                report.detail(format!(
                    "summarized {batch} (floors {})",
                    batch.display_range()
                ));
            }
            if let crate::sched::catchup::StopReason::Failed { batch, reason } = &run.catch_up.stop
            {
                report.issue(format!("batch {batch} failed: {reason}"));
            }
            if let crate::sched::catchup::StopReason::Drifted { expected, found } =
                &run.catch_up.stop
            {
                report.detail(format!(
                    "cursor moved during the run (expected {expected}, found {found}); replanning on next trigger"
                ));
            }
        }
        TriggerOutcome::Failed { reason } => report.issue(reason.clone()),
    }
}
