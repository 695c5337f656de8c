use crate::sched::artifacts::{ArtifactStore, FileArtifactStore};
use crate::sched::audit::{self, AuditEvent};
use crate::sched::cancel::CancelToken;
use crate::sched::catchup::{BatchProgress, CatchUpProcessor, CatchUpReport, StopReason};
use crate::sched::config::FloorsumConfig;
use crate::sched::cursor::{CursorStore, FileCursorStore};
use crate::sched::floor::{Batch, Floor, safe_limit};
use crate::sched::invoker::{DisabledSummarizer, RetryPolicy, Summarizer, build_summarizer};
use crate::sched::monitor::RunRegistry;
use crate::sched::paths::SchedPaths;
use crate::sched::planner::{PlanDecision, decide, distance_since_cursor, next_batch};
use crate::sched::progress::{ReconcileOptions, ReconcileOutcome, Reconciler};
use crate::sched::run_lock::{RunLock, active_run};
use crate::sched::transcript::{JsonlMessageLog, MessageLog};
use crate::sched::warn;
use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    /// The message log grew by one or more entries.
    LogGrew,
    /// Someone asked to clear the backlog now.
    ManualCatchUp,
}

impl TriggerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LogGrew => "log-grew",
            Self::ManualCatchUp => "manual-catch-up",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub interval: u64,
    pub keep_count: u64,
    pub max_batches: usize,
    pub sync_enabled: bool,
    pub auto_bind: bool,
    pub retry: RetryPolicy,
}

impl EngineSettings {
    pub fn from_config(cfg: &FloorsumConfig) -> Self {
        Self {
            interval: cfg.schedule.interval,
            keep_count: cfg.schedule.keep_count,
            max_batches: usize::try_from(cfg.schedule.max_batches_per_run).unwrap_or(usize::MAX),
            sync_enabled: cfg.sync.enabled,
            auto_bind: cfg.sync.auto_bind,
            retry: RetryPolicy::from_config(&cfg.summarizer),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub mode: String,
    pub cursor_before: Floor,
    pub cursor_after: Floor,
    #[serde(flatten)]
    pub catch_up: CatchUpReport,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    /// A run for this conversation is already in flight; the trigger is dropped.
    Busy,
    Waiting {
        next_floor: Floor,
        distance: u64,
        interval: u64,
    },
    Ran(RunReport),
    Failed {
        reason: String,
    },
}

impl TriggerOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Busy => "busy",
            Self::Waiting { .. } => "waiting",
            Self::Ran(report) => report.catch_up.stop.label(),
            Self::Failed { .. } => "failed",
        }
    }

    /// Busy, waiting, completed and cancelled runs are all normal outcomes.
    pub fn is_ok(&self) -> bool {
        match self {
            Self::Ran(report) => !matches!(
                report.catch_up.stop,
                StopReason::Failed { .. }
            ),
            Self::Failed { .. } => false,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationStatus {
    pub conversation: String,
    pub length: u64,
    pub next_floor: Floor,
    pub safe_limit: Option<Floor>,
    pub distance: u64,
    pub interval: u64,
    pub keep_count: u64,
    pub next_batch: Option<Batch>,
    pub bound_book: Option<String>,
    pub running: bool,
    pub running_pid: Option<u32>,
    pub last_event: Option<AuditEvent>,
}

/// Per-conversation scheduler: reconcile, decide, run the plan, reconcile.
pub struct Engine {
    paths: SchedPaths,
    settings: EngineSettings,
    log: Arc<dyn MessageLog>,
    cursor: Arc<dyn CursorStore>,
    artifacts: Arc<dyn ArtifactStore>,
    summarizer: Arc<dyn Summarizer>,
    registry: RunRegistry,
}

impl Engine {
    pub fn new(
        paths: SchedPaths,
        settings: EngineSettings,
        log: Arc<dyn MessageLog>,
        cursor: Arc<dyn CursorStore>,
        artifacts: Arc<dyn ArtifactStore>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        Self {
            paths,
            settings,
            log,
            cursor,
            artifacts,
            summarizer,
            registry: Default::default(),
        }
    }

    /// Engine over the on-disk stores under `paths`.
    pub fn from_config(paths: SchedPaths, cfg: &FloorsumConfig) -> Result<Self> {
        let summarizer = build_summarizer(&cfg.summarizer)?;
        Ok(Self::new(
            paths.clone(),
            EngineSettings::from_config(cfg),
            Arc::new(JsonlMessageLog::new(&paths)),
            Arc::new(FileCursorStore::new(&paths)),
            Arc::new(FileArtifactStore::new(&paths)),
            summarizer,
        ))
    }

    /// Engine for status, reconcile and reset; it cannot summarize.
    pub fn bookkeeping(paths: SchedPaths, cfg: &FloorsumConfig) -> Self {
        Self::new(
            paths.clone(),
            EngineSettings::from_config(cfg),
            Arc::new(JsonlMessageLog::new(&paths)),
            Arc::new(FileCursorStore::new(&paths)),
            Arc::new(FileArtifactStore::new(&paths)),
            Arc::new(DisabledSummarizer),
        )
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    fn reconciler(&self) -> Reconciler<'_> {
        Reconciler {
            cursor: self.cursor.as_ref(),
            artifacts: self.artifacts.as_ref(),
            sync_enabled: self.settings.sync_enabled,
            auto_bind: self.settings.auto_bind,
        }
    }

    /// React to one trigger. Never returns an error: every failure inside the
    /// run is audited and reported as an outcome, and the run slot is always
    /// released.
    pub fn trigger(
        &self,
        conversation: &str,
        kind: TriggerKind,
        on_progress: &mut dyn FnMut(&BatchProgress),
    ) -> TriggerOutcome {
        let Some(mut guard) = self.registry.try_begin(conversation) else {
            audit::record(
                &self.paths,
                conversation,
                "trigger",
                "skipped",
                &format!("kind={} reason=busy", kind.as_str()),
            );
            return TriggerOutcome::Busy;
        };
        let lock = match RunLock::try_acquire(&self.paths, conversation) {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                audit::record(
                    &self.paths,
                    conversation,
                    "trigger",
                    "skipped",
                    &format!(
                        "kind={} reason=locked-by-other-process",
                        kind.as_str()
                    ),
                );
                return TriggerOutcome::Busy;
            }
            Err(err) => return self.fail(conversation, "lock", &err),
        };
        guard.watch_marker(self.paths.abort_marker_path(conversation), lock.run_id());

        let outcome = match self.run_claimed(conversation, kind, guard.token(), on_progress) {
            Ok(outcome) => outcome,
            Err(err) => self.fail(conversation, "run", &err),
        };
        drop(lock);
        drop(guard);
        outcome
    }

    fn fail(&self, conversation: &str, stage: &str, err: &anyhow::Error) -> TriggerOutcome {
        let reason = format!("{err:#}");
        warn::emit(warn::WarnEvent {
            code: "RUN_FAILED",
            stage,
            action: "abandon-run",
            conversation,
            range: None,
            retry: "next-trigger",
            reason: "run-error",
            err: &reason,
        });
        audit::record(
            &self.paths,
            conversation,
            "trigger",
            "failed",
            &format!("stage={stage} error={reason}"),
        );
        TriggerOutcome::Failed { reason }
    }

    fn run_claimed(
        &self,
        conversation: &str,
        kind: TriggerKind,
        cancel: &CancelToken,
        on_progress: &mut dyn FnMut(&BatchProgress),
    ) -> Result<TriggerOutcome> {
        let len = self.log.len(conversation)?;
        let reconciler = self.reconciler();
        let before = reconciler.reconcile(conversation, len, ReconcileOptions::default())?;
        if before.changed() {
            audit::record(
                &self.paths,
                conversation,
                "reconcile",
                "ok",
                &before.summary(),
            );
        }

        let decision = decide(
            len,
            before.next_floor,
            self.settings.interval,
            self.settings.keep_count,
            self.settings.max_batches,
            kind == TriggerKind::ManualCatchUp,
        );
        let (mode, batches) = match decision {
            PlanDecision::Wait { distance } => {
                audit::record(
                    &self.paths,
                    conversation,
                    "plan",
                    "waiting",
                    &format!(
                        "kind={} next_floor={} distance={distance} interval={}",
                        kind.as_str(),
                        before.next_floor,
                        self.settings.interval
                    ),
                );
                return Ok(TriggerOutcome::Waiting {
                    next_floor: before.next_floor,
                    distance,
                    interval: self.settings.interval,
                });
            }
            PlanDecision::Run { mode, batches } if batches.is_empty() => {
                // Enough distance but the keep-count tail leaves no full batch.
                let distance = distance_since_cursor(len, before.next_floor).unwrap_or(0);
                audit::record(
                    &self.paths,
                    conversation,
                    "plan",
                    "waiting",
                    &format!(
                        "mode={} reason=keep-count distance={distance}",
                        mode.as_str()
                    ),
                );
                return Ok(TriggerOutcome::Waiting {
                    next_floor: before.next_floor,
                    distance,
                    interval: self.settings.interval,
                });
            }
            PlanDecision::Run { mode, batches } => (mode, batches),
        };
        let listed = batches
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        audit::record(
            &self.paths,
            conversation,
            "plan",
            "planned",
            &format!(
                "kind={} mode={} batches={listed}",
                kind.as_str(),
                mode.as_str()
            ),
        );

        let processor = CatchUpProcessor {
            log: self.log.as_ref(),
            cursor: self.cursor.as_ref(),
            artifacts: self.artifacts.as_ref(),
            summarizer: self.summarizer.as_ref(),
            policy: self.settings.retry,
        };
        let report = processor.run(conversation, &batches, cancel, &mut |progress| {
            audit::record(
                &self.paths,
                conversation,
                "batch",
                "ok",
                &format!(
                    "batch={} floors={} step={}/{} next_floor={}",
                    progress.batch,
                    progress.batch.display_range(),
                    progress.index + 1,
                    progress.total,
                    progress.next_floor
                ),
            );
            on_progress(progress);
        });

        match &report.stop {
            StopReason::Failed { batch, reason } => {
                warn::emit(warn::WarnEvent {
                    code: "BATCH_FAILED",
                    stage: "catch-up",
                    action: "stop-run",
                    conversation,
                    range: Some(*batch),
                    retry: "next-trigger",
                    reason: "summarize-failed",
                    err: reason,
                });
            }
            StopReason::Cancelled => audit::record(
                &self.paths,
                conversation,
                "abort",
                "ok",
                &format!(
                    "completed={}",
                    report.completed.len()
                ),
            ),
            StopReason::Drifted { expected, found } => {
                let detail = format!("expected={expected} found={found}");
                warn::emit(warn::WarnEvent {
                    code: "CURSOR_DRIFT",
                    stage: "catch-up",
                    action: "stop-run",
                    conversation,
                    range: None,
                    retry: "next-trigger",
                    reason: "cursor-moved-externally",
                    err: &detail,
                });
            }
            StopReason::Completed => {}
        }
        audit::record(
            &self.paths,
            conversation,
            "catch-up",
            report.stop.label(),
            &format!(
                "planned={} completed={} skipped={}",
                report.planned.len(),
                report.completed.len(),
                report.skipped.len()
            ),
        );

        let cursor_after = match reconciler.reconcile(
            conversation,
            self.log.len(conversation)?,
            ReconcileOptions::default(),
        ) {
            Ok(outcome) => outcome.next_floor,
            Err(err) => {
                let detail = format!("{err:#}");
                warn::emit(warn::WarnEvent {
                    code: "RECONCILE_FAILED",
                    stage: "reconcile",
                    action: "keep-cursor",
                    conversation,
                    range: None,
                    retry: "next-trigger",
                    reason: "post-run",
                    err: &detail,
                });
                self.cursor.get(conversation)?.unwrap_or(before.next_floor)
            }
        };

        Ok(TriggerOutcome::Ran(RunReport {
            mode: mode.as_str().to_string(),
            cursor_before: before.next_floor,
            cursor_after,
            catch_up: report,
        }))
    }

    pub fn reconcile(&self, conversation: &str, force: bool) -> Result<ReconcileOutcome> {
        let len = self.log.len(conversation)?;
        let outcome = self
            .reconciler()
            .reconcile(conversation, len, ReconcileOptions { force })?;
        audit::record(
            &self.paths,
            conversation,
            "reconcile",
            "ok",
            &format!(
                "force={force} {}",
                outcome.summary()
            ),
        );
        Ok(outcome)
    }

    /// Treat the whole current log as covered so only future floors are
    /// summarized, or with `rewind` move the cursor back to 0.
    /// Returns `(previous, next_floor)`.
    pub fn reset(&self, conversation: &str, rewind: bool) -> Result<(Floor, Floor)> {
        let previous = self.cursor.get(conversation)?.unwrap_or(0);
        let next_floor = if rewind {
            0
        } else {
            self.log.len(conversation)?
        };
        self.cursor.set(conversation, next_floor)?;
        audit::record(
            &self.paths,
            conversation,
            "reset",
            "ok",
            &format!("previous={previous} next_floor={next_floor}"),
        );
        Ok((previous, next_floor))
    }

    pub fn status(&self, conversation: &str) -> Result<ConversationStatus> {
        let length = self.log.len(conversation)?;
        let next_floor = self.cursor.get(conversation)?.unwrap_or(0);
        let limit = safe_limit(length, self.settings.keep_count);
        let running_pid = active_run(&self.paths, conversation)?.map(|payload| payload.pid);
        Ok(ConversationStatus {
            conversation: conversation.to_string(),
            length,
            next_floor,
            safe_limit: limit,
            distance: distance_since_cursor(length, next_floor).unwrap_or(0),
            interval: self.settings.interval,
            keep_count: self.settings.keep_count,
            next_batch: next_batch(next_floor, self.settings.interval, limit),
            bound_book: self.artifacts.bound_book(conversation)?,
            running: self.registry.is_running(conversation) || running_pid.is_some(),
            running_pid,
            last_event: audit::recent_events(&self.paths, conversation, 1)?.pop(),
        })
    }
}
