use crate::error::FloorsumError;
use crate::sched::artifacts::{ArtifactEntry, ArtifactStore};
use crate::sched::cancel::CancelToken;
use crate::sched::cursor::CursorStore;
use crate::sched::floor::{Batch, Floor};
use crate::sched::invoker::{BatchRequest, RetryPolicy, Summarizer, invoke_with_policy};
use crate::sched::transcript::{MessageLog, render_batch_text};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    Cancelled,
    Failed { batch: Batch, reason: String },
    /// The persisted cursor moved under the run to a point the plan cannot
    /// continue from; the next trigger replans.
    Drifted { expected: Floor, found: Floor },
}

impl StopReason {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed { .. } => "failed",
            Self::Drifted { .. } => "drifted",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct BatchProgress {
    pub index: usize,
    pub total: usize,
    pub batch: Batch,
    pub next_floor: Floor,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatchUpReport {
    pub planned: Vec<Batch>,
    pub completed: Vec<Batch>,
    pub skipped: Vec<Batch>,
    pub stop: StopReason,
}

/// Executes a plan one batch at a time; the cursor only ever moves to the
/// end of a batch whose summary has been stored.
pub struct CatchUpProcessor<'a> {
    pub log: &'a dyn MessageLog,
    pub cursor: &'a dyn CursorStore,
    pub artifacts: &'a dyn ArtifactStore,
    pub summarizer: &'a dyn Summarizer,
    pub policy: RetryPolicy,
}

fn storage(err: anyhow::Error) -> String {
    FloorsumError::storage(err).to_string()
}

enum Step {
    Done,
    Skip,
    Stop(StopReason),
}

impl CatchUpProcessor<'_> {
    pub fn run(
        &self,
        conversation: &str,
        plan: &[Batch],
        cancel: &CancelToken,
        on_progress: &mut dyn FnMut(&BatchProgress),
    ) -> CatchUpReport {
        let mut report = CatchUpReport {
            planned: plan.to_vec(),
            completed: Vec::new(),
            skipped: Vec::new(),
            stop: StopReason::Completed,
        };

        for (index, batch) in plan.iter().copied().enumerate() {
            if cancel.is_cancelled() {
                report.stop = StopReason::Cancelled;
                break;
            }
            match self.run_batch(conversation, batch, cancel) {
                Step::Done => {
                    report.completed.push(batch);
                    on_progress(&BatchProgress {
                        index,
                        total: plan.len(),
                        batch,
                        next_floor: batch.next_floor(),
                    });
                }
                Step::Skip => report.skipped.push(batch),
                Step::Stop(reason) => {
                    report.stop = reason;
                    break;
                }
            }
        }
        report
    }

    fn run_batch(&self, conversation: &str, batch: Batch, cancel: &CancelToken) -> Step {
        let failed = |reason: String| Step::Stop(StopReason::Failed { batch, reason });

        let persisted = match self.cursor.get(conversation) {
            Ok(value) => value.unwrap_or(0),
            Err(err) => return failed(storage(err.context("cursor read failed"))),
        };
        if persisted >= batch.next_floor() {
            return Step::Skip;
        }
        if persisted != batch.start {
            return Step::Stop(StopReason::Drifted {
                expected: batch.start,
                found: persisted,
            });
        }

        let entries = match self.log.entries(conversation, batch) {
            Ok(entries) => entries,
            Err(err) => return failed(storage(err.context("message log read failed"))),
        };
        let text = render_batch_text(&entries);
        if text.trim().is_empty() {
            return failed("batch has no message text".to_string());
        }

        let request = BatchRequest {
            conversation: conversation.to_string(),
            batch,
            text,
        };
        let summary = match invoke_with_policy(self.summarizer, &request, cancel, self.policy) {
            Ok(summary) => summary,
            Err(FloorsumError::Cancelled) => return Step::Stop(StopReason::Cancelled),
            Err(err) => return failed(err.to_string()),
        };

        // Artifact first: a crash before the cursor write is healed by reconcile.
        let entry = ArtifactEntry::for_batch(conversation, batch, &summary);
        if let Err(err) = self.artifacts.upsert(conversation, entry) {
            return failed(storage(err.context("artifact write failed")));
        }
        if let Err(err) = self.cursor.set(conversation, batch.next_floor()) {
            return failed(storage(err.context("cursor write failed")));
        }
        Step::Done
    }
}
