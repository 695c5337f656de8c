//! Recovers summarization progress from the artifact store and reconciles it
//! with the local cursor.
//!
//! Artifact descriptions are free text; the only structure relied on is a
//! `#<floor>` or `#<start>-<end>` marker somewhere in each description.

use crate::sched::artifacts::{ArtifactEntry, ArtifactStore, resolve_entries};
use crate::sched::cursor::{CursorStore, load_checked};
use crate::sched::floor::Floor;
use anyhow::Result;
use regex::Regex;
use std::sync::OnceLock;

static FLOOR_MARKER: OnceLock<Option<Regex>> = OnceLock::new();

fn floor_marker() -> Option<&'static Regex> {
    FLOOR_MARKER
        .get_or_init(|| Regex::new(r"#\s*(\d+)(?:\s*[-–—~～]\s*(\d+))?").ok())
        .as_ref()
}

/// Highest floor named by any marker in `text`.
pub fn max_floor_in_text(text: &str) -> Option<Floor> {
    let mut max: Option<Floor> = None;
    for caps in floor_marker()?.captures_iter(text) {
        for group in [caps.get(1), caps.get(2)].into_iter().flatten() {
            // Digit runs too long for u64 are not floor numbers.
            let Ok(value) = group.as_str().parse::<Floor>() else {
                continue;
            };
            max = Some(max.map_or(value, |current| current.max(value)));
        }
    }
    max
}

/// Highest floor covered across every entry's description.
pub fn max_floor_in_entries(entries: &[ArtifactEntry]) -> Option<Floor> {
    entries
        .iter()
        .filter_map(|entry| max_floor_in_text(&entry.comment))
        .max()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileOptions {
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileSource {
    SyncDisabled,
    Unbound,
    External { book: String, max_floor: Floor },
    NoMarkers { book: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub previous: Floor,
    pub next_floor: Floor,
    pub source: ReconcileSource,
}

impl ReconcileOutcome {
    pub fn changed(&self) -> bool {
        self.previous != self.next_floor
    }

    pub fn summary(&self) -> String {
        let source = match &self.source {
            ReconcileSource::SyncDisabled => "sync-disabled".to_string(),
            ReconcileSource::Unbound => "unbound".to_string(),
            ReconcileSource::External { book, max_floor } => {
                format!("book={book} max_floor={max_floor}")
            }
            ReconcileSource::NoMarkers { book } => format!("book={book} no-markers"),
        };
        format!(
            "previous={} next_floor={} changed={} source={}",
            self.previous,
            self.next_floor,
            self.changed(),
            source
        )
    }
}

pub struct Reconciler<'a> {
    pub cursor: &'a dyn CursorStore,
    pub artifacts: &'a dyn ArtifactStore,
    pub sync_enabled: bool,
    pub auto_bind: bool,
}

impl Reconciler<'_> {
    /// Bring the cursor in line with external progress.
    ///
    /// Non-forced runs only ever move the cursor forward. Forced runs adopt
    /// whatever the store says, and reset to 0 when it says nothing.
    pub fn reconcile(
        &self,
        conversation: &str,
        current_len: u64,
        opts: ReconcileOptions,
    ) -> Result<ReconcileOutcome> {
        let local = load_checked(self.cursor, conversation, current_len)?;

        if !self.sync_enabled && !opts.force {
            return Ok(ReconcileOutcome {
                previous: local,
                next_floor: local,
                source: ReconcileSource::SyncDisabled,
            });
        }

        let Some((book, entries)) = resolve_entries(self.artifacts, conversation, self.auto_bind)?
        else {
            let next_floor = if opts.force {
                self.persist(conversation, local, 0)?
            } else {
                local
            };
            return Ok(ReconcileOutcome {
                previous: local,
                next_floor,
                source: ReconcileSource::Unbound,
            });
        };

        let Some(max_floor) = max_floor_in_entries(&entries) else {
            let next_floor = if opts.force {
                self.persist(conversation, local, 0)?
            } else {
                local
            };
            return Ok(ReconcileOutcome {
                previous: local,
                next_floor,
                source: ReconcileSource::NoMarkers { book },
            });
        };

        // A store ahead of a truncated log must not push the cursor out of range.
        let candidate = max_floor.saturating_add(1).min(current_len);
        let next_floor = if opts.force || candidate > local {
            self.persist(conversation, local, candidate)?
        } else {
            local
        };
        Ok(ReconcileOutcome {
            previous: local,
            next_floor,
            source: ReconcileSource::External { book, max_floor },
        })
    }

    fn persist(&self, conversation: &str, local: Floor, value: Floor) -> Result<Floor> {
        if value != local {
            self.cursor.set(conversation, value)?;
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::artifacts::memory::MemoryArtifactStore;
    use crate::sched::cursor::memory::MemoryCursorStore;

    #[test]
    fn marker_golden_table() {
        let cases: &[(&str, Option<Floor>)] = &[
            ("楼层 #0-4", Some(4)),
            ("楼层 #5-9", Some(9)),
            ("#12", Some(12)),
            ("Summary floors #30-39", Some(39)),
            ("floors # 7 - 11", Some(11)),
            ("#3–8 en dash", Some(8)),
            ("#3—8 em dash", Some(8)),
            ("#20~29 tilde", Some(29)),
            ("#20～29 full-width tilde", Some(29)),
            ("recap #40-44 and #45-49", Some(49)),
            ("reversed #50-41", Some(50)),
            ("tagged #1-2 then #100", Some(100)),
            ("#007-010", Some(10)),
            ("no marker here", None),
            ("floors 10-20", None),
            ("#", None),
            ("#-5", None),
            ("", None),
            ("#99999999999999999999999", None),
            ("#4-99999999999999999999999", Some(4)),
        ];
        for (input, want) in cases {
            assert_eq!(max_floor_in_text(input), *want, "input={input:?}");
        }
    }

    fn reconciler<'a>(
        cursor: &'a MemoryCursorStore,
        artifacts: &'a MemoryArtifactStore,
    ) -> Reconciler<'a> {
        Reconciler {
            cursor,
            artifacts,
            sync_enabled: true,
            auto_bind: true,
        }
    }

    #[test]
    fn external_progress_advances_lagging_cursor() {
        let cursor = MemoryCursorStore::with("c1", 0);
        let artifacts = MemoryArtifactStore::with_comments("c1", &["楼层 #0-4", "楼层 #5-9"]);
        let out = reconciler(&cursor, &artifacts)
            .reconcile("c1", 50, ReconcileOptions::default())
            .expect("reconcile");
        assert_eq!(out.next_floor, 10);
        assert_eq!(cursor.get("c1").expect("get"), Some(10));
    }

    #[test]
    fn non_forced_reconcile_never_regresses() {
        let cursor = MemoryCursorStore::with("c1", 20);
        let artifacts = MemoryArtifactStore::with_comments("c1", &["楼层 #0-4", "楼层 #5-9"]);
        let out = reconciler(&cursor, &artifacts)
            .reconcile("c1", 50, ReconcileOptions::default())
            .expect("reconcile");
        assert_eq!(out.next_floor, 20);
        assert!(!out.changed());
        assert!(cursor.writes().is_empty());
    }

    #[test]
    fn forced_reconcile_adopts_external_value() {
        let cursor = MemoryCursorStore::with("c1", 20);
        let artifacts = MemoryArtifactStore::with_comments("c1", &["楼层 #0-4", "楼层 #5-9"]);
        let out = reconciler(&cursor, &artifacts)
            .reconcile("c1", 50, ReconcileOptions { force: true })
            .expect("reconcile");
        assert_eq!(out.next_floor, 10);
        assert_eq!(cursor.get("c1").expect("get"), Some(10));
    }

    #[test]
    fn forced_reconcile_with_unbound_store_resets_to_zero() {
        let cursor = MemoryCursorStore::with("c1", 20);
        let artifacts = MemoryArtifactStore::default();
        let out = reconciler(&cursor, &artifacts)
            .reconcile("c1", 50, ReconcileOptions { force: true })
            .expect("reconcile");
        assert_eq!(out.next_floor, 0);
        assert_eq!(out.source, ReconcileSource::Unbound);
        assert_eq!(cursor.get("c1").expect("get"), Some(0));
    }

    #[test]
    fn forced_reconcile_without_markers_resets_to_zero() {
        let cursor = MemoryCursorStore::with("c1", 20);
        let artifacts = MemoryArtifactStore::with_comments("c1", &["character notes"]);
        let out = reconciler(&cursor, &artifacts)
            .reconcile("c1", 50, ReconcileOptions { force: true })
            .expect("reconcile");
        assert_eq!(out.next_floor, 0);
    }

    #[test]
    fn unforced_without_markers_keeps_local() {
        let cursor = MemoryCursorStore::with("c1", 20);
        let artifacts = MemoryArtifactStore::with_comments("c1", &["character notes"]);
        let out = reconciler(&cursor, &artifacts)
            .reconcile("c1", 50, ReconcileOptions::default())
            .expect("reconcile");
        assert_eq!(out.next_floor, 20);
        assert!(matches!(out.source, ReconcileSource::NoMarkers { .. }));
    }

    #[test]
    fn sync_disabled_returns_local_unless_forced() {
        let cursor = MemoryCursorStore::with("c1", 3);
        let artifacts = MemoryArtifactStore::with_comments("c1", &["#0-9"]);
        let mut rec = reconciler(&cursor, &artifacts);
        rec.sync_enabled = false;
        let out = rec
            .reconcile("c1", 50, ReconcileOptions::default())
            .expect("reconcile");
        assert_eq!(out.next_floor, 3);
        assert_eq!(out.source, ReconcileSource::SyncDisabled);

        let out = rec
            .reconcile("c1", 50, ReconcileOptions { force: true })
            .expect("reconcile");
        assert_eq!(out.next_floor, 10);
    }

    #[test]
    fn out_of_range_local_cursor_is_reset_before_reconciling() {
        let cursor = MemoryCursorStore::with("c1", 90);
        let artifacts = MemoryArtifactStore::with_comments("c1", &["#0-4"]);
        let out = reconciler(&cursor, &artifacts)
            .reconcile("c1", 50, ReconcileOptions::default())
            .expect("reconcile");
        assert_eq!(out.previous, 0);
        assert_eq!(out.next_floor, 5);
    }

    #[test]
    fn external_progress_is_capped_at_log_length() {
        let cursor = MemoryCursorStore::with("c1", 0);
        let artifacts = MemoryArtifactStore::with_comments("c1", &["#0-99"]);
        let out = reconciler(&cursor, &artifacts)
            .reconcile("c1", 30, ReconcileOptions::default())
            .expect("reconcile");
        assert_eq!(out.next_floor, 30);
    }
}
