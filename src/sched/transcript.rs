use crate::sched::floor::{Batch, Floor};
use crate::sched::paths::{SchedPaths, conversation_file_stem};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub floor: Floor,
    pub is_user: bool,
    pub text: String,
}

/// Append-only conversation log, read-only from the scheduler's side.
pub trait MessageLog: Send + Sync {
    fn len(&self, conversation: &str) -> Result<u64>;
    fn entries(&self, conversation: &str, batch: Batch) -> Result<Vec<LogEntry>>;
}

#[derive(Debug, Deserialize)]
struct RawLine {
    #[serde(default)]
    is_user: Option<bool>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    mes: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

impl RawLine {
    fn into_entry(self, floor: Floor) -> Option<LogEntry> {
        let text = self.mes.or(self.text)?;
        let is_user = self
            .is_user
            .or_else(|| self.role.map(|r| r.eq_ignore_ascii_case("user")))
            .unwrap_or(false);
        Some(LogEntry {
            floor,
            is_user,
            text,
        })
    }
}

/// JSONL transcripts under the conversations directory, one message per line.
///
/// Lines without a `mes`/`text` field (chat headers, metadata) are not floors.
#[derive(Debug, Clone)]
pub struct JsonlMessageLog {
    dir: PathBuf,
}

impl JsonlMessageLog {
    pub fn new(paths: &SchedPaths) -> Self {
        Self {
            dir: paths.conversations_dir.clone(),
        }
    }

    pub fn transcript_path(&self, conversation: &str) -> PathBuf {
        self.dir
            .join(format!("{}.jsonl", conversation_file_stem(conversation)))
    }

    fn scan<F>(&self, conversation: &str, mut visit: F) -> Result<u64>
    where
        F: FnMut(LogEntry) -> bool,
    {
        let path = self.transcript_path(conversation);
        if !path.exists() {
            return Ok(0);
        }
        let file =
            fs::File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;

        let mut floor: Floor = 0;
        for line in BufReader::new(file).lines() {
            let line = line.with_context(|| format!("failed to read {}", path.display()))?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let Ok(raw) = serde_json::from_str::<RawLine>(trimmed) else {
                continue;
            };
            let Some(entry) = raw.into_entry(floor) else {
                continue;
            };
            floor += 1;
            if !visit(entry) {
                break;
            }
        }
        Ok(floor)
    }
}

impl MessageLog for JsonlMessageLog {
    fn len(&self, conversation: &str) -> Result<u64> {
        self.scan(conversation, |_| true)
    }

    fn entries(&self, conversation: &str, batch: Batch) -> Result<Vec<LogEntry>> {
        let mut out = Vec::new();
        self.scan(conversation, |entry| {
            if entry.floor > batch.end {
                return false;
            }
            if entry.floor >= batch.start {
                out.push(entry);
            }
            true
        })?;
        Ok(out)
    }
}

/// Plain-text rendering of a batch handed to the summarizer.
pub fn render_batch_text(entries: &[LogEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        let speaker = if entry.is_user { "user" } else { "assistant" };
        out.push_str(&format!("[#{}] {}: {}\n", entry.floor, speaker, entry.text.trim()));
    }
    out
}
