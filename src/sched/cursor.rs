use crate::sched::floor::Floor;
use crate::sched::paths::{SchedPaths, conversation_file_stem};
use crate::sched::util::now_epoch_secs;
use crate::sched::warn::{self, WarnEvent};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const LEGACY_CURSOR_FILE: &str = "cursor.json";

/// Durable "next floor to summarize" per conversation.
///
/// `get` returning `None` means the conversation was never summarized.
pub trait CursorStore: Send + Sync {
    fn get(&self, conversation: &str) -> Result<Option<Floor>>;
    fn set(&self, conversation: &str, next_floor: Floor) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorRecord {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub conversation_id: String,
    pub next_floor: Floor,
    #[serde(default)]
    pub updated_at_epoch_secs: u64,
}

fn default_schema_version() -> u32 {
    1
}

/// Unscoped record written by older releases before cursors were per conversation.
#[derive(Debug, Clone, Deserialize)]
struct LegacyCursor {
    #[serde(alias = "last_summarized_floor", alias = "nextFloor")]
    next_floor: Floor,
}

#[derive(Debug)]
pub struct FileCursorStore {
    cursors_dir: PathBuf,
    legacy_file: PathBuf,
    migration: Mutex<()>,
}

impl FileCursorStore {
    pub fn new(paths: &SchedPaths) -> Self {
        Self {
            cursors_dir: paths.cursors_dir(),
            legacy_file: paths.state_dir.join(LEGACY_CURSOR_FILE),
            migration: Mutex::new(()),
        }
    }

    pub fn record_path(&self, conversation: &str) -> PathBuf {
        self.cursors_dir
            .join(format!("{}.json", conversation_file_stem(conversation)))
    }

    fn read_record(&self, conversation: &str) -> Result<Option<CursorRecord>> {
        let file = self.record_path(conversation);
        if !file.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&file)
            .with_context(|| format!("failed to read {}", file.display()))?;

        match serde_json::from_str::<CursorRecord>(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                let timestamp = now_epoch_secs().unwrap_or(0);
                let backup_path = file.with_extension(format!("json.corrupt.{timestamp}"));
                let _ = fs::rename(&file, &backup_path);
                warn::emit(WarnEvent {
                    code: "CURSOR_CORRUPT",
                    stage: "cursor",
                    action: "load-cursor",
                    conversation,
                    range: None,
                    retry: "started-fresh",
                    reason: "json-parse-failed",
                    err: &format!("{err:#}"),
                });
                Ok(None)
            }
        }
    }

    /// Copy the legacy unscoped cursor into `conversation` exactly once.
    fn migrate_legacy(&self, conversation: &str) -> Result<Option<Floor>> {
        let _guard = self
            .migration
            .lock()
            .map_err(|_| anyhow::anyhow!("cursor migration lock poisoned"))?;
        if !self.legacy_file.exists() {
            return Ok(None);
        }

        let raw = fs::read_to_string(&self.legacy_file)
            .with_context(|| format!("failed to read {}", self.legacy_file.display()))?;
        let legacy: Option<LegacyCursor> = serde_json::from_str(&raw).ok();

        // Renaming first claims the record; a concurrent process loses the race cleanly.
        let migrated = self.legacy_file.with_extension("json.migrated");
        match fs::rename(&self.legacy_file, &migrated) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to retire {}", self.legacy_file.display())
                });
            }
        }

        let Some(legacy) = legacy else {
            return Ok(None);
        };
        self.set(conversation, legacy.next_floor)?;
        Ok(Some(legacy.next_floor))
    }
}

impl CursorStore for FileCursorStore {
    fn get(&self, conversation: &str) -> Result<Option<Floor>> {
        if let Some(record) = self.read_record(conversation)? {
            if record.conversation_id != conversation {
                anyhow::bail!(
                    "cursor file {} belongs to conversation {:?}, not {:?}",
                    self.record_path(conversation).display(),
                    record.conversation_id,
                    conversation
                );
            }
            return Ok(Some(record.next_floor));
        }
        self.migrate_legacy(conversation)
    }

    fn set(&self, conversation: &str, next_floor: Floor) -> Result<()> {
        let record = CursorRecord {
            schema_version: default_schema_version(),
            conversation_id: conversation.to_string(),
            next_floor,
            updated_at_epoch_secs: now_epoch_secs()?,
        };
        let data = serde_json::to_string_pretty(&record)?;
        write_atomically(&self.record_path(conversation), &format!("{data}\n"))
    }
}

/// Replace `path` with `contents` so readers never observe a torn write.
pub fn write_atomically(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to stage write in {}", parent.display()))?;
    tmp.write_all(contents.as_bytes())
        .with_context(|| format!("failed to stage {}", path.display()))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Read the cursor and enforce `0 <= next_floor <= current_len`.
///
/// An out-of-range value (the log was truncated) is reset to 0 and persisted.
pub fn load_checked(
    store: &dyn CursorStore,
    conversation: &str,
    current_len: u64,
) -> Result<Floor> {
    let Some(next_floor) = store.get(conversation)? else {
        return Ok(0);
    };
    if next_floor <= current_len {
        return Ok(next_floor);
    }

    warn::emit(WarnEvent {
        code: "CURSOR_INVALID",
        stage: "cursor",
        action: "clamp-cursor",
        conversation,
        range: None,
        retry: "self-healed",
        reason: "cursor-beyond-log-length",
        err: &format!("next_floor={next_floor} length={current_len}"),
    });
    store.set(conversation, 0)?;
    Ok(0)
}

#[cfg(test)]
pub mod memory {
    use super::CursorStore;
    use crate::sched::floor::Floor;
    use anyhow::Result;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory store that also records every write, for ordering assertions.
    #[derive(Debug, Default)]
    pub struct MemoryCursorStore {
        values: Mutex<HashMap<String, Floor>>,
        pub writes: Mutex<Vec<(String, Floor)>>,
    }

    impl MemoryCursorStore {
        pub fn with(conversation: &str, next_floor: Floor) -> Self {
            let store = Self::default();
            store
                .values
                .lock()
                .expect("lock")
                .insert(conversation.to_string(), next_floor);
            store
        }

        pub fn writes(&self) -> Vec<(String, Floor)> {
            self.writes.lock().expect("lock").clone()
        }
    }

    impl CursorStore for MemoryCursorStore {
        fn get(&self, conversation: &str) -> Result<Option<Floor>> {
            Ok(self.values.lock().expect("lock").get(conversation).copied())
        }

        fn set(&self, conversation: &str, next_floor: Floor) -> Result<()> {
            self.values
                .lock()
                .expect("lock")
                .insert(conversation.to_string(), next_floor);
            self.writes
                .lock()
                .expect("lock")
                .push((conversation.to_string(), next_floor));
            Ok(())
        }
    }
}
