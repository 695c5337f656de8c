use crate::sched::paths::SchedPaths;
use crate::sched::util::now_epoch_secs;
use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLockPayload {
    pub pid: u32,
    #[serde(default)]
    pub started_at_epoch_secs: u64,
    #[serde(default)]
    pub build_id: String,
    #[serde(default)]
    pub conversation: String,
    /// Unique per run; an abort marker carrying it targets exactly this run.
    #[serde(default)]
    pub run_id: String,
}

/// Exclusive per-conversation lock held for the lifetime of one run.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    payload: RunLockPayload,
}

impl RunLock {
    /// `Ok(None)` when another process already runs this conversation.
    pub fn try_acquire(paths: &SchedPaths, conversation: &str) -> Result<Option<Self>> {
        let path = paths.run_lock_path(conversation);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("failed to open run lock {}", path.display()))?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(None),
            Err(err) if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                return Ok(None);
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to lock run file {}", path.display()));
            }
        }

        let pid = std::process::id();
        let payload = RunLockPayload {
            pid,
            started_at_epoch_secs: now_epoch_secs()?,
            build_id: env!("FLOORSUM_BUILD_ID").to_string(),
            conversation: conversation.to_string(),
            run_id: format!("{pid}-{}", chrono::Utc::now().format("%Y%m%dT%H%M%S%.9f")),
        };
        file.set_len(0)
            .with_context(|| format!("failed to truncate run lock {}", path.display()))?;
        writeln!(&mut file, "{}", serde_json::to_string(&payload)?)
            .with_context(|| format!("failed to write run lock {}", path.display()))?;

        Ok(Some(Self { file, payload }))
    }

    pub fn run_id(&self) -> &str {
        &self.payload.run_id
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = FileExt::unlock(&self.file);
    }
}

pub fn parse_run_lock_payload(raw: &str) -> Option<RunLockPayload> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str::<RunLockPayload>(trimmed).ok()
}

/// Payload of a run currently holding the lock, if any.
pub fn active_run(paths: &SchedPaths, conversation: &str) -> Result<Option<RunLockPayload>> {
    let path = paths.run_lock_path(conversation);
    if !path.exists() {
        return Ok(None);
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .with_context(|| format!("failed to open run lock {}", path.display()))?;
    if file.try_lock_exclusive().is_ok() {
        // Nobody holds it; leftover content is from a finished or crashed run.
        let _ = FileExt::unlock(&file);
        return Ok(None);
    }
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read run lock {}", path.display()))?;
    Ok(parse_run_lock_payload(&raw))
}
