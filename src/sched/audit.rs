use crate::sched::paths::SchedPaths;
use crate::sched::util::now_epoch_secs;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;

const MAX_AUDIT_LOG_SIZE: u64 = 10 * 1024 * 1024; // 10MB

/// One line of `<logs>/audit.log`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub at_epoch_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<String>,
    pub phase: String,
    pub status: String,
    pub message: String,
}

pub fn append_event(
    paths: &SchedPaths,
    conversation: Option<&str>,
    phase: &str,
    status: &str,
    message: &str,
) -> Result<()> {
    fs::create_dir_all(&paths.logs_dir)
        .with_context(|| format!("failed to create {}", paths.logs_dir.display()))?;
    let event = AuditEvent {
        at_epoch_secs: now_epoch_secs()?,
        conversation: conversation.map(str::to_string),
        phase: phase.to_string(),
        status: status.to_string(),
        message: message.to_string(),
    };

    let line = format!("{}\n", serde_json::to_string(&event)?);
    let path = paths.audit_log();
    let _ = maybe_rotate_log(&path);

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

/// Audit writes from inside a run must never abort the run itself.
pub fn record(paths: &SchedPaths, conversation: &str, phase: &str, status: &str, message: &str) {
    if let Err(err) = append_event(paths, Some(conversation), phase, status, message) {
        eprintln!("floorsum audit write failed: {err:#}");
    }
}

/// Last `limit` events recorded for `conversation` in the live log, oldest first.
/// Unparseable lines are skipped.
pub fn recent_events(
    paths: &SchedPaths,
    conversation: &str,
    limit: usize,
) -> Result<Vec<AuditEvent>> {
    let path = paths.audit_log();
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    let matching: Vec<AuditEvent> = raw
        .lines()
        .filter_map(|line| serde_json::from_str::<AuditEvent>(line).ok())
        .filter(|event| event.conversation.as_deref() == Some(conversation))
        .collect();
    let skip = matching.len().saturating_sub(limit);
    Ok(matching.into_iter().skip(skip).collect())
}

fn maybe_rotate_log(path: &Path) -> Result<()> {
    if let Ok(meta) = fs::metadata(path)
        && meta.len() >= MAX_AUDIT_LOG_SIZE
    {
        let backup = format!("{}.1", path.display());
        let _ = fs::rename(path, backup);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{append_event, recent_events};
    use crate::sched::paths::SchedPaths;
    use serde_json::Value;
    use std::fs;

    #[test]
    fn appends_one_json_line_per_event() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let paths = SchedPaths::rooted_at(tmp.path());
        append_event(&paths, Some("c1"), "trigger", "ok", "first").expect("append");
        append_event(&paths, None, "batch", "degraded", "second").expect("append");

        let raw = fs::read_to_string(paths.audit_log()).expect("read audit");
        let lines: Vec<Value> = raw
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["conversation"], "c1");
        assert_eq!(lines[1]["phase"], "batch");
        assert_eq!(lines[1]["status"], "degraded");
        assert!(lines[1].get("conversation").is_none());
    }

    #[test]
    fn recent_events_are_scoped_to_one_conversation() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let paths = SchedPaths::rooted_at(tmp.path());
        assert!(recent_events(&paths, "c1", 5).expect("empty").is_empty());

        for (conversation, phase) in [("c1", "plan"), ("c2", "plan"), ("c1", "batch"), ("c1", "catch-up")] {
            append_event(&paths, Some(conversation), phase, "ok", "").expect("append");
        }
        fs::write(
            paths.audit_log(),
            fs::read_to_string(paths.audit_log()).expect("read") + "not json\n",
        )
        .expect("append junk");

        let events = recent_events(&paths, "c1", 2).expect("events");
        let phases: Vec<&str> = events.iter().map(|e| e.phase.as_str()).collect();
        assert_eq!(phases, vec!["batch", "catch-up"]);
        assert_eq!(recent_events(&paths, "c2", 5).expect("events").len(), 1);
    }
}
