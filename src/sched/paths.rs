use anyhow::Result;
use sha2::{Digest, Sha256};
use std::env;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct SchedPaths {
    pub home: PathBuf,
    pub conversations_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub state_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub home_is_explicit: bool,
}

impl SchedPaths {
    pub fn rooted_at(home: &Path) -> Self {
        Self {
            home: home.to_path_buf(),
            conversations_dir: home.join("conversations"),
            artifacts_dir: home.join("artifacts"),
            state_dir: home.join("state"),
            logs_dir: home.join("logs"),
            home_is_explicit: true,
        }
    }

    pub fn cursors_dir(&self) -> PathBuf {
        self.state_dir.join("cursors")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.logs_dir.join("runs")
    }

    pub fn audit_log(&self) -> PathBuf {
        self.logs_dir.join("audit.log")
    }

    pub fn run_lock_path(&self, conversation: &str) -> PathBuf {
        self.runs_dir()
            .join(format!("{}.lock", conversation_file_stem(conversation)))
    }

    pub fn abort_marker_path(&self, conversation: &str) -> PathBuf {
        self.runs_dir()
            .join(format!("{}.abort", conversation_file_stem(conversation)))
    }
}

/// Map a conversation id onto a file stem that is safe on every platform.
///
/// Ids that are already safe map to themselves. Any id the sanitizer had to
/// rewrite gets a digest suffix, so `a/b` and `a_b` never share files.
pub fn conversation_file_stem(conversation: &str) -> String {
    let mut out = String::with_capacity(conversation.len());
    for ch in conversation.chars() {
        if ch.is_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    let trimmed = out.trim_matches('.');
    if !trimmed.is_empty() && trimmed == conversation {
        return trimmed.to_string();
    }

    let digest = format!("{:x}", Sha256::digest(conversation.as_bytes()));
    let base = if trimmed.is_empty() {
        "conversation"
    } else {
        trimmed
    };
    format!("{base}-{}", &digest[..8])
}

fn required_home_dir() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        return Ok(home);
    }
    Err(anyhow::anyhow!("HOME directory could not be resolved"))
}

fn env_or_default_path(var: &str, fallback: PathBuf) -> PathBuf {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => fallback,
    }
}

fn home_from_inputs(user_home: PathBuf, home_env: Option<&str>) -> (PathBuf, bool) {
    match home_env {
        Some(v) if !v.trim().is_empty() => (PathBuf::from(v.trim()), true),
        _ => (user_home.join(".floorsum"), false),
    }
}

pub fn resolve_paths() -> Result<SchedPaths> {
    let user_home = required_home_dir()?;
    let home_env = env::var("FLOORSUM_HOME").ok();
    let (home, is_explicit) = home_from_inputs(user_home, home_env.as_deref());

    Ok(SchedPaths {
        conversations_dir: env_or_default_path(
            "FLOORSUM_CONVERSATIONS_DIR",
            home.join("conversations"),
        ),
        artifacts_dir: env_or_default_path("FLOORSUM_ARTIFACTS_DIR", home.join("artifacts")),
        state_dir: env_or_default_path("FLOORSUM_STATE_DIR", home.join("state")),
        logs_dir: env_or_default_path("FLOORSUM_LOGS_DIR", home.join("logs")),
        home,
        home_is_explicit: is_explicit,
    })
}
