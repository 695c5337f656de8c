use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of one message in a conversation log, 0-based.
pub type Floor = u64;

/// 1-based number shown to people for an internal floor.
pub fn display_floor(floor: Floor) -> u64 {
    floor.saturating_add(1)
}

/// Highest floor a batch may reach, keeping the last `keep_count` floors
/// out of every summary. `None` when the log is too short to summarize at all.
pub fn safe_limit(current_len: u64, keep_count: u64) -> Option<Floor> {
    current_len.checked_sub(keep_count)?.checked_sub(1)
}

/// Inclusive floor range condensed by one summarization call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub start: Floor,
    pub end: Floor,
}

impl Batch {
    pub fn new(start: Floor, end: Floor) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Cursor value once this batch is durably summarized.
    pub fn next_floor(&self) -> Floor {
        self.end + 1
    }

    /// Marker embedded in artifact descriptions so progress can be recovered.
    pub fn marker(&self) -> String {
        format!("#{}-{}", self.start, self.end)
    }

    pub fn display_range(&self) -> String {
        format!(
            "{}-{}",
            display_floor(self.start),
            display_floor(self.end)
        )
    }
}

impl fmt::Display for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}-{}]", self.start, self.end)
    }
}
