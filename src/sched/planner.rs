use crate::sched::floor::{Batch, Floor};

/// Next full-size batch starting at `next_floor`, or `None` while the
/// unreserved backlog is shorter than one interval.
pub fn next_batch(next_floor: Floor, interval: u64, safe_limit: Option<Floor>) -> Option<Batch> {
    if interval == 0 {
        return None;
    }
    let limit = safe_limit?;
    let end = next_floor.checked_add(interval - 1)?;
    if end > limit {
        return None;
    }
    Some(Batch::new(next_floor, end))
}

/// Ordered, gap-free run of full-size batches from `next_floor`, capped at
/// `max_batches`. Whatever is left stays for a later trigger.
pub fn full_plan(
    next_floor: Floor,
    interval: u64,
    safe_limit: Option<Floor>,
    max_batches: usize,
) -> Vec<Batch> {
    let mut plan = Vec::new();
    let mut cursor = next_floor;
    while plan.len() < max_batches {
        let Some(batch) = next_batch(cursor, interval, safe_limit) else {
            break;
        };
        cursor = batch.next_floor();
        plan.push(batch);
    }
    plan
}

/// Floors strictly after the cursor, counted the way the trigger rule does.
pub fn distance_since_cursor(current_len: u64, next_floor: Floor) -> Option<u64> {
    current_len.checked_sub(1)?.checked_sub(next_floor)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanMode {
    Normal,
    CatchUp,
}

impl PlanMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::CatchUp => "catch-up",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanDecision {
    /// Not enough new content since the cursor.
    Wait { distance: u64 },
    Run { mode: PlanMode, batches: Vec<Batch> },
}

/// Decide what one scheduling run should do for the given log state.
pub fn decide(
    current_len: u64,
    next_floor: Floor,
    interval: u64,
    keep_count: u64,
    max_batches: usize,
    force_catch_up: bool,
) -> PlanDecision {
    let distance = distance_since_cursor(current_len, next_floor).unwrap_or(0);
    if interval == 0 || distance < interval {
        return PlanDecision::Wait { distance };
    }

    let limit = crate::sched::floor::safe_limit(current_len, keep_count);
    let catch_up = force_catch_up || distance >= interval.saturating_mul(2);
    let (mode, batches) = if catch_up {
        (
            PlanMode::CatchUp,
            full_plan(next_floor, interval, limit, max_batches),
        )
    } else {
        (
            PlanMode::Normal,
            next_batch(next_floor, interval, limit).into_iter().collect(),
        )
    };

    if batches.is_empty() {
        return PlanDecision::Wait { distance };
    }
    PlanDecision::Run { mode, batches }
}
