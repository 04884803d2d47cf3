//! Point scoring for archival week summaries.

use crate::types::{GoalKind, WeekInstance, WeekStats};

/// Points awarded for a completed monthly consistency instance.
const MONTHLY_POINTS: u32 = 5;
/// Points awarded for a completed deadline instance.
const DEADLINE_POINTS: u32 = 5;
/// Points awarded for a completed weekly consistency instance.
const WEEKLY_POINTS: u32 = 3;

/// Sum type-weighted points over completed instances.
pub fn score(goals: &[WeekInstance]) -> u32 {
    goals
        .iter()
        .filter(|g| g.completed)
        .map(|g| match g.kind() {
            GoalKind::MonthlyConsistency => MONTHLY_POINTS,
            GoalKind::Deadline => DEADLINE_POINTS,
            GoalKind::WeeklyConsistency => WEEKLY_POINTS,
        })
        .sum()
}

/// Full stats block for a week's instance set.
pub fn week_stats(goals: &[WeekInstance]) -> WeekStats {
    WeekStats {
        total_goals: goals.len() as u32,
        completed_goals: goals.iter().filter(|g| g.completed).count() as u32,
        skipped_goals: goals.iter().filter(|g| g.skipped).count() as u32,
        score: score(goals),
    }
}
