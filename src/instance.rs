//! Goal instance builder — converts a template or embedded goal definition
//! plus its prior week's instance into this week's instance.
//!
//! Counter rules per goal kind:
//! - weekly consistency: decrement weeksRemaining (floor −1) unless the prior
//!   instance was skipped; completions reset every week.
//! - monthly consistency: same decrement; completions carry forward only while
//!   the new week's Monday stays in the same calendar month as the prior
//!   instance's.
//! - deadline: weeksRemaining recomputed from the target date when one is set,
//!   otherwise decremented like the others. An instance is emitted only for a
//!   live goal (`active`, not completed, counter ≥ 0), but the updated counter
//!   is always returned so callers persist state for exhausted goals too.
//!
//! Instance ids are deterministic (`"{sourceId}_{weekId}"`); re-running a
//! build produces the same id, which is what makes rollover re-entry safe.

use chrono::Utc;

use crate::types::{DreamGoal, GoalKind, GoalTemplate, GoalType, Recurrence, WeekInstance};
use crate::week::{month_id, weeks_until_date, WeekIdError};

/// Normalized view over a template or dream-embedded goal, so the builder has
/// a single exhaustive dispatch point.
#[derive(Debug, Clone)]
pub struct InstanceSource<'a> {
    pub id: &'a str,
    pub dream_id: Option<&'a str>,
    pub title: &'a str,
    pub kind: GoalKind,
    pub goal_type: GoalType,
    pub recurrence: Option<Recurrence>,
    pub frequency: u32,
    pub weeks_remaining: i32,
    pub active: bool,
    pub completed: bool,
    pub target_date: Option<&'a str>,
}

impl<'a> InstanceSource<'a> {
    pub fn from_template(template: &'a GoalTemplate) -> Self {
        Self {
            id: &template.id,
            dream_id: Some(&template.dream_id),
            title: &template.title,
            kind: template.kind(),
            goal_type: template.goal_type,
            recurrence: template.recurrence,
            frequency: template.frequency,
            weeks_remaining: template.weeks_remaining,
            active: template.active,
            completed: template.completed,
            target_date: template.target_date.as_deref(),
        }
    }

    pub fn from_dream_goal(dream_id: &'a str, goal: &'a DreamGoal) -> Self {
        Self {
            id: &goal.id,
            dream_id: Some(dream_id),
            title: &goal.title,
            kind: goal.kind(),
            goal_type: goal.goal_type,
            recurrence: goal.recurrence,
            frequency: goal.frequency,
            weeks_remaining: goal.weeks_remaining,
            active: goal.active,
            completed: goal.completed,
            target_date: goal.target_date.as_deref(),
        }
    }
}

/// Builder output: the week's instance (if one is due) and the updated
/// counter, which callers must persist even when no instance was emitted.
#[derive(Debug)]
pub struct BuildOutcome {
    pub instance: Option<WeekInstance>,
    pub weeks_remaining: i32,
}

/// Build the instance for `week_id`.
///
/// `decrement_weeks_remaining` is true for a real week transition; passing
/// false creates a counter-preserving instance for mid-week catch-up (a
/// template added after week start is materialized without burning a week).
pub fn build_instance(
    source: &InstanceSource<'_>,
    prev: Option<&WeekInstance>,
    week_id: &str,
    decrement_weeks_remaining: bool,
) -> Result<BuildOutcome, WeekIdError> {
    let prev_skipped = prev.is_some_and(|p| p.skipped);
    let step = |weeks: i32| -> i32 {
        if !decrement_weeks_remaining || prev_skipped {
            weeks
        } else {
            (weeks - 1).max(-1)
        }
    };

    match source.kind {
        GoalKind::WeeklyConsistency => {
            let weeks_remaining = step(source.weeks_remaining);
            let instance = fresh_instance(source, week_id, weeks_remaining);
            Ok(BuildOutcome {
                instance: Some(instance),
                weeks_remaining,
            })
        }
        GoalKind::MonthlyConsistency => {
            let weeks_remaining = step(source.weeks_remaining);
            let mut instance = fresh_instance(source, week_id, weeks_remaining);

            // Completions accumulate within a calendar month; a month boundary
            // resets them.
            if let Some(prev) = prev {
                if month_id(week_id)? == month_id(&prev.week_id)? {
                    instance.completion_count = prev.completion_count;
                    instance.completion_dates = prev.completion_dates.clone();
                    instance.completed = prev.completed;
                }
            }

            Ok(BuildOutcome {
                instance: Some(instance),
                weeks_remaining,
            })
        }
        GoalKind::Deadline => {
            let weeks_remaining = match source.target_date {
                Some(date) => weeks_until_date(date, week_id)?,
                None => step(source.weeks_remaining),
            };
            let emit = !source.completed && source.active && weeks_remaining >= 0;
            Ok(BuildOutcome {
                instance: emit.then(|| fresh_instance(source, week_id, weeks_remaining)),
                weeks_remaining,
            })
        }
    }
}

fn fresh_instance(source: &InstanceSource<'_>, week_id: &str, weeks_remaining: i32) -> WeekInstance {
    WeekInstance {
        id: format!("{}_{}", source.id, week_id),
        source_id: source.id.to_string(),
        dream_id: source.dream_id.map(str::to_string),
        title: source.title.to_string(),
        goal_type: source.goal_type,
        recurrence: source.recurrence,
        week_id: week_id.to_string(),
        weeks_remaining,
        frequency: source.frequency,
        completed: false,
        completion_count: 0,
        completion_dates: Vec::new(),
        skipped: false,
        created_at: Utc::now(),
    }
}
