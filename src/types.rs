//! Persisted document shapes for the rollover engine.
//!
//! All documents serialize camelCase to match the JSON the client apps read
//! and write. `GoalTemplate` and `DreamGoal` are the durable goal definitions;
//! `WeekInstance` is the ephemeral per-week materialization the rollover
//! regenerates; `CurrentWeekDocument` and `PastWeeksDocument` are the per-user
//! aggregates the orchestrator replaces and appends to.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::week::months_to_weeks;

fn default_frequency() -> u32 {
    1
}

/// How a consistency goal's completion window repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recurrence {
    Weekly,
    Monthly,
}

/// Stored goal discriminator. Consistency goals are tracked by repeated
/// completions within a period; deadline goals stay active until completed
/// or their week-count window lapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GoalType {
    Consistency,
    Deadline,
}

/// Tagged union the instance builder dispatches on, derived from the stored
/// `type`/`recurrence` field pair so every downstream match is exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoalKind {
    WeeklyConsistency,
    MonthlyConsistency,
    Deadline,
}

fn kind_of(goal_type: GoalType, recurrence: Option<Recurrence>) -> GoalKind {
    match (goal_type, recurrence) {
        (GoalType::Deadline, _) => GoalKind::Deadline,
        (GoalType::Consistency, Some(Recurrence::Monthly)) => GoalKind::MonthlyConsistency,
        (GoalType::Consistency, _) => GoalKind::WeeklyConsistency,
    }
}

/// A persisted recurring-goal definition, independent of any single week.
///
/// Created on user action, mutated by every rollover. `weeks_remaining` is the
/// unified duration counter: monthly durations are normalized to
/// week-equivalents once, at creation, and the counter may reach −1, meaning
/// exhausted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalTemplate {
    pub id: String,
    pub dream_id: String,
    pub title: String,
    #[serde(rename = "type", default = "GoalTemplate::default_type")]
    pub goal_type: GoalType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<Recurrence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_weeks: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_months: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_date: Option<String>,
    pub weeks_remaining: i32,
    /// Completions required per period (week or month).
    #[serde(default = "default_frequency")]
    pub frequency: u32,
    pub active: bool,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl GoalTemplate {
    fn default_type() -> GoalType {
        GoalType::Consistency
    }

    pub fn kind(&self) -> GoalKind {
        kind_of(self.goal_type, self.recurrence)
    }

    /// New weekly consistency template. Duration is already week-granular.
    pub fn new_weekly(dream_id: &str, title: &str, target_weeks: i32, frequency: u32) -> Self {
        Self::new_consistency(dream_id, title, Recurrence::Weekly, target_weeks, frequency)
    }

    /// New monthly consistency template. The month count is normalized to its
    /// week-equivalent here so rollover never re-normalizes.
    pub fn new_monthly(dream_id: &str, title: &str, target_months: u32, frequency: u32) -> Self {
        let mut template = Self::new_consistency(
            dream_id,
            title,
            Recurrence::Monthly,
            months_to_weeks(target_months),
            frequency,
        );
        template.target_months = Some(target_months);
        template
    }

    fn new_consistency(
        dream_id: &str,
        title: &str,
        recurrence: Recurrence,
        weeks: i32,
        frequency: u32,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            dream_id: dream_id.to_string(),
            title: title.to_string(),
            goal_type: GoalType::Consistency,
            recurrence: Some(recurrence),
            target_weeks: matches!(recurrence, Recurrence::Weekly).then_some(weeks),
            target_months: None,
            target_date: None,
            weeks_remaining: weeks,
            frequency,
            active: true,
            completed: false,
            completed_at: None,
            created_at: Some(Utc::now()),
        }
    }
}

/// A goal definition embedded on its owning dream. Same counter semantics as
/// a template; for deadline goals this embedded record is the authoritative
/// completion state that guards stale template snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DreamGoal {
    pub id: String,
    pub title: String,
    #[serde(rename = "type", default = "GoalTemplate::default_type")]
    pub goal_type: GoalType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<Recurrence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_weeks: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_months: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_date: Option<String>,
    #[serde(default)]
    pub weeks_remaining: i32,
    #[serde(default = "default_frequency")]
    pub frequency: u32,
    pub active: bool,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl DreamGoal {
    pub fn kind(&self) -> GoalKind {
        kind_of(self.goal_type, self.recurrence)
    }

    /// New deadline goal targeting a `YYYY-MM-DD` date. The week counter is
    /// recomputed from the date at every rollover.
    pub fn new_deadline(title: &str, target_date: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
            goal_type: GoalType::Deadline,
            recurrence: None,
            target_weeks: None,
            target_months: None,
            target_date: Some(target_date.to_string()),
            weeks_remaining: 0,
            frequency: 1,
            active: true,
            completed: false,
            completed_at: None,
        }
    }
}

/// A dream with its embedded goal definitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dream {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub goals: Vec<DreamGoal>,
}

/// Per-user aggregate holding dreams (with embedded goals) and recurring
/// templates. Read whole, mutated, written back whole under a version check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DreamsDocument {
    pub user_id: String,
    #[serde(default)]
    pub dreams: Vec<Dream>,
    #[serde(default)]
    pub templates: Vec<GoalTemplate>,
}

impl DreamsDocument {
    pub fn empty(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            dreams: Vec::new(),
            templates: Vec::new(),
        }
    }
}

/// A concrete per-week materialization of a template or embedded goal.
///
/// Ephemeral — regenerated each week. The id is deterministic
/// (`"{sourceId}_{weekId}"`), which is the load-bearing idempotency mechanism:
/// re-running a rollover regenerates the same ids instead of duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeekInstance {
    pub id: String,
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dream_id: Option<String>,
    pub title: String,
    #[serde(rename = "type", default = "GoalTemplate::default_type")]
    pub goal_type: GoalType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<Recurrence>,
    pub week_id: String,
    /// Counter snapshot at generation time.
    pub weeks_remaining: i32,
    #[serde(default = "default_frequency")]
    pub frequency: u32,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub completion_count: u32,
    #[serde(default)]
    pub completion_dates: Vec<DateTime<Utc>>,
    #[serde(default)]
    pub skipped: bool,
    pub created_at: DateTime<Utc>,
}

impl WeekInstance {
    pub fn kind(&self) -> GoalKind {
        kind_of(self.goal_type, self.recurrence)
    }
}

/// Aggregate counters for one week of instances.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeekStats {
    pub total_goals: u32,
    pub completed_goals: u32,
    pub skipped_goals: u32,
    pub score: u32,
}

/// The single active week document per user, replaced wholesale each rollover.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentWeekDocument {
    pub user_id: String,
    pub week_id: String,
    pub week_start_date: chrono::NaiveDate,
    pub week_end_date: chrono::NaiveDate,
    #[serde(default)]
    pub goals: Vec<WeekInstance>,
    #[serde(default)]
    pub stats: WeekStats,
}

/// Archived summary of a finished (or fully missed) week.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeekSummary {
    #[serde(flatten)]
    pub stats: WeekStats,
    pub week_start_date: chrono::NaiveDate,
    pub week_end_date: chrono::NaiveDate,
    pub archived_at: DateTime<Utc>,
}

/// Per-user archive, append-only per week key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PastWeeksDocument {
    pub user_id: String,
    #[serde(default)]
    pub week_history: BTreeMap<String, WeekSummary>,
    #[serde(default)]
    pub total_weeks_tracked: u32,
}

impl PastWeeksDocument {
    pub fn empty(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            week_history: BTreeMap::new(),
            total_weeks_tracked: 0,
        }
    }
}

/// Minimal user record; the batch driver only needs the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Result of a single-user rollover that did not hard-fail.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloverOutcome {
    pub rolled: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_week: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_week: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goals_count: Option<usize>,
}

impl RolloverOutcome {
    pub fn skipped(message: &str) -> Self {
        Self {
            rolled: false,
            message: message.to_string(),
            from_week: None,
            to_week: None,
            goals_count: None,
        }
    }
}

/// Per-user detail row in a batch summary.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRolloverResult {
    pub user_id: String,
    pub success: bool,
    pub rolled: bool,
    pub message: String,
}

/// Aggregate result of a batch run across all known users.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub total: u32,
    pub rolled: u32,
    pub skipped: u32,
    pub failed: u32,
    pub results: Vec<UserRolloverResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_derivation_is_exhaustive_over_stored_fields() {
        assert_eq!(kind_of(GoalType::Deadline, None), GoalKind::Deadline);
        assert_eq!(
            kind_of(GoalType::Deadline, Some(Recurrence::Monthly)),
            GoalKind::Deadline
        );
        assert_eq!(
            kind_of(GoalType::Consistency, Some(Recurrence::Weekly)),
            GoalKind::WeeklyConsistency
        );
        assert_eq!(
            kind_of(GoalType::Consistency, Some(Recurrence::Monthly)),
            GoalKind::MonthlyConsistency
        );
        assert_eq!(
            kind_of(GoalType::Consistency, None),
            GoalKind::WeeklyConsistency
        );
    }

    #[test]
    fn monthly_template_normalizes_duration_at_creation() {
        let template = GoalTemplate::new_monthly("dream-1", "Read two books", 3, 2);
        assert_eq!(template.weeks_remaining, 13);
        assert_eq!(template.target_months, Some(3));
        assert_eq!(template.kind(), GoalKind::MonthlyConsistency);
        assert!(template.active);
    }

    #[test]
    fn weekly_template_keeps_week_granularity() {
        let template = GoalTemplate::new_weekly("dream-1", "Run", 8, 3);
        assert_eq!(template.weeks_remaining, 8);
        assert_eq!(template.target_weeks, Some(8));
        assert_eq!(template.kind(), GoalKind::WeeklyConsistency);
    }

    #[test]
    fn documents_round_trip_as_camel_case() {
        let goal = DreamGoal::new_deadline("Ship v1", "2025-12-31");
        let json = serde_json::to_value(&goal).unwrap();
        assert_eq!(json["type"], "deadline");
        assert_eq!(json["targetDate"], "2025-12-31");
        assert_eq!(json["weeksRemaining"], 0);

        let parsed: DreamGoal = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.kind(), GoalKind::Deadline);
    }

    #[test]
    fn missing_optional_fields_use_defaults() {
        let raw = r#"{
            "id": "g1",
            "title": "Meditate",
            "type": "consistency",
            "recurrence": "weekly",
            "active": true
        }"#;
        let goal: DreamGoal = serde_json::from_str(raw).unwrap();
        assert_eq!(goal.frequency, 1);
        assert_eq!(goal.weeks_remaining, 0);
        assert!(!goal.completed);
    }
}
