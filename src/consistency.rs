//! Consistency-aware read of the dreams aggregate.
//!
//! The backing store is only eventually consistent: a deadline goal the user
//! completed minutes before rollover may still read as incomplete from a
//! replica. Rolling over from that stale view would regenerate an instance
//! for a finished goal. Mitigation: when the vacated week contains completed
//! deadline instances, wait before the first read, then re-read with
//! exponential backoff until the aggregate reflects every one of those
//! completions or the retry budget runs out. The last read wins either way —
//! this is a mitigation, not a guarantee.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::store::{Store, StoreError, Versioned};
use crate::types::{DreamsDocument, GoalKind, WeekInstance};

fn default_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    800
}

fn default_factor() -> u32 {
    2
}

/// Upper bound on a single settle wait (1 minute). Backoff values come from
/// user configuration, so the exponential curve is clamped rather than
/// trusted.
const MAX_SETTLE_DELAY_MS: u64 = 60_000;

/// Backoff knobs for settled reads. Defaults: 3 retries, 800 ms initial
/// delay, doubling each attempt.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySettings {
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_factor")]
    pub factor: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            base_delay_ms: default_base_delay_ms(),
            factor: default_factor(),
        }
    }
}

impl RetrySettings {
    fn delay(&self, attempt: u32) -> Duration {
        let scale = u64::from(self.factor)
            .checked_pow(attempt)
            .unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(scale);
        Duration::from_millis(ms.min(MAX_SETTLE_DELAY_MS))
    }
}

/// Read the dreams aggregate, waiting out replication lag when the vacated
/// week finished with completed deadline instances.
///
/// A completion is settled once the authoritative record (embedded goal,
/// falling back to the template) reads completed and inactive. Instances
/// whose source no longer exists in the aggregate are ignored rather than
/// waited on.
pub async fn read_settled(
    store: &dyn Store,
    user_id: &str,
    vacated_goals: &[WeekInstance],
    settings: &RetrySettings,
) -> Result<Option<Versioned<DreamsDocument>>, StoreError> {
    let pending: Vec<&str> = vacated_goals
        .iter()
        .filter(|g| g.completed && g.kind() == GoalKind::Deadline)
        .map(|g| g.source_id.as_str())
        .collect();

    if pending.is_empty() {
        return store.get_dreams(user_id).await;
    }

    log::info!(
        "User {user_id}: {} completed deadline goal(s) in vacated week; reading with settle delay",
        pending.len()
    );
    tokio::time::sleep(settings.delay(0)).await;

    let mut read = store.get_dreams(user_id).await?;
    for attempt in 0..settings.retries {
        match &read {
            Some(versioned) if !all_settled(&versioned.doc, &pending) => {
                log::info!(
                    "User {user_id}: dreams aggregate not yet settled, retry {} of {}",
                    attempt + 1,
                    settings.retries
                );
                tokio::time::sleep(settings.delay(attempt + 1)).await;
                read = store.get_dreams(user_id).await?;
            }
            _ => return Ok(read),
        }
    }

    if let Some(versioned) = &read {
        if !all_settled(&versioned.doc, &pending) {
            log::warn!(
                "User {user_id}: dreams aggregate still unsettled after {} retries; proceeding with last read",
                settings.retries
            );
        }
    }
    Ok(read)
}

fn all_settled(doc: &DreamsDocument, pending: &[&str]) -> bool {
    let mut records: HashMap<&str, (bool, bool)> = HashMap::new();
    for template in &doc.templates {
        records.insert(template.id.as_str(), (template.completed, template.active));
    }
    // Embedded goals are authoritative and override same-id templates.
    for dream in &doc.dreams {
        for goal in &dream.goals {
            records.insert(goal.id.as_str(), (goal.completed, goal.active));
        }
    }

    pending.iter().all(|id| match records.get(id) {
        Some(&(completed, active)) => completed && !active,
        None => true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{Dream, DreamGoal, GoalType};
    use chrono::Utc;

    fn deadline_instance(source_id: &str, completed: bool) -> WeekInstance {
        WeekInstance {
            id: format!("{source_id}_2025-W10"),
            source_id: source_id.to_string(),
            dream_id: Some("d1".to_string()),
            title: "ship".to_string(),
            goal_type: GoalType::Deadline,
            recurrence: None,
            week_id: "2025-W10".to_string(),
            weeks_remaining: 2,
            frequency: 1,
            completed,
            completion_count: 0,
            completion_dates: Vec::new(),
            skipped: false,
            created_at: Utc::now(),
        }
    }

    /// Aggregate where goal `id` already reads completed and inactive.
    fn settled_doc(user_id: &str, id: &str) -> DreamsDocument {
        let mut goal = DreamGoal::new_deadline("ship", "2025-12-31");
        goal.id = id.to_string();
        goal.completed = true;
        goal.active = false;
        let mut doc = DreamsDocument::empty(user_id);
        doc.dreams.push(Dream {
            id: "d1".to_string(),
            title: "dream".to_string(),
            completed: false,
            goals: vec![goal],
        });
        doc
    }

    #[tokio::test]
    async fn reads_once_when_no_completed_deadlines() {
        let store = MemoryStore::new();
        store
            .put_dreams("u1", &DreamsDocument::empty("u1"), None)
            .await
            .unwrap();

        let instance = deadline_instance("g1", false);
        let settings = RetrySettings {
            retries: 3,
            base_delay_ms: 1,
            factor: 2,
        };
        let read = read_settled(&store, "u1", &[instance], &settings)
            .await
            .unwrap();
        assert!(read.is_some());
        assert_eq!(store.dreams_reads("u1"), 1);
    }

    #[tokio::test]
    async fn retries_until_the_aggregate_settles() {
        let store = MemoryStore::new();
        let live = settled_doc("u1", "g1");
        store.put_dreams("u1", &live, None).await.unwrap();

        let mut stale = live.clone();
        stale.dreams[0].goals[0].completed = false;
        stale.dreams[0].goals[0].active = true;
        store.inject_stale_dreams("u1", &stale, 1, 2);

        let settings = RetrySettings {
            retries: 3,
            base_delay_ms: 1,
            factor: 2,
        };
        let read = read_settled(&store, "u1", &[deadline_instance("g1", true)], &settings)
            .await
            .unwrap()
            .unwrap();
        assert!(read.doc.dreams[0].goals[0].completed);
        // Two stale reads, then the live one.
        assert_eq!(store.dreams_reads("u1"), 3);
    }

    #[tokio::test]
    async fn returns_last_read_when_budget_runs_out() {
        let store = MemoryStore::new();
        let mut never_settles = settled_doc("u1", "g1");
        never_settles.dreams[0].goals[0].completed = false;
        never_settles.dreams[0].goals[0].active = true;
        store.put_dreams("u1", &never_settles, None).await.unwrap();

        let settings = RetrySettings {
            retries: 2,
            base_delay_ms: 1,
            factor: 2,
        };
        let read = read_settled(&store, "u1", &[deadline_instance("g1", true)], &settings)
            .await
            .unwrap()
            .unwrap();
        assert!(!read.doc.dreams[0].goals[0].completed);
        // Initial read plus two retries.
        assert_eq!(store.dreams_reads("u1"), 3);
    }

    #[tokio::test]
    async fn missing_source_does_not_block_settling() {
        let store = MemoryStore::new();
        store
            .put_dreams("u1", &DreamsDocument::empty("u1"), None)
            .await
            .unwrap();

        let settings = RetrySettings {
            retries: 3,
            base_delay_ms: 1,
            factor: 2,
        };
        let read = read_settled(&store, "u1", &[deadline_instance("gone", true)], &settings)
            .await
            .unwrap();
        assert!(read.is_some());
        // First read already settles: the source is gone from the aggregate.
        assert_eq!(store.dreams_reads("u1"), 1);
    }

    #[test]
    fn defaults_match_documented_backoff() {
        let settings: RetrySettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.retries, 3);
        assert_eq!(settings.base_delay_ms, 800);
        assert_eq!(settings.factor, 2);
        assert_eq!(settings.delay(0), Duration::from_millis(800));
        assert_eq!(settings.delay(2), Duration::from_millis(3200));
    }

    #[test]
    fn extreme_backoff_settings_clamp_instead_of_overflowing() {
        let settings = RetrySettings {
            retries: 200,
            base_delay_ms: u64::MAX,
            factor: u32::MAX,
        };
        assert_eq!(settings.delay(64), Duration::from_millis(60_000));
        assert_eq!(settings.delay(200), Duration::from_millis(60_000));
    }
}
