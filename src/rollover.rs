//! Rollover orchestration: per-user week transition and the all-users batch.
//!
//! A rollover archives every week between the stored current week and the
//! target week, regenerates the target week's instances from the dreams
//! aggregate, and writes the updated counters back. The whole pass is safe to
//! re-run: archives are append-only per week key, instance ids are
//! deterministic, and counters decrement once per invocation no matter how
//! many weeks were missed.
//!
//! Write discipline: current-week and archive writes are version-checked and
//! fail closed on conflict; the dreams counter write-back is best-effort and
//! only logged on failure, because the next rollover recomputes from whatever
//! state actually persisted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};

use crate::consistency::{read_settled, RetrySettings};
use crate::error::RolloverError;
use crate::instance::build_instance;
use crate::process::{apply_updates, filter_active, CounterUpdate};
use crate::score::week_stats;
use crate::store::Store;
use crate::types::{
    BatchSummary, CurrentWeekDocument, DreamsDocument, PastWeeksDocument, RolloverOutcome,
    UserRolloverResult, WeekInstance, WeekStats, WeekSummary,
};
use crate::week::{current_iso_week, next_week_id, week_range, weeks_between, WeekIdError};

pub struct RolloverEngine {
    store: Arc<dyn Store>,
    retry: RetrySettings,
}

impl RolloverEngine {
    pub fn new(store: Arc<dyn Store>, retry: RetrySettings) -> Self {
        Self { store, retry }
    }

    /// Run the rollover for every known user, isolating failures: one user's
    /// error is logged and counted, never aborting the batch. Only the
    /// initial user listing can fail the whole pass.
    pub async fn rollover_all_users(&self, simulate: bool) -> Result<BatchSummary, RolloverError> {
        self.rollover_all_users_at(simulate, Utc::now().date_naive())
            .await
    }

    pub async fn rollover_all_users_at(
        &self,
        simulate: bool,
        today: NaiveDate,
    ) -> Result<BatchSummary, RolloverError> {
        let user_ids = self.store.list_user_ids().await?;
        let mut summary = BatchSummary::default();

        for user_id in user_ids {
            summary.total += 1;
            match self.rollover_user_at(&user_id, simulate, today).await {
                Ok(outcome) => {
                    if outcome.rolled {
                        summary.rolled += 1;
                    } else {
                        summary.skipped += 1;
                    }
                    summary.results.push(UserRolloverResult {
                        user_id,
                        success: true,
                        rolled: outcome.rolled,
                        message: outcome.message,
                    });
                }
                Err(err) => {
                    if err.is_transient() {
                        log::error!(
                            "Rollover failed for user {user_id}, eligible for the next run: {err}"
                        );
                    } else {
                        log::error!(
                            "Rollover failed for user {user_id} with unrecoverable data: {err}"
                        );
                    }
                    summary.failed += 1;
                    summary.results.push(UserRolloverResult {
                        user_id,
                        success: false,
                        rolled: false,
                        message: err.to_string(),
                    });
                }
            }
        }

        log::info!(
            "Rollover batch finished: {} rolled, {} skipped, {} failed of {}",
            summary.rolled,
            summary.skipped,
            summary.failed,
            summary.total
        );
        Ok(summary)
    }

    pub async fn rollover_user(
        &self,
        user_id: &str,
        simulate: bool,
    ) -> Result<RolloverOutcome, RolloverError> {
        self.rollover_user_at(user_id, simulate, Utc::now().date_naive())
            .await
    }

    /// Roll one user forward to the week containing `today` (or, when
    /// `simulate` is set, to the week after their stored one regardless of
    /// the clock). No-op when the user is already in the target week.
    pub async fn rollover_user_at(
        &self,
        user_id: &str,
        simulate: bool,
        today: NaiveDate,
    ) -> Result<RolloverOutcome, RolloverError> {
        let system_week = current_iso_week(today);

        let Some(current) = self.store.get_current_week(user_id).await? else {
            // Rollover never provisions: a user without a current week has
            // not been onboarded. `initialize_user` is the explicit path.
            return Ok(RolloverOutcome::skipped("no current week document"));
        };

        let target = if simulate {
            next_week_id(&current.doc.week_id)?
        } else {
            system_week
        };
        if current.doc.week_id == target {
            return Ok(RolloverOutcome::skipped("already in the current week"));
        }

        let vacated = weeks_between(&current.doc.week_id, &target)?;
        if vacated.is_empty() {
            log::warn!(
                "User {user_id}: stored week {} is ahead of target {target}; skipping",
                current.doc.week_id
            );
            return Ok(RolloverOutcome::skipped("stored week is ahead of the target"));
        }

        let dreams = read_settled(
            self.store.as_ref(),
            user_id,
            &current.doc.goals,
            &self.retry,
        )
        .await?;
        let (dreams_version, mut dreams_doc) = match dreams {
            Some(v) => (Some(v.version), v.doc),
            None => (None, DreamsDocument::empty(user_id)),
        };

        // Archive before replacing the current week: archive keys are week
        // ids, so a replay after a partial failure re-inserts nothing.
        self.archive_weeks(user_id, &current.doc, &vacated).await?;

        let (goals, updates) = build_week(&dreams_doc, &current.doc.goals, &target, true)?;

        let (week_start_date, week_end_date) = week_range(&target)?;
        let new_doc = CurrentWeekDocument {
            user_id: user_id.to_string(),
            week_id: target.clone(),
            week_start_date,
            week_end_date,
            stats: week_stats(&goals),
            goals,
        };
        self.store
            .put_current_week(user_id, &new_doc, Some(current.version))
            .await?;

        if !updates.is_empty() {
            apply_updates(&mut dreams_doc, &updates, Utc::now());
            if let Err(err) = self
                .store
                .put_dreams(user_id, &dreams_doc, dreams_version)
                .await
            {
                log::warn!("User {user_id}: counter write-back failed, continuing: {err}");
            }
        }

        log::info!(
            "User {user_id}: rolled {} -> {} ({} goals)",
            current.doc.week_id,
            target,
            new_doc.goals.len()
        );
        Ok(RolloverOutcome {
            rolled: true,
            message: format!("rolled {} -> {}", current.doc.week_id, target),
            from_week: Some(current.doc.week_id),
            to_week: Some(target),
            goals_count: Some(new_doc.goals.len()),
        })
    }

    /// Materialize instances for goal definitions added after the current
    /// week started, without consuming a week of their counters. Returns the
    /// number of instances added.
    pub async fn catch_up_user(&self, user_id: &str) -> Result<usize, RolloverError> {
        let Some(current) = self.store.get_current_week(user_id).await? else {
            return Ok(0);
        };
        let Some(dreams) = self.store.get_dreams(user_id).await? else {
            return Ok(0);
        };

        let filtered = filter_active(&dreams.doc);
        let existing: HashSet<&str> = current
            .doc
            .goals
            .iter()
            .map(|g| g.source_id.as_str())
            .collect();

        let mut doc = current.doc.clone();
        let mut added = 0;
        for source in &filtered.sources {
            if existing.contains(source.id) {
                continue;
            }
            let outcome = build_instance(source, None, &doc.week_id, false)?;
            if let Some(instance) = outcome.instance {
                doc.goals.push(instance);
                added += 1;
            }
        }

        if added > 0 {
            doc.stats = week_stats(&doc.goals);
            self.store
                .put_current_week(user_id, &doc, Some(current.version))
                .await?;
            log::info!(
                "User {user_id}: caught up {} goal(s) into week {}",
                added,
                doc.week_id
            );
        }
        Ok(added)
    }

    /// Provision the current-week document for a user who has none,
    /// materializing instances for the week containing `today`. Counters are
    /// not decremented — no prior week was consumed. Fails closed if a
    /// document appeared concurrently.
    pub async fn initialize_user(
        &self,
        user_id: &str,
        today: NaiveDate,
    ) -> Result<RolloverOutcome, RolloverError> {
        let week_id = &current_iso_week(today);
        let dreams = self.store.get_dreams(user_id).await?;
        let (dreams_version, mut dreams_doc) = match dreams {
            Some(v) => (Some(v.version), v.doc),
            None => (None, DreamsDocument::empty(user_id)),
        };

        let (goals, updates) = build_week(&dreams_doc, &[], week_id, false)?;
        let (week_start_date, week_end_date) = week_range(week_id)?;
        let doc = CurrentWeekDocument {
            user_id: user_id.to_string(),
            week_id: week_id.to_string(),
            week_start_date,
            week_end_date,
            stats: week_stats(&goals),
            goals,
        };
        self.store.put_current_week(user_id, &doc, None).await?;

        if !updates.is_empty() {
            apply_updates(&mut dreams_doc, &updates, Utc::now());
            if let Err(err) = self
                .store
                .put_dreams(user_id, &dreams_doc, dreams_version)
                .await
            {
                log::warn!("User {user_id}: counter write-back failed, continuing: {err}");
            }
        }

        log::info!(
            "User {user_id}: initialized week {week_id} ({} goals)",
            doc.goals.len()
        );
        Ok(RolloverOutcome {
            rolled: true,
            message: format!("initialized week {week_id}"),
            from_week: None,
            to_week: Some(week_id.to_string()),
            goals_count: Some(doc.goals.len()),
        })
    }

    async fn archive_weeks(
        &self,
        user_id: &str,
        vacated: &CurrentWeekDocument,
        weeks: &[String],
    ) -> Result<(), RolloverError> {
        let past = self.store.get_past_weeks(user_id).await?;
        let (version, mut doc) = match past {
            Some(v) => (Some(v.version), v.doc),
            None => (None, PastWeeksDocument::empty(user_id)),
        };

        let archived_at = Utc::now();
        let mut added = 0;
        for week_id in weeks {
            // Append-only: a replay keeps the summary written first.
            if doc.week_history.contains_key(week_id) {
                continue;
            }
            let stats = if *week_id == vacated.week_id {
                week_stats(&vacated.goals)
            } else {
                // A fully missed week had no instances to score.
                WeekStats::default()
            };
            let (week_start_date, week_end_date) = week_range(week_id)?;
            doc.week_history.insert(
                week_id.clone(),
                WeekSummary {
                    stats,
                    week_start_date,
                    week_end_date,
                    archived_at,
                },
            );
            added += 1;
        }

        if added > 0 {
            doc.total_weeks_tracked = doc.week_history.len() as u32;
            self.store.put_past_weeks(user_id, &doc, version).await?;
        }
        Ok(())
    }
}

/// Generate the instance set for `week_id` plus the counter updates to
/// persist. Updates cover exhausted definitions and every counter the builder
/// moved; unchanged counters are not rewritten.
fn build_week(
    dreams: &DreamsDocument,
    prev_goals: &[WeekInstance],
    week_id: &str,
    decrement: bool,
) -> Result<(Vec<WeekInstance>, Vec<CounterUpdate>), WeekIdError> {
    let filtered = filter_active(dreams);
    let prev_by_source: HashMap<&str, &WeekInstance> = prev_goals
        .iter()
        .map(|g| (g.source_id.as_str(), g))
        .collect();

    let mut goals = Vec::new();
    let mut updates = Vec::new();

    // Exhausted definitions generate no instance, but their final decrement
    // still obeys the skip-hold rule: a skipped prior week freezes the
    // counter, deferring the exhaustion transition to the next real week.
    for source in &filtered.exhausted {
        let prev_skipped = prev_by_source
            .get(source.id)
            .is_some_and(|prev| prev.skipped);
        if !decrement || prev_skipped {
            continue;
        }
        let weeks_remaining = (source.weeks_remaining - 1).max(-1);
        if weeks_remaining != source.weeks_remaining {
            updates.push(CounterUpdate {
                source_id: source.id.to_string(),
                weeks_remaining,
            });
        }
    }

    let mut seen = HashSet::new();
    for source in &filtered.sources {
        if !seen.insert(source.id) {
            log::warn!("Duplicate goal definition id {}; keeping the first", source.id);
            continue;
        }
        let outcome = build_instance(
            source,
            prev_by_source.get(source.id).copied(),
            week_id,
            decrement,
        )?;
        if outcome.weeks_remaining != source.weeks_remaining {
            updates.push(CounterUpdate {
                source_id: source.id.to_string(),
                weeks_remaining: outcome.weeks_remaining,
            });
        }
        if let Some(instance) = outcome.instance {
            goals.push(instance);
        }
    }
    Ok((goals, updates))
}
