//! Template/goal state processing around a rollover.
//!
//! `filter_active` decides which definitions still generate instances this
//! week; `apply_updates` merges the builder's counters back into the dreams
//! aggregate and stamps the exhaustion transition. The aggregate write itself
//! is the orchestrator's job (it owns the store handle and the best-effort
//! semantics).

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::instance::InstanceSource;
use crate::types::{Dream, DreamsDocument, GoalKind};

/// A counter to persist for one template/goal, whether or not an instance was
/// emitted for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterUpdate {
    pub source_id: String,
    pub weeks_remaining: i32,
}

/// Output of eligibility filtering.
///
/// `sources` go to the instance builder. `exhausted` are consistency
/// definitions whose counter already ran out: they generate no instance, but
/// their final decrement still must be persisted so the exhaustion transition
/// (inactive + completion timestamp) fires exactly once. The decrement itself
/// is the caller's job — it is subject to the skip-hold rule, which needs the
/// prior week's instance that this filter never sees.
#[derive(Debug, Default)]
pub struct FilterResult<'a> {
    pub sources: Vec<InstanceSource<'a>>,
    pub exhausted: Vec<InstanceSource<'a>>,
}

/// Select the templates and embedded goals that participate in this rollover.
///
/// A template is excluded when it is inactive, completed, its dream is
/// completed, or — for deadline-typed templates — the authoritative embedded
/// goal (matched by id) is completed or inactive; that last rule guards
/// against a stale template snapshot regenerating a goal the user already
/// finished. Embedded goals not mirrored by a template participate directly.
pub fn filter_active(doc: &DreamsDocument) -> FilterResult<'_> {
    let dreams_by_id: HashMap<&str, &Dream> =
        doc.dreams.iter().map(|d| (d.id.as_str(), d)).collect();
    let mut result = FilterResult::default();
    let mut template_ids: HashSet<&str> = HashSet::new();

    for template in &doc.templates {
        template_ids.insert(template.id.as_str());

        if !template.active || template.completed {
            continue;
        }

        let dream = dreams_by_id.get(template.dream_id.as_str());
        match dream {
            Some(dream) if dream.completed => continue,
            Some(_) => {}
            None => {
                log::warn!(
                    "Template {} references missing dream {}; processing from template fields",
                    template.id,
                    template.dream_id
                );
            }
        }

        match template.kind() {
            GoalKind::Deadline => {
                // The embedded goal is ground truth for deadline completion.
                let embedded = dream.and_then(|d| d.goals.iter().find(|g| g.id == template.id));
                match embedded {
                    Some(goal) if goal.completed || !goal.active => continue,
                    Some(_) => {}
                    None => {
                        log::warn!(
                            "Deadline template {} has no embedded goal on dream {}",
                            template.id,
                            template.dream_id
                        );
                    }
                }
                result.sources.push(InstanceSource::from_template(template));
            }
            GoalKind::WeeklyConsistency | GoalKind::MonthlyConsistency => {
                if template.weeks_remaining <= 0 {
                    result.exhausted.push(InstanceSource::from_template(template));
                    continue;
                }
                result.sources.push(InstanceSource::from_template(template));
            }
        }
    }

    for dream in &doc.dreams {
        if dream.completed {
            continue;
        }
        for goal in &dream.goals {
            if template_ids.contains(goal.id.as_str()) {
                continue;
            }
            if !goal.active || goal.completed {
                continue;
            }
            match goal.kind() {
                GoalKind::Deadline => {
                    result
                        .sources
                        .push(InstanceSource::from_dream_goal(&dream.id, goal));
                }
                GoalKind::WeeklyConsistency | GoalKind::MonthlyConsistency => {
                    if goal.weeks_remaining <= 0 {
                        result
                            .exhausted
                            .push(InstanceSource::from_dream_goal(&dream.id, goal));
                        continue;
                    }
                    result
                        .sources
                        .push(InstanceSource::from_dream_goal(&dream.id, goal));
                }
            }
        }
    }

    result
}

/// Merge updated counters into the aggregate, preserving unrelated fields.
///
/// A record is flipped inactive and stamped with a completion timestamp
/// exactly when its counter transitions negative; replays with an
/// already-negative counter leave the original stamp untouched.
pub fn apply_updates(
    doc: &mut DreamsDocument,
    updates: &[CounterUpdate],
    now: DateTime<Utc>,
) -> u32 {
    let by_id: HashMap<&str, i32> = updates
        .iter()
        .map(|u| (u.source_id.as_str(), u.weeks_remaining))
        .collect();
    let mut touched = 0;

    for template in &mut doc.templates {
        if let Some(&weeks) = by_id.get(template.id.as_str()) {
            let exhausting = weeks < 0 && template.weeks_remaining >= 0;
            template.weeks_remaining = weeks;
            if exhausting {
                template.active = false;
                template.completed_at = Some(now);
            }
            touched += 1;
        }
    }

    for dream in &mut doc.dreams {
        for goal in &mut dream.goals {
            if let Some(&weeks) = by_id.get(goal.id.as_str()) {
                let exhausting = weeks < 0 && goal.weeks_remaining >= 0;
                goal.weeks_remaining = weeks;
                if exhausting {
                    goal.active = false;
                    goal.completed_at = Some(now);
                }
                touched += 1;
            }
        }
    }

    touched
}
