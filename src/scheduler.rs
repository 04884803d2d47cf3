//! Cron-based scheduling of the weekly rollover batch.
//!
//! A polling loop checks the schedule once a minute, with two complications a
//! long-running host machine brings:
//! - Sleep/wake detection via time-jump polling: a gap larger than a few
//!   minutes between polls means the machine slept through the tick.
//! - Missed-run handling: a rollover missed while asleep still runs if the
//!   scheduled time falls within the last 24 hours. The rollover itself is
//!   idempotent and catches up multiple weeks, so the grace period is about
//!   promptness, not correctness.

use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::ScheduleEntry;

/// Grace period for a rollover missed during sleep (24 hours) — catches
/// Monday morning sleep/wake gaps.
const MISSED_RUN_GRACE_PERIOD_SECS: i64 = 86400;

/// Time jump threshold to detect sleep/wake (5 minutes).
const TIME_JUMP_THRESHOLD_SECS: i64 = 300;

/// Poll interval for the scheduler loop (1 minute).
const POLL_INTERVAL_SECS: u64 = 60;

/// Why a rollover run was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloverTrigger {
    Scheduled,
    Missed,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerMessage {
    pub trigger: RolloverTrigger,
}

pub struct Scheduler {
    entry: ScheduleEntry,
    sender: mpsc::Sender<SchedulerMessage>,
    last_run: Mutex<Option<DateTime<Utc>>>,
}

impl Scheduler {
    pub fn new(entry: ScheduleEntry, sender: mpsc::Sender<SchedulerMessage>) -> Self {
        Self {
            entry,
            sender,
            last_run: Mutex::new(None),
        }
    }

    /// Run the scheduler loop indefinitely, checking for a due rollover every
    /// minute and for missed ones after a detected wake.
    pub async fn run(&self) {
        if !self.entry.enabled {
            log::info!("Scheduler disabled by configuration");
            return;
        }

        let mut last_check = Utc::now();
        loop {
            tokio::time::sleep(Duration::from_secs(POLL_INTERVAL_SECS)).await;
            let now = Utc::now();

            let time_jump = (now - last_check).num_seconds();
            if time_jump > TIME_JUMP_THRESHOLD_SECS {
                log::info!(
                    "Detected system wake (time jumped {time_jump} seconds), checking for a missed rollover"
                );
                match self.find_missed_run(now) {
                    Ok(Some(missed)) => {
                        log::info!("Found missed rollover scheduled at {missed}, running now");
                        self.trigger(RolloverTrigger::Missed, now).await;
                    }
                    Ok(None) => {}
                    Err(e) => log::warn!("Missed-run check failed: {e}"),
                }
            }

            match self.should_run_now(now) {
                Ok(true) => self.trigger(RolloverTrigger::Scheduled, now).await,
                Ok(false) => {}
                Err(e) => log::warn!("Schedule check failed: {e}"),
            }

            last_check = now;
        }
    }

    fn timezone(&self) -> Result<Tz, String> {
        self.entry
            .timezone
            .parse()
            .map_err(|_| format!("Invalid timezone: {}", self.entry.timezone))
    }

    /// True when a scheduled tick falls within the current poll window and
    /// has not already been run.
    fn should_run_now(&self, now: DateTime<Utc>) -> Result<bool, String> {
        let schedule = parse_cron(&self.entry.cron)?;
        let now_local = now.with_timezone(&self.timezone()?);

        // Look back two minutes so a tick is not lost between polls.
        let mut upcoming = schedule.after(&(now_local - chrono::Duration::minutes(2)));
        if let Some(next_time) = upcoming.next() {
            let next_utc = next_time.with_timezone(&Utc);
            if (now - next_utc).num_seconds().abs() < 120 {
                if let Some(last) = *self.last_run.lock() {
                    if (last - next_utc).num_seconds().abs() < 60 {
                        return Ok(false); // Already ran this tick
                    }
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Find a scheduled time inside the grace window that never ran.
    fn find_missed_run(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, String> {
        let schedule = parse_cron(&self.entry.cron)?;
        let now_local = now.with_timezone(&self.timezone()?);
        let grace_start = now_local - chrono::Duration::seconds(MISSED_RUN_GRACE_PERIOD_SECS);
        let last_run = *self.last_run.lock();

        for scheduled in schedule.after(&grace_start) {
            let scheduled_utc = scheduled.with_timezone(&Utc);
            if scheduled_utc > now {
                break;
            }
            if let Some(last) = last_run {
                if last >= scheduled_utc {
                    continue;
                }
            }
            return Ok(Some(scheduled_utc));
        }
        Ok(None)
    }

    async fn trigger(&self, trigger: RolloverTrigger, at: DateTime<Utc>) {
        *self.last_run.lock() = Some(at);
        if self.sender.send(SchedulerMessage { trigger }).await.is_err() {
            log::error!("Failed to send scheduler message ({trigger:?}): channel closed");
        }
    }
}

/// Parse a 5-field cron expression. The cron crate expects 6 fields (with
/// seconds), so "0" is prepended for the seconds field.
pub fn parse_cron(expr: &str) -> Result<Schedule, String> {
    format!("0 {expr}")
        .parse::<Schedule>()
        .map_err(|e| format!("Invalid cron expression '{expr}': {e}"))
}

/// The next time the schedule fires, in UTC.
pub fn next_run_time(entry: &ScheduleEntry) -> Result<DateTime<Utc>, String> {
    let schedule = parse_cron(&entry.cron)?;
    let tz: Tz = entry
        .timezone
        .parse()
        .map_err(|_| format!("Invalid timezone: {}", entry.timezone))?;
    let next = schedule
        .upcoming(tz)
        .next()
        .ok_or_else(|| "No upcoming scheduled time".to_string())?;
    Ok(next.with_timezone(&Utc))
}
