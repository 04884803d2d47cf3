//! Rollover service binary.
//!
//! Default mode runs the cron scheduler and executes the all-users rollover
//! batch on every tick. `--once` runs a single batch and exits, for cron-less
//! hosts and manual catch-ups; `--simulate` forces each user one week forward
//! regardless of the calendar.

use std::sync::Arc;

use tokio::sync::mpsc;

use momentum::config::EngineConfig;
use momentum::rollover::RolloverEngine;
use momentum::scheduler::{next_run_time, Scheduler, SchedulerMessage};
use momentum::sqlite_store::SqliteStore;
use momentum::store::Store;

/// Channel buffer size for scheduler messages.
const SCHEDULER_CHANNEL_SIZE: usize = 32;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let once = args.iter().any(|a| a == "--once");
    let simulate = args.iter().any(|a| a == "--simulate");

    let config = match EngineConfig::load() {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    };

    let store = match &config.store_path {
        Some(path) => SqliteStore::open_at(path.clone()),
        None => SqliteStore::open(),
    };
    let store: Arc<dyn Store> = match store {
        Ok(store) => Arc::new(store),
        Err(e) => {
            log::error!("Failed to open store: {e}");
            std::process::exit(1);
        }
    };

    let engine = RolloverEngine::new(store, config.consistency.clone());

    if once || simulate {
        run_batch(&engine, simulate).await;
        return;
    }

    match next_run_time(&config.schedule) {
        Ok(next) => log::info!("Scheduler starting; next rollover at {next}"),
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    }

    let (sender, mut receiver) = mpsc::channel::<SchedulerMessage>(SCHEDULER_CHANNEL_SIZE);
    let scheduler = Scheduler::new(config.schedule.clone(), sender);
    tokio::spawn(async move { scheduler.run().await });

    while let Some(message) = receiver.recv().await {
        log::info!("Rollover triggered ({:?})", message.trigger);
        run_batch(&engine, false).await;
    }
}

async fn run_batch(engine: &RolloverEngine, simulate: bool) {
    match engine.rollover_all_users(simulate).await {
        Ok(summary) => {
            if summary.failed > 0 {
                log::warn!(
                    "Batch completed with failures: {} rolled, {} skipped, {} failed",
                    summary.rolled,
                    summary.skipped,
                    summary.failed
                );
            }
        }
        Err(e) => log::error!("Rollover batch aborted: {e}"),
    }
}
