//! Weekly goal rollover engine.
//!
//! Tracks per-user goal state across ISO calendar weeks: each rollover
//! archives the finished week, regenerates the new week's goal instances from
//! the durable definitions, and decrements duration counters. The whole pass
//! is idempotent — deterministic instance ids, append-only archives, and
//! version-checked writes make re-runs and multi-week catch-ups safe.

pub mod config;
pub mod consistency;
pub mod error;
pub mod instance;
pub mod process;
pub mod rollover;
pub mod scheduler;
pub mod score;
pub mod sqlite_store;
pub mod store;
pub mod types;
pub mod week;
