//! Error taxonomy for rollover processing.
//!
//! Classification follows the failure semantics of the engine:
//! - NotFound is not an error: getters return `Ok(None)` and the orchestrator
//!   treats it as a legitimate empty state.
//! - Transient store failures propagate out of the per-user call; the batch
//!   driver logs them, counts the user as failed, and continues.
//! - Data-shape mismatches and best-effort write failures never surface here
//!   at all — they are logged where detected and processing continues.

use thiserror::Error;

use crate::store::StoreError;
use crate::week::WeekIdError;

#[derive(Debug, Error)]
pub enum RolloverError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("week arithmetic error: {0}")]
    Week(#[from] WeekIdError),
}

impl RolloverError {
    /// True when retrying the same rollover later may succeed. Week-id errors
    /// indicate corrupt persisted data and will not heal on their own.
    pub fn is_transient(&self) -> bool {
        match self {
            RolloverError::Store(StoreError::Serde(_)) => false,
            RolloverError::Store(_) => true,
            RolloverError::Week(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_failures_are_transient_but_corrupt_data_is_not() {
        let transient = RolloverError::Store(StoreError::Backend("timeout".to_string()));
        assert!(transient.is_transient());

        let conflict = RolloverError::Store(StoreError::conflict("dreams", "u1"));
        assert!(conflict.is_transient());

        let corrupt = RolloverError::Week(WeekIdError::Malformed("garbage".to_string()));
        assert!(!corrupt.is_transient());
    }
}
