use tracing::{debug, info, trace};

use crate::config::MovementConfig;

/// Why a client move timestamp was refused
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum TimestampRejection {
    #[error("Timestamp expired: client={0}, current={1}")]
    Stale(f64, f64),
    #[error("Timestamp jumped forward too far: client={0}, current={1}")]
    ImplausibleJump(f64, f64),
}

/// An accepted client move timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampVerdict {
    /// Newer than the last one; eligible for discrepancy tracking
    Accepted,
    /// The client zeroed its move clock; the authority must do the same
    ResetDetected,
}

/// Checks incoming move timestamps against the last accepted one
#[derive(Debug, Clone)]
pub struct TimestampValidator {
    reset_threshold: f64,
}

impl TimestampValidator {
    pub fn new(config: &MovementConfig) -> Self {
        Self {
            reset_threshold: config.reset_threshold,
        }
    }

    /// Classify `timestamp` relative to the authority's `current` client timestamp
    pub fn verify(
        &self,
        timestamp: f64,
        current: f64,
    ) -> Result<TimestampVerdict, TimestampRejection> {
        // Very large deltas only happen around a client clock reset
        let delta = timestamp - current;
        if delta.abs() > self.reset_threshold * 0.5 {
            if delta < 0.0 {
                info!(
                    "Timestamp reset detected. current={:.4} new={:.4}",
                    current, timestamp
                );
                return Ok(TimestampVerdict::ResetDetected);
            }
            debug!(
                "Timestamp expired before reset. current={:.4} new={:.4}",
                current, timestamp
            );
            return Err(TimestampRejection::ImplausibleJump(timestamp, current));
        }

        if timestamp <= current {
            debug!("Timestamp expired. {:.4}, current={:.4}", timestamp, current);
            return Err(TimestampRejection::Stale(timestamp, current));
        }

        trace!("Timestamp {:.4} accepted, current={:.4}", timestamp, current);
        Ok(TimestampVerdict::Accepted)
    }
}

impl Default for TimestampValidator {
    fn default() -> Self {
        Self::new(&MovementConfig::default())
    }
}
