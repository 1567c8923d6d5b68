use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Errors returned by [`NetcodeConfig::validate`]
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),
    #[error("{0} must be within [{1}, {2}]")]
    OutOfRange(&'static str, f64, f64),
    #[error("min_time_margin ({0}) must not exceed max_time_margin ({1})")]
    InvertedMargins(f64, f64),
}

/// Client prediction and authority movement tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovementConfig {
    /// Client timestamp value (seconds) past which the client zeroes its move clock
    pub reset_threshold: f64,
    /// Maximum number of unacknowledged moves the client buffers
    pub max_saved_moves: usize,
    /// Maximum number of released moves kept for reuse
    pub max_free_moves: usize,
    /// Upper bound on a single move's delta time (seconds)
    pub max_move_delta_time: f64,
    /// Lower bound on a move's delta time while repaying a time discrepancy
    pub min_move_tick_time: f64,
    /// Upper bound on the step taken by a forced position update
    pub max_simulation_time_step: f64,
    /// Time without a client move after which the authority forces an update
    pub max_client_update_interval: f64,
    /// Squared position error above which a client move is corrected
    pub max_position_error_sq: f32,
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self {
            reset_threshold: 4.0 * 60.0,
            max_saved_moves: 96,
            max_free_moves: 32,
            max_move_delta_time: 0.125,
            min_move_tick_time: 0.0002,
            max_simulation_time_step: 0.1,
            max_client_update_interval: 0.25,
            max_position_error_sq: 3.0,
        }
    }
}

/// Movement time discrepancy detection and resolution tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscrepancyConfig {
    /// Track client-claimed time against authority time at all
    pub detection_enabled: bool,
    /// Force payback of stolen time once detected (otherwise only report and clear)
    pub resolution_enabled: bool,
    /// Send a correction for every move processed while resolving
    pub force_corrections_during_resolution: bool,
    /// Discrepancy (seconds) above which resolution triggers
    pub max_time_margin: f64,
    /// Floor for the tracked discrepancy (client running behind the authority)
    pub min_time_margin: f64,
    /// Fraction of each move's bounded delta diverted to payback, in [0, 1]
    pub resolution_rate: f64,
    /// Per-second decay of the tracked discrepancy toward zero
    pub drift_allowance: f64,
}

impl Default for DiscrepancyConfig {
    fn default() -> Self {
        Self {
            detection_enabled: true,
            resolution_enabled: true,
            force_corrections_during_resolution: false,
            max_time_margin: 0.25,
            min_time_margin: -0.25,
            resolution_rate: 1.0,
            drift_allowance: 0.0,
        }
    }
}

/// Complete netcode configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetcodeConfig {
    pub movement: MovementConfig,
    pub discrepancy: DiscrepancyConfig,
}

impl NetcodeConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();
        let m = &mut config.movement;
        env_override("PAWN_RESET_THRESHOLD", &mut m.reset_threshold, |v| *v > 0.0);
        env_override("PAWN_MAX_SAVED_MOVES", &mut m.max_saved_moves, |v| *v > 0);
        env_override("PAWN_MAX_FREE_MOVES", &mut m.max_free_moves, |_| true);
        env_override("PAWN_MAX_MOVE_DELTA_TIME", &mut m.max_move_delta_time, |v| *v > 0.0);
        env_override("PAWN_MIN_MOVE_TICK_TIME", &mut m.min_move_tick_time, |v| *v >= 0.0);
        env_override(
            "PAWN_MAX_SIMULATION_TIME_STEP",
            &mut m.max_simulation_time_step,
            |v| *v > 0.0,
        );
        env_override(
            "PAWN_MAX_CLIENT_UPDATE_INTERVAL",
            &mut m.max_client_update_interval,
            |v| *v > 0.0,
        );
        env_override("PAWN_MAX_POSITION_ERROR_SQ", &mut m.max_position_error_sq, |v| *v >= 0.0);

        let d = &mut config.discrepancy;
        env_override("PAWN_DISCREPANCY_DETECTION", &mut d.detection_enabled, |_| true);
        env_override("PAWN_DISCREPANCY_RESOLUTION", &mut d.resolution_enabled, |_| true);
        env_override(
            "PAWN_DISCREPANCY_FORCE_CORRECTIONS",
            &mut d.force_corrections_during_resolution,
            |_| true,
        );
        env_override("PAWN_DISCREPANCY_MAX_MARGIN", &mut d.max_time_margin, |v| v.is_finite());
        env_override("PAWN_DISCREPANCY_MIN_MARGIN", &mut d.min_time_margin, |v| v.is_finite());
        env_override(
            "PAWN_DISCREPANCY_RESOLUTION_RATE",
            &mut d.resolution_rate,
            |v| (0.0..=1.0).contains(v),
        );
        env_override("PAWN_DISCREPANCY_DRIFT_ALLOWANCE", &mut d.drift_allowance, |v| *v >= 0.0);

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.movement;
        if m.reset_threshold <= 0.0 {
            return Err(ConfigError::NotPositive("reset_threshold"));
        }
        if m.max_saved_moves == 0 {
            return Err(ConfigError::NotPositive("max_saved_moves"));
        }
        if m.max_move_delta_time <= 0.0 {
            return Err(ConfigError::NotPositive("max_move_delta_time"));
        }
        if m.max_simulation_time_step <= 0.0 {
            return Err(ConfigError::NotPositive("max_simulation_time_step"));
        }
        if m.min_move_tick_time < 0.0 || m.min_move_tick_time > m.max_move_delta_time {
            return Err(ConfigError::OutOfRange(
                "min_move_tick_time",
                0.0,
                m.max_move_delta_time,
            ));
        }

        let d = &self.discrepancy;
        if !(0.0..=1.0).contains(&d.resolution_rate) {
            return Err(ConfigError::OutOfRange("resolution_rate", 0.0, 1.0));
        }
        if d.drift_allowance < 0.0 {
            return Err(ConfigError::OutOfRange("drift_allowance", 0.0, f64::INFINITY));
        }
        if d.min_time_margin > d.max_time_margin {
            return Err(ConfigError::InvertedMargins(d.min_time_margin, d.max_time_margin));
        }
        Ok(())
    }
}

/// Overwrite `target` from environment variable `key` if it parses and passes `accept`
pub(crate) fn env_override<T>(key: &str, target: &mut T, accept: impl Fn(&T) -> bool)
where
    T: FromStr,
{
    let Ok(raw) = std::env::var(key) else {
        return;
    };
    match raw.parse::<T>() {
        Ok(parsed) if accept(&parsed) => *target = parsed,
        Ok(_) => tracing::warn!("{} value '{}' out of range, using default", key, raw),
        Err(_) => tracing::warn!("Invalid {} '{}', using default", key, raw),
    }
}
