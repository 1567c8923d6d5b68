//! Movement time discrepancy detection and resolution
//!
//! Tracks how much time a client claims to have simulated (from its move
//! timestamps) against how much real time passed on the authority between
//! moves. Once the client is too far ahead, every following move is clamped
//! to authority time and part of it is withheld until the stolen time is paid
//! back.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{DiscrepancyConfig, MovementConfig};

/// Passed to a [`DiscrepancyObserver`] when a client crosses the time margin
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeDiscrepancyReport {
    /// Bounded discrepancy that triggered detection (seconds)
    pub current_discrepancy: f64,
    /// Unbounded running total of client error
    pub lifetime_raw_discrepancy: f64,
    /// Seconds since the authority state was created
    pub lifetime: f64,
    /// Error contributed by the move that triggered detection
    pub current_move_error: f64,
}

/// Hook for reporting, analytics or sanctions
pub trait DiscrepancyObserver: Send {
    fn on_time_discrepancy_detected(&mut self, report: &TimeDiscrepancyReport);

    fn on_timestamp_reset(&mut self, _previous: f64, _timestamp: f64) {}
}

/// Default observer: logs detections
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl DiscrepancyObserver for LoggingObserver {
    fn on_time_discrepancy_detected(&mut self, report: &TimeDiscrepancyReport) {
        warn!(
            "Movement time discrepancy detected: current={:.4}s lifetime_raw={:.4}s after {:.1}s (move error {:.4}s)",
            report.current_discrepancy,
            report.lifetime_raw_discrepancy,
            report.lifetime,
            report.current_move_error
        );
    }
}

/// Authority clock readings needed to process one client move
#[derive(Debug, Clone, Copy)]
pub struct MoveTiming {
    pub now: f64,
    /// When the previous client move arrived, if any has
    pub last_server_move: Option<f64>,
    /// When the body was last moved on the client's behalf (move or forced update)
    pub last_movement_update: f64,
    /// Last accepted client timestamp
    pub current_client_timestamp: f64,
    pub creation_time: f64,
}

/// What processing one move decided
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DiscrepancyStep {
    pub detected: bool,
    /// The move must be corrected regardless of position error
    pub force_correction: bool,
}

pub struct TimeDiscrepancyResolver {
    config: DiscrepancyConfig,
    max_move_delta_time: f64,
    min_move_tick_time: f64,

    time_discrepancy: f64,
    lifetime_raw_discrepancy: f64,
    resolving: bool,
    resolution_delta_override: f64,
    accumulated_client_deltas: f64,
    detections: u64,

    observer: Box<dyn DiscrepancyObserver>,
}

impl TimeDiscrepancyResolver {
    pub fn new(config: &DiscrepancyConfig, movement: &MovementConfig) -> Self {
        Self {
            config: config.clone(),
            max_move_delta_time: movement.max_move_delta_time,
            min_move_tick_time: movement.min_move_tick_time,
            time_discrepancy: 0.0,
            lifetime_raw_discrepancy: 0.0,
            resolving: false,
            resolution_delta_override: 0.0,
            accumulated_client_deltas: 0.0,
            detections: 0,
            observer: Box::new(LoggingObserver),
        }
    }

    pub fn set_observer(&mut self, observer: Box<dyn DiscrepancyObserver>) {
        self.observer = observer;
    }

    /// Client-timestamp-derived delta, clamped to the maximum move delta
    pub fn base_delta_time(&self, client_timestamp: f64, current_client_timestamp: f64) -> f64 {
        self.max_move_delta_time
            .min(client_timestamp - current_client_timestamp)
    }

    /// Delta the authority simulates this move with
    pub fn move_delta_time(&self, client_timestamp: f64, current_client_timestamp: f64) -> f64 {
        if self.resolving {
            self.resolution_delta_override
        } else {
            self.base_delta_time(client_timestamp, current_client_timestamp)
        }
    }

    /// Account for a newly accepted client timestamp
    pub fn process(&mut self, client_timestamp: f64, timing: &MoveTiming) -> DiscrepancyStep {
        let mut step = DiscrepancyStep::default();

        let Some(last_server_move) = timing.last_server_move else {
            return step;
        };
        if !self.config.detection_enabled {
            return step;
        }

        let server_delta = timing.now - last_server_move;
        let client_delta = client_timestamp - timing.current_client_timestamp;
        let client_error = client_delta - server_delta;

        self.lifetime_raw_discrepancy += client_error;

        // Bounded discrepancy with drift allowance so bursts of loss or hitches
        // don't snowball into seconds of payback
        let raw_discrepancy = self.time_discrepancy + client_error;
        let mut new_discrepancy = raw_discrepancy;
        let drift = self.config.drift_allowance;
        if drift > 0.0 {
            new_discrepancy = if new_discrepancy > 0.0 {
                (new_discrepancy - server_delta * drift).max(0.0)
            } else {
                (new_discrepancy + server_delta * drift).min(0.0)
            };
        }
        new_discrepancy = new_discrepancy.max(self.config.min_time_margin);

        // Share of this move's error that survived drift and clamping
        let effective_client_error = if raw_discrepancy != 0.0 {
            client_error * (new_discrepancy / raw_discrepancy)
        } else {
            client_error
        };

        self.resolving = self.resolving && self.time_discrepancy > 0.0;

        if !self.resolving {
            if new_discrepancy > self.config.max_time_margin {
                if self.config.resolution_enabled {
                    self.resolving = true;
                    // This move's contribution is handled under resolution rules
                    self.time_discrepancy = new_discrepancy - effective_client_error;
                } else {
                    self.time_discrepancy = 0.0;
                }

                self.detections += 1;
                step.detected = true;
                self.observer.on_time_discrepancy_detected(&TimeDiscrepancyReport {
                    current_discrepancy: new_discrepancy,
                    lifetime_raw_discrepancy: self.lifetime_raw_discrepancy,
                    lifetime: timing.now - timing.creation_time,
                    current_move_error: client_error,
                });
            } else {
                self.time_discrepancy = new_discrepancy;
            }
        }

        if self.resolving {
            step.force_correction = self.config.force_corrections_during_resolution;
            self.resolve(client_timestamp, timing);
        }

        step
    }

    /// Clamp this move to authority time and withhold part of it as payback
    fn resolve(&mut self, client_timestamp: f64, timing: &MoveTiming) {
        let server_delta_since_update = timing.now - timing.last_movement_update;
        let first_move_this_tick = server_delta_since_update > 0.0;

        let base_delta = self.base_delta_time(client_timestamp, timing.current_client_timestamp);

        // Several moves landing in one authority tick pool their deltas so
        // the next tick can pay back a full tick's worth
        if !first_move_this_tick {
            self.accumulated_client_deltas += base_delta;
        }

        let bound_delta = (base_delta + self.accumulated_client_deltas)
            .min(server_delta_since_update)
            .max(0.0);

        if first_move_this_tick {
            self.accumulated_client_deltas = 0.0;
        }

        let rate = self.config.resolution_rate.clamp(0.0, 1.0);
        let wanted = (bound_delta * rate).min(self.time_discrepancy);

        // The move never shrinks below the minimum tick; whatever that costs
        // comes out of the payback instead
        let (delta_after_payback, payback) = if bound_delta - wanted < self.min_move_tick_time {
            (self.min_move_tick_time, bound_delta - self.min_move_tick_time)
        } else {
            (bound_delta - wanted, wanted)
        };

        self.resolution_delta_override = delta_after_payback;
        self.time_discrepancy -= payback;

        debug!(
            "Resolving time discrepancy: delta {:.4} -> {:.4}, remaining {:.4}",
            bound_delta, delta_after_payback, self.time_discrepancy
        );
    }

    pub fn notify_timestamp_reset(&mut self, previous: f64, timestamp: f64) {
        self.observer.on_timestamp_reset(previous, timestamp);
    }

    pub fn time_discrepancy(&self) -> f64 {
        self.time_discrepancy
    }

    pub fn lifetime_raw_discrepancy(&self) -> f64 {
        self.lifetime_raw_discrepancy
    }

    pub fn is_resolving(&self) -> bool {
        self.resolving
    }

    pub fn resolution_delta_override(&self) -> f64 {
        self.resolution_delta_override
    }

    pub fn accumulated_client_deltas(&self) -> f64 {
        self.accumulated_client_deltas
    }

    /// Number of times the client crossed the maximum margin
    pub fn detections(&self) -> u64 {
        self.detections
    }
}

impl std::fmt::Debug for TimeDiscrepancyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeDiscrepancyResolver")
            .field("time_discrepancy", &self.time_discrepancy)
            .field("lifetime_raw_discrepancy", &self.lifetime_raw_discrepancy)
            .field("resolving", &self.resolving)
            .field("resolution_delta_override", &self.resolution_delta_override)
            .field("accumulated_client_deltas", &self.accumulated_client_deltas)
            .finish_non_exhaustive()
    }
}
