//! Authority-side reconciliation: validates incoming moves, derives the delta
//! to simulate, and judges the client's claimed result.

use tracing::{debug, trace, warn};

use crate::anticheat::discrepancy::{MoveTiming, TimeDiscrepancyResolver};
use crate::anticheat::timestamp::{TimestampRejection, TimestampValidator, TimestampVerdict};
use crate::config::NetcodeConfig;
use crate::movement::input::QuantizedInput;
use crate::movement::saved_move::SavedMove;
use crate::movement::simulator::PositionErrorPolicy;
use crate::movement::snapshot::KinematicSnapshot;
use crate::movement::StepRequest;
use crate::net::protocol::ServerMessage;

/// What the authority decided about an incoming `ServerMove`
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ServerMoveOutcome {
    /// Simulate the request, then call `finish_client_move` with the result
    Simulate(StepRequest),
    /// Stale, duplicate or implausible timestamp; dropped
    Rejected(TimestampRejection),
    /// Timestamp recorded but the authority is not ready to move this client
    NotReady,
    /// Derived delta was not positive; nothing to simulate
    NoDelta,
}

#[derive(Debug)]
pub struct ServerReconciliationState {
    validator: TimestampValidator,
    resolver: TimeDiscrepancyResolver,

    /// Last accepted client timestamp
    current_client_timestamp: f64,
    /// Last time the body was moved on the client's behalf
    server_timestamp: f64,
    /// Arrival time of the last accepted client move
    last_server_move: Option<f64>,
    creation_time: f64,

    force_client_update: bool,
    ready_for_client: bool,
    /// Move between `receive_server_move` and `finish_client_move`; `start`
    /// holds the client's claimed end state
    processing: Option<SavedMove>,

    max_simulation_time_step: f64,
    max_client_update_interval: f64,
}

impl ServerReconciliationState {
    /// `now` is the authority clock at spawn; no forced update is due before
    /// the client has had a chance to send moves.
    pub fn new(config: &NetcodeConfig, now: f64) -> Self {
        Self {
            validator: TimestampValidator::new(&config.movement),
            resolver: TimeDiscrepancyResolver::new(&config.discrepancy, &config.movement),
            current_client_timestamp: 0.0,
            server_timestamp: now,
            last_server_move: None,
            creation_time: now,
            force_client_update: false,
            ready_for_client: true,
            processing: None,
            max_simulation_time_step: config.movement.max_simulation_time_step,
            max_client_update_interval: config.movement.max_client_update_interval,
        }
    }

    /// Handle `ServerMove(timestamp, input, client_end)` arriving at `now`
    pub fn receive_server_move(
        &mut self,
        timestamp: f64,
        input: QuantizedInput,
        client_end: KinematicSnapshot,
        now: f64,
    ) -> ServerMoveOutcome {
        // A new move supersedes any that was never finished
        if self.processing.take().is_some() {
            debug!("Discarding unfinished processing move");
        }

        let verdict = match self.validator.verify(timestamp, self.current_client_timestamp) {
            Ok(verdict) => verdict,
            Err(rejection) => return ServerMoveOutcome::Rejected(rejection),
        };

        match verdict {
            TimestampVerdict::ResetDetected => {
                self.resolver
                    .notify_timestamp_reset(self.current_client_timestamp, timestamp);
                self.current_client_timestamp = 0.0;
            }
            TimestampVerdict::Accepted => {
                let timing = MoveTiming {
                    now,
                    last_server_move: self.last_server_move,
                    last_movement_update: self.server_timestamp,
                    current_client_timestamp: self.current_client_timestamp,
                    creation_time: self.creation_time,
                };
                let step = self.resolver.process(timestamp, &timing);
                self.force_client_update |= step.force_correction;
            }
        }

        let input = if self.ready_for_client {
            input
        } else {
            QuantizedInput::default()
        };

        let delta_time = self
            .resolver
            .move_delta_time(timestamp, self.current_client_timestamp);

        self.current_client_timestamp = timestamp;
        self.server_timestamp = now;
        self.last_server_move = Some(now);

        if !self.ready_for_client {
            return ServerMoveOutcome::NotReady;
        }
        if delta_time <= 0.0 {
            return ServerMoveOutcome::NoDelta;
        }

        self.processing = Some(SavedMove {
            timestamp,
            delta_time,
            input,
            start: client_end,
            ..Default::default()
        });
        trace!("Processing move ts={:.4} dt={:.4}", timestamp, delta_time);

        ServerMoveOutcome::Simulate(StepRequest { input, delta_time })
    }

    /// Compare the authority's result with the client's claim and produce the
    /// acknowledgement. `None` if no move was being processed.
    pub fn finish_client_move<P>(
        &mut self,
        result: &KinematicSnapshot,
        policy: &P,
    ) -> Option<ServerMessage>
    where
        P: PositionErrorPolicy + ?Sized,
    {
        let mut mv = self.processing.take()?;
        mv.post_update(result);

        let bad_client_sim = policy.exceeds_tolerance(&mv.end, &mv.start);
        let ack = if bad_client_sim || self.force_client_update {
            debug!(
                "Correcting client at ts={:.4} (error {:.3}, forced {})",
                mv.timestamp,
                mv.end.position.distance_sq_to(mv.start.position),
                self.force_client_update
            );
            ServerMessage::ClientAckBadMove {
                timestamp: mv.timestamp,
                state: mv.end,
            }
        } else {
            ServerMessage::ClientAckGoodMove {
                timestamp: mv.timestamp,
            }
        };

        self.force_client_update = false;
        Some(ack)
    }

    /// True when the client has gone quiet for longer than allowed
    pub fn needs_forced_update(&self, now: f64) -> bool {
        now - self.server_timestamp > self.max_client_update_interval
    }

    /// Move the body without client input after a long silence. Returns the
    /// clamped step to simulate with an idle input.
    pub fn force_position_update(&mut self, now: f64) -> StepRequest {
        let elapsed = now - self.server_timestamp;
        warn!(
            "Forcing position update with {:.3}s delta. Max = {:.3}, delta may be clamped",
            elapsed, self.max_simulation_time_step
        );
        self.server_timestamp = now;
        StepRequest {
            input: QuantizedInput::default(),
            delta_time: elapsed.min(self.max_simulation_time_step).max(0.0),
        }
    }

    pub fn set_ready_for_client(&mut self, ready: bool) {
        self.ready_for_client = ready;
    }

    pub fn is_ready_for_client(&self) -> bool {
        self.ready_for_client
    }

    pub fn current_client_timestamp(&self) -> f64 {
        self.current_client_timestamp
    }

    pub fn server_timestamp(&self) -> f64 {
        self.server_timestamp
    }

    pub fn processing_move(&self) -> Option<&SavedMove> {
        self.processing.as_ref()
    }

    pub fn resolver(&self) -> &TimeDiscrepancyResolver {
        &self.resolver
    }

    pub fn resolver_mut(&mut self) -> &mut TimeDiscrepancyResolver {
        &mut self.resolver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::movement::simulator::SquaredDistancePolicy;
    use crate::util::math::{Quat, Vec3};

    fn at(x: f32) -> KinematicSnapshot {
        KinematicSnapshot::at_rest(Vec3::new(x, 0.0, 0.0), Quat::IDENTITY)
    }

    fn forward() -> QuantizedInput {
        QuantizedInput::new(1.0, 0.0, 0.0, 0.0, 0)
    }

    fn server() -> ServerReconciliationState {
        ServerReconciliationState::new(&NetcodeConfig::default(), 0.0)
    }

    fn expect_request(outcome: ServerMoveOutcome) -> StepRequest {
        match outcome {
            ServerMoveOutcome::Simulate(request) => request,
            other => panic!("expected Simulate, got {:?}", other),
        }
    }

    #[test]
    fn test_accepted_move_derives_delta_from_timestamps() {
        let mut s = server();
        let first = expect_request(s.receive_server_move(0.05, forward(), at(1.0), 0.05));
        assert_eq!(first.delta_time, 0.05);
        assert_eq!(first.input, forward());
        assert_eq!(s.processing_move().map(|m| m.start), Some(at(1.0)));

        s.finish_client_move(&at(1.0), &SquaredDistancePolicy::new(3.0));
        let second = expect_request(s.receive_server_move(0.07, forward(), at(2.0), 0.07));
        assert!((second.delta_time - 0.02).abs() < 1e-12);
    }

    #[test]
    fn test_delta_clamped_to_max() {
        let mut s = server();
        let request = expect_request(s.receive_server_move(1.0, forward(), at(0.0), 1.0));
        assert_eq!(request.delta_time, 0.125);
    }

    #[test]
    fn test_good_ack_within_tolerance() {
        let mut s = server();
        s.receive_server_move(10.0, forward(), at(5.0), 10.0);
        let ack = s.finish_client_move(&at(5.5), &SquaredDistancePolicy::new(3.0));
        assert_eq!(ack, Some(ServerMessage::ClientAckGoodMove { timestamp: 10.0 }));
        assert!(s.processing_move().is_none());
    }

    #[test]
    fn test_bad_ack_carries_authoritative_state() {
        let mut s = server();
        s.receive_server_move(10.0, forward(), at(5.0), 10.0);
        let ack = s.finish_client_move(&at(9.0), &SquaredDistancePolicy::new(3.0));
        assert_eq!(
            ack,
            Some(ServerMessage::ClientAckBadMove {
                timestamp: 10.0,
                state: at(9.0)
            })
        );
    }

    #[test]
    fn test_finish_without_move() {
        let mut s = server();
        assert!(s
            .finish_client_move(&at(0.0), &SquaredDistancePolicy::new(3.0))
            .is_none());
    }

    #[test]
    fn test_duplicate_and_stale_dropped() {
        let mut s = server();
        expect_request(s.receive_server_move(1.0, forward(), at(0.0), 1.0));
        assert!(matches!(
            s.receive_server_move(1.0, forward(), at(0.0), 1.01),
            ServerMoveOutcome::Rejected(TimestampRejection::Stale(_, _))
        ));
        assert!(matches!(
            s.receive_server_move(0.9, forward(), at(0.0), 1.02),
            ServerMoveOutcome::Rejected(_)
        ));
        assert_eq!(s.current_client_timestamp(), 1.0);
        assert!(s.processing_move().is_none());
    }

    #[test]
    fn test_implausible_jump_dropped() {
        let mut s = server();
        expect_request(s.receive_server_move(1.0, forward(), at(0.0), 1.0));
        assert!(matches!(
            s.receive_server_move(500.0, forward(), at(0.0), 1.1),
            ServerMoveOutcome::Rejected(TimestampRejection::ImplausibleJump(_, _))
        ));
    }

    #[test]
    fn test_reset_accepted_and_rebased() {
        let mut s = server();
        let mut now = 0.0;
        let mut ts = 0.0;
        while ts < 239.9 {
            ts += 0.1;
            now += 0.1;
            s.receive_server_move(ts, forward(), at(0.0), now);
        }
        let lifetime_before = s.resolver().lifetime_raw_discrepancy();

        let request = expect_request(s.receive_server_move(0.05, forward(), at(0.0), now + 0.05));
        assert_eq!(request.delta_time, 0.05);
        assert_eq!(s.current_client_timestamp(), 0.05);
        // Reset moves skip discrepancy tracking
        assert_eq!(s.resolver().lifetime_raw_discrepancy(), lifetime_before);
    }

    #[test]
    fn test_not_ready_records_timestamp_only() {
        let mut s = server();
        s.set_ready_for_client(false);
        assert_eq!(
            s.receive_server_move(0.5, forward(), at(0.0), 0.5),
            ServerMoveOutcome::NotReady
        );
        assert_eq!(s.current_client_timestamp(), 0.5);
        assert!(s.processing_move().is_none());

        s.set_ready_for_client(true);
        let request = expect_request(s.receive_server_move(0.6, forward(), at(0.0), 0.6));
        assert!((request.delta_time - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_forced_update() {
        let mut s = server();
        assert!(!s.needs_forced_update(0.2));
        assert!(s.needs_forced_update(0.3));

        let request = s.force_position_update(2.0);
        assert_eq!(request.delta_time, 0.1);
        assert!(request.input.is_idle());
        assert_eq!(s.server_timestamp(), 2.0);
        assert!(!s.needs_forced_update(2.1));
    }

    #[test]
    fn test_force_correction_during_resolution() {
        let mut config = NetcodeConfig::default();
        config.discrepancy.force_corrections_during_resolution = true;
        let mut s = ServerReconciliationState::new(&config, 0.0);
        let policy = SquaredDistancePolicy::new(3.0);

        // Client claims double the real time
        let mut now = 0.0;
        let mut ts = 0.0;
        let mut corrected = false;
        for _ in 0..100 {
            now += 1.0 / 64.0;
            ts += 2.0 / 64.0;
            let outcome = s.receive_server_move(ts, forward(), at(0.0), now);
            if let ServerMoveOutcome::Simulate(_) = outcome {
                let ack = s.finish_client_move(&at(0.0), &policy);
                if let Some(ServerMessage::ClientAckBadMove { .. }) = ack {
                    corrected = true;
                }
            }
        }
        assert!(s.resolver().detections() > 0);
        assert!(corrected);
    }
}
