//! Role-dispatching movement component
//!
//! A [`PawnMovement`] owns one body's kinematic state and the data for the
//! role it plays on this machine. Each frame runs in two phases around the
//! caller's physics step:
//!
//! 1. `pre_step` decides what to simulate and returns a [`StepRequest`]
//! 2. the caller simulates and hands the result to `post_step`, which returns
//!    the message (if any) to put on the wire
//!
//! `tick` and `process_server_move` run both phases with a
//! [`MovementSimulator`] for callers that own the physics step too.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{error, trace};

use crate::config::NetcodeConfig;
use crate::metrics::NetcodeMetrics;
use crate::movement::client::{AckOutcome, ClientPredictionState};
use crate::movement::input::QuantizedInput;
use crate::movement::replay::replay_saved_moves;
use crate::movement::server::{ServerMoveOutcome, ServerReconciliationState};
use crate::movement::simulator::{
    Clock, MovementSimulator, PositionErrorPolicy, SquaredDistancePolicy,
};
use crate::movement::snapshot::KinematicSnapshot;
use crate::movement::StepRequest;
use crate::net::protocol::{ClientMessage, ServerMessage};

/// Which side of the connection this pawn's movement runs on
#[derive(Debug)]
pub enum NetRole {
    /// Locally controlled client: predicts, buffers and replays
    AutonomousProxy(ClientPredictionState),
    /// Authority for a remote client: validates and acknowledges
    Authority(ServerReconciliationState),
    /// No networking; input is simulated directly
    Standalone,
}

impl NetRole {
    pub fn name(&self) -> &'static str {
        match self {
            NetRole::AutonomousProxy(_) => "autonomous proxy",
            NetRole::Authority(_) => "authority",
            NetRole::Standalone => "standalone",
        }
    }
}

/// Message produced by `post_step`, tagged with its direction
#[derive(Debug, Clone, PartialEq)]
pub enum OutgoingMessage {
    ToServer(ClientMessage),
    ToClient(ServerMessage),
}

/// Misuse of the movement API. Protocol anomalies are not errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MovementError {
    #[error("{operation} is not valid for a {role} pawn")]
    WrongRole {
        operation: &'static str,
        role: &'static str,
    },
    #[error("post_step called without a matching pre_step")]
    NoPendingStep,
    #[error("frame delta time {0} is negative or not finite")]
    InvalidDeltaTime(f64),
}

/// What the open step will be used for once simulated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingStep {
    ClientMove,
    ClientServerMove,
    ForcedUpdate,
    Local,
}

pub struct PawnMovement {
    state: KinematicSnapshot,
    role: NetRole,
    pending: Option<PendingStep>,
    policy: Box<dyn PositionErrorPolicy + Send + Sync>,
    clock: Arc<dyn Clock + Send + Sync>,
    metrics: Option<Arc<NetcodeMetrics>>,
}

impl PawnMovement {
    fn with_role(
        role: NetRole,
        config: &NetcodeConfig,
        initial: KinematicSnapshot,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> Self {
        Self {
            state: initial,
            role,
            pending: None,
            policy: Box::new(SquaredDistancePolicy::from_config(&config.movement)),
            clock,
            metrics: None,
        }
    }

    /// Client-side pawn that predicts locally and sends its moves
    pub fn autonomous_proxy(
        config: &NetcodeConfig,
        initial: KinematicSnapshot,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> Self {
        let role = NetRole::AutonomousProxy(ClientPredictionState::new(&config.movement));
        Self::with_role(role, config, initial, clock)
    }

    /// Authority-side pawn driven by a remote client's moves
    pub fn authority(
        config: &NetcodeConfig,
        initial: KinematicSnapshot,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> Self {
        let role = NetRole::Authority(ServerReconciliationState::new(config, clock.now()));
        Self::with_role(role, config, initial, clock)
    }

    pub fn standalone(
        config: &NetcodeConfig,
        initial: KinematicSnapshot,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> Self {
        Self::with_role(NetRole::Standalone, config, initial, clock)
    }

    pub fn with_metrics(mut self, metrics: Arc<NetcodeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_policy(mut self, policy: Box<dyn PositionErrorPolicy + Send + Sync>) -> Self {
        self.policy = policy;
        self
    }

    fn wrong_role(&self, operation: &'static str) -> MovementError {
        let role = self.role.name();
        error!("{} called on a {} pawn", operation, role);
        MovementError::WrongRole { operation, role }
    }

    /// Phase one: decide what to simulate this frame.
    ///
    /// The client replays after a correction, then opens a move stamped with
    /// its move clock. The authority only returns a request when the client
    /// has been silent too long and a forced update is due; its regular moves
    /// come from `receive_server_move`.
    ///
    /// A frame that does not advance the client's move clock opens nothing.
    pub fn pre_step<S>(
        &mut self,
        input: QuantizedInput,
        delta_time: f64,
        simulator: &S,
    ) -> Result<Option<StepRequest>, MovementError>
    where
        S: MovementSimulator + ?Sized,
    {
        if !matches!(self.role, NetRole::Authority(_))
            && (!delta_time.is_finite() || delta_time < 0.0)
        {
            error!("pre_step rejected frame delta time {}", delta_time);
            return Err(MovementError::InvalidDeltaTime(delta_time));
        }

        let (request, pending) = match &mut self.role {
            NetRole::AutonomousProxy(client) => {
                let timestamp = client.current_timestamp();
                if timestamp + delta_time <= timestamp {
                    trace!("Skipping frame that leaves the move clock at {:.4}", timestamp);
                    return Ok(None);
                }

                let replayed = replay_saved_moves(client, &mut self.state, simulator);
                let overflows = client.overflow_count();

                let input = input.quantized();
                let delta_time = client.begin_move(input, delta_time, &self.state);

                let overflowed = client.overflow_count() - overflows;
                if let Some(metrics) = &self.metrics {
                    if replayed > 0 {
                        NetcodeMetrics::incr(&metrics.replays);
                        metrics
                            .replayed_moves
                            .fetch_add(replayed as u64, Ordering::Relaxed);
                    }
                    metrics.buffer_overflows.fetch_add(overflowed, Ordering::Relaxed);
                }
                (StepRequest { input, delta_time }, PendingStep::ClientMove)
            }
            NetRole::Authority(server) => {
                let now = self.clock.now();
                if server.needs_forced_update(now) {
                    if let Some(metrics) = &self.metrics {
                        NetcodeMetrics::incr(&metrics.forced_updates);
                    }
                    let request = server.force_position_update(now);
                    (request, PendingStep::ForcedUpdate)
                } else {
                    return Ok(None);
                }
            }
            NetRole::Standalone => {
                if delta_time == 0.0 {
                    return Ok(None);
                }
                let request = StepRequest {
                    input: input.quantized(),
                    delta_time,
                };
                (request, PendingStep::Local)
            }
        };

        if let Some(abandoned) = self.pending.replace(pending) {
            trace!("pre_step abandons unfinished {:?} step", abandoned);
        }
        Ok(Some(request))
    }

    /// Phase two: adopt the simulated `result` and produce the message to send
    pub fn post_step(
        &mut self,
        result: KinematicSnapshot,
    ) -> Result<Option<OutgoingMessage>, MovementError> {
        let pending = self.pending.take().ok_or(MovementError::NoPendingStep)?;
        self.state = result;

        let message = match (&mut self.role, pending) {
            (NetRole::AutonomousProxy(client), PendingStep::ClientMove) => {
                if client.finish_move(&result).is_none() {
                    return Err(MovementError::NoPendingStep);
                }
                let Some(mv) = client.saved_moves().back() else {
                    return Err(MovementError::NoPendingStep);
                };
                let important = mv.is_important_move(client.last_acked_move());
                let message = ClientMessage::ServerMove {
                    timestamp: mv.timestamp,
                    input: mv.input,
                    end_state: mv.end,
                };

                if let Some(metrics) = &self.metrics {
                    NetcodeMetrics::incr(&metrics.moves_sent);
                    if important {
                        NetcodeMetrics::incr(&metrics.important_moves);
                    }
                    metrics
                        .pending_moves
                        .store(client.saved_moves().len() as u64, Ordering::Relaxed);
                }
                Some(OutgoingMessage::ToServer(message))
            }
            (NetRole::Authority(server), PendingStep::ClientServerMove) => {
                let ack = server.finish_client_move(&result, self.policy.as_ref());
                if let (Some(ack), Some(metrics)) = (&ack, &self.metrics) {
                    if ack.is_correction() {
                        NetcodeMetrics::incr(&metrics.acks_bad_sent);
                    } else {
                        NetcodeMetrics::incr(&metrics.acks_good_sent);
                    }
                }
                ack.map(OutgoingMessage::ToClient)
            }
            (NetRole::Authority(_), PendingStep::ForcedUpdate) => None,
            (NetRole::Standalone, PendingStep::Local) => None,
            _ => return Err(MovementError::NoPendingStep),
        };

        Ok(message)
    }

    /// Authority: accept a `ServerMove` from the client.
    ///
    /// On `Simulate`, run the request from the current state and pass the
    /// result to `post_step` to get the acknowledgement.
    pub fn receive_server_move(
        &mut self,
        message: ClientMessage,
    ) -> Result<ServerMoveOutcome, MovementError> {
        let NetRole::Authority(server) = &mut self.role else {
            return Err(self.wrong_role("receive_server_move"));
        };
        let ClientMessage::ServerMove {
            timestamp,
            input,
            end_state,
        } = message;

        let previous = server.current_client_timestamp();
        let detections = server.resolver().detections();
        let outcome = server.receive_server_move(timestamp, input, end_state, self.clock.now());

        if let ServerMoveOutcome::Simulate(_) = outcome {
            if let Some(abandoned) = self.pending.replace(PendingStep::ClientServerMove) {
                trace!("receive_server_move abandons unfinished {:?} step", abandoned);
            }
        }

        if let Some(metrics) = &self.metrics {
            NetcodeMetrics::incr(&metrics.moves_received);
            match outcome {
                ServerMoveOutcome::Rejected(_) => NetcodeMetrics::incr(&metrics.moves_rejected),
                ServerMoveOutcome::NotReady | ServerMoveOutcome::NoDelta => {
                    NetcodeMetrics::incr(&metrics.moves_skipped)
                }
                ServerMoveOutcome::Simulate(_) => {}
            }
            if !matches!(outcome, ServerMoveOutcome::Rejected(_)) && timestamp < previous {
                NetcodeMetrics::incr(&metrics.timestamp_resets);
            }
            let resolver = server.resolver();
            metrics
                .discrepancy_detections
                .fetch_add(resolver.detections() - detections, Ordering::Relaxed);
            metrics.record_time_discrepancy(resolver.time_discrepancy());
        }

        Ok(outcome)
    }

    /// Client: apply an acknowledgement from the authority. A correction
    /// snaps the local state; the replay runs on the next `pre_step`.
    pub fn receive_ack(&mut self, message: ServerMessage) -> Result<AckOutcome, MovementError> {
        let NetRole::AutonomousProxy(client) = &mut self.role else {
            return Err(self.wrong_role("receive_ack"));
        };

        let before = self.state.position;
        let outcome = match message {
            ServerMessage::ClientAckGoodMove { timestamp } => client.handle_ack_good(timestamp),
            ServerMessage::ClientAckBadMove { timestamp, state } => {
                client.handle_ack_bad(timestamp, &state, &mut self.state)
            }
        };

        if let Some(metrics) = &self.metrics {
            match outcome {
                AckOutcome::Acknowledged { .. } => {
                    NetcodeMetrics::incr(&metrics.acks_good_received)
                }
                AckOutcome::Corrected { .. } => {
                    NetcodeMetrics::incr(&metrics.acks_bad_received);
                    metrics.record_correction(before.distance_sq_to(self.state.position).sqrt());
                }
                AckOutcome::Unmatched => NetcodeMetrics::incr(&metrics.acks_unmatched),
            }
            metrics
                .pending_moves
                .store(client.saved_moves().len() as u64, Ordering::Relaxed);
        }

        Ok(outcome)
    }

    /// Run both phases with `simulator`
    pub fn tick<S>(
        &mut self,
        input: QuantizedInput,
        delta_time: f64,
        simulator: &S,
    ) -> Result<Option<OutgoingMessage>, MovementError>
    where
        S: MovementSimulator + ?Sized,
    {
        match self.pre_step(input, delta_time, simulator)? {
            Some(request) => {
                let result = simulator.simulate(&self.state, &request.input, request.delta_time);
                self.post_step(result)
            }
            None => Ok(None),
        }
    }

    /// Authority: receive, simulate and acknowledge one client move
    pub fn process_server_move<S>(
        &mut self,
        message: ClientMessage,
        simulator: &S,
    ) -> Result<Option<ServerMessage>, MovementError>
    where
        S: MovementSimulator + ?Sized,
    {
        let ServerMoveOutcome::Simulate(request) = self.receive_server_move(message)? else {
            return Ok(None);
        };
        let result = simulator.simulate(&self.state, &request.input, request.delta_time);
        match self.post_step(result)? {
            Some(OutgoingMessage::ToClient(ack)) => Ok(Some(ack)),
            _ => Ok(None),
        }
    }

    /// Authority: gate client moves (e.g. while spawning or teleporting)
    pub fn set_ready_for_client(&mut self, ready: bool) -> Result<(), MovementError> {
        if let NetRole::Authority(server) = &mut self.role {
            server.set_ready_for_client(ready);
            return Ok(());
        }
        Err(self.wrong_role("set_ready_for_client"))
    }

    pub fn state(&self) -> &KinematicSnapshot {
        &self.state
    }

    /// Teleport; pending moves still replay from here after the next correction
    pub fn set_state(&mut self, state: KinematicSnapshot) {
        self.state = state;
    }

    pub fn role(&self) -> &NetRole {
        &self.role
    }

    pub fn client(&self) -> Option<&ClientPredictionState> {
        match &self.role {
            NetRole::AutonomousProxy(client) => Some(client),
            _ => None,
        }
    }

    pub fn server(&self) -> Option<&ServerReconciliationState> {
        match &self.role {
            NetRole::Authority(server) => Some(server),
            _ => None,
        }
    }

    pub fn server_mut(&mut self) -> Option<&mut ServerReconciliationState> {
        match &mut self.role {
            NetRole::Authority(server) => Some(server),
            _ => None,
        }
    }

    pub fn has_pending_step(&self) -> bool {
        self.pending.is_some()
    }
}

impl std::fmt::Debug for PawnMovement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PawnMovement")
            .field("state", &self.state)
            .field("role", &self.role)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}
