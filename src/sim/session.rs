//! Loopback session: predicting clients and their authorities in one process
//!
//! Every client pawn talks to its own authority pawn over a pair of
//! [`lossy_link`]s, through the real wire codec. Time is driven by a shared
//! [`ManualClock`], so a session is deterministic for a given seed.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{env_override, NetcodeConfig};
use crate::metrics::NetcodeMetrics;
use crate::movement::input::QuantizedInput;
use crate::movement::pawn::{MovementError, OutgoingMessage, PawnMovement};
use crate::movement::simulator::{HoverSimulator, ManualClock};
use crate::movement::snapshot::KinematicSnapshot;
use crate::net::protocol::{self, ClientMessage, ServerMessage};
use crate::sim::link::{lossy_link, LinkConditions, LinkError, LinkReceiver, LinkSender, LinkStats};
use crate::util::math::{Quat, Vec3};

pub type ClientId = Uuid;

/// Loopback harness settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Simulation ticks per second
    pub tick_rate: u32,
    /// Run length for the binary (seconds)
    pub duration_secs: f64,
    /// Clients spawned by `LoopbackSession::new`
    pub clients: usize,
    /// Client move clock speed relative to real time (> 1 is a speed hack)
    pub client_clock_scale: f64,
    /// Impairment applied in both directions
    pub link: LinkConditions,
    /// Datagrams in flight per direction before sends fail
    pub link_capacity: usize,
    pub seed: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_rate: 60,
            duration_secs: 10.0,
            clients: 1,
            client_clock_scale: 1.0,
            link: LinkConditions::default(),
            link_capacity: 1024,
            seed: 0x5eed,
        }
    }
}

impl SessionConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();
        env_override("PAWN_SIM_TICK_RATE", &mut config.tick_rate, |v| *v > 0);
        env_override("PAWN_SIM_DURATION", &mut config.duration_secs, |v| *v > 0.0);
        env_override("PAWN_SIM_CLIENTS", &mut config.clients, |_| true);
        env_override("PAWN_SIM_CLOCK_SCALE", &mut config.client_clock_scale, |v| *v > 0.0);
        env_override("PAWN_SIM_LINK_CAPACITY", &mut config.link_capacity, |v| *v > 0);
        env_override("PAWN_SIM_SEED", &mut config.seed, |_| true);

        let link = &mut config.link;
        env_override("PAWN_SIM_LAG", &mut link.lag, |v| *v >= 0.0);
        env_override("PAWN_SIM_LAG_VARIANCE", &mut link.lag_variance, |v| *v >= 0.0);
        env_override("PAWN_SIM_LOSS", &mut link.loss, |v| (0.0..=1.0).contains(v));
        env_override("PAWN_SIM_DUPLICATE", &mut link.duplicate, |v| (0.0..=1.0).contains(v));
        env_override("PAWN_SIM_REORDER", &mut link.reorder, |v| (0.0..=1.0).contains(v));
        config
    }

    pub fn tick_interval(&self) -> f64 {
        1.0 / self.tick_rate.max(1) as f64
    }

    /// Number of ticks in `duration_secs`
    pub fn total_ticks(&self) -> u64 {
        (self.duration_secs * self.tick_rate as f64).round().max(0.0) as u64
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("movement: {0}")]
    Movement(#[from] MovementError),
    #[error("link: {0}")]
    Link(#[from] LinkError),
}

/// End-of-run summary for one client
#[derive(Debug, Clone, Serialize)]
pub struct ClientReport {
    pub id: ClientId,
    pub clock_scale: f64,
    /// Distance between the client's prediction and the authority's body
    pub position_error: f32,
    pub pending_moves: usize,
    pub time_discrepancy: f64,
    pub detections: u64,
    pub resolving: bool,
    pub uplink: LinkStats,
    pub downlink: LinkStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub ticks: u64,
    pub elapsed: f64,
    pub clients: Vec<ClientReport>,
}

struct LoopbackClient {
    client: PawnMovement,
    authority: PawnMovement,
    uplink: LinkSender,
    uplink_rx: LinkReceiver,
    downlink: LinkSender,
    downlink_rx: LinkReceiver,
    clock_scale: f64,
    phase: f32,
}

pub struct LoopbackSession {
    config: SessionConfig,
    netcode: NetcodeConfig,
    clock: Arc<ManualClock>,
    simulator: HoverSimulator,
    metrics: Arc<NetcodeMetrics>,
    clients: HashMap<ClientId, LoopbackClient>,
    tick: u64,
    next_seed: u64,
}

impl LoopbackSession {
    pub fn new(
        config: SessionConfig,
        netcode: NetcodeConfig,
        metrics: Arc<NetcodeMetrics>,
    ) -> Self {
        let mut session = Self {
            clock: Arc::new(ManualClock::new(0.0)),
            simulator: HoverSimulator::default(),
            clients: HashMap::with_capacity(config.clients),
            tick: 0,
            next_seed: config.seed,
            netcode,
            metrics,
            config,
        };
        for _ in 0..session.config.clients {
            session.add_client(session.config.client_clock_scale);
        }
        info!(
            "Loopback session: {} clients at {} Hz, link {:?}",
            session.clients.len(),
            session.config.tick_rate,
            session.config.link
        );
        session
    }

    pub fn with_simulator(mut self, simulator: HoverSimulator) -> Self {
        self.simulator = simulator;
        self
    }

    /// Spawn a client/authority pair; `clock_scale` > 1 runs the client's
    /// move clock fast
    pub fn add_client(&mut self, clock_scale: f64) -> ClientId {
        let id = Uuid::new_v4();
        let index = self.clients.len();
        let spawn = KinematicSnapshot::at_rest(
            Vec3::new(0.0, index as f32 * 500.0, 0.0),
            Quat::IDENTITY,
        );

        let client = PawnMovement::autonomous_proxy(&self.netcode, spawn, self.clock.clone())
            .with_metrics(self.metrics.clone());
        let authority = PawnMovement::authority(&self.netcode, spawn, self.clock.clone())
            .with_metrics(self.metrics.clone());

        let (uplink, uplink_rx) =
            lossy_link(self.config.link.clone(), self.config.link_capacity, self.next_seed);
        let (downlink, downlink_rx) = lossy_link(
            self.config.link.clone(),
            self.config.link_capacity,
            self.next_seed.wrapping_add(1),
        );
        self.next_seed = self.next_seed.wrapping_add(2);

        self.clients.insert(
            id,
            LoopbackClient {
                client,
                authority,
                uplink,
                uplink_rx,
                downlink,
                downlink_rx,
                clock_scale,
                phase: index as f32 * 0.9,
            },
        );
        debug!("Added client {} with clock scale {}", id, clock_scale);
        id
    }

    pub fn remove_client(&mut self, id: &ClientId) -> bool {
        self.clients.remove(id).is_some()
    }

    pub fn set_client_clock_scale(&mut self, id: &ClientId, scale: f64) -> bool {
        match self.clients.get_mut(id) {
            Some(c) => {
                c.clock_scale = scale;
                true
            }
            None => false,
        }
    }

    /// Change impairment in both directions for one client
    pub fn set_link_conditions(&mut self, id: &ClientId, conditions: LinkConditions) -> bool {
        match self.clients.get_mut(id) {
            Some(c) => {
                c.uplink.set_conditions(conditions.clone());
                c.downlink.set_conditions(conditions);
                true
            }
            None => false,
        }
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.clients.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn client(&self, id: &ClientId) -> Option<&PawnMovement> {
        self.clients.get(id).map(|c| &c.client)
    }

    pub fn authority(&self, id: &ClientId) -> Option<&PawnMovement> {
        self.clients.get(id).map(|c| &c.authority)
    }

    pub fn authority_mut(&mut self, id: &ClientId) -> Option<&mut PawnMovement> {
        self.clients.get_mut(id).map(|c| &mut c.authority)
    }

    pub fn metrics(&self) -> &Arc<NetcodeMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn ticks(&self) -> u64 {
        self.tick
    }

    pub fn now(&self) -> f64 {
        self.tick as f64 * self.config.tick_interval()
    }

    /// Advance every client and authority by one tick
    pub fn step(&mut self) -> Result<(), SessionError> {
        self.tick += 1;
        let dt = self.config.tick_interval();
        let now = self.now();
        self.clock.set(now);

        for (id, c) in self.clients.iter_mut() {
            let input = scripted_input(now as f32, c.phase);

            // Client predicts and sends
            if let Some(OutgoingMessage::ToServer(message)) =
                c.client.tick(input, dt * c.clock_scale, &self.simulator)?
            {
                send_datagram(&mut c.uplink, protocol::encode(&message), now, &self.metrics)?;
            }

            // Authority consumes whatever has arrived
            for datagram in c.uplink_rx.receive(now)? {
                self.metrics
                    .bytes_received
                    .fetch_add(datagram.len() as u64, Ordering::Relaxed);
                let message = match protocol::decode::<ClientMessage>(&datagram) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Client {} sent undecodable move: {}", id, e);
                        NetcodeMetrics::incr(&self.metrics.decode_errors);
                        continue;
                    }
                };
                if let Some(ack) = c.authority.process_server_move(message, &self.simulator)? {
                    send_datagram(&mut c.downlink, protocol::encode(&ack), now, &self.metrics)?;
                }
            }

            // Forced updates for silent clients
            c.authority
                .tick(QuantizedInput::default(), dt, &self.simulator)?;

            // Client applies acknowledgements
            for datagram in c.downlink_rx.receive(now)? {
                self.metrics
                    .bytes_received
                    .fetch_add(datagram.len() as u64, Ordering::Relaxed);
                match protocol::decode::<ServerMessage>(&datagram) {
                    Ok(ack) => {
                        c.client.receive_ack(ack)?;
                    }
                    Err(e) => {
                        warn!("Undecodable ack for client {}: {}", id, e);
                        NetcodeMetrics::incr(&self.metrics.decode_errors);
                    }
                }
            }
        }
        Ok(())
    }

    /// Step `ticks` times and summarise
    pub fn run(&mut self, ticks: u64) -> Result<SessionReport, SessionError> {
        for _ in 0..ticks {
            self.step()?;
        }
        Ok(self.report())
    }

    pub fn report(&self) -> SessionReport {
        let clients = self
            .client_ids()
            .into_iter()
            .filter_map(|id| {
                let c = self.clients.get(&id)?;
                let server = c.authority.server()?;
                let resolver = server.resolver();
                Some(ClientReport {
                    id,
                    clock_scale: c.clock_scale,
                    position_error: c
                        .client
                        .state()
                        .position
                        .distance_sq_to(c.authority.state().position)
                        .sqrt(),
                    pending_moves: c.client.client().map_or(0, |p| p.saved_moves().len()),
                    time_discrepancy: resolver.time_discrepancy(),
                    detections: resolver.detections(),
                    resolving: resolver.is_resolving(),
                    uplink: c.uplink.stats(),
                    downlink: c.downlink.stats(),
                })
            })
            .collect();

        SessionReport {
            ticks: self.tick,
            elapsed: self.now(),
            clients,
        }
    }
}

fn send_datagram(
    link: &mut LinkSender,
    payload: Vec<u8>,
    now: f64,
    metrics: &NetcodeMetrics,
) -> Result<(), LinkError> {
    let len = payload.len() as u64;
    match link.send(payload, now) {
        Ok(()) => {
            metrics.bytes_sent.fetch_add(len, Ordering::Relaxed);
            Ok(())
        }
        Err(LinkError::Full) => {
            warn!("Link full, dropping {} byte datagram", len);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Deterministic control input: cruise with a slow weave, coasting every few seconds
fn scripted_input(t: f32, phase: f32) -> QuantizedInput {
    let forward = if (t * 0.5 + phase).rem_euclid(3.0) < 2.0 { 1.0 } else { 0.0 };
    let steer = (t * 0.7 + phase).sin() * 0.5;
    let strafe = if (t + phase).rem_euclid(5.0) < 1.0 { 0.5 } else { 0.0 };
    QuantizedInput::new(forward, strafe, steer, 0.0, 0)
}
