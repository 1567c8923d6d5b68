//! Prometheus-compatible netcode metrics
//!
//! Counters for the prediction/reconciliation protocol, shared by every pawn
//! in a process. Default endpoint: http://localhost:9090/metrics

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[cfg(feature = "metrics_extended")]
use parking_lot::RwLock;
#[cfg(feature = "metrics_extended")]
use std::collections::VecDeque;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

#[cfg(feature = "metrics_extended")]
const CORRECTION_HISTORY: usize = 1000;

/// Metrics registry for prediction and reconciliation
#[derive(Debug)]
pub struct NetcodeMetrics {
    // Client side
    pub moves_sent: AtomicU64,
    pub important_moves: AtomicU64,
    pub acks_good_received: AtomicU64,
    pub acks_bad_received: AtomicU64,
    pub acks_unmatched: AtomicU64,
    pub replays: AtomicU64,
    pub replayed_moves: AtomicU64,
    pub buffer_overflows: AtomicU64,
    pub pending_moves: AtomicU64,

    // Authority side
    pub moves_received: AtomicU64,
    pub moves_rejected: AtomicU64,
    pub moves_skipped: AtomicU64,
    pub timestamp_resets: AtomicU64,
    pub acks_good_sent: AtomicU64,
    pub acks_bad_sent: AtomicU64,
    pub discrepancy_detections: AtomicU64,
    pub forced_updates: AtomicU64,
    /// Worst outstanding time discrepancy, microseconds
    pub time_discrepancy_us: AtomicU64,

    // Wire
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub decode_errors: AtomicU64,

    // Correction distance (world units x 100)
    pub correction_p95: AtomicU64,
    pub correction_max: AtomicU64,

    start_time: Instant,

    #[cfg(feature = "metrics_extended")]
    correction_history: RwLock<VecDeque<f32>>,
}

impl NetcodeMetrics {
    pub fn new() -> Self {
        Self {
            moves_sent: AtomicU64::new(0),
            important_moves: AtomicU64::new(0),
            acks_good_received: AtomicU64::new(0),
            acks_bad_received: AtomicU64::new(0),
            acks_unmatched: AtomicU64::new(0),
            replays: AtomicU64::new(0),
            replayed_moves: AtomicU64::new(0),
            buffer_overflows: AtomicU64::new(0),
            pending_moves: AtomicU64::new(0),
            moves_received: AtomicU64::new(0),
            moves_rejected: AtomicU64::new(0),
            moves_skipped: AtomicU64::new(0),
            timestamp_resets: AtomicU64::new(0),
            acks_good_sent: AtomicU64::new(0),
            acks_bad_sent: AtomicU64::new(0),
            discrepancy_detections: AtomicU64::new(0),
            forced_updates: AtomicU64::new(0),
            time_discrepancy_us: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            correction_p95: AtomicU64::new(0),
            correction_max: AtomicU64::new(0),
            start_time: Instant::now(),
            #[cfg(feature = "metrics_extended")]
            correction_history: RwLock::new(VecDeque::with_capacity(CORRECTION_HISTORY)),
        }
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record how far a correction moved the client
    pub fn record_correction(&self, distance: f32) {
        let scaled = (distance.max(0.0) * 100.0) as u64;
        self.correction_max.fetch_max(scaled, Ordering::Relaxed);

        #[cfg(feature = "metrics_extended")]
        {
            let mut history = self.correction_history.write();
            history.push_back(distance);
            while history.len() > CORRECTION_HISTORY {
                history.pop_front();
            }

            if history.len() >= 10 {
                let mut sorted: Vec<f32> = history.iter().copied().collect();
                sorted.sort_unstable_by(|a, b| a.total_cmp(b));
                let p95_idx = ((sorted.len() as f32 * 0.95) as usize).min(sorted.len() - 1);
                self.correction_p95
                    .store((sorted[p95_idx] * 100.0) as u64, Ordering::Relaxed);
            }
        }
    }

    /// Track the outstanding discrepancy of a resolving pawn (seconds)
    pub fn record_time_discrepancy(&self, seconds: f64) {
        let us = (seconds.max(0.0) * 1_000_000.0) as u64;
        self.time_discrepancy_us.store(us, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        // Client
        metric!("pawn_netcode_moves_sent_total", "Moves sent to the authority", "counter",
            self.moves_sent.load(Ordering::Relaxed));
        metric!("pawn_netcode_important_moves_total", "Moves whose input changed since the last ack", "counter",
            self.important_moves.load(Ordering::Relaxed));
        metric!("pawn_netcode_acks_good_received_total", "Good acknowledgements applied", "counter",
            self.acks_good_received.load(Ordering::Relaxed));
        metric!("pawn_netcode_acks_bad_received_total", "Corrections applied", "counter",
            self.acks_bad_received.load(Ordering::Relaxed));
        metric!("pawn_netcode_acks_unmatched_total", "Acknowledgements for unknown moves", "counter",
            self.acks_unmatched.load(Ordering::Relaxed));
        metric!("pawn_netcode_replays_total", "Replays after a correction", "counter",
            self.replays.load(Ordering::Relaxed));
        metric!("pawn_netcode_replayed_moves_total", "Moves re-simulated by replays", "counter",
            self.replayed_moves.load(Ordering::Relaxed));
        metric!("pawn_netcode_buffer_overflows_total", "Saved-move buffers discarded for being full", "counter",
            self.buffer_overflows.load(Ordering::Relaxed));
        metric!("pawn_netcode_pending_moves", "Unacknowledged moves buffered", "gauge",
            self.pending_moves.load(Ordering::Relaxed));

        // Authority
        metric!("pawn_netcode_moves_received_total", "Moves received from clients", "counter",
            self.moves_received.load(Ordering::Relaxed));
        metric!("pawn_netcode_moves_rejected_total", "Moves dropped for stale or implausible timestamps", "counter",
            self.moves_rejected.load(Ordering::Relaxed));
        metric!("pawn_netcode_moves_skipped_total", "Moves accepted but not simulated", "counter",
            self.moves_skipped.load(Ordering::Relaxed));
        metric!("pawn_netcode_timestamp_resets_total", "Client timestamp resets detected", "counter",
            self.timestamp_resets.load(Ordering::Relaxed));
        metric!("pawn_netcode_acks_good_sent_total", "Good acknowledgements sent", "counter",
            self.acks_good_sent.load(Ordering::Relaxed));
        metric!("pawn_netcode_acks_bad_sent_total", "Corrections sent", "counter",
            self.acks_bad_sent.load(Ordering::Relaxed));
        metric!("pawn_netcode_discrepancy_detections_total", "Movement time discrepancies detected", "counter",
            self.discrepancy_detections.load(Ordering::Relaxed));
        metric!("pawn_netcode_forced_updates_total", "Forced position updates", "counter",
            self.forced_updates.load(Ordering::Relaxed));
        metric!("pawn_netcode_time_discrepancy_microseconds", "Outstanding time discrepancy", "gauge",
            self.time_discrepancy_us.load(Ordering::Relaxed));

        // Wire
        metric!("pawn_netcode_bytes_sent_total", "Total bytes sent", "counter",
            self.bytes_sent.load(Ordering::Relaxed));
        metric!("pawn_netcode_bytes_received_total", "Total bytes received", "counter",
            self.bytes_received.load(Ordering::Relaxed));
        metric!("pawn_netcode_decode_errors_total", "Datagrams that failed to decode", "counter",
            self.decode_errors.load(Ordering::Relaxed));

        metric!("pawn_netcode_correction_distance_p95", "95th percentile correction distance (x100)", "gauge",
            self.correction_p95.load(Ordering::Relaxed));
        metric!("pawn_netcode_correction_distance_max", "Largest correction distance (x100)", "gauge",
            self.correction_max.load(Ordering::Relaxed));
        metric!("pawn_netcode_uptime_seconds", "Uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// Generate JSON format metrics
    pub fn to_json(&self) -> String {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let value = serde_json::json!({
            "client": {
                "moves_sent": load(&self.moves_sent),
                "important_moves": load(&self.important_moves),
                "acks_good_received": load(&self.acks_good_received),
                "acks_bad_received": load(&self.acks_bad_received),
                "acks_unmatched": load(&self.acks_unmatched),
                "replays": load(&self.replays),
                "replayed_moves": load(&self.replayed_moves),
                "buffer_overflows": load(&self.buffer_overflows),
                "pending_moves": load(&self.pending_moves),
            },
            "authority": {
                "moves_received": load(&self.moves_received),
                "moves_rejected": load(&self.moves_rejected),
                "moves_skipped": load(&self.moves_skipped),
                "timestamp_resets": load(&self.timestamp_resets),
                "acks_good_sent": load(&self.acks_good_sent),
                "acks_bad_sent": load(&self.acks_bad_sent),
                "discrepancy_detections": load(&self.discrepancy_detections),
                "forced_updates": load(&self.forced_updates),
                "time_discrepancy_us": load(&self.time_discrepancy_us),
            },
            "network": {
                "bytes_sent": load(&self.bytes_sent),
                "bytes_received": load(&self.bytes_received),
                "decode_errors": load(&self.decode_errors),
            },
            "corrections": {
                "distance_p95": load(&self.correction_p95) as f64 / 100.0,
                "distance_max": load(&self.correction_max) as f64 / 100.0,
            },
            "uptime_seconds": self.uptime_seconds(),
        });
        serde_json::to_string_pretty(&value).unwrap_or_default()
    }
}

impl Default for NetcodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(metrics: Arc<NetcodeMetrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);
                    let response = route(&metrics, &request);
                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}

fn route(metrics: &NetcodeMetrics, request: &str) -> String {
    let respond = |content_type: &str, body: &str| {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            content_type,
            body.len(),
            body
        )
    };

    if request.starts_with("GET /metrics/json") || request.starts_with("GET /json") {
        respond("application/json", &metrics.to_json())
    } else if request.starts_with("GET /metrics") {
        respond("text/plain; version=0.0.4", &metrics.to_prometheus())
    } else if request.starts_with("GET /health") || request.starts_with("GET / ") {
        respond("text/plain", "OK")
    } else {
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
    }
}
