//! Pawn Netcode Library
//!
//! Client-side prediction and server reconciliation for physics-driven pawns,
//! with movement time discrepancy detection against speed hacks.
//!
//! # Features
//!
//! - `metrics_extended` - Correction distance percentiles in the metrics registry
//!   (enabled by default)

pub mod config;
pub mod util;
pub mod movement;
pub mod anticheat;
pub mod net;
pub mod sim;
pub mod metrics;
