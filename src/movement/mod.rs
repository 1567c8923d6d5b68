//! Predicted physics-pawn movement: client prediction, authority
//! reconciliation and replay after correction.

pub mod client;
pub mod input;
pub mod pawn;
pub mod replay;
pub mod saved_move;
pub mod server;
pub mod simulator;
pub mod snapshot;

use serde::{Deserialize, Serialize};

use crate::movement::input::QuantizedInput;

/// One simulation step to run: the caller feeds this to a
/// [`simulator::MovementSimulator`] and hands the result back to the pawn.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepRequest {
    pub input: QuantizedInput,
    pub delta_time: f64,
}

pub use client::{AckOutcome, ClientPredictionState};
pub use pawn::{MovementError, NetRole, OutgoingMessage, PawnMovement};
pub use saved_move::SavedMove;
pub use server::{ServerMoveOutcome, ServerReconciliationState};
pub use snapshot::KinematicSnapshot;
