use serde::{Deserialize, Serialize};

use crate::movement::input::QuantizedInput;
use crate::movement::snapshot::KinematicSnapshot;

/// One predicted move: the input applied, for how long, and the state on
/// either side of the simulation step.
///
/// A move is identified by its timestamp, which is unique and strictly
/// increasing within a client session until the next timestamp reset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SavedMove {
    pub timestamp: f64,
    pub delta_time: f64,
    pub input: QuantizedInput,
    pub start: KinematicSnapshot,
    pub end: KinematicSnapshot,
    /// Never merge this move with a neighbour when sending
    pub force_no_combine: bool,
    /// The client clock was reset after this move was stamped
    pub invalidated_by_reset: bool,
}

impl SavedMove {
    /// Restore every field to its default so a pooled move can be reused
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Capture the state before simulating
    #[inline]
    pub fn pre_update(&mut self, state: &KinematicSnapshot) {
        self.start = *state;
    }

    /// Capture the state after simulating
    #[inline]
    pub fn post_update(&mut self, state: &KinematicSnapshot) {
        self.end = *state;
    }

    /// A move whose input differs from the last acknowledged move
    pub fn is_important_move(&self, last_acked: Option<&SavedMove>) -> bool {
        match last_acked {
            Some(acked) => self.input != acked.input,
            None => true,
        }
    }

    pub fn can_combine_with(&self, other: &SavedMove) -> bool {
        if self.force_no_combine || other.force_no_combine {
            return false;
        }
        self.input == other.input
    }
}
