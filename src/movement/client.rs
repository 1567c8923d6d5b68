//! Client-side prediction data: the saved-move buffer, its free-list pool,
//! the running move clock and acknowledgement handling.

use std::collections::VecDeque;

use tracing::{debug, info, trace, warn};

use crate::config::MovementConfig;
use crate::movement::input::QuantizedInput;
use crate::movement::snapshot::KinematicSnapshot;
use crate::movement::saved_move::SavedMove;

/// Result of applying an acknowledgement from the authority
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AckOutcome {
    /// Moves up to and including the acked one were released
    Acknowledged { released: usize },
    /// As `Acknowledged`, and local state was snapped to the authority's; a
    /// replay is pending
    Corrected { released: usize },
    /// No buffered move matched (late, duplicate or already superseded)
    Unmatched,
}

/// Everything the predicting client needs to buffer, acknowledge and replay moves
#[derive(Debug)]
pub struct ClientPredictionState {
    /// Unacknowledged moves, oldest first
    saved_moves: VecDeque<SavedMove>,
    /// Released moves kept for reuse
    free_moves: Vec<SavedMove>,
    /// Move being built between the pre and post simulation phases
    current_move: Option<SavedMove>,
    last_acked_move: Option<SavedMove>,
    current_timestamp: f64,
    needs_replay: bool,
    overflow_count: u64,

    reset_threshold: f64,
    max_saved_moves: usize,
    max_free_moves: usize,
    max_move_delta_time: f64,
}

impl ClientPredictionState {
    pub fn new(config: &MovementConfig) -> Self {
        Self {
            saved_moves: VecDeque::with_capacity(config.max_saved_moves),
            free_moves: Vec::with_capacity(config.max_free_moves),
            current_move: None,
            last_acked_move: None,
            current_timestamp: 0.0,
            needs_replay: false,
            overflow_count: 0,
            reset_threshold: config.reset_threshold,
            max_saved_moves: config.max_saved_moves,
            max_free_moves: config.max_free_moves,
            max_move_delta_time: config.max_move_delta_time,
        }
    }

    /// Get a cleared move, from the pool if one is available.
    ///
    /// A full buffer is discarded in its entirety first: with that many
    /// unacknowledged moves the connection is timing out or badly lagged and
    /// only a correction will recover it.
    pub fn create_move(&mut self) -> SavedMove {
        if self.saved_moves.len() >= self.max_saved_moves {
            warn!(
                "Hit limit of {} saved moves (timing out or very bad ping?), discarding buffer",
                self.saved_moves.len()
            );
            self.overflow_count += 1;
            while let Some(mv) = self.saved_moves.pop_front() {
                self.free_move(mv);
            }
        }

        match self.free_moves.pop() {
            Some(mut mv) => {
                mv.clear();
                mv
            }
            None => SavedMove::default(),
        }
    }

    /// Append a completed move to the buffer
    pub fn push_move(&mut self, mv: SavedMove) {
        debug_assert!(
            self.saved_moves
                .back()
                .map_or(true, |last| last.invalidated_by_reset || last.timestamp < mv.timestamp),
            "saved moves must have increasing timestamps"
        );
        self.saved_moves.push_back(mv);
    }

    /// Return a move to the pool; moves beyond the pool's capacity are dropped
    pub fn free_move(&mut self, mv: SavedMove) {
        if self.free_moves.len() < self.max_free_moves {
            self.free_moves.push(mv);
        }
    }

    /// Release every move up to and including `index`. The move at `index`
    /// becomes the last acknowledged move; the one it replaces goes back to
    /// the pool. Returns the number of moves removed from the buffer.
    pub fn acknowledge(&mut self, index: usize) -> usize {
        if index >= self.saved_moves.len() {
            return 0;
        }

        for _ in 0..index {
            if let Some(expired) = self.saved_moves.pop_front() {
                self.free_move(expired);
            }
        }

        let acked = self.saved_moves.pop_front();
        if let Some(previous) = std::mem::replace(&mut self.last_acked_move, acked) {
            self.free_move(previous);
        }
        index + 1
    }

    /// Index of the buffered move stamped `timestamp`.
    ///
    /// Timestamps at or before the last acknowledged move are never found,
    /// unless that move predates a clock reset.
    pub fn find_index_by_timestamp(&self, timestamp: f64) -> Option<usize> {
        if self.saved_moves.is_empty() {
            return None;
        }
        if let Some(acked) = &self.last_acked_move {
            if !acked.invalidated_by_reset && timestamp <= acked.timestamp {
                return None;
            }
        }
        self.saved_moves.iter().position(|mv| mv.timestamp == timestamp)
    }

    /// Advance the move clock by `raw_delta_time` and return this move's delta.
    ///
    /// The authority derives a move's delta by subtracting consecutive
    /// timestamps, so the client does the same whenever a previous move is
    /// buffered; both sides then simulate with identical numbers.
    pub fn update_timestamp_and_delta_time(&mut self, raw_delta_time: f64) -> f64 {
        if self.current_timestamp > self.reset_threshold {
            info!("Resetting client timestamp {:.3}", self.current_timestamp);
            self.current_timestamp = 0.0;
            for mv in self.saved_moves.iter_mut() {
                mv.invalidated_by_reset = true;
            }
            if let Some(acked) = self.last_acked_move.as_mut() {
                acked.invalidated_by_reset = true;
            }
        }

        self.current_timestamp += raw_delta_time;

        let delta_time = match self.saved_moves.back() {
            Some(previous) if !previous.invalidated_by_reset => {
                self.current_timestamp - previous.timestamp
            }
            _ => raw_delta_time,
        };
        delta_time.min(self.max_move_delta_time)
    }

    /// Open a new move before simulating: stamp it and capture the start state.
    /// Returns the delta time the move must be simulated with.
    pub fn begin_move(
        &mut self,
        input: QuantizedInput,
        raw_delta_time: f64,
        state: &KinematicSnapshot,
    ) -> f64 {
        let mut mv = self.create_move();
        let delta_time = self.update_timestamp_and_delta_time(raw_delta_time);

        mv.pre_update(state);
        mv.timestamp = self.current_timestamp;
        mv.delta_time = delta_time;
        mv.input = input;
        trace!("Begin move ts={:.4} dt={:.4} {}", mv.timestamp, delta_time, input);

        self.current_move = Some(mv);
        delta_time
    }

    /// Close the open move with the simulated result and buffer it.
    /// Returns a reference to the buffered move, or `None` if no move was open.
    pub fn finish_move(&mut self, state: &KinematicSnapshot) -> Option<&SavedMove> {
        let mut mv = self.current_move.take()?;
        mv.post_update(state);
        self.push_move(mv);
        self.saved_moves.back()
    }

    /// Apply `ClientAckGoodMove`
    pub fn handle_ack_good(&mut self, timestamp: f64) -> AckOutcome {
        match self.find_index_by_timestamp(timestamp) {
            Some(index) => AckOutcome::Acknowledged {
                released: self.acknowledge(index),
            },
            None => {
                debug!("Good ack for unknown move ts={:.4}", timestamp);
                AckOutcome::Unmatched
            }
        }
    }

    /// Apply `ClientAckBadMove`: acknowledge, snap `state` to the authority's
    /// snapshot and request a replay of the moves still buffered.
    pub fn handle_ack_bad(
        &mut self,
        timestamp: f64,
        authoritative: &KinematicSnapshot,
        state: &mut KinematicSnapshot,
    ) -> AckOutcome {
        let Some(index) = self.find_index_by_timestamp(timestamp) else {
            debug!("Bad ack for unknown move ts={:.4}, ignoring", timestamp);
            return AckOutcome::Unmatched;
        };

        let released = self.acknowledge(index);
        *state = *authoritative;
        self.needs_replay = true;
        debug!(
            "Corrected at ts={:.4}, {} moves pending replay",
            timestamp,
            self.saved_moves.len()
        );
        AckOutcome::Corrected { released }
    }

    pub fn saved_moves(&self) -> &VecDeque<SavedMove> {
        &self.saved_moves
    }

    pub(crate) fn saved_moves_mut(&mut self) -> &mut VecDeque<SavedMove> {
        &mut self.saved_moves
    }

    pub fn last_acked_move(&self) -> Option<&SavedMove> {
        self.last_acked_move.as_ref()
    }

    pub fn current_move(&self) -> Option<&SavedMove> {
        self.current_move.as_ref()
    }

    pub fn current_timestamp(&self) -> f64 {
        self.current_timestamp
    }

    pub fn free_move_count(&self) -> usize {
        self.free_moves.len()
    }

    pub fn needs_replay(&self) -> bool {
        self.needs_replay
    }

    /// Clear the replay request, returning whether one was pending
    pub(crate) fn take_replay_request(&mut self) -> bool {
        std::mem::take(&mut self.needs_replay)
    }

    /// Number of times the buffer was discarded for being full
    pub fn overflow_count(&self) -> u64 {
        self.overflow_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::math::{Quat, Vec3};

    fn config(max_saved_moves: usize, reset_threshold: f64) -> MovementConfig {
        MovementConfig {
            max_saved_moves,
            reset_threshold,
            ..Default::default()
        }
    }

    fn at(x: f32) -> KinematicSnapshot {
        KinematicSnapshot::at_rest(Vec3::new(x, 0.0, 0.0), Quat::IDENTITY)
    }

    /// Run one full move through the buffer and return its timestamp
    fn step(client: &mut ClientPredictionState, dt: f64) -> f64 {
        let input = QuantizedInput::new(1.0, 0.0, 0.0, 0.0, 0);
        client.begin_move(input, dt, &at(0.0));
        client.finish_move(&at(1.0)).map(|mv| mv.timestamp).unwrap()
    }

    #[test]
    fn test_moves_buffered_in_order() {
        let mut client = ClientPredictionState::new(&MovementConfig::default());
        let stamps: Vec<f64> = (0..5).map(|_| step(&mut client, 0.02)).collect();

        assert_eq!(client.saved_moves().len(), 5);
        for (i, ts) in stamps.iter().enumerate() {
            assert_eq!(client.find_index_by_timestamp(*ts), Some(i));
        }
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(client.find_index_by_timestamp(123.0), None);
    }

    #[test]
    fn test_acknowledge_removes_prefix() {
        let mut client = ClientPredictionState::new(&MovementConfig::default());
        let stamps: Vec<f64> = (0..6).map(|_| step(&mut client, 0.02)).collect();

        assert_eq!(client.acknowledge(2), 3);
        assert_eq!(client.saved_moves().len(), 3);
        assert_eq!(client.last_acked_move().map(|m| m.timestamp), Some(stamps[2]));
        assert_eq!(client.free_move_count(), 2);

        for ts in &stamps[..3] {
            assert_eq!(client.find_index_by_timestamp(*ts), None);
        }
        assert_eq!(client.find_index_by_timestamp(stamps[3]), Some(0));
    }

    #[test]
    fn test_acknowledge_out_of_range_is_noop() {
        let mut client = ClientPredictionState::new(&MovementConfig::default());
        step(&mut client, 0.02);
        assert_eq!(client.acknowledge(5), 0);
        assert_eq!(client.saved_moves().len(), 1);
        assert!(client.last_acked_move().is_none());
    }

    #[test]
    fn test_free_pool_is_bounded() {
        let mut client = ClientPredictionState::new(&MovementConfig::default());
        for _ in 0..60 {
            step(&mut client, 0.01);
        }
        client.acknowledge(58);
        assert_eq!(client.free_move_count(), 32);
        assert_eq!(client.saved_moves().len(), 1);
    }

    #[test]
    fn test_pooled_moves_are_cleared() {
        let mut client = ClientPredictionState::new(&MovementConfig::default());
        step(&mut client, 0.02);
        step(&mut client, 0.02);
        client.acknowledge(1);
        let mv = client.create_move();
        assert_eq!(mv, SavedMove::default());
    }

    #[test]
    fn test_overflow_discards_entire_buffer() {
        let mut client = ClientPredictionState::new(&config(4, 240.0));
        for _ in 0..4 {
            step(&mut client, 0.02);
        }
        assert_eq!(client.saved_moves().len(), 4);

        let _ = client.create_move();
        assert!(client.saved_moves().is_empty());
        assert_eq!(client.overflow_count(), 1);
    }

    #[test]
    fn test_overflow_keeps_only_the_new_move() {
        let mut client = ClientPredictionState::new(&config(4, 240.0));
        for _ in 0..5 {
            step(&mut client, 0.02);
        }
        assert_eq!(client.saved_moves().len(), 1);
    }

    #[test]
    fn test_delta_time_derived_from_timestamps() {
        let mut client = ClientPredictionState::new(&MovementConfig::default());
        let first = client.update_timestamp_and_delta_time(0.016);
        assert_eq!(first, 0.016);
        step(&mut client, 0.0);

        let previous = client.saved_moves().back().map(|m| m.timestamp).unwrap();
        let dt = client.update_timestamp_and_delta_time(0.02);
        assert_eq!(dt, client.current_timestamp() - previous);
    }

    #[test]
    fn test_delta_time_clamped() {
        let mut client = ClientPredictionState::new(&MovementConfig::default());
        step(&mut client, 0.02);
        assert_eq!(client.update_timestamp_and_delta_time(0.5), 0.125);
    }

    #[test]
    fn test_timestamp_reset_invalidates_history() {
        let mut client = ClientPredictionState::new(&config(96, 1.0));
        let stamps: Vec<f64> = (0..4).map(|_| step(&mut client, 0.3)).collect();
        client.acknowledge(1);
        assert!(client.current_timestamp() > 1.0);

        let after_reset = step(&mut client, 0.3);
        assert!(after_reset < stamps[1]);
        assert!(client.last_acked_move().unwrap().invalidated_by_reset);
        assert!(client.saved_moves()[0].invalidated_by_reset);
        assert!(!client.saved_moves()[2].invalidated_by_reset);

        // Post-reset stamp is below the last ack but must still be found
        assert_eq!(client.find_index_by_timestamp(after_reset), Some(2));
        // The first move after a reset uses the raw delta
        assert_eq!(client.saved_moves()[2].delta_time, 0.3);
    }

    #[test]
    fn test_good_ack() {
        let mut client = ClientPredictionState::new(&MovementConfig::default());
        let ts = step(&mut client, 0.02);
        step(&mut client, 0.02);

        assert_eq!(client.handle_ack_good(ts), AckOutcome::Acknowledged { released: 1 });
        assert_eq!(client.handle_ack_good(ts), AckOutcome::Unmatched);
        assert!(!client.needs_replay());
    }

    #[test]
    fn test_bad_ack_snaps_and_requests_replay() {
        let mut client = ClientPredictionState::new(&MovementConfig::default());
        let ts = step(&mut client, 0.02);
        step(&mut client, 0.02);

        let mut state = at(1.0);
        let outcome = client.handle_ack_bad(ts, &at(7.5), &mut state);
        assert_eq!(outcome, AckOutcome::Corrected { released: 1 });
        assert_eq!(state, at(7.5));
        assert!(client.needs_replay());
        assert!(client.take_replay_request());
        assert!(!client.needs_replay());
    }

    #[test]
    fn test_unmatched_bad_ack_is_ignored() {
        let mut client = ClientPredictionState::new(&MovementConfig::default());
        step(&mut client, 0.02);

        let mut state = at(1.0);
        assert_eq!(client.handle_ack_bad(99.0, &at(7.5), &mut state), AckOutcome::Unmatched);
        assert_eq!(state, at(1.0));
        assert!(!client.needs_replay());
    }

    #[test]
    fn test_finish_without_begin() {
        let mut client = ClientPredictionState::new(&MovementConfig::default());
        assert!(client.finish_move(&at(0.0)).is_none());
        assert!(client.saved_moves().is_empty());
    }
}
