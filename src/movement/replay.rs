//! Replay of unacknowledged moves after a correction

use tracing::debug;

use crate::movement::client::ClientPredictionState;
use crate::movement::simulator::MovementSimulator;
use crate::movement::snapshot::KinematicSnapshot;

/// Re-simulate every buffered move, oldest first, starting from `state`
/// (already snapped to the authority's correction).
///
/// Each move's start and end snapshots are rewritten along the way and
/// `state` ends at the newest prediction. Does nothing unless a correction
/// requested a replay. Returns the number of moves replayed.
pub fn replay_saved_moves<S>(
    client: &mut ClientPredictionState,
    state: &mut KinematicSnapshot,
    simulator: &S,
) -> usize
where
    S: MovementSimulator + ?Sized,
{
    if !client.take_replay_request() {
        return 0;
    }

    let moves = client.saved_moves_mut();
    if moves.is_empty() {
        return 0;
    }

    for mv in moves.iter_mut() {
        mv.pre_update(state);
        *state = simulator.simulate(state, &mv.input, mv.delta_time);
        mv.post_update(state);
    }

    debug!("Replayed {} moves", moves.len());
    moves.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MovementConfig;
    use crate::movement::input::QuantizedInput;
    use crate::util::math::{Quat, Vec3};
    use std::cell::RefCell;

    /// Moves +1 on x per second of input and records the order of calls
    struct RecordingSim {
        calls: RefCell<Vec<f64>>,
    }

    impl MovementSimulator for RecordingSim {
        fn simulate(
            &self,
            state: &KinematicSnapshot,
            input: &QuantizedInput,
            delta_time: f64,
        ) -> KinematicSnapshot {
            self.calls.borrow_mut().push(delta_time);
            let mut next = *state;
            next.position.x += input.forward * delta_time as f32;
            next
        }
    }

    fn buffered_client(deltas: &[f64]) -> ClientPredictionState {
        let mut client = ClientPredictionState::new(&MovementConfig::default());
        let input = QuantizedInput::new(1.0, 0.0, 0.0, 0.0, 0);
        for dt in deltas {
            client.begin_move(input, *dt, &KinematicSnapshot::default());
            client.finish_move(&KinematicSnapshot::default());
        }
        client
    }

    #[test]
    fn test_no_replay_without_request() {
        let mut client = buffered_client(&[0.01, 0.02]);
        let sim = RecordingSim { calls: RefCell::new(Vec::new()) };
        let mut state = KinematicSnapshot::default();
        assert_eq!(replay_saved_moves(&mut client, &mut state, &sim), 0);
        assert!(sim.calls.borrow().is_empty());
    }

    #[test]
    fn test_replay_in_timestamp_order_from_correction() {
        let mut client = buffered_client(&[0.01, 0.02, 0.03, 0.04]);
        let first = client.saved_moves()[0].timestamp;

        let authoritative = KinematicSnapshot::at_rest(Vec3::new(100.0, 0.0, 0.0), Quat::IDENTITY);
        let mut state = KinematicSnapshot::default();
        client.handle_ack_bad(first, &authoritative, &mut state);

        let sim = RecordingSim { calls: RefCell::new(Vec::new()) };
        assert_eq!(replay_saved_moves(&mut client, &mut state, &sim), 3);

        let expected: Vec<f64> = client.saved_moves().iter().map(|m| m.delta_time).collect();
        assert_eq!(*sim.calls.borrow(), expected);
        assert_eq!(client.saved_moves()[0].start.position.x, 100.0);
        for pair in client.saved_moves().iter().collect::<Vec<_>>().windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert_eq!(client.saved_moves().back().unwrap().end, state);
        assert!(!client.needs_replay());
    }

    #[test]
    fn test_replay_with_empty_buffer_clears_flag() {
        let mut client = buffered_client(&[0.01]);
        let only = client.saved_moves()[0].timestamp;
        let mut state = KinematicSnapshot::default();
        client.handle_ack_bad(only, &KinematicSnapshot::default(), &mut state);
        assert!(client.needs_replay());

        let sim = RecordingSim { calls: RefCell::new(Vec::new()) };
        assert_eq!(replay_saved_moves(&mut client, &mut state, &sim), 0);
        assert!(!client.needs_replay());
    }
}
