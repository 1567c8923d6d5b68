//! Impaired in-process datagram link
//!
//! Uses a bounded crossbeam-channel between the sending and receiving ends.
//! The sender applies loss, duplication, lag and reordering as datagrams are
//! submitted; the receiver holds them until their delivery time comes up.

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::trace;

/// Datagrams delivered in one poll; rarely more than a handful per tick
pub type DatagramBatch = SmallVec<[Vec<u8>; 8]>;

/// Network impairment applied to every datagram
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConditions {
    /// One-way delay (seconds)
    pub lag: f64,
    /// Uniform jitter added to the delay, in [-variance, +variance]
    pub lag_variance: f64,
    /// Probability a datagram is dropped
    pub loss: f64,
    /// Probability a datagram is delivered twice
    pub duplicate: f64,
    /// Probability a datagram is held back behind later ones
    pub reorder: f64,
    /// Extra delay applied to a reordered datagram (seconds)
    pub reorder_delay: f64,
}

impl Default for LinkConditions {
    fn default() -> Self {
        Self {
            lag: 0.0,
            lag_variance: 0.0,
            loss: 0.0,
            duplicate: 0.0,
            reorder: 0.0,
            reorder_delay: 0.05,
        }
    }
}

impl LinkConditions {
    pub fn is_perfect(&self) -> bool {
        self.lag <= 0.0
            && self.lag_variance <= 0.0
            && self.loss <= 0.0
            && self.duplicate <= 0.0
            && self.reorder <= 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("link buffer full")]
    Full,
    #[error("link peer disconnected")]
    Disconnected,
}

/// Counters kept by the sending end
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStats {
    pub sent: u64,
    pub dropped: u64,
    pub duplicated: u64,
    pub reordered: u64,
}

#[derive(Debug, Clone)]
struct Datagram {
    deliver_at: f64,
    seq: u64,
    payload: Vec<u8>,
}

/// Create a link. `capacity` bounds the datagrams in flight; `seed` makes
/// the impairment reproducible.
pub fn lossy_link(
    conditions: LinkConditions,
    capacity: usize,
    seed: u64,
) -> (LinkSender, LinkReceiver) {
    let (sender, receiver) = bounded(capacity);
    (
        LinkSender {
            sender,
            conditions,
            rng: StdRng::seed_from_u64(seed),
            next_seq: 0,
            stats: LinkStats::default(),
        },
        LinkReceiver {
            receiver,
            in_flight: Vec::new(),
        },
    )
}

pub struct LinkSender {
    sender: Sender<Datagram>,
    conditions: LinkConditions,
    rng: StdRng,
    next_seq: u64,
    stats: LinkStats,
}

impl LinkSender {
    /// Submit a datagram at time `now`. A dropped datagram is still `Ok`.
    pub fn send(&mut self, payload: Vec<u8>, now: f64) -> Result<(), LinkError> {
        self.stats.sent += 1;
        let c = &self.conditions;

        if c.loss > 0.0 && self.rng.gen_bool(c.loss.min(1.0)) {
            self.stats.dropped += 1;
            trace!("Link dropped datagram of {} bytes", payload.len());
            return Ok(());
        }

        let copies = if c.duplicate > 0.0 && self.rng.gen_bool(c.duplicate.min(1.0)) {
            self.stats.duplicated += 1;
            2
        } else {
            1
        };

        let mut payload = Some(payload);
        for copy in 0..copies {
            let deliver_at = now + self.sample_delay();
            let data = if copy + 1 == copies {
                payload.take().unwrap_or_default()
            } else {
                payload.clone().unwrap_or_default()
            };
            self.push(Datagram {
                deliver_at,
                seq: self.next_seq,
                payload: data,
            })?;
            self.next_seq += 1;
        }
        Ok(())
    }

    fn sample_delay(&mut self) -> f64 {
        let c = &self.conditions;
        let mut delay = c.lag;
        if c.lag_variance > 0.0 {
            delay += self.rng.gen_range(-c.lag_variance..=c.lag_variance);
        }
        if c.reorder > 0.0 && self.rng.gen_bool(c.reorder.min(1.0)) {
            self.stats.reordered += 1;
            delay += c.reorder_delay;
        }
        delay.max(0.0)
    }

    fn push(&self, datagram: Datagram) -> Result<(), LinkError> {
        self.sender.try_send(datagram).map_err(|e| match e {
            TrySendError::Full(_) => LinkError::Full,
            TrySendError::Disconnected(_) => LinkError::Disconnected,
        })
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    pub fn conditions(&self) -> &LinkConditions {
        &self.conditions
    }

    /// Applies to datagrams sent from now on
    pub fn set_conditions(&mut self, conditions: LinkConditions) {
        self.conditions = conditions;
    }
}

pub struct LinkReceiver {
    receiver: Receiver<Datagram>,
    /// Datagrams pulled off the channel but not yet due
    in_flight: Vec<Datagram>,
}

impl LinkReceiver {
    /// Datagrams due at `now`, in delivery order.
    ///
    /// `Disconnected` once the sender is gone and nothing is left in flight.
    pub fn receive(&mut self, now: f64) -> Result<DatagramBatch, LinkError> {
        let mut disconnected = false;
        loop {
            match self.receiver.try_recv() {
                Ok(datagram) => self.in_flight.push(datagram),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    disconnected = true;
                    break;
                }
            }
        }

        if disconnected && self.in_flight.is_empty() {
            return Err(LinkError::Disconnected);
        }

        let (mut due, pending): (Vec<Datagram>, Vec<Datagram>) = std::mem::take(&mut self.in_flight)
            .into_iter()
            .partition(|d| d.deliver_at <= now);
        self.in_flight = pending;
        due.sort_by(|a, b| a.deliver_at.total_cmp(&b.deliver_at).then(a.seq.cmp(&b.seq)));

        Ok(due.into_iter().map(|d| d.payload).collect())
    }

    /// Datagrams not yet delivered, including those still in the channel
    pub fn pending_count(&self) -> usize {
        self.in_flight.len() + self.receiver.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(n: u8) -> Vec<u8> {
        vec![n]
    }

    #[test]
    fn test_perfect_link_delivers_in_order() {
        let (mut tx, mut rx) = lossy_link(LinkConditions::default(), 16, 1);
        for i in 0..5 {
            tx.send(payload(i), 0.0).unwrap();
        }
        let batch = rx.receive(0.0).unwrap();
        assert_eq!(batch.to_vec(), (0..5).map(payload).collect::<Vec<_>>());
        assert_eq!(rx.pending_count(), 0);
    }

    #[test]
    fn test_lag_holds_datagrams() {
        let conditions = LinkConditions {
            lag: 0.1,
            ..Default::default()
        };
        let (mut tx, mut rx) = lossy_link(conditions, 16, 1);
        tx.send(payload(1), 0.0).unwrap();
        assert!(rx.receive(0.05).unwrap().is_empty());
        assert_eq!(rx.pending_count(), 1);
        assert_eq!(rx.receive(0.1).unwrap().len(), 1);
    }

    #[test]
    fn test_total_loss() {
        let conditions = LinkConditions {
            loss: 1.0,
            ..Default::default()
        };
        let (mut tx, mut rx) = lossy_link(conditions, 16, 7);
        for i in 0..10 {
            tx.send(payload(i), 0.0).unwrap();
        }
        assert!(rx.receive(1.0).unwrap().is_empty());
        assert_eq!(tx.stats().dropped, 10);
    }

    #[test]
    fn test_duplication() {
        let conditions = LinkConditions {
            duplicate: 1.0,
            ..Default::default()
        };
        let (mut tx, mut rx) = lossy_link(conditions, 16, 7);
        tx.send(payload(9), 0.0).unwrap();
        assert_eq!(rx.receive(0.0).unwrap().to_vec(), vec![payload(9), payload(9)]);
    }

    #[test]
    fn test_reorder_delivers_later() {
        let conditions = LinkConditions {
            reorder: 1.0,
            reorder_delay: 0.05,
            ..Default::default()
        };
        let (mut tx, mut rx) = lossy_link(conditions, 16, 3);
        tx.send(payload(1), 0.0).unwrap();
        assert!(rx.receive(0.01).unwrap().is_empty());
        assert_eq!(rx.receive(0.05).unwrap().to_vec(), vec![payload(1)]);
        assert_eq!(tx.stats().reordered, 1);
    }

    #[test]
    fn test_seeded_links_are_reproducible() {
        let conditions = LinkConditions {
            lag: 0.05,
            lag_variance: 0.04,
            loss: 0.3,
            duplicate: 0.1,
            reorder: 0.2,
            ..Default::default()
        };
        let run = || {
            let (mut tx, mut rx) = lossy_link(conditions.clone(), 256, 42);
            for i in 0..100 {
                tx.send(payload(i), i as f64 * 0.01).unwrap();
            }
            rx.receive(10.0).unwrap().to_vec()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_full_and_disconnected() {
        let (mut tx, mut rx) = lossy_link(LinkConditions::default(), 1, 0);
        tx.send(payload(1), 0.0).unwrap();
        assert_eq!(tx.send(payload(2), 0.0), Err(LinkError::Full));

        drop(tx);
        assert_eq!(rx.receive(0.0).unwrap().len(), 1);
        assert_eq!(rx.receive(0.0), Err(LinkError::Disconnected));
    }
}
