//! Outstanding packet tracking and retransmission.
//!
//! Every DATA, END and MESSAGE packet stays in the [`RetransmitQueue`] until
//! the peer acknowledges it. Ordered packets are released by the cumulative
//! ack carried in every inbound packet; messages are released one by one by
//! MESSAGE_ACK packets.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::core::Packet;

/// One packet awaiting acknowledgment.
#[derive(Debug, Clone)]
pub struct Pending {
    /// Copy of the packet for retransmission.
    pub packet: Packet,
    /// When the packet was last put on the wire.
    pub sent_at: Instant,
    /// Number of retransmissions so far.
    pub retransmit_count: u32,
    /// Current retransmission timeout.
    pub rto: Duration,
}

impl Pending {
    /// Track a freshly sent packet.
    pub fn new(packet: Packet, now: Instant, rto: Duration) -> Self {
        Self {
            packet,
            sent_at: now,
            retransmit_count: 0,
            rto,
        }
    }

    /// When the packet must be retransmitted.
    pub fn deadline(&self) -> Instant {
        self.sent_at + self.rto
    }

    /// Check if retransmission is needed.
    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.deadline()
    }

    /// Mark as retransmitted with exponential backoff.
    pub fn retransmit(&mut self, now: Instant, backoff_multiplier: u32, max_rto: Duration) {
        self.sent_at = now;
        self.retransmit_count += 1;
        self.rto = (self.rto * backoff_multiplier).min(max_rto);
    }

    /// RTT sample for this packet, if it was never retransmitted (Karn).
    fn rtt_sample(&self, now: Instant) -> Option<Duration> {
        (self.retransmit_count == 0).then(|| now.saturating_duration_since(self.sent_at))
    }
}

/// Outcome of polling the queue for expired packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetransmitPoll {
    /// Nothing is due.
    Idle,
    /// These packets must go back on the wire.
    Resend(Vec<Packet>),
    /// A packet expired after exhausting its retransmit budget.
    Exhausted {
        /// Retransmissions attempted for the packet that gave up.
        retransmits: u32,
    },
}

/// Per-stream set of unacknowledged packets.
#[derive(Debug)]
pub struct RetransmitQueue {
    /// Ordered packets keyed by stream sequence.
    ordered: BTreeMap<u32, Pending>,
    /// Messages keyed by message sequence.
    messages: BTreeMap<u32, Pending>,
    backoff_multiplier: u32,
    max_retransmits: u32,
    max_rto: Duration,
}

impl RetransmitQueue {
    /// Create an empty queue.
    pub fn new(backoff_multiplier: u32, max_retransmits: u32, max_rto: Duration) -> Self {
        Self {
            ordered: BTreeMap::new(),
            messages: BTreeMap::new(),
            backoff_multiplier,
            max_retransmits,
            max_rto,
        }
    }

    /// Register a sent DATA or END packet.
    pub fn register_ordered(&mut self, packet: Packet, now: Instant, rto: Duration) {
        self.ordered
            .entry(packet.seq)
            .or_insert_with(|| Pending::new(packet, now, rto));
    }

    /// Register a sent MESSAGE packet.
    pub fn register_message(&mut self, packet: Packet, now: Instant, rto: Duration) {
        self.messages
            .entry(packet.seq)
            .or_insert_with(|| Pending::new(packet, now, rto));
    }

    /// Release every ordered packet below the cumulative ack.
    ///
    /// Returns an RTT sample taken from the newest released packet that was
    /// never retransmitted.
    pub fn ack_ordered(&mut self, cumulative: u32, now: Instant) -> Option<Duration> {
        let still_pending = self.ordered.split_off(&cumulative);
        let released = std::mem::replace(&mut self.ordered, still_pending);

        released
            .values()
            .rev()
            .find_map(|pending| pending.rtt_sample(now))
    }

    /// Release one message.
    pub fn ack_message(&mut self, seq: u32, now: Instant) -> Option<Duration> {
        self.messages
            .remove(&seq)
            .and_then(|pending| pending.rtt_sample(now))
    }

    /// Collect packets whose timeout has expired and back them off.
    pub fn poll(&mut self, now: Instant) -> RetransmitPoll {
        let all = self.ordered.values().chain(self.messages.values());
        if let Some(exhausted) = all
            .filter(|p| p.is_due(now))
            .find(|p| p.retransmit_count >= self.max_retransmits)
        {
            return RetransmitPoll::Exhausted {
                retransmits: exhausted.retransmit_count,
            };
        }

        let mut resend = Vec::new();
        for pending in self
            .ordered
            .values_mut()
            .chain(self.messages.values_mut())
            .filter(|p| p.is_due(now))
        {
            pending.retransmit(now, self.backoff_multiplier, self.max_rto);
            resend.push(pending.packet.clone());
        }

        if resend.is_empty() {
            RetransmitPoll::Idle
        } else {
            RetransmitPoll::Resend(resend)
        }
    }

    /// Earliest retransmission deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.ordered
            .values()
            .chain(self.messages.values())
            .map(Pending::deadline)
            .min()
    }

    /// Lowest ordered sequence still unacknowledged.
    pub fn first_ordered(&self) -> Option<u32> {
        self.ordered.keys().next().copied()
    }

    /// Check if ordered packets are still unacknowledged.
    pub fn has_ordered_pending(&self) -> bool {
        !self.ordered.is_empty()
    }

    /// Check if nothing at all is outstanding.
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty() && self.messages.is_empty()
    }

    /// Number of outstanding packets.
    pub fn len(&self) -> usize {
        self.ordered.len() + self.messages.len()
    }

    /// Drop everything (stream destroyed).
    pub fn clear(&mut self) {
        self.ordered.clear();
        self.messages.clear();
    }
}
