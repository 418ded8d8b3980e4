//! Stream state machine.
//!
//! A [`Connection`] is the socket task's view of one connected stream. It
//! performs no I/O: application commands, inbound packets and timer ticks go
//! in, and packets to transmit plus events to deliver come out through
//! [`Connection::poll_transmit`] and [`Connection::poll_event`]. Effects are
//! queued rather than executed, so every input is safe to apply at any point
//! of a dispatch.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, trace};

use super::ack::{RetransmitPoll, RetransmitQueue};
use super::error::StreamError;
use super::reorder::{InsertOutcome, ReorderBuffer, Segment};
use super::socket::SocketConfig;
use super::stream::StreamEvent;
use super::timing::RttEstimator;
use super::window::{SeqCheck, SeqWindow};
use crate::core::{Packet, PacketKind, RETRANSMIT_BACKOFF};

/// Stream lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// Connected, local side open for writes.
    Connected,
    /// `end` called, END not yet acknowledged.
    LocalEnding,
    /// Local side fully acknowledged.
    Finished,
    /// Terminal.
    Closed,
}

/// Completion channel for one write, resolved once its bytes are acknowledged.
pub type WriteNotify = oneshot::Sender<Result<(), StreamError>>;

/// Per-stream protocol state owned by the socket task.
#[derive(Debug)]
pub struct Connection {
    local_id: u32,
    remote_id: u32,
    remote_addr: SocketAddr,
    max_payload: usize,

    // Send side
    next_seq: u32,
    next_message_seq: u32,
    retransmit: RetransmitQueue,
    rtt: RttEstimator,
    /// Writes awaiting acknowledgment, keyed by their last sequence.
    write_acks: VecDeque<(u32, WriteNotify)>,
    local_ended: bool,
    finished: bool,

    // Receive side
    expected_seq: u32,
    reorder: ReorderBuffer,
    messages_seen: SeqWindow,
    remote_ended: bool,

    closed: bool,
    closed_cleanly: bool,

    outbox: VecDeque<Packet>,
    events: VecDeque<StreamEvent>,
}

impl Connection {
    /// Create the state for a stream that just connected.
    pub fn new(
        local_id: u32,
        remote_id: u32,
        remote_addr: SocketAddr,
        config: &SocketConfig,
    ) -> Self {
        Self {
            local_id,
            remote_id,
            remote_addr,
            max_payload: config.max_payload_size,

            next_seq: 0,
            next_message_seq: 0,
            retransmit: RetransmitQueue::new(
                RETRANSMIT_BACKOFF,
                config.max_retransmits,
                config.max_rto,
            ),
            rtt: RttEstimator::with_bounds(config.initial_rto, config.min_rto, config.max_rto),
            write_acks: VecDeque::new(),
            local_ended: false,
            finished: false,

            expected_seq: 0,
            reorder: ReorderBuffer::new(config.reorder_capacity),
            messages_seen: SeqWindow::new(),
            remote_ended: false,

            closed: false,
            closed_cleanly: false,

            outbox: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    /// Local routing id.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Routing id of the peer stream.
    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    /// Address of the peer socket.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> StreamPhase {
        if self.closed {
            StreamPhase::Closed
        } else if self.finished {
            StreamPhase::Finished
        } else if self.local_ended {
            StreamPhase::LocalEnding
        } else {
            StreamPhase::Connected
        }
    }

    /// Check if the stream reached its terminal state.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Check if the stream closed through the end handshake on both sides.
    pub fn closed_cleanly(&self) -> bool {
        self.closed_cleanly
    }

    /// Check if the peer's END has been delivered.
    pub fn is_remote_ended(&self) -> bool {
        self.remote_ended
    }

    /// Next ordered sequence expected from the peer.
    pub fn expected_seq(&self) -> u32 {
        self.expected_seq
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.rtt.rto()
    }

    /// Packets awaiting acknowledgment.
    pub fn outstanding(&self) -> usize {
        self.retransmit.len()
    }

    /// Segments held in the reorder buffer.
    pub fn buffered(&self) -> usize {
        self.reorder.len()
    }

    /// Queue ordered bytes, split into segments of at most the max payload.
    pub fn write(&mut self, data: Vec<u8>, now: Instant) {
        self.write_notify(data, now, None);
    }

    /// Queue ordered bytes and resolve `notify` once every segment of the
    /// write has been acknowledged, or with the terminal error if the stream
    /// dies first.
    pub fn write_notify(&mut self, data: Vec<u8>, now: Instant, notify: Option<WriteNotify>) {
        if self.closed || self.local_ended {
            if let Some(notify) = notify {
                let _ = notify.send(Err(StreamError::Aborted));
            }
            return;
        }

        if data.len() <= self.max_payload {
            self.push_ordered(PacketKind::Data, data, now);
        } else {
            for chunk in data.chunks(self.max_payload) {
                self.push_ordered(PacketKind::Data, chunk.to_vec(), now);
            }
        }

        if let Some(notify) = notify {
            let last = self.next_seq.wrapping_sub(1);
            self.write_acks.push_back((last, notify));
        }
    }

    /// Writes still waiting for their acknowledgment.
    pub fn pending_writes(&self) -> usize {
        self.write_acks.len()
    }

    /// Finish the local direction. A second call is a no-op.
    pub fn end(&mut self, now: Instant) {
        if self.closed || self.local_ended {
            return;
        }
        self.local_ended = true;
        self.push_ordered(PacketKind::End, Vec::new(), now);
    }

    /// Queue an unordered reliable message.
    pub fn send_message(&mut self, data: Vec<u8>, now: Instant) {
        if self.closed {
            return;
        }

        let seq = self.next_message_seq;
        self.next_message_seq = self.next_message_seq.wrapping_add(1);

        let packet = Packet::message(self.remote_id, seq, self.expected_seq, data);
        self.retransmit
            .register_message(packet.clone(), now, self.rtt.rto());
        self.outbox.push_back(packet);
    }

    /// Tear the stream down at the application's request.
    ///
    /// Safe in every phase, including with an END still in flight. Only the
    /// first call has any effect.
    pub fn destroy(&mut self, error: Option<StreamError>) {
        self.teardown(error, true);
    }

    /// Apply an inbound packet addressed to this stream.
    pub fn handle_packet(&mut self, packet: Packet, now: Instant) {
        if self.closed {
            return;
        }

        self.on_ack(packet.ack, now);

        match packet.kind {
            PacketKind::Ack => {}
            PacketKind::Data => self.on_ordered(packet.seq, Segment::Data(packet.payload)),
            PacketKind::End => self.on_ordered(packet.seq, Segment::End),
            PacketKind::Message => self.on_message(packet.seq, packet.payload),
            PacketKind::MessageAck => {
                if let Some(sample) = self.retransmit.ack_message(packet.seq, now) {
                    self.rtt.update(sample);
                }
            }
            PacketKind::Destroy => {
                // Without a delivered END the peer's teardown is abrupt
                let error = (!self.remote_ended).then_some(StreamError::PeerReset);
                self.teardown(error, false);
                return;
            }
        }

        self.maybe_close();
    }

    /// Retransmit expired packets, or give up once the budget is spent.
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.closed {
            return;
        }

        match self.retransmit.poll(now) {
            RetransmitPoll::Idle => {}
            RetransmitPoll::Resend(packets) => {
                for mut packet in packets {
                    trace!(
                        id = self.local_id,
                        kind = ?packet.kind,
                        seq = packet.seq,
                        "retransmit"
                    );
                    packet.ack = self.expected_seq;
                    self.outbox.push_back(packet);
                }
            }
            RetransmitPoll::Exhausted { retransmits } => {
                debug!(id = self.local_id, retransmits, "stream timed out");
                self.teardown(Some(StreamError::Timeout { retransmits }), true);
            }
        }
    }

    /// Earliest instant at which [`handle_timeout`](Self::handle_timeout)
    /// has work to do.
    pub fn poll_timeout(&self) -> Option<Instant> {
        if self.closed {
            None
        } else {
            self.retransmit.next_deadline()
        }
    }

    /// Next packet to put on the wire.
    pub fn poll_transmit(&mut self) -> Option<Packet> {
        self.outbox.pop_front()
    }

    /// Next event to deliver to the application.
    pub fn poll_event(&mut self) -> Option<StreamEvent> {
        self.events.pop_front()
    }

    fn push_ordered(&mut self, kind: PacketKind, payload: Vec<u8>, now: Instant) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        let packet = match kind {
            PacketKind::End => Packet::end(self.remote_id, seq, self.expected_seq),
            _ => Packet::data(self.remote_id, seq, self.expected_seq, payload),
        };
        self.retransmit
            .register_ordered(packet.clone(), now, self.rtt.rto());
        self.outbox.push_back(packet);
    }

    fn on_ack(&mut self, ack: u32, now: Instant) {
        if let Some(sample) = self.retransmit.ack_ordered(ack, now) {
            self.rtt.update(sample);
        }

        let acked_below = self.retransmit.first_ordered().unwrap_or(self.next_seq);
        while self
            .write_acks
            .front()
            .is_some_and(|(last, _)| *last < acked_below)
        {
            if let Some((_, notify)) = self.write_acks.pop_front() {
                let _ = notify.send(Ok(()));
            }
        }

        if self.local_ended && !self.finished && !self.retransmit.has_ordered_pending() {
            self.finished = true;
            self.events.push_back(StreamEvent::Finish);
        }
    }

    fn on_ordered(&mut self, seq: u32, segment: Segment) {
        // Nothing follows END, so after it only the ack matters
        if self.remote_ended {
            trace!(id = self.local_id, seq, "segment after end");
        } else if seq == self.expected_seq {
            self.deliver(segment);
            while !self.remote_ended {
                let Some(next) = self.reorder.pop(self.expected_seq) else {
                    break;
                };
                self.deliver(next);
            }
            self.reorder.discard_below(self.expected_seq);
        } else if seq > self.expected_seq {
            match self.reorder.insert(seq, segment) {
                InsertOutcome::Buffered => {
                    trace!(id = self.local_id, seq, expected = self.expected_seq, "buffered")
                }
                InsertOutcome::Duplicate => trace!(id = self.local_id, seq, "duplicate segment"),
                InsertOutcome::Full => debug!(id = self.local_id, seq, "reorder buffer full"),
            }
        } else {
            trace!(id = self.local_id, seq, "already delivered");
        }

        self.outbox
            .push_back(Packet::ack(self.remote_id, self.expected_seq));
    }

    fn deliver(&mut self, segment: Segment) {
        self.expected_seq = self.expected_seq.wrapping_add(1);
        match segment {
            Segment::Data(bytes) => self.events.push_back(StreamEvent::Data(bytes)),
            Segment::End => {
                self.remote_ended = true;
                self.reorder.clear();
                self.events.push_back(StreamEvent::End);
            }
        }
    }

    fn on_message(&mut self, seq: u32, payload: Vec<u8>) {
        match self.messages_seen.check_and_mark(seq) {
            SeqCheck::Fresh => self.events.push_back(StreamEvent::Message(payload)),
            SeqCheck::Duplicate => trace!(id = self.local_id, seq, "duplicate message"),
            SeqCheck::Ahead => {
                // Unacked, so the sender retries once the window has moved
                trace!(
                    id = self.local_id,
                    seq,
                    floor = self.messages_seen.floor(),
                    "message beyond window"
                );
                return;
            }
        }

        self.outbox
            .push_back(Packet::message_ack(self.remote_id, seq, self.expected_seq));
    }

    fn maybe_close(&mut self) {
        if self.closed || !self.finished || !self.remote_ended || !self.retransmit.is_empty() {
            return;
        }

        debug!(id = self.local_id, "stream closed");
        self.closed = true;
        self.closed_cleanly = true;
        self.reorder.clear();
        self.events.push_back(StreamEvent::Close);
    }

    fn teardown(&mut self, error: Option<StreamError>, notify_peer: bool) {
        if self.closed {
            return;
        }

        debug!(id = self.local_id, ?error, "stream destroyed");
        self.closed = true;
        self.retransmit.clear();
        self.reorder.clear();

        if notify_peer {
            self.outbox
                .push_back(Packet::destroy(self.remote_id, self.expected_seq));
        }
        let abort = error.clone().unwrap_or(StreamError::Aborted);
        for (_, notify) in self.write_acks.drain(..) {
            let _ = notify.send(Err(abort.clone()));
        }

        if let Some(error) = error {
            self.events.push_back(StreamEvent::Error(error));
        }
        self.events.push_back(StreamEvent::Close);
    }
}
