//! UDP socket multiplexer.
//!
//! A [`Socket`] owns one UDP endpoint and a background task that serializes
//! everything touching it: inbound datagrams, retransmission timers and the
//! commands issued through [`Socket`] and [`Stream`](super::Stream) handles.
//! Inbound packets are routed by destination id to exactly one stream;
//! opening packets for unknown ids raise a [`Preconnect`] notification.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time;
use tracing::{debug, trace, warn};

use super::connection::{Connection, WriteNotify};
use super::error::{StreamError, TransportError, TransportResult};
use super::stream::StreamEvent;
use crate::core::{
    DEFAULT_MAX_PAYLOAD, HEADER_SIZE, INITIAL_RTO, LINGER_TIMEOUT, MAX_DATAGRAM_SIZE,
    MAX_RETRANSMITS, MAX_RTO, MIN_RTO, Packet, PacketKind, REORDER_CAPACITY, TOMBSTONE_CAPACITY,
};

/// Unknown (id, address) pairs remembered for preconnect de-duplication.
const MAX_ANNOUNCED: usize = 1024;

/// Preconnect notifications queued for the application before new ones are
/// dropped.
const PRECONNECT_BACKLOG: usize = 256;

/// Socket configuration.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Receive buffer size (largest datagram accepted). Raised to fit a
    /// full packet when the socket starts.
    pub recv_buffer_size: usize,

    /// Largest payload carried by one packet. Writes are split to fit.
    pub max_payload_size: usize,

    /// Retransmission timeout before the first RTT sample.
    pub initial_rto: Duration,

    /// Lower bound for the retransmission timeout.
    pub min_rto: Duration,

    /// Upper bound for the retransmission timeout.
    pub max_rto: Duration,

    /// Retransmissions of one packet before the stream times out.
    pub max_retransmits: u32,

    /// Out-of-order segments buffered per stream.
    pub reorder_capacity: usize,

    /// How long `close` waits for live streams before destroying them.
    pub linger_timeout: Duration,

    /// Cleanly closed stream ids remembered to answer late END packets.
    pub tombstone_capacity: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: MAX_DATAGRAM_SIZE,
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            initial_rto: INITIAL_RTO,
            min_rto: MIN_RTO,
            max_rto: MAX_RTO,
            max_retransmits: MAX_RETRANSMITS,
            reorder_capacity: REORDER_CAPACITY,
            linger_timeout: LINGER_TIMEOUT,
            tombstone_capacity: TOMBSTONE_CAPACITY,
        }
    }
}

/// Builder for creating sockets with custom options.
#[derive(Debug, Clone, Default)]
pub struct SocketBuilder {
    config: SocketConfig,
}

impl SocketBuilder {
    /// Create a new socket builder with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the receive buffer size.
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.config.recv_buffer_size = size;
        self
    }

    /// Set the maximum payload size (at least one byte).
    pub fn max_payload_size(mut self, size: usize) -> Self {
        self.config.max_payload_size = size.max(1);
        self
    }

    /// Set the retransmission timeout used before any RTT sample.
    pub fn initial_rto(mut self, rto: Duration) -> Self {
        self.config.initial_rto = rto;
        self
    }

    /// Set the lower bound of the retransmission timeout.
    pub fn min_rto(mut self, rto: Duration) -> Self {
        self.config.min_rto = rto;
        self
    }

    /// Set the upper bound of the retransmission timeout.
    pub fn max_rto(mut self, rto: Duration) -> Self {
        self.config.max_rto = rto;
        self
    }

    /// Set the retransmit budget per packet.
    pub fn max_retransmits(mut self, count: u32) -> Self {
        self.config.max_retransmits = count;
        self
    }

    /// Set the reorder buffer capacity per stream.
    pub fn reorder_capacity(mut self, capacity: usize) -> Self {
        self.config.reorder_capacity = capacity;
        self
    }

    /// Set how long `close` waits for live streams.
    pub fn linger_timeout(mut self, timeout: Duration) -> Self {
        self.config.linger_timeout = timeout;
        self
    }

    /// Set how many cleanly closed ids are remembered.
    pub fn tombstone_capacity(mut self, capacity: usize) -> Self {
        self.config.tombstone_capacity = capacity;
        self
    }

    /// Get the configuration built so far.
    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    /// Bind to the given address and start the socket task.
    pub async fn bind(self, addr: SocketAddr) -> TransportResult<Socket> {
        let socket = UdpSocket::bind(addr).await?;
        self.from_socket(socket)
    }

    /// Start the socket task on an already bound UDP socket.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_socket(mut self, socket: UdpSocket) -> TransportResult<Socket> {
        let local_addr = socket.local_addr()?;

        // A shorter buffer would truncate full packets into valid-looking ones
        let min_buffer = HEADER_SIZE + self.config.max_payload_size;
        if self.config.recv_buffer_size < min_buffer {
            debug!(
                requested = self.config.recv_buffer_size,
                min_buffer, "raising receive buffer size"
            );
            self.config.recv_buffer_size = min_buffer;
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (preconnect_tx, preconnect_rx) = mpsc::channel(PRECONNECT_BACKLOG);
        let counters = Arc::new(Counters::default());

        debug!(%local_addr, "socket bound");

        let driver = Driver {
            recv_buf: vec![0u8; self.config.recv_buffer_size],
            socket,
            config: self.config.clone(),
            commands: command_rx,
            preconnects: preconnect_tx,
            streams: HashMap::new(),
            announced: Announced::new(MAX_ANNOUNCED),
            tombstones: VecDeque::new(),
            outgoing: Vec::new(),
            counters: Arc::clone(&counters),
            closing: false,
            linger_deadline: None,
            close_waiters: Vec::new(),
            handles_gone: false,
        };
        tokio::spawn(driver.run());

        Ok(Socket {
            inner: Arc::new(SocketInner {
                commands: command_tx,
                local_addr,
                closing: AtomicBool::new(false),
                preconnects: Mutex::new(preconnect_rx),
                counters,
                config: self.config,
            }),
        })
    }
}

/// Inbound packet for a routing id with no registered stream.
///
/// Connecting a stream with this id (and, usually, the address as remote)
/// lets the sender's next retransmission land on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preconnect {
    /// Routing id the packet was addressed to.
    pub id: u32,
    /// Address of the sending socket.
    pub addr: SocketAddr,
}

/// Traffic counters for one socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketStats {
    /// Datagrams written to the endpoint.
    pub packets_sent: u64,
    /// Bytes written to the endpoint.
    pub bytes_sent: u64,
    /// Datagrams read from the endpoint.
    pub packets_received: u64,
    /// Bytes read from the endpoint.
    pub bytes_received: u64,
    /// Datagrams dropped because they failed to decode.
    pub packets_malformed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    packets_malformed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> SocketStats {
        SocketStats {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_malformed: self.packets_malformed.load(Ordering::Relaxed),
        }
    }
}

/// Requests from handles to the socket task.
#[derive(Debug)]
pub(crate) enum Command {
    Connect {
        id: u32,
        key: u64,
        remote_id: u32,
        remote_addr: SocketAddr,
        events: mpsc::UnboundedSender<StreamEvent>,
        closed: Arc<AtomicBool>,
    },
    Write {
        id: u32,
        key: u64,
        data: Vec<u8>,
        notify: Option<WriteNotify>,
    },
    End {
        id: u32,
        key: u64,
    },
    Send {
        id: u32,
        key: u64,
        data: Vec<u8>,
    },
    Destroy {
        id: u32,
        key: u64,
        error: Option<StreamError>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

#[derive(Debug)]
struct SocketInner {
    commands: mpsc::UnboundedSender<Command>,
    local_addr: SocketAddr,
    closing: AtomicBool,
    preconnects: Mutex<mpsc::Receiver<Preconnect>>,
    counters: Arc<Counters>,
    config: SocketConfig,
}

/// Handle to a bound, multiplexed UDP socket.
///
/// Cloning the handle is cheap; every clone refers to the same endpoint.
#[derive(Debug, Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

impl Socket {
    /// Bind a socket with default options.
    pub async fn bind(addr: SocketAddr) -> TransportResult<Self> {
        SocketBuilder::new().bind(addr).await
    }

    /// Start building a socket with custom options.
    pub fn builder() -> SocketBuilder {
        SocketBuilder::new()
    }

    /// Get the local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Get the socket configuration.
    pub fn config(&self) -> &SocketConfig {
        &self.inner.config
    }

    /// Get a snapshot of the traffic counters.
    pub fn stats(&self) -> SocketStats {
        self.inner.counters.snapshot()
    }

    /// Check if `close` has been called.
    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    /// Wait for the next preconnect notification.
    ///
    /// Returns `None` once the socket task has stopped.
    pub async fn preconnect(&self) -> Option<Preconnect> {
        self.inner.preconnects.lock().await.recv().await
    }

    /// Close the socket.
    ///
    /// New connects are refused and preconnect notifications stop. Live
    /// streams keep running until they close; after the linger timeout the
    /// remaining ones are destroyed. Resolves once the UDP endpoint has been
    /// released. Never fails and may be called any number of times.
    pub async fn close(&self) {
        self.inner.closing.store(true, Ordering::Release);

        let (done, wait) = oneshot::channel();
        if self.inner.commands.send(Command::Close { done }).is_err() {
            // Task already gone
            return;
        }
        let _ = wait.await;
    }

    /// Queue a command for the socket task.
    pub(crate) fn command(&self, command: Command) -> TransportResult<()> {
        self.inner
            .commands
            .send(command)
            .map_err(|_| TransportError::SocketClosed)
    }

    /// Register a stream, returning the command channel it should use.
    pub(crate) fn connect(
        &self,
        command: Command,
    ) -> TransportResult<mpsc::UnboundedSender<Command>> {
        if self.is_closing() {
            return Err(TransportError::SocketClosed);
        }
        self.command(command)?;
        Ok(self.inner.commands.clone())
    }
}

/// Connected stream as seen by the socket task.
#[derive(Debug)]
struct Entry {
    key: u64,
    conn: Connection,
    events: mpsc::UnboundedSender<StreamEvent>,
    closed: Arc<AtomicBool>,
}

/// Recently closed stream, remembered to re-ack a retransmitted END.
#[derive(Debug, Clone, Copy)]
struct Tombstone {
    id: u32,
    remote_id: u32,
    addr: SocketAddr,
    ack: u32,
}

/// Announced (id, address) pairs, evicting the oldest past capacity.
#[derive(Debug)]
struct Announced {
    set: HashSet<(u32, SocketAddr)>,
    order: VecDeque<(u32, SocketAddr)>,
    capacity: usize,
}

impl Announced {
    fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn contains(&self, id: u32, addr: SocketAddr) -> bool {
        self.set.contains(&(id, addr))
    }

    fn insert(&mut self, id: u32, addr: SocketAddr) -> bool {
        if !self.set.insert((id, addr)) {
            return false;
        }
        self.order.push_back((id, addr));
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
        true
    }

    /// Forget every address announced for `id` (a stream now owns it).
    fn forget_id(&mut self, id: u32) {
        self.order.retain(|(announced, _)| *announced != id);
        self.set.retain(|(announced, _)| *announced != id);
    }
}

/// The socket task.
struct Driver {
    socket: UdpSocket,
    recv_buf: Vec<u8>,
    config: SocketConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    preconnects: mpsc::Sender<Preconnect>,
    streams: HashMap<u32, Entry>,
    announced: Announced,
    tombstones: VecDeque<Tombstone>,
    outgoing: Vec<(Packet, SocketAddr)>,
    counters: Arc<Counters>,
    closing: bool,
    linger_deadline: Option<Instant>,
    close_waiters: Vec<oneshot::Sender<()>>,
    handles_gone: bool,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let deadline = self.next_deadline();
            let wake = time::Instant::from_std(deadline.unwrap_or_else(Instant::now));

            tokio::select! {
                result = self.socket.recv_from(&mut self.recv_buf) => match result {
                    Ok((len, from)) => self.on_datagram(len, from),
                    Err(e) => warn!(error = %e, "recv failed"),
                },
                command = self.commands.recv(), if !self.handles_gone => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        self.handles_gone = true;
                        self.begin_close();
                    }
                },
                _ = time::sleep_until(wake), if deadline.is_some() => {
                    self.on_timeout(Instant::now());
                }
            }

            self.flush().await;

            if (self.closing || self.handles_gone) && self.streams.is_empty() {
                break;
            }
        }

        self.shutdown();
    }

    fn on_datagram(&mut self, len: usize, from: SocketAddr) {
        self.counters.packets_received.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_received
            .fetch_add(len as u64, Ordering::Relaxed);

        let packet = match Packet::decode(&self.recv_buf[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                self.counters
                    .packets_malformed
                    .fetch_add(1, Ordering::Relaxed);
                trace!(%from, error = %e, "dropping malformed packet");
                return;
            }
        };

        if let Some(entry) = self.streams.get_mut(&packet.id) {
            entry.conn.handle_packet(packet, Instant::now());
            return;
        }

        if packet.kind == PacketKind::End {
            let tombstone = self
                .tombstones
                .iter()
                .find(|t| t.id == packet.id && t.addr == from)
                .copied();
            if let Some(tombstone) = tombstone {
                trace!(id = packet.id, %from, "re-acking end for closed stream");
                self.outgoing
                    .push((Packet::ack(tombstone.remote_id, tombstone.ack), from));
                return;
            }
        }

        if !packet.kind.is_opening() {
            trace!(id = packet.id, kind = ?packet.kind, "no stream for packet");
            return;
        }

        if self.closing {
            return;
        }

        if self.announced.contains(packet.id, from) {
            return;
        }
        let preconnect = Preconnect {
            id: packet.id,
            addr: from,
        };
        match self.preconnects.try_send(preconnect) {
            Ok(()) => {
                debug!(id = packet.id, %from, "preconnect");
                self.announced.insert(packet.id, from);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Not marked, so a retransmission may announce it later
                trace!(id = packet.id, %from, "preconnect backlog full");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn on_command(&mut self, command: Command) {
        let now = Instant::now();

        match command {
            Command::Connect {
                id,
                key,
                remote_id,
                remote_addr,
                events,
                closed,
            } => {
                if self.closing {
                    reject(&events, &closed, StreamError::SocketClosed);
                } else if self.streams.contains_key(&id) {
                    debug!(id, "routing id already in use");
                    reject(&events, &closed, StreamError::IdInUse(id));
                } else {
                    debug!(id, remote_id, %remote_addr, "stream connected");
                    self.announced.forget_id(id);
                    self.tombstones.retain(|t| t.id != id);
                    let conn = Connection::new(id, remote_id, remote_addr, &self.config);
                    self.streams.insert(
                        id,
                        Entry {
                            key,
                            conn,
                            events,
                            closed,
                        },
                    );
                }
            }
            Command::Write {
                id,
                key,
                data,
                notify,
            } => {
                if let Some(conn) = self.stream_mut(id, key) {
                    conn.write_notify(data, now, notify);
                }
            }
            Command::End { id, key } => {
                if let Some(conn) = self.stream_mut(id, key) {
                    conn.end(now);
                }
            }
            Command::Send { id, key, data } => {
                if let Some(conn) = self.stream_mut(id, key) {
                    conn.send_message(data, now);
                }
            }
            Command::Destroy { id, key, error } => {
                if let Some(conn) = self.stream_mut(id, key) {
                    conn.destroy(error);
                }
            }
            Command::Close { done } => {
                self.close_waiters.push(done);
                self.begin_close();
            }
        }
    }

    fn on_timeout(&mut self, now: Instant) {
        for entry in self.streams.values_mut() {
            if entry.conn.poll_timeout().is_some_and(|at| at <= now) {
                entry.conn.handle_timeout(now);
            }
        }

        if self.linger_deadline.is_some_and(|at| at <= now) && !self.streams.is_empty() {
            warn!(
                streams = self.streams.len(),
                "linger timeout, destroying remaining streams"
            );
            for entry in self.streams.values_mut() {
                entry.conn.destroy(Some(StreamError::SocketClosed));
            }
        }
    }

    fn stream_mut(&mut self, id: u32, key: u64) -> Option<&mut Connection> {
        self.streams
            .get_mut(&id)
            .filter(|entry| entry.key == key)
            .map(|entry| &mut entry.conn)
    }

    fn begin_close(&mut self) {
        if self.closing {
            return;
        }
        debug!(streams = self.streams.len(), "socket closing");
        self.closing = true;
        self.linger_deadline = Some(Instant::now() + self.config.linger_timeout);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.streams
            .values()
            .filter_map(|entry| entry.conn.poll_timeout())
            .chain(self.linger_deadline.filter(|_| !self.streams.is_empty()))
            .min()
    }

    /// Transmit queued packets, deliver queued events and reap closed streams.
    async fn flush(&mut self) {
        let mut outgoing = std::mem::take(&mut self.outgoing);
        let mut closed = Vec::new();

        for (id, entry) in self.streams.iter_mut() {
            while let Some(packet) = entry.conn.poll_transmit() {
                outgoing.push((packet, entry.conn.remote_addr()));
            }

            if entry.conn.is_closed() {
                // Visible to the handle before it can observe Close
                entry.closed.store(true, Ordering::Release);
                closed.push(*id);
            }

            while let Some(event) = entry.conn.poll_event() {
                let _ = entry.events.send(event);
            }
        }

        for id in closed {
            let Some(entry) = self.streams.remove(&id) else {
                continue;
            };
            debug!(id, clean = entry.conn.closed_cleanly(), "stream removed");

            if entry.conn.closed_cleanly() && self.config.tombstone_capacity > 0 {
                if self.tombstones.len() >= self.config.tombstone_capacity {
                    self.tombstones.pop_front();
                }
                self.tombstones.push_back(Tombstone {
                    id,
                    remote_id: entry.conn.remote_id(),
                    addr: entry.conn.remote_addr(),
                    ack: entry.conn.expected_seq(),
                });
            }
        }

        for (packet, addr) in outgoing {
            let bytes = packet.encode();
            match self.socket.send_to(&bytes, addr).await {
                Ok(sent) => {
                    self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .bytes_sent
                        .fetch_add(sent as u64, Ordering::Relaxed);
                }
                Err(e) => debug!(%addr, error = %e, "send failed"),
            }
        }
    }

    /// Release the endpoint, then wake every `close` caller.
    fn shutdown(mut self) {
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Connect { events, closed, .. } => {
                    reject(&events, &closed, StreamError::SocketClosed)
                }
                Command::Close { done } => self.close_waiters.push(done),
                _ => {}
            }
        }

        let waiters = std::mem::take(&mut self.close_waiters);
        let local_addr = self.socket.local_addr().ok();
        drop(self);

        debug!(?local_addr, "socket closed");
        for done in waiters {
            let _ = done.send(());
        }
    }
}

/// Fail a connect that never reached the routing table.
fn reject(events: &mpsc::UnboundedSender<StreamEvent>, closed: &AtomicBool, error: StreamError) {
    closed.store(true, Ordering::Release);
    let _ = events.send(StreamEvent::Error(error));
    let _ = events.send(StreamEvent::Close);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn localhost() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_socket_bind() {
        let socket = Socket::bind(localhost()).await.unwrap();
        let addr = socket.local_addr();
        assert!(addr.port() != 0);
        assert!(!socket.is_closing());

        socket.close().await;
        assert!(socket.is_closing());
    }

    #[tokio::test]
    async fn test_close_twice() {
        let socket = Socket::bind(localhost()).await.unwrap();

        socket.close().await;
        // Task is gone; resolves immediately
        socket.close().await;
        assert_eq!(socket.preconnect().await, None);
    }

    #[test]
    fn test_socket_builder() {
        let builder = SocketBuilder::new()
            .recv_buffer_size(4096)
            .max_payload_size(0)
            .initial_rto(Duration::from_millis(50))
            .max_retransmits(3)
            .reorder_capacity(16)
            .linger_timeout(Duration::from_millis(10));

        let config = builder.config();
        assert_eq!(config.recv_buffer_size, 4096);
        assert_eq!(config.max_payload_size, 1);
        assert_eq!(config.initial_rto, Duration::from_millis(50));
        assert_eq!(config.max_retransmits, 3);
        assert_eq!(config.reorder_capacity, 16);
        assert_eq!(config.linger_timeout, Duration::from_millis(10));
        assert_eq!(config.tombstone_capacity, TOMBSTONE_CAPACITY);
    }

    #[test]
    fn test_announced_evicts_oldest() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let other: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let mut announced = Announced::new(3);

        assert!(announced.insert(1, addr));
        assert!(!announced.insert(1, addr));
        assert!(announced.insert(1, other));
        assert!(announced.insert(2, addr));

        // Full: the oldest entry goes, the rest stay
        assert!(announced.insert(3, addr));
        assert!(!announced.contains(1, addr));
        assert!(announced.contains(1, other));
        assert!(announced.contains(2, addr));
        assert!(announced.contains(3, addr));

        announced.forget_id(1);
        assert!(!announced.contains(1, other));
        assert!(announced.insert(1, other));
    }

    #[tokio::test]
    async fn test_unknown_id_flood_is_bounded() {
        let socket = Socket::bind(localhost()).await.unwrap();
        let sender = UdpSocket::bind(localhost()).await.unwrap();
        let addr = socket.local_addr();

        for _ in 0..3 {
            for id in 0..1100u32 {
                let packet = Packet::data(id, 0, 0, b"x".to_vec());
                sender.send_to(&packet.encode(), addr).await.unwrap();
                if id % 100 == 0 {
                    time::sleep(Duration::from_millis(1)).await;
                }
            }
        }

        // Wait for the socket task to go quiet
        let mut seen = 0;
        loop {
            time::sleep(Duration::from_millis(50)).await;
            let now = socket.stats().packets_received;
            if now > 0 && now == seen {
                break;
            }
            seen = now;
        }

        let mut ids = HashSet::new();
        while let Ok(Some(preconnect)) =
            time::timeout(Duration::from_millis(50), socket.preconnect()).await
        {
            assert_eq!(preconnect.addr, sender.local_addr().unwrap());
            assert!(ids.insert(preconnect.id), "id {} announced twice", preconnect.id);
        }

        assert!(!ids.is_empty());
        assert!(ids.len() <= PRECONNECT_BACKLOG);

        socket.close().await;
    }

    #[tokio::test]
    async fn test_recv_buffer_fits_full_packet() {
        let socket = Socket::builder()
            .recv_buffer_size(8)
            .max_payload_size(512)
            .bind(localhost())
            .await
            .unwrap();
        assert_eq!(socket.config().recv_buffer_size, HEADER_SIZE + 512);

        let peer = UdpSocket::bind(localhost()).await.unwrap();
        let mut stream = crate::transport::Stream::new(1);
        stream
            .connect(&socket, 2, peer.local_addr().unwrap())
            .unwrap();

        let payload = vec![7u8; 512];
        peer.send_to(
            &Packet::data(1, 0, 0, payload.clone()).encode(),
            socket.local_addr(),
        )
        .await
        .unwrap();
        assert_eq!(stream.recv().await, Some(StreamEvent::Data(payload)));

        stream.destroy();
        socket.close().await;
    }

    #[tokio::test]
    async fn test_malformed_packets_counted_and_dropped() {
        let socket = Socket::bind(localhost()).await.unwrap();
        let sender = UdpSocket::bind(localhost()).await.unwrap();

        sender
            .send_to(b"definitely not a packet", socket.local_addr())
            .await
            .unwrap();
        sender
            .send_to(&Packet::destroy(9, 0).encode(), socket.local_addr())
            .await
            .unwrap();

        for _ in 0..100 {
            if socket.stats().packets_received == 2 {
                break;
            }
            time::sleep(Duration::from_millis(5)).await;
        }

        let stats = socket.stats();
        assert_eq!(stats.packets_received, 2);
        assert_eq!(stats.packets_malformed, 1);
        assert_eq!(stats.packets_sent, 0);

        socket.close().await;
    }

    #[tokio::test]
    async fn test_tombstone_reacks_end() {
        let socket = Socket::builder()
            .bind(localhost())
            .await
            .unwrap();
        let peer = UdpSocket::bind(localhost()).await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let mut stream = crate::transport::Stream::new(1);
        stream.connect(&socket, 7, peer_addr).unwrap();
        stream.end().unwrap();

        let mut buf = [0u8; 128];

        // Our END arrives at the peer
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        let end = Packet::decode(&buf[..len]).unwrap();
        assert_eq!(end.kind, PacketKind::End);
        assert_eq!(end.id, 7);

        // Peer acks it and ends its side
        let addr = socket.local_addr();
        peer.send_to(&Packet::end(1, 0, 1).encode(), addr)
            .await
            .unwrap();

        assert_eq!(stream.recv().await, Some(StreamEvent::Finish));
        assert_eq!(stream.recv().await, Some(StreamEvent::End));
        assert_eq!(stream.recv().await, Some(StreamEvent::Close));

        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        let ack = Packet::decode(&buf[..len]).unwrap();
        assert_eq!((ack.kind, ack.ack), (PacketKind::Ack, 1));

        // Ack was lost: the retransmitted END is answered from the tombstone
        peer.send_to(&Packet::end(1, 0, 1).encode(), addr)
            .await
            .unwrap();
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        let reack = Packet::decode(&buf[..len]).unwrap();
        assert_eq!((reack.kind, reack.id, reack.ack), (PacketKind::Ack, 7, 1));

        socket.close().await;
    }
}
