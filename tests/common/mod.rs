//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use udx_mux::{Packet, Socket, SocketBuilder, Stream, StreamEvent};

/// Upper bound for any single wait in a test.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("info,udx_mux=debug")
        .try_init();
}

pub fn localhost() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Builder tuned for loopback: short timeouts so retransmissions are quick.
pub fn fast_builder() -> SocketBuilder {
    Socket::builder()
        .initial_rto(Duration::from_millis(50))
        .min_rto(Duration::from_millis(10))
        .linger_timeout(Duration::from_secs(2))
}

pub async fn fast_socket() -> Socket {
    fast_builder().bind(localhost()).await.unwrap()
}

/// Two streams on one socket, connected to each other.
pub fn connected_pair(socket: &Socket, a_id: u32, b_id: u32) -> (Stream, Stream) {
    let addr = socket.local_addr();
    let a = Stream::new(a_id);
    let b = Stream::new(b_id);
    a.connect(socket, b_id, addr).unwrap();
    b.connect(socket, a_id, addr).unwrap();
    (a, b)
}

pub async fn next_event(stream: &mut Stream) -> StreamEvent {
    tokio::time::timeout(EVENT_TIMEOUT, stream.recv())
        .await
        .expect("timed out waiting for a stream event")
        .expect("stream already closed")
}

/// Collect events until the stream closes.
pub async fn drain(stream: &mut Stream) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    loop {
        let event = next_event(stream).await;
        let done = event == StreamEvent::Close;
        events.push(event);
        if done {
            return events;
        }
    }
}

/// Check that a stream went through the full end handshake.
pub fn assert_clean_close(events: &[StreamEvent]) {
    assert_eq!(events.last(), Some(&StreamEvent::Close), "{:?}", events);
    assert!(events.contains(&StreamEvent::End), "{:?}", events);
    assert!(events.contains(&StreamEvent::Finish), "{:?}", events);
    assert!(
        !events.iter().any(|e| matches!(e, StreamEvent::Error(_))),
        "{:?}",
        events
    );
}

/// Concatenated ordered bytes in an event list.
pub fn data_of(events: &[StreamEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::Data(bytes) => Some(bytes.as_slice()),
            _ => None,
        })
        .flatten()
        .copied()
        .collect()
}

/// UDP relay between two sockets that can drop selected packets.
///
/// Streams on either side connect to [`Proxy::addr`] instead of the other
/// socket's address.
pub struct Proxy {
    pub addr: SocketAddr,
    task: JoinHandle<()>,
}

impl Proxy {
    /// Relay between `a` and `b`; `drop_if` sees every decoded packet and its
    /// sender and returns `true` to drop it.
    pub async fn spawn<F>(a: SocketAddr, b: SocketAddr, mut drop_if: F) -> Self
    where
        F: FnMut(&Packet, SocketAddr) -> bool + Send + 'static,
    {
        let socket = UdpSocket::bind(localhost()).await.unwrap();
        let addr = socket.local_addr().unwrap();

        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            loop {
                let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let to = if from == a { b } else { a };

                if let Ok(packet) = Packet::decode(&buf[..len]) {
                    if drop_if(&packet, from) {
                        continue;
                    }
                }
                let _ = socket.send_to(&buf[..len], to).await;
            }
        });

        Self { addr, task }
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.task.abort();
    }
}
