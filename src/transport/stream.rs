//! Application handle for one multiplexed stream.
//!
//! A [`Stream`] is created unconnected, bound to a [`Socket`] with
//! [`Stream::connect`], and then driven by the socket task. Writes, ends,
//! messages and destroys are queued as commands; everything the stream
//! observes comes back as a [`StreamEvent`] through [`Stream::recv`].

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use super::error::{StreamError, TransportError, TransportResult};
use super::socket::{Command, Socket};

/// Distinguishes handles that share a routing id.
static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// Something that happened on a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// In-order bytes from the peer.
    Data(Vec<u8>),
    /// An unordered message from the peer.
    Message(Vec<u8>),
    /// The peer ended its direction; no more data follows.
    End,
    /// Our END was acknowledged; every written byte reached the peer.
    Finish,
    /// The stream failed. Always followed by [`StreamEvent::Close`].
    Error(StreamError),
    /// Terminal event, emitted exactly once.
    Close,
}

/// Completion of one [`Stream::write`].
///
/// Resolves to `Ok(())` once the peer acknowledged the whole write, or to the
/// error that ended the stream first.
#[derive(Debug)]
pub struct WriteAck {
    ack: oneshot::Receiver<Result<(), StreamError>>,
}

impl Future for WriteAck {
    type Output = Result<(), StreamError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the stream was gone before the write landed
        Pin::new(&mut self.ack)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(StreamError::Aborted)))
    }
}

#[derive(Debug)]
enum Link {
    Idle,
    Connected {
        commands: mpsc::UnboundedSender<Command>,
        remote_id: u32,
        remote_addr: SocketAddr,
        max_payload: usize,
        ended: bool,
    },
    Destroyed,
}

/// A reliable, bidirectional stream multiplexed over a [`Socket`].
///
/// Dropping the handle destroys the stream.
#[derive(Debug)]
pub struct Stream {
    id: u32,
    key: u64,
    link: Mutex<Link>,
    closed: Arc<AtomicBool>,
    events_tx: mpsc::UnboundedSender<StreamEvent>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    drained: bool,
}

impl Stream {
    /// Create an unconnected stream with the given local routing id.
    pub fn new(id: u32) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        Self {
            id,
            key: NEXT_KEY.fetch_add(1, Ordering::Relaxed),
            link: Mutex::new(Link::Idle),
            closed: Arc::new(AtomicBool::new(false)),
            events_tx,
            events,
            drained: false,
        }
    }

    /// Local routing id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Routing id of the peer stream, once connected.
    pub fn remote_id(&self) -> Option<u32> {
        match &*self.lock() {
            Link::Connected { remote_id, .. } => Some(*remote_id),
            _ => None,
        }
    }

    /// Address of the peer socket, once connected.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        match &*self.lock() {
            Link::Connected { remote_addr, .. } => Some(*remote_addr),
            _ => None,
        }
    }

    /// Check if the stream has been connected and not yet closed.
    pub fn is_connected(&self) -> bool {
        matches!(&*self.lock(), Link::Connected { .. }) && !self.is_closed()
    }

    /// Check if the stream reached its terminal state.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Bind the stream to `socket`, addressing the peer stream `remote_id`
    /// at `remote_addr`.
    ///
    /// A stream connects at most once. If the socket already routes `id` to
    /// another stream, this one fails with [`StreamError::IdInUse`] through
    /// its events.
    pub fn connect(
        &self,
        socket: &Socket,
        remote_id: u32,
        remote_addr: SocketAddr,
    ) -> TransportResult<()> {
        let mut link = self.lock();
        match &*link {
            Link::Idle => {}
            Link::Connected { .. } => return Err(TransportError::AlreadyConnected),
            Link::Destroyed => return Err(TransportError::Destroyed),
        }

        let commands = socket.connect(Command::Connect {
            id: self.id,
            key: self.key,
            remote_id,
            remote_addr,
            events: self.events_tx.clone(),
            closed: Arc::clone(&self.closed),
        })?;

        trace!(id = self.id, remote_id, %remote_addr, "connect queued");
        *link = Link::Connected {
            commands,
            remote_id,
            remote_addr,
            max_payload: socket.config().max_payload_size,
            ended: false,
        };
        Ok(())
    }

    /// Write bytes to the ordered stream.
    ///
    /// Large writes are split into packets; the peer receives the bytes in
    /// order, though not necessarily with the same chunk boundaries. An empty
    /// write is delivered as an empty chunk.
    ///
    /// The returned [`WriteAck`] resolves once the peer has acknowledged every
    /// byte of this write. Dropping it does not cancel the write.
    pub fn write(&self, data: impl Into<Vec<u8>>) -> TransportResult<WriteAck> {
        let link = self.lock();
        let commands = self.writable(&link)?;
        let (notify, ack) = oneshot::channel();
        send(
            commands,
            Command::Write {
                id: self.id,
                key: self.key,
                data: data.into(),
                notify: Some(notify),
            },
        )?;
        Ok(WriteAck { ack })
    }

    /// End the local direction. Calling it again is a no-op.
    pub fn end(&self) -> TransportResult<()> {
        let mut link = self.lock();
        match &mut *link {
            Link::Idle => Err(TransportError::NotConnected),
            Link::Destroyed => Err(TransportError::Destroyed),
            Link::Connected { ended: true, .. } => Ok(()),
            Link::Connected { .. } if self.is_closed() => Err(TransportError::Destroyed),
            Link::Connected {
                commands, ended, ..
            } => {
                *ended = true;
                send(
                    commands,
                    Command::End {
                        id: self.id,
                        key: self.key,
                    },
                )
            }
        }
    }

    /// Write a final chunk, then end the local direction.
    pub fn end_with(&self, data: impl Into<Vec<u8>>) -> TransportResult<WriteAck> {
        let ack = self.write(data)?;
        self.end()?;
        Ok(ack)
    }

    /// Send an unordered, reliable message.
    ///
    /// Messages are never split and may overtake each other and the ordered
    /// stream. They stay available after `end`.
    pub fn send(&self, data: impl Into<Vec<u8>>) -> TransportResult<()> {
        let data = data.into();
        let link = self.lock();
        match &*link {
            Link::Idle => Err(TransportError::NotConnected),
            Link::Destroyed => Err(TransportError::Destroyed),
            Link::Connected { .. } if self.is_closed() => Err(TransportError::Destroyed),
            Link::Connected { max_payload, .. } if data.len() > *max_payload => {
                Err(TransportError::MessageTooLarge {
                    size: data.len(),
                    max: *max_payload,
                })
            }
            Link::Connected { commands, .. } => send(
                commands,
                Command::Send {
                    id: self.id,
                    key: self.key,
                    data,
                },
            ),
        }
    }

    /// Destroy the stream.
    ///
    /// Pending data is discarded and the peer is told to reset. Safe in any
    /// state, including right after `end`; later calls do nothing.
    pub fn destroy(&self) {
        self.teardown(None);
    }

    /// Destroy the stream, reporting `error` before the final close.
    pub fn destroy_with(&self, error: StreamError) {
        self.teardown(Some(error));
    }

    /// Wait for the next event.
    ///
    /// Returns `None` after [`StreamEvent::Close`] has been returned.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        if self.drained {
            return None;
        }
        let event = self.events.recv().await?;
        self.drained = event == StreamEvent::Close;
        Some(event)
    }

    /// Take the next event if one is ready.
    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        if self.drained {
            return None;
        }
        let event = self.events.try_recv().ok()?;
        self.drained = event == StreamEvent::Close;
        Some(event)
    }

    fn teardown(&self, error: Option<StreamError>) {
        let mut link = self.lock();
        match std::mem::replace(&mut *link, Link::Destroyed) {
            Link::Idle => {
                // Never reached the socket task; close locally
                self.closed.store(true, Ordering::Release);
                if let Some(error) = error {
                    let _ = self.events_tx.send(StreamEvent::Error(error));
                }
                let _ = self.events_tx.send(StreamEvent::Close);
            }
            Link::Connected { commands, .. } => {
                // A stopped socket task already closed the stream
                let _ = commands.send(Command::Destroy {
                    id: self.id,
                    key: self.key,
                    error,
                });
            }
            Link::Destroyed => {}
        }
    }

    fn writable<'a>(&self, link: &'a Link) -> TransportResult<&'a mpsc::UnboundedSender<Command>> {
        match link {
            Link::Idle => Err(TransportError::NotConnected),
            Link::Destroyed => Err(TransportError::Destroyed),
            Link::Connected { .. } if self.is_closed() => Err(TransportError::Destroyed),
            Link::Connected { ended: true, .. } => Err(TransportError::WriteAfterEnd),
            Link::Connected { commands, .. } => Ok(commands),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.teardown(None);
    }
}

fn send(commands: &mpsc::UnboundedSender<Command>, command: Command) -> TransportResult<()> {
    commands
        .send(command)
        .map_err(|_| TransportError::SocketClosed)
}
