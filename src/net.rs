//! Framed, multiplexed connections.
//!
//! A [`Connection`] wraps any byte stream and exchanges length-prefixed
//! [`Frame`]s over it. A reader task and a writer task own the two halves of
//! the stream, so `send` and `receive` never block unrelated work, and frames
//! go out in the order they were sent.
//!
//! Once a connection is closed, by either side, `send` fails. Frames queued
//! before the close are still flushed, unless the writer was stuck mid-frame.

pub mod client;
pub mod server;

use crate::{codec::Frame, config::ConnectionConfig, error::ConnectionClosed};
use async_bincode::{
    tokio::{AsyncBincodeReader, AsyncBincodeWriter},
    AsyncDestination,
};
use futures::{SinkExt, StreamExt};
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{self, AsyncRead, AsyncWrite, BufWriter},
    net::{TcpStream, ToSocketAddrs},
    sync::{mpsc, watch, Mutex},
    task, time,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// How long a closing writer keeps trying to flush frames queued before the close.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub struct Connection {
    id: ConnectionId,
    outbound: mpsc::Sender<Frame>,
    inbound: Mutex<mpsc::Receiver<Frame>>,
    state: Arc<watch::Sender<LinkState>>,
}

impl Connection {
    pub async fn connect(addr: impl ToSocketAddrs, config: &ConnectionConfig) -> io::Result<Self> {
        let sock = TcpStream::connect(addr).await?;
        sock.set_nodelay(true)?;
        Ok(Self::new(sock, config))
    }

    /// Takes ownership of `stream` and starts its reader and writer tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<S>(stream: S, config: &ConnectionConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed));
        let (read_half, write_half) = io::split(stream);
        let reader = AsyncBincodeReader::<_, Frame>::from(read_half);
        let writer = AsyncBincodeWriter::from(BufWriter::new(write_half)).for_async();

        let (state, _) = watch::channel(LinkState::Open);
        let state = Arc::new(state);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue.max(1));

        task::spawn(read_loop(id, reader, inbound_tx, state.clone()));
        task::spawn(write_loop(id, writer, outbound_rx, state.clone()));
        tracing::debug!(connection = %id, "connection opened");

        Self {
            id,
            outbound: outbound_tx,
            inbound: Mutex::new(inbound_rx),
            state,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_open(&self) -> bool {
        *self.state.borrow() == LinkState::Open
    }

    /// Queues `frame` for writing.
    pub async fn send(&self, frame: Frame) -> Result<(), ConnectionClosed> {
        if !self.is_open() {
            return Err(ConnectionClosed);
        }
        self.outbound.send(frame).await.map_err(|_| ConnectionClosed)
    }

    /// Waits for the next complete frame.
    pub async fn receive(&self) -> Result<Frame, ConnectionClosed> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or(ConnectionClosed)
    }

    pub fn close(&self) {
        if self.state.send_replace(LinkState::Closed) == LinkState::Open {
            tracing::debug!(connection = %self.id, "closing connection");
        }
    }

    /// Resolves once the connection is closed, by either side.
    pub async fn closed(&self) {
        wait_closed(&mut self.state.subscribe()).await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

async fn wait_closed(state: &mut watch::Receiver<LinkState>) {
    _ = state.wait_for(|s| *s == LinkState::Closed).await;
}

async fn read_loop<R>(
    id: ConnectionId,
    mut reader: AsyncBincodeReader<R, Frame>,
    inbound: mpsc::Sender<Frame>,
    state: Arc<watch::Sender<LinkState>>,
) where
    R: AsyncRead + Unpin,
{
    let mut closed = state.subscribe();
    loop {
        let next = tokio::select! {
            next = reader.next() => next,
            _ = wait_closed(&mut closed) => break,
        };
        match next {
            Some(Ok(frame)) => {
                tokio::select! {
                    sent = inbound.send(frame) => if sent.is_err() { break },
                    _ = wait_closed(&mut closed) => break,
                }
            }
            Some(Err(err)) => {
                // The length prefix is all we have to resync on, and it
                // can't be trusted once a frame fails to decode.
                tracing::warn!(connection = %id, error = %err, "undecodable frame, closing connection");
                break;
            }
            None => {
                tracing::debug!(connection = %id, "peer closed the connection");
                break;
            }
        }
    }
    state.send_replace(LinkState::Closed);
}

async fn write_loop<W>(
    id: ConnectionId,
    mut writer: AsyncBincodeWriter<W, Frame, AsyncDestination>,
    mut outbound: mpsc::Receiver<Frame>,
    state: Arc<watch::Sender<LinkState>>,
) where
    W: AsyncWrite + Unpin,
{
    let mut closed = state.subscribe();
    let mut intact = true;
    loop {
        let frame = tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = wait_closed(&mut closed) => break,
        };
        let written = tokio::select! {
            biased;
            written = writer.send(frame) => written,
            // A half-written frame can't be finished, so nothing more goes out.
            _ = wait_closed(&mut closed) => {
                intact = false;
                break;
            }
        };
        if let Err(err) = written {
            tracing::warn!(connection = %id, error = %err, "failed to write frame");
            intact = false;
            break;
        }
    }
    state.send_replace(LinkState::Closed);

    // Frames queued before the close still go out, as far as the peer takes them.
    outbound.close();
    if intact {
        let drain = async {
            let mut drained = 0usize;
            while let Ok(frame) = outbound.try_recv() {
                writer.feed(frame).await?;
                drained += 1;
            }
            writer.flush().await.map(|()| drained)
        };
        match time::timeout(DRAIN_TIMEOUT, drain).await {
            Ok(Ok(0)) => {}
            Ok(Ok(drained)) => tracing::debug!(connection = %id, drained, "flushed queued frames after close"),
            Ok(Err(err)) => tracing::debug!(connection = %id, error = %err, "could not flush queued frames after close"),
            Err(_) => tracing::debug!(connection = %id, "gave up flushing queued frames after close"),
        }
    }
}
