//! Multiplexed session
//!
//! A session owns one underlying connection and runs three background loops:
//! a reader that dispatches inbound frames to streams, a writer that
//! serializes outbound frames, and an optional keepalive. Each stream gets a
//! pump task that moves bytes between its user-facing half and the frame
//! queues.
//!
//! The reader never waits on a stream. Inbound data is queued per stream
//! and bounded by the stream window; the pump hands credit back with `UPD`
//! as the user reads.
//!
//! Any I/O or protocol error closes the whole session. Closing clears the
//! stream table, which delivers EOF to every open stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::frame::{read_frame, Cmd, Frame, StreamTag};
use crate::{MuxError, Result, Stream};

/// Session tuning
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Largest `PSH` payload sent (capped at `u16::MAX`)
    pub max_frame_size: usize,
    /// Unacknowledged bytes allowed in flight per stream and direction;
    /// never below `max_frame_size`
    pub stream_window: u32,
    /// Inbound streams waiting for `accept_stream`
    pub accept_backlog: usize,
    /// Frames queued for the writer
    pub write_queue: usize,
    /// Send `NOP` frames on this interval
    pub keepalive_interval: Option<Duration>,
    /// Close the session when nothing was read for this long; checked on
    /// every keepalive tick
    pub keepalive_timeout: Option<Duration>,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 32 * 1024,
            stream_window: 256 * 1024,
            accept_backlog: 1024,
            write_queue: 256,
            keepalive_interval: Some(Duration::from_secs(10)),
            keepalive_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl MuxConfig {
    fn max_frame(&self) -> usize {
        self.max_frame_size.clamp(1, usize::from(u16::MAX))
    }

    fn window(&self) -> usize {
        (self.stream_window as usize).max(self.max_frame())
    }
}

/// Reader-side state of one stream
struct StreamEntry {
    /// `None` once the peer has sent `FIN`
    inbound: Option<mpsc::UnboundedSender<Bytes>>,
    /// Bytes queued for the pump and not yet taken
    queued: Arc<AtomicUsize>,
    /// Bytes this side may still send
    credit: Arc<Semaphore>,
}

struct Shared {
    config: MuxConfig,
    next_id: AtomicU32,
    streams: Mutex<HashMap<u32, StreamEntry>>,
    frame_tx: mpsc::Sender<Frame>,
    accept_tx: Mutex<Option<mpsc::Sender<Stream>>>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Stream>>,
    closed: watch::Sender<bool>,
    last_read: Mutex<Instant>,
}

impl Shared {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn shutdown(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        // Dropping the senders ends every stream's inbound side
        let dropped = {
            let mut streams = self.streams.lock();
            for entry in streams.values() {
                entry.credit.close();
            }
            let n = streams.len();
            streams.clear();
            n
        };
        self.accept_tx.lock().take();
        debug!("Mux session closed ({} open streams dropped)", dropped);
    }

    async fn wait_closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Register a stream id; fails once the session is closed
    fn register(&self, id: u32, tag: Option<StreamTag>) -> Result<(Stream, Pump)> {
        let (user_io, pump_io) = tokio::io::duplex(self.config.max_frame() * 2);
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let credit = Arc::new(Semaphore::new(self.config.window()));

        {
            let mut streams = self.streams.lock();
            // checked under the lock so shutdown() cannot miss this entry
            if self.is_closed() {
                return Err(MuxError::SessionClosed);
            }
            streams.insert(
                id,
                StreamEntry {
                    inbound: Some(data_tx),
                    queued: queued.clone(),
                    credit: credit.clone(),
                },
            );
        }

        Ok((
            Stream::new(id, tag, user_io),
            Pump {
                id,
                io: pump_io,
                inbound: data_rx,
                queued,
                credit,
            },
        ))
    }

    /// Queue a `PSH` payload for its stream. Returns false if the peer sent
    /// more than the window allows.
    fn push(&self, stream_id: u32, payload: Bytes) -> bool {
        let streams = self.streams.lock();
        let Some(entry) = streams.get(&stream_id) else {
            return true;
        };
        let Some(tx) = &entry.inbound else {
            return true;
        };

        let len = payload.len();
        let queued = entry.queued.fetch_add(len, Ordering::AcqRel) + len;
        if queued > self.config.window() {
            warn!(
                "Mux peer overran the window on stream {} ({} bytes queued)",
                stream_id, queued
            );
            return false;
        }
        if tx.send(payload).is_err() {
            // reader is gone; nothing will ever take these bytes
            entry.queued.fetch_sub(len, Ordering::AcqRel);
        }
        true
    }

    /// Return send credit from an `UPD`. Returns false on more credit than
    /// was ever spent.
    fn add_credit(&self, stream_id: u32, consumed: u32) -> bool {
        let streams = self.streams.lock();
        let Some(entry) = streams.get(&stream_id) else {
            return true;
        };
        let consumed = consumed as usize;
        if entry.credit.available_permits() + consumed > self.config.window() {
            warn!("Mux peer returned excess credit on stream {}", stream_id);
            return false;
        }
        entry.credit.add_permits(consumed);
        true
    }
}

/// Background half of a stream, started after its `SYN` is queued
struct Pump {
    id: u32,
    io: DuplexStream,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    queued: Arc<AtomicUsize>,
    credit: Arc<Semaphore>,
}

impl Pump {
    fn spawn(self, shared: Arc<Shared>) {
        tokio::spawn(async move {
            let Pump {
                id,
                io,
                mut inbound,
                queued,
                credit,
            } = self;
            let (mut reader, mut writer) = tokio::io::split(io);
            let frame_tx = shared.frame_tx.clone();
            let max_frame = shared.config.max_frame();
            let ack_threshold = (shared.config.window() / 4).max(1);

            let outbound = async {
                let mut buf = vec![0u8; max_frame];
                loop {
                    let n = tokio::select! {
                        r = reader.read(&mut buf) => match r {
                            Ok(0) | Err(_) => break,
                            Ok(n) => n,
                        },
                        _ = shared.wait_closed() => return,
                    };
                    // n <= max_frame <= window, so this always resolves
                    // once the peer reads
                    match credit.acquire_many(n as u32).await {
                        Ok(permit) => permit.forget(),
                        Err(_) => return,
                    }
                    let frame = Frame::psh(id, Bytes::copy_from_slice(&buf[..n]));
                    if frame_tx.send(frame).await.is_err() {
                        return;
                    }
                }
                let _ = frame_tx.send(Frame::fin(id)).await;
            };

            let deliver = async {
                let mut consumed = 0usize;
                loop {
                    let chunk = match inbound.try_recv() {
                        Ok(chunk) => chunk,
                        Err(mpsc::error::TryRecvError::Disconnected) => break,
                        Err(mpsc::error::TryRecvError::Empty) => {
                            // Drained: hand back whatever credit is pending
                            if consumed > 0 {
                                if frame_tx.send(Frame::upd(id, consumed as u32)).await.is_err() {
                                    break;
                                }
                                consumed = 0;
                            }
                            match inbound.recv().await {
                                Some(chunk) => chunk,
                                None => break,
                            }
                        }
                    };
                    queued.fetch_sub(chunk.len(), Ordering::AcqRel);
                    if writer.write_all(&chunk).await.is_err() {
                        break;
                    }
                    consumed += chunk.len();
                    if consumed >= ack_threshold {
                        if frame_tx.send(Frame::upd(id, consumed as u32)).await.is_err() {
                            break;
                        }
                        consumed = 0;
                    }
                }
                let _ = writer.shutdown().await;
            };

            tokio::join!(outbound, deliver);
            shared.streams.lock().remove(&id);
        });
    }
}

/// Handle to a multiplexed session; cheap to clone
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("closed", &self.is_closed())
            .field("streams", &self.num_streams())
            .finish()
    }
}

impl Session {
    /// Wrap the dialing side of a connection
    pub fn client<T>(io: T, config: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(io, config, 1)
    }

    /// Wrap the accepting side of a connection
    pub fn server<T>(io: T, config: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(io, config, 2)
    }

    fn new<T>(io: T, config: MuxConfig, first_id: u32) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let (frame_tx, frame_rx) = mpsc::channel(config.write_queue.max(1));
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));
        let (closed, _) = watch::channel(false);
        let keepalive = config.keepalive_interval;

        let shared = Arc::new(Shared {
            config,
            next_id: AtomicU32::new(first_id),
            streams: Mutex::new(HashMap::new()),
            frame_tx,
            accept_tx: Mutex::new(Some(accept_tx)),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            closed,
            last_read: Mutex::new(Instant::now()),
        });

        tokio::spawn(write_loop(shared.clone(), writer, frame_rx));
        tokio::spawn(read_loop(shared.clone(), reader));
        if let Some(interval) = keepalive {
            tokio::spawn(keepalive_loop(shared.clone(), interval));
        }

        Self { shared }
    }

    /// Open a new stream, optionally tagged with a service/port pair
    pub async fn open_stream(&self, tag: Option<StreamTag>) -> Result<Stream> {
        let id = self.shared.next_id.fetch_add(2, Ordering::Relaxed);
        let (stream, pump) = self.shared.register(id, tag)?;

        if self.shared.frame_tx.send(Frame::syn(id, tag)).await.is_err() {
            self.shared.streams.lock().remove(&id);
            return Err(MuxError::SessionClosed);
        }
        pump.spawn(self.shared.clone());
        Ok(stream)
    }

    /// Wait for the peer to open a stream
    pub async fn accept_stream(&self) -> Result<Stream> {
        if self.is_closed() {
            return Err(MuxError::SessionClosed);
        }
        let mut accept_rx = self.shared.accept_rx.lock().await;
        tokio::select! {
            stream = accept_rx.recv() => stream.ok_or(MuxError::SessionClosed),
            _ = self.shared.wait_closed() => Err(MuxError::SessionClosed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Resolve once the session is closed; every waiter is woken
    pub async fn closed(&self) {
        self.shared.wait_closed().await
    }

    /// Close the session and every stream in it. Idempotent.
    pub fn close(&self) {
        self.shared.shutdown();
    }

    pub fn num_streams(&self) -> usize {
        self.shared.streams.lock().len()
    }
}

async fn write_loop<W>(shared: Arc<Shared>, mut writer: W, mut frames: mpsc::Receiver<Frame>)
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    loop {
        let frame = tokio::select! {
            frame = frames.recv() => frame,
            _ = shared.wait_closed() => break,
        };
        let Some(frame) = frame else { break };

        buf.clear();
        frame.encode(&mut buf);
        if let Err(e) = writer.write_all(&buf).await {
            debug!("Mux write failed: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
    shared.shutdown();
}

async fn read_loop<R>(shared: Arc<Shared>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader) => frame,
            _ = shared.wait_closed() => return,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(MuxError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("Mux peer closed connection");
                break;
            }
            Err(e) => {
                warn!("Mux read failed: {}", e);
                break;
            }
        };
        *shared.last_read.lock() = Instant::now();

        match frame.cmd {
            Cmd::Syn => {
                let tag = match frame.tag() {
                    Ok(tag) => tag,
                    Err(e) => {
                        warn!("Mux protocol error on stream {}: {}", frame.stream_id, e);
                        break;
                    }
                };
                let (stream, pump) = match shared.register(frame.stream_id, tag) {
                    Ok(registered) => registered,
                    Err(_) => break,
                };
                pump.spawn(shared.clone());

                let accept_tx = shared.accept_tx.lock().clone();
                match accept_tx.map(|tx| tx.try_send(stream)) {
                    Some(Ok(())) => {}
                    Some(Err(mpsc::error::TrySendError::Full(_))) => {
                        warn!("Mux accept backlog full, refusing stream {}", frame.stream_id);
                    }
                    _ => {}
                }
            }
            Cmd::Psh => {
                if !shared.push(frame.stream_id, frame.payload) {
                    break;
                }
            }
            Cmd::Upd => {
                let consumed = match frame.consumed() {
                    Ok(consumed) => consumed,
                    Err(e) => {
                        warn!("Mux protocol error on stream {}: {}", frame.stream_id, e);
                        break;
                    }
                };
                if !shared.add_credit(frame.stream_id, consumed) {
                    break;
                }
            }
            Cmd::Fin => {
                if let Some(entry) = shared.streams.lock().get_mut(&frame.stream_id) {
                    entry.inbound = None;
                }
            }
            Cmd::Nop => {}
        }
    }
    shared.shutdown();
}

async fn keepalive_loop(shared: Arc<Shared>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shared.wait_closed() => return,
        }

        if let Some(limit) = shared.config.keepalive_timeout {
            let silent = shared.last_read.lock().elapsed();
            if silent > limit {
                warn!("Mux peer silent for {:?}, closing session", silent);
                shared.shutdown();
                return;
            }
        }
        if shared.frame_tx.send(Frame::nop()).await.is_err() {
            return;
        }
    }
}
