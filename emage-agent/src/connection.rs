//! Controller session: connect, hello, receive loop, reconnect with backoff.
//! One session loop per agent; replies and reports share the agent's writer.

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use emage_core::wire::{
    encode_frame, encode_message, FrameBuffer, FrameDecodeError, DEFAULT_MAX_FRAME_LEN,
};
use emage_core::{AgentCore, EnbId, Message, ReportBuffer};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::AgentError;

const READ_CHUNK: usize = 16 * 1024;

/// Default controller endpoint.
pub const DEFAULT_CONTROLLER_ADDR: &str = "127.0.0.1:2210";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionStatus {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionStatus::Connecting,
            2 => ConnectionStatus::Connected,
            _ => ConnectionStatus::Disconnected,
        }
    }
}

/// Where and how an agent reaches its controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// `host:port` of the controller.
    pub addr: String,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    /// Reports kept while disconnected; the oldest is evicted on overflow.
    pub report_buffer: usize,
    /// Inbound envelopes larger than this end the session.
    pub max_frame_len: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_CONTROLLER_ADDR.to_string(),
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
            report_buffer: 32,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Exponential reconnect delay with up to 25% jitter, capped at `max`.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Self {
            initial,
            max,
            next: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        let jitter_ms = (base.as_millis() / 4) as u64;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        (base + Duration::from_millis(jitter)).min(self.max)
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// What happened to a report handed to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// No matching trigger armed; the report was never built.
    Skipped,
    Sent,
    /// Not connected; kept for the next session.
    Buffered,
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct Session {
    writer: Option<BoxedWriter>,
    outbox: ReportBuffer,
    /// Dropped together with the writer, which ends the session's receive loop.
    lost: Option<oneshot::Sender<()>>,
}

/// Outbound half of an agent's controller session. The writer lock is held for a whole frame,
/// so header and payload never interleave with another sender. Closing the link aborts any
/// write in progress.
pub struct Link {
    enb_id: EnbId,
    status: AtomicU8,
    session: Mutex<Session>,
    closed: watch::Sender<bool>,
}

impl Link {
    pub fn new(enb_id: EnbId, report_capacity: usize) -> Self {
        Self {
            enb_id,
            status: AtomicU8::new(ConnectionStatus::Disconnected as u8),
            session: Mutex::new(Session {
                writer: None,
                outbox: ReportBuffer::new(report_capacity),
                lost: None,
            }),
            closed: watch::channel(false).0,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Stop the agent's session loop and interrupt pending writes. Permanent.
    pub(crate) fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Flips to true once the link is closed.
    pub(crate) fn closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Reports waiting for the next session.
    pub async fn buffered(&self) -> usize {
        self.session.lock().await.outbox.len()
    }

    /// Frame and send a raw payload.
    pub async fn send(&self, payload: &[u8]) -> Result<(), AgentError> {
        let frame = encode_frame(payload)?;
        self.send_frame(&frame).await
    }

    pub async fn send_message(&self, msg: &Message) -> Result<(), AgentError> {
        let frame = encode_message(msg)?;
        self.send_frame(&frame).await
    }

    /// Write one frame completely or fail. A failed write ends the session.
    async fn send_frame(&self, frame: &[u8]) -> Result<(), AgentError> {
        let mut session = self.session.lock().await;
        let Some(writer) = session.writer.as_mut() else {
            return Err(AgentError::NotConnected);
        };
        if let Err(e) = self.write(writer, frame).await {
            self.drop_writer(&mut session);
            return Err(e.into());
        }
        Ok(())
    }

    /// Send a report now, or buffer it if there is no session.
    pub async fn send_report(&self, report: &Message) -> Result<ReportOutcome, AgentError> {
        let frame = encode_message(report)?;
        let mut session = self.session.lock().await;
        if let Some(writer) = session.writer.as_mut() {
            match self.write(writer, &frame).await {
                Ok(()) => return Ok(ReportOutcome::Sent),
                Err(e) => {
                    warn!(enb_id = self.enb_id, error = %e, "report write failed, buffering");
                    self.drop_writer(&mut session);
                }
            }
        }
        if session.outbox.push(frame).is_some() {
            warn!(
                enb_id = self.enb_id,
                capacity = session.outbox.capacity(),
                evicted = session.outbox.evicted(),
                "report buffer full, oldest report evicted"
            );
        }
        Ok(ReportOutcome::Buffered)
    }

    /// Install a fresh transport: hello first, then buffered reports in arrival order, then
    /// mark the link connected. Reports that could not be flushed stay buffered.
    ///
    /// The returned receiver resolves once the writer is dropped.
    async fn attach(
        &self,
        mut writer: BoxedWriter,
        hello: &Message,
    ) -> Result<oneshot::Receiver<()>, AgentError> {
        let hello = encode_message(hello)?;
        let mut session = self.session.lock().await;
        self.write(&mut writer, &hello).await?;
        let pending = session.outbox.drain();
        let flushed = pending.len();
        let mut rest = pending.into_iter();
        while let Some(frame) = rest.next() {
            if let Err(e) = self.write(&mut writer, &frame).await {
                let mut unsent = vec![frame];
                unsent.extend(rest);
                session.outbox.requeue_front(unsent);
                return Err(e.into());
            }
        }
        if flushed > 0 {
            debug!(enb_id = self.enb_id, flushed, "buffered reports flushed");
        }
        let (lost_tx, lost_rx) = oneshot::channel();
        session.writer = Some(writer);
        session.lost = Some(lost_tx);
        self.set_status(ConnectionStatus::Connected);
        Ok(lost_rx)
    }

    /// Close the writer and mark the link disconnected.
    pub(crate) async fn detach(&self) {
        let mut session = self.session.lock().await;
        self.drop_writer(&mut session);
    }

    fn drop_writer(&self, session: &mut Session) {
        session.writer = None;
        session.lost = None;
        self.set_status(ConnectionStatus::Disconnected);
    }

    /// Write a frame unless the link is closed first.
    async fn write(&self, writer: &mut BoxedWriter, frame: &[u8]) -> io::Result<()> {
        let mut closed = self.closed();
        tokio::select! {
            biased;
            _ = cancelled(&mut closed) => {
                Err(io::Error::new(io::ErrorKind::Interrupted, "agent is stopping"))
            }
            r = write_frame(writer, frame) => r,
        }
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Why a receive loop returned.
#[derive(Debug)]
pub(crate) enum SessionEnd {
    Shutdown,
    Closed,
    Transport(io::Error),
    Protocol(FrameDecodeError),
}

/// Resolves once the agent is told to stop (or its owner is gone).
pub(crate) async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Sleep for `delay`; true if the agent was told to stop meanwhile.
async fn sleep_or_cancel(delay: Duration, rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = cancelled(rx) => true,
    }
}

/// Agent lifecycle: connect, serve the session, reconnect with backoff, until told to stop.
pub(crate) async fn run(
    core: Arc<AgentCore>,
    link: Arc<Link>,
    config: ControllerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let enb_id = core.enb_id();
    let mut backoff = Backoff::new(config.reconnect_initial, config.reconnect_max);
    loop {
        if *shutdown.borrow() {
            break;
        }
        link.set_status(ConnectionStatus::Connecting);
        let connected = tokio::select! {
            biased;
            _ = cancelled(&mut shutdown) => break,
            r = TcpStream::connect(config.addr.as_str()) => r,
        };
        let stream = match connected {
            Ok(s) => s,
            Err(e) => {
                link.set_status(ConnectionStatus::Disconnected);
                let delay = backoff.next_delay();
                debug!(
                    enb_id,
                    addr = %config.addr,
                    error = %e,
                    ?delay,
                    "controller connect failed"
                );
                if sleep_or_cancel(delay, &mut shutdown).await {
                    break;
                }
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        let lost = match link.attach(Box::new(writer), &core.hello()).await {
            Ok(lost) => lost,
            Err(e) => {
                link.detach().await;
                let delay = backoff.next_delay();
                warn!(enb_id, error = %e, ?delay, "controller session setup failed");
                if sleep_or_cancel(delay, &mut shutdown).await {
                    break;
                }
                continue;
            }
        };
        backoff.reset();
        info!(enb_id, addr = %config.addr, "connected to controller");

        let max = config.max_frame_len;
        let end = receive_loop(&core, &link, reader, max, &mut shutdown, lost).await;
        link.detach().await;
        // Writes interrupted by a stop surface as transport errors; none of it is a loss.
        if *shutdown.borrow() {
            break;
        }
        match end {
            SessionEnd::Shutdown => break,
            SessionEnd::Closed => info!(enb_id, "controller closed the session"),
            SessionEnd::Transport(e) => warn!(enb_id, error = %e, "controller session failed"),
            SessionEnd::Protocol(e) => {
                warn!(enb_id, error = %e, "unrecoverable stream, dropping session")
            }
        }
        notify_disconnected(&core).await;
        if sleep_or_cancel(backoff.next_delay(), &mut shutdown).await {
            break;
        }
    }
    link.detach().await;
    debug!(enb_id, "session loop stopped");
}

/// Read envelopes and handle them one at a time: a command and its reply complete before the
/// next read. Ends as soon as the writer is lost, so no command is handled while disconnected.
pub(crate) async fn receive_loop<R: AsyncRead + Unpin>(
    core: &Arc<AgentCore>,
    link: &Link,
    mut reader: R,
    max_frame_len: u32,
    shutdown: &mut watch::Receiver<bool>,
    mut lost: oneshot::Receiver<()>,
) -> SessionEnd {
    let mut frames = FrameBuffer::new(max_frame_len);
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        loop {
            if *shutdown.borrow() {
                return SessionEnd::Shutdown;
            }
            if !matches!(lost.try_recv(), Err(TryRecvError::Empty)) {
                return SessionEnd::Transport(writer_lost());
            }
            match frames.next_frame() {
                Ok(Some(payload)) => handle_inbound(core, link, payload).await,
                Ok(None) => break,
                Err(e) => return SessionEnd::Protocol(e),
            }
        }
        let n = tokio::select! {
            biased;
            _ = cancelled(shutdown) => return SessionEnd::Shutdown,
            _ = &mut lost => return SessionEnd::Transport(writer_lost()),
            r = reader.read(&mut chunk) => match r {
                Ok(0) => return SessionEnd::Closed,
                Ok(n) => n,
                Err(e) => return SessionEnd::Transport(e),
            },
        };
        frames.extend(&chunk[..n]);
    }
}

fn writer_lost() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "controller write failed")
}

async fn handle_inbound(core: &Arc<AgentCore>, link: &Link, payload: Vec<u8>) {
    let dispatcher = Arc::clone(core);
    let reply =
        match tokio::task::spawn_blocking(move || dispatcher.on_message_received(&payload)).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(enb_id = core.enb_id(), error = %e, "inbound handler panicked");
                return;
            }
        };
    if let Some(reply) = reply {
        if let Err(e) = link.send_message(&reply).await {
            warn!(enb_id = core.enb_id(), error = %e, "reply not delivered");
        }
    }
}

async fn notify_disconnected(core: &Arc<AgentCore>) {
    let core = Arc::clone(core);
    let enb_id = core.enb_id();
    if let Err(e) = tokio::task::spawn_blocking(move || core.ops().disconnected()).await {
        warn!(enb_id, error = %e, "disconnected callback panicked");
    }
}
