//! One multiplexed connection to one server node.
//!
//! Each connection runs two tasks: a read loop that feeds the codec and
//! matches replies against the inflight table (pushes go to the pub/sub
//! dispatcher), and a write pump that drains submissions, registers
//! inflight entries in write order, and coalesces queued frames into a
//! single syscall when it can. A supervisor wraps both and owns the
//! reconnect loop.
//!
//! The failure path is uniform: read error, write error, EOF, fatal codec
//! error, or a missed heartbeat all fail every pending entry with a
//! connection error, mark the node `Probing`, and redial with backoff.
//! Subscriptions replay on the fresh socket; messages published while the
//! connection was down are gone (the protocol has no replay).

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use muninn_proto::{Decoder, Frame, ServerErrorKind, encode_command};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::config::{Config, NodeAddr, ProtocolVersion};
use crate::error::{Error, ErrorKind};
use crate::inflight::{Inflight, Responder};
use crate::pubsub::{PubSubDispatcher, SubscriptionKind, SubscriptionSet};

/// Health of one node's connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Up,
    /// Lost; the supervisor is redialing with backoff.
    Probing,
    Closed,
}

/// Lifecycle notifications from a connection to the router.
///
/// The channel is strictly one-way; the router reaches connections only
/// through their handles, never the reverse.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Up(NodeAddr),
    Down(NodeAddr),
}

pub type EventSender = mpsc::UnboundedSender<ConnectionEvent>;

enum Submission {
    Block {
        frames: Vec<(Vec<Bytes>, Option<Responder>)>,
        deadline: Option<Instant>,
    },
    Shutdown,
}

struct Shared {
    addr: NodeAddr,
    state: AtomicU8,
    subscriptions: Mutex<SubscriptionSet>,
}

impl Shared {
    fn state(&self) -> ConnState {
        match self.state.load(Ordering::Acquire) {
            0 => ConnState::Up,
            1 => ConnState::Probing,
            _ => ConnState::Closed,
        }
    }

    fn set_state(&self, state: ConnState) {
        let value = match state {
            ConnState::Up => 0,
            ConnState::Probing => 1,
            ConnState::Closed => 2,
        };
        self.state.store(value, Ordering::Release);
    }
}

/// A cheaply cloneable handle to one node's connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Submission>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("addr", &self.shared.addr)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl ConnectionHandle {
    pub fn addr(&self) -> &NodeAddr {
        &self.shared.addr
    }

    pub fn state(&self) -> ConnState {
        self.shared.state()
    }

    pub fn is_up(&self) -> bool {
        self.shared.state() == ConnState::Up
    }

    fn submit(&self, submission: Submission) -> Result<(), Error> {
        match self.shared.state() {
            ConnState::Up => {}
            ConnState::Probing => {
                // Reconnects never block a request; it fails fast and the
                // caller decides whether to retry.
                return Err(Error::disconnected(format!(
                    "{} is reconnecting",
                    self.shared.addr
                )));
            }
            ConnState::Closed => return Err(Error::closed()),
        }
        self.tx
            .send(submission)
            .map_err(|_| Error::disconnected("connection task is gone"))
    }

    /// Send one command and wait for its correlated reply.
    ///
    /// Server error replies come back as `Ok(Frame::Error(..))`; `Err` is
    /// reserved for transport-level outcomes (timeout, connection loss,
    /// closing).
    pub async fn request(
        &self,
        parts: Vec<Bytes>,
        deadline: Option<Instant>,
    ) -> Result<Frame, Error> {
        let (tx, rx) = oneshot::channel();
        self.submit(Submission::Block {
            frames: vec![(parts, Some(tx))],
            deadline,
        })?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::disconnected("request dropped during reconnect")),
        }
    }

    /// Send several commands as one contiguous block.
    ///
    /// The frames are written back-to-back with nothing interleaved, which
    /// is what `ASKING` preambles and MULTI/EXEC sequences require.
    pub async fn request_block(
        &self,
        commands: Vec<Vec<Bytes>>,
        deadline: Option<Instant>,
    ) -> Result<Vec<Frame>, Error> {
        let mut receivers = Vec::with_capacity(commands.len());
        let mut frames = Vec::with_capacity(commands.len());
        for parts in commands {
            let (tx, rx) = oneshot::channel();
            frames.push((parts, Some(tx)));
            receivers.push(rx);
        }
        self.submit(Submission::Block { frames, deadline })?;

        let mut replies = Vec::with_capacity(receivers.len());
        for rx in receivers {
            match rx.await {
                Ok(result) => replies.push(result?),
                Err(_) => return Err(Error::disconnected("request dropped during reconnect")),
            }
        }
        Ok(replies)
    }

    /// Send a command that gets no in-band reply (the subscribe family).
    pub fn send_no_reply(&self, parts: Vec<Bytes>) -> Result<(), Error> {
        self.submit(Submission::Block {
            frames: vec![(parts, None)],
            deadline: None,
        })
    }

    /// Record subscription state to replay after a reconnect.
    pub fn track_subscribe(&self, kind: SubscriptionKind, channels: &[Bytes]) {
        self.shared
            .subscriptions
            .lock()
            .add(kind, channels.iter().cloned());
    }

    pub fn track_unsubscribe(&self, kind: SubscriptionKind, channels: &[Bytes]) {
        self.shared.subscriptions.lock().remove(kind, channels);
    }

    /// Shut the connection down; pending and future requests fail with a
    /// closing error.
    pub fn close(&self) {
        self.shared.set_state(ConnState::Closed);
        let _ = self.tx.send(Submission::Shutdown);
    }
}

struct IoPair {
    reader: Box<dyn AsyncRead + Unpin + Send>,
    writer: Box<dyn AsyncWrite + Unpin + Send>,
    decoder: Decoder,
}

/// Dial a node, run the handshake, and spawn the connection tasks.
///
/// Handshake failures surface here; a connection that never came up
/// accepts no submissions.
pub async fn connect(
    addr: NodeAddr,
    config: &Config,
    initial_subs: SubscriptionSet,
    pubsub: PubSubDispatcher,
    events: EventSender,
) -> Result<ConnectionHandle, Error> {
    let io = tokio::time::timeout(
        config.connection_timeout,
        dial_and_handshake(&addr, config, &initial_subs),
    )
    .await
    .map_err(|_| Error::disconnected(format!("timed out connecting to {addr}")))??;

    let shared = Arc::new(Shared {
        addr,
        state: AtomicU8::new(0),
        subscriptions: Mutex::new(initial_subs),
    });
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = ConnectionHandle {
        shared: shared.clone(),
        tx,
    };

    tokio::spawn(supervise(shared, rx, config.clone(), pubsub, events, io));
    Ok(handle)
}

enum SessionEnd {
    Closed,
    ClientGone,
    Failed(Error),
}

async fn supervise(
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<Submission>,
    config: Config,
    pubsub: PubSubDispatcher,
    events: EventSender,
    io: IoPair,
) {
    let mut io = io;
    let mut attempt = 0u32;
    loop {
        let end = session(io, &mut rx, &config, &pubsub).await;
        match end {
            SessionEnd::Closed => {
                tracing::debug!(addr = %shared.addr, "connection closed");
                shared.set_state(ConnState::Closed);
                drain_submissions(&mut rx, Error::closed);
                let _ = events.send(ConnectionEvent::Down(shared.addr.clone()));
                return;
            }
            SessionEnd::ClientGone => {
                shared.set_state(ConnState::Closed);
                return;
            }
            SessionEnd::Failed(error) => {
                tracing::warn!(addr = %shared.addr, %error, "connection lost");
                shared.set_state(ConnState::Probing);
                let _ = events.send(ConnectionEvent::Down(shared.addr.clone()));
            }
        }

        // Reconnect with backoff, failing fast anything submitted while
        // the node is unreachable.
        loop {
            if shared.state() == ConnState::Closed {
                drain_submissions(&mut rx, Error::closed);
                return;
            }
            let wake = Instant::now() + config.reconnect.delay(attempt);
            attempt = attempt.saturating_add(1);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(wake) => break,
                    submission = rx.recv() => match submission {
                        None => return,
                        Some(Submission::Shutdown) => {
                            shared.set_state(ConnState::Closed);
                            drain_submissions(&mut rx, Error::closed);
                            return;
                        }
                        Some(submission) => fail_submission(
                            submission,
                            || Error::disconnected(format!("{} is reconnecting", shared.addr)),
                        ),
                    },
                }
            }

            let subs = shared.subscriptions.lock().clone();
            let dial = tokio::time::timeout(
                config.connection_timeout,
                dial_and_handshake(&shared.addr, &config, &subs),
            )
            .await;
            match dial {
                Ok(Ok(fresh)) => {
                    io = fresh;
                    attempt = 0;
                    shared.set_state(ConnState::Up);
                    if !subs.is_empty() {
                        tracing::warn!(
                            addr = %shared.addr,
                            "resubscribed after reconnect; messages published while \
                             disconnected were not delivered"
                        );
                    }
                    let _ = events.send(ConnectionEvent::Up(shared.addr.clone()));
                    break;
                }
                Ok(Err(error)) => {
                    tracing::debug!(addr = %shared.addr, %error, "reconnect attempt failed");
                }
                Err(_) => {
                    tracing::debug!(addr = %shared.addr, "reconnect attempt timed out");
                }
            }
        }
    }
}

fn drain_submissions(rx: &mut mpsc::UnboundedReceiver<Submission>, error: impl Fn() -> Error) {
    while let Ok(submission) = rx.try_recv() {
        fail_submission(submission, &error);
    }
}

fn fail_submission(submission: Submission, error: impl Fn() -> Error) {
    if let Submission::Block { frames, .. } = submission {
        for (_, responder) in frames {
            if let Some(responder) = responder {
                let _ = responder.send(Err(error()));
            }
        }
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(60 * 60 * 24 * 365)
}

/// Run one live socket until it fails, the client closes, or every handle
/// is dropped.
async fn session(
    io: IoPair,
    rx: &mut mpsc::UnboundedReceiver<Submission>,
    config: &Config,
    pubsub: &PubSubDispatcher,
) -> SessionEnd {
    let IoPair {
        reader,
        mut writer,
        decoder,
    } = io;
    let inflight = Arc::new(Mutex::new(Inflight::new()));
    let (err_tx, mut err_rx) = mpsc::unbounded_channel::<Error>();

    let read_task = tokio::spawn(read_loop(
        reader,
        decoder,
        inflight.clone(),
        pubsub.clone(),
        err_tx.clone(),
    ));

    let mut write_buf = BytesMut::with_capacity(8 * 1024);
    let mut last_activity = Instant::now();

    let end = loop {
        let deadline = inflight.lock().next_deadline();
        let heartbeat_at = config
            .heartbeat_interval
            .map(|interval| last_activity + interval);

        tokio::select! {
            error = err_rx.recv() => {
                break SessionEnd::Failed(
                    error.unwrap_or_else(|| Error::disconnected("read loop ended")),
                );
            }
            submission = rx.recv() => {
                let Some(first) = submission else {
                    break SessionEnd::ClientGone;
                };
                // Coalesce whatever is already queued into one write.
                let mut shutdown = false;
                let mut next = Some(first);
                while let Some(submission) = next.take() {
                    if matches!(submission, Submission::Shutdown) {
                        shutdown = true;
                        break;
                    }
                    encode_submission(submission, &mut write_buf, &inflight);
                    next = rx.try_recv().ok();
                }
                if let Err(error) = flush(&mut writer, &mut write_buf).await {
                    break SessionEnd::Failed(error);
                }
                last_activity = Instant::now();
                if shutdown {
                    break SessionEnd::Closed;
                }
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(far_future)),
                if deadline.is_some() =>
            {
                inflight.lock().expire_due(Instant::now());
            }
            _ = tokio::time::sleep_until(heartbeat_at.unwrap_or_else(far_future)),
                if heartbeat_at.is_some() =>
            {
                if inflight.lock().is_empty() {
                    let (tx, ping_rx) = oneshot::channel();
                    inflight
                        .lock()
                        .register(tx, Some(Instant::now() + config.request_timeout));
                    spawn_ping_watchdog(ping_rx, err_tx.clone());
                    encode_command(&mut write_buf, &[Bytes::from_static(b"PING")]);
                    if let Err(error) = flush(&mut writer, &mut write_buf).await {
                        break SessionEnd::Failed(error);
                    }
                }
                last_activity = Instant::now();
            }
        }
    };

    read_task.abort();
    let failure = match &end {
        SessionEnd::Closed | SessionEnd::ClientGone => None,
        SessionEnd::Failed(error) => Some(error.clone()),
    };
    inflight.lock().fail_all(|| match &failure {
        Some(error) => error.clone(),
        None => Error::closed(),
    });
    end
}

fn encode_submission(
    submission: Submission,
    buf: &mut BytesMut,
    inflight: &Mutex<Inflight>,
) {
    let Submission::Block { frames, deadline } = submission else {
        return;
    };
    let mut table = inflight.lock();
    for (parts, responder) in frames {
        encode_command(buf, &parts);
        if let Some(responder) = responder {
            table.register(responder, deadline);
        }
    }
}

async fn flush(
    writer: &mut Box<dyn AsyncWrite + Unpin + Send>,
    buf: &mut BytesMut,
) -> Result<(), Error> {
    if buf.is_empty() {
        return Ok(());
    }
    writer.write_all(buf).await?;
    writer.flush().await?;
    buf.clear();
    Ok(())
}

fn spawn_ping_watchdog(
    rx: oneshot::Receiver<Result<Frame, Error>>,
    err_tx: mpsc::UnboundedSender<Error>,
) {
    tokio::spawn(async move {
        match rx.await {
            Ok(Ok(_)) => {}
            Ok(Err(error)) if error.is_timeout() => {
                let _ = err_tx.send(Error::disconnected("heartbeat went unanswered"));
            }
            // Connection failure already reported by whoever failed it.
            Ok(Err(_)) | Err(_) => {}
        }
    });
}

async fn read_loop(
    mut reader: Box<dyn AsyncRead + Unpin + Send>,
    mut decoder: Decoder,
    inflight: Arc<Mutex<Inflight>>,
    pubsub: PubSubDispatcher,
    err_tx: mpsc::UnboundedSender<Error>,
) {
    loop {
        loop {
            match decoder.decode() {
                Ok(Some(Frame::Push(frames))) => pubsub.dispatch(frames),
                Ok(Some(frame)) => {
                    if !inflight.lock().complete_next(Ok(frame)) {
                        // A reply with no pending request means the
                        // correlation is skewed beyond repair.
                        let _ = err_tx.send(Error::new(
                            ErrorKind::Protocol,
                            "unsolicited reply frame",
                        ));
                        return;
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    let _ = err_tx.send(error.into());
                    return;
                }
            }
        }
        match reader.read_buf(decoder.buffer_mut()).await {
            Ok(0) => {
                let _ = err_tx.send(Error::disconnected("connection closed by server"));
                return;
            }
            Ok(_) => {}
            Err(error) => {
                let _ = err_tx.send(error.into());
                return;
            }
        }
    }
}

async fn dial_and_handshake(
    addr: &NodeAddr,
    config: &Config,
    subs: &SubscriptionSet,
) -> Result<IoPair, Error> {
    let stream = TcpStream::connect((addr.host.as_str(), addr.port)).await?;
    stream.set_nodelay(true)?;

    if config.use_tls {
        #[cfg(feature = "tls")]
        {
            let stream = tls::connect(stream, &addr.host).await?;
            return handshake(stream, config, subs).await;
        }
        #[cfg(not(feature = "tls"))]
        {
            return Err(Error::new(
                ErrorKind::Config,
                "TLS requested but the `tls` feature is not enabled",
            ));
        }
    }
    handshake(stream, config, subs).await
}

/// Negotiate protocol and credentials, set the client name, and replay
/// subscriptions, then split the stream for the I/O tasks.
async fn handshake<S>(mut stream: S, config: &Config, subs: &SubscriptionSet) -> Result<IoPair, Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut decoder = Decoder::new();

    match config.protocol {
        ProtocolVersion::Resp3 => {
            let mut parts = vec![Bytes::from_static(b"HELLO"), Bytes::from_static(b"3")];
            if let Some(creds) = &config.credentials {
                parts.push(Bytes::from_static(b"AUTH"));
                parts.push(Bytes::from(
                    creds.username.clone().unwrap_or_else(|| "default".into()),
                ));
                parts.push(Bytes::from(creds.password.clone()));
            }
            let reply = call(&mut stream, &mut decoder, &parts).await?;
            if let Frame::Error(error) = reply {
                let downgrade = error.kind == ServerErrorKind::Err
                    && (error.message.starts_with(b"NOPROTO")
                        || error.message_lossy().contains("unknown command"));
                if !downgrade {
                    return Err(Error::from_server(error));
                }
                // Pre-RESP3 server: fall back to RESP2 plus a separate AUTH.
                if !subs.is_empty() || config.pubsub.as_ref().is_some_and(|p| !p.is_empty()) {
                    return Err(Error::new(
                        ErrorKind::Config,
                        "server does not speak RESP3, which pub/sub subscriptions require",
                    ));
                }
                authenticate(&mut stream, &mut decoder, config).await?;
            }
        }
        ProtocolVersion::Resp2 => {
            authenticate(&mut stream, &mut decoder, config).await?;
        }
    }

    if let Some(name) = &config.client_name {
        let reply = call(
            &mut stream,
            &mut decoder,
            &[
                Bytes::from_static(b"CLIENT"),
                Bytes::from_static(b"SETNAME"),
                Bytes::from(name.clone()),
            ],
        )
        .await?;
        if let Frame::Error(error) = reply {
            return Err(Error::from_server(error));
        }
    }

    // Reapply subscription state. The acknowledgements arrive as pushes
    // and are consumed by the dispatcher once the read loop starts.
    let replay = subs.replay_commands();
    if !replay.is_empty() {
        let mut buf = BytesMut::new();
        for parts in replay {
            encode_command(&mut buf, &parts);
        }
        stream.write_all(&buf).await?;
        stream.flush().await?;
    }

    let (reader, writer) = tokio::io::split(stream);
    Ok(IoPair {
        reader: Box::new(reader),
        writer: Box::new(writer),
        decoder,
    })
}

async fn authenticate<S>(stream: &mut S, decoder: &mut Decoder, config: &Config) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(creds) = &config.credentials else {
        return Ok(());
    };
    let mut parts = vec![Bytes::from_static(b"AUTH")];
    if let Some(username) = &creds.username {
        parts.push(Bytes::from(username.clone()));
    }
    parts.push(Bytes::from(creds.password.clone()));

    let reply = call(stream, decoder, &parts).await?;
    match reply {
        Frame::Error(error) => Err(Error::from_server(error)),
        _ => Ok(()),
    }
}

/// Serial request/response against a not-yet-split stream; handshake only.
async fn call<S>(stream: &mut S, decoder: &mut Decoder, parts: &[Bytes]) -> Result<Frame, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    encode_command(&mut buf, parts);
    stream.write_all(&buf).await?;
    stream.flush().await?;

    loop {
        match decoder.decode()? {
            Some(Frame::Push(_)) => continue,
            Some(frame) => return Ok(frame),
            None => {}
        }
        let n = stream.read_buf(decoder.buffer_mut()).await?;
        if n == 0 {
            return Err(Error::disconnected("connection closed during handshake"));
        }
    }
}

#[cfg(feature = "tls")]
mod tls {
    use std::sync::Arc;

    use tokio::net::TcpStream;
    use tokio_rustls::TlsConnector;
    use tokio_rustls::client::TlsStream;

    use crate::error::{Error, ErrorKind};

    /// Upgrade a TCP stream to TLS against the public-root trust store.
    ///
    /// The core only distinguishes plain from TLS; cipher and certificate
    /// policy beyond the platform roots is out of scope.
    pub async fn connect(stream: TcpStream, host: &str) -> Result<TlsStream<TcpStream>, Error> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|_| Error::new(ErrorKind::Config, format!("invalid TLS host `{host}`")))?;
        let connector = TlsConnector::from(Arc::new(config));
        Ok(connector.connect(server_name, stream).await?)
    }
}
