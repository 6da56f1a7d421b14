//! Push-frame classification and delivery.
//!
//! The read loop hands every `>` frame here. Subscription acknowledgements
//! are consumed silently; messages go either to the registered callback
//! (synchronously, from the read-loop task) or into a bounded queue drained
//! by the pull API.
//!
//! Messages published while a connection is down are lost; the protocol has
//! no replay. Reconnects log a warning to that effect and move on.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use muninn_proto::Frame;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::config::{MessageCallback, PubsubConfig};
use crate::error::{Error, ErrorKind};

/// Queued messages kept per client before the oldest is dropped.
pub const QUEUE_LIMIT: usize = 4096;

/// A delivered pub/sub message.
///
/// Shard messages flatten to the same shape; `pattern` is populated only
/// for pattern-subscription deliveries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub channel: Bytes,
    pub message: Bytes,
    pub pattern: Option<Bytes>,
}

/// What a push frame turned out to be.
#[derive(Debug, PartialEq)]
pub enum Push {
    /// A deliverable message.
    Message(Message),
    /// A subscribe/unsubscribe acknowledgement; consumed silently.
    Ack,
    /// Anything else (keyspace notifications and future push kinds).
    Other(Vec<Frame>),
}

fn frame_bytes(frame: &Frame) -> Option<Bytes> {
    frame.as_bytes().cloned()
}

/// Classify a decoded push frame's elements.
pub fn classify_push(frames: Vec<Frame>) -> Push {
    let Some(kind) = frames.first().and_then(|f| f.as_bytes()) else {
        return Push::Other(frames);
    };

    match kind.as_ref() {
        b"message" | b"smessage" if frames.len() == 3 => {
            match (frame_bytes(&frames[1]), frame_bytes(&frames[2])) {
                (Some(channel), Some(message)) => Push::Message(Message {
                    channel,
                    message,
                    pattern: None,
                }),
                _ => Push::Other(frames),
            }
        }
        b"pmessage" if frames.len() == 4 => {
            match (
                frame_bytes(&frames[1]),
                frame_bytes(&frames[2]),
                frame_bytes(&frames[3]),
            ) {
                (Some(pattern), Some(channel), Some(message)) => Push::Message(Message {
                    channel,
                    message,
                    pattern: Some(pattern),
                }),
                _ => Push::Other(frames),
            }
        }
        b"subscribe" | b"unsubscribe" | b"psubscribe" | b"punsubscribe" | b"ssubscribe"
        | b"sunsubscribe" => Push::Ack,
        _ => Push::Other(frames),
    }
}

/// Routes classified pushes to a callback or the pull queue.
#[derive(Clone)]
pub struct PubSubDispatcher {
    inner: Arc<DispatchInner>,
}

struct DispatchInner {
    configured: bool,
    callback: Option<MessageCallback>,
    queue: Mutex<VecDeque<Message>>,
    notify: Notify,
    closed: AtomicBool,
}

impl fmt::Debug for PubSubDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSubDispatcher")
            .field("configured", &self.inner.configured)
            .field("callback", &self.inner.callback.is_some())
            .field("queued", &self.inner.queue.lock().len())
            .finish()
    }
}

impl PubSubDispatcher {
    pub fn new(config: Option<&PubsubConfig>) -> Self {
        PubSubDispatcher {
            inner: Arc::new(DispatchInner {
                configured: config.is_some(),
                callback: config.and_then(|c| c.callback.clone()),
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Handle one push frame from a read loop.
    pub fn dispatch(&self, frames: Vec<Frame>) {
        match classify_push(frames) {
            Push::Ack => {}
            Push::Other(frames) => {
                tracing::trace!(
                    kind = frames.first().and_then(|f| f.as_str()).unwrap_or("?"),
                    "dropping unhandled push frame"
                );
            }
            Push::Message(message) => {
                if let Some(callback) = &self.inner.callback {
                    callback(message);
                    return;
                }
                let mut queue = self.inner.queue.lock();
                if queue.len() >= QUEUE_LIMIT {
                    queue.pop_front();
                    tracing::warn!(
                        limit = QUEUE_LIMIT,
                        "pub/sub queue full, dropping oldest message"
                    );
                }
                queue.push_back(message);
                drop(queue);
                self.inner.notify.notify_waiters();
            }
        }
    }

    /// Block until the next message arrives.
    ///
    /// Fails when the client is closing, when no pub/sub was configured,
    /// or when a callback owns delivery.
    pub async fn recv(&self) -> Result<Message, Error> {
        self.pull_allowed()?;
        loop {
            let notified = self.inner.notify.notified();
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(Error::closed());
            }
            if let Some(message) = self.inner.queue.lock().pop_front() {
                return Ok(message);
            }
            notified.await;
        }
    }

    /// Pop the next queued message without waiting.
    pub fn try_recv(&self) -> Result<Option<Message>, Error> {
        self.pull_allowed()?;
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::closed());
        }
        Ok(self.inner.queue.lock().pop_front())
    }

    fn pull_allowed(&self) -> Result<(), Error> {
        if !self.inner.configured {
            return Err(Error::new(
                ErrorKind::Config,
                "no pub/sub subscriptions configured",
            ));
        }
        if self.inner.callback.is_some() {
            return Err(Error::new(
                ErrorKind::Config,
                "pull is unavailable while a message callback is registered",
            ));
        }
        Ok(())
    }

    /// Wake all pull waiters with a closing error.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }
}

/// The channel classes a subscription can belong to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionKind {
    Exact,
    Pattern,
    Shard,
}

impl SubscriptionKind {
    pub fn subscribe_token(self) -> &'static str {
        match self {
            SubscriptionKind::Exact => "SUBSCRIBE",
            SubscriptionKind::Pattern => "PSUBSCRIBE",
            SubscriptionKind::Shard => "SSUBSCRIBE",
        }
    }

    pub fn unsubscribe_token(self) -> &'static str {
        match self {
            SubscriptionKind::Exact => "UNSUBSCRIBE",
            SubscriptionKind::Pattern => "PUNSUBSCRIBE",
            SubscriptionKind::Shard => "SUNSUBSCRIBE",
        }
    }
}

/// The desired subscription state of one connection.
///
/// Reapplied verbatim when the connection is re-established.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionSet {
    channels: BTreeSet<Bytes>,
    patterns: BTreeSet<Bytes>,
    shard_channels: BTreeSet<Bytes>,
}

impl SubscriptionSet {
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.patterns.is_empty() && self.shard_channels.is_empty()
    }

    fn set_mut(&mut self, kind: SubscriptionKind) -> &mut BTreeSet<Bytes> {
        match kind {
            SubscriptionKind::Exact => &mut self.channels,
            SubscriptionKind::Pattern => &mut self.patterns,
            SubscriptionKind::Shard => &mut self.shard_channels,
        }
    }

    pub fn add(&mut self, kind: SubscriptionKind, channels: impl IntoIterator<Item = Bytes>) {
        self.set_mut(kind).extend(channels);
    }

    pub fn remove(&mut self, kind: SubscriptionKind, channels: &[Bytes]) {
        let set = self.set_mut(kind);
        for channel in channels {
            set.remove(channel);
        }
    }

    /// The commands that restore this state on a fresh connection.
    pub fn replay_commands(&self) -> Vec<Vec<Bytes>> {
        let mut out = Vec::new();
        for (kind, set) in [
            (SubscriptionKind::Exact, &self.channels),
            (SubscriptionKind::Pattern, &self.patterns),
            (SubscriptionKind::Shard, &self.shard_channels),
        ] {
            if !set.is_empty() {
                let mut parts = Vec::with_capacity(set.len() + 1);
                parts.push(Bytes::from_static(kind.subscribe_token().as_bytes()));
                parts.extend(set.iter().cloned());
                out.push(parts);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(parts: &[&str]) -> Vec<Frame> {
        parts.iter().map(|p| Frame::bulk(p)).collect()
    }

    #[test]
    fn classify_message_shapes() {
        assert_eq!(
            classify_push(push(&["message", "c", "hello"])),
            Push::Message(Message {
                channel: Bytes::from_static(b"c"),
                message: Bytes::from_static(b"hello"),
                pattern: None,
            })
        );
        assert_eq!(
            classify_push(push(&["pmessage", "c*", "c1", "hi"])),
            Push::Message(Message {
                channel: Bytes::from_static(b"c1"),
                message: Bytes::from_static(b"hi"),
                pattern: Some(Bytes::from_static(b"c*")),
            })
        );
        // Shard messages flatten to the plain shape.
        assert_eq!(
            classify_push(push(&["smessage", "s", "x"])),
            Push::Message(Message {
                channel: Bytes::from_static(b"s"),
                message: Bytes::from_static(b"x"),
                pattern: None,
            })
        );
    }

    #[test]
    fn acks_are_consumed() {
        for kind in [
            "subscribe",
            "unsubscribe",
            "psubscribe",
            "punsubscribe",
            "ssubscribe",
            "sunsubscribe",
        ] {
            let frames = vec![Frame::bulk(kind), Frame::bulk("c"), Frame::Integer(1)];
            assert_eq!(classify_push(frames), Push::Ack, "kind: {kind}");
        }
    }

    #[test]
    fn unknown_pushes_are_passed_through() {
        let frames = push(&["invalidate", "k"]);
        assert!(matches!(classify_push(frames), Push::Other(_)));
    }

    #[tokio::test]
    async fn queue_preserves_arrival_order() {
        let dispatcher = PubSubDispatcher::new(Some(&PubsubConfig::default()));
        dispatcher.dispatch(push(&["message", "c", "one"]));
        dispatcher.dispatch(push(&["message", "c", "two"]));

        assert_eq!(dispatcher.recv().await.unwrap().message.as_ref(), b"one");
        assert_eq!(dispatcher.recv().await.unwrap().message.as_ref(), b"two");
        assert_eq!(dispatcher.try_recv().unwrap(), None);
    }

    #[tokio::test]
    async fn pull_without_configuration_fails() {
        let dispatcher = PubSubDispatcher::new(None);
        let err = dispatcher.recv().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[tokio::test]
    async fn pull_with_callback_fails() {
        let config = PubsubConfig {
            callback: Some(Arc::new(|_| {})),
            ..PubsubConfig::default()
        };
        let dispatcher = PubSubDispatcher::new(Some(&config));
        assert_eq!(dispatcher.recv().await.unwrap_err().kind(), ErrorKind::Config);
    }

    #[tokio::test]
    async fn callback_receives_messages_synchronously() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let config = PubsubConfig {
            callback: Some(Arc::new(move |msg: Message| {
                sink.lock().push(msg.message);
            })),
            ..PubsubConfig::default()
        };
        let dispatcher = PubSubDispatcher::new(Some(&config));
        dispatcher.dispatch(push(&["message", "c", "hello"]));
        assert_eq!(received.lock().as_slice(), &[Bytes::from_static(b"hello")]);
    }

    #[tokio::test]
    async fn close_wakes_blocked_pullers() {
        let dispatcher = PubSubDispatcher::new(Some(&PubsubConfig::default()));
        let waiter = dispatcher.clone();
        let task = tokio::spawn(async move { waiter.recv().await });
        tokio::task::yield_now().await;
        dispatcher.close();
        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_closing());
    }

    #[tokio::test]
    async fn overflow_drops_the_oldest() {
        let dispatcher = PubSubDispatcher::new(Some(&PubsubConfig::default()));
        for i in 0..(QUEUE_LIMIT + 1) {
            dispatcher.dispatch(push(&["message", "c", &i.to_string()]));
        }
        let first = dispatcher.recv().await.unwrap();
        assert_eq!(first.message.as_ref(), b"1");
    }

    #[test]
    fn replay_commands_cover_every_class() {
        let mut set = SubscriptionSet::default();
        set.add(SubscriptionKind::Exact, [Bytes::from_static(b"a")]);
        set.add(SubscriptionKind::Pattern, [Bytes::from_static(b"p*")]);
        set.add(SubscriptionKind::Shard, [Bytes::from_static(b"s")]);

        let commands = set.replay_commands();
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[0][0].as_ref(), b"SUBSCRIBE");
        assert_eq!(commands[1][0].as_ref(), b"PSUBSCRIBE");
        assert_eq!(commands[2][0].as_ref(), b"SSUBSCRIBE");

        set.remove(SubscriptionKind::Exact, &[Bytes::from_static(b"a")]);
        set.remove(SubscriptionKind::Pattern, &[Bytes::from_static(b"p*")]);
        set.remove(SubscriptionKind::Shard, &[Bytes::from_static(b"s")]);
        assert!(set.is_empty());
    }
}
