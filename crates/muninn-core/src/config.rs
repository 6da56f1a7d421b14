use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;

use crate::error::{Error, ErrorKind};
use crate::pubsub::Message;

/// Host and port of one server node.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

impl NodeAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        NodeAddr {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host:port` string.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| Error::new(ErrorKind::Config, format!("invalid address `{s}`")))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::new(ErrorKind::Config, format!("invalid port in `{s}`")))?;
        Ok(NodeAddr::new(host, port))
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl PartialOrd for NodeAddr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeAddr {
    fn cmp(&self, other: &Self) -> Ordering {
        self.host
            .cmp(&other.host)
            .then_with(|| self.port.cmp(&other.port))
    }
}

/// Credentials supplied during the handshake.
#[derive(Clone)]
pub struct Credentials {
    /// Defaults to the `default` user when absent.
    pub username: Option<String>,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Where read-only commands may be dispatched in cluster mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReadPolicy {
    /// All commands go to the slot primary.
    #[default]
    Primary,
    /// Reads round-robin over healthy replicas, falling back to the
    /// primary. Writes always go to the primary.
    PreferReplica,
}

/// Wire protocol version requested at handshake.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProtocolVersion {
    Resp2,
    #[default]
    Resp3,
}

/// How bulk payloads decode at the facade.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DecodeMode {
    /// Raw bytes, always lossless.
    #[default]
    Bytes,
    /// UTF-8 text; invalid sequences fall back to bytes.
    Text,
}

/// Synchronous delivery sink for push messages.
pub type MessageCallback = Arc<dyn Fn(Message) + Send + Sync>;

/// Pub/sub subscriptions applied at handshake time.
#[derive(Clone, Default)]
pub struct PubsubConfig {
    pub channels: Vec<Bytes>,
    pub patterns: Vec<Bytes>,
    /// Shard channels; cluster mode only.
    pub shard_channels: Vec<Bytes>,
    /// When present, messages are delivered synchronously from the read
    /// loop and the pull API is unavailable.
    pub callback: Option<MessageCallback>,
}

impl PubsubConfig {
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.patterns.is_empty() && self.shard_channels.is_empty()
    }
}

impl fmt::Debug for PubsubConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubsubConfig")
            .field("channels", &self.channels.len())
            .field("patterns", &self.patterns.len())
            .field("shard_channels", &self.shard_channels.len())
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Exponential backoff with jitter for reconnect attempts.
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Multiplier applied per failed attempt.
    pub multiplier: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (zero-based), jittered by up
    /// to 25% to spread thundering herds.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self
            .initial_delay
            .saturating_mul(self.multiplier.saturating_pow(attempt.min(16)))
            .min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
        base + Duration::from_millis(jitter)
    }
}

/// Client configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Seed addresses. Standalone mode uses the first; cluster mode tries
    /// each until topology discovery succeeds.
    pub addresses: Vec<NodeAddr>,
    pub use_tls: bool,
    pub credentials: Option<Credentials>,
    /// Default deadline applied to every request.
    pub request_timeout: Duration,
    /// Deadline for dialing and handshaking one connection.
    pub connection_timeout: Duration,
    pub read_from: ReadPolicy,
    pub protocol: ProtocolVersion,
    /// Applied with `CLIENT SETNAME` during the handshake.
    pub client_name: Option<String>,
    pub default_decoder: DecodeMode,
    pub pubsub: Option<PubsubConfig>,
    pub cluster_mode: bool,
    /// `PING` after this much idle time; `None` disables the heartbeat.
    pub heartbeat_interval: Option<Duration>,
    pub reconnect: ReconnectPolicy,
    /// Redirections followed per request before the error surfaces.
    pub max_redirections: u32,
    /// Periodic topology refresh; `None` disables it.
    pub topology_refresh_interval: Option<Duration>,
    /// Accumulated MOVED replies that schedule an early topology refresh.
    pub moved_refresh_threshold: u32,
}

impl Config {
    pub fn new(addresses: Vec<NodeAddr>) -> Self {
        Config {
            addresses,
            use_tls: false,
            credentials: None,
            request_timeout: Duration::from_secs(10),
            connection_timeout: Duration::from_secs(10),
            read_from: ReadPolicy::default(),
            protocol: ProtocolVersion::default(),
            client_name: None,
            default_decoder: DecodeMode::default(),
            pubsub: None,
            cluster_mode: false,
            heartbeat_interval: Some(Duration::from_secs(30)),
            reconnect: ReconnectPolicy::default(),
            max_redirections: 3,
            topology_refresh_interval: Some(Duration::from_secs(60)),
            moved_refresh_threshold: 8,
        }
    }

    /// Check invariants that must hold before any I/O happens.
    pub fn validate(&self) -> Result<(), Error> {
        if self.addresses.is_empty() {
            return Err(Error::new(ErrorKind::Config, "no server addresses"));
        }
        if let Some(pubsub) = &self.pubsub {
            if self.protocol == ProtocolVersion::Resp2 && !pubsub.is_empty() {
                return Err(Error::new(
                    ErrorKind::Config,
                    "pub/sub subscriptions require the RESP3 protocol",
                ));
            }
            if !pubsub.shard_channels.is_empty() && !self.cluster_mode {
                return Err(Error::new(
                    ErrorKind::Config,
                    "shard channels require cluster mode",
                ));
            }
        }
        if self.request_timeout.is_zero() {
            return Err(Error::new(ErrorKind::Config, "request timeout must be non-zero"));
        }
        Ok(())
    }
}
