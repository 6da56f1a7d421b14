//! Command routing: standalone dispatch, cluster slot resolution, replica
//! selection, redirection handling, and broadcast fan-out.
//!
//! The router never holds a reference into a connection's internals; it
//! keeps cloneable handles keyed by address and consults the topology
//! snapshot for every cluster decision. Connections report their lifecycle
//! over a one-way event channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use bytes::Bytes;
use futures_util::future::join_all;
use muninn_proto::{Frame, Redirection, RedirectionKind, ServerErrorKind, hash_slot};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::command::{Command, Route};
use crate::config::{Config, NodeAddr, ReadPolicy};
use crate::connection::{self, ConnState, ConnectionEvent, ConnectionHandle, EventSender};
use crate::error::{Error, ErrorKind};
use crate::pubsub::{PubSubDispatcher, SubscriptionKind, SubscriptionSet};
use crate::topology::{Topology, parse_cluster_shards, parse_cluster_slots};

const ASKING: &[u8] = b"ASKING";

/// How broadcast replies are combined.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Aggregate {
    /// An ordered array of `[address, reply]` pairs (the default).
    Pairs,
    /// Sum integer replies (counters such as `DBSIZE`).
    Sum,
    /// Concatenate array replies (listings such as `KEYS`).
    Concat,
    /// Merge map replies, later nodes winning ties.
    MergeMap,
    /// The first non-error reply (health checks such as `PING`).
    FirstNonError,
}

/// The request engine shared by every facade operation.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    config: Config,
    topology: Topology,
    connections: Mutex<HashMap<NodeAddr, ConnectionHandle>>,
    pubsub: PubSubDispatcher,
    events_tx: EventSender,
    replica_cursor: AtomicUsize,
    moved_since_refresh: AtomicU32,
    refresh_lock: tokio::sync::Mutex<()>,
    /// `false` while a CLUSTERDOWN-triggered refresh is in flight; new
    /// requests wait on it (bounded by their own deadline).
    ready: watch::Sender<bool>,
    closed: AtomicBool,
    /// Sticky node for non-shard subscriptions in cluster mode.
    subscribe_target: Mutex<Option<NodeAddr>>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("cluster_mode", &self.inner.config.cluster_mode)
            .field("nodes", &self.inner.connections.lock().len())
            .field("epoch", &self.inner.topology.epoch())
            .finish()
    }
}

impl Router {
    /// Validate the configuration, establish the first connection(s), and
    /// in cluster mode discover the initial topology.
    pub async fn connect(config: Config) -> Result<Router, Error> {
        config.validate()?;

        let pubsub = PubSubDispatcher::new(config.pubsub.as_ref());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ready, _) = watch::channel(true);

        let router = Router {
            inner: Arc::new(RouterInner {
                config,
                topology: Topology::new(),
                connections: Mutex::new(HashMap::new()),
                pubsub,
                events_tx,
                replica_cursor: AtomicUsize::new(0),
                moved_since_refresh: AtomicU32::new(0),
                refresh_lock: tokio::sync::Mutex::new(()),
                ready,
                closed: AtomicBool::new(false),
                subscribe_target: Mutex::new(None),
            }),
        };

        router.spawn_event_task(events_rx);

        if router.inner.config.cluster_mode {
            router.discover(true).await?;
            router.apply_initial_subscriptions().await?;
            router.spawn_periodic_refresh();
        } else {
            // Standalone: one connection, subscriptions applied in its
            // handshake.
            let addr = router.inner.config.addresses[0].clone();
            let mut subs = SubscriptionSet::default();
            if let Some(pubsub_cfg) = &router.inner.config.pubsub {
                subs.add(SubscriptionKind::Exact, pubsub_cfg.channels.iter().cloned());
                subs.add(SubscriptionKind::Pattern, pubsub_cfg.patterns.iter().cloned());
            }
            let conn = connection::connect(
                addr.clone(),
                &router.inner.config,
                subs,
                router.inner.pubsub.clone(),
                router.inner.events_tx.clone(),
            )
            .await?;
            router.inner.connections.lock().insert(addr, conn);
        }

        Ok(router)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn pubsub(&self) -> &PubSubDispatcher {
        &self.inner.pubsub
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// The deadline for one command, from its overrides or the configured
    /// request timeout.
    pub fn deadline_for(&self, command: &Command) -> Option<Instant> {
        if command.no_deadline {
            return None;
        }
        let timeout = command.timeout.unwrap_or(self.inner.config.request_timeout);
        Some(Instant::now() + timeout)
    }

    /// Route and run one command, following redirections up to the limit.
    ///
    /// Server error replies other than consumed redirections come back as
    /// `Ok(Frame::Error(..))` so batch semantics stay intact; the facade
    /// turns them into typed errors.
    pub async fn execute(&self, command: &Command) -> Result<Frame, Error> {
        if self.is_closed() {
            return Err(Error::closed());
        }
        if command.route.is_broadcast() {
            return self.broadcast(command, Aggregate::Pairs).await;
        }

        let deadline = self.deadline_for(command);
        self.wait_ready(deadline).await?;

        let mut asking: Option<NodeAddr> = None;
        let mut redirects = 0u32;
        let mut refreshes = 0u32;
        loop {
            let addr = match asking.as_ref() {
                Some(addr) => addr.clone(),
                None => self.resolve_target(command)?,
            };
            let conn = self.connection_to(&addr).await?;

            let reply = if asking.take().is_some() {
                // The ASKING preamble must immediately precede the retried
                // command on the target connection.
                let mut replies = conn
                    .request_block(
                        vec![vec![Bytes::from_static(ASKING)], command.parts.clone()],
                        deadline,
                    )
                    .await?;
                if replies.len() != 2 {
                    return Err(Error::new(ErrorKind::Protocol, "short ASKING reply"));
                }
                replies.pop().expect("length checked above")
            } else {
                conn.request(command.parts.clone(), deadline).await?
            };

            let Frame::Error(error) = &reply else {
                return Ok(reply);
            };

            match error.kind {
                ServerErrorKind::Moved | ServerErrorKind::Ask => {
                    let Some(redirect) = Redirection::parse(error) else {
                        return Ok(reply);
                    };
                    redirects += 1;
                    if redirects > self.inner.config.max_redirections {
                        return Err(Error::new(
                            ErrorKind::Cluster,
                            format!("redirected more than {} times", redirects - 1),
                        ));
                    }
                    let target = redirect_target(&redirect, &addr);
                    tracing::debug!(%redirect, %target, "following cluster redirection");
                    match redirect.kind {
                        RedirectionKind::Moved => self.apply_moved(redirect.slot, target),
                        RedirectionKind::Ask => asking = Some(target),
                    }
                }
                ServerErrorKind::ClusterDown | ServerErrorKind::Loading => {
                    refreshes += 1;
                    if !self.inner.config.cluster_mode
                        || refreshes > self.inner.config.max_redirections
                    {
                        return Ok(reply);
                    }
                    tracing::debug!(kind = %error.kind, "refreshing topology before retry");
                    let block = error.kind == ServerErrorKind::ClusterDown;
                    let _ = self.refresh_topology(block).await;
                    self.wait_ready(deadline).await?;
                }
                _ => return Ok(reply),
            }
        }
    }

    /// Fan a command out to every primary (or every node) and combine the
    /// replies.
    pub async fn broadcast(&self, command: &Command, aggregate: Aggregate) -> Result<Frame, Error> {
        if !self.inner.config.cluster_mode {
            return Err(Error::new(
                ErrorKind::Config,
                "broadcast routing requires cluster mode",
            ));
        }
        if self.is_closed() {
            return Err(Error::closed());
        }
        let deadline = self.deadline_for(command);
        self.wait_ready(deadline).await?;

        let snapshot = self.inner.topology.snapshot();
        let nodes = match command.route {
            Route::AllNodes => snapshot.all_nodes(),
            _ => snapshot.unique_primaries(),
        };
        if nodes.is_empty() {
            return Err(Error::new(ErrorKind::Cluster, "no known cluster nodes"));
        }

        let replies = join_all(nodes.into_iter().map(|addr| {
            let parts = command.parts.clone();
            async move {
                let result = match self.connection_to(&addr).await {
                    Ok(conn) => conn.request(parts, deadline).await,
                    Err(error) => Err(error),
                };
                (addr, result)
            }
        }))
        .await;

        aggregate_replies(replies, aggregate)
    }

    /// Current primary owner of a slot.
    pub(crate) fn primary_for_slot(&self, slot: u16) -> Result<NodeAddr, Error> {
        self.inner
            .topology
            .snapshot()
            .primary_for(slot)
            .cloned()
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::Cluster,
                    format!("no known owner for hash slot {slot}"),
                )
            })
    }

    /// Point a slot at a new owner, as told by a `MOVED` reply, and count
    /// it toward the early-refresh threshold.
    pub(crate) fn apply_moved(&self, slot: u16, addr: NodeAddr) {
        self.inner.topology.apply_moved(slot, addr);
        self.note_moved();
    }

    fn note_moved(&self) {
        let count = self
            .inner
            .moved_since_refresh
            .fetch_add(1, Ordering::AcqRel)
            + 1;
        if count >= self.inner.config.moved_refresh_threshold {
            self.inner.moved_since_refresh.store(0, Ordering::Release);
            let router = self.clone();
            tokio::spawn(async move {
                let _ = router.refresh_topology(false).await;
            });
        }
    }

    /// Pick the node for a non-broadcast command.
    fn resolve_target(&self, command: &Command) -> Result<NodeAddr, Error> {
        if !self.inner.config.cluster_mode {
            return Ok(self.inner.config.addresses[0].clone());
        }

        let snapshot = self.inner.topology.snapshot();
        if let Route::Node(addr) = &command.route {
            return Ok(addr.clone());
        }
        let slot = match command.slot() {
            Some(slot) => slot,
            // Keyless commands and catalog omissions go to a random
            // primary.
            None => {
                return snapshot
                    .random_primary()
                    .ok_or_else(|| Error::new(ErrorKind::Cluster, "empty cluster routing table"));
            }
        };

        let Some(primary) = snapshot.primary_for(slot) else {
            return Err(Error::new(
                ErrorKind::Cluster,
                format!("no known owner for hash slot {slot}"),
            ));
        };

        if command.readonly && self.inner.config.read_from == ReadPolicy::PreferReplica {
            let replicas = snapshot.replicas_for(slot);
            if !replicas.is_empty() {
                let start = self.inner.replica_cursor.fetch_add(1, Ordering::Relaxed);
                let connections = self.inner.connections.lock();
                for offset in 0..replicas.len() {
                    let candidate = &replicas[(start + offset) % replicas.len()];
                    let healthy = connections
                        .get(candidate)
                        .map(|conn| conn.state() == ConnState::Up)
                        // Not yet dialed counts as healthy until proven
                        // otherwise.
                        .unwrap_or(true);
                    if healthy {
                        return Ok(candidate.clone());
                    }
                }
            }
        }
        Ok(primary.clone())
    }

    /// The connection for an address, dialing lazily on first use.
    pub(crate) async fn connection_to(&self, addr: &NodeAddr) -> Result<ConnectionHandle, Error> {
        if let Some(conn) = self.inner.connections.lock().get(addr) {
            return Ok(conn.clone());
        }

        let conn = connection::connect(
            addr.clone(),
            &self.inner.config,
            SubscriptionSet::default(),
            self.inner.pubsub.clone(),
            self.inner.events_tx.clone(),
        )
        .await?;

        let conn = {
            let mut connections = self.inner.connections.lock();
            match connections.get(addr) {
                // Lost the dial race; keep the existing connection.
                Some(existing) => {
                    conn.close();
                    existing.clone()
                }
                None => {
                    connections.insert(addr.clone(), conn.clone());
                    conn
                }
            }
        };

        // Replicas only serve reads after READONLY.
        if self.inner.config.cluster_mode
            && self.inner.config.read_from == ReadPolicy::PreferReplica
            && self.is_replica(addr)
        {
            let deadline = Some(Instant::now() + self.inner.config.request_timeout);
            match conn
                .request(vec![Bytes::from_static(b"READONLY")], deadline)
                .await
            {
                Ok(Frame::Error(error)) => {
                    tracing::warn!(%addr, %error, "READONLY rejected");
                }
                Ok(_) => {}
                Err(error) => tracing::warn!(%addr, %error, "READONLY failed"),
            }
        }

        Ok(conn)
    }

    fn is_replica(&self, addr: &NodeAddr) -> bool {
        let snapshot = self.inner.topology.snapshot();
        snapshot
            .ranges()
            .iter()
            .any(|range| range.replicas.contains(addr))
    }

    /// Refresh the slot map from any reachable node.
    ///
    /// With `block_requests`, new requests wait until the refresh finishes
    /// (used for CLUSTERDOWN); their own deadlines still bound the wait.
    pub async fn refresh_topology(&self, block_requests: bool) -> Result<(), Error> {
        let _guard = self.inner.refresh_lock.lock().await;
        if block_requests {
            let _ = self.inner.ready.send(false);
        }
        let result = self.discover(false).await;
        let _ = self.inner.ready.send(true);
        result
    }

    /// Query `CLUSTER SLOTS` (falling back to `CLUSTER SHARDS`) against
    /// known primaries and then the seed list, installing the first map
    /// that parses.
    async fn discover(&self, initial: bool) -> Result<(), Error> {
        let mut candidates = self.inner.topology.snapshot().unique_primaries();
        for seed in &self.inner.config.addresses {
            if !candidates.contains(seed) {
                candidates.push(seed.clone());
            }
        }

        let mut last_error = Error::new(ErrorKind::Cluster, "no cluster nodes reachable");
        for addr in candidates {
            let conn = match self.connection_to(&addr).await {
                Ok(conn) => conn,
                Err(error) => {
                    last_error = error;
                    continue;
                }
            };
            match self.fetch_slot_map(&conn, &addr).await {
                Ok(ranges) => {
                    let epoch = self.inner.topology.install(ranges);
                    self.inner.moved_since_refresh.store(0, Ordering::Release);
                    tracing::debug!(epoch, "installed cluster topology");
                    if !initial {
                        self.prune_connections();
                    }
                    return Ok(());
                }
                Err(error) => {
                    tracing::debug!(%addr, %error, "topology discovery failed");
                    last_error = error;
                }
            }
        }
        Err(last_error)
    }

    async fn fetch_slot_map(
        &self,
        conn: &ConnectionHandle,
        addr: &NodeAddr,
    ) -> Result<Vec<crate::topology::SlotRange>, Error> {
        let deadline = Some(Instant::now() + self.inner.config.request_timeout);
        let slots = conn
            .request(
                vec![Bytes::from_static(b"CLUSTER"), Bytes::from_static(b"SLOTS")],
                deadline,
            )
            .await?;
        match &slots {
            Frame::Error(_) => {}
            frame => return parse_cluster_slots(frame, &addr.host),
        }

        // 7.x servers may drop CLUSTER SLOTS; tolerate both shapes.
        let shards = conn
            .request(
                vec![Bytes::from_static(b"CLUSTER"), Bytes::from_static(b"SHARDS")],
                deadline,
            )
            .await?;
        match shards {
            Frame::Error(error) => Err(Error::from_server(error)),
            frame => parse_cluster_shards(&frame, &addr.host),
        }
    }

    /// Drop connections to nodes the latest topology no longer mentions.
    fn prune_connections(&self) {
        let snapshot = self.inner.topology.snapshot();
        let keep: Vec<NodeAddr> = snapshot.all_nodes();
        let mut connections = self.inner.connections.lock();
        connections.retain(|addr, conn| {
            let keep_it = keep.contains(addr) || self.inner.config.addresses.contains(addr);
            if !keep_it {
                tracing::debug!(%addr, "dropping connection to removed node");
                conn.close();
            }
            keep_it
        });
    }

    /// Configured subscriptions, applied after initial cluster discovery.
    async fn apply_initial_subscriptions(&self) -> Result<(), Error> {
        let Some(pubsub_cfg) = self.inner.config.pubsub.clone() else {
            return Ok(());
        };

        if !pubsub_cfg.channels.is_empty() || !pubsub_cfg.patterns.is_empty() {
            let conn = self.subscribe_connection().await?;
            if !pubsub_cfg.channels.is_empty() {
                self.send_subscribe(&conn, SubscriptionKind::Exact, &pubsub_cfg.channels)?;
            }
            if !pubsub_cfg.patterns.is_empty() {
                self.send_subscribe(&conn, SubscriptionKind::Pattern, &pubsub_cfg.patterns)?;
            }
        }

        for channel in &pubsub_cfg.shard_channels {
            let conn = self.shard_subscribe_connection(channel).await?;
            self.send_subscribe(
                &conn,
                SubscriptionKind::Shard,
                std::slice::from_ref(channel),
            )?;
        }
        Ok(())
    }

    /// The sticky connection carrying non-shard subscriptions in cluster
    /// mode.
    pub async fn subscribe_connection(&self) -> Result<ConnectionHandle, Error> {
        if !self.inner.config.cluster_mode {
            let addr = self.inner.config.addresses[0].clone();
            return self.connection_to(&addr).await;
        }
        let addr = {
            let mut target = self.inner.subscribe_target.lock();
            match target.as_ref() {
                Some(addr) => addr.clone(),
                None => {
                    let snapshot = self.inner.topology.snapshot();
                    let addr = snapshot.random_primary().ok_or_else(|| {
                        Error::new(ErrorKind::Cluster, "empty cluster routing table")
                    })?;
                    *target = Some(addr.clone());
                    addr
                }
            }
        };
        self.connection_to(&addr).await
    }

    /// Shard subscriptions live on the shard that owns the channel's slot.
    pub async fn shard_subscribe_connection(
        &self,
        channel: &Bytes,
    ) -> Result<ConnectionHandle, Error> {
        if !self.inner.config.cluster_mode {
            let addr = self.inner.config.addresses[0].clone();
            return self.connection_to(&addr).await;
        }
        let slot = hash_slot(channel);
        let snapshot = self.inner.topology.snapshot();
        let addr = snapshot
            .primary_for(slot)
            .ok_or_else(|| {
                Error::new(ErrorKind::Cluster, format!("no owner for shard slot {slot}"))
            })?
            .clone();
        self.connection_to(&addr).await
    }

    /// Track and send a subscribe command; the acknowledgement arrives as
    /// a push and is consumed by the dispatcher.
    pub fn send_subscribe(
        &self,
        conn: &ConnectionHandle,
        kind: SubscriptionKind,
        channels: &[Bytes],
    ) -> Result<(), Error> {
        conn.track_subscribe(kind, channels);
        let mut parts = Vec::with_capacity(channels.len() + 1);
        parts.push(Bytes::from_static(kind.subscribe_token().as_bytes()));
        parts.extend(channels.iter().cloned());
        conn.send_no_reply(parts)
    }

    pub fn send_unsubscribe(
        &self,
        conn: &ConnectionHandle,
        kind: SubscriptionKind,
        channels: &[Bytes],
    ) -> Result<(), Error> {
        conn.track_unsubscribe(kind, channels);
        let mut parts = Vec::with_capacity(channels.len() + 1);
        parts.push(Bytes::from_static(kind.unsubscribe_token().as_bytes()));
        parts.extend(channels.iter().cloned());
        conn.send_no_reply(parts)
    }

    async fn wait_ready(&self, deadline: Option<Instant>) -> Result<(), Error> {
        let mut rx = self.inner.ready.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return Ok(());
            }
            let changed = rx.changed();
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, changed).await.is_err() {
                        return Err(Error::timeout());
                    }
                }
                None => {
                    if changed.await.is_err() {
                        return Err(Error::closed());
                    }
                }
            }
        }
    }

    fn spawn_event_task(&self, mut events_rx: mpsc::UnboundedReceiver<ConnectionEvent>) {
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    ConnectionEvent::Up(addr) => tracing::debug!(%addr, "node up"),
                    ConnectionEvent::Down(addr) => tracing::debug!(%addr, "node down"),
                }
            }
        });
    }

    fn spawn_periodic_refresh(&self) {
        let Some(interval) = self.inner.config.topology_refresh_interval else {
            return;
        };
        let router = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if router.is_closed() {
                    return;
                }
                if let Err(error) = router.refresh_topology(false).await {
                    tracing::debug!(%error, "periodic topology refresh failed");
                }
            }
        });
    }

    /// Reject all in-flight and future requests, drop subscriptions, and
    /// shut every socket down.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.pubsub.close();
        let connections = self.inner.connections.lock();
        for conn in connections.values() {
            conn.close();
        }
    }
}

fn redirect_target(redirect: &Redirection, replier: &NodeAddr) -> NodeAddr {
    let host = if redirect.host.is_empty() {
        replier.host.clone()
    } else {
        redirect.host.clone()
    };
    NodeAddr::new(host, redirect.port)
}

/// Combine broadcast replies per the requested aggregation.
fn aggregate_replies(
    replies: Vec<(NodeAddr, Result<Frame, Error>)>,
    aggregate: Aggregate,
) -> Result<Frame, Error> {
    match aggregate {
        Aggregate::Pairs => {
            let mut pairs = Vec::with_capacity(replies.len());
            for (addr, result) in replies {
                let frame = result?;
                pairs.push(Frame::Array(vec![
                    Frame::Bulk(Bytes::from(addr.to_string())),
                    frame,
                ]));
            }
            Ok(Frame::Array(pairs))
        }
        Aggregate::Sum => {
            let mut total = 0i64;
            for (_, result) in replies {
                match result?.into_error()? {
                    Frame::Integer(value) => total += value,
                    other => {
                        return Err(Error::new(
                            ErrorKind::Protocol,
                            format!("cannot sum {} reply", other.kind_name()),
                        ));
                    }
                }
            }
            Ok(Frame::Integer(total))
        }
        Aggregate::Concat => {
            let mut items = Vec::new();
            for (_, result) in replies {
                match result?.into_error()? {
                    Frame::Array(more) | Frame::Set(more) => items.extend(more),
                    other => {
                        return Err(Error::new(
                            ErrorKind::Protocol,
                            format!("cannot concatenate {} reply", other.kind_name()),
                        ));
                    }
                }
            }
            Ok(Frame::Array(items))
        }
        Aggregate::MergeMap => {
            let mut merged: Vec<(Frame, Frame)> = Vec::new();
            for (_, result) in replies {
                match result?.into_error()? {
                    Frame::Map(pairs) => {
                        for (key, value) in pairs {
                            if let Some(slot) = merged.iter_mut().find(|(k, _)| *k == key) {
                                slot.1 = value;
                            } else {
                                merged.push((key, value));
                            }
                        }
                    }
                    other => {
                        return Err(Error::new(
                            ErrorKind::Protocol,
                            format!("cannot merge {} reply", other.kind_name()),
                        ));
                    }
                }
            }
            Ok(Frame::Map(merged))
        }
        Aggregate::FirstNonError => {
            let mut last_error = Error::new(ErrorKind::Cluster, "no replies");
            for (_, result) in replies {
                match result {
                    Ok(Frame::Error(error)) => last_error = Error::from_server(error),
                    Ok(frame) => return Ok(frame),
                    Err(error) => last_error = error,
                }
            }
            Err(last_error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> NodeAddr {
        NodeAddr::new("10.0.0.1", port)
    }

    fn replies(frames: Vec<Frame>) -> Vec<(NodeAddr, Result<Frame, Error>)> {
        frames
            .into_iter()
            .enumerate()
            .map(|(i, f)| (addr(7000 + i as u16), Ok(f)))
            .collect()
    }

    #[test]
    fn aggregate_pairs_keeps_node_order() {
        let frame =
            aggregate_replies(replies(vec![Frame::Integer(1), Frame::Integer(2)]), Aggregate::Pairs)
                .unwrap();
        let Frame::Array(pairs) = frame else { panic!() };
        assert_eq!(pairs.len(), 2);
        let Frame::Array(first) = &pairs[0] else { panic!() };
        assert_eq!(first[0], Frame::Bulk(Bytes::from_static(b"10.0.0.1:7000")));
        assert_eq!(first[1], Frame::Integer(1));
    }

    #[test]
    fn aggregate_sum() {
        let frame = aggregate_replies(
            replies(vec![Frame::Integer(3), Frame::Integer(4)]),
            Aggregate::Sum,
        )
        .unwrap();
        assert_eq!(frame, Frame::Integer(7));
    }

    #[test]
    fn aggregate_concat() {
        let frame = aggregate_replies(
            replies(vec![
                Frame::Array(vec![Frame::bulk("a")]),
                Frame::Array(vec![Frame::bulk("b")]),
            ]),
            Aggregate::Concat,
        )
        .unwrap();
        assert_eq!(frame, Frame::Array(vec![Frame::bulk("a"), Frame::bulk("b")]));
    }

    #[test]
    fn aggregate_merge_map_later_nodes_win() {
        let frame = aggregate_replies(
            replies(vec![
                Frame::Map(vec![(Frame::bulk("k"), Frame::Integer(1))]),
                Frame::Map(vec![(Frame::bulk("k"), Frame::Integer(2))]),
            ]),
            Aggregate::MergeMap,
        )
        .unwrap();
        assert_eq!(frame, Frame::Map(vec![(Frame::bulk("k"), Frame::Integer(2))]));
    }

    #[test]
    fn aggregate_first_non_error_skips_errors() {
        let err = muninn_proto::ServerError::parse(Bytes::from_static(b"LOADING busy"));
        let frame = aggregate_replies(
            vec![
                (addr(1), Ok(Frame::Error(err))),
                (addr(2), Ok(Frame::simple("PONG"))),
            ],
            Aggregate::FirstNonError,
        )
        .unwrap();
        assert_eq!(frame, Frame::simple("PONG"));
    }

    #[test]
    fn redirect_target_inherits_host_when_empty() {
        let redirect = Redirection {
            kind: RedirectionKind::Moved,
            slot: 1,
            host: String::new(),
            port: 7001,
        };
        let target = redirect_target(&redirect, &NodeAddr::new("origin.local", 7000));
        assert_eq!(target, NodeAddr::new("origin.local", 7001));
    }
}
