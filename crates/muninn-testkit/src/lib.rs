#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

mod session;
mod store;

pub use store::{Entry, Store, glob_match};

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use bytes::Bytes;
use muninn_proto::{CLUSTER_SLOTS, Frame, hash_slot};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Knobs for one server instance.
#[derive(Clone, Debug, Default)]
pub struct ServerOptions {
    /// Require `AUTH`/`HELLO AUTH` with this password.
    pub password: Option<String>,
    /// Answer `HELLO` with an unknown-command error, like a pre-RESP3
    /// server.
    pub reject_hello: bool,
}

pub(crate) struct ConnSubs {
    pub channels: HashSet<Bytes>,
    pub patterns: HashSet<Bytes>,
    pub shard_channels: HashSet<Bytes>,
    pub push: mpsc::UnboundedSender<Frame>,
}

#[derive(Default)]
pub(crate) struct SubRegistry {
    pub conns: HashMap<u64, ConnSubs>,
}

impl SubRegistry {
    /// Deliver to every matching subscriber; returns the receiver count.
    pub fn publish(&self, channel: &Bytes, payload: &Bytes, shard: bool) -> i64 {
        let mut receivers = 0;
        for conn in self.conns.values() {
            if shard {
                if conn.shard_channels.contains(channel) {
                    let push = Frame::Push(vec![
                        Frame::bulk("smessage"),
                        Frame::Bulk(channel.clone()),
                        Frame::Bulk(payload.clone()),
                    ]);
                    if conn.push.send(push).is_ok() {
                        receivers += 1;
                    }
                }
                continue;
            }
            if conn.channels.contains(channel) {
                let push = Frame::Push(vec![
                    Frame::bulk("message"),
                    Frame::Bulk(channel.clone()),
                    Frame::Bulk(payload.clone()),
                ]);
                if conn.push.send(push).is_ok() {
                    receivers += 1;
                }
            }
            for pattern in &conn.patterns {
                if glob_match(pattern, channel) {
                    let push = Frame::Push(vec![
                        Frame::bulk("pmessage"),
                        Frame::Bulk(pattern.clone()),
                        Frame::Bulk(channel.clone()),
                        Frame::Bulk(payload.clone()),
                    ]);
                    if conn.push.send(push).is_ok() {
                        receivers += 1;
                    }
                }
            }
        }
        receivers
    }
}

/// The shared ownership table of a simulated cluster.
pub struct ClusterView {
    pub(crate) nodes: Vec<SocketAddr>,
    /// Sorted `(start, end, node_index)` triples.
    pub(crate) ranges: Vec<(u16, u16, usize)>,
    /// Slots answering with one-shot `ASK` redirects: slot -> target node.
    pub(crate) asks: HashMap<u16, usize>,
}

impl ClusterView {
    pub fn owner_of(&self, slot: u16) -> usize {
        self.ranges
            .iter()
            .find(|(start, end, _)| *start <= slot && slot <= *end)
            .map(|(_, _, index)| *index)
            .unwrap_or(0)
    }

    /// Reassign one slot, splitting the containing range.
    pub fn move_slot(&mut self, slot: u16, to: usize) {
        let mut next = Vec::with_capacity(self.ranges.len() + 2);
        for &(start, end, index) in &self.ranges {
            if start <= slot && slot <= end {
                if start < slot {
                    next.push((start, slot - 1, index));
                }
                if slot < end {
                    next.push((slot + 1, end, index));
                }
            } else {
                next.push((start, end, index));
            }
        }
        next.push((slot, slot, to));
        next.sort_by_key(|(start, _, _)| *start);
        self.ranges = next;
    }

    pub(crate) fn slots_frame(&self) -> Frame {
        Frame::Array(
            self.ranges
                .iter()
                .map(|&(start, end, index)| {
                    let addr = self.nodes[index];
                    Frame::Array(vec![
                        Frame::Integer(start as i64),
                        Frame::Integer(end as i64),
                        Frame::Array(vec![
                            Frame::Bulk(Bytes::from(addr.ip().to_string())),
                            Frame::Integer(addr.port() as i64),
                            Frame::Bulk(Bytes::from(format!("node-{index}"))),
                        ]),
                    ])
                })
                .collect(),
        )
    }

    pub(crate) fn shards_frame(&self) -> Frame {
        // One shard per node, gathering its ranges.
        let mut per_node: HashMap<usize, Vec<(u16, u16)>> = HashMap::new();
        for &(start, end, index) in &self.ranges {
            per_node.entry(index).or_default().push((start, end));
        }
        let mut indices: Vec<_> = per_node.keys().copied().collect();
        indices.sort_unstable();

        Frame::Array(
            indices
                .into_iter()
                .map(|index| {
                    let addr = self.nodes[index];
                    let mut slots = Vec::new();
                    for (start, end) in &per_node[&index] {
                        slots.push(Frame::Integer(*start as i64));
                        slots.push(Frame::Integer(*end as i64));
                    }
                    Frame::Map(vec![
                        (Frame::bulk("slots"), Frame::Array(slots)),
                        (
                            Frame::bulk("nodes"),
                            Frame::Array(vec![Frame::Map(vec![
                                (Frame::bulk("id"), Frame::Bulk(Bytes::from(format!("node-{index}")))),
                                (Frame::bulk("endpoint"), Frame::Bulk(Bytes::from(addr.ip().to_string()))),
                                (Frame::bulk("ip"), Frame::Bulk(Bytes::from(addr.ip().to_string()))),
                                (Frame::bulk("port"), Frame::Integer(addr.port() as i64)),
                                (Frame::bulk("role"), Frame::bulk("master")),
                                (Frame::bulk("health"), Frame::bulk("online")),
                            ])]),
                        ),
                    ])
                })
                .collect(),
        )
    }
}

pub(crate) struct ClusterMembership {
    pub index: usize,
    pub view: Arc<Mutex<ClusterView>>,
}

pub(crate) struct ServerShared {
    pub store: Mutex<Store>,
    pub subs: Mutex<SubRegistry>,
    pub options: ServerOptions,
    pub cluster: Option<ClusterMembership>,
    pub next_conn: AtomicU64,
    pub conn_tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// One in-process server on an ephemeral local port.
pub struct MockServer {
    addr: SocketAddr,
    shared: Arc<ServerShared>,
    accept: JoinHandle<()>,
}

impl MockServer {
    pub async fn spawn() -> MockServer {
        MockServer::spawn_with(ServerOptions::default()).await
    }

    pub async fn spawn_with(options: ServerOptions) -> MockServer {
        MockServer::spawn_inner(options, None).await
    }

    async fn spawn_inner(options: ServerOptions, cluster: Option<ClusterMembership>) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("local addr");
        let shared = Arc::new(ServerShared {
            store: Mutex::new(Store::new()),
            subs: Mutex::new(SubRegistry::default()),
            options,
            cluster,
            next_conn: AtomicU64::new(1),
            conn_tasks: Mutex::new(Vec::new()),
        });

        let conn_shared = shared.clone();
        let accept = tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    return;
                };
                tracing::trace!(%peer, "mock server accepted connection");
                let _ = stream.set_nodelay(true);
                let task = tokio::spawn(session::run_conn(stream, conn_shared.clone()));
                conn_shared.conn_tasks.lock().push(task);
            }
        });

        MockServer {
            addr,
            shared,
            accept,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `host:port`, ready for client configuration.
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Publish straight from the server side, as another client would.
    pub fn publish(&self, channel: &[u8], payload: &[u8]) -> i64 {
        self.shared.subs.lock().publish(
            &Bytes::copy_from_slice(channel),
            &Bytes::copy_from_slice(payload),
            false,
        )
    }

    /// Number of live keys, for assertions about where data landed.
    pub fn key_count(&self) -> usize {
        self.shared.store.lock().len()
    }

    /// Sever every live connection; the listener keeps accepting, so
    /// clients can reconnect. Simulates a server restart or network blip.
    pub fn drop_connections(&self) {
        let mut tasks = self.shared.conn_tasks.lock();
        for task in tasks.drain(..) {
            task.abort();
        }
        self.shared.subs.lock().conns.clear();
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

/// A simulated cluster: N primaries sharing one ownership table.
pub struct MockCluster {
    pub servers: Vec<MockServer>,
    view: Arc<Mutex<ClusterView>>,
}

impl MockCluster {
    /// Spawn `n` primaries with the slot space split evenly.
    pub async fn spawn(n: usize) -> MockCluster {
        assert!(n > 0);
        let view = Arc::new(Mutex::new(ClusterView {
            nodes: Vec::new(),
            ranges: Vec::new(),
            asks: HashMap::new(),
        }));

        let mut servers = Vec::with_capacity(n);
        for index in 0..n {
            let membership = ClusterMembership {
                index,
                view: view.clone(),
            };
            let server = MockServer::spawn_inner(ServerOptions::default(), Some(membership)).await;
            view.lock().nodes.push(server.addr());
            servers.push(server);
        }

        let per_node = CLUSTER_SLOTS / n as u16;
        let mut ranges = Vec::with_capacity(n);
        for index in 0..n {
            let start = index as u16 * per_node;
            let end = if index == n - 1 {
                CLUSTER_SLOTS - 1
            } else {
                (index as u16 + 1) * per_node - 1
            };
            ranges.push((start, end, index));
        }
        view.lock().ranges = ranges;

        MockCluster { servers, view }
    }

    pub fn addrs(&self) -> Vec<String> {
        self.servers.iter().map(MockServer::address).collect()
    }

    pub fn owner_of(&self, slot: u16) -> usize {
        self.view.lock().owner_of(slot)
    }

    pub fn owner_of_key(&self, key: &[u8]) -> usize {
        self.owner_of(hash_slot(key))
    }

    /// Reassign a slot; the old owner starts answering `MOVED`.
    pub fn move_slot(&self, slot: u16, to: usize) {
        self.view.lock().move_slot(slot, to);
    }

    /// Make the owner answer a one-shot `ASK` toward `to` for this slot.
    pub fn ask_slot(&self, slot: u16, to: usize) {
        self.view.lock().asks.insert(slot, to);
    }

    pub fn clear_ask(&self, slot: u16) {
        self.view.lock().asks.remove(&slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cluster_split_covers_all_slots() {
        let cluster = MockCluster::spawn(3).await;
        assert_eq!(cluster.owner_of(0), 0);
        assert_eq!(cluster.owner_of(CLUSTER_SLOTS - 1), 2);

        let before = cluster.owner_of(100);
        let target = (before + 1) % 3;
        cluster.move_slot(100, target);
        assert_eq!(cluster.owner_of(100), target);
        assert_eq!(cluster.owner_of(99), before);
        assert_eq!(cluster.owner_of(101), before);
    }
}
