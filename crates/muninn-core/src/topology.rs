//! The cluster slot map and its refresh machinery.
//!
//! Routing reads a point-in-time [`SlotMap`] snapshot behind an `Arc`;
//! refreshes build a whole new map and swap it in, bumping the epoch.
//! A request routed against epoch E that comes back with `MOVED` always
//! observes epoch >= E+1 before it retries.

use std::collections::BTreeSet;
use std::sync::Arc;

use muninn_proto::{CLUSTER_SLOTS, Frame};
use parking_lot::RwLock;
use rand::seq::SliceRandom;

use crate::config::NodeAddr;
use crate::error::{Error, ErrorKind};

/// One contiguous slot range and its owners.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
    pub primary: NodeAddr,
    pub replicas: Vec<NodeAddr>,
}

/// An immutable view of the cluster at one epoch.
#[derive(Clone, Debug, Default)]
pub struct SlotMap {
    epoch: u64,
    /// Sorted by `start`, non-overlapping.
    ranges: Vec<SlotRange>,
}

impl SlotMap {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn ranges(&self) -> &[SlotRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn range_for(&self, slot: u16) -> Option<&SlotRange> {
        if slot >= CLUSTER_SLOTS {
            return None;
        }
        let idx = self
            .ranges
            .partition_point(|range| range.end < slot);
        self.ranges
            .get(idx)
            .filter(|range| range.start <= slot && slot <= range.end)
    }

    pub fn primary_for(&self, slot: u16) -> Option<&NodeAddr> {
        self.range_for(slot).map(|range| &range.primary)
    }

    pub fn replicas_for(&self, slot: u16) -> &[NodeAddr] {
        self.range_for(slot)
            .map(|range| range.replicas.as_slice())
            .unwrap_or(&[])
    }

    pub fn unique_primaries(&self) -> Vec<NodeAddr> {
        let set: BTreeSet<_> = self.ranges.iter().map(|r| r.primary.clone()).collect();
        set.into_iter().collect()
    }

    /// Every known node, primaries and replicas.
    pub fn all_nodes(&self) -> Vec<NodeAddr> {
        let mut set = BTreeSet::new();
        for range in &self.ranges {
            set.insert(range.primary.clone());
            set.extend(range.replicas.iter().cloned());
        }
        set.into_iter().collect()
    }

    pub fn random_primary(&self) -> Option<NodeAddr> {
        let primaries = self.unique_primaries();
        primaries.choose(&mut rand::thread_rng()).cloned()
    }
}

/// Shared, swappable slot map.
#[derive(Debug, Default)]
pub struct Topology {
    current: RwLock<Arc<SlotMap>>,
}

impl Topology {
    pub fn new() -> Self {
        Topology::default()
    }

    pub fn snapshot(&self) -> Arc<SlotMap> {
        self.current.read().clone()
    }

    pub fn epoch(&self) -> u64 {
        self.current.read().epoch
    }

    /// Replace the map wholesale. Returns the new epoch.
    pub fn install(&self, mut ranges: Vec<SlotRange>) -> u64 {
        ranges.sort_by_key(|range| range.start);
        let mut current = self.current.write();
        let epoch = current.epoch + 1;
        *current = Arc::new(SlotMap { epoch, ranges });
        epoch
    }

    /// Point one slot at a new primary, as told by a `MOVED` reply.
    ///
    /// The containing range is split around the slot; the new owner's
    /// replicas are unknown until the next full refresh. Returns the new
    /// epoch.
    pub fn apply_moved(&self, slot: u16, node: NodeAddr) -> u64 {
        let mut current = self.current.write();
        let mut ranges = Vec::with_capacity(current.ranges.len() + 2);
        for range in &current.ranges {
            if range.start <= slot && slot <= range.end {
                if range.start < slot {
                    ranges.push(SlotRange {
                        start: range.start,
                        end: slot - 1,
                        primary: range.primary.clone(),
                        replicas: range.replicas.clone(),
                    });
                }
                if slot < range.end {
                    ranges.push(SlotRange {
                        start: slot + 1,
                        end: range.end,
                        primary: range.primary.clone(),
                        replicas: range.replicas.clone(),
                    });
                }
            } else {
                ranges.push(range.clone());
            }
        }
        ranges.push(SlotRange {
            start: slot,
            end: slot,
            primary: node,
            replicas: Vec::new(),
        });
        ranges.sort_by_key(|range| range.start);

        let epoch = current.epoch + 1;
        *current = Arc::new(SlotMap { epoch, ranges });
        epoch
    }
}

fn frame_u16(frame: &Frame) -> Option<u16> {
    match frame {
        Frame::Integer(value) => u16::try_from(*value).ok(),
        _ => None,
    }
}

fn frame_port(frame: &Frame) -> Option<u16> {
    frame_u16(frame)
}

fn frame_text(frame: &Frame) -> Option<String> {
    frame.as_str().map(str::to_string)
}

fn host_or_default(host: Option<String>, default_host: &str) -> String {
    match host {
        Some(h) if !h.is_empty() => h,
        _ => default_host.to_string(),
    }
}

fn protocol_error(msg: &'static str) -> Error {
    Error::new(ErrorKind::Protocol, msg)
}

/// Parse a `CLUSTER SLOTS` reply.
///
/// Shape: an array of `[start, end, [host, port, id?, meta?], replica...]`
/// entries. An empty or nil host means "the node that answered".
pub fn parse_cluster_slots(frame: &Frame, default_host: &str) -> Result<Vec<SlotRange>, Error> {
    let Frame::Array(entries) = frame else {
        return Err(protocol_error("CLUSTER SLOTS reply is not an array"));
    };

    let mut ranges = Vec::with_capacity(entries.len());
    for entry in entries {
        let Frame::Array(items) = entry else {
            return Err(protocol_error("CLUSTER SLOTS entry is not an array"));
        };
        if items.len() < 3 {
            return Err(protocol_error("CLUSTER SLOTS entry is too short"));
        }
        let start =
            frame_u16(&items[0]).ok_or_else(|| protocol_error("invalid slot range start"))?;
        let end = frame_u16(&items[1]).ok_or_else(|| protocol_error("invalid slot range end"))?;

        let mut nodes = Vec::with_capacity(items.len() - 2);
        for node in &items[2..] {
            let Frame::Array(fields) = node else {
                return Err(protocol_error("CLUSTER SLOTS node is not an array"));
            };
            if fields.len() < 2 {
                return Err(protocol_error("CLUSTER SLOTS node is too short"));
            }
            let host = match &fields[0] {
                Frame::Null => None,
                other => frame_text(other),
            };
            let port =
                frame_port(&fields[1]).ok_or_else(|| protocol_error("invalid node port"))?;
            nodes.push(NodeAddr::new(host_or_default(host, default_host), port));
        }

        let mut nodes = nodes.into_iter();
        let primary = nodes
            .next()
            .ok_or_else(|| protocol_error("CLUSTER SLOTS entry has no nodes"))?;
        ranges.push(SlotRange {
            start,
            end,
            primary,
            replicas: nodes.collect(),
        });
    }
    Ok(ranges)
}

/// Map entries from either a RESP3 map or a RESP2 flat array of pairs.
fn pairs_of(frame: &Frame) -> Option<Vec<(&Frame, &Frame)>> {
    match frame {
        Frame::Map(pairs) => Some(pairs.iter().map(|(k, v)| (k, v)).collect()),
        Frame::Array(items) if items.len() % 2 == 0 => {
            Some(items.chunks_exact(2).map(|c| (&c[0], &c[1])).collect())
        }
        _ => None,
    }
}

fn lookup<'a>(pairs: &[(&'a Frame, &'a Frame)], key: &str) -> Option<&'a Frame> {
    pairs
        .iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| *v)
}

/// Parse a `CLUSTER SHARDS` reply (7.0+).
///
/// Shape: an array of shard descriptions, each a map with `slots` (a flat
/// array of start/end pairs) and `nodes` (maps carrying `endpoint`/`ip`,
/// `port`, `role`, `health`). Both the RESP3 map form and the RESP2
/// alternating-array form are accepted.
pub fn parse_cluster_shards(frame: &Frame, default_host: &str) -> Result<Vec<SlotRange>, Error> {
    let Frame::Array(shards) = frame else {
        return Err(protocol_error("CLUSTER SHARDS reply is not an array"));
    };

    let mut ranges = Vec::new();
    for shard in shards {
        let pairs =
            pairs_of(shard).ok_or_else(|| protocol_error("CLUSTER SHARDS entry is not a map"))?;
        let Some(Frame::Array(slots)) = lookup(&pairs, "slots") else {
            return Err(protocol_error("CLUSTER SHARDS entry missing slots"));
        };
        let Some(Frame::Array(nodes)) = lookup(&pairs, "nodes") else {
            return Err(protocol_error("CLUSTER SHARDS entry missing nodes"));
        };

        let mut primary = None;
        let mut replicas = Vec::new();
        for node in nodes {
            let fields =
                pairs_of(node).ok_or_else(|| protocol_error("CLUSTER SHARDS node is not a map"))?;
            if let Some(health) = lookup(&fields, "health").and_then(Frame::as_str) {
                if !health.eq_ignore_ascii_case("online") {
                    continue;
                }
            }
            let host = lookup(&fields, "endpoint")
                .and_then(Frame::as_str)
                .filter(|h| !h.is_empty() && *h != "?")
                .or_else(|| lookup(&fields, "ip").and_then(Frame::as_str))
                .map(str::to_string);
            let port = lookup(&fields, "port")
                .and_then(frame_port)
                .ok_or_else(|| protocol_error("CLUSTER SHARDS node missing port"))?;
            let addr = NodeAddr::new(host_or_default(host, default_host), port);

            let role = lookup(&fields, "role").and_then(Frame::as_str).unwrap_or("");
            if role.eq_ignore_ascii_case("master") || role.eq_ignore_ascii_case("primary") {
                primary = Some(addr);
            } else {
                replicas.push(addr);
            }
        }
        let Some(primary) = primary else {
            // A shard with no reachable primary cannot accept writes; skip
            // it and let the next refresh fill the hole.
            continue;
        };

        for window in slots.chunks(2) {
            let [start, end] = window else {
                return Err(protocol_error("CLUSTER SHARDS slots are not paired"));
            };
            ranges.push(SlotRange {
                start: frame_u16(start).ok_or_else(|| protocol_error("invalid shard slot"))?,
                end: frame_u16(end).ok_or_else(|| protocol_error("invalid shard slot"))?,
                primary: primary.clone(),
                replicas: replicas.clone(),
            });
        }
    }
    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> NodeAddr {
        NodeAddr::new("10.0.0.1", port)
    }

    fn sample_ranges() -> Vec<SlotRange> {
        vec![
            SlotRange {
                start: 0,
                end: 5460,
                primary: addr(7000),
                replicas: vec![addr(7100)],
            },
            SlotRange {
                start: 5461,
                end: 10922,
                primary: addr(7001),
                replicas: vec![addr(7101)],
            },
            SlotRange {
                start: 10923,
                end: 16383,
                primary: addr(7002),
                replicas: vec![],
            },
        ]
    }

    #[test]
    fn snapshot_lookup() {
        let topology = Topology::new();
        topology.install(sample_ranges());
        let map = topology.snapshot();

        assert_eq!(map.primary_for(0), Some(&addr(7000)));
        assert_eq!(map.primary_for(5461), Some(&addr(7001)));
        assert_eq!(map.primary_for(16383), Some(&addr(7002)));
        assert_eq!(map.replicas_for(3), &[addr(7100)]);
        assert_eq!(map.unique_primaries().len(), 3);
        assert_eq!(map.all_nodes().len(), 5);
    }

    #[test]
    fn epoch_is_monotonic() {
        let topology = Topology::new();
        let e1 = topology.install(sample_ranges());
        let e2 = topology.apply_moved(42, addr(7005));
        let e3 = topology.install(sample_ranges());
        assert!(e1 < e2 && e2 < e3);
    }

    #[test]
    fn moved_splits_the_containing_range() {
        let topology = Topology::new();
        topology.install(sample_ranges());
        topology.apply_moved(100, addr(7009));
        let map = topology.snapshot();

        assert_eq!(map.primary_for(99), Some(&addr(7000)));
        assert_eq!(map.primary_for(100), Some(&addr(7009)));
        assert_eq!(map.primary_for(101), Some(&addr(7000)));
        // Range boundaries stay intact elsewhere.
        assert_eq!(map.primary_for(5461), Some(&addr(7001)));
    }

    #[test]
    fn moved_at_range_edges() {
        let topology = Topology::new();
        topology.install(sample_ranges());
        topology.apply_moved(0, addr(7009));
        topology.apply_moved(16383, addr(7009));
        let map = topology.snapshot();
        assert_eq!(map.primary_for(0), Some(&addr(7009)));
        assert_eq!(map.primary_for(1), Some(&addr(7000)));
        assert_eq!(map.primary_for(16383), Some(&addr(7009)));
        assert_eq!(map.primary_for(16382), Some(&addr(7002)));
    }

    #[test]
    fn parse_slots_reply() {
        let frame = Frame::Array(vec![
            Frame::Array(vec![
                Frame::Integer(0),
                Frame::Integer(8191),
                Frame::Array(vec![
                    Frame::bulk("10.0.0.1"),
                    Frame::Integer(7000),
                    Frame::bulk("nodeid-a"),
                ]),
                Frame::Array(vec![Frame::bulk("10.0.0.2"), Frame::Integer(7100)]),
            ]),
            Frame::Array(vec![
                Frame::Integer(8192),
                Frame::Integer(16383),
                // Empty host inherits the replying node's host.
                Frame::Array(vec![Frame::bulk(""), Frame::Integer(7001)]),
            ]),
        ]);

        let ranges = parse_cluster_slots(&frame, "seed.local").unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].primary, NodeAddr::new("10.0.0.1", 7000));
        assert_eq!(ranges[0].replicas, vec![NodeAddr::new("10.0.0.2", 7100)]);
        assert_eq!(ranges[1].primary, NodeAddr::new("seed.local", 7001));
    }

    #[test]
    fn parse_shards_reply_resp3() {
        let node = |host: &str, port: i64, role: &str| {
            Frame::Map(vec![
                (Frame::bulk("ip"), Frame::bulk(host)),
                (Frame::bulk("endpoint"), Frame::bulk(host)),
                (Frame::bulk("port"), Frame::Integer(port)),
                (Frame::bulk("role"), Frame::bulk(role)),
                (Frame::bulk("health"), Frame::bulk("online")),
            ])
        };
        let frame = Frame::Array(vec![Frame::Map(vec![
            (
                Frame::bulk("slots"),
                Frame::Array(vec![
                    Frame::Integer(0),
                    Frame::Integer(999),
                    Frame::Integer(2000),
                    Frame::Integer(2999),
                ]),
            ),
            (
                Frame::bulk("nodes"),
                Frame::Array(vec![
                    node("10.0.0.1", 7000, "master"),
                    node("10.0.0.2", 7100, "replica"),
                ]),
            ),
        ])]);

        let ranges = parse_cluster_shards(&frame, "seed.local").unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].start, 0);
        assert_eq!(ranges[0].end, 999);
        assert_eq!(ranges[1].start, 2000);
        assert_eq!(ranges[0].primary, NodeAddr::new("10.0.0.1", 7000));
        assert_eq!(ranges[0].replicas, vec![NodeAddr::new("10.0.0.2", 7100)]);
    }

    #[test]
    fn parse_shards_reply_resp2_pairs() {
        // RESP2 renders maps as flat arrays of alternating key/value.
        let frame = Frame::Array(vec![Frame::Array(vec![
            Frame::bulk("slots"),
            Frame::Array(vec![Frame::Integer(0), Frame::Integer(16383)]),
            Frame::bulk("nodes"),
            Frame::Array(vec![Frame::Array(vec![
                Frame::bulk("ip"),
                Frame::bulk("10.0.0.3"),
                Frame::bulk("port"),
                Frame::Integer(7002),
                Frame::bulk("role"),
                Frame::bulk("master"),
            ])]),
        ])]);

        let ranges = parse_cluster_shards(&frame, "seed.local").unwrap();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].primary, NodeAddr::new("10.0.0.3", 7002));
    }

    #[test]
    fn malformed_slots_reply_is_a_protocol_error() {
        let err = parse_cluster_slots(&Frame::Integer(1), "h").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }
}
