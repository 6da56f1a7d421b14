//! The keyspace: typed entries, versions for WATCH, lazy expiry.

use std::collections::HashMap;
use std::time::Instant;

use bytes::Bytes;
use muninn_proto::Frame;

#[derive(Clone, Debug, PartialEq)]
pub enum Entry {
    Str(Bytes),
    List(Vec<Bytes>),
    /// Insertion-ordered field/value pairs.
    Hash(Vec<(Bytes, Bytes)>),
    /// Insertion-ordered unique members.
    Set(Vec<Bytes>),
    /// Member/score pairs kept sorted by (score, member).
    ZSet(Vec<(Bytes, f64)>),
}

impl Entry {
    pub fn type_name(&self) -> &'static str {
        match self {
            Entry::Str(_) => "string",
            Entry::List(_) => "list",
            Entry::Hash(_) => "hash",
            Entry::Set(_) => "set",
            Entry::ZSet(_) => "zset",
        }
    }
}

#[derive(Default)]
pub struct Store {
    entries: HashMap<Bytes, Entry>,
    expiries: HashMap<Bytes, Instant>,
    versions: HashMap<Bytes, u64>,
    version_counter: u64,
}

impl Store {
    pub fn new() -> Self {
        Store::default()
    }

    fn expire_if_due(&mut self, key: &Bytes) {
        if let Some(at) = self.expiries.get(key) {
            if *at <= Instant::now() {
                self.entries.remove(key);
                self.expiries.remove(key);
            }
        }
    }

    pub fn get(&mut self, key: &Bytes) -> Option<&Entry> {
        self.expire_if_due(key);
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &Bytes) -> Option<&mut Entry> {
        self.expire_if_due(key);
        self.entries.get_mut(key)
    }

    pub fn contains(&mut self, key: &Bytes) -> bool {
        self.get(key).is_some()
    }

    /// Bump the key's version; WATCH compares these.
    pub fn touch(&mut self, key: &Bytes) {
        self.version_counter += 1;
        self.versions.insert(key.clone(), self.version_counter);
    }

    pub fn version(&self, key: &Bytes) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    pub fn insert(&mut self, key: Bytes, entry: Entry) {
        self.touch(&key);
        self.expiries.remove(&key);
        self.entries.insert(key, entry);
    }

    /// Insert preserving any expiry (used by mutations of existing keys).
    pub fn replace(&mut self, key: Bytes, entry: Entry) {
        self.touch(&key);
        self.entries.insert(key, entry);
    }

    pub fn remove(&mut self, key: &Bytes) -> Option<Entry> {
        self.touch(key);
        self.expiries.remove(key);
        self.entries.remove(key)
    }

    pub fn set_expiry(&mut self, key: &Bytes, at: Instant) -> bool {
        if self.contains(key) {
            self.touch(key);
            self.expiries.insert(key.clone(), at);
            true
        } else {
            false
        }
    }

    pub fn clear_expiry(&mut self, key: &Bytes) -> bool {
        self.expiries.remove(key).is_some()
    }

    pub fn ttl_secs(&mut self, key: &Bytes) -> i64 {
        if !self.contains(key) {
            return -2;
        }
        match self.expiries.get(key) {
            Some(at) => at.saturating_duration_since(Instant::now()).as_secs() as i64,
            None => -1,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.expiries.clear();
        // Versions survive FLUSHDB so WATCH still notices the wipe.
        self.version_counter += 1;
        let counter = self.version_counter;
        for version in self.versions.values_mut() {
            *version = counter;
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &Bytes> {
        self.entries.keys()
    }
}

/// Serialize an entry for `DUMP`. The format is private to the testkit;
/// it only needs to round-trip through `RESTORE`.
pub fn dump_entry(entry: &Entry) -> Bytes {
    use bytes::BytesMut;
    use muninn_proto::encode_frame;

    let frame = match entry {
        Entry::Str(data) => Frame::Array(vec![Frame::bulk("string"), Frame::Bulk(data.clone())]),
        Entry::List(items) => Frame::Array(vec![
            Frame::bulk("list"),
            Frame::Array(items.iter().map(|i| Frame::Bulk(i.clone())).collect()),
        ]),
        Entry::Hash(pairs) => Frame::Array(vec![
            Frame::bulk("hash"),
            Frame::Array(
                pairs
                    .iter()
                    .flat_map(|(f, v)| [Frame::Bulk(f.clone()), Frame::Bulk(v.clone())])
                    .collect(),
            ),
        ]),
        Entry::Set(members) => Frame::Array(vec![
            Frame::bulk("set"),
            Frame::Array(members.iter().map(|m| Frame::Bulk(m.clone())).collect()),
        ]),
        Entry::ZSet(pairs) => Frame::Array(vec![
            Frame::bulk("zset"),
            Frame::Array(
                pairs
                    .iter()
                    .flat_map(|(m, s)| [Frame::Bulk(m.clone()), Frame::Double(*s)])
                    .collect(),
            ),
        ]),
    };
    let mut buf = BytesMut::new();
    encode_frame(&mut buf, &frame);
    buf.freeze()
}

/// Deserialize a `DUMP` payload back into an entry.
pub fn restore_entry(payload: &[u8]) -> Option<Entry> {
    use muninn_proto::Decoder;

    let mut decoder = Decoder::new();
    decoder.extend(payload);
    let Ok(Some(Frame::Array(items))) = decoder.decode() else {
        return None;
    };
    let [tag, body] = items.as_slice() else {
        return None;
    };
    let tag = tag.as_bytes()?;
    match (tag.as_ref(), body) {
        (b"string", Frame::Bulk(data)) => Some(Entry::Str(data.clone())),
        (b"list", Frame::Array(items)) => Some(Entry::List(
            items.iter().map(|i| i.as_bytes().cloned()).collect::<Option<_>>()?,
        )),
        (b"hash", Frame::Array(items)) => {
            let mut pairs = Vec::with_capacity(items.len() / 2);
            for chunk in items.chunks_exact(2) {
                pairs.push((chunk[0].as_bytes()?.clone(), chunk[1].as_bytes()?.clone()));
            }
            Some(Entry::Hash(pairs))
        }
        (b"set", Frame::Array(items)) => Some(Entry::Set(
            items.iter().map(|i| i.as_bytes().cloned()).collect::<Option<_>>()?,
        )),
        (b"zset", Frame::Array(items)) => {
            let mut pairs = Vec::with_capacity(items.len() / 2);
            for chunk in items.chunks_exact(2) {
                let member = chunk[0].as_bytes()?.clone();
                let Frame::Double(score) = chunk[1] else {
                    return None;
                };
                pairs.push((member, score));
            }
            Some(Entry::ZSet(pairs))
        }
        _ => None,
    }
}

/// Glob match supporting `*`, `?`, and literals; enough for pub/sub
/// patterns.
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            glob_match(&pattern[1..], text)
                || (!text.is_empty() && glob_match(pattern, &text[1..]))
        }
        (Some(b'?'), Some(_)) => glob_match(&pattern[1..], &text[1..]),
        (Some(p), Some(t)) if p == t => glob_match(&pattern[1..], &text[1..]),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_change_on_write() {
        let mut store = Store::new();
        let key = Bytes::from_static(b"k");
        let v0 = store.version(&key);
        store.insert(key.clone(), Entry::Str(Bytes::from_static(b"v")));
        let v1 = store.version(&key);
        assert!(v1 > v0);
        store.remove(&key);
        assert!(store.version(&key) > v1);
    }

    #[test]
    fn dump_restore_round_trip() {
        let entries = [
            Entry::Str(Bytes::from_static(b"v")),
            Entry::List(vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]),
            Entry::Hash(vec![(Bytes::from_static(b"f"), Bytes::from_static(b"v"))]),
            Entry::Set(vec![Bytes::from_static(b"m")]),
            Entry::ZSet(vec![(Bytes::from_static(b"m"), 1.5)]),
        ];
        for entry in entries {
            let dumped = dump_entry(&entry);
            assert_eq!(restore_entry(&dumped), Some(entry));
        }
    }

    #[test]
    fn glob_basics() {
        assert!(glob_match(b"c*", b"c1"));
        assert!(glob_match(b"*", b"anything"));
        assert!(glob_match(b"a?c", b"abc"));
        assert!(!glob_match(b"a?c", b"ac"));
        assert!(glob_match(b"exact", b"exact"));
        assert!(!glob_match(b"exact", b"exactly"));
    }
}
