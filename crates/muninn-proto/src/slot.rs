//! Cluster key hashing and redirection parsing.
//!
//! Keys are assigned to one of 16384 hash slots with the same CRC16
//! (CRC-16/XMODEM, polynomial 0x1021) the server uses, restricted to the
//! hash tag when the key carries one.

use std::fmt;

use crate::{ServerError, ServerErrorKind};

/// Total number of cluster hash slots.
pub const CLUSTER_SLOTS: u16 = 16384;

/// CRC-16/XMODEM over `data`, bit-identical to the server's slot hash.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// The portion of a key that participates in slot hashing.
///
/// The tag is the substring between the first `{` and the first `}` that
/// follows it. Empty braces (`{}`) are not a tag; hashing falls back to the
/// whole key, matching the server.
pub fn hash_portion(key: &[u8]) -> &[u8] {
    let Some(open) = key.iter().position(|&b| b == b'{') else {
        return key;
    };
    let Some(close) = key[open + 1..].iter().position(|&b| b == b'}') else {
        return key;
    };
    if close == 0 {
        return key;
    }
    &key[open + 1..open + 1 + close]
}

/// The cluster hash slot for `key`, hash-tag aware.
pub fn hash_slot(key: &[u8]) -> u16 {
    crc16(hash_portion(key)) % CLUSTER_SLOTS
}

/// The two redirection verbs a cluster node can answer with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RedirectionKind {
    /// The slot has moved permanently; update the topology and retry.
    Moved,
    /// The slot is migrating; retry once at the target behind `ASKING`.
    Ask,
}

/// A parsed `MOVED`/`ASK` redirection error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Redirection {
    pub kind: RedirectionKind,
    pub slot: u16,
    /// Redirect target host. May be empty, in which case the host of the
    /// replying node applies.
    pub host: String,
    pub port: u16,
}

impl Redirection {
    /// Parse a redirection from a server error reply.
    ///
    /// Returns `None` for anything that is not a well-formed
    /// `MOVED <slot> <host:port>` or `ASK <slot> <host:port>` line.
    pub fn parse(error: &ServerError) -> Option<Redirection> {
        let kind = match error.kind {
            ServerErrorKind::Moved => RedirectionKind::Moved,
            ServerErrorKind::Ask => RedirectionKind::Ask,
            _ => return None,
        };

        let text = std::str::from_utf8(&error.message).ok()?;
        let mut parts = text.split_ascii_whitespace();
        let _verb = parts.next()?;
        let slot: u16 = parts.next()?.parse().ok()?;
        if slot >= CLUSTER_SLOTS {
            return None;
        }
        let addr = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        let (host, port) = addr.rsplit_once(':')?;
        let port: u16 = port.parse().ok()?;

        Some(Redirection {
            kind,
            slot,
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Redirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self.kind {
            RedirectionKind::Moved => "MOVED",
            RedirectionKind::Ask => "ASK",
        };
        write!(f, "{} {} {}:{}", verb, self.slot, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn crc16_reference_vector() {
        // CRC-16/XMODEM check value.
        assert_eq!(crc16(b"123456789"), 0x31c3);
        assert_eq!(crc16(b""), 0);
    }

    #[test]
    fn well_known_slots() {
        assert_eq!(hash_slot(b"foo"), 12182);
        assert_eq!(hash_slot(b"bar"), 5061);
    }

    #[test]
    fn hash_tags_colocate_keys() {
        assert_eq!(hash_portion(b"{user1000}.following"), b"user1000");
        assert_eq!(hash_portion(b"{user1000}.followers"), b"user1000");
        assert_eq!(
            hash_slot(b"{user1000}.following"),
            hash_slot(b"{user1000}.followers")
        );
        assert_eq!(hash_slot(b"{user1000}.following"), hash_slot(b"user1000"));
    }

    #[test]
    fn nested_and_trailing_braces() {
        // Only the first `{` and the first `}` after it matter.
        assert_eq!(hash_portion(b"foo{{bar}}zap"), b"{bar");
        assert_eq!(hash_portion(b"foo{bar}{zap}"), b"bar");
        // An unterminated tag is no tag.
        assert_eq!(hash_portion(b"foo{bar"), b"foo{bar");
    }

    #[test]
    fn empty_braces_are_not_a_tag() {
        // The server hashes the entire key when the braces are empty.
        assert_eq!(hash_portion(b"foo{}{bar}"), b"foo{}{bar}");
        assert_eq!(hash_portion(b"{}"), b"{}");
    }

    #[test]
    fn parse_moved() {
        let err = ServerError::parse(Bytes::from_static(b"MOVED 3999 127.0.0.1:6381"));
        let redirect = Redirection::parse(&err).unwrap();
        assert_eq!(redirect.kind, RedirectionKind::Moved);
        assert_eq!(redirect.slot, 3999);
        assert_eq!(redirect.host, "127.0.0.1");
        assert_eq!(redirect.port, 6381);
    }

    #[test]
    fn parse_ask_with_empty_host() {
        let err = ServerError::parse(Bytes::from_static(b"ASK 42 :7002"));
        let redirect = Redirection::parse(&err).unwrap();
        assert_eq!(redirect.kind, RedirectionKind::Ask);
        assert_eq!(redirect.slot, 42);
        assert_eq!(redirect.host, "");
        assert_eq!(redirect.port, 7002);
    }

    #[test]
    fn parse_rejects_garbage() {
        for line in [
            "MOVED",
            "MOVED 3999",
            "MOVED notaslot 127.0.0.1:6381",
            "MOVED 99999 127.0.0.1:6381",
            "MOVED 1 127.0.0.1:6381 extra",
            "ERR not a redirect",
        ] {
            let err = ServerError::parse(Bytes::copy_from_slice(line.as_bytes()));
            assert!(Redirection::parse(&err).is_none(), "line: {line}");
        }
    }
}
