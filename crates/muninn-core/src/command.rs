use std::time::Duration;

use bytes::Bytes;
use muninn_proto::hash_slot;

use crate::config::NodeAddr;

/// Where a command should be dispatched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Route {
    /// Hash the command's first key; standalone mode ignores this.
    #[default]
    Auto,
    /// An explicit hash slot.
    Slot(u16),
    /// A specific node address.
    Node(NodeAddr),
    /// Any primary.
    Random,
    /// Fan out to every primary.
    AllPrimaries,
    /// Fan out to every known node, replicas included.
    AllNodes,
}

impl Route {
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Route::AllPrimaries | Route::AllNodes)
    }
}

/// Post-decode transform requested by the command catalog.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResponseTransform {
    #[default]
    None,
    /// Canonicalize an array reply into a set (unique, insertion-ordered).
    ToSet,
}

/// One fully-encoded command, ready for routing.
///
/// The catalog has already done its work by the time one of these exists:
/// `parts` holds the name tokens and arguments as wire-ready byte strings,
/// and the routing metadata (first key, read/write class) is attached.
#[derive(Clone, Debug, Default)]
pub struct Command {
    /// Name tokens followed by arguments.
    pub parts: Vec<Bytes>,
    pub route: Route,
    /// The first key, when the command has one and the catalog knows its
    /// position. Used for `Route::Auto` slot hashing.
    pub key: Option<Bytes>,
    /// Read-only commands are eligible for replica dispatch.
    pub readonly: bool,
    /// Blocking server commands (BLPOP and friends) get special deadline
    /// handling.
    pub blocking: bool,
    /// Pub/sub subscription commands receive no in-band reply; their
    /// acknowledgements arrive as push frames.
    pub no_reply: bool,
    pub transform: ResponseTransform,
    /// Per-command deadline override. `None` uses the configured default.
    pub timeout: Option<Duration>,
    /// Caller opted out of the client-side deadline entirely (blocking
    /// commands with a server-side timeout of 0).
    pub no_deadline: bool,
}

impl Command {
    pub fn new(parts: Vec<Bytes>) -> Self {
        Command {
            parts,
            ..Command::default()
        }
    }

    /// The hash slot this command targets, when derivable.
    pub fn slot(&self) -> Option<u16> {
        match &self.route {
            Route::Slot(slot) => Some(*slot),
            Route::Auto => self.key.as_deref().map(hash_slot),
            _ => None,
        }
    }

    /// The command name token, for logs.
    pub fn name(&self) -> &[u8] {
        self.parts.first().map(|p| p.as_ref()).unwrap_or(b"")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_from_key() {
        let mut cmd = Command::new(vec![Bytes::from_static(b"GET"), Bytes::from_static(b"foo")]);
        cmd.key = Some(Bytes::from_static(b"foo"));
        assert_eq!(cmd.slot(), Some(12182));
    }

    #[test]
    fn explicit_slot_wins() {
        let mut cmd = Command::new(vec![Bytes::from_static(b"GET"), Bytes::from_static(b"foo")]);
        cmd.key = Some(Bytes::from_static(b"foo"));
        cmd.route = Route::Slot(7);
        assert_eq!(cmd.slot(), Some(7));
    }

    #[test]
    fn broadcast_routes_have_no_slot() {
        let mut cmd = Command::new(vec![Bytes::from_static(b"PING")]);
        cmd.route = Route::AllPrimaries;
        assert_eq!(cmd.slot(), None);
        assert!(cmd.route.is_broadcast());
    }
}
