//! The command builder: the catalog's per-command declaration surface.
//!
//! Each typed operation declares its name tokens, key position, read/write
//! class, and any post-decode transform through this builder. The result
//! is a fully-encoded [`Command`] the router can dispatch without knowing
//! anything about individual commands.

use std::time::Duration;

use bytes::Bytes;
use muninn_core::{Command, ResponseTransform, Route};

/// Builder for one command invocation.
#[derive(Clone, Debug)]
pub struct Cmd {
    command: Command,
}

/// Start a command from its name token.
pub fn cmd(name: &'static str) -> Cmd {
    Cmd {
        command: Command::new(vec![Bytes::from_static(name.as_bytes())]),
    }
}

/// Start a command with a subcommand token (`CLIENT SETNAME`, ...).
pub fn cmd2(name: &'static str, sub: &'static str) -> Cmd {
    Cmd {
        command: Command::new(vec![
            Bytes::from_static(name.as_bytes()),
            Bytes::from_static(sub.as_bytes()),
        ]),
    }
}

impl Cmd {
    /// Append the command's key. The first key also becomes the routing
    /// key for cluster slot hashing.
    pub fn key(mut self, key: impl Into<Bytes>) -> Self {
        let key = key.into();
        if self.command.key.is_none() {
            self.command.key = Some(key.clone());
        }
        self.command.parts.push(key);
        self
    }

    pub fn arg(mut self, arg: impl Into<Bytes>) -> Self {
        self.command.parts.push(arg.into());
        self
    }

    pub fn arg_int(self, value: i64) -> Self {
        self.arg(value.to_string())
    }

    pub fn arg_float(self, value: f64) -> Self {
        let token = if value == f64::INFINITY {
            "+inf".to_string()
        } else if value == f64::NEG_INFINITY {
            "-inf".to_string()
        } else {
            value.to_string()
        };
        self.arg(token)
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<Bytes>>) -> Self {
        self.command.parts.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn keys(mut self, keys: impl IntoIterator<Item = impl Into<Bytes>>) -> Self {
        for key in keys {
            self = self.key(key);
        }
        self
    }

    /// Mark read-only; eligible for replica dispatch under
    /// `ReadPolicy::PreferReplica`.
    pub fn readonly(mut self) -> Self {
        self.command.readonly = true;
        self
    }

    /// Mark as a blocking server command.
    pub fn blocking(mut self) -> Self {
        self.command.blocking = true;
        self
    }

    /// Canonicalize the array reply into a set.
    pub fn to_set(mut self) -> Self {
        self.command.transform = ResponseTransform::ToSet;
        self
    }

    pub fn route(mut self, route: Route) -> Self {
        self.command.route = route;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.command.timeout = Some(timeout);
        self
    }

    /// Opt out of the client-side deadline (blocking commands with a
    /// server-side timeout of 0).
    pub fn no_deadline(mut self) -> Self {
        self.command.no_deadline = true;
        self
    }

    pub fn into_command(self) -> Command {
        self.command
    }
}

impl From<Cmd> for Command {
    fn from(cmd: Cmd) -> Command {
        cmd.command
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_key_becomes_the_routing_key() {
        let command = cmd("GETRANGE").key("k").arg_int(0).arg_int(-1).into_command();
        assert_eq!(command.key.as_deref(), Some(b"k".as_slice()));
        assert_eq!(command.parts.len(), 4);
    }

    #[test]
    fn multi_key_commands_route_by_the_first() {
        let command = cmd("DEL").keys(["a", "b", "c"]).into_command();
        assert_eq!(command.key.as_deref(), Some(b"a".as_slice()));
        assert_eq!(command.parts.len(), 4);
    }

    #[test]
    fn float_args_use_protocol_tokens() {
        let command = cmd("ZRANGEBYSCORE")
            .key("k")
            .arg_float(f64::NEG_INFINITY)
            .arg_float(f64::INFINITY)
            .into_command();
        assert_eq!(command.parts[2].as_ref(), b"-inf");
        assert_eq!(command.parts[3].as_ref(), b"+inf");
    }
}
