//! Atomic transactions and non-atomic pipelines.
//!
//! A transaction is one contiguous block on one connection: optional
//! `WATCH`, `MULTI`, the queued commands, `EXEC`. In cluster mode every
//! key in the block must hash to one slot, validated before any byte is
//! written. A pipeline submits its commands independently (fanning out
//! across nodes in cluster mode) and stitches the replies back into
//! submission order.

use bytes::Bytes;
use futures_util::future::join_all;
use muninn_proto::{Frame, Redirection, RedirectionKind, ServerErrorKind, hash_slot};

use crate::command::Command;
use crate::config::NodeAddr;
use crate::error::{Error, ErrorKind};
use crate::router::Router;

/// The outcome of `EXEC`.
#[derive(Clone, Debug, PartialEq)]
pub enum ExecOutcome {
    /// The transaction ran; one reply per queued command, native types
    /// preserved, command errors inline.
    Replies(Vec<Frame>),
    /// A watched key changed before `EXEC`; nothing ran.
    Aborted,
}

impl Router {
    /// Run commands independently and return replies in submission order.
    ///
    /// Command-level error replies stay inline in the result; transport
    /// errors fail the whole pipeline.
    pub async fn run_pipeline(&self, commands: &[Command]) -> Result<Vec<Frame>, Error> {
        // join_all preserves input order no matter which node answers
        // first.
        let replies = join_all(commands.iter().map(|command| self.execute(command))).await;
        replies.into_iter().collect()
    }

    /// Run an atomic `WATCH`/`MULTI`/`EXEC` block.
    ///
    /// `watch` keys participate in the slot-agreement check along with
    /// every command key.
    pub async fn run_transaction(
        &self,
        watch: &[Bytes],
        commands: &[Command],
    ) -> Result<ExecOutcome, Error> {
        if commands.is_empty() {
            return Ok(ExecOutcome::Replies(Vec::new()));
        }
        let slot = transaction_slot(watch, commands, self.config().cluster_mode)?;
        let deadline = self.deadline_for(&commands[0]);

        let mut frames = Vec::with_capacity(commands.len() + 3);
        if !watch.is_empty() {
            let mut parts = Vec::with_capacity(watch.len() + 1);
            parts.push(Bytes::from_static(b"WATCH"));
            parts.extend(watch.iter().cloned());
            frames.push(parts);
        }
        frames.push(vec![Bytes::from_static(b"MULTI")]);
        for command in commands {
            frames.push(command.parts.clone());
        }
        frames.push(vec![Bytes::from_static(b"EXEC")]);

        let mut redirects = 0u32;
        let mut asking: Option<NodeAddr> = None;
        loop {
            let (addr, with_asking) = match asking.take() {
                Some(addr) => (addr, true),
                None => (self.transaction_target(slot)?, false),
            };
            let conn = self.connection_to(&addr).await?;

            let mut block: Vec<Vec<Bytes>> = Vec::with_capacity(frames.len() + 1);
            if with_asking {
                block.push(vec![Bytes::from_static(b"ASKING")]);
            }
            block.extend(frames.iter().cloned());
            let replies = conn.request_block(block, deadline).await?;
            let body = if with_asking && !replies.is_empty() {
                &replies[1..]
            } else {
                &replies[..]
            };

            match interpret_replies(body, !watch.is_empty()) {
                Interpretation::Done(outcome) => return Ok(outcome),
                Interpretation::Failed(error) => return Err(error),
                Interpretation::Redirected(redirect) => {
                    redirects += 1;
                    if redirects > self.config().max_redirections {
                        return Err(Error::new(
                            ErrorKind::Cluster,
                            format!("transaction redirected more than {} times", redirects - 1),
                        ));
                    }
                    let host = if redirect.host.is_empty() {
                        addr.host.clone()
                    } else {
                        redirect.host.clone()
                    };
                    let target = NodeAddr::new(host, redirect.port);
                    tracing::debug!(%redirect, %target, "transaction redirected");
                    match redirect.kind {
                        RedirectionKind::Moved => {
                            // Next attempt re-resolves against the updated
                            // map.
                            self.apply_moved(redirect.slot, target);
                        }
                        RedirectionKind::Ask => asking = Some(target),
                    }
                }
            }
        }
    }

    fn transaction_target(&self, slot: Option<u16>) -> Result<NodeAddr, Error> {
        if !self.config().cluster_mode {
            return Ok(self.config().addresses[0].clone());
        }
        let slot = slot.ok_or_else(|| {
            Error::new(
                ErrorKind::Cluster,
                "a cluster transaction needs at least one key",
            )
        })?;
        self.primary_for_slot(slot)
    }
}

enum Interpretation {
    Done(ExecOutcome),
    Failed(Error),
    Redirected(Redirection),
}

/// Map the block's replies to an outcome.
///
/// Reply layout: `[WATCH]?, MULTI, QUEUED.., EXEC`. Queuing errors make
/// the server discard the transaction and answer `EXEC` with `EXECABORT`;
/// redirections at queue time retry the whole block.
fn interpret_replies(replies: &[Frame], watched: bool) -> Interpretation {
    let preamble = if watched { 2 } else { 1 };
    if replies.len() < preamble + 1 {
        return Interpretation::Failed(Error::new(
            ErrorKind::Protocol,
            "short transaction reply",
        ));
    }

    // Any redirection inside the block retries the block wholesale.
    for frame in replies {
        if let Frame::Error(error) = frame {
            if let Some(redirect) = Redirection::parse(error) {
                return Interpretation::Redirected(redirect);
            }
        }
    }

    // WATCH / MULTI failures are fatal for the transaction.
    for frame in &replies[..preamble] {
        if let Frame::Error(error) = frame {
            return Interpretation::Failed(Error::from_server(error.clone()));
        }
    }

    let exec = replies.last().expect("length checked above");
    match exec {
        Frame::Null => Interpretation::Done(ExecOutcome::Aborted),
        Frame::Error(error) if error.kind == ServerErrorKind::ExecAbort => {
            // Attach the first queuing error, which is the actual cause.
            let cause = replies[preamble..replies.len() - 1]
                .iter()
                .find_map(|frame| match frame {
                    Frame::Error(e) => Some(e.message_lossy()),
                    _ => None,
                });
            Interpretation::Failed(Error::new(
                ErrorKind::ExecAbort,
                cause.unwrap_or_else(|| error.message_lossy()),
            ))
        }
        Frame::Error(error) => Interpretation::Failed(Error::from_server(error.clone())),
        Frame::Array(items) => Interpretation::Done(ExecOutcome::Replies(items.clone())),
        other => Interpretation::Failed(Error::new(
            ErrorKind::Protocol,
            format!("unexpected EXEC reply of kind {}", other.kind_name()),
        )),
    }
}

/// The single slot a cluster transaction targets, or an error when the
/// keys disagree. Standalone mode skips the check entirely.
fn transaction_slot(
    watch: &[Bytes],
    commands: &[Command],
    cluster_mode: bool,
) -> Result<Option<u16>, Error> {
    if !cluster_mode {
        return Ok(None);
    }
    let mut slot: Option<u16> = None;
    let keys = watch
        .iter()
        .map(|key| hash_slot(key))
        .chain(commands.iter().filter_map(Command::slot));
    for candidate in keys {
        match slot {
            None => slot = Some(candidate),
            Some(existing) if existing == candidate => {}
            Some(existing) => {
                return Err(Error::new(
                    ErrorKind::Cluster,
                    format!(
                        "transaction keys hash to different slots ({existing} and {candidate}); \
                         use a common hash tag"
                    ),
                ));
            }
        }
    }
    Ok(slot)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyed(name: &str, key: &'static str) -> Command {
        let mut command = Command::new(vec![
            Bytes::copy_from_slice(name.as_bytes()),
            Bytes::from_static(key.as_bytes()),
        ]);
        command.key = Some(Bytes::from_static(key.as_bytes()));
        command
    }

    #[test]
    fn same_slot_transactions_pass_validation() {
        let commands = [keyed("SET", "{user}.a"), keyed("INCR", "{user}.b")];
        let slot = transaction_slot(&[], &commands, true).unwrap();
        assert_eq!(slot, Some(hash_slot(b"user")));
    }

    #[test]
    fn cross_slot_transactions_fail_before_submission() {
        let commands = [keyed("SET", "foo"), keyed("INCR", "bar")];
        let err = transaction_slot(&[], &commands, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cluster);
    }

    #[test]
    fn watch_keys_join_the_slot_union() {
        let commands = [keyed("SET", "foo")];
        let err = transaction_slot(&[Bytes::from_static(b"bar")], &commands, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cluster);
    }

    #[test]
    fn standalone_skips_slot_validation() {
        let commands = [keyed("SET", "foo"), keyed("INCR", "bar")];
        assert_eq!(transaction_slot(&[], &commands, false).unwrap(), None);
    }

    #[test]
    fn exec_nil_is_an_abort() {
        let replies = vec![Frame::simple("OK"), Frame::simple("QUEUED"), Frame::Null];
        match interpret_replies(&replies, false) {
            Interpretation::Done(ExecOutcome::Aborted) => {}
            _ => panic!("expected abort"),
        }
    }

    #[test]
    fn exec_array_preserves_native_types() {
        let replies = vec![
            Frame::simple("OK"),
            Frame::simple("QUEUED"),
            Frame::simple("QUEUED"),
            Frame::Array(vec![Frame::simple("OK"), Frame::Integer(2)]),
        ];
        match interpret_replies(&replies, false) {
            Interpretation::Done(ExecOutcome::Replies(items)) => {
                assert_eq!(items, vec![Frame::simple("OK"), Frame::Integer(2)]);
            }
            _ => panic!("expected replies"),
        }
    }

    #[test]
    fn queuing_error_surfaces_as_exec_abort() {
        let queue_err = muninn_proto::ServerError::parse(Bytes::from_static(
            b"ERR unknown command 'SETT'",
        ));
        let abort = muninn_proto::ServerError::parse(Bytes::from_static(
            b"EXECABORT Transaction discarded because of previous errors.",
        ));
        let replies = vec![
            Frame::simple("OK"),
            Frame::Error(queue_err),
            Frame::Error(abort),
        ];
        match interpret_replies(&replies, false) {
            Interpretation::Failed(error) => {
                assert_eq!(error.kind(), ErrorKind::ExecAbort);
                assert!(error.details().contains("SETT"));
            }
            _ => panic!("expected failure"),
        }
    }

    #[test]
    fn queue_time_redirection_retries_the_block() {
        let moved =
            muninn_proto::ServerError::parse(Bytes::from_static(b"MOVED 12182 10.0.0.2:7001"));
        let replies = vec![
            Frame::simple("OK"),
            Frame::Error(moved),
            Frame::Null,
        ];
        match interpret_replies(&replies, false) {
            Interpretation::Redirected(redirect) => assert_eq!(redirect.slot, 12182),
            _ => panic!("expected redirection"),
        }
    }
}
