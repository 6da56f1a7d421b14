//! Pipeline and transaction builders.

use bytes::Bytes;
use muninn_core::{Command, DecodeMode, Error, ExecOutcome, Router};

use crate::cmd::{Cmd, cmd};
use crate::value::Value;

/// A non-atomic batch: commands submitted together, replies stitched back
/// into submission order. In cluster mode the commands may fan out to
/// different nodes and run concurrently.
#[derive(Debug)]
pub struct Pipeline {
    router: Router,
    mode: DecodeMode,
    commands: Vec<Command>,
}

impl Pipeline {
    pub(crate) fn new(router: Router, mode: DecodeMode) -> Self {
        Pipeline {
            router,
            mode,
            commands: Vec::new(),
        }
    }

    /// Queue any command built with [`crate::cmd::cmd`].
    pub fn add(&mut self, cmd: Cmd) -> &mut Self {
        self.commands.push(cmd.into_command());
        self
    }

    pub fn get(&mut self, key: impl Into<Bytes>) -> &mut Self {
        self.add(cmd("GET").key(key).readonly())
    }

    pub fn set(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> &mut Self {
        self.add(cmd("SET").key(key).arg(value))
    }

    pub fn incr(&mut self, key: impl Into<Bytes>) -> &mut Self {
        self.add(cmd("INCR").key(key))
    }

    pub fn del(&mut self, key: impl Into<Bytes>) -> &mut Self {
        self.add(cmd("DEL").key(key))
    }

    pub fn sadd(
        &mut self,
        key: impl Into<Bytes>,
        members: impl IntoIterator<Item = impl Into<Bytes>>,
    ) -> &mut Self {
        self.add(cmd("SADD").key(key).args(members))
    }

    pub fn smembers(&mut self, key: impl Into<Bytes>) -> &mut Self {
        self.add(cmd("SMEMBERS").key(key).readonly().to_set())
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Run the batch; the first command-level error fails the call.
    pub async fn execute(self) -> Result<Vec<Value>, Error> {
        let frames = self.router.run_pipeline(&self.commands).await?;
        frames
            .into_iter()
            .zip(&self.commands)
            .map(|(frame, command)| Value::decode(frame, self.mode, command.transform))
            .collect()
    }

    /// Run the batch, keeping per-command errors in place.
    pub async fn try_execute(self) -> Result<Vec<Result<Value, Error>>, Error> {
        let frames = self.router.run_pipeline(&self.commands).await?;
        Ok(frames
            .into_iter()
            .zip(&self.commands)
            .map(|(frame, command)| Value::decode(frame, self.mode, command.transform))
            .collect())
    }
}

/// The outcome of an atomic batch.
#[derive(Clone, Debug, PartialEq)]
pub enum ExecResult {
    /// One reply per queued command, in order.
    Replies(Vec<Value>),
    /// A watched key changed; the server ran nothing.
    Aborted,
}

/// An atomic `MULTI`/`EXEC` batch with optional `WATCH` keys.
///
/// In cluster mode every key (watched keys included) must hash to one
/// slot; mismatches fail before any byte is written. Watch keys supplied
/// through [`Transaction::watch`] are sent immediately before the `MULTI`
/// in the same block; to watch keys *before* building the transaction use
/// [`crate::Client::watch`].
#[derive(Debug)]
pub struct Transaction {
    router: Router,
    mode: DecodeMode,
    watch: Vec<Bytes>,
    commands: Vec<Command>,
}

impl Transaction {
    pub(crate) fn new(router: Router, mode: DecodeMode) -> Self {
        Transaction {
            router,
            mode,
            watch: Vec::new(),
            commands: Vec::new(),
        }
    }

    /// Watch keys as part of the submitted block.
    pub fn watch(&mut self, keys: impl IntoIterator<Item = impl Into<Bytes>>) -> &mut Self {
        self.watch.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn add(&mut self, cmd: Cmd) -> &mut Self {
        self.commands.push(cmd.into_command());
        self
    }

    pub fn get(&mut self, key: impl Into<Bytes>) -> &mut Self {
        self.add(cmd("GET").key(key).readonly())
    }

    pub fn set(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> &mut Self {
        self.add(cmd("SET").key(key).arg(value))
    }

    pub fn incr(&mut self, key: impl Into<Bytes>) -> &mut Self {
        self.add(cmd("INCR").key(key))
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Submit the block and interpret the `EXEC` reply.
    pub async fn exec(self) -> Result<ExecResult, Error> {
        match self.router.run_transaction(&self.watch, &self.commands).await? {
            ExecOutcome::Aborted => Ok(ExecResult::Aborted),
            ExecOutcome::Replies(frames) => {
                let values = frames
                    .into_iter()
                    .zip(&self.commands)
                    .map(|(frame, command)| Value::decode(frame, self.mode, command.transform))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ExecResult::Replies(values))
            }
        }
    }
}
