#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

mod batch;
pub mod cmd;
mod commands;
mod value;

pub use batch::{ExecResult, Pipeline, Transaction};
pub use commands::{Expiration, SetCondition, SetOptions, ZAddOptions};
pub use value::Value;

// The configuration and error surface is shared with the core.
pub use muninn_core::{
    Aggregate, Config, Credentials, DecodeMode, Error, ErrorKind, Message, MessageCallback,
    NodeAddr, ProtocolVersion, PubsubConfig, ReadPolicy, ReconnectPolicy, Route,
};
pub use muninn_proto::{Frame, ServerErrorKind};

use muninn_core::Router;

/// A handle to one logical client: cheap to clone, safe to share.
///
/// All clones multiplex over the same connections; dropping the last one
/// does not close sockets; call [`Client::close`] for an orderly
/// shutdown.
#[derive(Clone, Debug)]
pub struct Client {
    pub(crate) router: Router,
}

impl Client {
    /// Validate the configuration and connect.
    ///
    /// Standalone mode dials the first address; cluster mode discovers
    /// the topology from the seed list. Configured pub/sub subscriptions
    /// are issued during the handshake.
    pub async fn connect(config: Config) -> Result<Client, Error> {
        let router = Router::connect(config).await?;
        Ok(Client { router })
    }

    pub(crate) fn decode_mode(&self) -> muninn_core::DecodeMode {
        self.router.config().default_decoder
    }

    pub(crate) async fn run(&self, cmd: cmd::Cmd) -> Result<Value, Error> {
        let command = cmd.into_command();
        let transform = command.transform;
        let frame = self.router.execute(&command).await?;
        Value::decode(frame, self.decode_mode(), transform)
    }

    /// Run a raw command built with [`cmd::cmd`]; the escape hatch for
    /// anything the typed surface does not cover.
    pub async fn command(&self, cmd: cmd::Cmd) -> Result<Value, Error> {
        self.run(cmd).await
    }

    /// Start a non-atomic pipeline.
    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.router.clone(), self.decode_mode())
    }

    /// Start an atomic transaction.
    pub fn transaction(&self) -> Transaction {
        Transaction::new(self.router.clone(), self.decode_mode())
    }

    /// Wait for the next pub/sub message.
    ///
    /// Fails when the client is closing, when no subscriptions are
    /// configured, or when a callback owns delivery.
    pub async fn next_message(&self) -> Result<Message, Error> {
        self.router.pubsub().recv().await
    }

    /// Pop the next queued pub/sub message without waiting.
    pub fn try_next_message(&self) -> Result<Option<Message>, Error> {
        self.router.pubsub().try_recv()
    }

    /// Reject in-flight and future requests with a closing error and shut
    /// every socket down. Queued pub/sub messages are dropped.
    pub fn close(&self) {
        self.router.close();
    }

    pub fn is_closed(&self) -> bool {
        self.router.is_closed()
    }
}
