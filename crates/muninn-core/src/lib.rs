#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

mod batch;
mod command;
mod config;
mod connection;
mod error;
mod inflight;
mod pubsub;
mod router;
mod topology;

pub use batch::*;
pub use command::*;
pub use config::*;
pub use connection::{ConnState, ConnectionEvent, ConnectionHandle};
pub use error::*;
pub use inflight::{Inflight, Responder};
pub use pubsub::*;
pub use router::*;
pub use topology::*;

// Re-export the wire layer so downstream crates see one coherent surface.
pub use muninn_proto as proto;
