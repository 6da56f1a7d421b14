#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

mod codec;
mod frame;
mod slot;

pub use codec::*;
pub use frame::*;
pub use slot::*;
