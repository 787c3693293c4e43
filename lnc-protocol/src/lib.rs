//! Peer wire messages used while operating a channel, with their BOLT encoding.

pub mod error;
mod io;
pub mod msgs;

pub use bitcoin;
