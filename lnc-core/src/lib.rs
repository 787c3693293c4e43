#![crate_name = "lightning_channel"]

//! The channel layer of a Lightning wallet.
//!
//! A persisted [channel::SerializedChannel] is brought back to life with
//! [connected::ConnectedChannel::connect] and [connected::ConnectedChannel::reestablish],
//! which yields an [active::ActiveChannel] for payments and fee updates. The [monitor]
//! functions watch the chain for breaches and force-closes.

#![forbid(unsafe_code)]
#![allow(bare_trait_objects)]
#![warn(rustdoc::broken_intra_doc_links)]

pub use bitcoin;
pub use lightning;
pub use lnc_protocol;

/// Payments, fee updates and closing on a live channel
pub mod active;
/// Penalty transactions for revoked commitments
pub mod breach;
/// Chain backend interface
pub mod chain;
/// The persisted channel and its derived status
pub mod channel;
/// Commitment state machine
pub mod commitments;
/// Reconnection and reestablishment
pub mod connected;
/// Services shared by live channels
pub mod context;
/// Error classification
pub mod error;
/// HTLC and payment types
pub mod htlc;
/// Channel key derivation and revealed secrets
pub mod keys;
/// On-chain monitoring
pub mod monitor;
/// Onion and invoice interfaces
pub mod onion;
/// Peer connection
pub mod peer;
/// Persistence
pub mod persist;
/// Transaction parsing and construction
pub mod tx;
/// Various utilities
pub mod util;
/// Watch tower interface
pub mod watchtower;
