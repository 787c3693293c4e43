#![crate_name = "lnc_frontend"]
#![forbid(unsafe_code)]
#![allow(bare_trait_objects)]

//! Networked services around the channel layer: the chain watcher and its
//! Esplora backend, and the watch-tower client.

pub mod esplora;
pub mod watcher;
pub mod watchtower;

pub use self::esplora::EsploraChainQuery;
pub use self::watcher::{ChainWatcher, WatchedAccount};
pub use self::watchtower::HttpWatchTower;
