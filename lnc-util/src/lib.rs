//! Logging and configuration helpers for the channel daemons

pub mod config;
pub mod env_var;
pub mod util;

pub use env_var::*;
