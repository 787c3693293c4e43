use std::sync::Arc;
use std::time::Duration;

use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::ScriptBuf;

use crate::onion::{OnionProcessor, PaymentRegistry};
use crate::persist::{BreachStore, ChannelLocks, ChannelStore};
use crate::watchtower::WatchTower;

/// How long to wait for more messages when draining after reconnection
pub const DEFAULT_REBROADCAST_TIMEOUT: Duration = Duration::from_secs(30);

/// The funding account a channel belongs to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Account {
    pub id: String,
    /// Where penalties and sweeps send their funds
    pub sweep_destination: ScriptBuf,
}

/// Services shared by the live channels of one account
#[derive(Clone)]
pub struct ChannelContext {
    pub account: Account,
    pub channel_store: Arc<dyn ChannelStore>,
    pub breach_store: Arc<dyn BreachStore>,
    pub locks: ChannelLocks,
    pub onion: Arc<dyn OnionProcessor>,
    pub payments: Arc<dyn PaymentRegistry>,
    pub watch_tower: Option<Arc<dyn WatchTower>>,
    pub secp_ctx: Arc<Secp256k1<All>>,
    pub rebroadcast_timeout: Duration,
}
