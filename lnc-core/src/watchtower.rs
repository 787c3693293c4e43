//! Out-of-band delivery of penalty data to a third party
use async_trait::async_trait;
use bitcoin::{Transaction, Txid};
use serde_derive::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::channel::ChannelId;
use crate::util::ser_util::TransactionHandler;

/// What a watch tower needs to punish a revoked commitment on our behalf
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PenaltyNotice {
    pub channel_id: ChannelId,
    pub commitment_number: u64,
    pub commitment_txid: Txid,
    #[serde_as(as = "TransactionHandler")]
    pub penalty_tx: Transaction,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum WatchTowerError {
    #[error("watch tower unreachable: {0}")]
    Unreachable(String),
    #[error("watch tower refused: {0}")]
    Refused(String),
}

/// Delivery is best effort, callers log failures and carry on
#[async_trait]
pub trait WatchTower: Send + Sync {
    async fn notify(&self, notice: &PenaltyNotice) -> Result<(), WatchTowerError>;
}
