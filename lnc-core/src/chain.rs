//! Access to the base chain
use core::fmt;

use async_trait::async_trait;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::{OutPoint, Script, Transaction, Txid};

use crate::error::ClassifiedError;

/// Chain query errors. The core never retries, retry policy belongs to the implementation.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    /// The backend could not be reached, might work later
    #[error("chain backend unavailable: {0}")]
    Unavailable(String),
    /// The backend does not know the transaction
    #[error("not found: {0}")]
    NotFound(String),
    /// The backend refused a broadcast
    #[error("transaction rejected: {0}")]
    Rejected(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ClassifiedError for ChainError {
    fn channel_breakdown(&self) -> bool {
        false
    }

    fn possible_bug(&self) -> bool {
        matches!(self, ChainError::Rejected(_))
    }
}

/// SHA256 of an output script, the key of script-based chain queries
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScriptHash(pub sha256::Hash);

impl ScriptHash {
    pub fn from_script(script: &Script) -> Self {
        ScriptHash(sha256::Hash::hash(script.as_bytes()))
    }
}

impl fmt::Display for ScriptHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // forward byte order, unlike txids
        f.write_str(&hex::encode(self.0.to_byte_array()))
    }
}

impl fmt::Debug for ScriptHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScriptHash({})", self)
    }
}

/// A transaction touching a script
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryEntry {
    pub txid: Txid,
    /// None while in the mempool
    pub height: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnspentOutput {
    pub outpoint: OutPoint,
    pub value_sat: u64,
    pub height: Option<u32>,
}

/// Queries against the base chain. Every failure is surfaced to the caller.
#[async_trait]
pub trait ChainQuery: Send + Sync {
    /// Zero while unconfirmed, [ChainError::NotFound] if the transaction is unknown
    async fn get_confirmations(&self, txid: &Txid) -> Result<u32, ChainError>;

    async fn get_block_height(&self) -> Result<u32, ChainError>;

    async fn get_script_hash_history(
        &self,
        script_hash: &ScriptHash,
    ) -> Result<Vec<HistoryEntry>, ChainError>;

    async fn get_transaction(&self, txid: &Txid) -> Result<Transaction, ChainError>;

    async fn get_unspent_outputs(
        &self,
        script_hash: &ScriptHash,
    ) -> Result<Vec<UnspentOutput>, ChainError>;

    async fn broadcast_transaction(&self, tx: &Transaction) -> Result<Txid, ChainError>;

    /// Feerate in sat per 1000 weight units for confirmation within `target_blocks`
    async fn estimate_fee(&self, target_blocks: u16) -> Result<u32, ChainError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::ScriptBuf;
    use test_log::test;

    #[test]
    fn script_hash_is_forward_sha256() {
        let script = ScriptBuf::from_bytes(vec![0x00, 0x14, 0x01]);
        let hash = ScriptHash::from_script(&script);
        assert_eq!(hash.to_string(), sha256::Hash::hash(&[0x00, 0x14, 0x01]).to_string());
        assert_eq!(hash.to_string().len(), 64);
    }
}
