use std::collections::BTreeMap;

use async_trait::async_trait;
use bitcoin::consensus::encode::{deserialize, serialize_hex};
use bitcoin::{OutPoint, Transaction, Txid};
use lightning_channel::chain::{ChainError, ChainQuery, HistoryEntry, ScriptHash, UnspentOutput};
use log::{debug, info};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

/// Lowest feerate relayed by default, in sat per 1000 weight units
pub const FEERATE_FLOOR_PER_KW: u32 = 253;

#[derive(Deserialize, Debug)]
struct TxStatus {
    confirmed: bool,
    block_height: Option<u32>,
}

#[derive(Deserialize, Debug)]
struct HistoryResponse {
    txid: Txid,
    status: TxStatus,
}

#[derive(Deserialize, Debug)]
struct UtxoResponse {
    txid: Txid,
    vout: u32,
    value: u64,
    status: TxStatus,
}

impl TxStatus {
    fn height(&self) -> Option<u32> {
        if self.confirmed {
            self.block_height
        } else {
            None
        }
    }
}

/// [ChainQuery] over the Esplora REST API
#[derive(Clone, Debug)]
pub struct EsploraChainQuery {
    client: Client,
    base: String,
}

impl EsploraChainQuery {
    pub fn new(url: &Url) -> Self {
        let base = url.as_str().trim_end_matches('/').to_string();
        EsploraChainQuery { client: Client::new(), base }
    }

    async fn checked(
        &self,
        res: Result<Response, reqwest::Error>,
        what: &str,
    ) -> Result<Response, ChainError> {
        let res = res.map_err(|e| ChainError::Unavailable(e.to_string()))?;
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }
        let body = res.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::NOT_FOUND => ChainError::NotFound(what.to_string()),
            StatusCode::BAD_REQUEST => ChainError::Rejected(body),
            _ => ChainError::Unavailable(format!("{} {}", status, body)),
        })
    }

    async fn get_text(&self, path: &str) -> Result<String, ChainError> {
        let res = self.client.get(format!("{}{}", self.base, path)).send().await;
        let res = self.checked(res, path).await?;
        res.text().await.map_err(|e| ChainError::InvalidResponse(e.to_string()))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ChainError> {
        let res = self.client.get(format!("{}{}", self.base, path)).send().await;
        let res = self.checked(res, path).await?;
        res.json::<T>().await.map_err(|e| ChainError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl ChainQuery for EsploraChainQuery {
    async fn get_confirmations(&self, txid: &Txid) -> Result<u32, ChainError> {
        let status: TxStatus = self.get_json(&format!("/tx/{}/status", txid)).await?;
        match status.height() {
            Some(height) => Ok(self.get_block_height().await?.saturating_sub(height) + 1),
            None => Ok(0),
        }
    }

    async fn get_block_height(&self) -> Result<u32, ChainError> {
        let text = self.get_text("/blocks/tip/height").await?;
        text.trim().parse().map_err(|_| ChainError::InvalidResponse(format!("tip height {}", text)))
    }

    async fn get_script_hash_history(
        &self,
        script_hash: &ScriptHash,
    ) -> Result<Vec<HistoryEntry>, ChainError> {
        let history: Vec<HistoryResponse> =
            self.get_json(&format!("/scripthash/{}/txs", script_hash)).await?;
        Ok(history
            .into_iter()
            .map(|h| HistoryEntry { txid: h.txid, height: h.status.height() })
            .collect())
    }

    async fn get_transaction(&self, txid: &Txid) -> Result<Transaction, ChainError> {
        let text = self.get_text(&format!("/tx/{}/hex", txid)).await?;
        let bytes =
            hex::decode(text.trim()).map_err(|e| ChainError::InvalidResponse(e.to_string()))?;
        deserialize(&bytes).map_err(|e| ChainError::InvalidResponse(e.to_string()))
    }

    async fn get_unspent_outputs(
        &self,
        script_hash: &ScriptHash,
    ) -> Result<Vec<UnspentOutput>, ChainError> {
        let utxos: Vec<UtxoResponse> =
            self.get_json(&format!("/scripthash/{}/utxo", script_hash)).await?;
        Ok(utxos
            .into_iter()
            .map(|u| UnspentOutput {
                outpoint: OutPoint { txid: u.txid, vout: u.vout },
                value_sat: u.value,
                height: u.status.height(),
            })
            .collect())
    }

    async fn broadcast_transaction(&self, tx: &Transaction) -> Result<Txid, ChainError> {
        let res = self.client.post(format!("{}/tx", self.base)).body(serialize_hex(tx)).send().await;
        let res = self.checked(res, "/tx").await?;
        let text = res.text().await.map_err(|e| ChainError::InvalidResponse(e.to_string()))?;
        let txid: Txid = text
            .trim()
            .parse()
            .map_err(|_| ChainError::InvalidResponse(format!("broadcast returned {}", text)))?;
        info!("broadcast txid: {}", txid);
        Ok(txid)
    }

    async fn estimate_fee(&self, target_blocks: u16) -> Result<u32, ChainError> {
        let estimates: BTreeMap<String, f64> = self.get_json("/fee-estimates").await?;
        let sat_per_vbyte = pick_estimate(&estimates, target_blocks);
        debug!("fee estimate for {} blocks: {:?} sat/vB", target_blocks, sat_per_vbyte);
        Ok(sat_per_vbyte
            .map(|rate| (rate * 250.0).ceil() as u32)
            .unwrap_or(FEERATE_FLOOR_PER_KW)
            .max(FEERATE_FLOOR_PER_KW))
    }
}

/// The estimate for the largest target not above `target_blocks`, else the smallest target
fn pick_estimate(estimates: &BTreeMap<String, f64>, target_blocks: u16) -> Option<f64> {
    let by_target: BTreeMap<u16, f64> =
        estimates.iter().filter_map(|(k, v)| Some((k.parse().ok()?, *v))).collect();
    by_target
        .range(..=target_blocks)
        .next_back()
        .or_else(|| by_target.iter().next())
        .map(|(_, rate)| *rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn estimate_picks_the_closest_faster_target() {
        let estimates: BTreeMap<String, f64> =
            serde_json::from_str(r#"{"1": 20.5, "6": 10.0, "144": 1.0, "bogus": 3.0}"#).unwrap();
        assert_eq!(pick_estimate(&estimates, 6), Some(10.0));
        assert_eq!(pick_estimate(&estimates, 100), Some(10.0));
        assert_eq!(pick_estimate(&estimates, 1000), Some(1.0));
        assert_eq!(pick_estimate(&BTreeMap::new(), 6), None);
    }

    #[test]
    fn unconfirmed_status_has_no_height() {
        let status: TxStatus = serde_json::from_str(r#"{"confirmed": false}"#).unwrap();
        assert_eq!(status.height(), None);
        let status: TxStatus =
            serde_json::from_str(r#"{"confirmed": true, "block_height": 800000}"#).unwrap();
        assert_eq!(status.height(), Some(800000));
    }

    #[test]
    fn base_url_loses_trailing_slash() {
        let query = EsploraChainQuery::new(&Url::parse("https://blockstream.info/testnet/api/").unwrap());
        assert_eq!(query.base, "https://blockstream.info/testnet/api");
    }
}
