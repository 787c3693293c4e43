use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::PublicKey;
use bitcoin::{OutPoint, Transaction, Txid};
use lnc_protocol::msgs::{OnionPacket, ONION_PACKET_LEN};

use crate::chain::{ChainError, ChainQuery, HistoryEntry, ScriptHash, UnspentOutput};
use crate::htlc::{PaymentHash, PaymentPreimage};
use crate::onion::{
    FinalPayload, IncomingPayment, OnionError, OnionProcessor, PaymentRegistry, PeeledOnion,
    INVALID_ONION_VERSION,
};
use crate::watchtower::{PenaltyNotice, WatchTower, WatchTowerError};

#[derive(Default)]
struct ChainState {
    height: u32,
    txs: BTreeMap<Txid, (Transaction, Option<u32>)>,
    broadcasts: Vec<Transaction>,
}

/// A chain backend over a fixed set of transactions
#[derive(Default)]
pub struct FakeChain {
    state: Mutex<ChainState>,
}

impl FakeChain {
    pub fn new(height: u32) -> Self {
        FakeChain { state: Mutex::new(ChainState { height, ..Default::default() }) }
    }

    /// `height` None puts the transaction in the mempool
    pub fn add_transaction(&self, tx: Transaction, height: Option<u32>) {
        self.state.lock().unwrap().txs.insert(tx.compute_txid(), (tx, height));
    }

    pub fn set_height(&self, height: u32) {
        self.state.lock().unwrap().height = height;
    }

    pub fn broadcasts(&self) -> Vec<Transaction> {
        self.state.lock().unwrap().broadcasts.clone()
    }
}

impl ChainState {
    fn output_matches(&self, outpoint: &OutPoint, script_hash: &ScriptHash) -> bool {
        self.txs
            .get(&outpoint.txid)
            .and_then(|(tx, _)| tx.output.get(outpoint.vout as usize))
            .map_or(false, |out| ScriptHash::from_script(&out.script_pubkey) == *script_hash)
    }

    fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.txs.values().any(|(tx, _)| tx.input.iter().any(|i| i.previous_output == *outpoint))
    }
}

#[async_trait]
impl ChainQuery for FakeChain {
    async fn get_confirmations(&self, txid: &Txid) -> Result<u32, ChainError> {
        let state = self.state.lock().unwrap();
        match state.txs.get(txid) {
            Some((_, Some(height))) => Ok(state.height.saturating_sub(*height) + 1),
            Some((_, None)) => Ok(0),
            None => Err(ChainError::NotFound(txid.to_string())),
        }
    }

    async fn get_block_height(&self) -> Result<u32, ChainError> {
        Ok(self.state.lock().unwrap().height)
    }

    async fn get_script_hash_history(
        &self,
        script_hash: &ScriptHash,
    ) -> Result<Vec<HistoryEntry>, ChainError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .txs
            .iter()
            .filter(|(txid, (tx, _))| {
                (0..tx.output.len() as u32)
                    .any(|vout| state.output_matches(&OutPoint { txid: **txid, vout }, script_hash))
                    || tx.input.iter().any(|i| state.output_matches(&i.previous_output, script_hash))
            })
            .map(|(txid, (_, height))| HistoryEntry { txid: *txid, height: *height })
            .collect())
    }

    async fn get_transaction(&self, txid: &Txid) -> Result<Transaction, ChainError> {
        let state = self.state.lock().unwrap();
        state.txs.get(txid).map(|(tx, _)| tx.clone()).ok_or(ChainError::NotFound(txid.to_string()))
    }

    async fn get_unspent_outputs(
        &self,
        script_hash: &ScriptHash,
    ) -> Result<Vec<UnspentOutput>, ChainError> {
        let state = self.state.lock().unwrap();
        let mut unspent = vec![];
        for (txid, (tx, height)) in &state.txs {
            for (vout, out) in tx.output.iter().enumerate() {
                let outpoint = OutPoint { txid: *txid, vout: vout as u32 };
                if ScriptHash::from_script(&out.script_pubkey) == *script_hash
                    && !state.is_spent(&outpoint)
                {
                    unspent.push(UnspentOutput {
                        outpoint,
                        value_sat: out.value.to_sat(),
                        height: *height,
                    });
                }
            }
        }
        Ok(unspent)
    }

    async fn broadcast_transaction(&self, tx: &Transaction) -> Result<Txid, ChainError> {
        let mut state = self.state.lock().unwrap();
        let txid = tx.compute_txid();
        state.broadcasts.push(tx.clone());
        state.txs.entry(txid).or_insert((tx.clone(), None));
        Ok(txid)
    }

    async fn estimate_fee(&self, _target_blocks: u16) -> Result<u32, ChainError> {
        Ok(253)
    }
}

const AMOUNT_OFFSET: usize = 34;
const CLTV_OFFSET: usize = AMOUNT_OFFSET + 9;
const SECRET_OFFSET: usize = CLTV_OFFSET + 5;

/// Carries the final payload in the clear: a version byte, the destination, then each
/// optional field behind a presence flag
#[derive(Default)]
pub struct FakeOnion {
    /// Every packet fails to decrypt
    pub malformed: bool,
}

impl OnionProcessor for FakeOnion {
    fn peel(
        &self,
        packet: &OnionPacket,
        _payment_hash: &PaymentHash,
    ) -> Result<PeeledOnion, OnionError> {
        let bytes = packet.as_slice();
        if self.malformed {
            return Err(OnionError::Malformed {
                failure_code: INVALID_ONION_VERSION,
                sha256_of_onion: sha256::Hash::hash(bytes).to_byte_array(),
            });
        }
        let field = |offset: usize, len: usize| {
            (bytes[offset] == 1).then(|| &bytes[offset + 1..offset + 1 + len])
        };
        Ok(PeeledOnion::Final(FinalPayload {
            amount_msat: field(AMOUNT_OFFSET, 8)
                .map(|b| u64::from_be_bytes(b.try_into().unwrap())),
            cltv_expiry: field(CLTV_OFFSET, 4).map(|b| u32::from_be_bytes(b.try_into().unwrap())),
            payment_secret: field(SECRET_OFFSET, 32).map(|b| b.try_into().unwrap()),
        }))
    }

    fn build_single_hop(
        &self,
        destination: &PublicKey,
        payload: &FinalPayload,
        _payment_hash: &PaymentHash,
    ) -> Result<OnionPacket, OnionError> {
        let mut bytes = [0u8; ONION_PACKET_LEN];
        bytes[1..AMOUNT_OFFSET].copy_from_slice(&destination.serialize());
        let mut put = |offset: usize, value: Option<&[u8]>| {
            if let Some(value) = value {
                bytes[offset] = 1;
                bytes[offset + 1..offset + 1 + value.len()].copy_from_slice(value);
            }
        };
        put(AMOUNT_OFFSET, payload.amount_msat.map(u64::to_be_bytes).as_ref().map(|b| &b[..]));
        put(CLTV_OFFSET, payload.cltv_expiry.map(u32::to_be_bytes).as_ref().map(|b| &b[..]));
        put(SECRET_OFFSET, payload.payment_secret.as_ref().map(|b| &b[..]));
        Ok(OnionPacket(Box::new(bytes)))
    }

    fn encrypt_failure(&self, _packet: &OnionPacket, failure_code: u16) -> Vec<u8> {
        failure_code.to_be_bytes().to_vec()
    }
}

/// Invoices registered by the test, and what got settled
#[derive(Default)]
pub struct FakePaymentRegistry {
    expected: Mutex<BTreeMap<PaymentHash, IncomingPayment>>,
    settled: Mutex<Vec<u64>>,
}

impl FakePaymentRegistry {
    pub fn expect(&self, preimage: PaymentPreimage, amount_msat: Option<u64>) {
        self.expected
            .lock()
            .unwrap()
            .insert(preimage.payment_hash(), IncomingPayment { preimage, amount_msat });
    }

    pub fn settled_amounts(&self) -> Vec<u64> {
        self.settled.lock().unwrap().clone()
    }
}

impl PaymentRegistry for FakePaymentRegistry {
    fn lookup(&self, payment_hash: &PaymentHash) -> Option<IncomingPayment> {
        self.expected.lock().unwrap().get(payment_hash).cloned()
    }

    fn settled(&self, _payment_hash: &PaymentHash, amount_msat: u64) {
        self.settled.lock().unwrap().push(amount_msat);
    }
}

#[derive(Default)]
pub struct FakeWatchTower {
    notices: Mutex<Vec<PenaltyNotice>>,
}

impl FakeWatchTower {
    pub fn notices(&self) -> Vec<PenaltyNotice> {
        self.notices.lock().unwrap().clone()
    }
}

#[async_trait]
impl WatchTower for FakeWatchTower {
    async fn notify(&self, notice: &PenaltyNotice) -> Result<(), WatchTowerError> {
        self.notices.lock().unwrap().push(notice.clone());
        Ok(())
    }
}
