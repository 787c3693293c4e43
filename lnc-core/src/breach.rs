//! Penalty transactions for revoked counterparty commitments.
//!
//! A penalty is computed once, when the counterparty reveals the secret of a commitment,
//! and must be persisted before any further message goes out.

use std::collections::BTreeMap;

use bitcoin::secp256k1::{self, All, PublicKey, Secp256k1};
use bitcoin::{OutPoint, Script, Sequence, Transaction, Txid};
use lightning::ln::chan_utils::derive_private_revocation_key;
use log::{debug, info};
use serde_derive::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::channel::ChannelId;
use crate::commitments::{Commitments, CommitmentsError, RevokedCommitment};
use crate::error::classified_error;
use crate::keys::ChannelKeys;
use crate::tx::tx::{build_sweep_tx, SweepInput};
use crate::util::ser_util::TransactionHandler;
use crate::watchtower::PenaltyNotice;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BreachError {
    #[error("breach data of channel {0} given for another channel")]
    WrongChannel(ChannelId),
    #[error("revoked commitment {index} rebuilds to {rebuilt}, expected {expected}")]
    CommitmentMismatch { index: u64, expected: Txid, rebuilt: Txid },
    #[error("cannot rebuild the revoked commitment: {0}")]
    Commitments(CommitmentsError),
    #[error("key error: {0}")]
    Crypto(#[from] secp256k1::Error),
}

classified_error!(
    BreachError,
    wrapped: [Commitments, Crypto],
    breakdown: [],
    bug: [WrongChannel, CommitmentMismatch],
);

#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PenaltyEntry {
    pub commitment_txid: Txid,
    #[serde_as(as = "TransactionHandler")]
    pub penalty_tx: Transaction,
}

/// Penalties of one channel, by counterparty commitment number. Entries are never removed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelBreachData {
    pub channel_id: ChannelId,
    pub penalties: BTreeMap<u64, PenaltyEntry>,
}

impl ChannelBreachData {
    pub fn new(channel_id: ChannelId) -> Self {
        ChannelBreachData { channel_id, penalties: BTreeMap::new() }
    }

    pub fn penalty_for(&self, commitment_number: u64) -> Option<&PenaltyEntry> {
        self.penalties.get(&commitment_number)
    }

    pub fn notice(&self, commitment_number: u64) -> Option<PenaltyNotice> {
        self.penalty_for(commitment_number).map(|entry| PenaltyNotice {
            channel_id: self.channel_id,
            commitment_number,
            commitment_txid: entry.commitment_txid,
            penalty_tx: entry.penalty_tx.clone(),
        })
    }

    /// Add the penalty for the commitment revoked by `revoked`.
    ///
    /// Idempotent: an already present commitment number returns the record unchanged.
    /// The penalty pays the revoked commitment's feerate and sends everything to `destination`.
    pub fn insert_revoked_commitment(
        &self,
        secp_ctx: &Secp256k1<All>,
        revoked: &RevokedCommitment,
        commitments: &Commitments,
        keys: &ChannelKeys,
        destination: &Script,
    ) -> Result<ChannelBreachData, BreachError> {
        if commitments.channel_id != self.channel_id {
            return Err(BreachError::WrongChannel(self.channel_id));
        }
        let commit = &revoked.commitment;
        if self.penalties.contains_key(&commit.index) {
            debug!("penalty for commitment {} of {} already known", commit.index, self.channel_id);
            return Ok(self.clone());
        }
        let built = commitments
            .build_remote_commitment(secp_ctx, commit.index, &commit.spec, &commit.remote_per_commitment_point)
            .map_err(BreachError::Commitments)?;
        let txid = built.txid();
        if txid != commit.txid {
            return Err(BreachError::CommitmentMismatch {
                index: commit.index,
                expected: commit.txid,
                rebuilt: txid,
            });
        }
        let revocation_key = derive_private_revocation_key(
            secp_ctx,
            &revoked.per_commitment_secret,
            &keys.revocation_base_key,
        );
        let revocation_pubkey = PublicKey::from_secret_key(secp_ctx, &revocation_key);

        let mut inputs = Vec::new();
        if let Some(to_local) = &built.to_local {
            inputs.push(SweepInput {
                outpoint: OutPoint { txid, vout: to_local.vout },
                value_sat: to_local.amount_sat,
                redeemscript: to_local.redeemscript.clone(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness_item: vec![1],
                key: revocation_key,
            });
        }
        for output in &built.htlc_outputs {
            inputs.push(SweepInput {
                outpoint: OutPoint { txid, vout: output.vout },
                value_sat: output.htlc.amount_sat(),
                redeemscript: output.redeemscript.clone(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness_item: revocation_pubkey.serialize().to_vec(),
                key: revocation_key,
            });
        }
        let penalty_tx =
            match build_sweep_tx(secp_ctx, &inputs, 0, destination, commit.spec.feerate_per_kw)? {
                Some(tx) => tx,
                None => {
                    info!(
                        "nothing to claim from revoked commitment {} of {}",
                        commit.index, self.channel_id
                    );
                    return Ok(self.clone());
                }
            };
        info!(
            "penalty {} for revoked commitment {} ({}) of {}",
            penalty_tx.compute_txid(),
            commit.index,
            txid,
            self.channel_id
        );
        let mut next = self.clone();
        next.penalties.insert(commit.index, PenaltyEntry { commitment_txid: txid, penalty_tx });
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::crypto_utils::verify_p2wsh_input;
    use crate::util::test_utils::{make_commitments_pair, revoke_once, sweep_script, ChannelPairConfig};
    use bitcoin::Amount;
    use test_log::test;

    #[test]
    fn penalty_claims_revoked_to_local() {
        let secp_ctx = Secp256k1::new();
        let (mut a, mut b) = make_commitments_pair(&secp_ctx, &ChannelPairConfig::default());
        let revoked = revoke_once(&secp_ctx, &mut a, &mut b, 1_000_000);
        assert_eq!(revoked.commitment.index, 0);

        let data = ChannelBreachData::new(a.commitments.channel_id);
        let data = data
            .insert_revoked_commitment(&secp_ctx, &revoked, &a.commitments, &a.keys, &sweep_script())
            .unwrap();
        let entry = data.penalty_for(0).unwrap();
        assert_eq!(entry.commitment_txid, revoked.commitment.txid);

        let built = a
            .commitments
            .build_remote_commitment(
                &secp_ctx,
                0,
                &revoked.commitment.spec,
                &revoked.commitment.remote_per_commitment_point,
            )
            .unwrap();
        let to_local = built.to_local.unwrap();
        let tx = &entry.penalty_tx;
        assert_eq!(tx.input.len(), 1);
        assert_eq!(tx.input[0].previous_output, OutPoint { txid: revoked.commitment.txid, vout: to_local.vout });
        assert_eq!(tx.output[0].script_pubkey, sweep_script());
        assert!(tx.output[0].value.to_sat() < to_local.amount_sat);

        let witness: Vec<&[u8]> = tx.input[0].witness.iter().collect();
        assert_eq!(witness[1], &[1u8][..]);
        let revocation_key = derive_private_revocation_key(
            &secp_ctx,
            &revoked.per_commitment_secret,
            &a.keys.revocation_base_key,
        );
        assert_eq!(
            PublicKey::from_secret_key(&secp_ctx, &revocation_key),
            built.keys.revocation_key.to_public_key()
        );
        let sig = crate::util::crypto_utils::bitcoin_vec_to_signature(
            witness[0],
            bitcoin::sighash::EcdsaSighashType::All,
        )
        .unwrap();
        assert!(verify_p2wsh_input(
            &secp_ctx,
            tx,
            0,
            &to_local.redeemscript,
            Amount::from_sat(to_local.amount_sat),
            &sig,
            &PublicKey::from_secret_key(&secp_ctx, &revocation_key),
        ));
    }

    #[test]
    fn insert_is_idempotent() {
        let secp_ctx = Secp256k1::new();
        let (mut a, mut b) = make_commitments_pair(&secp_ctx, &ChannelPairConfig::default());
        let revoked = revoke_once(&secp_ctx, &mut a, &mut b, 1_000_000);
        let empty = ChannelBreachData::new(a.commitments.channel_id);
        let once = empty
            .insert_revoked_commitment(&secp_ctx, &revoked, &a.commitments, &a.keys, &sweep_script())
            .unwrap();
        let twice = once
            .insert_revoked_commitment(&secp_ctx, &revoked, &a.commitments, &a.keys, &sweep_script())
            .unwrap();
        assert_eq!(once, twice);
        assert_eq!(twice.penalties.len(), 1);

        let json = serde_json::to_string(&twice).unwrap();
        let back: ChannelBreachData = serde_json::from_str(&json).unwrap();
        assert_eq!(back, twice);
    }

    #[test]
    fn wrong_channel_is_refused() {
        let secp_ctx = Secp256k1::new();
        let (mut a, mut b) = make_commitments_pair(&secp_ctx, &ChannelPairConfig::default());
        let revoked = revoke_once(&secp_ctx, &mut a, &mut b, 1_000_000);
        let other = ChannelBreachData::new(ChannelId([9; 32]));
        assert_eq!(
            other
                .insert_revoked_commitment(&secp_ctx, &revoked, &a.commitments, &a.keys, &sweep_script())
                .unwrap_err(),
            BreachError::WrongChannel(ChannelId([9; 32]))
        );
    }
}
