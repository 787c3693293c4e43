//! Chain checks for one channel: revoked commitments, force-closes and the HTLC outputs
//! they leave behind.
//!
//! Every check can be re-run at will. Nothing here mutates channel state, the only side
//! effects are broadcasts and the unresolved HTLC record.

use bitcoin::secp256k1::{self, All, Secp256k1};
use bitcoin::{Amount, OutPoint, Sequence, Transaction, Txid};
use lightning::ln::chan_utils::{derive_private_key, get_revokeable_redeemscript};
use log::{debug, info};
use serde_derive::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::chain::{ChainError, ChainQuery, ScriptHash};
use crate::channel::{ChannelId, SerializedChannel};
use crate::commitments::{CommitmentSpec, CommitmentsError, RemoteCommit, RemoteNextCommitInfo};
use crate::context::Account;
use crate::error::classified_error;
use crate::htlc::{HtlcDirection, PaymentHash};
use crate::onion::PaymentRegistry;
use crate::persist::{self, BreachStore, HtlcStore};
use crate::tx::script::p2wsh;
use crate::tx::tx::{
    build_htlc_transaction, build_sweep_tx, decode_commitment_number, htlc_input_witness,
    BuiltCommitment, SweepInput,
};
use crate::util::crypto_utils::sign_p2wsh_input;
use crate::util::ser_util::TransactionHandler;

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("chain: {0}")]
    Chain(#[from] ChainError),
    #[error("store: {0}")]
    Store(#[from] persist::Error),
    #[error("commitments: {0}")]
    Commitments(CommitmentsError),
    #[error("key error: {0}")]
    Crypto(#[from] secp256k1::Error),
}

classified_error!(
    MonitorError,
    wrapped: [Chain, Store, Commitments, Crypto],
    breakdown: [],
    bug: [],
);

/// A signed transaction claiming one HTLC output of a broadcast commitment
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtlcRecovery {
    pub htlc_id: u64,
    /// Relative to us
    pub direction: HtlcDirection,
    pub payment_hash: PaymentHash,
    /// The commitment output being claimed
    pub outpoint: OutPoint,
    /// The transaction is valid in blocks after this height
    pub unlock_height: u32,
    #[serde_as(as = "TransactionHandler")]
    pub tx: Transaction,
}

/// A signed sweep of an output locked by `to_self_delay`
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayedRecovery {
    pub outpoint: OutPoint,
    #[serde_as(as = "TransactionHandler")]
    pub tx: Transaction,
}

/// What is left to claim after a commitment of this channel confirmed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedHtlcs {
    pub channel_id: ChannelId,
    pub commitment_txid: Txid,
    pub htlcs: Vec<HtlcRecovery>,
    pub delayed: Vec<DelayedRecovery>,
}

/// Confirmed transactions spending the funding output
async fn confirmed_funding_spends(
    chain: &dyn ChainQuery,
    channel: &SerializedChannel,
) -> Result<Vec<Transaction>, MonitorError> {
    let funding = channel.commitments.funding.outpoint;
    let script_hash = ScriptHash::from_script(&p2wsh(&channel.commitments.funding_redeemscript()));
    let mut spends = Vec::new();
    for entry in chain.get_script_hash_history(&script_hash).await? {
        if entry.txid == funding.txid || entry.height.is_none() {
            continue;
        }
        let tx = chain.get_transaction(&entry.txid).await?;
        if tx.input.iter().any(|input| input.previous_output == funding) {
            spends.push(tx);
        }
    }
    Ok(spends)
}

/// Broadcast the penalty of every revoked commitment of the peer found on chain.
///
/// Returns the txids of the penalties broadcast by this call. Penalties the chain already
/// knows are not sent again.
pub async fn check_for_channel_fraud(
    chain: &dyn ChainQuery,
    channel: &SerializedChannel,
    breach_store: &dyn BreachStore,
) -> Result<Vec<Txid>, MonitorError> {
    let channel_id = channel.channel_id();
    let spends = confirmed_funding_spends(chain, channel).await?;
    if spends.is_empty() {
        return Ok(vec![]);
    }
    let breach = breach_store.load(&channel_id)?;
    let mut broadcast = Vec::new();
    for tx in spends {
        let txid = tx.compute_txid();
        let Some(number) = decode_commitment_number(&tx, channel.commitments.obscure_factor()) else {
            debug!("{} funding spent by {}, not a commitment", channel_id, txid);
            continue;
        };
        let Some(entry) = breach.penalty_for(number) else {
            continue;
        };
        if entry.commitment_txid != txid {
            debug!("{} {} is not the revoked commitment {}", channel_id, txid, number);
            continue;
        }
        let penalty_txid = entry.penalty_tx.compute_txid();
        match chain.get_confirmations(&penalty_txid).await {
            Ok(confirmations) => {
                debug!("{} penalty {} known, {} confirmations", channel_id, penalty_txid, confirmations);
                continue;
            }
            Err(ChainError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        info!(
            "{} revoked commitment {} broadcast in {}, broadcasting penalty {}",
            channel_id, number, txid, penalty_txid
        );
        broadcast.push(chain.broadcast_transaction(&entry.penalty_tx).await?);
    }
    Ok(broadcast)
}

/// If one of our current commitments or the peer's confirmed, sign what we can claim from
/// it and persist the result.
///
/// Outputs already spent are left out. Revoked commitments are handled by
/// [check_for_channel_fraud]. Once saved, the record is returned as is on later calls.
pub async fn check_for_channel_force_close_and_save_unresolved_htlcs(
    secp_ctx: &Secp256k1<All>,
    chain: &dyn ChainQuery,
    channel: &SerializedChannel,
    account: &Account,
    payments: &dyn PaymentRegistry,
    htlc_store: &dyn HtlcStore,
) -> Result<Option<UnresolvedHtlcs>, MonitorError> {
    let channel_id = channel.channel_id();
    let Some(tx) = confirmed_funding_spends(chain, channel).await?.into_iter().next() else {
        return Ok(None);
    };
    let txid = tx.compute_txid();
    if let Some(known) = htlc_store.load(&channel_id)? {
        if known.commitment_txid == txid {
            return Ok(Some(known));
        }
    }
    let c = &channel.commitments;
    let Some(number) = decode_commitment_number(&tx, c.obscure_factor()) else {
        info!("{} closed by {}", channel_id, txid);
        return Ok(None);
    };

    let local = &c.local_commit;
    let local_built = if number == local.index {
        let built = c
            .build_local_commitment(secp_ctx, &channel.keys, number, &local.spec)
            .map_err(MonitorError::Commitments)?;
        Some(built).filter(|built| built.txid() == txid)
    } else {
        None
    };
    let remote_built = match (&local_built, remote_commitment(channel, number)) {
        (None, Some(remote)) => {
            let built = c
                .build_remote_commitment(secp_ctx, number, &remote.spec, &remote.remote_per_commitment_point)
                .map_err(MonitorError::Commitments)?;
            Some((built, remote)).filter(|(built, _)| built.txid() == txid)
        }
        _ => None,
    };

    let mut unresolved = match (local_built, remote_built) {
        (Some(built), _) => {
            info!("{} our commitment {} confirmed in {}", channel_id, number, txid);
            recover_from_local(secp_ctx, channel, &built, &local.spec, account, payments)?
        }
        (None, Some((built, remote))) => {
            info!("{} peer commitment {} confirmed in {}", channel_id, number, txid);
            recover_from_remote(secp_ctx, channel, &built, &remote.spec, account, payments)?
        }
        (None, None) => {
            debug!("{} {} is not a current commitment, number {}", channel_id, txid, number);
            return Ok(None);
        }
    };

    unresolved.htlcs = retain_unspent(chain, &tx, unresolved.htlcs, |r| r.outpoint).await?;
    unresolved.delayed = retain_unspent(chain, &tx, unresolved.delayed, |d| d.outpoint).await?;
    htlc_store.save(&unresolved)?;
    info!(
        "{} {} htlc and {} delayed recoveries saved",
        channel_id,
        unresolved.htlcs.len(),
        unresolved.delayed.len()
    );
    Ok(Some(unresolved))
}

/// HTLC recoveries valid at `current_height`
pub fn check_for_channel_ready_to_broadcast_htlc_transactions(
    unresolved: &UnresolvedHtlcs,
    current_height: u32,
) -> Vec<Transaction> {
    unresolved
        .htlcs
        .iter()
        .filter(|r| r.unlock_height <= current_height)
        .map(|r| r.tx.clone())
        .collect()
}

/// Delayed sweeps whose parent has `to_self_delay` confirmations. Parents the chain does not
/// know yet are skipped.
pub async fn check_for_ready_to_spend_delayed_htlc_transactions(
    chain: &dyn ChainQuery,
    delayed: &[DelayedRecovery],
    to_self_delay: u16,
) -> Result<Vec<Transaction>, MonitorError> {
    let mut ready = Vec::new();
    for recovery in delayed {
        match chain.get_confirmations(&recovery.outpoint.txid).await {
            Ok(confirmations) if confirmations >= to_self_delay as u32 =>
                ready.push(recovery.tx.clone()),
            Ok(_) | Err(ChainError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(ready)
}

/// The peer's current commitment, or the one we signed and it did not revoke yet
fn remote_commitment(channel: &SerializedChannel, number: u64) -> Option<&RemoteCommit> {
    let c = &channel.commitments;
    if number == c.remote_commit.index {
        return Some(&c.remote_commit);
    }
    match &c.remote_next_commit_info {
        RemoteNextCommitInfo::Waiting(w) if w.next_remote_commit.index == number =>
            Some(&w.next_remote_commit),
        _ => None,
    }
}

async fn retain_unspent<R>(
    chain: &dyn ChainQuery,
    commitment: &Transaction,
    recoveries: Vec<R>,
    outpoint: impl Fn(&R) -> OutPoint,
) -> Result<Vec<R>, MonitorError> {
    let commitment_txid = commitment.compute_txid();
    let mut kept = Vec::new();
    for recovery in recoveries {
        let spent_outpoint = outpoint(&recovery);
        // second-level outputs do not exist yet
        if spent_outpoint.txid != commitment_txid {
            kept.push(recovery);
            continue;
        }
        let Some(output) = commitment.output.get(spent_outpoint.vout as usize) else { continue };
        let unspent =
            chain.get_unspent_outputs(&ScriptHash::from_script(&output.script_pubkey)).await?;
        if unspent.iter().any(|u| u.outpoint == spent_outpoint) {
            kept.push(recovery);
        } else {
            debug!("{} already spent", spent_outpoint);
        }
    }
    Ok(kept)
}

/// Second-level transactions for our HTLCs, and delayed sweeps of everything locked by
/// `to_self_delay`
fn recover_from_local(
    secp_ctx: &Secp256k1<All>,
    channel: &SerializedChannel,
    built: &BuiltCommitment,
    spec: &CommitmentSpec,
    account: &Account,
    payments: &dyn PaymentRegistry,
) -> Result<UnresolvedHtlcs, MonitorError> {
    let c = &channel.commitments;
    let keys = &channel.keys;
    let txid = built.txid();
    let point = built.keys.per_commitment_point;
    let to_self_delay = c.constraints.local_to_self_delay;
    let htlc_key = derive_private_key(secp_ctx, &point, &keys.htlc_base_key);
    let delayed_key = derive_private_key(secp_ctx, &point, &keys.delayed_payment_base_key);
    let delayed_redeemscript = get_revokeable_redeemscript(
        &built.keys.revocation_key,
        to_self_delay,
        &built.keys.broadcaster_delayed_payment_key,
    );
    let delayed_sweep = |outpoint: OutPoint, value_sat: u64| -> Result<_, MonitorError> {
        let input = SweepInput {
            outpoint,
            value_sat,
            redeemscript: delayed_redeemscript.clone(),
            sequence: Sequence::from_height(to_self_delay),
            witness_item: vec![],
            key: delayed_key,
        };
        Ok(build_sweep_tx(secp_ctx, &[input], 0, &account.sweep_destination, spec.feerate_per_kw)?
            .map(|tx| DelayedRecovery { outpoint, tx }))
    };

    let mut htlcs = Vec::new();
    let mut delayed = Vec::new();
    if let Some(to_local) = &built.to_local {
        let outpoint = OutPoint { txid, vout: to_local.vout };
        delayed.extend(delayed_sweep(outpoint, to_local.amount_sat)?);
    }
    for (output, remote_sig) in built.htlc_outputs.iter().zip(&c.local_commit.remote_htlc_sigs) {
        let htlc = &output.htlc;
        let (preimage, unlock_height) = match htlc.direction {
            HtlcDirection::Offered => (None, htlc.cltv_expiry),
            HtlcDirection::Received => match payments.lookup(&htlc.payment_hash) {
                Some(payment) => (Some(payment.preimage), 0),
                None => {
                    debug!("no preimage for received htlc {}, leaving it to time out", htlc.id);
                    continue;
                }
            },
        };
        let mut htlc_tx =
            build_htlc_transaction(&txid, output, spec.feerate_per_kw, to_self_delay, &built.keys);
        let local_sig = sign_p2wsh_input(
            secp_ctx,
            &htlc_tx,
            0,
            &output.redeemscript,
            Amount::from_sat(htlc.amount_sat()),
            &htlc_key,
        )?;
        htlc_tx.input[0].witness =
            htlc_input_witness(&local_sig, remote_sig, preimage.as_ref(), &output.redeemscript);
        let second_level = OutPoint { txid: htlc_tx.compute_txid(), vout: 0 };
        delayed.extend(delayed_sweep(second_level, htlc_tx.output[0].value.to_sat())?);
        htlcs.push(HtlcRecovery {
            htlc_id: htlc.id,
            direction: htlc.direction,
            payment_hash: htlc.payment_hash,
            outpoint: OutPoint { txid, vout: output.vout },
            unlock_height,
            tx: htlc_tx,
        });
    }
    Ok(UnresolvedHtlcs { channel_id: channel.channel_id(), commitment_txid: txid, htlcs, delayed })
}

/// Direct claims of HTLC outputs on the peer's commitment. Our main output pays our
/// payment key and needs no claim.
fn recover_from_remote(
    secp_ctx: &Secp256k1<All>,
    channel: &SerializedChannel,
    built: &BuiltCommitment,
    spec: &CommitmentSpec,
    account: &Account,
    payments: &dyn PaymentRegistry,
) -> Result<UnresolvedHtlcs, MonitorError> {
    let txid = built.txid();
    let htlc_key =
        derive_private_key(secp_ctx, &built.keys.per_commitment_point, &channel.keys.htlc_base_key);
    let mut htlcs = Vec::new();
    for output in &built.htlc_outputs {
        let htlc = &output.htlc;
        // direction in the peer's commitment is relative to the peer
        let direction = htlc.direction.opposite();
        let (witness_item, lock_time) = match direction {
            HtlcDirection::Offered => (vec![], htlc.cltv_expiry),
            HtlcDirection::Received => match payments.lookup(&htlc.payment_hash) {
                Some(payment) => (payment.preimage.0.to_vec(), 0),
                None => continue,
            },
        };
        let outpoint = OutPoint { txid, vout: output.vout };
        let input = SweepInput {
            outpoint,
            value_sat: htlc.amount_sat(),
            redeemscript: output.redeemscript.clone(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness_item,
            key: htlc_key,
        };
        let Some(tx) =
            build_sweep_tx(secp_ctx, &[input], lock_time, &account.sweep_destination, spec.feerate_per_kw)?
        else {
            continue;
        };
        htlcs.push(HtlcRecovery {
            htlc_id: htlc.id,
            direction,
            payment_hash: htlc.payment_hash,
            outpoint,
            unlock_height: lock_time,
            tx,
        });
    }
    Ok(UnresolvedHtlcs {
        channel_id: channel.channel_id(),
        commitment_txid: txid,
        htlcs,
        delayed: vec![],
    })
}
