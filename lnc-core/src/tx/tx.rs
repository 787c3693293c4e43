use core::cmp::Ordering;

use bitcoin::absolute::LockTime;
use bitcoin::secp256k1::{self, ecdsa::Signature, All, PublicKey, Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use lightning::ln::chan_utils::{
    self, get_counterparty_payment_script, get_revokeable_redeemscript, TxCreationKeys,
};
use lightning::types::payment::PaymentPreimage as LdkPaymentPreimage;

use crate::commitments::CommitmentSpec;
use crate::htlc::{Htlc, PaymentPreimage};
use crate::keys::ChannelPublicKeys;
use crate::tx::script::{channel_type, htlc_in_commitment, htlc_redeemscript, p2wsh};
use crate::util::crypto_utils::{sign_p2wsh_input, signature_to_bitcoin_vec};

/// Commitment weight without HTLC outputs, for channels without anchors
pub const COMMITMENT_TX_BASE_WEIGHT: u64 = 724;

/// Weight added per HTLC output (mirrors `lightning::ln::chan_utils`, which keeps it private)
const COMMITMENT_TX_WEIGHT_PER_HTLC: u64 = 172;

/// Largest DER signature plus the sighash byte
const MAX_SIGNATURE_LEN: usize = 73;

/// Fee paid by the funder of a commitment with `num_untrimmed_htlcs` HTLC outputs
pub fn commit_tx_fee_sat(feerate_per_kw: u32, num_untrimmed_htlcs: usize) -> u64 {
    (COMMITMENT_TX_BASE_WEIGHT + COMMITMENT_TX_WEIGHT_PER_HTLC * num_untrimmed_htlcs as u64)
        * feerate_per_kw as u64
        / 1000
}

/// The lower 48 bits of `SHA256(funder_payment_point || fundee_payment_point)`
pub fn obscure_factor(funder_payment_point: &PublicKey, fundee_payment_point: &PublicKey) -> u64 {
    chan_utils::get_commitment_transaction_number_obscure_factor(
        funder_payment_point,
        fundee_payment_point,
        true,
    )
}

fn encode_commitment_number(commitment_number: u64, obscure_factor: u64) -> (LockTime, Sequence) {
    let obscured = (commitment_number ^ obscure_factor) & 0xffff_ffff_ffff;
    let lock_time = LockTime::from_consensus((0x20 << 24) | (obscured & 0xff_ffff) as u32);
    let sequence = Sequence((0x80 << 24) | (obscured >> 24) as u32);
    (lock_time, sequence)
}

/// Recover the commitment number of a transaction spending the funding output, if it
/// carries the commitment encoding
pub fn decode_commitment_number(tx: &Transaction, obscure_factor: u64) -> Option<u64> {
    if tx.input.len() != 1 {
        return None;
    }
    let lock_time = tx.lock_time.to_consensus_u32();
    let sequence = tx.input[0].sequence.0;
    if lock_time >> 24 != 0x20 || sequence >> 24 != 0x80 {
        return None;
    }
    let obscured = ((sequence as u64 & 0xff_ffff) << 24) | (lock_time as u64 & 0xff_ffff);
    Some(obscured ^ obscure_factor)
}

/// Keys for one commitment, derived from the broadcaster's per-commitment point
pub fn commitment_keys(
    secp_ctx: &Secp256k1<All>,
    per_commitment_point: &PublicKey,
    broadcaster: &ChannelPublicKeys,
    countersignatory: &ChannelPublicKeys,
) -> TxCreationKeys {
    TxCreationKeys::derive_new(
        secp_ctx,
        per_commitment_point,
        &broadcaster.delayed_payment_basepoint.into(),
        &broadcaster.htlc_basepoint.into(),
        &countersignatory.revocation_basepoint.into(),
        &countersignatory.htlc_basepoint.into(),
    )
}

/// Channel parameters of a commitment, from the broadcaster's point of view
#[derive(Clone, Debug)]
pub struct CommitmentTxParams<'a> {
    pub funding_outpoint: OutPoint,
    pub obscure_factor: u64,
    pub keys: &'a TxCreationKeys,
    pub countersignatory_payment_point: PublicKey,
    /// Delay on the broadcaster's own output
    pub to_self_delay: u16,
    /// The broadcaster's dust limit
    pub dust_limit_sat: u64,
    pub broadcaster_is_funder: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HtlcOutput {
    pub vout: u32,
    pub htlc: Htlc,
    pub redeemscript: ScriptBuf,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToLocalOutput {
    pub vout: u32,
    pub amount_sat: u64,
    pub redeemscript: ScriptBuf,
}

/// An unsigned commitment transaction and where its outputs landed
#[derive(Clone, Debug)]
pub struct BuiltCommitment {
    pub tx: Transaction,
    pub to_local: Option<ToLocalOutput>,
    pub htlc_outputs: Vec<HtlcOutput>,
    pub keys: TxCreationKeys,
}

impl BuiltCommitment {
    pub fn txid(&self) -> Txid {
        self.tx.compute_txid()
    }
}

enum OutputKind {
    ToLocal(ScriptBuf),
    ToRemote,
    Htlc(Htlc, ScriptBuf),
}

impl OutputKind {
    fn cltv_expiry(&self) -> u32 {
        match self {
            OutputKind::Htlc(htlc, _) => htlc.cltv_expiry,
            _ => 0,
        }
    }
}

/// Build the commitment transaction of `spec`, as held by its owner.
///
/// Outputs below the dust limit are trimmed, the commitment fee is taken from the
/// funder and outputs are ordered per BIP69 with the CLTV expiry as a final tie-breaker.
pub fn build_commitment_tx(
    params: &CommitmentTxParams,
    commitment_number: u64,
    spec: &CommitmentSpec,
) -> BuiltCommitment {
    let keys = params.keys;
    let untrimmed: Vec<&Htlc> = spec
        .htlcs
        .iter()
        .filter(|h| !h.is_dust(spec.feerate_per_kw, params.dust_limit_sat))
        .collect();
    let fee = commit_tx_fee_sat(spec.feerate_per_kw, untrimmed.len());
    let mut to_local_sat = spec.to_local_msat / 1000;
    let mut to_remote_sat = spec.to_remote_msat / 1000;
    if params.broadcaster_is_funder {
        to_local_sat = to_local_sat.saturating_sub(fee);
    } else {
        to_remote_sat = to_remote_sat.saturating_sub(fee);
    }

    let mut outputs: Vec<(TxOut, OutputKind)> = Vec::new();
    if to_local_sat >= params.dust_limit_sat && to_local_sat > 0 {
        let redeemscript = get_revokeable_redeemscript(
            &keys.revocation_key,
            params.to_self_delay,
            &keys.broadcaster_delayed_payment_key,
        );
        outputs.push((
            TxOut { value: Amount::from_sat(to_local_sat), script_pubkey: p2wsh(&redeemscript) },
            OutputKind::ToLocal(redeemscript),
        ));
    }
    if to_remote_sat >= params.dust_limit_sat && to_remote_sat > 0 {
        outputs.push((
            TxOut {
                value: Amount::from_sat(to_remote_sat),
                script_pubkey: get_counterparty_payment_script(
                    &channel_type(),
                    &params.countersignatory_payment_point,
                ),
            },
            OutputKind::ToRemote,
        ));
    }
    for htlc in untrimmed {
        let redeemscript = htlc_redeemscript(htlc, keys);
        outputs.push((
            TxOut { value: Amount::from_sat(htlc.amount_sat()), script_pubkey: p2wsh(&redeemscript) },
            OutputKind::Htlc(htlc.clone(), redeemscript),
        ));
    }
    outputs.sort_by(|(a, ka), (b, kb)| -> Ordering {
        a.value
            .cmp(&b.value)
            .then_with(|| a.script_pubkey.cmp(&b.script_pubkey))
            .then_with(|| ka.cltv_expiry().cmp(&kb.cltv_expiry()))
    });

    let (lock_time, sequence) = encode_commitment_number(commitment_number, params.obscure_factor);
    let mut to_local = None;
    let mut htlc_outputs = Vec::new();
    let mut txouts = Vec::with_capacity(outputs.len());
    for (vout, (txout, kind)) in outputs.into_iter().enumerate() {
        let vout = vout as u32;
        match kind {
            OutputKind::ToLocal(redeemscript) =>
                to_local =
                    Some(ToLocalOutput { vout, amount_sat: txout.value.to_sat(), redeemscript }),
            OutputKind::ToRemote => {}
            OutputKind::Htlc(htlc, redeemscript) =>
                htlc_outputs.push(HtlcOutput { vout, htlc, redeemscript }),
        }
        txouts.push(txout);
    }
    let tx = Transaction {
        version: Version::TWO,
        lock_time,
        input: vec![TxIn {
            previous_output: params.funding_outpoint,
            script_sig: ScriptBuf::new(),
            sequence,
            witness: Witness::new(),
        }],
        output: txouts,
    };
    BuiltCommitment { tx, to_local, htlc_outputs, keys: keys.clone() }
}

/// Witness spending the 2-of-2 funding output, signatures in funding script key order
pub fn funding_witness(
    local_sig: &Signature,
    local_funding_pubkey: &PublicKey,
    remote_sig: &Signature,
    remote_funding_pubkey: &PublicKey,
    funding_redeemscript: &Script,
) -> Witness {
    let mut witness = Witness::new();
    witness.push(Vec::new());
    if local_funding_pubkey.serialize() < remote_funding_pubkey.serialize() {
        witness.push(signature_to_bitcoin_vec(*local_sig));
        witness.push(signature_to_bitcoin_vec(*remote_sig));
    } else {
        witness.push(signature_to_bitcoin_vec(*remote_sig));
        witness.push(signature_to_bitcoin_vec(*local_sig));
    }
    witness.push(funding_redeemscript.as_bytes());
    witness
}

/// Second-level HTLC-timeout (offered) or HTLC-success (received) transaction spending
/// `htlc_output` of the commitment `commitment_txid`
pub fn build_htlc_transaction(
    commitment_txid: &Txid,
    htlc_output: &HtlcOutput,
    feerate_per_kw: u32,
    to_self_delay: u16,
    keys: &TxCreationKeys,
) -> Transaction {
    chan_utils::build_htlc_transaction(
        commitment_txid,
        feerate_per_kw,
        to_self_delay,
        &htlc_in_commitment(&htlc_output.htlc, Some(htlc_output.vout)),
        &channel_type(),
        &keys.broadcaster_delayed_payment_key,
        &keys.revocation_key,
    )
}

/// Witness of a second-level HTLC transaction on the broadcaster's commitment
pub fn htlc_input_witness(
    local_sig: &Signature,
    remote_sig: &Signature,
    preimage: Option<&PaymentPreimage>,
    redeemscript: &Script,
) -> Witness {
    let preimage = preimage.map(|p| LdkPaymentPreimage(p.0));
    chan_utils::build_htlc_input_witness(
        local_sig,
        remote_sig,
        &preimage,
        redeemscript,
        &channel_type(),
    )
}

/// A P2WSH output spendable with a single signature
#[derive(Clone, Debug)]
pub struct SweepInput {
    pub outpoint: OutPoint,
    pub value_sat: u64,
    pub redeemscript: ScriptBuf,
    pub sequence: Sequence,
    /// The witness element between the signature and the script
    pub witness_item: Vec<u8>,
    pub key: SecretKey,
}

impl SweepInput {
    fn witness(&self, sig: Option<&Signature>) -> Witness {
        let mut witness = Witness::new();
        match sig {
            Some(sig) => witness.push(signature_to_bitcoin_vec(*sig)),
            None => witness.push([0u8; MAX_SIGNATURE_LEN]),
        }
        witness.push(&self.witness_item);
        witness.push(self.redeemscript.as_bytes());
        witness
    }
}

/// Spend `inputs` to `destination`, paying `feerate_per_kw`.
///
/// Returns `None` if the inputs are not worth the fee.
pub fn build_sweep_tx(
    secp_ctx: &Secp256k1<All>,
    inputs: &[SweepInput],
    lock_time: u32,
    destination: &Script,
    feerate_per_kw: u32,
) -> Result<Option<Transaction>, secp256k1::Error> {
    if inputs.is_empty() {
        return Ok(None);
    }
    let total: u64 = inputs.iter().map(|i| i.value_sat).sum();
    let mut tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::from_consensus(lock_time),
        input: inputs
            .iter()
            .map(|i| TxIn {
                previous_output: i.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: i.sequence,
                witness: i.witness(None),
            })
            .collect(),
        output: vec![TxOut { value: Amount::ZERO, script_pubkey: destination.to_owned() }],
    };
    let fee = tx.weight().to_wu() * feerate_per_kw as u64 / 1000;
    if total <= fee {
        return Ok(None);
    }
    tx.output[0].value = Amount::from_sat(total - fee);
    for (idx, input) in inputs.iter().enumerate() {
        let sig = sign_p2wsh_input(
            secp_ctx,
            &tx,
            idx,
            &input.redeemscript,
            Amount::from_sat(input.value_sat),
            &input.key,
        )?;
        tx.input[idx].witness = input.witness(Some(&sig));
    }
    Ok(Some(tx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::htlc::{HtlcDirection, PaymentHash};
    use crate::keys::ChannelKeys;
    use crate::util::crypto_utils::verify_p2wsh_input;
    use bitcoin::hashes::Hash;
    use lightning::ln::chan_utils::{derive_private_key, get_htlc_redeemscript, HTLCOutputInCommitment};
    use lightning::types::payment::PaymentHash as LdkPaymentHash;
    use test_log::test;

    fn spec(htlcs: Vec<Htlc>, feerate_per_kw: u32) -> CommitmentSpec {
        CommitmentSpec { htlcs, feerate_per_kw, to_local_msat: 7_000_000_000, to_remote_msat: 3_000_000_000 }
    }

    fn htlc(id: u64, direction: HtlcDirection, amount_msat: u64, cltv_expiry: u32) -> Htlc {
        Htlc {
            direction,
            id,
            amount_msat,
            payment_hash: PaymentHash([id as u8; 32]),
            cltv_expiry,
            onion_routing_packet: vec![],
        }
    }

    struct Fixture {
        secp_ctx: Secp256k1<All>,
        local: ChannelKeys,
        remote: ChannelKeys,
        keys: TxCreationKeys,
    }

    fn fixture() -> Fixture {
        let secp_ctx = Secp256k1::new();
        let local = ChannelKeys::derive(&[1; 32], 0).unwrap();
        let remote = ChannelKeys::derive(&[2; 32], 0).unwrap();
        let point = local.per_commitment_point(&secp_ctx, 3).unwrap();
        let keys =
            commitment_keys(&secp_ctx, &point, &local.pubkeys(&secp_ctx), &remote.pubkeys(&secp_ctx));
        Fixture { secp_ctx, local, remote, keys }
    }

    fn build(f: &Fixture, spec: &CommitmentSpec, number: u64) -> BuiltCommitment {
        let remote_payment = f.remote.pubkeys(&f.secp_ctx).payment_point;
        let params = CommitmentTxParams {
            funding_outpoint: OutPoint { txid: Txid::all_zeros(), vout: 0 },
            obscure_factor: 0x2bb0_3852_1914,
            keys: &f.keys,
            countersignatory_payment_point: remote_payment,
            to_self_delay: 144,
            dust_limit_sat: 546,
            broadcaster_is_funder: true,
        };
        build_commitment_tx(&params, number, spec)
    }

    #[test]
    fn commitment_number_round_trips_through_locktime_and_sequence() {
        let f = fixture();
        let built = build(&f, &spec(vec![], 253), 42);
        assert_eq!(built.tx.lock_time.to_consensus_u32() >> 24, 0x20);
        assert_eq!(built.tx.input[0].sequence.0 >> 24, 0x80);
        assert_eq!(decode_commitment_number(&built.tx, 0x2bb0_3852_1914), Some(42));
        assert_ne!(decode_commitment_number(&built.tx, 0), Some(42));
    }

    #[test]
    fn funder_pays_fee_and_dust_is_trimmed() {
        let f = fixture();
        let htlcs = vec![
            htlc(0, HtlcDirection::Offered, 5_000_000, 500),
            htlc(1, HtlcDirection::Received, 700_000, 500),
        ];
        let built = build(&f, &spec(htlcs, 253), 1);
        // the received HTLC is below 546 + 703 * 0.253
        assert_eq!(built.htlc_outputs.len(), 1);
        assert_eq!(built.htlc_outputs[0].htlc.id, 0);
        let fee = commit_tx_fee_sat(253, 1);
        let to_local = built.to_local.as_ref().unwrap();
        assert_eq!(to_local.amount_sat, 7_000_000 - fee);
        assert_eq!(built.tx.output.len(), 3);
        // BIP69 value order
        let values: Vec<u64> = built.tx.output.iter().map(|o| o.value.to_sat()).collect();
        let mut sorted = values.clone();
        sorted.sort();
        assert_eq!(values, sorted);
    }

    #[test]
    fn identical_htlcs_are_ordered_by_cltv() {
        let f = fixture();
        let mut a = htlc(0, HtlcDirection::Offered, 5_000_000, 600);
        let mut b = htlc(1, HtlcDirection::Offered, 5_000_000, 500);
        a.payment_hash = PaymentHash([9; 32]);
        b.payment_hash = PaymentHash([9; 32]);
        let built = build(&f, &spec(vec![a, b], 0), 1);
        // offered scripts do not commit to the expiry, so only the tie-breaker separates them
        assert_eq!(built.htlc_outputs[0].htlc.cltv_expiry, 500);
        assert_eq!(built.htlc_outputs[1].htlc.cltv_expiry, 600);
        let ldk_htlc = HTLCOutputInCommitment {
            offered: true,
            amount_msat: 5_000_000,
            cltv_expiry: 700,
            payment_hash: LdkPaymentHash([9; 32]),
            transaction_output_index: None,
        };
        assert_eq!(
            built.htlc_outputs[0].redeemscript,
            get_htlc_redeemscript(&ldk_htlc, &channel_type(), &f.keys)
        );
    }

    #[test]
    fn htlc_transaction_pays_second_level_fee() {
        let f = fixture();
        let built = build(&f, &spec(vec![htlc(0, HtlcDirection::Offered, 5_000_000, 500)], 1000), 1);
        let tx = build_htlc_transaction(&built.txid(), &built.htlc_outputs[0], 1000, 144, &f.keys);
        assert_eq!(tx.lock_time.to_consensus_u32(), 500);
        assert_eq!(tx.output[0].value.to_sat(), 5_000 - 663);

        // signed by the countersignatory's derived HTLC key
        let remote_htlc_key =
            derive_private_key(&f.secp_ctx, &f.keys.per_commitment_point, &f.remote.htlc_base_key);
        let output = &built.htlc_outputs[0];
        let sig = sign_p2wsh_input(
            &f.secp_ctx,
            &tx,
            0,
            &output.redeemscript,
            Amount::from_sat(5_000),
            &remote_htlc_key,
        )
        .unwrap();
        assert!(verify_p2wsh_input(
            &f.secp_ctx,
            &tx,
            0,
            &output.redeemscript,
            Amount::from_sat(5_000),
            &sig,
            &f.keys.countersignatory_htlc_key.to_public_key()
        ));
        let _ = &f.local;
    }

    #[test]
    fn sweep_skips_inputs_not_worth_the_fee() {
        let f = fixture();
        let input = SweepInput {
            outpoint: OutPoint { txid: Txid::all_zeros(), vout: 1 },
            value_sat: 100,
            redeemscript: get_revokeable_redeemscript(
                &f.keys.revocation_key,
                144,
                &f.keys.broadcaster_delayed_payment_key,
            ),
            sequence: Sequence(144),
            witness_item: vec![],
            key: f.local.delayed_payment_base_key,
        };
        let destination =
            get_counterparty_payment_script(&channel_type(), &f.keys.revocation_key.to_public_key());
        assert!(build_sweep_tx(&f.secp_ctx, &[input.clone()], 0, &destination, 5000)
            .unwrap()
            .is_none());
        let rich = SweepInput { value_sat: 100_000, ..input };
        let tx = build_sweep_tx(&f.secp_ctx, &[rich], 0, &destination, 253).unwrap().unwrap();
        assert!(tx.output[0].value.to_sat() < 100_000);
        assert_eq!(tx.input[0].witness.len(), 3);
    }

    #[test]
    fn commitment_keys_follow_the_basepoints() {
        let f = fixture();
        let local = f.local.pubkeys(&f.secp_ctx);
        let remote = f.remote.pubkeys(&f.secp_ctx);
        let point = f.keys.per_commitment_point;
        // the broadcaster can sign with its derived keys
        let htlc_key = derive_private_key(&f.secp_ctx, &point, &f.local.htlc_base_key);
        assert_eq!(
            PublicKey::from_secret_key(&f.secp_ctx, &htlc_key),
            f.keys.broadcaster_htlc_key.to_public_key()
        );
        let delayed_key = derive_private_key(&f.secp_ctx, &point, &f.local.delayed_payment_base_key);
        assert_eq!(
            PublicKey::from_secret_key(&f.secp_ctx, &delayed_key),
            f.keys.broadcaster_delayed_payment_key.to_public_key()
        );
        // the same point seen from the other side swaps the roles
        let theirs = commitment_keys(&f.secp_ctx, &point, &remote, &local);
        assert_eq!(theirs.broadcaster_htlc_key, f.keys.countersignatory_htlc_key);
        assert_ne!(theirs.revocation_key, f.keys.revocation_key);
    }

    #[test]
    fn obscure_factor_depends_on_funder() {
        let f = fixture();
        let local = f.local.pubkeys(&f.secp_ctx).payment_point;
        let remote = f.remote.pubkeys(&f.secp_ctx).payment_point;
        let factor = obscure_factor(&local, &remote);
        assert!(factor < 1 << 48);
        assert_ne!(factor, obscure_factor(&remote, &local));
        assert_eq!(
            factor,
            chan_utils::get_commitment_transaction_number_obscure_factor(&remote, &local, false)
        );
    }
}
