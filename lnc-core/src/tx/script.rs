use bitcoin::{Script, ScriptBuf};
use lightning::ln::chan_utils::{get_htlc_redeemscript, HTLCOutputInCommitment, TxCreationKeys};
use lightning::types::features::ChannelTypeFeatures;
use lightning::types::payment::PaymentHash as LdkPaymentHash;

use crate::htlc::{Htlc, HtlcDirection};

/// Channels are opened with `option_static_remotekey` and without anchors
pub fn channel_type() -> ChannelTypeFeatures {
    ChannelTypeFeatures::only_static_remote_key()
}

/// `htlc` as an output of a commitment, at `vout` if it was not trimmed
pub fn htlc_in_commitment(htlc: &Htlc, vout: Option<u32>) -> HTLCOutputInCommitment {
    HTLCOutputInCommitment {
        offered: htlc.direction == HtlcDirection::Offered,
        amount_msat: htlc.amount_msat,
        cltv_expiry: htlc.cltv_expiry,
        payment_hash: LdkPaymentHash(htlc.payment_hash.0),
        transaction_output_index: vout,
    }
}

/// The redeemscript of an HTLC output on a commitment built with `keys`
pub fn htlc_redeemscript(htlc: &Htlc, keys: &TxCreationKeys) -> ScriptBuf {
    get_htlc_redeemscript(&htlc_in_commitment(htlc, None), &channel_type(), keys)
}

pub fn p2wsh(redeemscript: &Script) -> ScriptBuf {
    ScriptBuf::new_p2wsh(&redeemscript.wscript_hash())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::htlc::PaymentHash;
    use bitcoin::blockdata::opcodes::all::OP_CLTV;
    use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
    use lightning::ln::chan_utils::make_funding_redeemscript;
    use test_log::test;

    fn pubkey(i: u8) -> PublicKey {
        PublicKey::from_secret_key(&Secp256k1::new(), &SecretKey::from_slice(&[i; 32]).unwrap())
    }

    fn keys() -> TxCreationKeys {
        let secp_ctx = Secp256k1::new();
        TxCreationKeys::derive_new(
            &secp_ctx,
            &pubkey(1),
            &pubkey(2).into(),
            &pubkey(3).into(),
            &pubkey(4).into(),
            &pubkey(5).into(),
        )
    }

    fn htlc(direction: HtlcDirection) -> Htlc {
        Htlc {
            direction,
            id: 0,
            amount_msat: 5_000_000,
            payment_hash: PaymentHash([3; 32]),
            cltv_expiry: 100,
            onion_routing_packet: vec![],
        }
    }

    #[test]
    fn funding_script_is_p2wsh() {
        assert!(p2wsh(&make_funding_redeemscript(&pubkey(1), &pubkey(2))).is_p2wsh());
        assert_eq!(
            p2wsh(&make_funding_redeemscript(&pubkey(1), &pubkey(2))),
            make_funding_redeemscript(&pubkey(1), &pubkey(2)).to_p2wsh()
        );
    }

    #[test]
    fn htlc_scripts_differ_by_direction() {
        let keys = keys();
        let offered = htlc_redeemscript(&htlc(HtlcDirection::Offered), &keys);
        let received = htlc_redeemscript(&htlc(HtlcDirection::Received), &keys);
        assert_ne!(offered, received);
        // the timeout branch only exists in the received script
        assert!(received.as_bytes().contains(&OP_CLTV.to_u8()));
        assert!(!offered.as_bytes().contains(&OP_CLTV.to_u8()));
    }

    #[test]
    fn htlc_keeps_its_terms_in_commitment() {
        let out = htlc_in_commitment(&htlc(HtlcDirection::Received), Some(2));
        assert!(!out.offered);
        assert_eq!(out.amount_msat, 5_000_000);
        assert_eq!(out.cltv_expiry, 100);
        assert_eq!(out.payment_hash.0, [3; 32]);
        assert_eq!(out.transaction_output_index, Some(2));
        assert!(!channel_type().supports_anchors_zero_fee_htlc_tx());
    }
}
