//! Onion and invoice services consumed by the channel.
//!
//! Packet construction and decryption are external, the channel only needs the final hop
//! payload of what it receives and a single-hop packet for what it sends.

use bitcoin::secp256k1::PublicKey;
use lnc_protocol::msgs::OnionPacket;

use crate::commitments::BADONION;
use crate::htlc::{PaymentHash, PaymentPreimage};

/// BOLT #4 failure code flag
pub const PERM: u16 = 0x4000;

/// `incorrect_or_unknown_payment_details`, also used for a wrong amount
pub const INCORRECT_OR_UNKNOWN_PAYMENT_DETAILS: u16 = PERM | 15;
/// `invalid_onion_payload`
pub const INVALID_ONION_PAYLOAD: u16 = PERM | 22;
pub const INVALID_ONION_VERSION: u16 = BADONION | PERM | 4;
pub const INVALID_ONION_HMAC: u16 = BADONION | PERM | 5;
pub const INVALID_ONION_KEY: u16 = BADONION | PERM | 6;

/// The payload addressed to the final hop. Missing fields make the payload invalid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalPayload {
    pub amount_msat: Option<u64>,
    pub cltv_expiry: Option<u32>,
    pub payment_secret: Option<[u8; 32]>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeeledOnion {
    Final(FinalPayload),
    /// Further layers remain, we would have to forward
    Forward { next_node_id: PublicKey },
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum OnionError {
    /// The packet cannot be decrypted. Reported with `update_fail_malformed_htlc`.
    #[error("malformed onion, failure code {failure_code:#06x}")]
    Malformed { failure_code: u16, sha256_of_onion: [u8; 32] },
    #[error("cannot build onion: {0}")]
    Build(String),
}

/// Onion primitives
pub trait OnionProcessor: Send + Sync {
    fn peel(
        &self,
        packet: &OnionPacket,
        payment_hash: &PaymentHash,
    ) -> Result<PeeledOnion, OnionError>;

    /// A packet with a single final hop for `destination`
    fn build_single_hop(
        &self,
        destination: &PublicKey,
        payload: &FinalPayload,
        payment_hash: &PaymentHash,
    ) -> Result<OnionPacket, OnionError>;

    /// The `reason` of an `update_fail_htlc` for an HTLC that arrived with `packet`
    fn encrypt_failure(&self, packet: &OnionPacket, failure_code: u16) -> Vec<u8>;
}

/// A decoded invoice
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaymentRequest {
    pub payee: PublicKey,
    pub payment_hash: PaymentHash,
    pub amount_msat: u64,
    pub min_final_cltv_expiry_delta: u16,
    pub payment_secret: Option<[u8; 32]>,
}

/// A payment we expect to receive
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncomingPayment {
    pub preimage: PaymentPreimage,
    /// None for invoices without an amount
    pub amount_msat: Option<u64>,
}

/// Preimages of the invoices we issued
pub trait PaymentRegistry: Send + Sync {
    fn lookup(&self, payment_hash: &PaymentHash) -> Option<IncomingPayment>;

    /// Called once the fulfill is irrevocably committed
    fn settled(&self, payment_hash: &PaymentHash, amount_msat: u64);
}

/// Why a received HTLC is refused. The channel continues.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HtlcRejection {
    UnknownPaymentHash,
    IncorrectPaymentAmount,
    BadFinalPayload,
}

impl HtlcRejection {
    pub fn failure_code(self) -> u16 {
        match self {
            HtlcRejection::UnknownPaymentHash | HtlcRejection::IncorrectPaymentAmount =>
                INCORRECT_OR_UNKNOWN_PAYMENT_DETAILS,
            HtlcRejection::BadFinalPayload => INVALID_ONION_PAYLOAD,
        }
    }
}

/// Check a peeled onion against what we expect to be paid
pub fn check_final_payload(
    peeled: &PeeledOnion,
    htlc_amount_msat: u64,
    expected: Option<&IncomingPayment>,
) -> Result<(), HtlcRejection> {
    let payload = match peeled {
        PeeledOnion::Final(payload) => payload,
        PeeledOnion::Forward { .. } => return Err(HtlcRejection::BadFinalPayload),
    };
    let amount_msat = payload.amount_msat.ok_or(HtlcRejection::BadFinalPayload)?;
    payload.cltv_expiry.ok_or(HtlcRejection::BadFinalPayload)?;
    let expected = expected.ok_or(HtlcRejection::UnknownPaymentHash)?;
    if amount_msat != htlc_amount_msat {
        return Err(HtlcRejection::IncorrectPaymentAmount);
    }
    if let Some(invoice_amount) = expected.amount_msat {
        if htlc_amount_msat != invoice_amount {
            return Err(HtlcRejection::IncorrectPaymentAmount);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn final_payload(amount_msat: Option<u64>, cltv_expiry: Option<u32>) -> PeeledOnion {
        PeeledOnion::Final(FinalPayload { amount_msat, cltv_expiry, payment_secret: None })
    }

    #[test]
    fn final_payload_checks() {
        let expected = IncomingPayment { preimage: PaymentPreimage([1; 32]), amount_msat: Some(5000) };
        assert_eq!(check_final_payload(&final_payload(Some(5000), Some(100)), 5000, Some(&expected)), Ok(()));
        assert_eq!(
            check_final_payload(&final_payload(None, Some(100)), 5000, Some(&expected)),
            Err(HtlcRejection::BadFinalPayload)
        );
        assert_eq!(
            check_final_payload(&final_payload(Some(5000), None), 5000, Some(&expected)),
            Err(HtlcRejection::BadFinalPayload)
        );
        assert_eq!(
            check_final_payload(&final_payload(Some(5000), Some(100)), 5000, None),
            Err(HtlcRejection::UnknownPaymentHash)
        );
        assert_eq!(
            check_final_payload(&final_payload(Some(4000), Some(100)), 4000, Some(&expected)),
            Err(HtlcRejection::IncorrectPaymentAmount)
        );
        assert_eq!(HtlcRejection::BadFinalPayload.failure_code(), 0x4016);
        assert_eq!(HtlcRejection::UnknownPaymentHash.failure_code(), 0x400f);
        assert_eq!(INVALID_ONION_HMAC, 0xc005);
    }
}
