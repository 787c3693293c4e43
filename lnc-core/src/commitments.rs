//! Both sides' commitments and the updates in flight between them.
//!
//! Each [CommitmentSpec] is seen from the point of view of its owner: `to_local` is the
//! owner's balance and HTLC directions are relative to the owner. Updates move through
//! `proposed`, `signed` and `acked` lists as `commitment_signed` and `revoke_and_ack`
//! messages are exchanged. All operations return a new [Commitments] and leave the
//! original untouched.

use core::fmt;

use bitcoin::secp256k1::{self, ecdsa::Signature, All, PublicKey, Secp256k1, SecretKey};
use bitcoin::{Amount, OutPoint, ScriptBuf, Transaction, Txid};
use lnc_protocol::msgs::{
    ChannelIdBytes, ChannelReestablish, CommitmentSigned, Message, MonoHopUnidirectionalPayment,
    OnionPacket, RevokeAndAck, UpdateAddHtlc, UpdateFailHtlc,
    UpdateFailMalformedHtlc, UpdateFee, UpdateFulfillHtlc,
};
use lightning::ln::chan_utils::{derive_private_key, make_funding_redeemscript, TxCreationKeys};
use serde_derive::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};

use crate::channel::ChannelId;
use crate::htlc::{Htlc, HtlcDirection, HtlcStatus, PaymentHash, PaymentPreimage};
use crate::keys::{ChannelKeys, ChannelPublicKeys, RevealedSecrets};
use crate::tx::tx::{
    build_commitment_tx, build_htlc_transaction, commit_tx_fee_sat, commitment_keys,
    funding_witness, obscure_factor, BuiltCommitment, CommitmentTxParams,
};
use crate::util::crypto_utils::{sign_p2wsh_input, verify_p2wsh_input};
use crate::util::ser_util::{SignatureHandler, WireHandler};

/// The BADONION bit, required in `update_fail_malformed_htlc` failure codes
pub const BADONION: u16 = 0x8000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommitmentsError {
    #[error("balance of {balance_msat} msat would drop below the required {required_msat} msat")]
    InsufficientFunds { balance_msat: u64, required_msat: u64 },
    #[error("the funder cannot afford the commitment fee, {missing_sat} sat missing")]
    CannotAffordFees { missing_sat: u64 },
    #[error("htlc amount {amount_msat} msat is below the minimum of {minimum_msat} msat")]
    HtlcBelowMinimum { amount_msat: u64, minimum_msat: u64 },
    #[error("too many htlcs, the maximum is {maximum}")]
    TooManyHtlcs { maximum: u16 },
    #[error("amount must be positive")]
    ZeroAmount,
    #[error("unexpected htlc id {got}, expected {expected}")]
    UnexpectedHtlcId { expected: u64, got: u64 },
    #[error("unknown htlc id {0}")]
    UnknownHtlcId(u64),
    #[error("htlc {0} is already being settled")]
    HtlcAlreadySettling(u64),
    #[error("preimage does not match the payment hash of htlc {0}")]
    InvalidPaymentPreimage(u64),
    #[error("failure code {0:#06x} lacks the BADONION bit")]
    InvalidFailureCode(u16),
    #[error("only the funder may update the fee")]
    FeeUpdateByNonFunder,
    #[error("message for channel {0}")]
    WrongChannelId(String),
    #[error("cannot sign a commitment without changes")]
    CannotSignWithoutChanges,
    #[error("cannot sign before the previous remote commitment is revoked")]
    CannotSignBeforeRevocation,
    #[error("invalid signature for commitment {0}")]
    InvalidCommitmentSignature(u64),
    #[error("expected {expected} htlc signatures, got {got}")]
    HtlcSignatureCount { expected: usize, got: usize },
    #[error("invalid signature for htlc {0}")]
    InvalidHtlcSignature(u64),
    #[error("no revocation is expected")]
    UnexpectedRevocation,
    #[error("invalid revocation of commitment {0}")]
    InvalidRevocation(u64),
    #[error("key error: {0}")]
    Crypto(#[from] secp256k1::Error),
}

/// An update message, kept in the lists of in-flight changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireUpdate", into = "WireUpdate")]
pub enum UpdateMessage {
    AddHtlc(UpdateAddHtlc),
    FulfillHtlc(UpdateFulfillHtlc),
    FailHtlc(UpdateFailHtlc),
    FailMalformedHtlc(UpdateFailMalformedHtlc),
    Fee(UpdateFee),
    MonoHopPayment(MonoHopUnidirectionalPayment),
}

impl UpdateMessage {
    pub fn to_message(&self) -> Message {
        match self.clone() {
            UpdateMessage::AddHtlc(m) => Message::UpdateAddHtlc(m),
            UpdateMessage::FulfillHtlc(m) => Message::UpdateFulfillHtlc(m),
            UpdateMessage::FailHtlc(m) => Message::UpdateFailHtlc(m),
            UpdateMessage::FailMalformedHtlc(m) => Message::UpdateFailMalformedHtlc(m),
            UpdateMessage::Fee(m) => Message::UpdateFee(m),
            UpdateMessage::MonoHopPayment(m) => Message::MonoHopUnidirectionalPayment(m),
        }
    }

    pub fn from_message(message: Message) -> Option<Self> {
        Some(match message {
            Message::UpdateAddHtlc(m) => UpdateMessage::AddHtlc(m),
            Message::UpdateFulfillHtlc(m) => UpdateMessage::FulfillHtlc(m),
            Message::UpdateFailHtlc(m) => UpdateMessage::FailHtlc(m),
            Message::UpdateFailMalformedHtlc(m) => UpdateMessage::FailMalformedHtlc(m),
            Message::UpdateFee(m) => UpdateMessage::Fee(m),
            Message::MonoHopUnidirectionalPayment(m) => UpdateMessage::MonoHopPayment(m),
            _ => return None,
        })
    }

    /// The id of the HTLC this update removes, if any
    fn removed_htlc(&self) -> Option<(u64, HtlcStatus)> {
        match self {
            UpdateMessage::FulfillHtlc(m) => Some((m.id, HtlcStatus::Fulfilled)),
            UpdateMessage::FailHtlc(m) => Some((m.id, HtlcStatus::Failed)),
            UpdateMessage::FailMalformedHtlc(m) => Some((m.id, HtlcStatus::Failed)),
            _ => None,
        }
    }

    fn added_htlc(&self) -> Option<u64> {
        match self {
            UpdateMessage::AddHtlc(m) => Some(m.id),
            _ => None,
        }
    }
}

#[serde_as]
#[derive(Serialize, Deserialize)]
struct WireUpdate(#[serde_as(as = "Hex")] Vec<u8>);

impl From<UpdateMessage> for WireUpdate {
    fn from(update: UpdateMessage) -> Self {
        WireUpdate(update.to_message().as_vec())
    }
}

impl TryFrom<WireUpdate> for UpdateMessage {
    type Error = String;

    fn try_from(wire: WireUpdate) -> Result<Self, Self::Error> {
        let message = lnc_protocol::msgs::from_vec(wire.0).map_err(|e| e.to_string())?;
        let name = message.name();
        UpdateMessage::from_message(message).ok_or_else(|| format!("{} is not an update", name))
    }
}

/// The contents of one side's commitment, from that side's point of view
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentSpec {
    pub htlcs: Vec<Htlc>,
    pub feerate_per_kw: u32,
    pub to_local_msat: u64,
    pub to_remote_msat: u64,
}

impl CommitmentSpec {
    pub fn find_htlc(&self, direction: HtlcDirection, id: u64) -> Option<&Htlc> {
        self.htlcs.iter().find(|h| h.direction == direction && h.id == id)
    }

    pub fn total_msat(&self) -> u64 {
        self.to_local_msat
            + self.to_remote_msat
            + self.htlcs.iter().map(|h| h.amount_msat).sum::<u64>()
    }

    pub fn htlc_count(&self, direction: HtlcDirection) -> usize {
        self.htlcs.iter().filter(|h| h.direction == direction).count()
    }

    pub fn untrimmed_htlc_count(&self, dust_limit_sat: u64) -> usize {
        self.htlcs.iter().filter(|h| !h.is_dust(self.feerate_per_kw, dust_limit_sat)).count()
    }

    pub fn commit_tx_fee_sat(&self, dust_limit_sat: u64) -> u64 {
        commit_tx_fee_sat(self.feerate_per_kw, self.untrimmed_htlc_count(dust_limit_sat))
    }

    fn add_htlc(&mut self, add: &UpdateAddHtlc, direction: HtlcDirection) -> Result<(), CommitmentsError> {
        let balance = match direction {
            HtlcDirection::Offered => &mut self.to_local_msat,
            HtlcDirection::Received => &mut self.to_remote_msat,
        };
        *balance = balance.checked_sub(add.amount_msat).ok_or(
            CommitmentsError::InsufficientFunds {
                balance_msat: *balance,
                required_msat: add.amount_msat,
            },
        )?;
        self.htlcs.push(Htlc::from_add(add, direction));
        Ok(())
    }

    /// Remove an HTLC, crediting the side that ends up owning its value
    fn remove_htlc(
        &mut self,
        direction: HtlcDirection,
        id: u64,
        fulfilled: bool,
    ) -> Result<(), CommitmentsError> {
        let pos = self
            .htlcs
            .iter()
            .position(|h| h.direction == direction && h.id == id)
            .ok_or(CommitmentsError::UnknownHtlcId(id))?;
        let htlc = self.htlcs.remove(pos);
        let to_owner = match direction {
            HtlcDirection::Offered => !fulfilled,
            HtlcDirection::Received => fulfilled,
        };
        if to_owner {
            self.to_local_msat += htlc.amount_msat;
        } else {
            self.to_remote_msat += htlc.amount_msat;
        }
        Ok(())
    }

    fn transfer(&mut self, amount_msat: u64, from_owner: bool) -> Result<(), CommitmentsError> {
        let (from, to) = if from_owner {
            (&mut self.to_local_msat, &mut self.to_remote_msat)
        } else {
            (&mut self.to_remote_msat, &mut self.to_local_msat)
        };
        *from = from.checked_sub(amount_msat).ok_or(CommitmentsError::InsufficientFunds {
            balance_msat: *from,
            required_msat: amount_msat,
        })?;
        *to += amount_msat;
        Ok(())
    }

    /// Apply the owner's changes and the counterparty's changes.
    ///
    /// Additions are applied before removals so that an HTLC added and settled in the
    /// same batch resolves.
    pub fn reduce(
        &self,
        owner_changes: &[UpdateMessage],
        counterparty_changes: &[UpdateMessage],
    ) -> Result<CommitmentSpec, CommitmentsError> {
        let mut spec = self.clone();
        for update in owner_changes {
            match update {
                UpdateMessage::AddHtlc(add) => spec.add_htlc(add, HtlcDirection::Offered)?,
                UpdateMessage::MonoHopPayment(p) => spec.transfer(p.amount_msat, true)?,
                _ => {}
            }
        }
        for update in counterparty_changes {
            match update {
                UpdateMessage::AddHtlc(add) => spec.add_htlc(add, HtlcDirection::Received)?,
                UpdateMessage::MonoHopPayment(p) => spec.transfer(p.amount_msat, false)?,
                _ => {}
            }
        }
        for update in owner_changes {
            match update {
                UpdateMessage::FulfillHtlc(m) =>
                    spec.remove_htlc(HtlcDirection::Received, m.id, true)?,
                UpdateMessage::FailHtlc(m) =>
                    spec.remove_htlc(HtlcDirection::Received, m.id, false)?,
                UpdateMessage::FailMalformedHtlc(m) =>
                    spec.remove_htlc(HtlcDirection::Received, m.id, false)?,
                _ => {}
            }
        }
        for update in counterparty_changes {
            match update {
                UpdateMessage::FulfillHtlc(m) =>
                    spec.remove_htlc(HtlcDirection::Offered, m.id, true)?,
                UpdateMessage::FailHtlc(m) =>
                    spec.remove_htlc(HtlcDirection::Offered, m.id, false)?,
                UpdateMessage::FailMalformedHtlc(m) =>
                    spec.remove_htlc(HtlcDirection::Offered, m.id, false)?,
                _ => {}
            }
        }
        let fee = owner_changes.iter().chain(counterparty_changes).rev().find_map(|u| match u {
            UpdateMessage::Fee(fee) => Some(fee.feerate_per_kw),
            _ => None,
        });
        if let Some(feerate_per_kw) = fee {
            spec.feerate_per_kw = feerate_per_kw;
        }
        Ok(spec)
    }
}

/// Negotiated when the channel was opened
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConstraints {
    pub local_dust_limit_sat: u64,
    pub remote_dust_limit_sat: u64,
    /// CSV delay on our own outputs, imposed by the counterparty
    pub local_to_self_delay: u16,
    /// CSV delay on the counterparty's outputs, imposed by us
    pub remote_to_self_delay: u16,
    /// The reserve we must keep
    pub local_reserve_sat: u64,
    /// The reserve the counterparty must keep
    pub remote_reserve_sat: u64,
    /// Smallest HTLC we accept
    pub local_htlc_minimum_msat: u64,
    /// Smallest HTLC the counterparty accepts
    pub remote_htlc_minimum_msat: u64,
    pub local_max_accepted_htlcs: u16,
    pub remote_max_accepted_htlcs: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingInfo {
    pub outpoint: OutPoint,
    pub amount_sat: u64,
}

/// Our current commitment, with the counterparty's signatures
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalCommit {
    pub index: u64,
    pub spec: CommitmentSpec,
    #[serde_as(as = "SignatureHandler")]
    pub remote_sig: Signature,
    /// In the order of the HTLC outputs of the commitment transaction
    #[serde_as(as = "Vec<SignatureHandler>")]
    pub remote_htlc_sigs: Vec<Signature>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCommit {
    pub index: u64,
    pub spec: CommitmentSpec,
    pub txid: Txid,
    pub remote_per_commitment_point: PublicKey,
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingForRevocation {
    pub next_remote_commit: RemoteCommit,
    #[serde_as(as = "WireHandler")]
    pub sent: CommitmentSigned,
    /// Our local commitment index when `sent` went out
    pub sent_after_local_commit_index: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteNextCommitInfo {
    /// We signed their next commitment and wait for the revocation of the current one
    Waiting(WaitingForRevocation),
    /// The point for their next commitment
    Revoked(PublicKey),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalChanges {
    pub proposed: Vec<UpdateMessage>,
    pub signed: Vec<UpdateMessage>,
    pub acked: Vec<UpdateMessage>,
}

impl LocalChanges {
    pub fn all(&self) -> impl Iterator<Item = &UpdateMessage> {
        self.proposed.iter().chain(self.signed.iter()).chain(self.acked.iter())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteChanges {
    pub proposed: Vec<UpdateMessage>,
    pub acked: Vec<UpdateMessage>,
    pub signed: Vec<UpdateMessage>,
}

impl RemoteChanges {
    pub fn all(&self) -> impl Iterator<Item = &UpdateMessage> {
        self.proposed.iter().chain(self.acked.iter()).chain(self.signed.iter())
    }
}

/// A remote commitment that was just revoked, with the secret that revokes it
#[derive(Clone, PartialEq, Eq)]
pub struct RevokedCommitment {
    pub commitment: RemoteCommit,
    pub per_commitment_secret: SecretKey,
}

impl fmt::Debug for RevokedCommitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RevokedCommitment")
            .field("index", &self.commitment.index)
            .field("txid", &self.commitment.txid)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commitments {
    pub channel_id: ChannelId,
    pub is_funder: bool,
    pub funding: FundingInfo,
    pub constraints: ChannelConstraints,
    pub local_pubkeys: ChannelPublicKeys,
    pub remote_pubkeys: ChannelPublicKeys,
    pub local_commit: LocalCommit,
    pub remote_commit: RemoteCommit,
    pub local_changes: LocalChanges,
    pub remote_changes: RemoteChanges,
    pub local_next_htlc_id: u64,
    pub remote_next_htlc_id: u64,
    pub remote_next_commit_info: RemoteNextCommitInfo,
    pub remote_secrets: RevealedSecrets,
}

impl Commitments {
    pub fn funding_redeemscript(&self) -> ScriptBuf {
        make_funding_redeemscript(&self.local_pubkeys.funding_pubkey, &self.remote_pubkeys.funding_pubkey)
    }

    pub fn obscure_factor(&self) -> u64 {
        if self.is_funder {
            obscure_factor(&self.local_pubkeys.payment_point, &self.remote_pubkeys.payment_point)
        } else {
            obscure_factor(&self.remote_pubkeys.payment_point, &self.local_pubkeys.payment_point)
        }
    }

    /// We have updates the counterparty has not signed yet
    pub fn local_has_changes(&self) -> bool {
        !self.remote_changes.acked.is_empty() || !self.local_changes.proposed.is_empty()
    }

    /// The counterparty has updates we have not signed yet
    pub fn remote_has_changes(&self) -> bool {
        !self.local_changes.acked.is_empty() || !self.remote_changes.proposed.is_empty()
    }

    /// The most recent remote commitment we signed
    pub fn latest_remote_commit(&self) -> &RemoteCommit {
        match &self.remote_next_commit_info {
            RemoteNextCommitInfo::Waiting(waiting) => &waiting.next_remote_commit,
            RemoteNextCommitInfo::Revoked(_) => &self.remote_commit,
        }
    }

    /// The counterparty's next commitment, once everything we proposed is signed
    fn remote_view(&self) -> Result<CommitmentSpec, CommitmentsError> {
        self.latest_remote_commit().spec.reduce(&self.remote_changes.acked, &self.local_changes.proposed)
    }

    /// Our next commitment, once everything the counterparty proposed is signed
    fn local_view(&self) -> Result<CommitmentSpec, CommitmentsError> {
        self.local_commit.spec.reduce(&self.local_changes.acked, &self.remote_changes.proposed)
    }

    pub fn local_balance_msat(&self) -> u64 {
        self.local_commit.spec.to_local_msat
    }

    pub fn remote_balance_msat(&self) -> u64 {
        self.local_commit.spec.to_remote_msat
    }

    /// What we can still send, after the reserve and the fees we owe as funder
    pub fn available_balance_msat(&self) -> u64 {
        let Ok(view) = self.remote_view() else { return 0 };
        let fees_sat =
            if self.is_funder { view.commit_tx_fee_sat(self.constraints.remote_dust_limit_sat) } else { 0 };
        view.to_remote_msat.saturating_sub((self.constraints.local_reserve_sat + fees_sat) * 1000)
    }

    fn check_channel_id(&self, channel_id: &ChannelIdBytes) -> Result<(), CommitmentsError> {
        if *channel_id != self.channel_id.0 {
            return Err(CommitmentsError::WrongChannelId(ChannelId(*channel_id).to_string()));
        }
        Ok(())
    }

    /// Our balance in `remote_view` must cover our reserve and, as funder, the fee
    fn check_local_balance(&self, remote_view: &CommitmentSpec) -> Result<(), CommitmentsError> {
        let fees_sat = if self.is_funder {
            remote_view.commit_tx_fee_sat(self.constraints.remote_dust_limit_sat)
        } else {
            0
        };
        let required_msat = (self.constraints.local_reserve_sat + fees_sat) * 1000;
        if remote_view.to_remote_msat < required_msat {
            return Err(CommitmentsError::InsufficientFunds {
                balance_msat: remote_view.to_remote_msat,
                required_msat,
            });
        }
        if !self.is_funder {
            let fees_msat = remote_view.commit_tx_fee_sat(self.constraints.remote_dust_limit_sat) * 1000;
            if remote_view.to_local_msat < fees_msat {
                return Err(CommitmentsError::CannotAffordFees {
                    missing_sat: (fees_msat - remote_view.to_local_msat) / 1000,
                });
            }
        }
        Ok(())
    }

    /// The counterparty's balance in `local_view` must cover its reserve and, as funder, the fee
    fn check_remote_balance(&self, local_view: &CommitmentSpec) -> Result<(), CommitmentsError> {
        let fees_sat = if self.is_funder {
            0
        } else {
            local_view.commit_tx_fee_sat(self.constraints.local_dust_limit_sat)
        };
        let required_msat = (self.constraints.remote_reserve_sat + fees_sat) * 1000;
        if local_view.to_remote_msat < required_msat {
            return Err(CommitmentsError::InsufficientFunds {
                balance_msat: local_view.to_remote_msat,
                required_msat,
            });
        }
        Ok(())
    }

    /// An HTLC we received that is in both signed commitments
    fn incoming_htlc_cross_signed(&self, id: u64) -> Option<&Htlc> {
        self.latest_remote_commit().spec.find_htlc(HtlcDirection::Offered, id)?;
        self.local_commit.spec.find_htlc(HtlcDirection::Received, id)
    }

    /// An HTLC we offered that is in both signed commitments
    fn outgoing_htlc_cross_signed(&self, id: u64) -> Option<&Htlc> {
        self.latest_remote_commit().spec.find_htlc(HtlcDirection::Received, id)?;
        self.local_commit.spec.find_htlc(HtlcDirection::Offered, id)
    }

    pub fn send_add(
        &self,
        amount_msat: u64,
        payment_hash: PaymentHash,
        cltv_expiry: u32,
        onion_routing_packet: OnionPacket,
    ) -> Result<(Commitments, UpdateAddHtlc), CommitmentsError> {
        if amount_msat == 0 {
            return Err(CommitmentsError::ZeroAmount);
        }
        if amount_msat < self.constraints.remote_htlc_minimum_msat {
            return Err(CommitmentsError::HtlcBelowMinimum {
                amount_msat,
                minimum_msat: self.constraints.remote_htlc_minimum_msat,
            });
        }
        let add = UpdateAddHtlc {
            channel_id: self.channel_id.0,
            id: self.local_next_htlc_id,
            amount_msat,
            payment_hash: payment_hash.0,
            cltv_expiry,
            onion_routing_packet,
        };
        let mut next = self.clone();
        next.local_changes.proposed.push(UpdateMessage::AddHtlc(add.clone()));
        next.local_next_htlc_id += 1;

        let view = next.remote_view()?;
        if view.htlc_count(HtlcDirection::Received) > self.constraints.remote_max_accepted_htlcs as usize {
            return Err(CommitmentsError::TooManyHtlcs {
                maximum: self.constraints.remote_max_accepted_htlcs,
            });
        }
        next.check_local_balance(&view)?;
        Ok((next, add))
    }

    pub fn receive_add(&self, add: &UpdateAddHtlc) -> Result<Commitments, CommitmentsError> {
        self.check_channel_id(&add.channel_id)?;
        if add.id != self.remote_next_htlc_id {
            return Err(CommitmentsError::UnexpectedHtlcId {
                expected: self.remote_next_htlc_id,
                got: add.id,
            });
        }
        if add.amount_msat == 0 {
            return Err(CommitmentsError::ZeroAmount);
        }
        if add.amount_msat < self.constraints.local_htlc_minimum_msat {
            return Err(CommitmentsError::HtlcBelowMinimum {
                amount_msat: add.amount_msat,
                minimum_msat: self.constraints.local_htlc_minimum_msat,
            });
        }
        let mut next = self.clone();
        next.remote_changes.proposed.push(UpdateMessage::AddHtlc(add.clone()));
        next.remote_next_htlc_id += 1;

        let view = next.local_view()?;
        if view.htlc_count(HtlcDirection::Received) > self.constraints.local_max_accepted_htlcs as usize {
            return Err(CommitmentsError::TooManyHtlcs {
                maximum: self.constraints.local_max_accepted_htlcs,
            });
        }
        next.check_remote_balance(&view)?;
        Ok(next)
    }

    fn check_local_removal(&self, id: u64) -> Result<&Htlc, CommitmentsError> {
        let htlc = self.incoming_htlc_cross_signed(id).ok_or(CommitmentsError::UnknownHtlcId(id))?;
        if self.local_changes.all().any(|u| matches!(u.removed_htlc(), Some((i, _)) if i == id)) {
            return Err(CommitmentsError::HtlcAlreadySettling(id));
        }
        Ok(htlc)
    }

    fn check_remote_removal(&self, id: u64) -> Result<&Htlc, CommitmentsError> {
        let htlc = self.outgoing_htlc_cross_signed(id).ok_or(CommitmentsError::UnknownHtlcId(id))?;
        if self.remote_changes.all().any(|u| matches!(u.removed_htlc(), Some((i, _)) if i == id)) {
            return Err(CommitmentsError::HtlcAlreadySettling(id));
        }
        Ok(htlc)
    }

    pub fn send_fulfill(
        &self,
        id: u64,
        preimage: &PaymentPreimage,
    ) -> Result<(Commitments, UpdateFulfillHtlc), CommitmentsError> {
        let htlc = self.check_local_removal(id)?;
        if preimage.payment_hash() != htlc.payment_hash {
            return Err(CommitmentsError::InvalidPaymentPreimage(id));
        }
        let fulfill =
            UpdateFulfillHtlc { channel_id: self.channel_id.0, id, payment_preimage: preimage.0 };
        let mut next = self.clone();
        next.local_changes.proposed.push(UpdateMessage::FulfillHtlc(fulfill.clone()));
        Ok((next, fulfill))
    }

    pub fn receive_fulfill(
        &self,
        fulfill: &UpdateFulfillHtlc,
    ) -> Result<(Commitments, Htlc), CommitmentsError> {
        self.check_channel_id(&fulfill.channel_id)?;
        let htlc = self.check_remote_removal(fulfill.id)?.clone();
        if PaymentPreimage(fulfill.payment_preimage).payment_hash() != htlc.payment_hash {
            return Err(CommitmentsError::InvalidPaymentPreimage(fulfill.id));
        }
        let mut next = self.clone();
        next.remote_changes.proposed.push(UpdateMessage::FulfillHtlc(fulfill.clone()));
        Ok((next, htlc))
    }

    pub fn send_fail(
        &self,
        id: u64,
        reason: Vec<u8>,
    ) -> Result<(Commitments, UpdateFailHtlc), CommitmentsError> {
        self.check_local_removal(id)?;
        let fail = UpdateFailHtlc { channel_id: self.channel_id.0, id, reason };
        let mut next = self.clone();
        next.local_changes.proposed.push(UpdateMessage::FailHtlc(fail.clone()));
        Ok((next, fail))
    }

    pub fn send_fail_malformed(
        &self,
        id: u64,
        sha256_of_onion: [u8; 32],
        failure_code: u16,
    ) -> Result<(Commitments, UpdateFailMalformedHtlc), CommitmentsError> {
        if failure_code & BADONION == 0 {
            return Err(CommitmentsError::InvalidFailureCode(failure_code));
        }
        self.check_local_removal(id)?;
        let fail = UpdateFailMalformedHtlc {
            channel_id: self.channel_id.0,
            id,
            sha256_of_onion,
            failure_code,
        };
        let mut next = self.clone();
        next.local_changes.proposed.push(UpdateMessage::FailMalformedHtlc(fail.clone()));
        Ok((next, fail))
    }

    pub fn receive_fail(&self, fail: &UpdateFailHtlc) -> Result<(Commitments, Htlc), CommitmentsError> {
        self.check_channel_id(&fail.channel_id)?;
        let htlc = self.check_remote_removal(fail.id)?.clone();
        let mut next = self.clone();
        next.remote_changes.proposed.push(UpdateMessage::FailHtlc(fail.clone()));
        Ok((next, htlc))
    }

    pub fn receive_fail_malformed(
        &self,
        fail: &UpdateFailMalformedHtlc,
    ) -> Result<(Commitments, Htlc), CommitmentsError> {
        self.check_channel_id(&fail.channel_id)?;
        if fail.failure_code & BADONION == 0 {
            return Err(CommitmentsError::InvalidFailureCode(fail.failure_code));
        }
        let htlc = self.check_remote_removal(fail.id)?.clone();
        let mut next = self.clone();
        next.remote_changes.proposed.push(UpdateMessage::FailMalformedHtlc(fail.clone()));
        Ok((next, htlc))
    }

    /// Propose a new feerate. Only the funder may, and only if it can pay the resulting fee.
    pub fn send_fee(&self, feerate_per_kw: u32) -> Result<(Commitments, UpdateFee), CommitmentsError> {
        if !self.is_funder {
            return Err(CommitmentsError::FeeUpdateByNonFunder);
        }
        let fee = UpdateFee { channel_id: self.channel_id.0, feerate_per_kw };
        let mut next = self.clone();
        next.local_changes.proposed.retain(|u| !matches!(u, UpdateMessage::Fee(_)));
        next.local_changes.proposed.push(UpdateMessage::Fee(fee.clone()));

        let view = next.remote_view()?;
        let required_msat = (self.constraints.local_reserve_sat
            + view.commit_tx_fee_sat(self.constraints.remote_dust_limit_sat))
            * 1000;
        if view.to_remote_msat < required_msat {
            return Err(CommitmentsError::CannotAffordFees {
                missing_sat: (required_msat - view.to_remote_msat) / 1000,
            });
        }
        Ok((next, fee))
    }

    pub fn receive_fee(&self, fee: &UpdateFee) -> Result<Commitments, CommitmentsError> {
        self.check_channel_id(&fee.channel_id)?;
        if self.is_funder {
            return Err(CommitmentsError::FeeUpdateByNonFunder);
        }
        let mut next = self.clone();
        next.remote_changes.proposed.retain(|u| !matches!(u, UpdateMessage::Fee(_)));
        next.remote_changes.proposed.push(UpdateMessage::Fee(fee.clone()));

        let view = next.local_view()?;
        let required_msat = (self.constraints.remote_reserve_sat
            + view.commit_tx_fee_sat(self.constraints.local_dust_limit_sat))
            * 1000;
        if view.to_remote_msat < required_msat {
            return Err(CommitmentsError::CannotAffordFees {
                missing_sat: (required_msat - view.to_remote_msat) / 1000,
            });
        }
        Ok(next)
    }

    pub fn send_mono_hop_payment(
        &self,
        amount_msat: u64,
    ) -> Result<(Commitments, MonoHopUnidirectionalPayment), CommitmentsError> {
        if amount_msat == 0 {
            return Err(CommitmentsError::ZeroAmount);
        }
        let payment = MonoHopUnidirectionalPayment { channel_id: self.channel_id.0, amount_msat };
        let mut next = self.clone();
        next.local_changes.proposed.push(UpdateMessage::MonoHopPayment(payment.clone()));
        let view = next.remote_view()?;
        next.check_local_balance(&view)?;
        Ok((next, payment))
    }

    pub fn receive_mono_hop_payment(
        &self,
        payment: &MonoHopUnidirectionalPayment,
    ) -> Result<Commitments, CommitmentsError> {
        self.check_channel_id(&payment.channel_id)?;
        if payment.amount_msat == 0 {
            return Err(CommitmentsError::ZeroAmount);
        }
        let mut next = self.clone();
        next.remote_changes.proposed.push(UpdateMessage::MonoHopPayment(payment.clone()));
        let view = next.local_view()?;
        next.check_remote_balance(&view)?;
        Ok(next)
    }


    fn commitment_params<'a>(&self, keys: &'a TxCreationKeys, local: bool) -> CommitmentTxParams<'a> {
        let c = &self.constraints;
        if local {
            CommitmentTxParams {
                funding_outpoint: self.funding.outpoint,
                obscure_factor: self.obscure_factor(),
                keys,
                countersignatory_payment_point: self.remote_pubkeys.payment_point,
                to_self_delay: c.local_to_self_delay,
                dust_limit_sat: c.local_dust_limit_sat,
                broadcaster_is_funder: self.is_funder,
            }
        } else {
            CommitmentTxParams {
                funding_outpoint: self.funding.outpoint,
                obscure_factor: self.obscure_factor(),
                keys,
                countersignatory_payment_point: self.local_pubkeys.payment_point,
                to_self_delay: c.remote_to_self_delay,
                dust_limit_sat: c.remote_dust_limit_sat,
                broadcaster_is_funder: !self.is_funder,
            }
        }
    }

    /// Build our commitment `index` holding `spec`
    pub fn build_local_commitment(
        &self,
        secp_ctx: &Secp256k1<All>,
        keys: &ChannelKeys,
        index: u64,
        spec: &CommitmentSpec,
    ) -> Result<BuiltCommitment, CommitmentsError> {
        let point = keys.per_commitment_point(secp_ctx, index)?;
        let txkeys =
            commitment_keys(secp_ctx, &point, &self.local_pubkeys, &self.remote_pubkeys);
        Ok(build_commitment_tx(&self.commitment_params(&txkeys, true), index, spec))
    }

    /// Build the counterparty's commitment `index` holding `spec`
    pub fn build_remote_commitment(
        &self,
        secp_ctx: &Secp256k1<All>,
        index: u64,
        spec: &CommitmentSpec,
        remote_per_commitment_point: &PublicKey,
    ) -> Result<BuiltCommitment, CommitmentsError> {
        let txkeys = commitment_keys(
            secp_ctx,
            remote_per_commitment_point,
            &self.remote_pubkeys,
            &self.local_pubkeys,
        );
        Ok(build_commitment_tx(&self.commitment_params(&txkeys, false), index, spec))
    }

    /// Sign the counterparty's commitment and each of its second-level HTLC transactions
    pub fn sign_remote_commitment(
        &self,
        secp_ctx: &Secp256k1<All>,
        keys: &ChannelKeys,
        index: u64,
        spec: &CommitmentSpec,
        remote_per_commitment_point: &PublicKey,
    ) -> Result<(BuiltCommitment, Signature, Vec<Signature>), CommitmentsError> {
        let built = self.build_remote_commitment(secp_ctx, index, spec, remote_per_commitment_point)?;
        let sig = sign_p2wsh_input(
            secp_ctx,
            &built.tx,
            0,
            &self.funding_redeemscript(),
            Amount::from_sat(self.funding.amount_sat),
            &keys.funding_key,
        )?;
        let htlc_key = derive_private_key(secp_ctx, remote_per_commitment_point, &keys.htlc_base_key);
        let txid = built.txid();
        let htlc_sigs = built
            .htlc_outputs
            .iter()
            .map(|output| {
                let htlc_tx = build_htlc_transaction(
                    &txid,
                    output,
                    spec.feerate_per_kw,
                    self.constraints.remote_to_self_delay,
                    &built.keys,
                );
                sign_p2wsh_input(
                    secp_ctx,
                    &htlc_tx,
                    0,
                    &output.redeemscript,
                    Amount::from_sat(output.htlc.amount_sat()),
                    &htlc_key,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok((built, sig, htlc_sigs))
    }

    /// Sign the counterparty's next commitment with every change we proposed and every
    /// change of theirs we acked
    pub fn send_commit(
        &self,
        secp_ctx: &Secp256k1<All>,
        keys: &ChannelKeys,
    ) -> Result<(Commitments, CommitmentSigned), CommitmentsError> {
        let point = match &self.remote_next_commit_info {
            RemoteNextCommitInfo::Revoked(point) => *point,
            RemoteNextCommitInfo::Waiting(_) => return Err(CommitmentsError::CannotSignBeforeRevocation),
        };
        if !self.local_has_changes() {
            return Err(CommitmentsError::CannotSignWithoutChanges);
        }
        let spec = self.remote_commit.spec.reduce(&self.remote_changes.acked, &self.local_changes.proposed)?;
        let index = self.remote_commit.index + 1;
        let (built, signature, htlc_signatures) =
            self.sign_remote_commitment(secp_ctx, keys, index, &spec, &point)?;
        let sent = CommitmentSigned { channel_id: self.channel_id.0, signature, htlc_signatures };

        let mut next = self.clone();
        next.remote_next_commit_info = RemoteNextCommitInfo::Waiting(WaitingForRevocation {
            next_remote_commit: RemoteCommit {
                index,
                spec,
                txid: built.txid(),
                remote_per_commitment_point: point,
            },
            sent: sent.clone(),
            sent_after_local_commit_index: self.local_commit.index,
        });
        next.local_changes.signed = core::mem::take(&mut next.local_changes.proposed);
        next.remote_changes.signed = core::mem::take(&mut next.remote_changes.acked);
        Ok((next, sent))
    }

    /// Check the counterparty's signatures on our next commitment and revoke the current one
    pub fn receive_commit(
        &self,
        secp_ctx: &Secp256k1<All>,
        keys: &ChannelKeys,
        commit: &CommitmentSigned,
    ) -> Result<(Commitments, RevokeAndAck), CommitmentsError> {
        self.check_channel_id(&commit.channel_id)?;
        if !self.remote_has_changes() {
            return Err(CommitmentsError::CannotSignWithoutChanges);
        }
        let spec = self.local_view()?;
        let index = self.local_commit.index + 1;
        let built = self.build_local_commitment(secp_ctx, keys, index, &spec)?;
        if !verify_p2wsh_input(
            secp_ctx,
            &built.tx,
            0,
            &self.funding_redeemscript(),
            Amount::from_sat(self.funding.amount_sat),
            &commit.signature,
            &self.remote_pubkeys.funding_pubkey,
        ) {
            return Err(CommitmentsError::InvalidCommitmentSignature(index));
        }
        if commit.htlc_signatures.len() != built.htlc_outputs.len() {
            return Err(CommitmentsError::HtlcSignatureCount {
                expected: built.htlc_outputs.len(),
                got: commit.htlc_signatures.len(),
            });
        }
        let txid = built.txid();
        for (output, sig) in built.htlc_outputs.iter().zip(&commit.htlc_signatures) {
            let htlc_tx = build_htlc_transaction(
                &txid,
                output,
                spec.feerate_per_kw,
                self.constraints.local_to_self_delay,
                &built.keys,
            );
            if !verify_p2wsh_input(
                secp_ctx,
                &htlc_tx,
                0,
                &output.redeemscript,
                Amount::from_sat(output.htlc.amount_sat()),
                sig,
                &built.keys.countersignatory_htlc_key.to_public_key(),
            ) {
                return Err(CommitmentsError::InvalidHtlcSignature(output.htlc.id));
            }
        }
        let revocation = self.revocation_for(secp_ctx, keys, self.local_commit.index)?;

        let mut next = self.clone();
        next.local_commit = LocalCommit {
            index,
            spec,
            remote_sig: commit.signature,
            remote_htlc_sigs: commit.htlc_signatures.clone(),
        };
        next.local_changes.acked.clear();
        let proposed = core::mem::take(&mut next.remote_changes.proposed);
        next.remote_changes.acked.extend(proposed);
        Ok((next, revocation))
    }

    /// The `revoke_and_ack` that revokes our commitment `index`
    pub fn revocation_for(
        &self,
        secp_ctx: &Secp256k1<All>,
        keys: &ChannelKeys,
        index: u64,
    ) -> Result<RevokeAndAck, CommitmentsError> {
        Ok(RevokeAndAck {
            channel_id: self.channel_id.0,
            per_commitment_secret: keys.per_commitment_secret(index)?.secret_bytes(),
            next_per_commitment_point: keys.per_commitment_point(secp_ctx, index + 2)?,
        })
    }

    /// Apply the counterparty's revocation of its current commitment.
    ///
    /// Returns the revoked commitment, which must be handed to the breach store.
    pub fn receive_revocation(
        &self,
        secp_ctx: &Secp256k1<All>,
        revocation: &RevokeAndAck,
    ) -> Result<(Commitments, RevokedCommitment), CommitmentsError> {
        self.check_channel_id(&revocation.channel_id)?;
        let waiting = match &self.remote_next_commit_info {
            RemoteNextCommitInfo::Waiting(waiting) => waiting,
            RemoteNextCommitInfo::Revoked(_) => return Err(CommitmentsError::UnexpectedRevocation),
        };
        let index = self.remote_commit.index;
        let secret = SecretKey::from_slice(&revocation.per_commitment_secret)
            .map_err(|_| CommitmentsError::InvalidRevocation(index))?;
        if PublicKey::from_secret_key(secp_ctx, &secret)
            != self.remote_commit.remote_per_commitment_point
        {
            return Err(CommitmentsError::InvalidRevocation(index));
        }
        let mut next = self.clone();
        next.remote_secrets
            .provide(index, revocation.per_commitment_secret)
            .map_err(|_| CommitmentsError::InvalidRevocation(index))?;
        next.remote_commit = waiting.next_remote_commit.clone();
        next.remote_next_commit_info =
            RemoteNextCommitInfo::Revoked(revocation.next_per_commitment_point);
        let signed = core::mem::take(&mut next.local_changes.signed);
        next.local_changes.acked.extend(signed);
        next.remote_changes.signed.clear();
        let revoked = RevokedCommitment {
            commitment: self.remote_commit.clone(),
            per_commitment_secret: secret,
        };
        Ok((next, revoked))
    }

    /// Forget updates neither side has signed, as required on reconnection
    pub fn discard_unsigned_updates(&self) -> Commitments {
        let mut next = self.clone();
        let local_adds = next.local_changes.proposed.iter().filter_map(|u| u.added_htlc()).count();
        let remote_adds = next.remote_changes.proposed.iter().filter_map(|u| u.added_htlc()).count();
        next.local_next_htlc_id -= local_adds as u64;
        next.remote_next_htlc_id -= remote_adds as u64;
        next.local_changes.proposed.clear();
        next.remote_changes.proposed.clear();
        next
    }

    /// Our `channel_reestablish`
    pub fn channel_reestablish(
        &self,
        secp_ctx: &Secp256k1<All>,
        keys: &ChannelKeys,
    ) -> Result<ChannelReestablish, CommitmentsError> {
        let your_last_per_commitment_secret = match self.remote_commit.index {
            0 => [0u8; 32],
            index => self.remote_secrets.get(index - 1).unwrap_or([0u8; 32]),
        };
        Ok(ChannelReestablish {
            channel_id: self.channel_id.0,
            next_commitment_number: self.local_commit.index + 1,
            next_revocation_number: self.remote_commit.index,
            your_last_per_commitment_secret,
            my_current_per_commitment_point: keys
                .per_commitment_point(secp_ctx, self.local_commit.index)?,
        })
    }

    /// Where an HTLC stands. `direction` is relative to us.
    pub fn htlc_status(&self, direction: HtlcDirection, id: u64) -> Option<HtlcStatus> {
        let (mut removals, mut adds, next_id): (Vec<&UpdateMessage>, Vec<&UpdateMessage>, u64) =
            match direction {
                HtlcDirection::Offered => (
                    self.remote_changes.all().collect(),
                    self.local_changes.all().collect(),
                    self.local_next_htlc_id,
                ),
                HtlcDirection::Received => (
                    self.local_changes.all().collect(),
                    self.remote_changes.all().collect(),
                    self.remote_next_htlc_id,
                ),
            };
        if id >= next_id {
            return None;
        }
        if let Some(status) = removals
            .drain(..)
            .find_map(|u| u.removed_htlc().filter(|(i, _)| *i == id).map(|(_, s)| s))
        {
            return Some(status);
        }
        let in_commitment = self.local_commit.spec.find_htlc(direction, id).is_some()
            || self.latest_remote_commit().spec.find_htlc(direction.opposite(), id).is_some()
            || adds.drain(..).any(|u| u.added_htlc() == Some(id));
        Some(if in_commitment { HtlcStatus::Pending } else { HtlcStatus::Settled })
    }

    /// Our current commitment transaction, signed by both sides
    pub fn signed_local_commitment_tx(
        &self,
        secp_ctx: &Secp256k1<All>,
        keys: &ChannelKeys,
    ) -> Result<Transaction, CommitmentsError> {
        let built =
            self.build_local_commitment(secp_ctx, keys, self.local_commit.index, &self.local_commit.spec)?;
        let funding_redeemscript = self.funding_redeemscript();
        let local_sig = sign_p2wsh_input(
            secp_ctx,
            &built.tx,
            0,
            &funding_redeemscript,
            Amount::from_sat(self.funding.amount_sat),
            &keys.funding_key,
        )?;
        let mut tx = built.tx;
        tx.input[0].witness = funding_witness(
            &local_sig,
            &self.local_pubkeys.funding_pubkey,
            &self.local_commit.remote_sig,
            &self.remote_pubkeys.funding_pubkey,
            &funding_redeemscript,
        );
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_utils::{
        make_commitments_pair, make_onion, ChannelPairConfig, TestChannelSide,
    };
    use test_log::test;

    fn exchange_commits(
        secp_ctx: &Secp256k1<All>,
        sender: &mut TestChannelSide,
        receiver: &mut TestChannelSide,
    ) {
        let (c, commit) = sender.commitments.send_commit(secp_ctx, &sender.keys).unwrap();
        sender.commitments = c;
        let (c, revocation) =
            receiver.commitments.receive_commit(secp_ctx, &receiver.keys, &commit).unwrap();
        receiver.commitments = c;
        let (c, revoked) = sender.commitments.receive_revocation(secp_ctx, &revocation).unwrap();
        sender.commitments = c;
        assert_eq!(revoked.commitment.index + 1, sender.commitments.remote_commit.index);
    }

    fn full_round(secp_ctx: &Secp256k1<All>, a: &mut TestChannelSide, b: &mut TestChannelSide) {
        exchange_commits(secp_ctx, a, b);
        exchange_commits(secp_ctx, b, a);
    }

    #[test]
    fn mono_hop_payment_moves_balance() {
        let secp_ctx = Secp256k1::new();
        let config = ChannelPairConfig::tiny(100_000);
        let (mut a, mut b) = make_commitments_pair(&secp_ctx, &config);
        assert_eq!(a.commitments.available_balance_msat(), 100_000);

        let (c, payment) = a.commitments.send_mono_hop_payment(50_000).unwrap();
        a.commitments = c;
        b.commitments = b.commitments.receive_mono_hop_payment(&payment).unwrap();
        full_round(&secp_ctx, &mut a, &mut b);

        assert_eq!(a.commitments.local_balance_msat(), 50_000);
        assert_eq!(b.commitments.local_balance_msat(), 50_000);
        assert_eq!(a.commitments.local_commit.index, 1);
        assert_eq!(a.commitments.remote_commit.index, 1);
        assert_eq!(b.commitments.local_commit.index, 1);
        assert!(!a.commitments.local_has_changes());
        assert!(!b.commitments.local_has_changes());
        assert_eq!(b.commitments.remote_secrets.get(0), Some(a.keys.per_commitment_secret(0).unwrap().secret_bytes()));
    }

    #[test]
    fn payment_above_balance_is_rejected() {
        let secp_ctx = Secp256k1::new();
        let (a, _b) = make_commitments_pair(&secp_ctx, &ChannelPairConfig::tiny(100_000));
        assert!(matches!(
            a.commitments.send_mono_hop_payment(100_001),
            Err(CommitmentsError::InsufficientFunds { .. })
        ));
        assert!(matches!(a.commitments.send_mono_hop_payment(0), Err(CommitmentsError::ZeroAmount)));
    }

    #[test]
    fn htlc_lifecycle() {
        let secp_ctx = Secp256k1::new();
        let (mut a, mut b) = make_commitments_pair(&secp_ctx, &ChannelPairConfig::default());
        let (a_start, b_start) = (a.commitments.local_balance_msat(), b.commitments.local_balance_msat());
        let preimage = PaymentPreimage([5; 32]);
        let (c, add) =
            a.commitments.send_add(10_000_000, preimage.payment_hash(), 600, make_onion()).unwrap();
        a.commitments = c;
        assert_eq!(a.commitments.htlc_status(HtlcDirection::Offered, 0), Some(HtlcStatus::Pending));
        b.commitments = b.commitments.receive_add(&add).unwrap();
        full_round(&secp_ctx, &mut a, &mut b);
        assert_eq!(b.commitments.local_commit.spec.htlcs.len(), 1);
        assert_eq!(a.commitments.local_commit.remote_htlc_sigs.len(), 1);

        let (c, fulfill) = b.commitments.send_fulfill(0, &preimage).unwrap();
        b.commitments = c;
        assert!(matches!(
            b.commitments.send_fail(0, vec![]),
            Err(CommitmentsError::HtlcAlreadySettling(0))
        ));
        let (c, htlc) = a.commitments.receive_fulfill(&fulfill).unwrap();
        a.commitments = c;
        assert_eq!(htlc.amount_msat, 10_000_000);
        assert_eq!(a.commitments.htlc_status(HtlcDirection::Offered, 0), Some(HtlcStatus::Fulfilled));
        full_round(&secp_ctx, &mut b, &mut a);

        assert_eq!(a.commitments.htlc_status(HtlcDirection::Offered, 0), Some(HtlcStatus::Settled));
        assert_eq!(b.commitments.htlc_status(HtlcDirection::Received, 0), Some(HtlcStatus::Settled));
        assert_eq!(a.commitments.htlc_status(HtlcDirection::Offered, 1), None);
        assert!(a.commitments.local_commit.spec.htlcs.is_empty());
        assert_eq!(a.commitments.local_balance_msat(), a_start - 10_000_000);
        assert_eq!(b.commitments.local_balance_msat(), b_start + 10_000_000);
    }

    #[test]
    fn fulfill_with_wrong_preimage_is_rejected() {
        let secp_ctx = Secp256k1::new();
        let (mut a, mut b) = make_commitments_pair(&secp_ctx, &ChannelPairConfig::default());
        let (c, add) = a
            .commitments
            .send_add(10_000_000, PaymentPreimage([5; 32]).payment_hash(), 600, make_onion())
            .unwrap();
        a.commitments = c;
        b.commitments = b.commitments.receive_add(&add).unwrap();
        full_round(&secp_ctx, &mut a, &mut b);
        assert!(matches!(
            b.commitments.send_fulfill(0, &PaymentPreimage([6; 32])),
            Err(CommitmentsError::InvalidPaymentPreimage(0))
        ));
        assert!(matches!(
            b.commitments.send_fail_malformed(0, [0; 32], 0x4000),
            Err(CommitmentsError::InvalidFailureCode(0x4000))
        ));
    }

    #[test]
    fn out_of_order_htlc_id_is_rejected() {
        let secp_ctx = Secp256k1::new();
        let (a, b) = make_commitments_pair(&secp_ctx, &ChannelPairConfig::default());
        let (_, mut add) =
            a.commitments.send_add(10_000_000, PaymentHash([1; 32]), 600, make_onion()).unwrap();
        add.id = 3;
        assert_eq!(
            b.commitments.receive_add(&add),
            Err(CommitmentsError::UnexpectedHtlcId { expected: 0, got: 3 })
        );
    }

    #[test]
    fn fee_update_respects_reserve() {
        let secp_ctx = Secp256k1::new();
        let config = ChannelPairConfig { reserve_sat: 10_000, ..ChannelPairConfig::default() };
        let (a, b) = make_commitments_pair(&secp_ctx, &config);
        let (c, fee) = a.commitments.send_fee(1000).unwrap();
        assert_eq!(c.local_changes.proposed.len(), 1);
        b.commitments.receive_fee(&fee).unwrap();
        // a fee that eats the whole balance
        assert!(matches!(a.commitments.send_fee(100_000_000), Err(CommitmentsError::CannotAffordFees { .. })));
        assert_eq!(b.commitments.send_fee(1000).unwrap_err(), CommitmentsError::FeeUpdateByNonFunder);
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let secp_ctx = Secp256k1::new();
        let (mut a, b) = make_commitments_pair(&secp_ctx, &ChannelPairConfig::default());
        let (c, payment) = a.commitments.send_mono_hop_payment(1_000_000).unwrap();
        a.commitments = c;
        let b_commitments = b.commitments.receive_mono_hop_payment(&payment).unwrap();
        let (_, mut commit) = a.commitments.send_commit(&secp_ctx, &a.keys).unwrap();
        commit.signature = b.commitments.local_commit.remote_sig;
        assert_eq!(
            b_commitments.receive_commit(&secp_ctx, &b.keys, &commit).unwrap_err(),
            CommitmentsError::InvalidCommitmentSignature(1)
        );
    }

    #[test]
    fn cannot_sign_twice_without_revocation() {
        let secp_ctx = Secp256k1::new();
        let (a, _b) = make_commitments_pair(&secp_ctx, &ChannelPairConfig::default());
        assert_eq!(
            a.commitments.send_commit(&secp_ctx, &a.keys).unwrap_err(),
            CommitmentsError::CannotSignWithoutChanges
        );
        let (c, _) = a.commitments.send_mono_hop_payment(1_000).unwrap();
        let (c, _) = c.send_commit(&secp_ctx, &a.keys).unwrap();
        let (c, _) = c.send_mono_hop_payment(1_000).unwrap();
        assert_eq!(c.send_commit(&secp_ctx, &a.keys).unwrap_err(), CommitmentsError::CannotSignBeforeRevocation);
    }

    #[test]
    fn bad_revocation_secret_is_rejected() {
        let secp_ctx = Secp256k1::new();
        let (a, b) = make_commitments_pair(&secp_ctx, &ChannelPairConfig::default());
        let (c, payment) = a.commitments.send_mono_hop_payment(1_000).unwrap();
        let (c, commit) = c.send_commit(&secp_ctx, &a.keys).unwrap();
        let bc = b.commitments.receive_mono_hop_payment(&payment).unwrap();
        let (_, mut revocation) = bc.receive_commit(&secp_ctx, &b.keys, &commit).unwrap();
        revocation.per_commitment_secret = [1; 32];
        assert_eq!(
            c.receive_revocation(&secp_ctx, &revocation).unwrap_err(),
            CommitmentsError::InvalidRevocation(0)
        );
    }

    #[test]
    fn discard_rolls_back_htlc_ids() {
        let secp_ctx = Secp256k1::new();
        let (a, _b) = make_commitments_pair(&secp_ctx, &ChannelPairConfig::default());
        let (c, _) = a.commitments.send_add(10_000_000, PaymentHash([1; 32]), 600, make_onion()).unwrap();
        assert_eq!(c.local_next_htlc_id, 1);
        let c = c.discard_unsigned_updates();
        assert_eq!(c.local_next_htlc_id, 0);
        assert!(c.local_changes.proposed.is_empty());
        assert_eq!(c, a.commitments);
    }

    #[test]
    fn reestablish_numbers() {
        let secp_ctx = Secp256k1::new();
        let (mut a, mut b) = make_commitments_pair(&secp_ctx, &ChannelPairConfig::default());
        let (c, payment) = a.commitments.send_mono_hop_payment(1_000).unwrap();
        a.commitments = c;
        b.commitments = b.commitments.receive_mono_hop_payment(&payment).unwrap();
        full_round(&secp_ctx, &mut a, &mut b);
        let msg = a.commitments.channel_reestablish(&secp_ctx, &a.keys).unwrap();
        assert_eq!(msg.next_commitment_number, 2);
        assert_eq!(msg.next_revocation_number, 1);
        assert_eq!(msg.your_last_per_commitment_secret, b.keys.per_commitment_secret(0).unwrap().secret_bytes());
        assert_eq!(msg.my_current_per_commitment_point, a.keys.per_commitment_point(&secp_ctx, 1).unwrap());
    }

    #[test]
    fn signed_commitment_spends_funding() {
        let secp_ctx = Secp256k1::new();
        let (a, _b) = make_commitments_pair(&secp_ctx, &ChannelPairConfig::default());
        let tx = a.commitments.signed_local_commitment_tx(&secp_ctx, &a.keys).unwrap();
        assert_eq!(tx.input[0].previous_output, a.commitments.funding.outpoint);
        assert_eq!(tx.input[0].witness.len(), 4);
        assert_eq!(
            crate::tx::tx::decode_commitment_number(&tx, a.commitments.obscure_factor()),
            Some(0)
        );
    }

    #[test]
    fn persisted_form_round_trips() {
        let secp_ctx = Secp256k1::new();
        let (mut a, mut b) = make_commitments_pair(&secp_ctx, &ChannelPairConfig::default());
        let (c, add) = a.commitments.send_add(10_000_000, PaymentHash([1; 32]), 600, make_onion()).unwrap();
        a.commitments = c;
        b.commitments = b.commitments.receive_add(&add).unwrap();
        let (c, _) = a.commitments.send_commit(&secp_ctx, &a.keys).unwrap();
        let json = serde_json::to_string(&c).unwrap();
        let back: Commitments = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }
}
