//! An established channel with a live peer.
//!
//! Every operation consumes the channel and returns a new value. A failed operation leaves
//! nothing behind that could be used with stale state: reload and reconnect to continue.
//! The channel is persisted after each local state transition and before the message that
//! depends on it is sent.

use bitcoin::secp256k1::{All, PublicKey, Secp256k1};
use bitcoin::{ScriptBuf, Transaction};
use log::{debug, error, info, warn};
use lnc_protocol::msgs::{Message, OnionPacket, Shutdown};
use tokio::time::timeout;

use crate::breach::{BreachError, ChannelBreachData};
use crate::channel::{ChannelId, NegotiatingState, SerializedChannel};
use crate::commitments::{Commitments, CommitmentsError, RemoteNextCommitInfo};
use crate::context::ChannelContext;
use crate::error::classified_error;
use crate::htlc::{Htlc, PaymentPreimage};
use crate::onion::{check_final_payload, FinalPayload, HtlcRejection, OnionError, PaymentRequest};
use crate::peer::{MessageTransport, PeerSession, RecvError, TransportError};
use crate::persist::{self, ChannelGuard};

#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    /// We could not build or sign our side
    #[error("commitments: {0}")]
    Commitments(CommitmentsError),
    #[error("invalid commitment_signed: {0}")]
    InvalidCommitment(CommitmentsError),
    #[error("invalid revoke_and_ack: {0}")]
    InvalidRevocation(CommitmentsError),
    #[error("breach data: {0}")]
    Breach(#[from] BreachError),
    #[error("store: {0}")]
    Store(#[from] persist::Error),
    #[error("send: {0}")]
    Send(#[from] TransportError),
    #[error("receive: {0}")]
    Recv(#[from] RecvError),
    #[error("expected {expected}, got {got}")]
    UnexpectedMessage { expected: &'static str, got: &'static str },
}

classified_error!(
    CommitError,
    wrapped: [Commitments, Breach, Store, Send, Recv],
    breakdown: [InvalidCommitment, InvalidRevocation, UnexpectedMessage],
    bug: [],
);

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("channel {0} is closing")]
    Closing(ChannelId),
    /// Our own update was refused before anything was sent
    #[error("update refused: {0}")]
    Rejected(CommitmentsError),
    #[error("invalid update from peer: {0}")]
    InvalidUpdate(CommitmentsError),
    #[error("payee {payee} is not our peer, multi-hop payments are not supported")]
    NoMultiHopHtlcSupport { payee: PublicKey },
    #[error("cltv expiry overflows at height {current_height} plus {delta}")]
    CltvExpiryOverflow { current_height: u32, delta: u16 },
    #[error("onion: {0}")]
    Onion(OnionError),
    #[error("stored onion of htlc {0} is invalid")]
    InvalidOnionPacket(u64),
    #[error("commit: {0}")]
    Commit(#[from] CommitError),
    #[error("store: {0}")]
    Store(#[from] persist::Error),
    #[error("send: {0}")]
    Send(#[from] TransportError),
    #[error("receive: {0}")]
    Recv(#[from] RecvError),
    #[error("expected {expected}, got {got}")]
    UnexpectedMessage { expected: &'static str, got: &'static str },
}

classified_error!(
    PaymentError,
    wrapped: [Rejected, Commit, Store, Send, Recv],
    breakdown: [InvalidUpdate, UnexpectedMessage],
    bug: [InvalidOnionPacket],
);

#[derive(Debug, thiserror::Error)]
pub enum RebroadcastError {
    #[error("peer offered htlc {id}, this channel only sends")]
    HtlcAddRejected { id: u64 },
    #[error("invalid update from peer: {0}")]
    InvalidUpdate(CommitmentsError),
    #[error("commit: {0}")]
    Commit(#[from] CommitError),
    #[error("store: {0}")]
    Store(#[from] persist::Error),
    #[error("receive: {0}")]
    Recv(#[from] RecvError),
    #[error("unexpected {0} while draining")]
    UnexpectedMessage(&'static str),
}

classified_error!(
    RebroadcastError,
    wrapped: [Commit, Store, Recv],
    breakdown: [InvalidUpdate, UnexpectedMessage],
    bug: [],
);

/// Result of [ActiveChannel::update_fee]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeeUpdate {
    Applied { feerate_per_kw: u32 },
    /// We could not afford the new fee. Nothing was sent and the state is unchanged.
    Skipped { feerate_per_kw: u32, reason: CommitmentsError },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HtlcFailure {
    /// The onion-encrypted failure reason
    Encrypted(Vec<u8>),
    Malformed { failure_code: u16 },
}

/// What became of an HTLC we sent
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HtlcOutcome {
    Pending { htlc_id: u64 },
    Fulfilled { htlc_id: u64, preimage: PaymentPreimage },
    Failed { htlc_id: u64, failure: HtlcFailure },
}

/// What we did with an HTLC we received
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SettleOutcome {
    Fulfilled(PaymentPreimage),
    Rejected(HtlcRejection),
    Malformed { failure_code: u16 },
}

/// Apply an update message from the peer, or None if `message` is not an update
fn apply_update(
    commitments: &Commitments,
    message: &Message,
) -> Option<Result<Commitments, CommitmentsError>> {
    Some(match message {
        Message::UpdateAddHtlc(m) => commitments.receive_add(m),
        Message::UpdateFulfillHtlc(m) => commitments.receive_fulfill(m).map(|(c, _)| c),
        Message::UpdateFailHtlc(m) => commitments.receive_fail(m).map(|(c, _)| c),
        Message::UpdateFailMalformedHtlc(m) => commitments.receive_fail_malformed(m).map(|(c, _)| c),
        Message::UpdateFee(m) => commitments.receive_fee(m),
        Message::MonoHopUnidirectionalPayment(m) => commitments.receive_mono_hop_payment(m),
        _ => return None,
    })
}

pub struct ActiveChannel<T: MessageTransport> {
    ctx: ChannelContext,
    session: PeerSession<T>,
    // boxed, every operation moves the channel through its futures
    channel: Box<SerializedChannel>,
    _guard: ChannelGuard,
}

impl<T: MessageTransport> ActiveChannel<T> {
    pub(crate) fn new(
        ctx: ChannelContext,
        session: PeerSession<T>,
        channel: SerializedChannel,
        guard: ChannelGuard,
    ) -> Self {
        ActiveChannel { ctx, session, channel: Box::new(channel), _guard: guard }
    }

    pub fn channel(&self) -> &SerializedChannel {
        &self.channel
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel.channel_id()
    }

    pub fn commitments(&self) -> &Commitments {
        &self.channel.commitments
    }

    pub(crate) fn secp_ctx(&self) -> &Secp256k1<All> {
        &self.ctx.secp_ctx
    }

    fn with_commitments(mut self, commitments: Commitments) -> Self {
        self.channel.commitments = commitments;
        self
    }

    pub(crate) fn save(&self) -> Result<(), persist::Error> {
        self.ctx.channel_store.save(&self.channel)
    }

    pub(crate) async fn send(&mut self, message: Message) -> Result<(), TransportError> {
        debug!("{} send {}", self.channel_id(), message.name());
        self.session.send_message(&message).await
    }

    pub(crate) async fn recv(&mut self) -> Result<Message, RecvError> {
        self.session.recv_channel_message().await
    }

    /// Log a protocol fault and tell the peer, best effort
    pub(crate) async fn report(&mut self, text: &str) {
        let channel_id = self.channel_id();
        error!("{}: {}", channel_id, text);
        if let Err(e) = self.session.send_error(text, Some(&channel_id)).await {
            warn!("{}: cannot send error to peer: {}", channel_id, e);
        }
    }

    fn check_open(&self) -> Result<(), PaymentError> {
        if self.channel.negotiating_state.is_some() {
            return Err(PaymentError::Closing(self.channel_id()));
        }
        Ok(())
    }

    /// Sign the peer's next commitment and send it, without waiting for the revocation
    async fn sign_next_commitment(self) -> Result<Self, CommitError> {
        let (commitments, commit) = self
            .channel
            .commitments
            .send_commit(&self.ctx.secp_ctx, &self.channel.keys)
            .map_err(CommitError::Commitments)?;
        let mut this = self.with_commitments(commitments);
        this.save()?;
        this.send(Message::CommitmentSigned(commit)).await?;
        Ok(this)
    }

    /// Sign our pending changes into the peer's next commitment and wait for the peer to
    /// revoke its current one
    #[tracing::instrument(skip_all, fields(channel_id = %self.channel_id()))]
    pub async fn send_commit(self) -> Result<Self, CommitError> {
        let mut this = self.sign_next_commitment().await?;
        match this.recv().await? {
            Message::RevokeAndAck(revocation) => this.apply_revocation(&revocation).await,
            m => {
                this.report(&format!("expected revoke_and_ack, got {}", m.name())).await;
                Err(CommitError::UnexpectedMessage { expected: "revoke_and_ack", got: m.name() })
            }
        }
    }

    /// Wait for the peer's signature on our next commitment and revoke the current one
    #[tracing::instrument(skip_all, fields(channel_id = %self.channel_id()))]
    pub async fn recv_commit(mut self) -> Result<Self, CommitError> {
        match self.recv().await? {
            Message::CommitmentSigned(commit) => self.apply_commitment_signed(&commit).await,
            m => {
                self.report(&format!("expected commitment_signed, got {}", m.name())).await;
                Err(CommitError::UnexpectedMessage { expected: "commitment_signed", got: m.name() })
            }
        }
    }

    pub(crate) async fn apply_commitment_signed(
        mut self,
        commit: &lnc_protocol::msgs::CommitmentSigned,
    ) -> Result<Self, CommitError> {
        let result =
            self.channel.commitments.receive_commit(&self.ctx.secp_ctx, &self.channel.keys, commit);
        let (commitments, revocation) = match result {
            Ok(r) => r,
            Err(e) => {
                self.report(&e.to_string()).await;
                return Err(CommitError::InvalidCommitment(e));
            }
        };
        let mut this = self.with_commitments(commitments);
        this.save()?;
        this.send(Message::RevokeAndAck(revocation)).await?;
        info!(
            "{} local commitment now {}",
            this.channel_id(),
            this.channel.commitments.local_commit.index
        );
        Ok(this)
    }

    /// Apply the peer's revocation. The penalty for the revoked commitment is persisted
    /// before the channel.
    pub(crate) async fn apply_revocation(
        mut self,
        revocation: &lnc_protocol::msgs::RevokeAndAck,
    ) -> Result<Self, CommitError> {
        let channel_id = self.channel_id();
        let (commitments, revoked) =
            match self.channel.commitments.receive_revocation(&self.ctx.secp_ctx, revocation) {
                Ok(r) => r,
                Err(e) => {
                    self.report(&e.to_string()).await;
                    return Err(CommitError::InvalidRevocation(e));
                }
            };
        let breach = self.ctx.breach_store.load(&channel_id)?;
        let updated = breach.insert_revoked_commitment(
            &self.ctx.secp_ctx,
            &revoked,
            &commitments,
            &self.channel.keys,
            &self.ctx.account.sweep_destination,
        )?;
        if updated != breach {
            self.ctx.breach_store.save(&updated)?;
        }
        let this = self.with_commitments(commitments);
        this.save()?;
        info!(
            "{} remote commitment {} revoked, now {}",
            channel_id, revoked.commitment.index, this.channel.commitments.remote_commit.index
        );
        this.notify_watch_tower(&updated, revoked.commitment.index).await;
        Ok(this)
    }

    async fn notify_watch_tower(&self, breach: &ChannelBreachData, commitment_number: u64) {
        let (Some(tower), Some(notice)) = (&self.ctx.watch_tower, breach.notice(commitment_number))
        else {
            return;
        };
        if let Err(e) = tower.notify(&notice).await {
            warn!(
                "{}: watch tower not told about commitment {}: {}",
                self.channel_id(),
                commitment_number,
                e
            );
        }
    }

    /// Initiator side of a round: our commitment_signed, their revoke, theirs, our revoke
    async fn sign_round(self) -> Result<Self, CommitError> {
        let this = Box::pin(self.send_commit()).await?;
        Box::pin(this.recv_commit()).await
    }

    /// Responder side of a round
    async fn countersign_round(self) -> Result<Self, CommitError> {
        let this = Box::pin(self.recv_commit()).await?;
        Box::pin(this.send_commit()).await
    }

    /// Persist the commitments already applied to `self`, then send the update
    async fn propose(mut self, message: Message) -> Result<Self, PaymentError> {
        self.save()?;
        self.send(message).await?;
        Ok(self)
    }

    /// Receive one update, which `extract` must recognize, and apply it
    async fn recv_update<R>(
        mut self,
        expected: &'static str,
        extract: impl FnOnce(&Message) -> Option<R>,
    ) -> Result<(Self, R), PaymentError> {
        let message = self.recv().await?;
        let Some(extracted) = extract(&message) else {
            self.report(&format!("expected {}, got {}", expected, message.name())).await;
            return Err(PaymentError::UnexpectedMessage { expected, got: message.name() });
        };
        match apply_update(&self.channel.commitments, &message) {
            Some(Ok(commitments)) => {
                let this = self.with_commitments(commitments);
                this.save()?;
                Ok((this, extracted))
            }
            Some(Err(e)) => {
                self.report(&e.to_string()).await;
                Err(PaymentError::InvalidUpdate(e))
            }
            None => Err(PaymentError::UnexpectedMessage { expected, got: message.name() }),
        }
    }

    pub async fn send_mono_hop_payment(self, amount_msat: u64) -> Result<Self, PaymentError> {
        self.check_open()?;
        let (commitments, payment) = self
            .channel
            .commitments
            .send_mono_hop_payment(amount_msat)
            .map_err(PaymentError::Rejected)?;
        let this = self
            .with_commitments(commitments)
            .propose(Message::MonoHopUnidirectionalPayment(payment))
            .await?;
        let this = this.sign_round().await?;
        info!("{} sent {} msat", this.channel_id(), amount_msat);
        Ok(this)
    }

    /// Returns the amount received
    pub async fn recv_mono_hop_payment(self) -> Result<(Self, u64), PaymentError> {
        let (this, amount_msat) = self
            .recv_update("mono_hop_unidirectional_payment", |m| match m {
                Message::MonoHopUnidirectionalPayment(p) => Some(p.amount_msat),
                _ => None,
            })
            .await?;
        let this = this.countersign_round().await?;
        info!("{} received {} msat", this.channel_id(), amount_msat);
        Ok((this, amount_msat))
    }

    /// Pay `request` with an HTLC. The payee must be our peer.
    ///
    /// With `wait_for_result`, also wait for the peer to fulfill or fail the HTLC.
    pub async fn send_htlc_payment(
        self,
        request: &PaymentRequest,
        current_height: u32,
        wait_for_result: bool,
    ) -> Result<(Self, HtlcOutcome), PaymentError> {
        self.check_open()?;
        if request.payee != *self.session.remote_node_id() {
            return Err(PaymentError::NoMultiHopHtlcSupport { payee: request.payee });
        }
        let delta = request.min_final_cltv_expiry_delta;
        let cltv_expiry = current_height
            .checked_add(u32::from(delta))
            .ok_or(PaymentError::CltvExpiryOverflow { current_height, delta })?;
        let payload = FinalPayload {
            amount_msat: Some(request.amount_msat),
            cltv_expiry: Some(cltv_expiry),
            payment_secret: request.payment_secret,
        };
        let onion = self
            .ctx
            .onion
            .build_single_hop(&request.payee, &payload, &request.payment_hash)
            .map_err(PaymentError::Onion)?;
        let (commitments, add) = self
            .channel
            .commitments
            .send_add(request.amount_msat, request.payment_hash, cltv_expiry, onion)
            .map_err(PaymentError::Rejected)?;
        let htlc_id = add.id;
        let this = self
            .with_commitments(commitments)
            .propose(Message::UpdateAddHtlc(add))
            .await?;
        let this = this.sign_round().await?;
        info!("{} htlc {} for {} committed", this.channel_id(), htlc_id, request.payment_hash);
        if !wait_for_result {
            return Ok((this, HtlcOutcome::Pending { htlc_id }));
        }
        this.recv_htlc_result().await
    }

    /// Wait for the peer to fulfill or fail one of our HTLCs
    pub async fn recv_htlc_result(self) -> Result<(Self, HtlcOutcome), PaymentError> {
        let (this, outcome) = self
            .recv_update("htlc fulfill or fail", |m| match m {
                Message::UpdateFulfillHtlc(f) => Some(HtlcOutcome::Fulfilled {
                    htlc_id: f.id,
                    preimage: PaymentPreimage(f.payment_preimage),
                }),
                Message::UpdateFailHtlc(f) => Some(HtlcOutcome::Failed {
                    htlc_id: f.id,
                    failure: HtlcFailure::Encrypted(f.reason.clone()),
                }),
                Message::UpdateFailMalformedHtlc(f) => Some(HtlcOutcome::Failed {
                    htlc_id: f.id,
                    failure: HtlcFailure::Malformed { failure_code: f.failure_code },
                }),
                _ => None,
            })
            .await?;
        let this = this.countersign_round().await?;
        info!("{} {:?}", this.channel_id(), outcome);
        Ok((this, outcome))
    }

    /// Receive an HTLC and commit to it. Settle it with [Self::settle_incoming_htlc].
    pub async fn recv_htlc_payment(self) -> Result<(Self, Htlc), PaymentError> {
        let (this, htlc) = self
            .recv_update("update_add_htlc", |m| match m {
                Message::UpdateAddHtlc(add) =>
                    Some(Htlc::from_add(add, crate::htlc::HtlcDirection::Received)),
                _ => None,
            })
            .await?;
        let this = this.countersign_round().await?;
        info!("{} received htlc {} for {}", this.channel_id(), htlc.id, htlc.payment_hash);
        Ok((this, htlc))
    }

    /// Fulfill a received HTLC if we are its final hop and know the preimage, fail it otherwise
    pub async fn settle_incoming_htlc(self, htlc: &Htlc) -> Result<(Self, SettleOutcome), PaymentError> {
        let packet = OnionPacket::from_slice(&htlc.onion_routing_packet)
            .map_err(|_| PaymentError::InvalidOnionPacket(htlc.id))?;
        let peeled = match self.ctx.onion.peel(&packet, &htlc.payment_hash) {
            Ok(peeled) => peeled,
            Err(OnionError::Malformed { failure_code, sha256_of_onion }) => {
                info!("{} htlc {} has a malformed onion", self.channel_id(), htlc.id);
                let this = self.fail_malformed_htlc(htlc.id, sha256_of_onion, failure_code).await?;
                return Ok((this, SettleOutcome::Malformed { failure_code }));
            }
            Err(e) => return Err(PaymentError::Onion(e)),
        };
        let expected = self.ctx.payments.lookup(&htlc.payment_hash);
        let checked = check_final_payload(&peeled, htlc.amount_msat, expected.as_ref())
            .and_then(|()| expected.map(|p| p.preimage).ok_or(HtlcRejection::UnknownPaymentHash));
        match checked {
            Ok(preimage) => {
                let (commitments, fulfill) = self
                    .channel
                    .commitments
                    .send_fulfill(htlc.id, &preimage)
                    .map_err(PaymentError::Rejected)?;
                let this = self
                    .with_commitments(commitments)
                    .propose(Message::UpdateFulfillHtlc(fulfill))
                    .await?;
                let this = this.sign_round().await?;
                this.ctx.payments.settled(&htlc.payment_hash, htlc.amount_msat);
                info!("{} fulfilled htlc {}", this.channel_id(), htlc.id);
                Ok((this, SettleOutcome::Fulfilled(preimage)))
            }
            Err(rejection) => {
                info!("{} rejecting htlc {}: {:?}", self.channel_id(), htlc.id, rejection);
                let reason = self.ctx.onion.encrypt_failure(&packet, rejection.failure_code());
                let this = self.fail_htlc(htlc.id, reason).await?;
                Ok((this, SettleOutcome::Rejected(rejection)))
            }
        }
    }

    pub async fn fail_htlc(self, htlc_id: u64, reason: Vec<u8>) -> Result<Self, PaymentError> {
        let (commitments, fail) =
            self.channel.commitments.send_fail(htlc_id, reason).map_err(PaymentError::Rejected)?;
        let this = self
            .with_commitments(commitments)
            .propose(Message::UpdateFailHtlc(fail))
            .await?;
        Ok(this.sign_round().await?)
    }

    pub async fn fail_malformed_htlc(
        self,
        htlc_id: u64,
        sha256_of_onion: [u8; 32],
        failure_code: u16,
    ) -> Result<Self, PaymentError> {
        let (commitments, fail) = self
            .channel
            .commitments
            .send_fail_malformed(htlc_id, sha256_of_onion, failure_code)
            .map_err(PaymentError::Rejected)?;
        let this = self
            .with_commitments(commitments)
            .propose(Message::UpdateFailMalformedHtlc(fail))
            .await?;
        Ok(this.sign_round().await?)
    }

    /// Propose a new feerate. If we could not afford it, nothing happens and
    /// [FeeUpdate::Skipped] is returned.
    pub async fn update_fee(self, feerate_per_kw: u32) -> Result<(Self, FeeUpdate), PaymentError> {
        self.check_open()?;
        match self.channel.commitments.send_fee(feerate_per_kw) {
            Ok((commitments, fee)) => {
                let this = self
                    .with_commitments(commitments)
                    .propose(Message::UpdateFee(fee))
                    .await?;
                let this = this.sign_round().await?;
                info!("{} feerate now {}", this.channel_id(), feerate_per_kw);
                Ok((this, FeeUpdate::Applied { feerate_per_kw }))
            }
            Err(
                reason @ (CommitmentsError::CannotAffordFees { .. }
                | CommitmentsError::InsufficientFunds { .. }),
            ) => {
                info!("{} fee update to {} skipped: {}", self.channel_id(), feerate_per_kw, reason);
                Ok((self, FeeUpdate::Skipped { feerate_per_kw, reason }))
            }
            Err(e) => Err(PaymentError::Rejected(e)),
        }
    }

    /// Returns the accepted feerate
    pub async fn accept_update_fee(self) -> Result<(Self, u32), PaymentError> {
        let (this, feerate_per_kw) = self
            .recv_update("update_fee", |m| match m {
                Message::UpdateFee(fee) => Some(fee.feerate_per_kw),
                _ => None,
            })
            .await?;
        let this = this.countersign_round().await?;
        info!("{} feerate now {}", this.channel_id(), feerate_per_kw);
        Ok((this, feerate_per_kw))
    }

    /// Process what the peer sends after a reconnection until it stays silent for the
    /// rebroadcast timeout. HTLC additions are refused.
    #[tracing::instrument(skip_all, fields(channel_id = %self.channel_id()))]
    pub async fn handle_rebroadcast_updates(self) -> Result<Self, RebroadcastError> {
        let mut this = self;
        let mut drained = 0usize;
        loop {
            let message = match timeout(this.ctx.rebroadcast_timeout, this.recv()).await {
                Err(_elapsed) => break,
                Ok(received) => received?,
            };
            drained += 1;
            this = this.drain_one(message).await?;
        }
        info!("{} converged after draining {} messages", this.channel_id(), drained);
        Ok(this)
    }

    /// Apply what the peer retransmits until it revokes our pending commitment
    pub(crate) async fn recv_until_revocation(self) -> Result<Self, RebroadcastError> {
        let mut this = self;
        loop {
            let message = this.recv().await?;
            let revocation = matches!(message, Message::RevokeAndAck(_));
            this = this.drain_one(message).await?;
            if revocation {
                return Ok(this);
            }
        }
    }

    async fn drain_one(mut self, message: Message) -> Result<Self, RebroadcastError> {
        debug!("{} drained {}", self.channel_id(), message.name());
        match message {
            Message::UpdateAddHtlc(add) => {
                self.report("htlc additions are not accepted on this channel").await;
                Err(RebroadcastError::HtlcAddRejected { id: add.id })
            }
            Message::CommitmentSigned(commit) => {
                let this = self.apply_commitment_signed(&commit).await?;
                let can_sign = matches!(
                    this.channel.commitments.remote_next_commit_info,
                    RemoteNextCommitInfo::Revoked(_)
                );
                if can_sign && this.channel.commitments.local_has_changes() {
                    Ok(this.sign_next_commitment().await?)
                } else {
                    Ok(this)
                }
            }
            Message::RevokeAndAck(revocation) => Ok(self.apply_revocation(&revocation).await?),
            Message::Shutdown(shutdown) => {
                let script = ScriptBuf::from_bytes(shutdown.scriptpubkey);
                info!("{} peer wants to close to {}", self.channel_id(), script);
                self.channel
                    .negotiating_state
                    .get_or_insert(NegotiatingState {
                        local_shutdown_script: None,
                        remote_shutdown_script: None,
                    })
                    .remote_shutdown_script = Some(script);
                self.save()?;
                Ok(self)
            }
            Message::FundingLocked(_) => Ok(self),
            m => match apply_update(&self.channel.commitments, &m) {
                Some(Ok(commitments)) => {
                    let this = self.with_commitments(commitments);
                    this.save()?;
                    Ok(this)
                }
                Some(Err(e)) => {
                    self.report(&e.to_string()).await;
                    Err(RebroadcastError::InvalidUpdate(e))
                }
                None => {
                    self.report(&format!("unexpected {}", m.name())).await;
                    Err(RebroadcastError::UnexpectedMessage(m.name()))
                }
            },
        }
    }

    /// Start a cooperative close. The channel refuses new updates from now on.
    pub async fn send_shutdown(self, script: ScriptBuf) -> Result<Self, PaymentError> {
        let mut this = self;
        let channel_id = this.channel_id();
        this.channel
            .negotiating_state
            .get_or_insert(NegotiatingState { local_shutdown_script: None, remote_shutdown_script: None })
            .local_shutdown_script = Some(script.clone());
        this.save()?;
        this.send(Message::Shutdown(Shutdown { channel_id: channel_id.0, scriptpubkey: script.to_bytes() }))
            .await?;
        info!("{} shutdown sent", channel_id);
        Ok(this)
    }

    /// Our latest commitment transaction, signed and ready to broadcast
    pub async fn force_close(mut self) -> Result<Transaction, CommitError> {
        let tx = self.channel.force_close_tx(&self.ctx.secp_ctx).map_err(CommitError::Commitments)?;
        info!("{} force-closing with {}", self.channel_id(), tx.compute_txid());
        self.report("force-closing").await;
        Ok(tx)
    }
}
