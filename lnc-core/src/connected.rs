//! Reconnection to the peer of a persisted channel.
//!
//! [ConnectedChannel::reestablish] exchanges `channel_reestablish`, retransmits what the peer
//! missed and, if we were waiting for a revocation, applies it. The result is an
//! [ActiveChannel].

use bitcoin::secp256k1::{All, Secp256k1};
use log::{debug, error, info};
use lnc_protocol::msgs::{ChannelReestablish, Message};

use crate::active::{ActiveChannel, RebroadcastError};
use crate::channel::{ChannelId, SerializedChannel};
use crate::commitments::{CommitmentsError, RemoteNextCommitInfo};
use crate::context::ChannelContext;
use crate::error::{classified_error, ClassifiedError};
use crate::peer::{MessageTransport, PeerSession, RecvError, TransportConnector, TransportError};
use crate::persist::{self, ChannelGuard};

#[derive(Debug, thiserror::Error)]
pub enum ReestablishError {
    #[error("channel {0} already has a live session")]
    AlreadyLive(ChannelId),
    #[error("store: {0}")]
    Store(#[from] persist::Error),
    #[error("connect: {0}")]
    Connect(TransportError),
    #[error("send: {0}")]
    Send(#[from] TransportError),
    #[error("receive: {0}")]
    Recv(#[from] RecvError),
    #[error("expected {expected}, got {got}")]
    UnexpectedMessage { expected: &'static str, got: &'static str },
    #[error("channel_reestablish for channel {0}")]
    WrongChannel(ChannelId),
    #[error("peer sent a wrong secret for our commitment {commitment_number}")]
    InvalidReestablishSecret { commitment_number: u64 },
    /// The peer knows a newer state than ours. Never force-close on this.
    #[error("local state behind the peer: our {field} is {ours}, peer says {theirs}")]
    LocalOutOfSync { field: &'static str, ours: u64, theirs: u64 },
    #[error("peer state behind ours: our {field} is {ours}, peer says {theirs}")]
    RemoteOutOfSync { field: &'static str, ours: u64, theirs: u64 },
    #[error("commitments: {0}")]
    Commitments(CommitmentsError),
    #[error("resync: {0}")]
    Resync(#[from] RebroadcastError),
}

classified_error!(
    ReestablishError,
    wrapped: [Store, Connect, Send, Recv, Commitments, Resync],
    breakdown: [UnexpectedMessage, WrongChannel, InvalidReestablishSecret, RemoteOutOfSync],
    bug: [LocalOutOfSync],
);

/// What reestablishment had to do
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Names of the messages sent again, in order
    pub retransmitted: Vec<&'static str>,
    pub received_revocation: bool,
}

struct Resync {
    messages: Vec<Message>,
    await_revocation: bool,
}

/// Decide what to retransmit from the peer's `channel_reestablish`
fn plan_resync(
    secp_ctx: &Secp256k1<All>,
    channel: &SerializedChannel,
    theirs: &ChannelReestablish,
) -> Result<Resync, ReestablishError> {
    let c = &channel.commitments;
    let local_index = c.local_commit.index;
    let next_revocation = theirs.next_revocation_number;

    if next_revocation > 0 {
        let revealed = next_revocation - 1;
        let expected = channel
            .keys
            .per_commitment_secret(revealed)
            .map_err(|e| ReestablishError::Commitments(e.into()))?;
        if expected.secret_bytes() != theirs.your_last_per_commitment_secret {
            return Err(ReestablishError::InvalidReestablishSecret { commitment_number: revealed });
        }
    }

    let revocation = if next_revocation == local_index {
        None
    } else if next_revocation + 1 == local_index {
        let revocation = c
            .revocation_for(secp_ctx, &channel.keys, next_revocation)
            .map_err(ReestablishError::Commitments)?;
        Some(Message::RevokeAndAck(revocation))
    } else if next_revocation > local_index {
        return Err(ReestablishError::LocalOutOfSync {
            field: "next_revocation_number",
            ours: local_index,
            theirs: next_revocation,
        });
    } else {
        return Err(ReestablishError::RemoteOutOfSync {
            field: "next_revocation_number",
            ours: local_index,
            theirs: next_revocation,
        });
    };

    let next_commitment = theirs.next_commitment_number;
    let out_of_sync = |expected: u64| {
        if next_commitment < expected {
            ReestablishError::RemoteOutOfSync {
                field: "next_commitment_number",
                ours: expected,
                theirs: next_commitment,
            }
        } else {
            ReestablishError::LocalOutOfSync {
                field: "next_commitment_number",
                ours: expected,
                theirs: next_commitment,
            }
        }
    };
    let (commit, await_revocation, revoke_first) = match &c.remote_next_commit_info {
        RemoteNextCommitInfo::Waiting(waiting) => {
            let pending = waiting.next_remote_commit.index;
            if next_commitment == pending {
                // the peer never got our signature, send it again with what it covers
                let mut messages: Vec<Message> =
                    c.local_changes.signed.iter().map(|u| u.to_message()).collect();
                messages.push(Message::CommitmentSigned(waiting.sent.clone()));
                let revoke_first = waiting.sent_after_local_commit_index >= local_index;
                (messages, true, revoke_first)
            } else if next_commitment == pending + 1 {
                (vec![], true, true)
            } else {
                return Err(out_of_sync(pending + 1));
            }
        }
        RemoteNextCommitInfo::Revoked(_) => {
            let expected = c.remote_commit.index + 1;
            if next_commitment != expected {
                return Err(out_of_sync(expected));
            }
            (vec![], false, true)
        }
    };

    let mut messages = Vec::new();
    if revoke_first {
        messages.extend(revocation);
        messages.extend(commit);
    } else {
        messages.extend(commit);
        messages.extend(revocation);
    }
    Ok(Resync { messages, await_revocation })
}

/// A persisted channel with a fresh peer session, not yet synchronized
pub struct ConnectedChannel<T: MessageTransport> {
    ctx: ChannelContext,
    session: PeerSession<T>,
    channel: SerializedChannel,
    guard: ChannelGuard,
}

impl<T: MessageTransport> ConnectedChannel<T> {
    /// Load the channel and connect to its peer.
    ///
    /// Fails with [ReestablishError::AlreadyLive] if another session holds the channel.
    /// Updates that were never signed are dropped, the peer will not see them again.
    pub async fn connect<C>(
        ctx: ChannelContext,
        connector: &C,
        channel_id: &ChannelId,
    ) -> Result<Self, ReestablishError>
    where
        C: TransportConnector<Transport = T>,
    {
        let guard =
            ctx.locks.try_lock(channel_id).map_err(|_| ReestablishError::AlreadyLive(*channel_id))?;
        let loaded = ctx.channel_store.load(channel_id)?;
        let mut channel = loaded.clone();
        channel.commitments = loaded.commitments.discard_unsigned_updates();
        if channel != loaded {
            debug!("{} dropping unsigned updates", channel_id);
            ctx.channel_store.save(&channel)?;
        }
        let transport = connector
            .connect(&channel.remote_node_id, &channel.remote_address)
            .await
            .map_err(ReestablishError::Connect)?;
        let session = PeerSession::handshake(transport, channel.remote_node_id).await?;
        info!("{} connected to {} at {}", channel_id, channel.remote_node_id, channel.remote_address);
        Ok(ConnectedChannel { ctx, session, channel, guard })
    }

    pub fn channel(&self) -> &SerializedChannel {
        &self.channel
    }

    #[tracing::instrument(skip_all, fields(channel_id = %self.channel.channel_id()))]
    pub async fn reestablish(self) -> Result<(ActiveChannel<T>, SyncReport), ReestablishError> {
        let ConnectedChannel { ctx, session, channel, guard } = self;
        let channel_id = channel.channel_id();
        let ours = channel
            .commitments
            .channel_reestablish(&ctx.secp_ctx, &channel.keys)
            .map_err(ReestablishError::Commitments)?;
        let mut active = ActiveChannel::new(ctx, session, channel, guard);
        active.send(Message::ChannelReestablish(ours)).await?;

        let theirs = loop {
            match active.recv().await? {
                Message::ChannelReestablish(theirs) => break theirs,
                Message::FundingLocked(_) => debug!("{} funding_locked before reestablish", channel_id),
                m => {
                    active.report(&format!("expected channel_reestablish, got {}", m.name())).await;
                    return Err(ReestablishError::UnexpectedMessage {
                        expected: "channel_reestablish",
                        got: m.name(),
                    });
                }
            }
        };
        if theirs.channel_id != channel_id.0 {
            active.report("channel_reestablish for another channel").await;
            return Err(ReestablishError::WrongChannel(ChannelId(theirs.channel_id)));
        }
        debug!(
            "{} peer expects commitment {} and revocation {}",
            channel_id, theirs.next_commitment_number, theirs.next_revocation_number
        );

        let plan = match plan_resync(active.secp_ctx(), active.channel(), &theirs) {
            Ok(plan) => plan,
            Err(e) => {
                if e.channel_breakdown() {
                    active.report(&e.message()).await;
                } else {
                    error!("{}: {}", channel_id, e);
                }
                return Err(e);
            }
        };

        let mut report = SyncReport::default();
        for message in plan.messages {
            debug!("{} retransmitting {}", channel_id, message.name());
            report.retransmitted.push(message.name());
            active.send(message).await?;
        }
        if plan.await_revocation {
            active = active.recv_until_revocation().await?;
            report.received_revocation = true;
        }
        active.save()?;
        info!(
            "{} reestablished at local {} remote {}, {} retransmitted",
            channel_id,
            active.commitments().local_commit.index,
            active.commitments().remote_commit.index,
            report.retransmitted.len()
        );
        Ok((active, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_utils::{connect_pair, make_channel_pair, make_envs, ChannelPairConfig};

    fn tiny_pair() -> (SerializedChannel, SerializedChannel) {
        make_channel_pair(&Secp256k1::new(), &ChannelPairConfig::tiny(100_000))
    }

    #[test_log::test(tokio::test)]
    async fn matching_state_needs_no_retransmission() {
        let envs = make_envs();
        let (a, b) = tiny_pair();
        let (a, b) = connect_pair(&envs, a, b).await;
        let (a, b) = tokio::join!(a.reestablish(), b.reestablish());
        let (_a, report_a) = a.unwrap();
        let (_b, report_b) = b.unwrap();
        assert_eq!(report_a, SyncReport::default());
        assert_eq!(report_b, SyncReport::default());
    }

    #[test_log::test(tokio::test)]
    async fn lost_revocation_is_retransmitted() {
        let secp_ctx = Secp256k1::new();
        let envs = make_envs();
        let (mut a, mut b) = tiny_pair();
        let (a1, payment) = a.commitments.send_mono_hop_payment(10_000).unwrap();
        let b1 = b.commitments.receive_mono_hop_payment(&payment).unwrap();
        let (a2, commit_a) = a1.send_commit(&secp_ctx, &a.keys).unwrap();
        let (b2, revoke_b) = b1.receive_commit(&secp_ctx, &b.keys, &commit_a).unwrap();
        let (a3, _) = a2.receive_revocation(&secp_ctx, &revoke_b).unwrap();
        let (b3, commit_b) = b2.send_commit(&secp_ctx, &b.keys).unwrap();
        // a's revocation never reaches b
        let (a4, _lost) = a3.receive_commit(&secp_ctx, &a.keys, &commit_b).unwrap();
        a.commitments = a4;
        b.commitments = b3;

        let (a, b) = connect_pair(&envs, a, b).await;
        let (a, b) = tokio::join!(a.reestablish(), b.reestablish());
        let (a, report_a) = a.unwrap();
        let (b, report_b) = b.unwrap();
        assert_eq!(report_a.retransmitted, vec!["revoke_and_ack"]);
        assert!(!report_a.received_revocation);
        assert_eq!(report_b, SyncReport { retransmitted: vec![], received_revocation: true });
        assert_eq!(b.commitments().remote_commit.index, 1);
        assert!(matches!(b.commitments().remote_next_commit_info, RemoteNextCommitInfo::Revoked(_)));
        assert_eq!(a.commitments().local_commit.index, 1);
        assert_eq!(b.commitments().local_balance_msat(), 10_000);
    }

    #[test_log::test(tokio::test)]
    async fn lost_commitment_is_retransmitted_with_its_updates() {
        let secp_ctx = Secp256k1::new();
        let envs = make_envs();
        let (mut a, b) = tiny_pair();
        let (a1, _payment) = a.commitments.send_mono_hop_payment(10_000).unwrap();
        let (a2, _commit) = a1.send_commit(&secp_ctx, &a.keys).unwrap();
        a.commitments = a2;

        let (a, b) = connect_pair(&envs, a, b).await;
        let sender = async {
            let (a, report) = a.reestablish().await.unwrap();
            (a.handle_rebroadcast_updates().await.unwrap(), report)
        };
        let receiver = async {
            let (b, report) = b.reestablish().await.unwrap();
            (b.handle_rebroadcast_updates().await.unwrap(), report)
        };
        let ((a, report_a), (b, report_b)) = tokio::join!(sender, receiver);
        assert_eq!(report_a.retransmitted, vec!["mono_hop_unidirectional_payment", "commitment_signed"]);
        assert!(report_a.received_revocation);
        assert!(report_b.retransmitted.is_empty());
        for side in [a.commitments(), b.commitments()] {
            assert_eq!(side.local_commit.index, 1);
            assert_eq!(side.remote_commit.index, 1);
        }
        assert_eq!(a.commitments().local_balance_msat(), 90_000);
        assert_eq!(b.commitments().local_balance_msat(), 10_000);
    }

    #[test_log::test(tokio::test)]
    async fn stale_peer_is_remote_out_of_sync() {
        let secp_ctx = Secp256k1::new();
        let envs = make_envs();
        let (mut a, b) = tiny_pair();
        let stale_b = b.clone();
        let mut b = b;
        let (a1, payment) = a.commitments.send_mono_hop_payment(10_000).unwrap();
        let b1 = b.commitments.receive_mono_hop_payment(&payment).unwrap();
        let (a2, commit_a) = a1.send_commit(&secp_ctx, &a.keys).unwrap();
        let (b2, revoke_b) = b1.receive_commit(&secp_ctx, &b.keys, &commit_a).unwrap();
        let (a3, _) = a2.receive_revocation(&secp_ctx, &revoke_b).unwrap();
        let (b3, commit_b) = b2.send_commit(&secp_ctx, &b.keys).unwrap();
        let (a4, revoke_a) = a3.receive_commit(&secp_ctx, &a.keys, &commit_b).unwrap();
        b.commitments = b3.receive_revocation(&secp_ctx, &revoke_a).unwrap().0;
        a.commitments = a4;
        assert_eq!(b.commitments.local_commit.index, 1);

        let (a, b) = connect_pair(&envs, a, stale_b).await;
        let (a, b) = tokio::join!(a.reestablish(), b.reestablish());
        let a_err = a.err().unwrap();
        assert!(matches!(a_err, ReestablishError::RemoteOutOfSync { field: "next_commitment_number", ours: 2, theirs: 1 }));
        assert!(a_err.channel_breakdown());
        let b_err = b.err().unwrap();
        assert!(matches!(b_err, ReestablishError::LocalOutOfSync { field: "next_revocation_number", ours: 0, theirs: 1 }));
        assert!(!b_err.channel_breakdown());
        assert!(b_err.possible_bug());
    }

    #[test_log::test(tokio::test)]
    async fn one_session_per_channel() {
        let envs = make_envs();
        let (a, b) = tiny_pair();
        let id = a.channel_id();
        let (_a, _b) = connect_pair(&envs, a, b).await;
        let (second, _) = crate::util::test_utils::memory_connector_pair();
        let err = ConnectedChannel::connect(envs.a.ctx.clone(), &second, &id).await.err().unwrap();
        assert!(matches!(err, ReestablishError::AlreadyLive(c) if c == id));
    }
}
