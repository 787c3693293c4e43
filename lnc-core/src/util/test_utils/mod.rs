mod fakes;
mod transport;

pub use fakes::{FakeChain, FakeOnion, FakePaymentRegistry, FakeWatchTower};
pub use transport::{memory_connector_pair, memory_transport_pair, MemoryConnector, MemoryTransport};

use std::sync::Arc;
use std::time::Duration;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, WPubkeyHash,
    Witness,
};
use lightning::ln::chan_utils::make_funding_redeemscript;
use lnc_protocol::msgs::{OnionPacket, ONION_PACKET_LEN};

use crate::active::ActiveChannel;
use crate::channel::{ChannelId, SerializedChannel};
use crate::commitments::{
    ChannelConstraints, CommitmentSpec, Commitments, FundingInfo, LocalCommit, RemoteCommit,
    RemoteNextCommitInfo, RevokedCommitment,
};
use crate::connected::ConnectedChannel;
use crate::context::{Account, ChannelContext};
use crate::keys::ChannelKeys;
use crate::peer::PeerSession;
use crate::persist::{ChannelLocks, ChannelStore, MemoryStore};
use crate::tx::script::p2wsh;

/// Parameters of a freshly opened test channel. Side A is the funder.
#[derive(Clone, Debug)]
pub struct ChannelPairConfig {
    pub funding_sat: u64,
    /// A's initial balance, B gets the rest
    pub funder_balance_msat: u64,
    pub feerate_per_kw: u32,
    pub dust_limit_sat: u64,
    pub reserve_sat: u64,
    pub to_self_delay: u16,
    pub max_accepted_htlcs: u16,
    pub htlc_minimum_msat: u64,
    pub min_depth: u32,
}

impl Default for ChannelPairConfig {
    fn default() -> Self {
        ChannelPairConfig {
            funding_sat: 1_000_000,
            funder_balance_msat: 700_000_000,
            feerate_per_kw: 253,
            dust_limit_sat: 546,
            reserve_sat: 0,
            to_self_delay: 144,
            max_accepted_htlcs: 30,
            htlc_minimum_msat: 1,
            min_depth: 3,
        }
    }
}

impl ChannelPairConfig {
    /// No fees and no dust limit, all of `funding_msat` on A's side
    pub fn tiny(funding_msat: u64) -> Self {
        ChannelPairConfig {
            funding_sat: funding_msat / 1000,
            funder_balance_msat: funding_msat,
            feerate_per_kw: 0,
            dust_limit_sat: 0,
            reserve_sat: 0,
            ..Default::default()
        }
    }

    fn constraints(&self) -> ChannelConstraints {
        ChannelConstraints {
            local_dust_limit_sat: self.dust_limit_sat,
            remote_dust_limit_sat: self.dust_limit_sat,
            local_to_self_delay: self.to_self_delay,
            remote_to_self_delay: self.to_self_delay,
            local_reserve_sat: self.reserve_sat,
            remote_reserve_sat: self.reserve_sat,
            local_htlc_minimum_msat: self.htlc_minimum_msat,
            remote_htlc_minimum_msat: self.htlc_minimum_msat,
            local_max_accepted_htlcs: self.max_accepted_htlcs,
            remote_max_accepted_htlcs: self.max_accepted_htlcs,
        }
    }
}

/// One side's commitments with the keys that sign them
#[derive(Clone, Debug)]
pub struct TestChannelSide {
    pub commitments: Commitments,
    pub keys: ChannelKeys,
}

pub fn node_id(n: u8) -> PublicKey {
    PublicKey::from_secret_key(&Secp256k1::new(), &SecretKey::from_slice(&[n; 32]).unwrap())
}

pub fn sweep_script() -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([0x42; 20]))
}

pub fn make_onion() -> OnionPacket {
    OnionPacket(Box::new([0u8; ONION_PACKET_LEN]))
}

fn make_funding_tx(redeemscript: &Script, amount_sat: u64) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint { txid: Txid::from_byte_array([0x24; 32]), vout: 0 },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(amount_sat),
            script_pubkey: p2wsh(redeemscript),
        }],
    }
}

/// The transaction whose first output funds the channel
pub fn funding_tx(commitments: &Commitments) -> Transaction {
    make_funding_tx(&commitments.funding_redeemscript(), commitments.funding.amount_sat)
}

fn initial_commitments(
    secp_ctx: &Secp256k1<All>,
    config: &ChannelPairConfig,
    funding: FundingInfo,
    is_funder: bool,
    keys: &ChannelKeys,
    remote_keys: &ChannelKeys,
) -> Commitments {
    let funding_msat = funding.amount_sat * 1000;
    let funder_spec = CommitmentSpec {
        htlcs: vec![],
        feerate_per_kw: config.feerate_per_kw,
        to_local_msat: config.funder_balance_msat,
        to_remote_msat: funding_msat - config.funder_balance_msat,
    };
    let fundee_spec = CommitmentSpec {
        to_local_msat: funder_spec.to_remote_msat,
        to_remote_msat: funder_spec.to_local_msat,
        ..funder_spec.clone()
    };
    let (spec, remote_spec) =
        if is_funder { (funder_spec, fundee_spec) } else { (fundee_spec, funder_spec) };
    let remote_point = |n| remote_keys.per_commitment_point(secp_ctx, n).unwrap();
    // replaced once the counterparty has signed
    let placeholder_sig =
        secp_ctx.sign_ecdsa(&Message::from_digest([1; 32]), &keys.funding_key);

    let mut commitments = Commitments {
        channel_id: ChannelId::from_funding_outpoint(&funding.outpoint),
        is_funder,
        funding,
        constraints: config.constraints(),
        local_pubkeys: keys.pubkeys(secp_ctx),
        remote_pubkeys: remote_keys.pubkeys(secp_ctx),
        local_commit: LocalCommit {
            index: 0,
            spec,
            remote_sig: placeholder_sig,
            remote_htlc_sigs: vec![],
        },
        remote_commit: RemoteCommit {
            index: 0,
            spec: remote_spec.clone(),
            txid: Txid::all_zeros(),
            remote_per_commitment_point: remote_point(0),
        },
        local_changes: Default::default(),
        remote_changes: Default::default(),
        local_next_htlc_id: 0,
        remote_next_htlc_id: 0,
        remote_next_commit_info: RemoteNextCommitInfo::Revoked(remote_point(1)),
        remote_secrets: Default::default(),
    };
    commitments.remote_commit.txid = commitments
        .build_remote_commitment(secp_ctx, 0, &remote_spec, &remote_point(0))
        .unwrap()
        .txid();
    commitments
}

/// Both sides of a channel right after funding, with commitment 0 signed by each side
pub fn make_commitments_pair(
    secp_ctx: &Secp256k1<All>,
    config: &ChannelPairConfig,
) -> (TestChannelSide, TestChannelSide) {
    let a_keys = ChannelKeys::derive(&[1; 32], 0).unwrap();
    let b_keys = ChannelKeys::derive(&[2; 32], 0).unwrap();
    let redeemscript = make_funding_redeemscript(
        &a_keys.pubkeys(secp_ctx).funding_pubkey,
        &b_keys.pubkeys(secp_ctx).funding_pubkey,
    );
    let tx = make_funding_tx(&redeemscript, config.funding_sat);
    let funding = FundingInfo {
        outpoint: OutPoint { txid: tx.compute_txid(), vout: 0 },
        amount_sat: config.funding_sat,
    };
    let mut a = initial_commitments(secp_ctx, config, funding, true, &a_keys, &b_keys);
    let mut b = initial_commitments(secp_ctx, config, funding, false, &b_keys, &a_keys);

    let countersign = |signer: &Commitments, signer_keys: &ChannelKeys, owner: &Commitments, owner_keys: &ChannelKeys| {
        let point = owner_keys.per_commitment_point(secp_ctx, 0).unwrap();
        let (_, sig, _) = signer
            .sign_remote_commitment(secp_ctx, signer_keys, 0, &owner.local_commit.spec, &point)
            .unwrap();
        sig
    };
    let sig_for_a = countersign(&b, &b_keys, &a, &a_keys);
    let sig_for_b = countersign(&a, &a_keys, &b, &b_keys);
    a.local_commit.remote_sig = sig_for_a;
    b.local_commit.remote_sig = sig_for_b;
    (
        TestChannelSide { commitments: a, keys: a_keys },
        TestChannelSide { commitments: b, keys: b_keys },
    )
}

/// A pays B `amount_msat` and both sides complete a full signing round.
/// Returns B's commitment 0 as revoked towards A.
pub fn revoke_once(
    secp_ctx: &Secp256k1<All>,
    a: &mut TestChannelSide,
    b: &mut TestChannelSide,
    amount_msat: u64,
) -> RevokedCommitment {
    let (c, payment) = a.commitments.send_mono_hop_payment(amount_msat).unwrap();
    a.commitments = c;
    b.commitments = b.commitments.receive_mono_hop_payment(&payment).unwrap();

    let (c, commit) = a.commitments.send_commit(secp_ctx, &a.keys).unwrap();
    a.commitments = c;
    let (c, revocation) = b.commitments.receive_commit(secp_ctx, &b.keys, &commit).unwrap();
    b.commitments = c;
    let (c, revoked) = a.commitments.receive_revocation(secp_ctx, &revocation).unwrap();
    a.commitments = c;

    let (c, commit) = b.commitments.send_commit(secp_ctx, &b.keys).unwrap();
    b.commitments = c;
    let (c, revocation) = a.commitments.receive_commit(secp_ctx, &a.keys, &commit).unwrap();
    a.commitments = c;
    let (c, _) = b.commitments.receive_revocation(secp_ctx, &revocation).unwrap();
    b.commitments = c;
    revoked
}

fn serialized(
    side: TestChannelSide,
    account_id: &str,
    remote: u8,
    config: &ChannelPairConfig,
) -> SerializedChannel {
    SerializedChannel {
        channel_index: 0,
        account_id: account_id.to_string(),
        remote_node_id: node_id(remote),
        remote_address: format!("127.0.0.{}:9735", remote),
        keys: side.keys,
        commitments: side.commitments,
        min_depth: config.min_depth,
        negotiating_state: None,
    }
}

/// The persisted form of [make_commitments_pair]. A runs as node 1, B as node 2.
pub fn make_channel_pair(
    secp_ctx: &Secp256k1<All>,
    config: &ChannelPairConfig,
) -> (SerializedChannel, SerializedChannel) {
    let (a, b) = make_commitments_pair(secp_ctx, config);
    (serialized(a, "a", 2, config), serialized(b, "b", 1, config))
}

/// The services of one node, with handles on the fakes behind them
pub struct TestEnv {
    pub ctx: ChannelContext,
    pub store: Arc<MemoryStore>,
    pub payments: Arc<FakePaymentRegistry>,
    pub watch_tower: Arc<FakeWatchTower>,
}

pub struct TestEnvs {
    pub a: TestEnv,
    pub b: TestEnv,
}

fn make_env(account_id: &str) -> TestEnv {
    let store = Arc::new(MemoryStore::default());
    let payments = Arc::new(FakePaymentRegistry::default());
    let watch_tower = Arc::new(FakeWatchTower::default());
    let ctx = ChannelContext {
        account: Account { id: account_id.to_string(), sweep_destination: sweep_script() },
        channel_store: store.clone(),
        breach_store: store.clone(),
        locks: ChannelLocks::default(),
        onion: Arc::new(FakeOnion::default()),
        payments: payments.clone(),
        watch_tower: Some(watch_tower.clone()),
        secp_ctx: Arc::new(Secp256k1::new()),
        rebroadcast_timeout: Duration::from_millis(100),
    };
    TestEnv { ctx, store, payments, watch_tower }
}

pub fn make_envs() -> TestEnvs {
    TestEnvs { a: make_env("a"), b: make_env("b") }
}

/// Store each channel with its node and connect them to each other
pub async fn connect_pair(
    envs: &TestEnvs,
    a: SerializedChannel,
    b: SerializedChannel,
) -> (ConnectedChannel<MemoryTransport>, ConnectedChannel<MemoryTransport>) {
    ChannelStore::save(&*envs.a.store, &a).unwrap();
    ChannelStore::save(&*envs.b.store, &b).unwrap();
    let (id_a, id_b) = (a.channel_id(), b.channel_id());
    let (left, right) = memory_connector_pair();
    let (a, b) = tokio::join!(
        ConnectedChannel::connect(envs.a.ctx.clone(), &left, &id_a),
        ConnectedChannel::connect(envs.b.ctx.clone(), &right, &id_b),
    );
    (a.unwrap(), b.unwrap())
}

/// A channel live on both sides, past `init` and without reestablishment
pub async fn make_active_pair(
    config: &ChannelPairConfig,
) -> (ActiveChannel<MemoryTransport>, ActiveChannel<MemoryTransport>, TestEnvs) {
    let envs = make_envs();
    let (a, b) = make_channel_pair(&envs.a.ctx.secp_ctx, config);
    ChannelStore::save(&*envs.a.store, &a).unwrap();
    ChannelStore::save(&*envs.b.store, &b).unwrap();
    let (left, right) = memory_transport_pair();
    let (session_a, session_b) = tokio::join!(
        PeerSession::handshake(left, a.remote_node_id),
        PeerSession::handshake(right, b.remote_node_id),
    );
    let guard_a = envs.a.ctx.locks.try_lock(&a.channel_id()).unwrap();
    let guard_b = envs.b.ctx.locks.try_lock(&b.channel_id()).unwrap();
    let a = ActiveChannel::new(envs.a.ctx.clone(), session_a.unwrap(), a, guard_a);
    let b = ActiveChannel::new(envs.b.ctx.clone(), session_b.unwrap(), b, guard_b);
    (a, b, envs)
}
