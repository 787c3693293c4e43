use std::sync::Arc;
use std::time::Duration;

use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::Transaction;
use lightning_channel::chain::{ChainError, ChainQuery};
use lightning_channel::channel::{ChannelId, SerializedChannel};
use lightning_channel::context::Account;
use lightning_channel::error::ClassifiedError;
use lightning_channel::monitor::{
    check_for_channel_force_close_and_save_unresolved_htlcs, check_for_channel_fraud,
    check_for_channel_ready_to_broadcast_htlc_transactions,
    check_for_ready_to_spend_delayed_htlc_transactions, MonitorError, UnresolvedHtlcs,
};
use lightning_channel::onion::PaymentRegistry;
use lightning_channel::persist::{BreachStore, ChannelStore, HtlcStore};
use log::{debug, error, info, warn};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time;
use triggered::Listener;

/// The stores and services of one account
pub struct WatchedAccount {
    pub account: Account,
    pub channels: Arc<dyn ChannelStore>,
    pub breaches: Arc<dyn BreachStore>,
    pub htlcs: Arc<dyn HtlcStore>,
    pub payments: Arc<dyn PaymentRegistry>,
}

/// Runs the chain checks of every channel of every account, once per poll interval.
///
/// Accounts are checked in parallel, the channels of one account one after the other.
/// Unresolved HTLCs of different channels are handled concurrently.
pub struct ChainWatcher {
    chain: Arc<dyn ChainQuery>,
    accounts: Vec<Arc<WatchedAccount>>,
    secp_ctx: Arc<Secp256k1<All>>,
    poll_interval: Duration,
}

fn log_failure<E: ClassifiedError>(channel_id: &ChannelId, what: &str, e: &E) {
    if e.possible_bug() {
        error!("{} {} failed: {}", channel_id, what, e.message());
    } else {
        warn!("{} {} failed: {}", channel_id, what, e.message());
    }
}

/// Broadcast unless the chain already knows the transaction
async fn broadcast_once(chain: &dyn ChainQuery, tx: &Transaction) -> Result<bool, ChainError> {
    match chain.get_confirmations(&tx.compute_txid()).await {
        Ok(_) => Ok(false),
        Err(ChainError::NotFound(_)) => {
            chain.broadcast_transaction(tx).await?;
            Ok(true)
        }
        Err(e) => Err(e),
    }
}

impl ChainWatcher {
    pub fn new(
        chain: Arc<dyn ChainQuery>,
        accounts: Vec<WatchedAccount>,
        poll_interval: Duration,
    ) -> Self {
        ChainWatcher {
            chain,
            accounts: accounts.into_iter().map(Arc::new).collect(),
            secp_ctx: Arc::new(Secp256k1::new()),
            poll_interval,
        }
    }

    /// Poll until `shutdown_signal` fires
    pub fn start(self: Arc<Self>, shutdown_signal: Listener) -> JoinHandle<()> {
        info!(
            "chain watcher started, {} accounts, polling every {:?}",
            self.accounts.len(),
            self.poll_interval
        );
        tokio::spawn(async move {
            let mut interval = time::interval(self.poll_interval);
            loop {
                let shutdown = shutdown_signal.clone();
                tokio::select! {
                    _ = interval.tick() => self.poll_once().await,
                    _ = shutdown => break,
                }
            }
            info!("chain watcher stopped");
        })
    }

    /// One pass over every account
    pub async fn poll_once(&self) {
        let mut tasks = JoinSet::new();
        for watched in &self.accounts {
            let chain = Arc::clone(&self.chain);
            let secp_ctx = Arc::clone(&self.secp_ctx);
            let watched = Arc::clone(watched);
            tasks.spawn(async move { check_account(chain, secp_ctx, watched).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("account check panicked: {}", e);
            }
        }
    }
}

async fn check_account(
    chain: Arc<dyn ChainQuery>,
    secp_ctx: Arc<Secp256k1<All>>,
    watched: Arc<WatchedAccount>,
) {
    let ids = match watched.channels.list_channel_ids() {
        Ok(ids) => ids.collect::<Vec<_>>(),
        Err(e) => {
            warn!("account {}: cannot list channels: {}", watched.account.id, e);
            return;
        }
    };
    let mut unresolved = Vec::new();
    for id in ids {
        let channel = match id.and_then(|id| watched.channels.load(&id)) {
            Ok(channel) => channel,
            Err(e) => {
                warn!("account {}: cannot load channel: {}", watched.account.id, e);
                continue;
            }
        };
        match check_channel(&*chain, &secp_ctx, &watched, &channel).await {
            Ok(Some(found)) => unresolved.push((channel, found)),
            Ok(None) => {}
            Err(e) => log_failure(&channel.channel_id(), "chain check", &e),
        }
    }

    let mut tasks = JoinSet::new();
    for (channel, found) in unresolved {
        let chain = Arc::clone(&chain);
        tasks.spawn(async move {
            if let Err(e) = resolve_htlcs(&*chain, &channel, &found).await {
                log_failure(&channel.channel_id(), "htlc resolution", &e);
            }
        });
    }
    while tasks.join_next().await.is_some() {}
}

async fn check_channel(
    chain: &dyn ChainQuery,
    secp_ctx: &Secp256k1<All>,
    watched: &WatchedAccount,
    channel: &SerializedChannel,
) -> Result<Option<UnresolvedHtlcs>, MonitorError> {
    let penalties = check_for_channel_fraud(chain, channel, &*watched.breaches).await?;
    if !penalties.is_empty() {
        info!("{} broadcast {} penalty transactions", channel.channel_id(), penalties.len());
    }
    check_for_channel_force_close_and_save_unresolved_htlcs(
        secp_ctx,
        chain,
        channel,
        &watched.account,
        &*watched.payments,
        &*watched.htlcs,
    )
    .await
}

/// Broadcast what has become spendable, sequentially
async fn resolve_htlcs(
    chain: &dyn ChainQuery,
    channel: &SerializedChannel,
    unresolved: &UnresolvedHtlcs,
) -> Result<(), MonitorError> {
    let height = chain.get_block_height().await?;
    let mut ready = check_for_channel_ready_to_broadcast_htlc_transactions(unresolved, height);
    let to_self_delay = channel.commitments.constraints.local_to_self_delay;
    ready.extend(
        check_for_ready_to_spend_delayed_htlc_transactions(chain, &unresolved.delayed, to_self_delay)
            .await?,
    );
    for tx in ready {
        if broadcast_once(chain, &tx).await? {
            info!("{} broadcast recovery {}", channel.channel_id(), tx.compute_txid());
        } else {
            debug!("{} recovery {} already known", channel.channel_id(), tx.compute_txid());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lightning_channel::breach::ChannelBreachData;
    use lightning_channel::persist::MemoryStore;
    use lightning_channel::util::test_utils::{
        funding_tx, make_commitments_pair, revoke_once, sweep_script, ChannelPairConfig, FakeChain,
        FakePaymentRegistry,
    };

    #[test_log::test(tokio::test)]
    async fn poll_punishes_revoked_commitment() {
        let secp_ctx = Secp256k1::new();
        let (mut a, mut b) = make_commitments_pair(&secp_ctx, &ChannelPairConfig::default());
        let stale = b.commitments.signed_local_commitment_tx(&secp_ctx, &b.keys).unwrap();
        let revoked = revoke_once(&secp_ctx, &mut a, &mut b, 1_000_000);
        let ledger = ChannelBreachData::new(a.commitments.channel_id)
            .insert_revoked_commitment(&secp_ctx, &revoked, &a.commitments, &a.keys, &sweep_script())
            .unwrap();
        let channel = SerializedChannel {
            channel_index: 0,
            account_id: "a".to_string(),
            remote_node_id: lightning_channel::util::test_utils::node_id(2),
            remote_address: "127.0.0.2:9735".to_string(),
            keys: a.keys.clone(),
            commitments: a.commitments.clone(),
            min_depth: 3,
            negotiating_state: None,
        };
        let store = Arc::new(MemoryStore::default());
        ChannelStore::save(&*store, &channel).unwrap();
        BreachStore::save(&*store, &ledger).unwrap();

        let chain = Arc::new(FakeChain::new(200));
        chain.add_transaction(funding_tx(&a.commitments), Some(100));
        chain.add_transaction(stale.clone(), Some(150));
        let watched = WatchedAccount {
            account: Account { id: "a".to_string(), sweep_destination: sweep_script() },
            channels: store.clone(),
            breaches: store.clone(),
            htlcs: store.clone(),
            payments: Arc::new(FakePaymentRegistry::default()),
        };
        let watcher = ChainWatcher::new(chain.clone(), vec![watched], Duration::from_secs(60));
        watcher.poll_once().await;

        let broadcasts = chain.broadcasts();
        assert_eq!(broadcasts.len(), 1);
        assert_eq!(broadcasts[0].input[0].previous_output.txid, stale.compute_txid());
        // the penalty is in the mempool now
        watcher.poll_once().await;
        assert_eq!(chain.broadcasts().len(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn shutdown_stops_the_loop() {
        let chain = Arc::new(FakeChain::new(1));
        let watcher = Arc::new(ChainWatcher::new(chain, vec![], Duration::from_millis(10)));
        let (trigger, listener) = triggered::trigger();
        let handle = watcher.start(listener);
        trigger.trigger();
        handle.await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn known_transaction_is_not_rebroadcast() {
        let chain = FakeChain::new(10);
        let (a, _b) = make_commitments_pair(&Secp256k1::new(), &ChannelPairConfig::default());
        let tx = funding_tx(&a.commitments);
        assert!(broadcast_once(&chain, &tx).await.unwrap());
        assert!(!broadcast_once(&chain, &tx).await.unwrap());
        assert_eq!(chain.broadcasts().len(), 1);
    }
}
