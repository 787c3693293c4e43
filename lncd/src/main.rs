//! Watches the chain for every channel stored under a data directory.
//!
//! The layout is `<datadir>/<network>/<account>/`, one directory per account holding its
//! `wallet.json`, optional `invoices.json`, and the channel files.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use lightning_channel::persist::BreachStore;
use lightning_channel::persist::ChannelStore;
use lightning_channel::watchtower::WatchTower;
use lnc_frontend::{ChainWatcher, EsploraChainQuery, HttpWatchTower, WatchedAccount};
use lnc_persist::wallet::{list_account_dirs, load_account};
use lnc_persist::{FileInvoices, FileStore};
use lnc_util::config::{
    default_esplora_url, DEFAULT_DIR, DEFAULT_NETWORK, DEFAULT_POLL_INTERVAL, NETWORK_NAMES,
};
use lnc_util::util::setup_logging;
use log::{error, info, warn};
use url::Url;

#[derive(Parser, Debug)]
#[clap(about, long_about = None)]
struct Args {
    #[clap(short, long, value_parser, help = "data directory", value_name = "DIR")]
    datadir: Option<PathBuf>,

    #[clap(
        short,
        long,
        value_name = "NETWORK",
        default_value = DEFAULT_NETWORK,
        value_parser = NETWORK_NAMES,
    )]
    network: String,

    #[clap(long, help = "Esplora API base, defaults to a public instance", value_name = "URL")]
    esplora_url: Option<Url>,

    #[clap(
        long,
        help = "set the logging level",
        value_name = "LEVEL",
        default_value = "info",
        value_parser = ["off", "error", "warn", "info", "debug", "trace"],
    )]
    log_level: String,

    #[clap(long, help = "seconds between chain polls", value_name = "SECS")]
    poll_interval: Option<u64>,

    #[clap(long, help = "push stored penalties to this watch tower at startup", value_name = "URL")]
    watchtower_url: Option<Url>,
}

impl Args {
    fn network_dir(&self) -> Result<PathBuf> {
        let datadir = match &self.datadir {
            Some(dir) => dir.clone(),
            None => dirs::home_dir().context("no home directory")?.join(DEFAULT_DIR),
        };
        Ok(datadir.join(&self.network))
    }

    fn esplora_url(&self) -> Result<Url> {
        if let Some(url) = &self.esplora_url {
            return Ok(url.clone());
        }
        let default = default_esplora_url(&self.network)
            .ok_or_else(|| anyhow!("--esplora-url is required on {}", self.network))?;
        Ok(Url::parse(default)?)
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval.map(Duration::from_secs).unwrap_or(DEFAULT_POLL_INTERVAL)
    }
}

fn load_accounts(network_dir: &PathBuf) -> Result<Vec<WatchedAccount>> {
    let mut watched = Vec::new();
    for dir in list_account_dirs(network_dir)? {
        let account =
            load_account(&dir).with_context(|| format!("load account {}", dir.display()))?;
        let store = Arc::new(FileStore::new(&dir)?);
        let payments = Arc::new(FileInvoices::load(&dir)?);
        info!("account {} in {}", account.id, dir.display());
        watched.push(WatchedAccount {
            account,
            channels: store.clone(),
            breaches: store.clone(),
            htlcs: store,
            payments,
        });
    }
    Ok(watched)
}

/// Send every stored penalty to the tower. Failures are logged.
async fn push_penalties(tower: &dyn WatchTower, accounts: &[WatchedAccount]) {
    let mut sent = 0;
    for watched in accounts {
        let ids = match watched.channels.list_channel_ids() {
            Ok(ids) => ids.filter_map(|id| id.ok()).collect::<Vec<_>>(),
            Err(e) => {
                warn!("account {}: cannot list channels: {}", watched.account.id, e);
                continue;
            }
        };
        for id in ids {
            let breach = match watched.breaches.load(&id) {
                Ok(breach) => breach,
                Err(e) => {
                    warn!("{} cannot load penalties: {}", id, e);
                    continue;
                }
            };
            for number in breach.penalties.keys() {
                let Some(notice) = breach.notice(*number) else { continue };
                match tower.notify(&notice).await {
                    Ok(()) => sent += 1,
                    Err(e) => warn!("{} penalty {} not delivered: {}", id, number, e),
                }
            }
        }
    }
    info!("sent {} penalties to the watch tower", sent);
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let network_dir = args.network_dir()?;
    std::fs::create_dir_all(&network_dir)
        .with_context(|| format!("create {}", network_dir.display()))?;
    setup_logging(&network_dir, "lncd", &args.log_level)?;
    info!("lncd starting on {} in {}", args.network, network_dir.display());

    let accounts = load_accounts(&network_dir)?;
    if let Some(url) = &args.watchtower_url {
        push_penalties(&HttpWatchTower::new(url), &accounts).await;
    }

    if lnc_util::watcher_disabled() {
        warn!("LNC_WATCHER_DISABLE: not watching the chain");
        return Ok(());
    }

    let chain = Arc::new(EsploraChainQuery::new(&args.esplora_url()?));
    let watcher = Arc::new(ChainWatcher::new(chain, accounts, args.poll_interval()));
    let (shutdown_trigger, shutdown_signal) = triggered::trigger();
    let handle = watcher.start(shutdown_signal);

    tokio::signal::ctrl_c().await.context("listen for ctrl-c")?;
    info!("shutting down");
    shutdown_trigger.trigger();
    if let Err(e) = handle.await {
        error!("watcher task failed: {}", e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults() {
        let args = Args::parse_from(["lncd", "--datadir", "/tmp/lnc"]);
        assert_eq!(args.network_dir().unwrap(), PathBuf::from("/tmp/lnc/testnet"));
        assert_eq!(args.esplora_url().unwrap().as_str(), "https://blockstream.info/testnet/api");
        assert_eq!(args.poll_interval(), Duration::from_secs(60));
    }

    #[test]
    fn regtest_needs_an_esplora() {
        let args = Args::parse_from(["lncd", "--network", "regtest"]);
        assert!(args.esplora_url().is_err());
        assert!(Args::try_parse_from(["lncd", "--network", "mainnet"]).is_err());
    }

    #[test]
    fn accounts_are_loaded_from_the_network_dir() {
        let tempdir = TempDir::new().unwrap();
        let alice = tempdir.path().join("alice");
        std::fs::create_dir(&alice).unwrap();
        std::fs::write(alice.join("wallet.json"), r#"{"sweep_destination":"0014aabb"}"#).unwrap();
        let accounts = load_accounts(&tempdir.path().to_path_buf()).unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].account.id, "alice");
        assert_eq!(accounts[0].channels.list_channel_ids().unwrap().count(), 0);
    }
}
