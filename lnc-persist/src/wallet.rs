use std::fs;
use std::path::{Path, PathBuf};

use lightning_channel::bitcoin::ScriptBuf;
use lightning_channel::context::Account;
use lightning_channel::persist::Error;
use log::info;
use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};

/// Name of the account description file in an account directory
pub const WALLET_FILE: &str = "wallet.json";

/// The part of the wallet the channel layer needs
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletFile {
    /// Output script for penalties and sweeps
    #[serde_as(as = "Hex")]
    pub sweep_destination: Vec<u8>,
}

/// Read the account of `dir`, named after the directory
pub fn load_account(dir: &Path) -> Result<Account, Error> {
    let path = dir.join(WALLET_FILE);
    let bytes = fs::read(&path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
        _ => Error::Unavailable(format!("{}: {}", path.display(), e)),
    })?;
    let wallet: WalletFile = serde_json::from_slice(&bytes)
        .map_err(|e| Error::Internal(format!("{}: {}", path.display(), e)))?;
    let id = dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Internal(format!("bad account directory {}", dir.display())))?;
    Ok(Account { id: id.to_string(), sweep_destination: ScriptBuf::from_bytes(wallet.sweep_destination) })
}

/// Account directories under a network directory, those with a wallet file
pub fn list_account_dirs(network_dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let entries = fs::read_dir(network_dir)
        .map_err(|e| Error::Unavailable(format!("{}: {}", network_dir.display(), e)))?;
    let mut dirs = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|e| Error::Unavailable(format!("{}: {}", network_dir.display(), e)))?
            .path();
        if path.join(WALLET_FILE).is_file() {
            dirs.push(path);
        }
    }
    dirs.sort();
    info!("found {} accounts in {}", dirs.len(), network_dir.display());
    Ok(dirs)
}
