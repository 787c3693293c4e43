use std::time::Duration;

/// Network names
pub const NETWORK_NAMES: [&'static str; 4] = ["testnet", "regtest", "signet", "bitcoin"];

/// Data directory under the home directory
pub const DEFAULT_DIR: &str = ".lnc";

pub const DEFAULT_NETWORK: &str = "testnet";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Public Esplora instance for a network, none for regtest
pub fn default_esplora_url(network: &str) -> Option<&'static str> {
    match network {
        "bitcoin" => Some("https://blockstream.info/api"),
        "testnet" => Some("https://blockstream.info/testnet/api"),
        "signet" => Some("https://mempool.space/signet/api"),
        _ => None,
    }
}
