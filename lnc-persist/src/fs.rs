//! One JSON file per channel and per ledger, in an account directory.
//!
//! Files are `chan-<id>.json`, `breach-<id>.json` and `htlcs-<id>.json`, where `<id>` is the
//! channel id in hex. Writes go to a temporary file which is synced and renamed over the
//! previous version, then the directory is synced so the rename survives a crash.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use lightning_channel::breach::ChannelBreachData;
use lightning_channel::channel::{ChannelId, SerializedChannel};
use lightning_channel::monitor::UnresolvedHtlcs;
use lightning_channel::persist::{BreachStore, ChannelIdIter, ChannelStore, Error, HtlcStore};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace, warn};

const CHANNEL_PREFIX: &str = "chan-";
const BREACH_PREFIX: &str = "breach-";
const HTLCS_PREFIX: &str = "htlcs-";
const EXTENSION: &str = ".json";

fn io_error(path: &Path, e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
        _ => Error::Unavailable(format!("{}: {}", path.display(), e)),
    }
}

/// File-backed stores for the channels of one account
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Creates the directory if needed
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;
        Ok(FileStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, prefix: &str, channel_id: &ChannelId) -> PathBuf {
        self.dir.join(format!("{}{}{}", prefix, channel_id, EXTENSION))
    }

    fn read<T: DeserializeOwned>(&self, path: &Path) -> Result<T, Error> {
        let bytes = fs::read(path).map_err(|e| io_error(path, e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Internal(format!("{}: {}", path.display(), e)))
    }

    fn read_optional<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, Error> {
        match self.read(path) {
            Ok(value) => Ok(Some(value)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), Error> {
        let json = serde_json::to_vec_pretty(value)
            .map_err(|e| Error::Internal(format!("{}: {}", path.display(), e)))?;
        let tmp = path.with_extension("json.tmp");
        let mut file = File::create(&tmp).map_err(|e| io_error(&tmp, e))?;
        file.write_all(&json).map_err(|e| io_error(&tmp, e))?;
        file.sync_all().map_err(|e| io_error(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| io_error(path, e))?;
        self.sync_dir()?;
        trace!("wrote {}", path.display());
        Ok(())
    }

    #[cfg(unix)]
    fn sync_dir(&self) -> Result<(), Error> {
        File::open(&self.dir)
            .and_then(|dir| dir.sync_all())
            .map_err(|e| io_error(&self.dir, e))
    }

    // directories cannot be opened as files here
    #[cfg(not(unix))]
    fn sync_dir(&self) -> Result<(), Error> {
        Ok(())
    }
}

fn channel_id_from_file_name(name: &str) -> Option<ChannelId> {
    let hex = name.strip_prefix(CHANNEL_PREFIX)?.strip_suffix(EXTENSION)?;
    ChannelId::from_hex(hex)
}

impl ChannelStore for FileStore {
    fn load(&self, channel_id: &ChannelId) -> Result<SerializedChannel, Error> {
        self.read(&self.path(CHANNEL_PREFIX, channel_id))
    }

    fn save(&self, channel: &SerializedChannel) -> Result<(), Error> {
        let channel_id = channel.channel_id();
        debug!(
            "{} saving channel at commitments {}/{}",
            channel_id,
            channel.commitments.local_commit.index,
            channel.commitments.remote_commit.index
        );
        self.write(&self.path(CHANNEL_PREFIX, &channel_id), channel)
    }

    fn list_channel_ids(&self) -> Result<ChannelIdIter<'_>, Error> {
        let entries = fs::read_dir(&self.dir).map_err(|e| io_error(&self.dir, e))?;
        let dir = self.dir.clone();
        Ok(Box::new(entries.filter_map(move |entry| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => return Some(Err(io_error(&dir, e))),
            };
            let name = entry.file_name();
            let name = name.to_str()?;
            if !name.starts_with(CHANNEL_PREFIX) || !name.ends_with(EXTENSION) {
                return None;
            }
            let id = channel_id_from_file_name(name);
            if id.is_none() {
                warn!("ignoring malformed channel file name {}", name);
            }
            id.map(Ok)
        })))
    }
}

impl BreachStore for FileStore {
    fn load(&self, channel_id: &ChannelId) -> Result<ChannelBreachData, Error> {
        Ok(self
            .read_optional(&self.path(BREACH_PREFIX, channel_id))?
            .unwrap_or_else(|| ChannelBreachData::new(*channel_id)))
    }

    fn save(&self, breach: &ChannelBreachData) -> Result<(), Error> {
        debug!("{} saving {} penalties", breach.channel_id, breach.penalties.len());
        self.write(&self.path(BREACH_PREFIX, &breach.channel_id), breach)
    }
}

impl HtlcStore for FileStore {
    fn load(&self, channel_id: &ChannelId) -> Result<Option<UnresolvedHtlcs>, Error> {
        self.read_optional(&self.path(HTLCS_PREFIX, channel_id))
    }

    fn save(&self, unresolved: &UnresolvedHtlcs) -> Result<(), Error> {
        self.write(&self.path(HTLCS_PREFIX, &unresolved.channel_id), unresolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lightning_channel::bitcoin::secp256k1::Secp256k1;
    use lightning_channel::util::test_utils::{
        make_commitments_pair, make_channel_pair, revoke_once, sweep_script, ChannelPairConfig,
    };
    use tempfile::TempDir;
    use test_log::test;

    #[test]
    fn channel_round_trips_through_files() {
        let tempdir = TempDir::new().unwrap();
        let store = FileStore::new(tempdir.path().join("account")).unwrap();
        let secp_ctx = Secp256k1::new();
        let (a, _b) = make_channel_pair(&secp_ctx, &ChannelPairConfig::default());
        let id = a.channel_id();

        assert!(matches!(ChannelStore::load(&store, &id), Err(Error::NotFound(_))));
        ChannelStore::save(&store, &a).unwrap();
        assert_eq!(ChannelStore::load(&store, &id).unwrap(), a);
        assert!(store.dir().join(format!("chan-{}.json", id)).exists());

        // overwrite in place
        let mut changed = a.clone();
        changed.remote_address = "10.0.0.1:9735".to_string();
        ChannelStore::save(&store, &changed).unwrap();
        assert_eq!(ChannelStore::load(&store, &id).unwrap(), changed);
    }

    #[test]
    fn write_leaves_only_the_final_file() {
        let tempdir = TempDir::new().unwrap();
        let store = FileStore::new(tempdir.path()).unwrap();
        let (a, _b) = make_channel_pair(&Secp256k1::new(), &ChannelPairConfig::default());
        ChannelStore::save(&store, &a).unwrap();
        ChannelStore::save(&store, &a).unwrap();
        let names: Vec<String> = fs::read_dir(tempdir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec![format!("chan-{}.json", a.channel_id())]);
        assert_eq!(ChannelStore::load(&store, &a.channel_id()).unwrap(), a);
    }

    #[test]
    fn write_into_missing_directory_fails() {
        let tempdir = TempDir::new().unwrap();
        let store = FileStore::new(tempdir.path().join("gone")).unwrap();
        fs::remove_dir(store.dir()).unwrap();
        let (a, _b) = make_channel_pair(&Secp256k1::new(), &ChannelPairConfig::default());
        assert!(ChannelStore::save(&store, &a).is_err());
    }

    #[test]
    fn listing_skips_unrelated_files() {
        let tempdir = TempDir::new().unwrap();
        let store = FileStore::new(tempdir.path()).unwrap();
        let (a, _b) = make_channel_pair(&Secp256k1::new(), &ChannelPairConfig::default());
        ChannelStore::save(&store, &a).unwrap();
        fs::write(tempdir.path().join("wallet.json"), "{}").unwrap();
        fs::write(tempdir.path().join("chan-zz.json"), "{}").unwrap();

        let ids: Vec<_> = store.list_channel_ids().unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(ids, vec![a.channel_id()]);
        // restartable
        assert_eq!(store.list_channel_ids().unwrap().count(), 1);
    }

    #[test]
    fn breach_ledger_defaults_to_empty() {
        let tempdir = TempDir::new().unwrap();
        let store = FileStore::new(tempdir.path()).unwrap();
        let secp_ctx = Secp256k1::new();
        let (mut a, mut b) = make_commitments_pair(&secp_ctx, &ChannelPairConfig::default());
        let id = a.commitments.channel_id;
        assert!(BreachStore::load(&store, &id).unwrap().penalties.is_empty());
        assert_eq!(HtlcStore::load(&store, &id).unwrap(), None);

        let revoked = revoke_once(&secp_ctx, &mut a, &mut b, 2_000_000);
        let ledger = ChannelBreachData::new(id)
            .insert_revoked_commitment(&secp_ctx, &revoked, &a.commitments, &a.keys, &sweep_script())
            .unwrap();
        BreachStore::save(&store, &ledger).unwrap();
        assert_eq!(BreachStore::load(&store, &id).unwrap(), ledger);
        // the ledger is not mistaken for a channel
        assert_eq!(store.list_channel_ids().unwrap().count(), 0);
    }

    #[test]
    fn corrupt_file_is_internal_error() {
        let tempdir = TempDir::new().unwrap();
        let store = FileStore::new(tempdir.path()).unwrap();
        let id = ChannelId([7; 32]);
        fs::write(tempdir.path().join(format!("chan-{}.json", id)), "not json").unwrap();
        assert!(matches!(ChannelStore::load(&store, &id), Err(Error::Internal(_))));
    }
}
