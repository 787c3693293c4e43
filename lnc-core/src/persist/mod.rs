use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::breach::ChannelBreachData;
use crate::channel::{ChannelId, SerializedChannel};
use crate::monitor::UnresolvedHtlcs;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
/// Error returned by stores
pub enum Error {
    /// Store is temporarily unavailable, might work later
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Inconsistent state, needed resource is missing
    #[error("not found: {0}")]
    NotFound(String),
    /// Inconsistent state, resource already present
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Non-recoverable internal error
    #[error("internal store error: {0}")]
    Internal(String),
}

/// Restartable listing of stored channel ids, produced lazily
pub type ChannelIdIter<'a> = Box<dyn Iterator<Item = Result<ChannelId, Error>> + Send + 'a>;

/// Durable per-channel state.
///
/// Stores do no locking: callers hold a [ChannelLocks] guard while a channel is live.
pub trait ChannelStore: Send + Sync {
    /// Fails with [Error::NotFound] if the channel was never saved
    fn load(&self, channel_id: &ChannelId) -> Result<SerializedChannel, Error>;

    /// Overwrite, durably, before returning
    fn save(&self, channel: &SerializedChannel) -> Result<(), Error>;

    fn list_channel_ids(&self) -> Result<ChannelIdIter<'_>, Error>;
}

/// Durable per-channel penalty ledger
pub trait BreachStore: Send + Sync {
    /// A channel without breach history yields an empty ledger
    fn load(&self, channel_id: &ChannelId) -> Result<ChannelBreachData, Error>;

    fn save(&self, breach: &ChannelBreachData) -> Result<(), Error>;
}

/// HTLC outputs left to resolve after a force-close
pub trait HtlcStore: Send + Sync {
    fn load(&self, channel_id: &ChannelId) -> Result<Option<UnresolvedHtlcs>, Error>;

    fn save(&self, unresolved: &UnresolvedHtlcs) -> Result<(), Error>;
}

/// Stores everything in memory, for tests and ephemeral use
#[derive(Default)]
pub struct MemoryStore {
    channels: Mutex<BTreeMap<ChannelId, SerializedChannel>>,
    breaches: Mutex<BTreeMap<ChannelId, ChannelBreachData>>,
    htlcs: Mutex<BTreeMap<ChannelId, UnresolvedHtlcs>>,
}

fn poisoned<T>(_: T) -> Error {
    Error::Internal("lock poisoned".to_string())
}

impl ChannelStore for MemoryStore {
    fn load(&self, channel_id: &ChannelId) -> Result<SerializedChannel, Error> {
        self.channels
            .lock()
            .map_err(poisoned)?
            .get(channel_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("channel {}", channel_id)))
    }

    fn save(&self, channel: &SerializedChannel) -> Result<(), Error> {
        self.channels.lock().map_err(poisoned)?.insert(channel.channel_id(), channel.clone());
        Ok(())
    }

    fn list_channel_ids(&self) -> Result<ChannelIdIter<'_>, Error> {
        let ids: Vec<ChannelId> = self.channels.lock().map_err(poisoned)?.keys().cloned().collect();
        Ok(Box::new(ids.into_iter().map(Ok)))
    }
}

impl BreachStore for MemoryStore {
    fn load(&self, channel_id: &ChannelId) -> Result<ChannelBreachData, Error> {
        Ok(self
            .breaches
            .lock()
            .map_err(poisoned)?
            .get(channel_id)
            .cloned()
            .unwrap_or_else(|| ChannelBreachData::new(*channel_id)))
    }

    fn save(&self, breach: &ChannelBreachData) -> Result<(), Error> {
        self.breaches.lock().map_err(poisoned)?.insert(breach.channel_id, breach.clone());
        Ok(())
    }
}

impl HtlcStore for MemoryStore {
    fn load(&self, channel_id: &ChannelId) -> Result<Option<UnresolvedHtlcs>, Error> {
        Ok(self.htlcs.lock().map_err(poisoned)?.get(channel_id).cloned())
    }

    fn save(&self, unresolved: &UnresolvedHtlcs) -> Result<(), Error> {
        self.htlcs.lock().map_err(poisoned)?.insert(unresolved.channel_id, unresolved.clone());
        Ok(())
    }
}

/// Held while a channel is live. Dropping it lets the next session in.
pub type ChannelGuard = OwnedMutexGuard<()>;

/// One async mutex per channel id
#[derive(Clone, Default)]
pub struct ChannelLocks {
    locks: Arc<Mutex<BTreeMap<ChannelId, Arc<AsyncMutex<()>>>>>,
}

impl ChannelLocks {
    fn entry(&self, channel_id: &ChannelId) -> Result<Arc<AsyncMutex<()>>, Error> {
        let mut locks = self.locks.lock().map_err(poisoned)?;
        Ok(locks.entry(*channel_id).or_default().clone())
    }

    /// Wait until no other session holds the channel
    pub async fn lock(&self, channel_id: &ChannelId) -> Result<ChannelGuard, Error> {
        Ok(self.entry(channel_id)?.lock_owned().await)
    }

    /// Fails with [Error::AlreadyExists] if a session holds the channel
    pub fn try_lock(&self, channel_id: &ChannelId) -> Result<ChannelGuard, Error> {
        self.entry(channel_id)?
            .try_lock_owned()
            .map_err(|_| Error::AlreadyExists(format!("live session on channel {}", channel_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_utils::{make_channel_pair, ChannelPairConfig};
    use bitcoin::secp256k1::Secp256k1;

    #[test_log::test(tokio::test)]
    async fn second_session_waits_for_the_first() {
        let locks = ChannelLocks::default();
        let id = ChannelId([1; 32]);
        let guard = locks.lock(&id).await.unwrap();
        assert!(matches!(locks.try_lock(&id), Err(Error::AlreadyExists(_))));
        // other channels are independent
        let _other = locks.try_lock(&ChannelId([2; 32])).unwrap();
        drop(guard);
        assert!(locks.try_lock(&id).is_ok());
    }

    #[test_log::test]
    fn memory_store_round_trips() {
        let secp_ctx = Secp256k1::new();
        let (a, _b) = make_channel_pair(&secp_ctx, &ChannelPairConfig::default());
        let store = MemoryStore::default();
        let id = a.channel_id();
        assert!(matches!(ChannelStore::load(&store, &id), Err(Error::NotFound(_))));
        ChannelStore::save(&store, &a).unwrap();
        assert_eq!(ChannelStore::load(&store, &id).unwrap(), a);
        let ids: Vec<_> = store.list_channel_ids().unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(ids, vec![id]);
        assert!(BreachStore::load(&store, &id).unwrap().penalties.is_empty());
        assert!(HtlcStore::load(&store, &id).unwrap().is_none());
    }
}
