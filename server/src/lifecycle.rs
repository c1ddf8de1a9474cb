//! Profile lifecycle: creation, restoration, re-attachment and eviction

use crate::cache::ProfileCache;
use crate::peer_manager::Peer;
use crate::server_profile::ServerProfile;
use crate::storage::ProfileStorage;
use log::{info, warn};
use shared::{ApplyReport, OwnerId, PeerId, ProfileError, ProfileResult, ProfileSchema};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How an owner's profile is backed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerKind {
    /// Restored from and persisted to durable storage
    Registered,
    /// Ephemeral: never restored, never persisted
    Guest,
}

/// What [`ProfileManager::acquire`] did
#[derive(Debug, Default, PartialEq)]
pub struct Acquisition {
    /// A new profile instance was built (as opposed to re-attached)
    pub created: bool,
    /// The new profile was loaded from storage
    pub restored: bool,
    /// Non-fatal problem, e.g. storage unavailable; the profile still works
    pub warning: Option<ProfileError>,
}

/// A profile leaving the cache, with its final snapshot if it must persist
#[derive(Debug)]
pub struct Evicted {
    pub owner: OwnerId,
    pub final_snapshot: Option<Vec<u8>>,
}

/// Outcome of [`ProfileManager::release_session`]
#[derive(Debug, PartialEq)]
pub enum SessionRelease {
    /// Grace period started; carries a snapshot to persist right away
    Released(Option<Vec<u8>>),
    /// A newer session owns the profile, which was left alone
    Stale,
    /// No cached profile for the owner
    Unknown,
}

pub struct ProfileManager {
    cache: Arc<ProfileCache>,
    schema: ProfileSchema,
    storage: Option<Arc<dyn ProfileStorage>>,
    grace: Duration,
}

impl ProfileManager {
    pub fn new(
        cache: Arc<ProfileCache>,
        schema: ProfileSchema,
        storage: Option<Arc<dyn ProfileStorage>>,
        grace: Duration,
    ) -> Self {
        Self {
            cache,
            schema,
            storage,
            grace,
        }
    }

    pub fn cache(&self) -> &Arc<ProfileCache> {
        &self.cache
    }

    pub fn schema(&self) -> &ProfileSchema {
        &self.schema
    }

    /// Returns the owner's profile, creating it on first association.
    ///
    /// A cached instance is re-attached (cancelling a pending eviction).
    /// Otherwise the schema builds a fresh profile and registered owners are
    /// restored from storage. Restore failures never block creation: the
    /// profile keeps its defaults and the failure is returned as a warning.
    pub async fn acquire(&self, owner: &str, peer: Option<&Arc<Peer>>, kind: OwnerKind) -> ProfileResult<Acquisition> {
        if self.cache.reattach(owner, peer) {
            info!("Re-attached cached profile for {}", owner);
            return Ok(Acquisition::default());
        }

        let mut profile = self.schema.build()?;
        let mut acquisition = Acquisition {
            created: true,
            ..Acquisition::default()
        };

        let storage = match kind {
            OwnerKind::Registered => self.storage.as_ref(),
            OwnerKind::Guest => None,
        };
        if let Some(storage) = storage {
            match storage.restore(owner).await {
                Ok(Some(snapshot)) => match profile.decode_snapshot(&snapshot) {
                    Ok(report) => {
                        if !report.unknown.is_empty() {
                            warn!("Stored profile of {} has unknown keys {:?}", owner, report.unknown);
                        }
                        acquisition.restored = true;
                    }
                    Err(err) => {
                        warn!("Stored profile of {} is unreadable, using defaults: {}", owner, err);
                        acquisition.warning = Some(err);
                    }
                },
                Ok(None) => {}
                Err(err) => {
                    warn!("Could not restore profile of {}, using defaults: {}", owner, err);
                    acquisition.warning = Some(err.into());
                }
            }
            // Restored state is not a change to propagate.
            profile.clear_delta();
        }

        let persist = storage.is_some();
        let mut server_profile = ServerProfile::new(owner.to_string(), profile, persist);
        if matches!(acquisition.warning, Some(ProfileError::StorageUnavailable(_))) {
            // The stored profile still exists; never overwrite it with defaults.
            server_profile.mark_unrestored();
        }
        if !self.cache.insert_if_absent(owner, server_profile, peer) {
            // Another login for the same owner finished first; keep its instance.
            return Ok(Acquisition::default());
        }
        info!(
            "Created profile for {} (restored: {}, persist: {})",
            owner, acquisition.restored, persist
        );
        Ok(acquisition)
    }

    /// Creates (or refreshes) a profile from a snapshot handed off by an
    /// upstream tier. The loaded state is not treated as a pending change.
    pub fn adopt_snapshot(&self, owner: &str, snapshot: &[u8]) -> ProfileResult<ApplyReport> {
        let existing = self.cache.with_mut(owner, |server_profile| {
            let profile = server_profile.profile_mut();
            let report = profile.decode_snapshot(snapshot)?;
            profile.clear_delta();
            Ok(report)
        });
        if let Some(result) = existing {
            self.cache.reattach(owner, None);
            return result;
        }

        let mut profile = self.schema.build()?;
        let report = profile.decode_snapshot(snapshot)?;
        profile.clear_delta();
        self.cache
            .insert_if_absent(owner, ServerProfile::new(owner.to_string(), profile, false), None);
        Ok(report)
    }

    /// Starts the grace period for a disconnected owner.
    ///
    /// Returns a snapshot when storage-bound changes are waiting; the caller
    /// persists it right away instead of waiting for the persist timer.
    pub fn release(&self, owner: &str, now: Instant) -> Option<Vec<u8>> {
        if !self.cache.schedule_eviction(owner, now + self.grace) {
            return None;
        }
        info!("Profile of {} released, evicting in {:?}", owner, self.grace);
        self.cache
            .with_mut(owner, ServerProfile::take_persist_snapshot)
            .flatten()
    }

    /// Starts the grace period for the client session `peer`.
    ///
    /// A session that was replaced by a newer login of the same owner does
    /// not release the profile.
    pub fn release_session(&self, owner: &str, peer: PeerId, now: Instant) -> SessionRelease {
        match self.cache.schedule_eviction_for(owner, peer, now + self.grace) {
            None => SessionRelease::Unknown,
            Some(false) => SessionRelease::Stale,
            Some(true) => {
                info!("Profile of {} released by peer {}, evicting in {:?}", owner, peer, self.grace);
                let snapshot = self
                    .cache
                    .with_mut(owner, ServerProfile::take_persist_snapshot)
                    .flatten();
                SessionRelease::Released(snapshot)
            }
        }
    }

    /// Loads the stored state of a profile whose restore failed earlier and
    /// merges it in. Returns the merge report, or `None` when the profile no
    /// longer waits for its stored state.
    pub async fn retry_restore(&self, owner: &str) -> ProfileResult<Option<ApplyReport>> {
        let waiting = self.cache.with(owner, ServerProfile::is_unrestored).unwrap_or(false);
        let Some(storage) = self.storage.as_ref().filter(|_| waiting) else {
            return Ok(None);
        };

        let stored = match storage.restore(owner).await? {
            Some(snapshot) => {
                let mut stored = self.schema.build()?;
                match stored.decode_snapshot(&snapshot) {
                    Ok(_) => Some(stored),
                    Err(err) => {
                        warn!("Stored profile of {} is unreadable, keeping live state: {}", owner, err);
                        None
                    }
                }
            }
            None => None,
        };

        let report = self.cache.with_mut(owner, |server_profile| {
            if !server_profile.is_unrestored() {
                return Ok(None);
            }
            match &stored {
                Some(stored) => server_profile.merge_restored(stored).map(Some),
                None => {
                    server_profile.mark_restored();
                    Ok(Some(ApplyReport::default()))
                }
            }
        });
        let report = report.transpose()?.flatten();
        if report.is_some() {
            info!("Restored stored profile of {}", owner);
        }
        Ok(report)
    }

    /// Drops every profile whose grace period ended.
    pub fn evict_expired(&self, now: Instant) -> Vec<Evicted> {
        self.cache
            .take_expired(now)
            .into_iter()
            .map(|mut profile| {
                if profile.has_stranded_changes() {
                    warn!(
                        "Dropping unsaved changes of {}: its stored profile was never restored",
                        profile.owner()
                    );
                }
                info!("Evicted profile of {}", profile.owner());
                Evicted {
                    owner: profile.owner().to_string(),
                    final_snapshot: profile.take_persist_snapshot(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use shared::schema::{keys, player_schema};
    use shared::ObservableInt;

    fn manager_with(storage: Arc<MemoryStorage>) -> ProfileManager {
        ProfileManager::new(
            Arc::new(ProfileCache::new()),
            player_schema(),
            Some(storage),
            Duration::from_secs(10),
        )
    }

    fn stored_snapshot(coins: i32) -> Vec<u8> {
        let mut profile = player_schema().build().unwrap();
        profile
            .update(keys::COINS, |p: &mut ObservableInt| p.set(coins))
            .unwrap();
        profile.encode_snapshot()
    }

    fn coins(manager: &ProfileManager, owner: &str) -> i32 {
        manager
            .cache()
            .with(owner, |p| {
                *p.profile()
                    .property::<ObservableInt>(keys::COINS)
                    .unwrap()
                    .get()
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_acquire_restores_registered_owner() {
        let storage = Arc::new(MemoryStorage::new());
        storage.insert("ann", stored_snapshot(500));
        let manager = manager_with(storage);

        let acquisition = manager.acquire("ann", None, OwnerKind::Registered).await.unwrap();
        assert!(acquisition.created);
        assert!(acquisition.restored);
        assert_eq!(acquisition.warning, None);
        assert_eq!(coins(&manager, "ann"), 500);
        assert_eq!(
            manager.cache().with("ann", |p| p.profile().has_dirty_properties()),
            Some(false)
        );
    }

    #[tokio::test]
    async fn test_guest_skips_storage() {
        let storage = Arc::new(MemoryStorage::new());
        storage.insert("guest-1", stored_snapshot(500));
        let manager = manager_with(storage);

        let acquisition = manager.acquire("guest-1", None, OwnerKind::Guest).await.unwrap();
        assert!(!acquisition.restored);
        assert_eq!(coins(&manager, "guest-1"), 0);
        assert_eq!(manager.cache().with("guest-1", |p| p.persists()), Some(false));
    }

    #[tokio::test]
    async fn test_storage_failure_is_a_warning() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set_offline(true);
        let manager = manager_with(storage);

        let acquisition = manager.acquire("ann", None, OwnerKind::Registered).await.unwrap();
        assert!(acquisition.created);
        assert!(!acquisition.restored);
        assert!(matches!(
            acquisition.warning,
            Some(ProfileError::StorageUnavailable(_))
        ));
        assert_eq!(coins(&manager, "ann"), 0);
    }

    #[tokio::test]
    async fn test_failed_restore_never_overwrites_storage() {
        let storage = Arc::new(MemoryStorage::new());
        let mut stored = player_schema().build().unwrap();
        stored.update(keys::COINS, |p: &mut ObservableInt| p.set(5000)).unwrap();
        stored.update(keys::LEVEL, |p: &mut ObservableInt| p.set(12)).unwrap();
        storage.insert("ann", stored.encode_snapshot());
        storage.set_offline(true);
        let manager = manager_with(Arc::clone(&storage));

        manager.acquire("ann", None, OwnerKind::Registered).await.unwrap();
        manager
            .cache()
            .with_mut("ann", |p| p.update(keys::COINS, |c: &mut ObservableInt| c.set(10)))
            .unwrap()
            .unwrap();
        assert_eq!(
            manager.cache().with_mut("ann", ServerProfile::take_persist_snapshot),
            Some(None)
        );
        assert_eq!(manager.cache().unrestored(), vec!["ann".to_string()]);

        // Still offline: nothing changes.
        assert!(manager.retry_restore("ann").await.is_err());
        assert!(manager.cache().with("ann", ServerProfile::is_unrestored).unwrap());

        storage.set_offline(false);
        let report = manager.retry_restore("ann").await.unwrap();
        assert!(report.is_some());
        assert!(manager.cache().unrestored().is_empty());
        assert_eq!(coins(&manager, "ann"), 10);

        let snapshot = manager
            .cache()
            .with_mut("ann", ServerProfile::take_persist_snapshot)
            .flatten()
            .unwrap();
        let mut check = player_schema().build().unwrap();
        check.decode_snapshot(&snapshot).unwrap();
        assert_eq!(*check.property::<ObservableInt>(keys::COINS).unwrap().get(), 10);
        assert_eq!(*check.property::<ObservableInt>(keys::LEVEL).unwrap().get(), 12);

        assert_eq!(manager.retry_restore("ann").await, Ok(None));
    }

    #[tokio::test]
    async fn test_retry_restore_with_empty_storage_unblocks_persist() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set_offline(true);
        let manager = manager_with(Arc::clone(&storage));
        manager.acquire("ann", None, OwnerKind::Registered).await.unwrap();
        manager
            .cache()
            .with_mut("ann", |p| p.update(keys::COINS, |c: &mut ObservableInt| c.set(4)))
            .unwrap()
            .unwrap();

        storage.set_offline(false);
        assert_eq!(manager.retry_restore("ann").await, Ok(Some(ApplyReport::default())));
        assert_eq!(coins(&manager, "ann"), 4);
        assert!(manager.cache().with("ann", ServerProfile::needs_persist).unwrap());
    }

    #[tokio::test]
    async fn test_stale_session_release_is_ignored() {
        let storage = Arc::new(MemoryStorage::new());
        let manager = manager_with(storage);
        let first = Arc::new(Peer {
            id: 1,
            addr: "127.0.0.1:7001".parse().unwrap(),
            role: shared::PeerRole::Client,
        });
        let second = Arc::new(Peer {
            id: 2,
            addr: "127.0.0.1:7002".parse().unwrap(),
            role: shared::PeerRole::Client,
        });
        manager.acquire("ann", Some(&first), OwnerKind::Registered).await.unwrap();
        manager.acquire("ann", Some(&second), OwnerKind::Registered).await.unwrap();

        let now = Instant::now();
        assert_eq!(manager.release_session("ann", 1, now), SessionRelease::Stale);
        assert_eq!(manager.cache().eviction_time("ann"), None);
        assert_eq!(manager.release_session("ann", 2, now), SessionRelease::Released(None));
        assert!(manager.cache().eviction_time("ann").is_some());
        assert_eq!(manager.release_session("bob", 2, now), SessionRelease::Unknown);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_falls_back_to_defaults() {
        let storage = Arc::new(MemoryStorage::new());
        storage.insert("ann", vec![0, 0, 0, 5, 1]);
        let manager = manager_with(storage);

        let acquisition = manager.acquire("ann", None, OwnerKind::Registered).await.unwrap();
        assert!(matches!(
            acquisition.warning,
            Some(ProfileError::MalformedPayload { .. })
        ));
        assert_eq!(coins(&manager, "ann"), 0);
    }

    #[tokio::test]
    async fn test_reacquire_within_grace_reuses_instance() {
        let storage = Arc::new(MemoryStorage::new());
        let manager = manager_with(storage);
        manager.acquire("ann", None, OwnerKind::Registered).await.unwrap();
        manager
            .cache()
            .with_mut("ann", |p| p.update(keys::COINS, |c: &mut ObservableInt| c.set(7)))
            .unwrap()
            .unwrap();

        let now = Instant::now();
        manager.release("ann", now);
        let again = manager.acquire("ann", None, OwnerKind::Registered).await.unwrap();
        assert!(!again.created);
        assert_eq!(coins(&manager, "ann"), 7);
        assert!(manager.evict_expired(now + Duration::from_secs(60)).is_empty());
    }

    #[tokio::test]
    async fn test_release_returns_pending_storage_snapshot() {
        let storage = Arc::new(MemoryStorage::new());
        let manager = manager_with(storage);
        manager.acquire("ann", None, OwnerKind::Registered).await.unwrap();

        let now = Instant::now();
        assert!(manager.release("ann", now).is_none());

        manager.acquire("ann", None, OwnerKind::Registered).await.unwrap();
        manager
            .cache()
            .with_mut("ann", |p| p.update(keys::COINS, |c: &mut ObservableInt| c.set(3)))
            .unwrap()
            .unwrap();
        let snapshot = manager.release("ann", now).unwrap();

        let mut check = player_schema().build().unwrap();
        check.decode_snapshot(&snapshot).unwrap();
        assert_eq!(*check.property::<ObservableInt>(keys::COINS).unwrap().get(), 3);
    }

    #[tokio::test]
    async fn test_eviction_after_grace() {
        let storage = Arc::new(MemoryStorage::new());
        let manager = manager_with(storage);
        manager.acquire("ann", None, OwnerKind::Registered).await.unwrap();

        let now = Instant::now();
        manager.release("ann", now);
        assert!(manager.evict_expired(now + Duration::from_secs(9)).is_empty());
        let evicted = manager.evict_expired(now + Duration::from_secs(10));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].owner, "ann");
        assert!(!manager.cache().contains("ann"));
    }

    #[test]
    fn test_adopt_snapshot_is_clean() {
        let manager = ProfileManager::new(
            Arc::new(ProfileCache::new()),
            player_schema(),
            None,
            Duration::from_secs(1),
        );
        manager.adopt_snapshot("ann", &stored_snapshot(42)).unwrap();
        assert_eq!(coins(&manager, "ann"), 42);
        assert_eq!(
            manager.cache().with("ann", |p| p.profile().has_dirty_properties()),
            Some(false)
        );

        manager.adopt_snapshot("ann", &stored_snapshot(43)).unwrap();
        assert_eq!(coins(&manager, "ann"), 43);
        assert!(manager.adopt_snapshot("bob", &[1, 2]).is_err());
        assert!(!manager.cache().contains("bob"));
    }

    #[test]
    fn test_duplicate_key_schema_aborts() {
        let schema = ProfileSchema::new("broken", |profile| {
            profile.register(ObservableInt::new(1, 0))?;
            profile.register(ObservableInt::new(1, 0))
        });
        let manager = ProfileManager::new(Arc::new(ProfileCache::new()), schema, None, Duration::from_secs(1));
        let result = tokio_test::block_on(manager.acquire("ann", None, OwnerKind::Guest));
        assert_eq!(result, Err(ProfileError::DuplicateKey { key: 1 }));
        assert!(manager.cache().is_empty());
    }
}
