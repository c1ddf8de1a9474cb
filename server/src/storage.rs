//! Durable profile storage
//!
//! Storage only ever sees profile snapshots in the shared binary codec.

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::debug;
use shared::{OwnerId, ProfileError};
use std::error::Error;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {message}")]
    Unavailable {
        message: String,
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    #[error("storage is offline")]
    Offline,
}

impl StorageError {
    pub fn unavailable(message: String, source: impl Error + Send + Sync + 'static) -> Self {
        StorageError::Unavailable {
            message,
            source: Box::new(source),
        }
    }
}

impl From<StorageError> for ProfileError {
    fn from(err: StorageError) -> Self {
        ProfileError::StorageUnavailable(err.to_string())
    }
}

/// Backend holding the last persisted snapshot of every owner
pub trait ProfileStorage: Send + Sync {
    /// Loads the stored snapshot, `None` when the owner has none yet.
    fn restore<'a>(&'a self, owner: &'a str) -> BoxFuture<'a, StorageResult<Option<Vec<u8>>>>;

    fn persist<'a>(&'a self, owner: &'a str, snapshot: Vec<u8>) -> BoxFuture<'a, StorageResult<()>>;
}

/// Process-local storage, handy for tests and single-process setups
#[derive(Default)]
pub struct MemoryStorage {
    snapshots: DashMap<OwnerId, Vec<u8>>,
    offline: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage: every call fails while offline.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn snapshot(&self, owner: &str) -> Option<Vec<u8>> {
        self.snapshots.get(owner).map(|entry| entry.value().clone())
    }

    pub fn insert(&self, owner: &str, snapshot: Vec<u8>) {
        self.snapshots.insert(owner.to_string(), snapshot);
    }

    fn check_online(&self) -> StorageResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StorageError::Offline)
        } else {
            Ok(())
        }
    }
}

impl ProfileStorage for MemoryStorage {
    fn restore<'a>(&'a self, owner: &'a str) -> BoxFuture<'a, StorageResult<Option<Vec<u8>>>> {
        async move {
            self.check_online()?;
            Ok(self.snapshot(owner))
        }
        .boxed()
    }

    fn persist<'a>(&'a self, owner: &'a str, snapshot: Vec<u8>) -> BoxFuture<'a, StorageResult<()>> {
        async move {
            self.check_online()?;
            self.insert(owner, snapshot);
            Ok(())
        }
        .boxed()
    }
}

/// One `<owner>.profile` file per owner inside a directory
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, owner: &str) -> PathBuf {
        let file_name: String = owner
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(format!("{}.profile", file_name))
    }
}

impl ProfileStorage for FileStorage {
    fn restore<'a>(&'a self, owner: &'a str) -> BoxFuture<'a, StorageResult<Option<Vec<u8>>>> {
        async move {
            let path = self.path_for(owner);
            match tokio::fs::read(&path).await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(StorageError::unavailable(
                    format!("reading {}", path.display()),
                    e,
                )),
            }
        }
        .boxed()
    }

    fn persist<'a>(&'a self, owner: &'a str, snapshot: Vec<u8>) -> BoxFuture<'a, StorageResult<()>> {
        async move {
            tokio::fs::create_dir_all(&self.root)
                .await
                .map_err(|e| StorageError::unavailable(format!("creating {}", self.root.display()), e))?;

            // Write then rename so a crash never leaves a torn snapshot.
            let path = self.path_for(owner);
            let tmp = path.with_extension("profile.tmp");
            tokio::fs::write(&tmp, &snapshot)
                .await
                .map_err(|e| StorageError::unavailable(format!("writing {}", tmp.display()), e))?;
            tokio::fs::rename(&tmp, &path)
                .await
                .map_err(|e| StorageError::unavailable(format!("renaming {}", tmp.display()), e))?;
            debug!("Persisted {} bytes for {}", snapshot.len(), owner);
            Ok(())
        }
        .boxed()
    }
}
