//! Profile schemas
//!
//! A schema is the registration routine every tier runs to build an empty
//! profile. Keys are never sent over the wire, so all tiers must build their
//! profiles from the same schema.

use crate::error::ProfileResult;
use crate::list::ObservableList;
use crate::map::ObservableMap;
use crate::profile::Profile;
use crate::scalar::{ObservableDateTime, ObservableFloat, ObservableInt, ObservableLong, ObservableString};
use std::fmt;
use std::sync::Arc;
use time::OffsetDateTime;

type Registrar = dyn Fn(&mut Profile) -> ProfileResult<()> + Send + Sync;

/// Factory for fresh profiles
#[derive(Clone)]
pub struct ProfileSchema {
    name: String,
    registrar: Arc<Registrar>,
}

impl fmt::Debug for ProfileSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileSchema").field("name", &self.name).finish()
    }
}

impl ProfileSchema {
    pub fn new<F>(name: impl Into<String>, registrar: F) -> Self
    where
        F: Fn(&mut Profile) -> ProfileResult<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            registrar: Arc::new(registrar),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Builds a profile with default values.
    ///
    /// A registrar that registers the same key twice aborts construction with
    /// `DuplicateKey`.
    pub fn build(&self) -> ProfileResult<Profile> {
        let mut profile = Profile::new();
        (self.registrar)(&mut profile)?;
        Ok(profile)
    }
}

/// Property keys of the player schema
pub mod keys {
    use crate::PropertyKey;

    pub const COINS: PropertyKey = 1;
    pub const LEVEL: PropertyKey = 2;
    pub const NICKNAME: PropertyKey = 3;
    pub const INVENTORY: PropertyKey = 4;
    pub const QUEST_PROGRESS: PropertyKey = 5;
    pub const LAST_LOGIN: PropertyKey = 6;
    pub const VOLUME: PropertyKey = 7;
    pub const EXPERIENCE: PropertyKey = 8;
}

/// Player profile used by the bundled binaries and tests.
pub fn player_schema() -> ProfileSchema {
    ProfileSchema::new("player", |profile| {
        profile.register(ObservableInt::new(keys::COINS, 0))?;
        profile.register(ObservableInt::new(keys::LEVEL, 1))?;
        profile.register(ObservableString::new(keys::NICKNAME, String::new()))?;
        profile.register(ObservableList::<String>::new(keys::INVENTORY))?;
        profile.register(ObservableMap::<String, i32>::new(keys::QUEST_PROGRESS))?;
        profile.register(ObservableDateTime::new(keys::LAST_LOGIN, OffsetDateTime::UNIX_EPOCH))?;
        profile.register(ObservableFloat::new(keys::VOLUME, 1.0))?;
        profile.register(ObservableLong::new(keys::EXPERIENCE, 0))?;
        Ok(())
    })
}
