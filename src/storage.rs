//! Local key-value storage - persistent JSON map for auth state

use crate::config::Config;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

pub const KEY_TOKEN: &str = "token";
pub const KEY_USER_ID: &str = "UserId";
pub const KEY_ROLE: &str = "role";
pub const KEY_USER: &str = "user";

/// Persistent string map, written atomically on every change
pub struct KeyValueStore {
    path: PathBuf,
    data: BTreeMap<String, String>,
}

impl KeyValueStore {
    pub fn new(config: &Config) -> Self {
        Self {
            path: config.store_file.clone(),
            data: BTreeMap::new(),
        }
    }

    /// Open and load in one step
    pub fn open(config: &Config) -> Result<Self> {
        let mut store = Self::new(config);
        store.load()?;
        Ok(store)
    }

    /// Load store from disk
    pub fn load(&mut self) -> Result<usize> {
        if !self.path.exists() {
            self.data = BTreeMap::new();
            return Ok(0);
        }

        let content = fs::read_to_string(&self.path)?;
        self.data = serde_json::from_str(&content)?;
        Ok(self.data.len())
    }

    /// Save store to disk atomically
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let parent = self.path.parent().unwrap_or(std::path::Path::new("."));
        let mut temp = NamedTempFile::new_in(parent)?;

        let json = serde_json::to_string_pretty(&self.data)?;
        temp.write_all(json.as_bytes())?;
        temp.as_file().sync_all()?;

        temp.persist(&self.path).map_err(|e| Error::Io(e.error))?;

        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) -> Result<()> {
        self.data.insert(key.to_string(), value.into());
        self.save()
    }

    pub fn remove(&mut self, key: &str) -> Result<Option<String>> {
        let removed = self.data.remove(key);
        if removed.is_some() {
            self.save()?;
        }
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Profile of the signed-in user, stored as JSON under `user`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// Typed view over the auth keys
#[derive(Debug, Clone, PartialEq)]
pub struct Credentials {
    pub token: String,
    pub user_id: String,
    pub role: Option<String>,
    pub user: Option<UserProfile>,
}

impl Credentials {
    /// Read credentials; `None` unless both token and user id are present
    pub fn load(store: &KeyValueStore) -> Option<Self> {
        let token = store.get(KEY_TOKEN)?.to_string();
        let user_id = store.get(KEY_USER_ID)?.to_string();
        let user = store
            .get(KEY_USER)
            .and_then(|raw| serde_json::from_str(raw).ok());

        Some(Self {
            token,
            user_id,
            role: store.get(KEY_ROLE).map(str::to_string),
            user,
        })
    }

    pub fn save(&self, store: &mut KeyValueStore) -> Result<()> {
        store.data.insert(KEY_TOKEN.to_string(), self.token.clone());
        store.data.insert(KEY_USER_ID.to_string(), self.user_id.clone());
        match &self.role {
            Some(role) => store.data.insert(KEY_ROLE.to_string(), role.clone()),
            None => store.data.remove(KEY_ROLE),
        };
        match &self.user {
            Some(user) => store
                .data
                .insert(KEY_USER.to_string(), serde_json::to_string(user)?),
            None => store.data.remove(KEY_USER),
        };
        store.save()
    }

    /// Remove every auth key (logout)
    pub fn clear(store: &mut KeyValueStore) -> Result<()> {
        for key in [KEY_TOKEN, KEY_USER_ID, KEY_ROLE, KEY_USER] {
            store.data.remove(key);
        }
        store.save()
    }
}
