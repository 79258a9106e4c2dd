//! Key-value runtime parameters shared with operators.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

pub const KEY_FETCH_MODE: &str = "partner_fetch_mode";
pub const KEY_FETCH_PAGE: &str = "partner_fetch_page";
pub const KEY_TARGET_COUNTRY: &str = "partner_country";
pub const KEY_ERROR_RECIPIENT: &str = "error_recipient";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings backend error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Exclusive hold on the fetch-target keys. Released on drop.
pub struct SettingsLease {
    _guard: Box<dyn Send>,
}

impl SettingsLease {
    pub fn new(guard: impl Send + 'static) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, SettingsError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), SettingsError>;
    async fn unset(&self, key: &str) -> Result<(), SettingsError>;

    /// Wait for exclusive use of the fetch-target keys. Holders may override
    /// and restore them, or read them without seeing another holder's
    /// temporary values.
    async fn lease(&self) -> Result<SettingsLease, SettingsError>;
}

#[derive(Debug, Default)]
pub struct MemorySettings {
    values: Mutex<HashMap<String, String>>,
    lease: Arc<Mutex<()>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: Mutex::new(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect()),
            lease: Arc::default(),
        }
    }

    pub async fn snapshot(&self) -> HashMap<String, String> {
        self.values.lock().await.clone()
    }
}

#[async_trait]
impl SettingsStore for MemorySettings {
    async fn get(&self, key: &str) -> Result<Option<String>, SettingsError> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        self.values.lock().await.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn unset(&self, key: &str) -> Result<(), SettingsError> {
        self.values.lock().await.remove(key);
        Ok(())
    }

    async fn lease(&self) -> Result<SettingsLease, SettingsError> {
        Ok(SettingsLease::new(Arc::clone(&self.lease).lock_owned().await))
    }
}
