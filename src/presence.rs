//! Presence: advisory online markers for uids and device tokens.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::TransportError;

pub const KEY_PREFIX_USER_ONLINE: &str = "user#online#";
pub const KEY_PREFIX_DEVICE_ONLINE: &str = "device#online#";

pub fn user_online_key(uid: i64) -> String {
    format!("{}{}", KEY_PREFIX_USER_ONLINE, uid)
}

pub fn device_online_key(token: &str) -> String {
    format!("{}{}", KEY_PREFIX_DEVICE_ONLINE, token)
}

#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn set(&self, key: &str, value: &str) -> Result<(), TransportError>;
    async fn del(&self, key: &str) -> Result<(), TransportError>;
    async fn get(&self, key: &str) -> Result<Option<String>, TransportError>;
}

#[derive(Default)]
pub struct MemoryPresence {
    entries: DashMap<String, String>,
}

impl MemoryPresence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresence {
    async fn set(&self, key: &str, value: &str) -> Result<(), TransportError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), TransportError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, TransportError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }
}
