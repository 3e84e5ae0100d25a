use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::codec::DEFAULT_MAX_FRAME_LEN;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Address and credentials of the presence / membership key-value store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub addr: String,
    pub password: String,
    pub db: i64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:6379".to_string(),
            password: String::new(),
            db: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CometConfig {
    pub listen_addr: String,
    /// Distinguishes this comet's consumer group on the dispatch topic.
    pub instance_id: String,
    pub queue_addr: String,
    pub presence: PresenceConfig,
    pub max_frame_len: usize,
    /// Capacity of each connection's inbound/outbound queue and of the logic channel.
    pub queue_capacity: usize,
}

impl Default for CometConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:12000".to_string(),
            instance_id: "comet-1".to_string(),
            queue_addr: "127.0.0.1:4150".to_string(),
            presence: PresenceConfig::default(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Snowflake worker id, `0 <= worker_id < 1024`.
    pub worker_id: i64,
    pub queue_addr: String,
    pub presence: PresenceConfig,
    pub workers: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_id: 1,
            queue_addr: "127.0.0.1:4150".to_string(),
            presence: PresenceConfig::default(),
            workers: num_cpus::get().clamp(1, 8),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub queue_addr: String,
    pub presence: PresenceConfig,
    /// `file://<path>` or a bare path to the append-only message log.
    pub message_store_url: String,
    pub workers: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    /// Also persist packets published on the offline topic.
    pub subscribe_offline: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            queue_addr: "127.0.0.1:4150".to_string(),
            presence: PresenceConfig::default(),
            message_store_url: "file://im_data/messages.log".to_string(),
            workers: 2,
            batch_size: 128,
            flush_interval_ms: 50,
            subscribe_offline: false,
        }
    }
}

impl StoreConfig {
    pub fn message_store_path(&self) -> &str {
        self.message_store_url
            .strip_prefix("file://")
            .unwrap_or(&self.message_store_url)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    pub queue_addr: String,
    pub presence: PresenceConfig,
    pub workers: usize,
    /// Packets kept per offline uid before the oldest is dropped.
    pub inbox_capacity: usize,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            queue_addr: "127.0.0.1:4150".to_string(),
            presence: PresenceConfig::default(),
            workers: 2,
            inbox_capacity: 1000,
        }
    }
}

/// All four tiers plus the collaborator seeds used by the all-in-one binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub comet: CometConfig,
    pub dispatch: DispatchConfig,
    pub store: StoreConfig,
    pub push: PushConfig,
    /// JSON file `{ "<groupId>": [uid, ...] }` seeding the membership store.
    pub membership_file: Option<String>,
    /// Shared secret accepted by the default credential validator.
    pub auth_token: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            comet: CometConfig::default(),
            dispatch: DispatchConfig::default(),
            store: StoreConfig::default(),
            push: PushConfig::default(),
            membership_file: None,
            auth_token: crate::auth::DEFAULT_TOKEN.to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path)?;
        let config: GatewayConfig = serde_json::from_str(&data)?;
        Ok(config)
    }
}
