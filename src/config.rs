use std::collections::HashSet;
use std::env;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::apps::App;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub apps: Vec<AppConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_bind")]
    pub bind: String,
    #[serde(default)]
    pub http_bind: Option<String>,
    #[serde(default = "default_activity_timeout_secs")]
    pub activity_timeout_secs: u64,
    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    #[serde(default = "default_empty_origin_list")]
    pub empty_origin_list: EmptyOriginList,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_server_bind(),
            http_bind: None,
            activity_timeout_secs: default_activity_timeout_secs(),
            pong_timeout_secs: default_pong_timeout_secs(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            max_message_bytes: default_max_message_bytes(),
            empty_origin_list: default_empty_origin_list(),
        }
    }
}

/// What an app with no configured origins accepts. A missing `Origin`
/// header is refused under both policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyOriginList {
    AllowAny,
    DenyAll,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default = "default_replication_driver")]
    pub driver: ReplicationDriver,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default)]
    pub node_id: Option<String>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            driver: default_replication_driver(),
            namespace: default_namespace(),
            redis_url: default_redis_url(),
            node_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationDriver {
    Local,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub id: String,
    pub key: String,
    pub secret: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub capacity: Option<u64>,
    #[serde(default)]
    pub enable_client_messages: bool,
}

impl AppConfig {
    pub fn to_app(&self) -> App {
        App {
            id: self.id.trim().to_owned(),
            key: self.key.trim().to_owned(),
            secret: self.secret.clone(),
            name: self
                .name
                .clone()
                .unwrap_or_else(|| self.id.trim().to_owned()),
            allowed_origins: self.allowed_origins.clone(),
            capacity: self.capacity,
            enable_client_messages: self.enable_client_messages,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed reading config file {}", path.display()))?;
            toml::from_str::<Config>(&text)
                .with_context(|| format!("failed parsing TOML config {}", path.display()))?
        } else {
            Self::default()
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_cli_overrides(&mut self, bind: Option<&str>) {
        if let Some(bind) = bind.map(str::trim).filter(|value| !value.is_empty()) {
            self.server.bind = bind.to_owned();
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("PUSHER_GW_BIND") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.server.bind = trimmed.to_owned();
            }
        }
        if let Ok(v) = env::var("PUSHER_GW_HTTP_BIND") {
            let trimmed = v.trim();
            self.server.http_bind = if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_owned())
            };
        }
        if let Ok(v) = env::var("PUSHER_GW_ACTIVITY_TIMEOUT_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                self.server.activity_timeout_secs = n.max(1);
            }
        }
        if let Ok(v) = env::var("PUSHER_GW_PONG_TIMEOUT_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                self.server.pong_timeout_secs = n.max(1);
            }
        }
        if let Ok(v) = env::var("PUSHER_GW_OUTBOUND_QUEUE_CAPACITY") {
            if let Ok(n) = v.parse::<usize>() {
                self.server.outbound_queue_capacity = n.max(8);
            }
        }
        if let Ok(v) = env::var("PUSHER_GW_MAX_MESSAGE_BYTES") {
            if let Ok(n) = v.parse::<usize>() {
                self.server.max_message_bytes = n.max(256);
            }
        }
        if let Ok(v) = env::var("PUSHER_GW_EMPTY_ORIGIN_LIST") {
            if let Some(policy) = parse_empty_origin_list(&v) {
                self.server.empty_origin_list = policy;
            }
        }
        if let Ok(v) = env::var("PUSHER_GW_REPLICATION_DRIVER") {
            if let Some(driver) = parse_replication_driver(&v) {
                self.replication.driver = driver;
            }
        }
        if let Ok(v) = env::var("PUSHER_GW_NAMESPACE") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.replication.namespace = trimmed.to_owned();
            }
        }
        if let Ok(v) = env::var("PUSHER_GW_REDIS_URL") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.replication.redis_url = trimmed.to_owned();
            }
        }
        if let Ok(v) = env::var("PUSHER_GW_NODE_ID") {
            let trimmed = v.trim();
            self.replication.node_id = if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_owned())
            };
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.bind.trim().is_empty() {
            anyhow::bail!("server.bind must not be empty");
        }
        if self
            .server
            .http_bind
            .as_deref()
            .is_some_and(|bind| bind.trim().is_empty())
        {
            anyhow::bail!("server.http_bind must not be empty when provided");
        }
        if self.server.activity_timeout_secs == 0 {
            anyhow::bail!("server.activity_timeout_secs must be > 0");
        }
        if self.server.pong_timeout_secs == 0 {
            anyhow::bail!("server.pong_timeout_secs must be > 0");
        }
        if self.server.outbound_queue_capacity == 0 {
            anyhow::bail!("server.outbound_queue_capacity must be > 0");
        }
        if self.server.max_message_bytes == 0 {
            anyhow::bail!("server.max_message_bytes must be > 0");
        }
        if self.replication.namespace.trim().is_empty() {
            anyhow::bail!("replication.namespace must not be empty");
        }
        if self.replication.driver == ReplicationDriver::Redis {
            let url = self.replication.redis_url.trim();
            if !(url.starts_with("redis://") || url.starts_with("rediss://")) {
                anyhow::bail!(
                    "replication.driver=redis requires replication.redis_url (redis:// or rediss://)"
                );
            }
        }

        let mut ids = HashSet::new();
        let mut keys = HashSet::new();
        for (idx, app) in self.apps.iter().enumerate() {
            let id = app.id.trim();
            let key = app.key.trim();
            if id.is_empty() {
                anyhow::bail!("apps[{idx}].id must not be empty");
            }
            if key.is_empty() {
                anyhow::bail!("apps[{idx}].key must not be empty");
            }
            if app.secret.trim().is_empty() {
                anyhow::bail!("apps[{idx}].secret must not be empty");
            }
            if app.capacity == Some(0) {
                anyhow::bail!("apps[{idx}].capacity must be > 0 when set");
            }
            if !ids.insert(id.to_owned()) {
                anyhow::bail!("duplicate app id `{id}`");
            }
            if !keys.insert(key.to_owned()) {
                anyhow::bail!("duplicate app key `{key}`");
            }
        }
        Ok(())
    }
}

fn default_server_bind() -> String {
    "127.0.0.1:6001".to_owned()
}

fn default_activity_timeout_secs() -> u64 {
    120
}

fn default_pong_timeout_secs() -> u64 {
    30
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_max_message_bytes() -> usize {
    10 * 1024
}

fn default_empty_origin_list() -> EmptyOriginList {
    EmptyOriginList::AllowAny
}

fn default_replication_driver() -> ReplicationDriver {
    ReplicationDriver::Local
}

fn default_namespace() -> String {
    "pusher-gateway".to_owned()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_owned()
}

fn parse_empty_origin_list(s: &str) -> Option<EmptyOriginList> {
    match s.trim().to_ascii_lowercase().as_str() {
        "allow_any" | "allow-any" | "allow" => Some(EmptyOriginList::AllowAny),
        "deny_all" | "deny-all" | "deny" => Some(EmptyOriginList::DenyAll),
        _ => None,
    }
}

fn parse_replication_driver(s: &str) -> Option<ReplicationDriver> {
    match s.trim().to_ascii_lowercase().as_str() {
        "local" | "memory" => Some(ReplicationDriver::Local),
        "redis" => Some(ReplicationDriver::Redis),
        _ => None,
    }
}
