use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::AppConfig;

/// Tenant descriptor. Never mutated once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct App {
    pub id: String,
    pub key: String,
    pub secret: String,
    pub name: String,
    pub allowed_origins: Vec<String>,
    pub capacity: Option<u64>,
    pub enable_client_messages: bool,
}

/// Resolves app keys presented in the connection URL.
#[async_trait]
pub trait AppDirectory: Send + Sync {
    async fn resolve(&self, key: &str) -> Option<Arc<App>>;

    async fn find_by_id(&self, id: &str) -> Option<Arc<App>>;
}

/// Directory backed by the `[[apps]]` section of the config file.
pub struct StaticAppDirectory {
    by_key: HashMap<String, Arc<App>>,
    by_id: HashMap<String, Arc<App>>,
}

impl StaticAppDirectory {
    pub fn new(apps: impl IntoIterator<Item = App>) -> Self {
        let mut by_key = HashMap::new();
        let mut by_id = HashMap::new();
        for app in apps {
            let app = Arc::new(app);
            by_key.insert(app.key.clone(), app.clone());
            by_id.insert(app.id.clone(), app);
        }
        Self { by_key, by_id }
    }

    pub fn from_config(apps: &[AppConfig]) -> Self {
        Self::new(apps.iter().map(AppConfig::to_app))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }
}

#[async_trait]
impl AppDirectory for StaticAppDirectory {
    async fn resolve(&self, key: &str) -> Option<Arc<App>> {
        self.by_key.get(key.trim()).cloned()
    }

    async fn find_by_id(&self, id: &str) -> Option<Arc<App>> {
        self.by_id.get(id.trim()).cloned()
    }
}
