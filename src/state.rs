use std::sync::Arc;

use tracing::info;

use crate::auth::{
    repo_types::{EMAIL, USER_COLUMNS},
    AuthManager,
};
use crate::config::{AppConfig, AuthConfig, DatabaseConfig, DEFAULT_STORE_NAME};
use crate::store::{MemoryStore, MongoStore, PgStore, Store};

/// Concrete backend behind the manager, kept for connection lifecycle.
#[derive(Clone)]
pub enum Backend {
    Document(MongoStore),
    Relational(PgStore),
    Memory,
}

#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthManager>,
    pub backend: Backend,
}

impl AppState {
    pub const FAKE_SECRET: &'static str = "test-secret";

    pub async fn init() -> anyhow::Result<Self> {
        let config = AppConfig::from_env()?;
        Self::connect(&config).await
    }

    pub async fn connect(config: &AppConfig) -> anyhow::Result<Self> {
        let (backend, store): (Backend, Arc<dyn Store>) = match &config.database {
            DatabaseConfig::Mongo { url, database } => {
                let store = MongoStore::connect(url, database).await?;
                (Backend::Document(store.clone()), Arc::new(store) as Arc<dyn Store>)
            }
            DatabaseConfig::Postgres { url } => {
                let store = PgStore::connect(url).await?;
                sqlx::migrate!("./migrations").run(store.pool()).await?;
                // the migration covers the default table only
                store
                    .ensure_table(&config.auth.store_name, USER_COLUMNS)
                    .await?;
                info!("connected to relational store");
                (Backend::Relational(store.clone()), Arc::new(store) as Arc<dyn Store>)
            }
        };

        let auth = AuthManager::new(config.auth.clone(), store)?;
        auth.prepare().await?;

        Ok(Self {
            auth: Arc::new(auth),
            backend,
        })
    }

    pub fn from_parts(auth: Arc<AuthManager>, backend: Backend) -> Self {
        Self { auth, backend }
    }

    /// Releases backend connections. Safe to call once at shutdown.
    pub async fn close(&self) -> anyhow::Result<()> {
        match &self.backend {
            Backend::Document(store) => store.disconnect().await?,
            Backend::Relational(store) => store.disconnect().await?,
            Backend::Memory => {}
        }
        info!("store disconnected");
        Ok(())
    }

    /// In-memory state for tests.
    pub fn fake() -> Self {
        let store = MemoryStore::new().with_unique(DEFAULT_STORE_NAME, EMAIL);
        let store = Arc::new(store) as Arc<dyn Store>;
        let auth = AuthManager::new(AuthConfig::new(Self::FAKE_SECRET), store)
            .expect("fake config is valid");
        Self {
            auth: Arc::new(auth),
            backend: Backend::Memory,
        }
    }
}
