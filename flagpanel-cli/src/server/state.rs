use std::sync::Arc;
use std::time::Duration;

use flagpanel_lib::store::{HttpObjectStore, HttpStoreConfig, MemoryStore, SledStore};
use flagpanel_lib::{DocumentStore, FlagRepository, StoreError};
use tracing::info;

use super::config::{PanelConfig, StorageBackend, StorageConfig};
use super::metrics::metrics;
use super::session::SessionStore;

/// Shared application state for the HTTP server.
pub struct AppState {
    pub repository: FlagRepository,
    pub sessions: SessionStore,
    /// Server configuration (tokens, operators, cookie settings).
    pub config: Arc<PanelConfig>,
}

impl AppState {
    pub fn new(store: Arc<dyn DocumentStore>, config: PanelConfig) -> Self {
        let sessions = SessionStore::new(
            &config.auth.operators,
            Duration::from_secs(config.auth.session_ttl_secs),
        );
        Self {
            repository: FlagRepository::new(store),
            sessions,
            config: Arc::new(config),
        }
    }
}

/// Open the document store the configuration names.
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn DocumentStore>, StoreError> {
    let store: Arc<dyn DocumentStore> = match config.backend {
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
        StorageBackend::Sled => Arc::new(SledStore::open(&config.data_dir)?),
        StorageBackend::Http => {
            let store = HttpObjectStore::new(&HttpStoreConfig {
                endpoint: config.endpoint.clone(),
                bucket: config.bucket.clone(),
                region: config.region.clone(),
                object_key: config.object_key.clone(),
                token: config.token.clone(),
                access_key_id: config.access_key_id.clone(),
                secret_access_key: config.secret_access_key.clone(),
            })?;
            info!(location = store.location(), signed = store.is_signed(), "using object store");
            Arc::new(store)
        }
    };

    metrics()
        .storage_backend
        .with_label_values(&[store.backend_name()])
        .set(1);
    Ok(store)
}
