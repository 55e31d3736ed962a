use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::core::hasher::{HashEvent, IntegrityHasher};
use crate::store::{StoreEvent, WhitelistStore};

const HASH_EVENT_BUFFER: usize = 64;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub store: Arc<WhitelistStore>,
    pub hasher: IntegrityHasher,
}

/// Event streams produced by the context's components, consumed by the orchestrator.
pub struct ContextEvents {
    pub hashes: mpsc::Receiver<HashEvent>,
    pub store: mpsc::UnboundedReceiver<StoreEvent>,
}

impl AppContext {
    pub fn new(config: AppConfig) -> (Self, ContextEvents) {
        let (hash_tx, hash_rx) = mpsc::channel(HASH_EVENT_BUFFER);
        let (store_tx, store_rx) = mpsc::unbounded_channel();

        let store = WhitelistStore::open_with_events(&config.database_path, store_tx);
        store.set_auto_save(config.auto_save);
        let hasher = IntegrityHasher::new(config.max_concurrent_hashes, hash_tx);

        (
            Self {
                config: Arc::new(config),
                store: Arc::new(store),
                hasher,
            },
            ContextEvents {
                hashes: hash_rx,
                store: store_rx,
            },
        )
    }
}
