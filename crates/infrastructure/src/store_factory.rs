use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use jobqueue_config::{StoreBackend, StoreConfig};
use jobqueue_domain::Stores;
use jobqueue_errors::JobQueueResult;

use crate::{InMemoryStore, RedisStore};

pub struct StoreFactory;

impl StoreFactory {
    pub async fn create(config: &StoreConfig) -> JobQueueResult<Stores> {
        debug!("Creating store with backend: {:?}", config.backend);

        match config.backend {
            StoreBackend::Memory => {
                info!("使用进程内存储，状态不会在进程间共享");
                Ok(Stores::from_backend(Arc::new(InMemoryStore::new())))
            }
            StoreBackend::Redis => {
                info!("Initializing Redis store");
                let store = RedisStore::connect(
                    &config.redis_url,
                    &config.key_prefix,
                    Duration::from_secs(config.connection_timeout_seconds),
                )
                .await?;
                Ok(Stores::from_backend(Arc::new(store)))
            }
        }
    }
}
