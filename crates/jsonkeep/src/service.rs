//! The state shared by all request handlers.

use std::sync::Arc;

use anyhow::{Context, Result};
use jsonkeep_service::config::Config;
use jsonkeep_service::fetch::Fetcher;
use jsonkeep_service::keep::Keep;
use jsonkeep_service::store::{CacheStore, PersistQueue};
use jsonkeep_service::utils::http::{FetchTimeouts, create_client};

/// The underlying service for the HTTP request handlers.
///
/// Creating the service spawns the keep actor and the persist worker, so this has to happen
/// within the runtime that serves requests.
#[derive(Debug, Clone)]
pub struct Service {
    keep: Keep,
    fetcher: Fetcher,
    store: Arc<dyn CacheStore>,
}

impl Service {
    pub fn create(config: &Config) -> Result<Self> {
        let client = create_client(&FetchTimeouts::from_config(config))
            .context("failed to create the upstream client")?;

        let store = config.store.create();
        tracing::info!("Using the {} store", store.name());
        let persist = PersistQueue::new(
            store.clone(),
            config.max_persist_queue_size,
            config.max_concurrent_persists,
        );

        let fetcher = Fetcher::new(client, config.upstream.clone(), persist);
        let keep = Keep::spawn(config.ttl, fetcher.clone());

        Ok(Self {
            keep,
            fetcher,
            store,
        })
    }

    /// Replaces the keep, to test how handlers react to its state.
    #[cfg(test)]
    pub fn with_keep(self, keep: Keep) -> Self {
        Self { keep, ..self }
    }

    pub fn keep(&self) -> &Keep {
        &self.keep
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }
}
