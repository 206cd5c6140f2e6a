//! In-Process Instance Adapter
//!
//! Implements the `InstanceEndpoint` port over a `CacheInstance` living in the
//! same process. A stopped instance answers every request with
//! `RemoteUnavailable`, the same way a dead remote would. Store work runs on
//! the blocking pool, so a request timeout can fire while the store is busy.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::domain::ports::{EntityInfo, InstanceEndpoint};
use crate::error::{Error, Result};
use crate::instance::CacheInstance;

#[derive(Debug, Clone)]
pub struct LocalEndpoint {
    instance: Arc<CacheInstance>,
}

impl LocalEndpoint {
    pub fn new(instance: Arc<CacheInstance>) -> Self {
        Self { instance }
    }

    pub fn instance(&self) -> &Arc<CacheInstance> {
        &self.instance
    }

    fn ensure_running(&self) -> Result<()> {
        if self.instance.is_stopped() {
            return Err(Error::RemoteUnavailable {
                uid: 0,
                reason: format!("instance {} is stopped", self.instance.name()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl InstanceEndpoint for LocalEndpoint {
    async fn entity_info(&self) -> Result<EntityInfo> {
        self.ensure_running()?;
        self.instance
            .blocking(|instance| Ok(instance.entity_info()))
            .await
    }

    async fn update_size(&self, bytes: u64) -> Result<()> {
        self.ensure_running()?;
        self.instance.blocking(move |instance| instance.resize(bytes)).await
    }

    async fn poison_pill(&self) {
        if !self.instance.is_stopped() {
            info!(name = %self.instance.name(), "Received poison pill");
            self.instance.stop();
        }
    }
}
