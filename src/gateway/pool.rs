use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::details::GatewayDetails;
use super::remote;
use crate::client::{ClientError, GatewayClient, Pool, PoolSpec, ResourceRef};
use crate::error::{GatewayError, ResourceKind, Result};

/// Read-only view of a pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSummary {
    pub reference: ResourceRef,
    pub member_count: usize,
    pub port: u16,
}

impl From<&Pool> for PoolSummary {
    fn from(pool: &Pool) -> Self {
        Self {
            reference: pool.reference(),
            member_count: pool.spec.members.len(),
            port: pool.spec.port,
        }
    }
}

/// Reconciler for load-balancer pools. Member lists are always replaced
/// wholesale, never merged.
#[derive(Clone)]
pub struct PoolManager {
    client: Arc<dyn GatewayClient>,
    gateway: Arc<GatewayDetails>,
}

impl PoolManager {
    pub fn new(client: Arc<dyn GatewayClient>, gateway: Arc<GatewayDetails>) -> Self {
        Self { client, gateway }
    }

    /// Ensure the pool exists with exactly `members` on `port`.
    pub async fn create(
        &self,
        cancel: &CancellationToken,
        name: &str,
        members: &[String],
        port: u16,
    ) -> Result<ResourceRef> {
        let spec = PoolSpec {
            name: name.to_string(),
            members: members.to_vec(),
            port,
        };

        if let Some(existing) = self.find(cancel, name).await? {
            return self.apply(cancel, existing, spec).await;
        }

        match remote(cancel, self.client.create_pool(self.gateway.id(), &spec)).await {
            Ok(reference) => {
                info!(
                    "Created pool {} with {} member(s) on port {}",
                    name,
                    members.len(),
                    port
                );
                Ok(reference)
            }
            Err(GatewayError::Backend(ClientError::AlreadyExists(_))) => {
                let existing = self
                    .find(cancel, name)
                    .await?
                    .ok_or_else(|| GatewayError::not_found(ResourceKind::Pool, name))?;
                self.apply(cancel, existing, spec).await
            }
            Err(e) => Err(e),
        }
    }

    /// Replace members and port of an existing pool.
    pub async fn update(
        &self,
        cancel: &CancellationToken,
        name: &str,
        members: &[String],
        port: u16,
    ) -> Result<ResourceRef> {
        let existing = self
            .find(cancel, name)
            .await?
            .ok_or_else(|| GatewayError::not_found(ResourceKind::Pool, name))?;
        let spec = PoolSpec {
            name: name.to_string(),
            members: members.to_vec(),
            port,
        };
        self.apply(cancel, existing, spec).await
    }

    pub async fn delete(
        &self,
        cancel: &CancellationToken,
        name: &str,
        fail_if_absent: bool,
    ) -> Result<()> {
        let Some(pool) = self.find(cancel, name).await? else {
            return self.absent(name, fail_if_absent);
        };

        match remote(cancel, self.client.delete_pool(self.gateway.id(), &pool.id)).await {
            Ok(()) => {
                info!("Deleted pool {} ({})", name, pool.id);
                Ok(())
            }
            Err(GatewayError::Backend(ClientError::NotFound(_))) => {
                self.absent(name, fail_if_absent)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get(&self, cancel: &CancellationToken, name: &str) -> Result<Option<ResourceRef>> {
        Ok(self.find(cancel, name).await?.map(|pool| pool.reference()))
    }

    pub async fn get_summary(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<Option<PoolSummary>> {
        Ok(self.find(cancel, name).await?.as_ref().map(PoolSummary::from))
    }

    async fn find(&self, cancel: &CancellationToken, name: &str) -> Result<Option<Pool>> {
        remote(cancel, self.client.find_pool(self.gateway.id(), name)).await
    }

    async fn apply(
        &self,
        cancel: &CancellationToken,
        pool: Pool,
        spec: PoolSpec,
    ) -> Result<ResourceRef> {
        if pool.spec == spec {
            debug!("Pool {} already up to date", spec.name);
            return Ok(pool.reference());
        }

        remote(
            cancel,
            self.client.update_pool(self.gateway.id(), &pool.id, &spec),
        )
        .await
        .map_err(|e| match e {
            GatewayError::Backend(ClientError::NotFound(_)) => {
                GatewayError::not_found(ResourceKind::Pool, &spec.name)
            }
            other => other,
        })?;

        info!(
            "Updated pool {}: {} member(s) on port {}",
            spec.name,
            spec.members.len(),
            spec.port
        );
        Ok(pool.reference())
    }

    fn absent(&self, name: &str, fail_if_absent: bool) -> Result<()> {
        if fail_if_absent {
            return Err(GatewayError::not_found(ResourceKind::Pool, name));
        }
        warn!("Pool {} does not exist, nothing to delete", name);
        Ok(())
    }
}
