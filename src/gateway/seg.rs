use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::details::GatewayDetails;
use super::remote;
use crate::client::{GatewayClient, ResourceRef};
use crate::error::{GatewayError, Result};

/// Finds the service-engine group assigned to the gateway.
#[derive(Clone)]
pub struct ServiceEngineGroupLookup {
    client: Arc<dyn GatewayClient>,
    gateway: Arc<GatewayDetails>,
}

impl ServiceEngineGroupLookup {
    pub fn new(client: Arc<dyn GatewayClient>, gateway: Arc<GatewayDetails>) -> Self {
        Self { client, gateway }
    }

    /// The group virtual services are placed on. With several assigned,
    /// the first one by name wins so repeated calls agree.
    pub async fn get(&self, cancel: &CancellationToken) -> Result<ResourceRef> {
        let mut groups = remote(
            cancel,
            self.client.list_service_engine_groups(self.gateway.id()),
        )
        .await?;

        if groups.len() > 1 {
            debug!(
                "Gateway {} has {} service engine groups, picking the first by name",
                self.gateway.reference.name,
                groups.len()
            );
        }
        groups.sort_by(|a, b| a.name.cmp(&b.name));

        groups.into_iter().next().ok_or_else(|| {
            GatewayError::Configuration(format!(
                "no service engine group is assigned to gateway '{}'",
                self.gateway.reference.name
            ))
        })
    }
}
