//! Gateway resolution, done once per manager.

use tokio_util::sync::CancellationToken;
use tracing::info;

use super::remote;
use crate::client::{GatewayClient, IpRange};
use crate::error::{GatewayError, Result};

/// Identity of the edge gateway every reconciler is bound to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayRef {
    pub name: String,
    pub id: String,
}

/// Cached facts about the gateway behind a VDC network.
///
/// Immutable after [`GatewayDetails::resolve`]; reconcilers never re-resolve.
#[derive(Debug, Clone)]
pub struct GatewayDetails {
    pub reference: GatewayRef,
    pub external_ranges: Vec<IpRange>,
}

impl GatewayDetails {
    pub fn new(reference: GatewayRef, external_ranges: Vec<IpRange>) -> Self {
        Self {
            reference,
            external_ranges,
        }
    }

    /// Look up the gateway attached to `network_name`.
    ///
    /// A missing network name or an unknown network is a configuration
    /// error, not something a retry can fix.
    pub async fn resolve(
        client: &dyn GatewayClient,
        network_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        if network_name.trim().is_empty() {
            return Err(GatewayError::Configuration(
                "load balancer network name is empty".to_string(),
            ));
        }

        let gateway = remote(cancel, client.find_gateway(network_name))
            .await?
            .ok_or_else(|| {
                GatewayError::Configuration(format!(
                    "no edge gateway is attached to network '{}'",
                    network_name
                ))
            })?;

        info!(
            "Resolved gateway {} ({}) for network {} with {} external range(s)",
            gateway.name,
            gateway.id,
            network_name,
            gateway.external_ranges.len()
        );

        Ok(Self {
            reference: GatewayRef {
                name: gateway.name,
                id: gateway.id,
            },
            external_ranges: gateway.external_ranges,
        })
    }

    pub fn id(&self) -> &str {
        &self.reference.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InMemoryGateway;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_resolve_known_network() {
        let range = IpRange::new(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 9));
        let client = InMemoryGateway::single("ovdc-net", vec![range]);

        let details = GatewayDetails::resolve(&client, "ovdc-net", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(details.reference.name, "edge-1");
        assert_eq!(details.id(), "urn:gateway:edge-1");
        assert_eq!(details.external_ranges, vec![range]);
    }

    #[tokio::test]
    async fn test_unknown_network_is_configuration_error() {
        let client = InMemoryGateway::single("ovdc-net", vec![]);
        let err = GatewayDetails::resolve(&client, "other", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Configuration(_)));

        let err = GatewayDetails::resolve(&client, " ", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Configuration(_)));
    }
}
