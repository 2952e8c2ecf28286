use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::details::GatewayDetails;
use super::remote;
use crate::client::{ClientError, GatewayClient, NatRule, NatRuleSpec, ResourceRef};
use crate::error::{GatewayError, ResourceKind, Result};

/// Idempotent reconciler for DNAT rules on one gateway.
#[derive(Clone)]
pub struct NatRuleManager {
    client: Arc<dyn GatewayClient>,
    gateway: Arc<GatewayDetails>,
}

impl NatRuleManager {
    pub fn new(client: Arc<dyn GatewayClient>, gateway: Arc<GatewayDetails>) -> Self {
        Self { client, gateway }
    }

    /// Ensure a rule named `name` exists with the given targets. An existing
    /// rule with the same name is retargeted in place when it differs.
    pub async fn create(
        &self,
        cancel: &CancellationToken,
        name: &str,
        external_ip: &str,
        internal_ip: &str,
        external_port: u16,
        internal_port: u16,
    ) -> Result<ResourceRef> {
        let spec = NatRuleSpec {
            name: name.to_string(),
            external_address: external_ip.to_string(),
            internal_address: internal_ip.to_string(),
            external_port,
            internal_port,
        };

        if let Some(existing) = self.find(cancel, name).await? {
            debug!("NAT rule {} already exists ({})", name, existing.id);
            return self.apply(cancel, existing, spec).await;
        }

        match remote(cancel, self.client.create_nat_rule(self.gateway.id(), &spec)).await {
            Ok(reference) => {
                info!(
                    "Created NAT rule {}: {}:{} -> {}:{}",
                    name, external_ip, external_port, internal_ip, internal_port
                );
                Ok(reference)
            }
            Err(GatewayError::Backend(ClientError::AlreadyExists(_))) => {
                // A concurrent creator won the race
                let existing = self.require(cancel, name).await?;
                self.apply(cancel, existing, spec).await
            }
            Err(e) => Err(e),
        }
    }

    /// Retarget an existing rule. The external port is left untouched.
    pub async fn update(
        &self,
        cancel: &CancellationToken,
        name: &str,
        external_ip: &str,
        internal_ip: &str,
        internal_port: u16,
    ) -> Result<ResourceRef> {
        let rule = self.require(cancel, name).await?;
        let spec = NatRuleSpec {
            external_address: external_ip.to_string(),
            internal_address: internal_ip.to_string(),
            internal_port,
            ..rule.spec.clone()
        };
        self.apply(cancel, rule, spec).await
    }

    /// Move an existing rule to new ports, keeping both addresses.
    pub async fn update_ports(
        &self,
        cancel: &CancellationToken,
        name: &str,
        external_port: u16,
        internal_port: u16,
    ) -> Result<ResourceRef> {
        let rule = self.require(cancel, name).await?;
        let spec = NatRuleSpec {
            external_port,
            internal_port,
            ..rule.spec.clone()
        };
        self.apply(cancel, rule, spec).await
    }

    /// Remove a rule. A missing rule is an error only when `fail_if_absent`.
    pub async fn delete(
        &self,
        cancel: &CancellationToken,
        name: &str,
        fail_if_absent: bool,
    ) -> Result<()> {
        let Some(rule) = self.find(cancel, name).await? else {
            return self.absent(name, fail_if_absent);
        };

        match remote(cancel, self.client.delete_nat_rule(self.gateway.id(), &rule.id)).await {
            Ok(()) => {
                info!("Deleted NAT rule {} ({})", name, rule.id);
                Ok(())
            }
            Err(GatewayError::Backend(ClientError::NotFound(_))) => {
                self.absent(name, fail_if_absent)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get(&self, cancel: &CancellationToken, name: &str) -> Result<Option<ResourceRef>> {
        Ok(self.find(cancel, name).await?.map(|rule| rule.reference()))
    }

    /// Full rule as stored on the gateway
    pub async fn get_rule(&self, cancel: &CancellationToken, name: &str) -> Result<Option<NatRule>> {
        self.find(cancel, name).await
    }

    async fn find(&self, cancel: &CancellationToken, name: &str) -> Result<Option<NatRule>> {
        remote(cancel, self.client.find_nat_rule(self.gateway.id(), name)).await
    }

    async fn require(&self, cancel: &CancellationToken, name: &str) -> Result<NatRule> {
        self.find(cancel, name)
            .await?
            .ok_or_else(|| GatewayError::not_found(ResourceKind::NatRule, name))
    }

    async fn apply(
        &self,
        cancel: &CancellationToken,
        rule: NatRule,
        spec: NatRuleSpec,
    ) -> Result<ResourceRef> {
        if rule.spec == spec {
            debug!("NAT rule {} already up to date", spec.name);
            return Ok(rule.reference());
        }

        remote(
            cancel,
            self.client.update_nat_rule(self.gateway.id(), &rule.id, &spec),
        )
        .await
        .map_err(|e| match e {
            GatewayError::Backend(ClientError::NotFound(_)) => {
                GatewayError::not_found(ResourceKind::NatRule, &spec.name)
            }
            other => other,
        })?;

        info!(
            "Updated NAT rule {}: {}:{} -> {}:{}",
            spec.name,
            spec.external_address,
            spec.external_port,
            spec.internal_address,
            spec.internal_port
        );
        Ok(rule.reference())
    }

    fn absent(&self, name: &str, fail_if_absent: bool) -> Result<()> {
        if fail_if_absent {
            return Err(GatewayError::not_found(ResourceKind::NatRule, name));
        }
        warn!("NAT rule {} does not exist, nothing to delete", name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InMemoryGateway;
    use crate::gateway::details::GatewayRef;

    fn manager() -> (Arc<InMemoryGateway>, NatRuleManager) {
        let client = Arc::new(InMemoryGateway::single("net", vec![]));
        let details = GatewayDetails::new(
            GatewayRef {
                name: "edge-1".into(),
                id: "urn:gateway:edge-1".into(),
            },
            vec![],
        );
        let mgr = NatRuleManager::new(client.clone(), Arc::new(details));
        (client, mgr)
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let (client, mgr) = manager();
        let cancel = CancellationToken::new();

        let first = mgr
            .create(&cancel, "dnat-web", "10.0.0.5", "192.168.8.2", 80, 80)
            .await
            .unwrap();
        let second = mgr
            .create(&cancel, "dnat-web", "10.0.0.5", "192.168.8.2", 80, 80)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(client.nat_rule_count(), 1);
    }

    #[tokio::test]
    async fn test_create_retargets_existing_rule() {
        let (client, mgr) = manager();
        let cancel = CancellationToken::new();

        let first = mgr
            .create(&cancel, "dnat-web", "10.0.0.5", "192.168.8.2", 443, 443)
            .await
            .unwrap();
        let second = mgr
            .create(&cancel, "dnat-web", "10.0.0.5", "192.168.8.2", 8443, 8443)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(client.nat_rule_count(), 1);
        let rule = mgr.get_rule(&cancel, "dnat-web").await.unwrap().unwrap();
        assert_eq!(rule.spec.external_port, 8443);
        assert_eq!(rule.spec.internal_port, 8443);
        assert_eq!(rule.spec.external_address, "10.0.0.5");
    }

    #[tokio::test]
    async fn test_update_missing_rule() {
        let (_, mgr) = manager();
        let err = mgr
            .update(&CancellationToken::new(), "nope", "1.1.1.1", "2.2.2.2", 80)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_update_retargets_rule() {
        let (_, mgr) = manager();
        let cancel = CancellationToken::new();
        mgr.create(&cancel, "dnat-web", "10.0.0.5", "192.168.8.2", 80, 80)
            .await
            .unwrap();

        mgr.update(&cancel, "dnat-web", "10.0.0.6", "192.168.8.3", 8080)
            .await
            .unwrap();

        let rule = mgr.get_rule(&cancel, "dnat-web").await.unwrap().unwrap();
        assert_eq!(rule.spec.external_address, "10.0.0.6");
        assert_eq!(rule.spec.internal_address, "192.168.8.3");
        assert_eq!(rule.spec.external_port, 80);
        assert_eq!(rule.spec.internal_port, 8080);
    }

    #[tokio::test]
    async fn test_update_ports() {
        let (_, mgr) = manager();
        let cancel = CancellationToken::new();
        mgr.create(&cancel, "dnat-web", "10.0.0.5", "192.168.8.2", 80, 80)
            .await
            .unwrap();

        mgr.update_ports(&cancel, "dnat-web", 8443, 8443).await.unwrap();

        let rule = mgr.get_rule(&cancel, "dnat-web").await.unwrap().unwrap();
        assert_eq!(rule.spec.external_port, 8443);
        assert_eq!(rule.spec.external_address, "10.0.0.5");
    }

    #[tokio::test]
    async fn test_delete_strict_and_lenient() {
        let (client, mgr) = manager();
        let cancel = CancellationToken::new();
        mgr.create(&cancel, "dnat-web", "10.0.0.5", "192.168.8.2", 80, 80)
            .await
            .unwrap();

        mgr.delete(&cancel, "dnat-web", true).await.unwrap();
        assert_eq!(client.nat_rule_count(), 0);
        assert!(mgr.get(&cancel, "dnat-web").await.unwrap().is_none());

        mgr.delete(&cancel, "dnat-web", false).await.unwrap();
        assert!(mgr
            .delete(&cancel, "dnat-web", true)
            .await
            .unwrap_err()
            .is_not_found());
    }
}
