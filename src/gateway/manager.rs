//! Composite load balancer: one shared external address in front of one
//! (pool, virtual service) pair per port entry.
//!
//! Composite operations are resumable step sequences over the ordered port
//! list. Nothing is rolled back on failure; calling the same operation again
//! with the same arguments converges because every step is idempotent.

use std::net::Ipv4Addr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::allocator::AddressAllocator;
use super::details::{GatewayDetails, GatewayRef};
use super::nat::NatRuleManager;
use super::pool::PoolManager;
use super::seg::ServiceEngineGroupLookup;
use super::virtual_service::{NewVirtualService, VirtualServiceManager};
use crate::client::{GatewayClient, IpRange, Protocol};
use crate::error::{GatewayError, ResourceKind, Result};
use crate::record::VipRegistry;
use crate::retry::RetryConfig;

/// One listener of a composite load balancer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortDetails {
    /// Appended to the name prefixes to derive pool and virtual-service names
    pub port_suffix: String,
    pub external_port: u16,
    /// Port the pool members listen on
    pub internal_port: u16,
    pub protocol: Protocol,
    #[serde(default)]
    pub use_ssl: bool,
    #[serde(default)]
    pub cert_alias: Option<String>,
}

/// Internal address range for the one-arm topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneArm {
    pub start_ip: Ipv4Addr,
    pub end_ip: Ipv4Addr,
}

impl OneArm {
    pub fn range(&self) -> IpRange {
        IpRange::new(self.start_ip, self.end_ip)
    }
}

/// `<prefix>-<suffix>`
pub fn derived_name(prefix: &str, suffix: &str) -> String {
    format!("{}-{}", prefix, suffix)
}

/// Name of the DNAT rule fronting a one-arm virtual service
pub fn dnat_rule_name(virtual_service_name: &str) -> String {
    format!("dnat-{}", virtual_service_name)
}

pub struct GatewayManager {
    gateway: Arc<GatewayDetails>,
    vip_subnet: String,
    registry: VipRegistry,
    nat_rules: NatRuleManager,
    pools: PoolManager,
    service_engine_groups: ServiceEngineGroupLookup,
    virtual_services: VirtualServiceManager,
    allocator: AddressAllocator,
}

impl GatewayManager {
    /// Resolve the gateway behind `network_name` and build a manager on it.
    pub async fn connect(
        client: Arc<dyn GatewayClient>,
        registry: VipRegistry,
        network_name: &str,
        vip_subnet: impl Into<String>,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let details = GatewayDetails::resolve(client.as_ref(), network_name, cancel).await?;
        Ok(Self::new(client, registry, details, vip_subnet))
    }

    pub fn new(
        client: Arc<dyn GatewayClient>,
        registry: VipRegistry,
        details: GatewayDetails,
        vip_subnet: impl Into<String>,
    ) -> Self {
        let gateway = Arc::new(details);
        Self {
            vip_subnet: vip_subnet.into(),
            nat_rules: NatRuleManager::new(client.clone(), gateway.clone()),
            pools: PoolManager::new(client.clone(), gateway.clone()),
            service_engine_groups: ServiceEngineGroupLookup::new(client.clone(), gateway.clone()),
            virtual_services: VirtualServiceManager::new(
                client.clone(),
                gateway.clone(),
                registry.clone(),
            ),
            allocator: AddressAllocator::new(client, gateway.clone()),
            registry,
            gateway,
        }
    }

    pub fn with_pending_retry(mut self, retry: RetryConfig) -> Self {
        self.virtual_services = self.virtual_services.with_pending_retry(retry);
        self
    }

    pub fn gateway(&self) -> &GatewayRef {
        &self.gateway.reference
    }

    pub fn nat_rules(&self) -> &NatRuleManager {
        &self.nat_rules
    }

    pub fn pools(&self) -> &PoolManager {
        &self.pools
    }

    pub fn service_engine_groups(&self) -> &ServiceEngineGroupLookup {
        &self.service_engine_groups
    }

    pub fn virtual_services(&self) -> &VirtualServiceManager {
        &self.virtual_services
    }

    pub fn allocator(&self) -> &AddressAllocator {
        &self.allocator
    }

    /// Ensure every port entry has its pool and virtual service, all sharing
    /// one external address, and return that address.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_load_balancer(
        &self,
        cancel: &CancellationToken,
        name_prefix: &str,
        pool_name_prefix: &str,
        member_ips: &[String],
        ports: &[PortDetails],
        one_arm: Option<&OneArm>,
        owner_tag: &str,
    ) -> Result<String> {
        if ports.is_empty() {
            return Err(GatewayError::Configuration(format!(
                "load balancer '{}' has no ports",
                name_prefix
            )));
        }

        let seg = self.service_engine_groups.get(cancel).await?;

        let (found_external, found_internal) = self
            .discover_addresses(cancel, name_prefix, ports, one_arm.is_some())
            .await?;
        let external_ip = match found_external {
            Some(ip) => {
                debug!("Reusing external address {} of load balancer {}", ip, name_prefix);
                ip
            }
            None => self
                .allocator
                .allocate(cancel, &self.vip_subnet)
                .await?
                .to_string(),
        };
        let internal_ip = match (one_arm, found_internal) {
            (None, _) => external_ip.clone(),
            (Some(_), Some(ip)) => ip,
            (Some(arm), None) => self
                .allocator
                .allocate_internal(cancel, &arm.range())
                .await?
                .to_string(),
        };

        for port in ports {
            let vs_name = derived_name(name_prefix, &port.port_suffix);
            let pool_name = derived_name(pool_name_prefix, &port.port_suffix);

            if one_arm.is_some() {
                self.nat_rules
                    .create(
                        cancel,
                        &dnat_rule_name(&vs_name),
                        &external_ip,
                        &internal_ip,
                        port.external_port,
                        port.external_port,
                    )
                    .await?;
            }

            let pool = self
                .pools
                .create(cancel, &pool_name, member_ips, port.internal_port)
                .await?;

            self.virtual_services
                .create(
                    cancel,
                    &NewVirtualService {
                        name: vs_name,
                        pool,
                        service_engine_group: seg.clone(),
                        internal_ip: internal_ip.clone(),
                        external_ip: external_ip.clone(),
                        protocol: port.protocol,
                        port: port.external_port,
                        use_ssl: port.use_ssl,
                        certificate_alias: port.cert_alias.clone(),
                        owner_tag: owner_tag.to_string(),
                    },
                )
                .await?;
        }

        if let Some(record) = self.registry.for_owner(owner_tag) {
            record.add_virtual_ip(cancel, &external_ip).await?;
        }

        info!(
            "Load balancer {} ready on {} with {} port(s)",
            name_prefix,
            external_ip,
            ports.len()
        );
        Ok(external_ip)
    }

    /// External address of a composite member, or "" when it does not exist.
    pub async fn get_load_balancer(
        &self,
        cancel: &CancellationToken,
        virtual_service_name: &str,
        one_arm: Option<&OneArm>,
    ) -> Result<String> {
        let Some(vs) = self
            .virtual_services
            .get_summary(cancel, virtual_service_name)
            .await?
        else {
            return Ok(String::new());
        };

        if one_arm.is_none() {
            return Ok(vs.spec.virtual_ip);
        }

        let dnat = dnat_rule_name(virtual_service_name);
        match self.nat_rules.get_rule(cancel, &dnat).await? {
            Some(rule) => Ok(rule.spec.external_address),
            None => {
                warn!(
                    "Virtual service {} has no DNAT rule {}, external address unknown",
                    virtual_service_name, dnat
                );
                Ok(String::new())
            }
        }
    }

    /// Replace pool members and move the listener to `external_port`.
    /// Fails with `NotFound` when either resource is gone.
    pub async fn update_load_balancer(
        &self,
        cancel: &CancellationToken,
        pool_name: &str,
        virtual_service_name: &str,
        member_ips: &[String],
        internal_port: u16,
        external_port: u16,
    ) -> Result<()> {
        if self
            .virtual_services
            .get(cancel, virtual_service_name)
            .await?
            .is_none()
        {
            return Err(GatewayError::not_found(
                ResourceKind::VirtualService,
                virtual_service_name,
            ));
        }

        self.pools
            .update(cancel, pool_name, member_ips, internal_port)
            .await?;

        let dnat = dnat_rule_name(virtual_service_name);
        if self.nat_rules.get(cancel, &dnat).await?.is_some() {
            self.nat_rules
                .update_ports(cancel, &dnat, external_port, external_port)
                .await?;
        }

        self.virtual_services
            .update_port(cancel, virtual_service_name, external_port)
            .await?;

        info!(
            "Updated load balancer {}: pool {} -> port {}, listener -> port {}",
            virtual_service_name, pool_name, internal_port, external_port
        );
        Ok(())
    }

    /// Tear down every port entry. Absent pieces are skipped, so a second
    /// call is a no-op.
    pub async fn delete_load_balancer(
        &self,
        cancel: &CancellationToken,
        name_prefix: &str,
        pool_name_prefix: &str,
        ports: &[PortDetails],
        one_arm: Option<&OneArm>,
        owner_tag: &str,
    ) -> Result<()> {
        let (external_ip, _) = self
            .discover_addresses(cancel, name_prefix, ports, one_arm.is_some())
            .await?;

        // Released while every member is still in place, so a retry after a
        // failure further down can rediscover the address
        if let (Some(ip), Some(record)) =
            (external_ip.as_deref(), self.registry.for_owner(owner_tag))
        {
            record.remove_virtual_ip(cancel, ip).await?;
        }

        for port in ports {
            let vs_name = derived_name(name_prefix, &port.port_suffix);
            let pool_name = derived_name(pool_name_prefix, &port.port_suffix);

            self.virtual_services
                .delete(cancel, &vs_name, false, "", owner_tag)
                .await?;
            if one_arm.is_some() {
                self.nat_rules
                    .delete(cancel, &dnat_rule_name(&vs_name), false)
                    .await?;
            }
            self.pools.delete(cancel, &pool_name, false).await?;
        }

        info!("Deleted load balancer {} ({} port(s))", name_prefix, ports.len());
        Ok(())
    }

    /// Addresses already used by any existing member, as
    /// `(external, internal)`.
    async fn discover_addresses(
        &self,
        cancel: &CancellationToken,
        name_prefix: &str,
        ports: &[PortDetails],
        one_arm: bool,
    ) -> Result<(Option<String>, Option<String>)> {
        let mut internal = None;

        for port in ports {
            let vs_name = derived_name(name_prefix, &port.port_suffix);
            let listening = self
                .virtual_services
                .get_summary(cancel, &vs_name)
                .await?
                .map(|vs| vs.spec.virtual_ip);

            if !one_arm {
                if let Some(ip) = listening {
                    return Ok((Some(ip.clone()), Some(ip)));
                }
                continue;
            }

            if internal.is_none() {
                internal = listening;
            }
            if let Some(rule) = self
                .nat_rules
                .get_rule(cancel, &dnat_rule_name(&vs_name))
                .await?
            {
                return Ok((
                    Some(rule.spec.external_address),
                    internal.or(Some(rule.spec.internal_address)),
                ));
            }
        }

        Ok((None, internal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_derivation() {
        assert_eq!(derived_name("ingress-vs", "http"), "ingress-vs-http");
        assert_eq!(dnat_rule_name("ingress-vs-http"), "dnat-ingress-vs-http");
    }

    #[test]
    fn test_port_details_yaml() {
        let yaml = r#"
portSuffix: https
externalPort: 443
internalPort: 31235
protocol: HTTPS
useSsl: true
certAlias: cluster-cert
"#;
        let port: PortDetails = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(port.protocol, Protocol::Https);
        assert!(port.use_ssl);
        assert_eq!(port.cert_alias.as_deref(), Some("cluster-cert"));
    }

    #[test]
    fn test_one_arm_range() {
        let arm = OneArm {
            start_ip: Ipv4Addr::new(192, 168, 8, 2),
            end_ip: Ipv4Addr::new(192, 168, 8, 100),
        };
        assert_eq!(arm.range().to_string(), "192.168.8.2-192.168.8.100");
    }
}
