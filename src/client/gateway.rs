use std::fmt;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Data structures (pure, no I/O)
// ============================================================================

/// Identity of a gateway-side resource: caller-chosen name plus the
/// backend-assigned opaque id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub name: String,
    pub id: String,
}

impl ResourceRef {
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
        }
    }
}

/// Inclusive range of external addresses assigned to a gateway uplink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpRange {
    pub start_address: Ipv4Addr,
    pub end_address: Ipv4Addr,
}

impl IpRange {
    pub fn new(start_address: Ipv4Addr, end_address: Ipv4Addr) -> Self {
        Self {
            start_address,
            end_address,
        }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        addr >= self.start_address && addr <= self.end_address
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start_address, self.end_address)
    }
}

/// Edge gateway as returned by the lookup call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeGateway {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub external_ranges: Vec<IpRange>,
}

/// Desired state of a DNAT rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NatRuleSpec {
    pub name: String,
    pub external_address: String,
    pub internal_address: String,
    pub external_port: u16,
    pub internal_port: u16,
}

/// A DNAT rule as stored on the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NatRule {
    pub id: String,
    #[serde(flatten)]
    pub spec: NatRuleSpec,
}

impl NatRule {
    pub fn reference(&self) -> ResourceRef {
        ResourceRef::new(&self.spec.name, &self.id)
    }
}

/// Desired state of a load-balancer pool. Members are replaced wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSpec {
    pub name: String,
    pub members: Vec<String>,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pool {
    pub id: String,
    #[serde(flatten)]
    pub spec: PoolSpec,
}

impl Pool {
    pub fn reference(&self) -> ResourceRef {
        ResourceRef::new(&self.spec.name, &self.id)
    }
}

/// Listener protocol of a virtual service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "HTTP",
            Protocol::Https => "HTTPS",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HTTP" => Ok(Protocol::Http),
            "HTTPS" => Ok(Protocol::Https),
            other => Err(format!("unsupported protocol '{}'", other)),
        }
    }
}

/// Desired state of a virtual service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualServiceSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub pool: ResourceRef,
    pub service_engine_group: ResourceRef,
    /// Address the listener is bound to on the gateway
    pub virtual_ip: String,
    pub protocol: Protocol,
    pub port: u16,
    pub use_ssl: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_alias: Option<String>,
}

/// Settle state reported by the backend for a virtual service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VirtualServiceStatus {
    /// Service-engine capacity is still being provisioned
    Pending,
    #[default]
    Ready,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualService {
    pub id: String,
    #[serde(flatten)]
    pub spec: VirtualServiceSpec,
    #[serde(default)]
    pub status: VirtualServiceStatus,
}

impl VirtualService {
    pub fn reference(&self) -> ResourceRef {
        ResourceRef::new(&self.spec.name, &self.id)
    }
}

/// Errors surfaced by a gateway transport.
///
/// `NotFound`, `AlreadyExists` and `Busy` are the discriminators the
/// reconcilers act on; everything else is passed through.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("backend busy: {0}")]
    Busy(String),

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("JSON parse error: {0}")]
    Parse(String),
}

// ============================================================================
// SBIO: Trait for abstraction (allows in-memory backends in tests)
// ============================================================================

/// Authenticated access to one cloud's edge-gateway API.
///
/// Every `find_*` call returns `Ok(None)` when nothing carries the name.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Locate the edge gateway the given VDC network is attached to
    async fn find_gateway(&self, network_name: &str) -> Result<Option<EdgeGateway>, ClientError>;

    async fn find_nat_rule(
        &self,
        gateway_id: &str,
        name: &str,
    ) -> Result<Option<NatRule>, ClientError>;

    async fn list_nat_rules(&self, gateway_id: &str) -> Result<Vec<NatRule>, ClientError>;

    async fn create_nat_rule(
        &self,
        gateway_id: &str,
        spec: &NatRuleSpec,
    ) -> Result<ResourceRef, ClientError>;

    async fn update_nat_rule(
        &self,
        gateway_id: &str,
        id: &str,
        spec: &NatRuleSpec,
    ) -> Result<(), ClientError>;

    async fn delete_nat_rule(&self, gateway_id: &str, id: &str) -> Result<(), ClientError>;

    async fn find_pool(&self, gateway_id: &str, name: &str) -> Result<Option<Pool>, ClientError>;

    async fn create_pool(
        &self,
        gateway_id: &str,
        spec: &PoolSpec,
    ) -> Result<ResourceRef, ClientError>;

    async fn update_pool(
        &self,
        gateway_id: &str,
        id: &str,
        spec: &PoolSpec,
    ) -> Result<(), ClientError>;

    async fn delete_pool(&self, gateway_id: &str, id: &str) -> Result<(), ClientError>;

    /// Service-engine groups assigned to the gateway
    async fn list_service_engine_groups(
        &self,
        gateway_id: &str,
    ) -> Result<Vec<ResourceRef>, ClientError>;

    async fn find_virtual_service(
        &self,
        gateway_id: &str,
        name: &str,
    ) -> Result<Option<VirtualService>, ClientError>;

    async fn list_virtual_services(
        &self,
        gateway_id: &str,
    ) -> Result<Vec<VirtualService>, ClientError>;

    async fn create_virtual_service(
        &self,
        gateway_id: &str,
        spec: &VirtualServiceSpec,
    ) -> Result<ResourceRef, ClientError>;

    async fn update_virtual_service(
        &self,
        gateway_id: &str,
        id: &str,
        spec: &VirtualServiceSpec,
    ) -> Result<(), ClientError>;

    async fn delete_virtual_service(&self, gateway_id: &str, id: &str)
        -> Result<(), ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_parse() {
        assert_eq!("http".parse::<Protocol>().unwrap(), Protocol::Http);
        assert_eq!("HTTPS".parse::<Protocol>().unwrap(), Protocol::Https);
        assert!("tcp".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_ip_range_contains() {
        let range = IpRange::new(Ipv4Addr::new(10, 0, 0, 10), Ipv4Addr::new(10, 0, 0, 20));
        assert!(range.contains(Ipv4Addr::new(10, 0, 0, 10)));
        assert!(range.contains(Ipv4Addr::new(10, 0, 0, 20)));
        assert!(!range.contains(Ipv4Addr::new(10, 0, 0, 21)));
        assert_eq!(range.to_string(), "10.0.0.10-10.0.0.20");
    }

    #[test]
    fn test_virtual_service_serialization() {
        let vs = VirtualService {
            id: "vs-1".to_string(),
            spec: VirtualServiceSpec {
                name: "web-http".to_string(),
                description: String::new(),
                pool: ResourceRef::new("pool-http", "pool-1"),
                service_engine_group: ResourceRef::new("seg", "seg-1"),
                virtual_ip: "10.0.0.5".to_string(),
                protocol: Protocol::Http,
                port: 80,
                use_ssl: false,
                certificate_alias: None,
            },
            status: VirtualServiceStatus::Pending,
        };

        let json = serde_json::to_value(&vs).unwrap();
        assert_eq!(json["virtualIp"], "10.0.0.5");
        assert_eq!(json["protocol"], "HTTP");
        assert_eq!(json["status"], "PENDING");
        assert!(json.get("certificateAlias").is_none()); // None should be skipped

        let back: VirtualService = serde_json::from_value(json).unwrap();
        assert_eq!(back, vs);
    }
}
