//! REST transport for the gateway API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::gateway::{
    ClientError, EdgeGateway, GatewayClient, NatRule, NatRuleSpec, Pool, PoolSpec, ResourceRef,
    VirtualService, VirtualServiceSpec,
};

const API_ROOT: &str = "cloudapi/1.0.0";

/// Paged list envelope returned by collection endpoints
#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    values: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct Created {
    id: String,
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Map a non-success HTTP status onto the transport error taxonomy.
pub fn classify_status(status: u16, subject: &str, message: String) -> ClientError {
    match status {
        404 => ClientError::NotFound(subject.to_string()),
        409 => ClientError::AlreadyExists(subject.to_string()),
        423 | 503 => ClientError::Busy(message),
        _ if message.to_ascii_lowercase().contains("busy") => ClientError::Busy(message),
        _ => ClientError::Api { status, message },
    }
}

fn name_filter(name: &str) -> [(&'static str, String); 1] {
    [("filter", format!("name=={}", name))]
}

// ============================================================================
// SBIO: I/O implementation (real HTTP client)
// ============================================================================

#[derive(Clone)]
pub struct RestGatewayClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl RestGatewayClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| ClientError::Http(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base_url.trim_end_matches('/'), API_ROOT, path)
    }

    fn gateway_url(&self, gateway_id: &str, path: &str) -> String {
        self.url(&format!("edgeGateways/{}/{}", gateway_id, path))
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        let req = self
            .client
            .request(method, url)
            .header("Accept", "application/json");
        match self.token {
            Some(ref token) => req.header("Authorization", format!("Bearer {}", token)),
            None => req,
        }
    }

    async fn check(
        response: reqwest::Response,
        subject: &str,
    ) -> Result<reqwest::Response, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(classify_status(status.as_u16(), subject, text))
    }

    async fn list<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, ClientError> {
        debug!("GET {}", url);
        let response = self
            .request(Method::GET, url)
            .query(query)
            .send()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;
        let page: Page<T> = Self::check(response, url)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::Parse(e.to_string()))?;
        Ok(page.values)
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: &str,
        subject: &str,
        body: Option<&B>,
    ) -> Result<reqwest::Response, ClientError> {
        debug!("{} {}", method, url);
        let mut req = self.request(method, url);
        if let Some(body) = body {
            req = req.json(body);
        }
        let response = req
            .send()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;
        Self::check(response, subject).await
    }

    async fn create<B: Serialize + ?Sized>(
        &self,
        url: &str,
        name: &str,
        body: &B,
    ) -> Result<ResourceRef, ClientError> {
        let created: Created = self
            .send(Method::POST, url, name, Some(body))
            .await?
            .json()
            .await
            .map_err(|e| ClientError::Parse(e.to_string()))?;
        Ok(ResourceRef::new(name, created.id))
    }

    async fn put<B: Serialize + ?Sized>(
        &self,
        url: &str,
        subject: &str,
        body: &B,
    ) -> Result<(), ClientError> {
        self.send(Method::PUT, url, subject, Some(body))
            .await
            .map(|_| ())
    }

    async fn delete(&self, url: &str, subject: &str) -> Result<(), ClientError> {
        self.send::<()>(Method::DELETE, url, subject, None)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl GatewayClient for RestGatewayClient {
    async fn find_gateway(&self, network_name: &str) -> Result<Option<EdgeGateway>, ClientError> {
        let gateways: Vec<EdgeGateway> = self
            .list(
                &self.url("edgeGateways"),
                &[("filter", format!("orgVdcNetworkName=={}", network_name))],
            )
            .await?;
        Ok(gateways.into_iter().next())
    }

    async fn find_nat_rule(
        &self,
        gateway_id: &str,
        name: &str,
    ) -> Result<Option<NatRule>, ClientError> {
        let rules: Vec<NatRule> = self
            .list(&self.gateway_url(gateway_id, "nat/rules"), &name_filter(name))
            .await?;
        Ok(rules.into_iter().find(|r| r.spec.name == name))
    }

    async fn list_nat_rules(&self, gateway_id: &str) -> Result<Vec<NatRule>, ClientError> {
        self.list(&self.gateway_url(gateway_id, "nat/rules"), &[])
            .await
    }

    async fn create_nat_rule(
        &self,
        gateway_id: &str,
        spec: &NatRuleSpec,
    ) -> Result<ResourceRef, ClientError> {
        self.create(&self.gateway_url(gateway_id, "nat/rules"), &spec.name, spec)
            .await
    }

    async fn update_nat_rule(
        &self,
        gateway_id: &str,
        id: &str,
        spec: &NatRuleSpec,
    ) -> Result<(), ClientError> {
        let url = self.gateway_url(gateway_id, &format!("nat/rules/{}", id));
        self.put(&url, &spec.name, spec).await
    }

    async fn delete_nat_rule(&self, gateway_id: &str, id: &str) -> Result<(), ClientError> {
        let url = self.gateway_url(gateway_id, &format!("nat/rules/{}", id));
        self.delete(&url, id).await
    }

    async fn find_pool(&self, gateway_id: &str, name: &str) -> Result<Option<Pool>, ClientError> {
        let pools: Vec<Pool> = self
            .list(
                &self.gateway_url(gateway_id, "loadBalancer/pools"),
                &name_filter(name),
            )
            .await?;
        Ok(pools.into_iter().find(|p| p.spec.name == name))
    }

    async fn create_pool(
        &self,
        gateway_id: &str,
        spec: &PoolSpec,
    ) -> Result<ResourceRef, ClientError> {
        self.create(
            &self.gateway_url(gateway_id, "loadBalancer/pools"),
            &spec.name,
            spec,
        )
        .await
    }

    async fn update_pool(
        &self,
        gateway_id: &str,
        id: &str,
        spec: &PoolSpec,
    ) -> Result<(), ClientError> {
        let url = self.gateway_url(gateway_id, &format!("loadBalancer/pools/{}", id));
        self.put(&url, &spec.name, spec).await
    }

    async fn delete_pool(&self, gateway_id: &str, id: &str) -> Result<(), ClientError> {
        let url = self.gateway_url(gateway_id, &format!("loadBalancer/pools/{}", id));
        self.delete(&url, id).await
    }

    async fn list_service_engine_groups(
        &self,
        gateway_id: &str,
    ) -> Result<Vec<ResourceRef>, ClientError> {
        self.list(
            &self.gateway_url(gateway_id, "loadBalancer/serviceEngineGroups"),
            &[],
        )
        .await
    }

    async fn find_virtual_service(
        &self,
        gateway_id: &str,
        name: &str,
    ) -> Result<Option<VirtualService>, ClientError> {
        let services: Vec<VirtualService> = self
            .list(
                &self.gateway_url(gateway_id, "loadBalancer/virtualServices"),
                &name_filter(name),
            )
            .await?;
        Ok(services.into_iter().find(|v| v.spec.name == name))
    }

    async fn list_virtual_services(
        &self,
        gateway_id: &str,
    ) -> Result<Vec<VirtualService>, ClientError> {
        self.list(
            &self.gateway_url(gateway_id, "loadBalancer/virtualServices"),
            &[],
        )
        .await
    }

    async fn create_virtual_service(
        &self,
        gateway_id: &str,
        spec: &VirtualServiceSpec,
    ) -> Result<ResourceRef, ClientError> {
        self.create(
            &self.gateway_url(gateway_id, "loadBalancer/virtualServices"),
            &spec.name,
            spec,
        )
        .await
    }

    async fn update_virtual_service(
        &self,
        gateway_id: &str,
        id: &str,
        spec: &VirtualServiceSpec,
    ) -> Result<(), ClientError> {
        let url = self.gateway_url(gateway_id, &format!("loadBalancer/virtualServices/{}", id));
        self.put(&url, &spec.name, spec).await
    }

    async fn delete_virtual_service(
        &self,
        gateway_id: &str,
        id: &str,
    ) -> Result<(), ClientError> {
        let url = self.gateway_url(gateway_id, &format!("loadBalancer/virtualServices/{}", id));
        self.delete(&url, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert_eq!(
            classify_status(404, "pool-a", String::new()),
            ClientError::NotFound("pool-a".to_string())
        );
        assert_eq!(
            classify_status(409, "pool-a", String::new()),
            ClientError::AlreadyExists("pool-a".to_string())
        );
        assert!(matches!(
            classify_status(503, "vs", "try later".into()),
            ClientError::Busy(_)
        ));
        assert!(matches!(
            classify_status(400, "vs", "Service Engine Group is BUSY".into()),
            ClientError::Busy(_)
        ));
        assert!(matches!(
            classify_status(500, "vs", "boom".into()),
            ClientError::Api { status: 500, .. }
        ));
    }

    #[test]
    fn test_url_building() {
        let client = RestGatewayClient::new("https://cloud.example.com/", None).unwrap();
        assert_eq!(
            client.gateway_url("gw-1", "nat/rules"),
            "https://cloud.example.com/cloudapi/1.0.0/edgeGateways/gw-1/nat/rules"
        );
    }

    #[test]
    fn test_page_deserialization() {
        let page: Page<ResourceRef> =
            serde_json::from_str(r#"{"values": [{"name": "seg", "id": "urn:seg:1"}]}"#).unwrap();
        assert_eq!(page.values.len(), 1);

        let empty: Page<ResourceRef> = serde_json::from_str("{}").unwrap();
        assert!(empty.values.is_empty());
    }
}
