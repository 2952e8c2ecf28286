//! Virtual-service reconciler.
//!
//! A virtual service moves through `Absent -> Pending -> Ready` and back to
//! `Absent` on delete. While service-engine capacity is being provisioned the
//! backend answers busy, or reports the service as Pending; both are retried
//! locally within a bounded budget and surface as `GatewayError::Pending`
//! once it is spent. Only a Ready service is reported as created.
//!
//! Successful creates record the external address in the owner's shared
//! record, and deletes remove it again.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::details::GatewayDetails;
use super::remote;
use crate::client::{
    ClientError, GatewayClient, Protocol, ResourceRef, VirtualService, VirtualServiceSpec,
    VirtualServiceStatus,
};
use crate::error::{GatewayError, ResourceKind, Result};
use crate::record::VipRegistry;
use crate::retry::{retry_while, RetryConfig, DEFAULT_PENDING_ATTEMPTS};

/// Everything needed to create one virtual service
#[derive(Debug, Clone)]
pub struct NewVirtualService {
    pub name: String,
    pub pool: ResourceRef,
    pub service_engine_group: ResourceRef,
    /// Address the listener binds to on the gateway
    pub internal_ip: String,
    /// Address clients reach; equals `internal_ip` unless one-arm NAT is used
    pub external_ip: String,
    pub protocol: Protocol,
    pub port: u16,
    pub use_ssl: bool,
    pub certificate_alias: Option<String>,
    /// Owner of the shared record; empty skips record bookkeeping
    pub owner_tag: String,
}

impl NewVirtualService {
    fn spec(&self) -> VirtualServiceSpec {
        VirtualServiceSpec {
            name: self.name.clone(),
            description: owner_description(&self.owner_tag),
            pool: self.pool.clone(),
            service_engine_group: self.service_engine_group.clone(),
            virtual_ip: self.internal_ip.clone(),
            protocol: self.protocol,
            port: self.port,
            use_ssl: self.use_ssl,
            certificate_alias: if self.use_ssl {
                self.certificate_alias.clone()
            } else {
                None
            },
        }
    }
}

fn owner_description(owner_tag: &str) -> String {
    if owner_tag.is_empty() {
        String::new()
    } else {
        format!("owner={}", owner_tag)
    }
}

/// Names carrying control characters can never match a stored service
fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.chars().any(char::is_control)
}

/// Whether the listener settings of `current` already match `desired`
fn listener_matches(current: &VirtualServiceSpec, desired: &VirtualServiceSpec) -> bool {
    current.port == desired.port
        && current.protocol == desired.protocol
        && current.use_ssl == desired.use_ssl
        && current.certificate_alias == desired.certificate_alias
}

fn pending(name: &str, attempt: u32, message: impl Into<String>) -> GatewayError {
    GatewayError::Pending {
        name: name.to_string(),
        attempts: attempt,
        message: message.into(),
    }
}

fn is_pending(e: &GatewayError) -> bool {
    matches!(e, GatewayError::Pending { .. })
}

#[derive(Clone)]
pub struct VirtualServiceManager {
    client: Arc<dyn GatewayClient>,
    gateway: Arc<GatewayDetails>,
    registry: VipRegistry,
    pending_retry: RetryConfig,
}

impl VirtualServiceManager {
    pub fn new(
        client: Arc<dyn GatewayClient>,
        gateway: Arc<GatewayDetails>,
        registry: VipRegistry,
    ) -> Self {
        Self {
            client,
            gateway,
            registry,
            pending_retry: RetryConfig::with_max_attempts(DEFAULT_PENDING_ATTEMPTS),
        }
    }

    pub fn with_pending_retry(mut self, retry: RetryConfig) -> Self {
        self.pending_retry = retry;
        self
    }

    /// Ensure the virtual service exists and is Ready, then record its
    /// external address for the owner.
    ///
    /// An existing service with the same name is reused when it is bound to
    /// the same pool and address; otherwise the call fails with `Conflict`.
    /// The port, protocol and SSL settings of a reused service are converged
    /// in place.
    pub async fn create(
        &self,
        cancel: &CancellationToken,
        request: &NewVirtualService,
    ) -> Result<ResourceRef> {
        if !is_valid_name(&request.name) {
            return Err(GatewayError::Configuration(format!(
                "invalid virtual service name {:?}",
                request.name
            )));
        }
        if request.use_ssl && request.certificate_alias.is_none() {
            return Err(GatewayError::Configuration(format!(
                "virtual service '{}' uses SSL but has no certificate alias",
                request.name
            )));
        }

        let spec = request.spec();
        let spec = &spec;
        let reference = retry_while(
            &self.pending_retry,
            cancel,
            "create_virtual_service",
            is_pending,
            move |attempt| async move { self.ensure_ready(cancel, spec, attempt).await },
        )
        .await?;

        if !request.external_ip.is_empty() {
            if let Some(record) = self.registry.for_owner(&request.owner_tag) {
                record.add_virtual_ip(cancel, &request.external_ip).await?;
            }
        }
        Ok(reference)
    }

    /// Change the listening port of an existing service.
    pub async fn update_port(
        &self,
        cancel: &CancellationToken,
        name: &str,
        port: u16,
    ) -> Result<()> {
        if !is_valid_name(name) {
            return Err(GatewayError::not_found(ResourceKind::VirtualService, name));
        }

        retry_while(
            &self.pending_retry,
            cancel,
            "update_virtual_service_port",
            is_pending,
            move |attempt| async move {
                let vs = self
                    .find(cancel, name)
                    .await?
                    .ok_or_else(|| GatewayError::not_found(ResourceKind::VirtualService, name))?;

                if vs.status == VirtualServiceStatus::Pending {
                    return Err(pending(name, attempt, "still being provisioned"));
                }
                if vs.spec.port == port {
                    debug!("Virtual service {} already listens on port {}", name, port);
                    return Ok(());
                }

                let previous = vs.spec.port;
                let spec = VirtualServiceSpec { port, ..vs.spec };
                match remote(
                    cancel,
                    self.client
                        .update_virtual_service(self.gateway.id(), &vs.id, &spec),
                )
                .await
                {
                    Ok(()) => {
                        info!(
                            "Moved virtual service {} from port {} to {}",
                            name, previous, port
                        );
                        Ok(())
                    }
                    Err(GatewayError::Backend(ClientError::Busy(message))) => {
                        Err(pending(name, attempt, message))
                    }
                    Err(GatewayError::Backend(ClientError::NotFound(_))) => Err(
                        GatewayError::not_found(ResourceKind::VirtualService, name),
                    ),
                    Err(e) => Err(e),
                }
            },
        )
        .await
    }

    /// Remove a virtual service and drop `external_ip` from the owner's
    /// record. A missing service is an error only when `fail_if_absent`.
    pub async fn delete(
        &self,
        cancel: &CancellationToken,
        name: &str,
        fail_if_absent: bool,
        external_ip: &str,
        owner_tag: &str,
    ) -> Result<()> {
        let deleted = is_valid_name(name)
            && retry_while(
                &self.pending_retry,
                cancel,
                "delete_virtual_service",
                is_pending,
                move |attempt| async move {
                    let Some(vs) = self.find(cancel, name).await? else {
                        return Ok(false);
                    };
                    match remote(
                        cancel,
                        self.client.delete_virtual_service(self.gateway.id(), &vs.id),
                    )
                    .await
                    {
                        Ok(()) => {
                            info!("Deleted virtual service {} ({})", name, vs.id);
                            Ok(true)
                        }
                        Err(GatewayError::Backend(ClientError::NotFound(_))) => Ok(false),
                        Err(GatewayError::Backend(ClientError::Busy(message))) => {
                            Err(pending(name, attempt, message))
                        }
                        Err(e) => Err(e),
                    }
                },
            )
            .await?;

        if !deleted {
            if fail_if_absent {
                return Err(GatewayError::not_found(ResourceKind::VirtualService, name));
            }
            warn!("Virtual service {} does not exist, nothing to delete", name);
        }

        if !external_ip.is_empty() {
            if let Some(record) = self.registry.for_owner(owner_tag) {
                record.remove_virtual_ip(cancel, external_ip).await?;
            }
        }
        Ok(())
    }

    pub async fn get(&self, cancel: &CancellationToken, name: &str) -> Result<Option<ResourceRef>> {
        Ok(self.find(cancel, name).await?.map(|vs| vs.reference()))
    }

    /// Full service as stored on the gateway, including its settle status
    pub async fn get_summary(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<Option<VirtualService>> {
        self.find(cancel, name).await
    }

    async fn find(&self, cancel: &CancellationToken, name: &str) -> Result<Option<VirtualService>> {
        if !is_valid_name(name) {
            return Ok(None);
        }
        remote(
            cancel,
            self.client.find_virtual_service(self.gateway.id(), name),
        )
        .await
    }

    /// One attempt: submit the service if absent, then report whether it
    /// has settled.
    async fn ensure_ready(
        &self,
        cancel: &CancellationToken,
        spec: &VirtualServiceSpec,
        attempt: u32,
    ) -> Result<ResourceRef> {
        let vs = match self.find(cancel, &spec.name).await? {
            Some(vs) => vs,
            None => self.submit(cancel, spec, attempt).await?,
        };

        if vs.spec.pool.name != spec.pool.name {
            return Err(GatewayError::Conflict {
                kind: ResourceKind::VirtualService,
                name: spec.name.clone(),
                reason: format!(
                    "bound to pool '{}', expected '{}'",
                    vs.spec.pool.name, spec.pool.name
                ),
            });
        }
        if vs.spec.virtual_ip != spec.virtual_ip {
            return Err(GatewayError::Conflict {
                kind: ResourceKind::VirtualService,
                name: spec.name.clone(),
                reason: format!(
                    "listens on {}, expected {}",
                    vs.spec.virtual_ip, spec.virtual_ip
                ),
            });
        }

        match vs.status {
            VirtualServiceStatus::Ready if listener_matches(&vs.spec, spec) => Ok(vs.reference()),
            VirtualServiceStatus::Ready => self.reconfigure(cancel, vs, spec, attempt).await,
            VirtualServiceStatus::Pending => Err(pending(
                &spec.name,
                attempt,
                "service engine capacity is still being provisioned",
            )),
            VirtualServiceStatus::Failed => Err(ClientError::Api {
                status: 500,
                message: format!("virtual service {} failed to deploy", spec.name),
            }
            .into()),
        }
    }

    /// Converge port, protocol and SSL settings of a settled service.
    async fn reconfigure(
        &self,
        cancel: &CancellationToken,
        vs: VirtualService,
        spec: &VirtualServiceSpec,
        attempt: u32,
    ) -> Result<ResourceRef> {
        let reference = vs.reference();
        let desired = VirtualServiceSpec {
            protocol: spec.protocol,
            port: spec.port,
            use_ssl: spec.use_ssl,
            certificate_alias: spec.certificate_alias.clone(),
            ..vs.spec
        };

        match remote(
            cancel,
            self.client
                .update_virtual_service(self.gateway.id(), &vs.id, &desired),
        )
        .await
        {
            Ok(()) => {
                info!(
                    "Reconfigured virtual service {} to {} on port {} (ssl: {})",
                    spec.name, spec.protocol, spec.port, spec.use_ssl
                );
                Ok(reference)
            }
            Err(GatewayError::Backend(ClientError::Busy(message))) => {
                Err(pending(&spec.name, attempt, message))
            }
            // Deleted underneath us; the next attempt submits it again
            Err(GatewayError::Backend(ClientError::NotFound(_))) => {
                Err(pending(&spec.name, attempt, "vanished while being reconfigured"))
            }
            Err(e) => Err(e),
        }
    }

    async fn submit(
        &self,
        cancel: &CancellationToken,
        spec: &VirtualServiceSpec,
        attempt: u32,
    ) -> Result<VirtualService> {
        match remote(
            cancel,
            self.client.create_virtual_service(self.gateway.id(), spec),
        )
        .await
        {
            Ok(reference) => info!(
                "Created virtual service {} ({}) on {}:{} [{}]",
                spec.name, reference.id, spec.virtual_ip, spec.port, spec.protocol
            ),
            Err(GatewayError::Backend(ClientError::AlreadyExists(_))) => {
                debug!("Virtual service {} was created concurrently", spec.name)
            }
            Err(GatewayError::Backend(ClientError::Busy(message))) => {
                return Err(pending(&spec.name, attempt, message))
            }
            Err(e) => return Err(e),
        }

        self.find(cancel, &spec.name)
            .await?
            .ok_or_else(|| pending(&spec.name, attempt, "not yet visible after create"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InMemoryGateway;
    use crate::gateway::details::GatewayRef;
    use crate::record::{vip_document, InMemoryRecordStore, VipRecordManager};

    struct Fixture {
        client: Arc<InMemoryGateway>,
        store: Arc<InMemoryRecordStore>,
        mgr: VirtualServiceManager,
    }

    fn fixture(client: InMemoryGateway) -> Fixture {
        let client = Arc::new(client);
        let store = Arc::new(InMemoryRecordStore::new().with_record("cluster-a", vip_document(&[])));
        let details = Arc::new(GatewayDetails::new(
            GatewayRef {
                name: "edge-1".into(),
                id: "urn:gateway:edge-1".into(),
            },
            vec![],
        ));
        let registry = VipRegistry::new(store.clone()).with_conflict_retry(RetryConfig::immediate(5));
        let mgr = VirtualServiceManager::new(client.clone(), details, registry)
            .with_pending_retry(RetryConfig::immediate(5));
        Fixture { client, store, mgr }
    }

    fn request(name: &str, pool: &str) -> NewVirtualService {
        NewVirtualService {
            name: name.into(),
            pool: ResourceRef::new(pool, format!("urn:pool:{}", pool)),
            service_engine_group: ResourceRef::new("seg-shared", "urn:seg:1"),
            internal_ip: "192.168.8.2".into(),
            external_ip: "10.0.0.5".into(),
            protocol: Protocol::Http,
            port: 80,
            use_ssl: false,
            certificate_alias: None,
            owner_tag: "cluster-a".into(),
        }
    }

    async fn recorded(store: &Arc<InMemoryRecordStore>) -> Vec<String> {
        VipRecordManager::new(store.clone(), "cluster-a")
            .read(&CancellationToken::new())
            .await
            .unwrap()
            .virtual_ips
    }

    #[tokio::test]
    async fn test_create_records_external_ip_only() {
        let f = fixture(InMemoryGateway::single("net", vec![]));
        let cancel = CancellationToken::new();

        let reference = f.mgr.create(&cancel, &request("web-http", "pool-http")).await.unwrap();
        assert_eq!(reference.name, "web-http");

        let vs = f.mgr.get_summary(&cancel, "web-http").await.unwrap().unwrap();
        assert_eq!(vs.spec.virtual_ip, "192.168.8.2");
        assert_eq!(vs.spec.description, "owner=cluster-a");
        assert_eq!(recorded(&f.store).await, vec!["10.0.0.5"]);
    }

    #[tokio::test]
    async fn test_create_twice_is_noop() {
        let f = fixture(InMemoryGateway::single("net", vec![]));
        let cancel = CancellationToken::new();

        let a = f.mgr.create(&cancel, &request("web-http", "pool-http")).await.unwrap();
        let b = f.mgr.create(&cancel, &request("web-http", "pool-http")).await.unwrap();

        assert_eq!(a, b);
        assert_eq!(f.client.virtual_service_create_calls(), 1);
        assert_eq!(f.store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_create_converges_listener_settings() {
        let f = fixture(InMemoryGateway::single("net", vec![]));
        let cancel = CancellationToken::new();
        f.mgr.create(&cancel, &request("web", "pool-web")).await.unwrap();

        let mut changed = request("web", "pool-web");
        changed.protocol = Protocol::Https;
        changed.port = 8443;
        changed.use_ssl = true;
        changed.certificate_alias = Some("cluster-a-cert".into());
        let reference = f.mgr.create(&cancel, &changed).await.unwrap();

        assert_eq!(reference.name, "web");
        assert_eq!(f.client.virtual_service_create_calls(), 1);
        let vs = f.mgr.get_summary(&cancel, "web").await.unwrap().unwrap();
        assert_eq!(vs.spec.port, 8443);
        assert_eq!(vs.spec.protocol, Protocol::Https);
        assert!(vs.spec.use_ssl);
        assert_eq!(vs.spec.certificate_alias.as_deref(), Some("cluster-a-cert"));
        assert_eq!(vs.spec.pool.name, "pool-web");
    }

    #[tokio::test]
    async fn test_existing_service_on_other_pool_conflicts() {
        let f = fixture(InMemoryGateway::single("net", vec![]));
        let cancel = CancellationToken::new();
        f.mgr.create(&cancel, &request("web-http", "pool-http")).await.unwrap();

        let err = f
            .mgr
            .create(&cancel, &request("web-http", "pool-other"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_busy_backend_is_retried() {
        let f = fixture(InMemoryGateway::single("net", vec![]));
        f.client.set_busy_responses(3);

        f.mgr
            .create(&CancellationToken::new(), &request("web-http", "pool-http"))
            .await
            .unwrap();
        assert_eq!(f.client.virtual_service_create_calls(), 4);
    }

    #[tokio::test]
    async fn test_pending_budget_exhausted() {
        let f = fixture(InMemoryGateway::single("net", vec![]).with_pending_reads(50));

        let err = f
            .mgr
            .create(&CancellationToken::new(), &request("web-http", "pool-http"))
            .await
            .unwrap_err();
        match err {
            GatewayError::Pending { attempts, .. } => assert_eq!(attempts, 5),
            other => panic!("expected pending, got {:?}", other),
        }
        // Never reported Ready, so never recorded
        assert!(recorded(&f.store).await.is_empty());
    }

    #[tokio::test]
    async fn test_pending_settles_within_budget() {
        let f = fixture(InMemoryGateway::single("net", vec![]).with_pending_reads(3));
        f.mgr
            .create(&CancellationToken::new(), &request("web-http", "pool-http"))
            .await
            .unwrap();
        assert_eq!(f.client.virtual_service_create_calls(), 1);
    }

    #[tokio::test]
    async fn test_ssl_requires_certificate_alias() {
        let f = fixture(InMemoryGateway::single("net", vec![]));
        let mut req = request("web-https", "pool-https");
        req.use_ssl = true;
        req.protocol = Protocol::Https;

        let err = f.mgr.create(&CancellationToken::new(), &req).await.unwrap_err();
        assert!(matches!(err, GatewayError::Configuration(_)));
        assert_eq!(f.client.virtual_service_create_calls(), 0);
    }

    #[tokio::test]
    async fn test_update_port() {
        let f = fixture(InMemoryGateway::single("net", vec![]));
        let cancel = CancellationToken::new();
        f.mgr.create(&cancel, &request("web-http", "pool-http")).await.unwrap();

        f.mgr.update_port(&cancel, "web-http", 8080).await.unwrap();
        let vs = f.mgr.get_summary(&cancel, "web-http").await.unwrap().unwrap();
        assert_eq!(vs.spec.port, 8080);
    }

    #[tokio::test]
    async fn test_update_port_unknown_names() {
        let f = fixture(InMemoryGateway::single("net", vec![]));
        let cancel = CancellationToken::new();
        f.mgr.create(&cancel, &request("web-http", "pool-http")).await.unwrap();

        for name in ["missing", "web-http\n", ""] {
            let err = f.mgr.update_port(&cancel, name, 8080).await.unwrap_err();
            assert!(err.is_not_found(), "{:?} should be not found", name);
        }
    }

    #[tokio::test]
    async fn test_delete_removes_record_entry() {
        let f = fixture(InMemoryGateway::single("net", vec![]));
        let cancel = CancellationToken::new();
        f.mgr.create(&cancel, &request("web-http", "pool-http")).await.unwrap();

        f.mgr
            .delete(&cancel, "web-http", true, "10.0.0.5", "cluster-a")
            .await
            .unwrap();
        assert!(f.mgr.get(&cancel, "web-http").await.unwrap().is_none());
        assert!(recorded(&f.store).await.is_empty());

        f.mgr
            .delete(&cancel, "web-http", false, "10.0.0.5", "cluster-a")
            .await
            .unwrap();
        let err = f
            .mgr
            .delete(&cancel, "web-http", true, "10.0.0.5", "cluster-a")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_empty_owner_skips_record() {
        let f = fixture(InMemoryGateway::single("net", vec![]));
        let mut req = request("web-http", "pool-http");
        req.owner_tag = String::new();

        f.mgr.create(&CancellationToken::new(), &req).await.unwrap();
        assert_eq!(f.store.write_count(), 0);
    }
}
