//! In-memory gateway backend.
//!
//! Honors the same contract as the REST transport: names are unique per
//! resource kind on a gateway, creates of a taken name fail with
//! `AlreadyExists`, and unknown ids fail with `NotFound`. Busy responses and
//! slow-settling virtual services can be injected to exercise retry paths.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use super::gateway::{
    ClientError, EdgeGateway, GatewayClient, IpRange, NatRule, NatRuleSpec, Pool, PoolSpec,
    ResourceRef, VirtualService, VirtualServiceSpec, VirtualServiceStatus,
};

type Key = (String, String);

fn key(gateway_id: &str, name: &str) -> Key {
    (gateway_id.to_string(), name.to_string())
}

fn new_id(prefix: &str) -> String {
    format!("urn:{}:{}", prefix, Uuid::new_v4())
}

#[derive(Default)]
pub struct InMemoryGateway {
    /// Gateways indexed by the network attached to them
    gateways: DashMap<String, EdgeGateway>,
    service_engine_groups: DashMap<String, Vec<ResourceRef>>,
    nat_rules: DashMap<Key, NatRule>,
    pools: DashMap<Key, Pool>,
    virtual_services: DashMap<Key, VirtualService>,
    /// Remaining lookups before a virtual service reports Ready
    settling: DashMap<String, u32>,
    busy_responses: AtomicU32,
    pending_reads: AtomicU32,
    virtual_service_creates: AtomicUsize,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend with one gateway, attached to `network`, owning `ranges`
    /// and one service-engine group.
    pub fn single(network: &str, ranges: Vec<IpRange>) -> Self {
        let gateway = EdgeGateway {
            id: "urn:gateway:edge-1".to_string(),
            name: "edge-1".to_string(),
            external_ranges: ranges,
        };
        let gateway_id = gateway.id.clone();
        Self::new()
            .with_gateway(network, gateway)
            .with_service_engine_group(&gateway_id, ResourceRef::new("seg-shared", "urn:seg:1"))
    }

    pub fn with_gateway(self, network: &str, gateway: EdgeGateway) -> Self {
        self.gateways.insert(network.to_string(), gateway);
        self
    }

    pub fn with_service_engine_group(self, gateway_id: &str, seg: ResourceRef) -> Self {
        self.service_engine_groups
            .entry(gateway_id.to_string())
            .or_default()
            .push(seg);
        self
    }

    /// Newly created virtual services stay Pending for `reads` lookups
    pub fn with_pending_reads(self, reads: u32) -> Self {
        self.pending_reads.store(reads, Ordering::SeqCst);
        self
    }

    /// The next `count` virtual-service mutations are rejected as busy
    pub fn set_busy_responses(&self, count: u32) {
        self.busy_responses.store(count, Ordering::SeqCst);
    }

    pub fn virtual_service_create_calls(&self) -> usize {
        self.virtual_service_creates.load(Ordering::SeqCst)
    }

    pub fn nat_rule_count(&self) -> usize {
        self.nat_rules.len()
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn virtual_service_count(&self) -> usize {
        self.virtual_services.len()
    }

    fn take_busy(&self) -> bool {
        self.busy_responses
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn key_for_id<T>(
        map: &DashMap<Key, T>,
        gateway_id: &str,
        id: &str,
        id_of: impl Fn(&T) -> &str,
    ) -> Option<Key> {
        map.iter()
            .find(|e| e.key().0 == gateway_id && id_of(e.value()) == id)
            .map(|e| e.key().clone())
    }

    /// Rename-aware replace: the target name must not be taken by another id
    fn replace<T: Clone>(
        map: &DashMap<Key, T>,
        gateway_id: &str,
        id: &str,
        new_name: &str,
        id_of: impl Fn(&T) -> &str,
        apply: impl FnOnce(&mut T),
    ) -> Result<(), ClientError> {
        let old_key = Self::key_for_id(map, gateway_id, id, &id_of)
            .ok_or_else(|| ClientError::NotFound(id.to_string()))?;
        let new_key = key(gateway_id, new_name);

        if old_key == new_key {
            if let Some(mut entry) = map.get_mut(&old_key) {
                apply(entry.value_mut());
            }
            return Ok(());
        }

        if map.contains_key(&new_key) {
            return Err(ClientError::AlreadyExists(new_name.to_string()));
        }
        if let Some((_, mut item)) = map.remove(&old_key) {
            apply(&mut item);
            map.insert(new_key, item);
        }
        Ok(())
    }

    fn remove_by_id<T>(
        map: &DashMap<Key, T>,
        gateway_id: &str,
        id: &str,
        id_of: impl Fn(&T) -> &str,
    ) -> Result<T, ClientError> {
        let k = Self::key_for_id(map, gateway_id, id, id_of)
            .ok_or_else(|| ClientError::NotFound(id.to_string()))?;
        map.remove(&k)
            .map(|(_, v)| v)
            .ok_or_else(|| ClientError::NotFound(id.to_string()))
    }
}

#[async_trait]
impl GatewayClient for InMemoryGateway {
    async fn find_gateway(&self, network_name: &str) -> Result<Option<EdgeGateway>, ClientError> {
        Ok(self.gateways.get(network_name).map(|g| g.clone()))
    }

    async fn find_nat_rule(
        &self,
        gateway_id: &str,
        name: &str,
    ) -> Result<Option<NatRule>, ClientError> {
        Ok(self.nat_rules.get(&key(gateway_id, name)).map(|r| r.clone()))
    }

    async fn list_nat_rules(&self, gateway_id: &str) -> Result<Vec<NatRule>, ClientError> {
        Ok(self
            .nat_rules
            .iter()
            .filter(|e| e.key().0 == gateway_id)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn create_nat_rule(
        &self,
        gateway_id: &str,
        spec: &NatRuleSpec,
    ) -> Result<ResourceRef, ClientError> {
        match self.nat_rules.entry(key(gateway_id, &spec.name)) {
            Entry::Occupied(_) => Err(ClientError::AlreadyExists(spec.name.clone())),
            Entry::Vacant(slot) => {
                let rule = NatRule {
                    id: new_id("natrule"),
                    spec: spec.clone(),
                };
                let reference = rule.reference();
                slot.insert(rule);
                Ok(reference)
            }
        }
    }

    async fn update_nat_rule(
        &self,
        gateway_id: &str,
        id: &str,
        spec: &NatRuleSpec,
    ) -> Result<(), ClientError> {
        Self::replace(
            &self.nat_rules,
            gateway_id,
            id,
            &spec.name,
            |r| r.id.as_str(),
            |r| r.spec = spec.clone(),
        )
    }

    async fn delete_nat_rule(&self, gateway_id: &str, id: &str) -> Result<(), ClientError> {
        Self::remove_by_id(&self.nat_rules, gateway_id, id, |r| r.id.as_str()).map(|_| ())
    }

    async fn find_pool(&self, gateway_id: &str, name: &str) -> Result<Option<Pool>, ClientError> {
        Ok(self.pools.get(&key(gateway_id, name)).map(|p| p.clone()))
    }

    async fn create_pool(
        &self,
        gateway_id: &str,
        spec: &PoolSpec,
    ) -> Result<ResourceRef, ClientError> {
        match self.pools.entry(key(gateway_id, &spec.name)) {
            Entry::Occupied(_) => Err(ClientError::AlreadyExists(spec.name.clone())),
            Entry::Vacant(slot) => {
                let pool = Pool {
                    id: new_id("pool"),
                    spec: spec.clone(),
                };
                let reference = pool.reference();
                slot.insert(pool);
                Ok(reference)
            }
        }
    }

    async fn update_pool(
        &self,
        gateway_id: &str,
        id: &str,
        spec: &PoolSpec,
    ) -> Result<(), ClientError> {
        Self::replace(
            &self.pools,
            gateway_id,
            id,
            &spec.name,
            |p| p.id.as_str(),
            |p| p.spec = spec.clone(),
        )
    }

    async fn delete_pool(&self, gateway_id: &str, id: &str) -> Result<(), ClientError> {
        let in_use = self
            .virtual_services
            .iter()
            .any(|e| e.key().0 == gateway_id && e.value().spec.pool.id == id);
        if in_use {
            return Err(ClientError::Api {
                status: 400,
                message: format!("pool {} is referenced by a virtual service", id),
            });
        }
        Self::remove_by_id(&self.pools, gateway_id, id, |p| p.id.as_str()).map(|_| ())
    }

    async fn list_service_engine_groups(
        &self,
        gateway_id: &str,
    ) -> Result<Vec<ResourceRef>, ClientError> {
        Ok(self
            .service_engine_groups
            .get(gateway_id)
            .map(|s| s.clone())
            .unwrap_or_default())
    }

    async fn find_virtual_service(
        &self,
        gateway_id: &str,
        name: &str,
    ) -> Result<Option<VirtualService>, ClientError> {
        let Some(mut vs) = self
            .virtual_services
            .get(&key(gateway_id, name))
            .map(|v| v.clone())
        else {
            return Ok(None);
        };

        if let Entry::Occupied(mut remaining) = self.settling.entry(vs.id.clone()) {
            if *remaining.get() == 0 {
                remaining.remove();
                vs.status = VirtualServiceStatus::Ready;
                if let Some(mut stored) = self.virtual_services.get_mut(&key(gateway_id, name)) {
                    stored.status = VirtualServiceStatus::Ready;
                }
            } else {
                *remaining.get_mut() -= 1;
            }
        }

        Ok(Some(vs))
    }

    async fn list_virtual_services(
        &self,
        gateway_id: &str,
    ) -> Result<Vec<VirtualService>, ClientError> {
        Ok(self
            .virtual_services
            .iter()
            .filter(|e| e.key().0 == gateway_id)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn create_virtual_service(
        &self,
        gateway_id: &str,
        spec: &VirtualServiceSpec,
    ) -> Result<ResourceRef, ClientError> {
        self.virtual_service_creates.fetch_add(1, Ordering::SeqCst);
        if self.take_busy() {
            return Err(ClientError::Busy(format!(
                "service engine group {} is provisioning",
                spec.service_engine_group.name
            )));
        }

        let pending_reads = self.pending_reads.load(Ordering::SeqCst);
        match self.virtual_services.entry(key(gateway_id, &spec.name)) {
            Entry::Occupied(_) => Err(ClientError::AlreadyExists(spec.name.clone())),
            Entry::Vacant(slot) => {
                let vs = VirtualService {
                    id: new_id("virtualservice"),
                    spec: spec.clone(),
                    status: if pending_reads > 0 {
                        VirtualServiceStatus::Pending
                    } else {
                        VirtualServiceStatus::Ready
                    },
                };
                if pending_reads > 0 {
                    self.settling.insert(vs.id.clone(), pending_reads - 1);
                }
                let reference = vs.reference();
                slot.insert(vs);
                Ok(reference)
            }
        }
    }

    async fn update_virtual_service(
        &self,
        gateway_id: &str,
        id: &str,
        spec: &VirtualServiceSpec,
    ) -> Result<(), ClientError> {
        if self.take_busy() {
            return Err(ClientError::Busy(format!("virtual service {} is busy", id)));
        }
        Self::replace(
            &self.virtual_services,
            gateway_id,
            id,
            &spec.name,
            |v| v.id.as_str(),
            |v| v.spec = spec.clone(),
        )
    }

    async fn delete_virtual_service(
        &self,
        gateway_id: &str,
        id: &str,
    ) -> Result<(), ClientError> {
        if self.take_busy() {
            return Err(ClientError::Busy(format!("virtual service {} is busy", id)));
        }
        self.settling.remove(id);
        Self::remove_by_id(&self.virtual_services, gateway_id, id, |v| v.id.as_str()).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn backend() -> InMemoryGateway {
        InMemoryGateway::single(
            "net-1",
            vec![IpRange::new(
                Ipv4Addr::new(10, 0, 0, 1),
                Ipv4Addr::new(10, 0, 0, 9),
            )],
        )
    }

    fn pool_spec(name: &str) -> PoolSpec {
        PoolSpec {
            name: name.to_string(),
            members: vec!["1.2.3.4".to_string()],
            port: 31234,
        }
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let gw = backend();
        gw.create_pool("g", &pool_spec("p")).await.unwrap();
        let again = gw.create_pool("g", &pool_spec("p")).await;
        assert_eq!(again, Err(ClientError::AlreadyExists("p".to_string())));

        // same name on another gateway is fine
        assert!(gw.create_pool("other", &pool_spec("p")).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_id_not_found() {
        let gw = backend();
        let result = gw.delete_nat_rule("g", "missing").await;
        assert!(matches!(result, Err(ClientError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_busy_responses_are_consumed() {
        let gw = backend();
        gw.set_busy_responses(1);
        assert!(matches!(
            gw.delete_virtual_service("g", "x").await,
            Err(ClientError::Busy(_))
        ));
        assert!(matches!(
            gw.delete_virtual_service("g", "x").await,
            Err(ClientError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_find_gateway_by_network() {
        let gw = backend();
        assert!(gw.find_gateway("net-1").await.unwrap().is_some());
        assert!(gw.find_gateway("net-2").await.unwrap().is_none());
    }
}
