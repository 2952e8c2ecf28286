//! Optimistic-concurrency manager for the cluster-wide virtual-IP record.
//!
//! Every mutation is a read-modify-write cycle. A write made with a stale
//! version token fails with `PreconditionFailed`; the helpers re-read and try
//! again within a bounded budget, never overwriting blindly.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::store::{RecordStore, VersionToken, PRECONDITION_FAILED};
use crate::client::ClientError;
use crate::error::{GatewayError, Result};
use crate::retry::{cancellable, retry_while, RetryConfig, DEFAULT_CONFLICT_ATTEMPTS};

/// Location of the virtual-IP list inside the record document
const VIRTUAL_IPS_PATH: [&str; 3] = ["entity", "status", "virtualIPs"];

/// The virtual-IP list as read, with the version and full document it came from
#[derive(Debug, Clone)]
pub struct VipSnapshot {
    pub virtual_ips: Vec<String>,
    pub version: VersionToken,
    pub document: Value,
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Extract the virtual-IP list from a record document. Absent means empty.
pub fn virtual_ips_of(document: &Value) -> Vec<String> {
    VIRTUAL_IPS_PATH
        .iter()
        .try_fold(document, |value, key| value.get(key))
        .and_then(Value::as_array)
        .map(|ips| {
            ips.iter()
                .filter_map(|ip| ip.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn child<'a>(value: &'a mut Value, key: &str) -> Result<&'a mut Value> {
    if value.is_null() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => Ok(map.entry(key.to_string()).or_insert(Value::Null)),
        _ => Err(ClientError::Parse(format!("record field above '{}' is not an object", key)).into()),
    }
}

/// Write the virtual-IP list into a record document, creating the path if needed.
pub fn set_virtual_ips(document: &mut Value, ips: &[String]) -> Result<()> {
    let mut slot = document;
    for key in VIRTUAL_IPS_PATH {
        slot = child(slot, key)?;
    }
    *slot = Value::from(ips.to_vec());
    Ok(())
}

/// A document holding only the given virtual IPs
pub fn vip_document(ips: &[&str]) -> Value {
    json!({ "entity": { "status": { "virtualIPs": ips } } })
}

// ============================================================================
// Manager
// ============================================================================

#[derive(Clone)]
pub struct VipRecordManager {
    store: Arc<dyn RecordStore>,
    record_id: String,
    conflict_retry: RetryConfig,
}

impl VipRecordManager {
    pub fn new(store: Arc<dyn RecordStore>, record_id: impl Into<String>) -> Self {
        Self {
            store,
            record_id: record_id.into(),
            conflict_retry: RetryConfig::with_max_attempts(DEFAULT_CONFLICT_ATTEMPTS),
        }
    }

    pub fn with_conflict_retry(mut self, retry: RetryConfig) -> Self {
        self.conflict_retry = retry;
        self
    }

    pub fn record_id(&self) -> &str {
        &self.record_id
    }

    /// Fetch the current list and its version token
    pub async fn read(&self, cancel: &CancellationToken) -> Result<VipSnapshot> {
        let stored = cancellable(cancel, async {
            self.store.read(&self.record_id).await.map_err(|e| match e {
                ClientError::NotFound(_) => {
                    GatewayError::not_found(crate::error::ResourceKind::Record, &self.record_id)
                }
                other => other.into(),
            })
        })
        .await?;

        Ok(VipSnapshot {
            virtual_ips: virtual_ips_of(&stored.document),
            version: stored.version,
            document: stored.document,
        })
    }

    /// Commit `virtual_ips` into `document` if `version` is still current.
    ///
    /// Returns the new version token. A stale token fails with
    /// `PreconditionFailed` and the record is left as it was.
    pub async fn write(
        &self,
        cancel: &CancellationToken,
        virtual_ips: &[String],
        version: &VersionToken,
        mut document: Value,
    ) -> Result<VersionToken> {
        set_virtual_ips(&mut document, virtual_ips)?;

        let next = cancellable(cancel, async {
            self.store
                .conditional_write(&self.record_id, &document, version)
                .await
                .map_err(|e| match e {
                    ClientError::Api {
                        status: PRECONDITION_FAILED,
                        ..
                    } => GatewayError::PreconditionFailed {
                        record: self.record_id.clone(),
                    },
                    other => other.into(),
                })
        })
        .await?;

        info!(
            "Updated record {} with {} virtual IP(s), version {} -> {}",
            self.record_id,
            virtual_ips.len(),
            version,
            next
        );
        Ok(next)
    }

    /// Ensure `ip` is listed. Returns whether a write happened.
    pub async fn add_virtual_ip(&self, cancel: &CancellationToken, ip: &str) -> Result<bool> {
        self.modify(cancel, "add_virtual_ip", |ips| {
            if ips.iter().any(|existing| existing == ip) {
                return false;
            }
            ips.push(ip.to_string());
            true
        })
        .await
    }

    /// Ensure `ip` is not listed. Returns whether a write happened.
    pub async fn remove_virtual_ip(&self, cancel: &CancellationToken, ip: &str) -> Result<bool> {
        self.modify(cancel, "remove_virtual_ip", |ips| {
            let before = ips.len();
            ips.retain(|existing| existing != ip);
            ips.len() != before
        })
        .await
    }

    async fn modify<F>(&self, cancel: &CancellationToken, operation: &str, mutate: F) -> Result<bool>
    where
        F: Fn(&mut Vec<String>) -> bool,
    {
        let mutate = &mutate;
        retry_while(
            &self.conflict_retry,
            cancel,
            operation,
            |e| matches!(e, GatewayError::PreconditionFailed { .. }),
            move |_| async move {
                let snapshot = self.read(cancel).await?;
                let mut ips = snapshot.virtual_ips;
                if !mutate(&mut ips) {
                    debug!("Record {} already in desired state", self.record_id);
                    return Ok(false);
                }
                self.write(cancel, &ips, &snapshot.version, snapshot.document)
                    .await?;
                Ok(true)
            },
        )
        .await
    }
}

/// Hands out a record manager per owner tag. An empty tag disables
/// bookkeeping.
#[derive(Clone)]
pub struct VipRegistry {
    store: Arc<dyn RecordStore>,
    conflict_retry: RetryConfig,
}

impl VipRegistry {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            conflict_retry: RetryConfig::with_max_attempts(DEFAULT_CONFLICT_ATTEMPTS),
        }
    }

    pub fn with_conflict_retry(mut self, retry: RetryConfig) -> Self {
        self.conflict_retry = retry;
        self
    }

    pub fn for_owner(&self, owner_tag: &str) -> Option<VipRecordManager> {
        if owner_tag.is_empty() {
            return None;
        }
        Some(
            VipRecordManager::new(self.store.clone(), owner_tag)
                .with_conflict_retry(self.conflict_retry.clone()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::store::InMemoryRecordStore;
    use serde_json::json;

    fn manager(ips: &[&str]) -> (Arc<InMemoryRecordStore>, VipRecordManager) {
        let store = Arc::new(InMemoryRecordStore::new().with_record("cluster-1", vip_document(ips)));
        let mgr = VipRecordManager::new(store.clone(), "cluster-1")
            .with_conflict_retry(RetryConfig::immediate(5));
        (store, mgr)
    }

    #[test]
    fn test_virtual_ips_of_missing_path() {
        assert!(virtual_ips_of(&json!({"entity": {}})).is_empty());
        assert!(virtual_ips_of(&Value::Null).is_empty());
    }

    #[test]
    fn test_vip_document_matches_write_path() {
        let doc = vip_document(&["10.0.0.1", "10.0.0.2"]);
        assert_eq!(virtual_ips_of(&doc), vec!["10.0.0.1", "10.0.0.2"]);

        let mut written = Value::Null;
        set_virtual_ips(&mut written, &["10.0.0.1".to_string(), "10.0.0.2".to_string()]).unwrap();
        assert_eq!(doc, written);
        assert_eq!(vip_document(&[]), json!({"entity": {"status": {"virtualIPs": []}}}));
    }

    #[test]
    fn test_set_virtual_ips_preserves_siblings() {
        let mut doc = json!({"entity": {"spec": {"x": 1}, "status": {"phase": "up"}}});
        set_virtual_ips(&mut doc, &["1.2.3.4".to_string()]).unwrap();
        assert_eq!(doc["entity"]["spec"]["x"], 1);
        assert_eq!(doc["entity"]["status"]["phase"], "up");
        assert_eq!(virtual_ips_of(&doc), vec!["1.2.3.4"]);
    }

    #[test]
    fn test_set_virtual_ips_rejects_non_object() {
        let mut doc = json!({"entity": "oops"});
        assert!(set_virtual_ips(&mut doc, &[]).is_err());
    }

    #[tokio::test]
    async fn test_read_twice_same_token() {
        let (_, mgr) = manager(&["10.0.0.1"]);
        let cancel = CancellationToken::new();
        let a = mgr.read(&cancel).await.unwrap();
        let b = mgr.read(&cancel).await.unwrap();
        assert_eq!(a.version, b.version);
        assert_eq!(a.virtual_ips, vec!["10.0.0.1"]);
    }

    #[tokio::test]
    async fn test_stale_token_precondition_failed() {
        let (_, mgr) = manager(&[]);
        let cancel = CancellationToken::new();

        let first = mgr.read(&cancel).await.unwrap();
        let second = mgr.read(&cancel).await.unwrap();

        let mut ips = first.virtual_ips.clone();
        ips.push("1.2.3.4".into());
        let new_version = mgr
            .write(&cancel, &ips, &first.version, first.document)
            .await
            .unwrap();
        assert_ne!(new_version, first.version);

        let mut stale = second.virtual_ips.clone();
        stale.push("2.3.4.5".into());
        let err = mgr
            .write(&cancel, &stale, &second.version, second.document)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::PreconditionFailed { .. }));

        let after = mgr.read(&cancel).await.unwrap();
        assert_eq!(after.virtual_ips, vec!["1.2.3.4"]);
        assert_eq!(after.version, new_version);
    }

    #[tokio::test]
    async fn test_add_and_remove_are_idempotent() {
        let (store, mgr) = manager(&[]);
        let cancel = CancellationToken::new();

        assert!(mgr.add_virtual_ip(&cancel, "10.0.0.5").await.unwrap());
        assert!(!mgr.add_virtual_ip(&cancel, "10.0.0.5").await.unwrap());
        assert_eq!(store.write_count(), 1);

        assert!(mgr.remove_virtual_ip(&cancel, "10.0.0.5").await.unwrap());
        assert!(!mgr.remove_virtual_ip(&cancel, "10.0.0.5").await.unwrap());
        assert_eq!(store.write_count(), 2);
        assert!(mgr.read(&cancel).await.unwrap().virtual_ips.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_adds_all_land() {
        let (_, mgr) = manager(&[]);
        let mgr = mgr.with_conflict_retry(RetryConfig::immediate(50));

        let mut handles = Vec::new();
        for i in 0..8 {
            let mgr = mgr.clone();
            handles.push(tokio::spawn(async move {
                mgr.add_virtual_ip(&CancellationToken::new(), &format!("10.0.1.{}", i))
                    .await
            }));
        }
        for handle in futures::future::join_all(handles).await {
            assert!(handle.unwrap().is_ok());
        }

        let ips = mgr.read(&CancellationToken::new()).await.unwrap().virtual_ips;
        assert_eq!(ips.len(), 8);
    }

    #[tokio::test]
    async fn test_missing_record_is_not_found() {
        let store = Arc::new(InMemoryRecordStore::new());
        let mgr = VipRecordManager::new(store, "ghost");
        let err = mgr.read(&CancellationToken::new()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_registry_skips_empty_owner() {
        let registry = VipRegistry::new(Arc::new(InMemoryRecordStore::new()));
        assert!(registry.for_owner("").is_none());
        assert_eq!(registry.for_owner("c1").unwrap().record_id(), "c1");
    }
}
