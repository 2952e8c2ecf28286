//! Transports for the shared state record.
//!
//! The record is an opaque JSON document guarded by a version token. A write
//! carrying a token other than the current one is rejected with HTTP-style
//! status 412 and leaves the document untouched.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::header::{ETAG, IF_MATCH};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::client::rest::classify_status;
use crate::client::ClientError;

/// Status returned for a stale version token
pub const PRECONDITION_FAILED: u16 = 412;

/// Opaque ETag-style version of a record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionToken(String);

impl VersionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A document together with the version it was read at
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub document: Value,
    pub version: VersionToken,
}

// ============================================================================
// SBIO: Trait for abstraction
// ============================================================================

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn read(&self, record_id: &str) -> Result<StoredDocument, ClientError>;

    /// Replace the document if `version` is still current and return the
    /// new version. Stale versions fail with `ClientError::Api { status: 412 }`.
    async fn conditional_write(
        &self,
        record_id: &str,
        document: &Value,
        version: &VersionToken,
    ) -> Result<VersionToken, ClientError>;
}

fn precondition_failed(record_id: &str) -> ClientError {
    ClientError::Api {
        status: PRECONDITION_FAILED,
        message: format!("version of record {} does not match", record_id),
    }
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
pub struct InMemoryRecordStore {
    records: DashMap<String, (Value, u64)>,
    writes: AtomicU64,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(self, record_id: &str, document: Value) -> Self {
        self.records.insert(record_id.to_string(), (document, 1));
        self
    }

    /// Number of successful writes across all records
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn token(record_id: &str, revision: u64) -> VersionToken {
        VersionToken::new(format!("W/\"{}-{}\"", record_id, revision))
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn read(&self, record_id: &str) -> Result<StoredDocument, ClientError> {
        let entry = self
            .records
            .get(record_id)
            .ok_or_else(|| ClientError::NotFound(record_id.to_string()))?;
        let (document, revision) = entry.value();
        Ok(StoredDocument {
            document: document.clone(),
            version: Self::token(record_id, *revision),
        })
    }

    async fn conditional_write(
        &self,
        record_id: &str,
        document: &Value,
        version: &VersionToken,
    ) -> Result<VersionToken, ClientError> {
        let mut entry = self
            .records
            .get_mut(record_id)
            .ok_or_else(|| ClientError::NotFound(record_id.to_string()))?;
        let (stored, revision) = entry.value_mut();

        if Self::token(record_id, *revision) != *version {
            return Err(precondition_failed(record_id));
        }

        *stored = document.clone();
        *revision += 1;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(Self::token(record_id, *revision))
    }
}

// ============================================================================
// REST store (ETag / If-Match)
// ============================================================================

#[derive(Clone)]
pub struct RestRecordStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl RestRecordStore {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ClientError::Http(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            token,
        })
    }

    fn url(&self, record_id: &str) -> String {
        format!(
            "{}/cloudapi/1.0.0/entities/{}",
            self.base_url.trim_end_matches('/'),
            record_id
        )
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token {
            Some(ref token) => req.header("Authorization", format!("Bearer {}", token)),
            None => req,
        }
    }

    fn etag(response: &reqwest::Response) -> Option<VersionToken> {
        response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(VersionToken::new)
    }
}

#[async_trait]
impl RecordStore for RestRecordStore {
    async fn read(&self, record_id: &str) -> Result<StoredDocument, ClientError> {
        let url = self.url(record_id);
        debug!("GET {}", url);

        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), record_id, text));
        }

        let version = Self::etag(&response)
            .ok_or_else(|| ClientError::Parse(format!("record {} has no ETag", record_id)))?;
        let document: Value = response
            .json()
            .await
            .map_err(|e| ClientError::Parse(e.to_string()))?;

        Ok(StoredDocument { document, version })
    }

    async fn conditional_write(
        &self,
        record_id: &str,
        document: &Value,
        version: &VersionToken,
    ) -> Result<VersionToken, ClientError> {
        let url = self.url(record_id);
        debug!("PUT {} (If-Match: {})", url, version);

        let response = self
            .authorize(self.client.put(&url))
            .header(IF_MATCH, version.as_str())
            .json(document)
            .send()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == PRECONDITION_FAILED {
            return Err(precondition_failed(record_id));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), record_id, text));
        }

        match Self::etag(&response) {
            Some(next) => Ok(next),
            // Some servers omit the header on PUT; the next read carries it
            None => self.read(record_id).await.map(|stored| stored.version),
        }
    }
}
