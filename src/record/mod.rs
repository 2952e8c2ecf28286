//! Shared state record: the cluster-wide list of virtual IPs in use.

pub mod manager;
pub mod store;

pub use manager::{set_virtual_ips, vip_document, virtual_ips_of, VipRecordManager, VipRegistry, VipSnapshot};
pub use store::{InMemoryRecordStore, RecordStore, RestRecordStore, StoredDocument, VersionToken};
