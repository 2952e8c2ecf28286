//! # Edge gateway reconcilers
//!
//! Idempotent managers for the resources behind one logical load balancer,
//! all bound to a single edge gateway resolved once at construction:
//!
//! - [`NatRuleManager`]: DNAT rules
//! - [`PoolManager`]: load-balancer pools (member list + port)
//! - [`ServiceEngineGroupLookup`]: capacity group backing virtual services
//! - [`VirtualServiceManager`]: HTTP/HTTPS listeners, with bounded Pending retry
//! - [`AddressAllocator`]: free external/internal address selection
//! - [`GatewayManager`]: composite create/get/update/delete
//!
//! No manager keeps mutable local state. Every primitive converges when
//! repeated, so a caller retrying a failed composite operation picks up
//! where the previous attempt stopped.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::client::ClientError;
use crate::error::{GatewayError, Result};
use crate::retry::cancellable;

pub mod allocator;
pub mod details;
pub mod manager;
pub mod nat;
pub mod pool;
pub mod seg;
pub mod virtual_service;

pub use allocator::{parse_subnet, AddressAllocator};
pub use details::{GatewayDetails, GatewayRef};
pub use manager::{derived_name, dnat_rule_name, GatewayManager, OneArm, PortDetails};
pub use nat::NatRuleManager;
pub use pool::{PoolManager, PoolSummary};
pub use seg::ServiceEngineGroupLookup;
pub use virtual_service::{NewVirtualService, VirtualServiceManager};

/// Run one transport call under the caller's cancellation token
pub(crate) async fn remote<T, F>(cancel: &CancellationToken, call: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, ClientError>>,
{
    cancellable(cancel, async { call.await.map_err(GatewayError::from) }).await
}
