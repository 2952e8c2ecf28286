//! # edgelb
//!
//! Reconciliation layer mapping logical load balancers onto a cloud edge
//! gateway: DNAT rules, pools, service-engine groups and virtual services,
//! plus a cluster-wide record of the virtual IPs in use, kept consistent
//! under optimistic concurrency.
//!
//! Every operation is idempotent and takes a
//! [`CancellationToken`](tokio_util::sync::CancellationToken), so several
//! controllers can drive the same gateway and retry freely after partial
//! failure.

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod record;
pub mod retry;

pub use error::{GatewayError, ResourceKind, Result};
pub use gateway::{GatewayManager, OneArm, PortDetails};
