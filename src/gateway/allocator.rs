//! Free-address selection on the gateway.
//!
//! An address is in use when a virtual service listens on it or a NAT rule
//! maps to or from it. Candidates are scanned in ascending order so the same
//! gateway state always yields the same address. Selection does not reserve
//! anything: two concurrent callers may be handed the same address, and the
//! later virtual-service create is the one that conflicts.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::Ipv4Net;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::details::GatewayDetails;
use super::remote;
use crate::client::{GatewayClient, IpRange};
use crate::error::{GatewayError, Result};

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

fn invalid(subnet: &str, reason: impl Into<String>) -> GatewayError {
    GatewayError::InvalidSubnet {
        subnet: subnet.to_string(),
        reason: reason.into(),
    }
}

/// Parse an optional IPv4 CIDR restriction. Blank input means unrestricted.
pub fn parse_subnet(cidr: &str) -> Result<Option<Ipv4Net>> {
    let cidr = cidr.trim();
    if cidr.is_empty() {
        return Ok(None);
    }

    let net: Ipv4Net = cidr
        .parse()
        .map_err(|_| invalid(cidr, "expected an IPv4 CIDR such as 10.0.0.0/24"))?;
    if net.addr() != net.network() {
        return Err(invalid(
            cidr,
            format!("host bits are set, did you mean {}?", net.trunc()),
        ));
    }
    Ok(Some(net))
}

/// Host addresses of a subnet as an inclusive u32 span. Network and
/// broadcast addresses are excluded except for /31 and /32.
fn host_span(net: &Ipv4Net) -> (u32, u32) {
    let network = u32::from(net.network());
    let broadcast = u32::from(net.broadcast());
    if net.prefix_len() >= 31 {
        (network, broadcast)
    } else {
        (network + 1, broadcast - 1)
    }
}

fn overlaps(range: &IpRange, span: (u32, u32)) -> bool {
    u32::from(range.start_address) <= span.1 && u32::from(range.end_address) >= span.0
}

/// Lowest address inside `ranges` (and `subnet`, if given) not in `used`.
pub fn first_free(
    ranges: &[IpRange],
    subnet: Option<&Ipv4Net>,
    used: &HashSet<Ipv4Addr>,
) -> Option<Ipv4Addr> {
    let span = subnet.map(host_span).unwrap_or((0, u32::MAX));

    let mut ranges: Vec<&IpRange> = ranges.iter().collect();
    ranges.sort_by_key(|r| r.start_address);

    ranges.into_iter().find_map(|range| {
        let lo = u32::from(range.start_address).max(span.0);
        let hi = u32::from(range.end_address).min(span.1);
        if lo > hi {
            return None;
        }
        (lo..=hi).map(Ipv4Addr::from).find(|addr| !used.contains(addr))
    })
}

// ============================================================================
// Allocator
// ============================================================================

#[derive(Clone)]
pub struct AddressAllocator {
    client: Arc<dyn GatewayClient>,
    gateway: Arc<GatewayDetails>,
}

impl AddressAllocator {
    pub fn new(client: Arc<dyn GatewayClient>, gateway: Arc<GatewayDetails>) -> Self {
        Self { client, gateway }
    }

    /// Pick a free external address from the gateway's ranges, optionally
    /// restricted to `subnet_cidr`.
    pub async fn allocate(&self, cancel: &CancellationToken, subnet_cidr: &str) -> Result<Ipv4Addr> {
        let subnet = parse_subnet(subnet_cidr)?;
        let ranges = &self.gateway.external_ranges;

        if let Some(net) = subnet.as_ref() {
            let span = host_span(net);
            if !ranges.iter().any(|r| overlaps(r, span)) {
                return Err(invalid(
                    subnet_cidr.trim(),
                    format!(
                        "does not intersect the external ranges of gateway '{}'",
                        self.gateway.reference.name
                    ),
                ));
            }
        }

        let used = self.used_addresses(cancel).await?;
        let addr = first_free(ranges, subnet.as_ref(), &used).ok_or_else(|| {
            GatewayError::ExhaustedRange {
                range: match subnet {
                    Some(net) => net.to_string(),
                    None => ranges
                        .iter()
                        .map(IpRange::to_string)
                        .collect::<Vec<_>>()
                        .join(","),
                },
            }
        })?;

        info!(
            "Allocated external address {} on gateway {} ({} in use)",
            addr,
            self.gateway.reference.name,
            used.len()
        );
        Ok(addr)
    }

    /// Pick a free address from an explicit internal range (one-arm mode).
    pub async fn allocate_internal(
        &self,
        cancel: &CancellationToken,
        range: &IpRange,
    ) -> Result<Ipv4Addr> {
        if range.start_address > range.end_address {
            return Err(GatewayError::Configuration(format!(
                "one-arm range {} is empty",
                range
            )));
        }

        let used = self.used_addresses(cancel).await?;
        let addr = first_free(std::slice::from_ref(range), None, &used).ok_or_else(|| {
            GatewayError::ExhaustedRange {
                range: range.to_string(),
            }
        })?;

        debug!("Allocated internal address {} from {}", addr, range);
        Ok(addr)
    }

    async fn used_addresses(&self, cancel: &CancellationToken) -> Result<HashSet<Ipv4Addr>> {
        let gateway_id = self.gateway.id();
        let services = remote(cancel, self.client.list_virtual_services(gateway_id)).await?;
        let rules = remote(cancel, self.client.list_nat_rules(gateway_id)).await?;

        let addresses = services
            .iter()
            .map(|vs| vs.spec.virtual_ip.as_str())
            .chain(rules.iter().flat_map(|rule| {
                [
                    rule.spec.external_address.as_str(),
                    rule.spec.internal_address.as_str(),
                ]
            }));

        Ok(addresses.filter_map(|a| a.parse().ok()).collect())
    }
}
