//! Display formatting for CLI output
//!
//! SBIO pattern: Pure functions that format data for display

use crate::gateway::{derived_name, PortDetails};
use crate::record::VipSnapshot;

// ============================================================================
// Table formatting helpers
// ============================================================================

/// Format a simple table with headers and rows
pub fn format_table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    if rows.is_empty() {
        return "No resources found.\n".to_string();
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let mut output = String::new();

    for (i, header) in headers.iter().enumerate() {
        if i > 0 {
            output.push_str("   ");
        }
        output.push_str(&format!(
            "{:width$}",
            header.to_uppercase(),
            width = widths[i]
        ));
    }
    output.push('\n');

    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i > 0 {
                output.push_str("   ");
            }
            if i < widths.len() {
                output.push_str(&format!("{:width$}", cell, width = widths[i]));
            } else {
                output.push_str(cell);
            }
        }
        output.push('\n');
    }

    output
}

// ============================================================================
// Load balancer display
// ============================================================================

/// Summary of a created load balancer: one row per listener
pub fn format_created(
    name_prefix: &str,
    pool_prefix: &str,
    ports: &[PortDetails],
    address: &str,
) -> String {
    let rows = ports
        .iter()
        .map(|port| {
            vec![
                derived_name(name_prefix, &port.port_suffix),
                derived_name(pool_prefix, &port.port_suffix),
                port.protocol.to_string(),
                format!("{}:{}", address, port.external_port),
                port.internal_port.to_string(),
                port.cert_alias.clone().unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect();

    let mut output = format!("Load balancer {} is available at {}\n\n", name_prefix, address);
    output.push_str(&format_table(
        &["virtual service", "pool", "protocol", "listen", "member port", "certificate"],
        rows,
    ));
    output
}

pub fn format_address(virtual_service: &str, address: &str) -> String {
    if address.is_empty() {
        format!("{}: not found\n", virtual_service)
    } else {
        format!("{}: {}\n", virtual_service, address)
    }
}

pub fn format_virtual_ips(record_id: &str, snapshot: &VipSnapshot) -> String {
    let mut output = format!("Record: {}\nVersion: {}\n\n", record_id, snapshot.version);
    let rows = snapshot
        .virtual_ips
        .iter()
        .map(|ip| vec![ip.clone()])
        .collect();
    output.push_str(&format_table(&["virtual ip"], rows));
    output
}
