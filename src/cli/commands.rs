//! Command implementations for the CLI
//!
//! SBIO pattern: Commands return formatted output, printing is handled by
//! the caller

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::display::{format_address, format_created, format_virtual_ips};
use super::Commands;
use crate::client::{
    ClientError, GatewayClient, InMemoryGateway, IpRange, Protocol, RestGatewayClient,
};
use crate::config::{Config, ConfigError};
use crate::error::GatewayError;
use crate::gateway::{parse_subnet, GatewayManager, PortDetails};
use crate::record::{vip_document, InMemoryRecordStore, RecordStore, RestRecordStore, VipRegistry};

/// Errors that can occur during command execution
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),
}

/// Result type for commands
pub type CommandResult<T> = Result<T, CommandError>;

// ============================================================================
// Argument parsing (pure)
// ============================================================================

/// Parse `PROTOCOL:EXTERNAL_PORT:INTERNAL_PORT[:CERT_ALIAS]`.
///
/// The protocol doubles as the port suffix; HTTPS implies SSL.
pub fn parse_port_spec(spec: &str) -> Result<PortDetails, String> {
    let parts: Vec<&str> = spec.split(':').collect();
    if !(3..=4).contains(&parts.len()) {
        return Err(format!(
            "expected PROTOCOL:EXTERNAL_PORT:INTERNAL_PORT[:CERT_ALIAS], got '{}'",
            spec
        ));
    }

    let protocol: Protocol = parts[0].parse()?;
    let external_port: u16 = parts[1]
        .parse()
        .map_err(|_| format!("invalid external port '{}'", parts[1]))?;
    let internal_port: u16 = parts[2]
        .parse()
        .map_err(|_| format!("invalid internal port '{}'", parts[2]))?;
    let cert_alias = parts.get(3).filter(|a| !a.is_empty()).map(|a| a.to_string());

    if cert_alias.is_some() && protocol != Protocol::Https {
        return Err(format!("certificate alias given for {} listener", protocol));
    }

    Ok(PortDetails {
        port_suffix: protocol.as_str().to_ascii_lowercase(),
        external_port,
        internal_port,
        protocol,
        use_ssl: protocol == Protocol::Https,
        cert_alias,
    })
}

/// Fill in `alias` for SSL listeners that did not name one
pub fn with_certificate_alias(ports: &[PortDetails], alias: &str) -> Vec<PortDetails> {
    ports
        .iter()
        .cloned()
        .map(|mut port| {
            if port.use_ssl && port.cert_alias.is_none() {
                port.cert_alias = Some(alias.to_string());
            }
            port
        })
        .collect()
}

/// In-memory gateway standing in for the remote API in dry-run mode.
///
/// Its external range is the configured VIP subnet, or TEST-NET-1 when the
/// subnet is unrestricted.
pub fn dry_run_gateway(config: &Config) -> CommandResult<InMemoryGateway> {
    let range = match parse_subnet(&config.load_balancer.vip_subnet)? {
        Some(net) => IpRange::new(net.network(), net.broadcast()),
        None => IpRange::new([192, 0, 2, 0].into(), [192, 0, 2, 255].into()),
    };
    Ok(InMemoryGateway::single(&config.load_balancer.network, vec![range]))
}

// ============================================================================
// Execution
// ============================================================================

/// Everything a command runs against
pub struct Backend {
    pub manager: GatewayManager,
    pub registry: VipRegistry,
}

/// Build clients from config and resolve the gateway.
pub async fn connect(
    config: &Config,
    dry_run: bool,
    cancel: &CancellationToken,
) -> CommandResult<Backend> {
    let (client, store): (Arc<dyn GatewayClient>, Arc<dyn RecordStore>) = if dry_run {
        info!("Dry run: using an in-memory gateway");
        let mut store = InMemoryRecordStore::new();
        if !config.cluster_id.is_empty() {
            store = store.with_record(&config.cluster_id, vip_document(&[]));
        }
        (Arc::new(dry_run_gateway(config)?), Arc::new(store))
    } else {
        let token = config.api_token();
        (
            Arc::new(RestGatewayClient::new(&config.gateway.url, token.clone())?),
            Arc::new(RestRecordStore::new(&config.gateway.url, token)?),
        )
    };

    let registry = VipRegistry::new(store).with_conflict_retry(config.conflict_retry());
    let manager = GatewayManager::connect(
        client,
        registry.clone(),
        &config.load_balancer.network,
        config.load_balancer.vip_subnet.clone(),
        cancel,
    )
    .await?
    .with_pending_retry(config.pending_retry());

    Ok(Backend { manager, registry })
}

/// Run one subcommand and return what should be printed
pub async fn execute(
    backend: &Backend,
    config: &Config,
    command: &Commands,
    cancel: &CancellationToken,
) -> CommandResult<String> {
    let manager = &backend.manager;
    let one_arm = config.load_balancer.one_arm.as_ref();

    match command {
        Commands::Create(args) => {
            let ports = with_certificate_alias(&args.ports, &config.certificate_alias());
            let pool_prefix = args.pool_prefix();
            let address = manager
                .create_load_balancer(
                    cancel,
                    &args.name,
                    &pool_prefix,
                    &args.members,
                    &ports,
                    one_arm,
                    &config.cluster_id,
                )
                .await?;
            Ok(format_created(&args.name, &pool_prefix, &ports, &address))
        }
        Commands::Get(args) => {
            let address = manager
                .get_load_balancer(cancel, &args.virtual_service, one_arm)
                .await?;
            Ok(format_address(&args.virtual_service, &address))
        }
        Commands::Update(args) => {
            manager
                .update_load_balancer(
                    cancel,
                    &args.pool,
                    &args.virtual_service,
                    &args.members,
                    args.internal_port,
                    args.external_port,
                )
                .await?;
            Ok(format!(
                "Updated {} (port {}) and pool {} ({} member(s) on port {})\n",
                args.virtual_service,
                args.external_port,
                args.pool,
                args.members.len(),
                args.internal_port
            ))
        }
        Commands::Delete(args) => {
            manager
                .delete_load_balancer(
                    cancel,
                    &args.name,
                    &args.pool_prefix(),
                    &args.ports,
                    one_arm,
                    &config.cluster_id,
                )
                .await?;
            Ok(format!("Deleted load balancer {}\n", args.name))
        }
        Commands::Vips => {
            let record = backend.registry.for_owner(&config.cluster_id).ok_or_else(|| {
                ConfigError::Invalid("clusterId must be set to read the shared record".to_string())
            })?;
            let snapshot = record.read(cancel).await?;
            Ok(format_virtual_ips(record.record_id(), &snapshot))
        }
    }
}
