//! CLI module for edgelb
//!
//! Subcommands:
//! - `edgelb create` - Create or converge a composite load balancer
//! - `edgelb get` - Print the external address of a virtual service
//! - `edgelb update` - Replace pool members and move a listener port
//! - `edgelb delete` - Tear down a composite load balancer
//! - `edgelb vips` - Show the virtual IPs recorded for the cluster

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod display;

pub use commands::*;
pub use display::*;

use crate::gateway::PortDetails;

#[derive(Parser, Debug)]
#[command(name = "edgelb")]
#[command(about = "Reconcile composite load balancers on a cloud edge gateway")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to config file (default: ~/.edgelb/config.yaml)
    #[arg(long, env = "EDGELB_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Path to a .env file holding the API token
    #[arg(long, value_name = "FILE", global = true)]
    pub env_file: Option<PathBuf>,

    /// Run against an in-memory gateway instead of the remote API
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Abort the command after this many seconds
    #[arg(long, default_value = "300", global = true)]
    pub timeout: u64,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a load balancer, or converge an existing one
    Create(CreateArgs),

    /// Print the external address of a virtual service
    Get(GetArgs),

    /// Replace pool members and move the listener port
    Update(UpdateArgs),

    /// Delete a load balancer (absent parts are skipped)
    Delete(DeleteArgs),

    /// Show the virtual IPs recorded for this cluster
    Vips,
}

/// Arguments for the create command
#[derive(Parser, Debug)]
pub struct CreateArgs {
    /// Name prefix of the virtual services
    pub name: String,

    /// Name prefix of the pools (default: <NAME>-pool)
    #[arg(long)]
    pub pool_prefix: Option<String>,

    /// Backend member address (repeatable)
    #[arg(long = "member", value_name = "IP", required = true)]
    pub members: Vec<String>,

    /// Listener as PROTOCOL:EXTERNAL_PORT:INTERNAL_PORT[:CERT_ALIAS] (repeatable)
    #[arg(long = "port", value_name = "SPEC", required = true, value_parser = parse_port_spec)]
    pub ports: Vec<PortDetails>,
}

impl CreateArgs {
    pub fn pool_prefix(&self) -> String {
        default_pool_prefix(&self.name, self.pool_prefix.as_deref())
    }
}

/// Arguments for the get command
#[derive(Parser, Debug)]
pub struct GetArgs {
    /// Full virtual service name (<NAME>-<protocol>)
    pub virtual_service: String,
}

/// Arguments for the update command
#[derive(Parser, Debug)]
pub struct UpdateArgs {
    /// Full pool name
    #[arg(long)]
    pub pool: String,

    /// Full virtual service name
    #[arg(long)]
    pub virtual_service: String,

    /// New backend member address (repeatable)
    #[arg(long = "member", value_name = "IP", required = true)]
    pub members: Vec<String>,

    /// Port the members listen on
    #[arg(long)]
    pub internal_port: u16,

    /// Port clients connect to
    #[arg(long)]
    pub external_port: u16,
}

/// Arguments for the delete command
#[derive(Parser, Debug)]
pub struct DeleteArgs {
    /// Name prefix of the virtual services
    pub name: String,

    /// Name prefix of the pools (default: <NAME>-pool)
    #[arg(long)]
    pub pool_prefix: Option<String>,

    /// Listener as PROTOCOL:EXTERNAL_PORT:INTERNAL_PORT (repeatable)
    #[arg(long = "port", value_name = "SPEC", required = true, value_parser = parse_port_spec)]
    pub ports: Vec<PortDetails>,
}

impl DeleteArgs {
    pub fn pool_prefix(&self) -> String {
        default_pool_prefix(&self.name, self.pool_prefix.as_deref())
    }
}

fn default_pool_prefix(name: &str, pool_prefix: Option<&str>) -> String {
    match pool_prefix {
        Some(prefix) => prefix.to_string(),
        None => format!("{}-pool", name),
    }
}
