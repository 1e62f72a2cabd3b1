//! Command line definition (clap derive).

use crate::config::{DEFAULT_BASE_PORT, UPSTREAM_HOST};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "restcoder", version, about = "Run a RestCoder project locally")]
pub struct Cli {
    /// Log filter (trace, debug, info, warn, error or an EnvFilter directive)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start every process of the project with the topology from restcoder.yaml
    Start(StartArgs),

    /// Round-robin proxy process launched by `start`
    #[command(hide = true)]
    Proxy(ProxyArgs),
}

#[derive(Args, Debug, Clone)]
pub struct StartArgs {
    /// Public port; the web process (or its proxy) listens here
    #[arg(short, long, default_value_t = DEFAULT_BASE_PORT)]
    pub port: u16,

    /// Project directory containing restcoder.yaml and Procfile
    #[arg(short, long, default_value = ".")]
    pub dir: PathBuf,

    /// Seconds to wait for processes to stop before killing them
    #[arg(long)]
    pub grace_period: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct ProxyArgs {
    /// Port to listen on
    #[arg(long)]
    pub port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, default_value = UPSTREAM_HOST)]
    pub upstream_host: String,

    /// First upstream port; the pool is `upstream_port..upstream_port+upstream_size`
    #[arg(long)]
    pub upstream_port: u16,

    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    pub upstream_size: u16,
}

impl Cli {
    pub fn parse_command() -> Self {
        Self::parse()
    }
}
