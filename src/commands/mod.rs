//! Subcommand handlers behind the binary.

pub mod parser;

pub use parser::{Cli, Commands, ProxyArgs, StartArgs};

use crate::config;
use crate::error::{ProxyError, StartError};
use crate::launcher::{self, StartOptions};
use crate::proxy::{ProxyOptions, ProxyPool, ReverseProxy};
use crate::signal;

pub fn start_options(args: StartArgs) -> StartOptions {
    let mut options = StartOptions::new(args.port, args.dir);
    if let Some(secs) = args.grace_period {
        options.grace_period = config::grace_period_from_secs(secs);
    }
    options
}

pub async fn run_start(args: StartArgs) -> Result<(), StartError> {
    launcher::start_with(start_options(args), signal::shutdown_signal()).await
}

/// Body of the proxy child process: serve until signalled.
pub async fn run_proxy(args: ProxyArgs) -> Result<(), ProxyError> {
    let pool = ProxyPool::contiguous(
        &args.upstream_host,
        args.upstream_port,
        usize::from(args.upstream_size),
    )?;
    let addr = format!("{}:{}", args.host, args.port);
    let proxy = ReverseProxy::bind(&addr, pool, ProxyOptions::default()).await?;
    proxy.serve(signal::shutdown_signal()).await
}
