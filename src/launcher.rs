//! The `start` operation: load, validate, resolve, plan, spawn, supervise.

use crate::config::{self, DEFAULT_SHELL, FRONTED_PROCESS, UPSTREAM_HOST};
use crate::core::ports::PortPlan;
use crate::environment::{mask_value, EnvironmentResolver, ResolvedEnvironment};
use crate::error::StartError;
use crate::manifest::Manifest;
use crate::signal;
use crate::supervisor::{ProcessSupervisor, SupervisorOptions};
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone)]
pub struct StartOptions {
    pub base_port: u16,
    pub directory: PathBuf,
    /// Process type published on `base_port`.
    pub fronted: String,
    pub grace_period: Duration,
    /// Program launched for the proxy; defaults to the running executable.
    pub proxy_program: Option<PathBuf>,
    pub shell: PathBuf,
    pub mirror_output: bool,
}

impl StartOptions {
    pub fn new(base_port: u16, directory: impl Into<PathBuf>) -> Self {
        Self {
            base_port,
            directory: directory.into(),
            fronted: FRONTED_PROCESS.to_string(),
            grace_period: config::grace_period_from_env(),
            proxy_program: None,
            shell: PathBuf::from(DEFAULT_SHELL),
            mirror_output: true,
        }
    }
}

/// Everything `start` needs, computed before a single process exists.
#[derive(Debug, Clone)]
pub struct Preflight {
    pub manifest: Manifest,
    pub environment: ResolvedEnvironment,
    pub plan: PortPlan,
}

/// Runs every check that can fail without side effects.
pub fn preflight(options: &StartOptions) -> Result<Preflight, StartError> {
    let manifest = Manifest::load(&options.directory)?;
    let environment = EnvironmentResolver::resolve(&options.directory, &manifest.topology.env)?;
    let plan = PortPlan::compute(options.base_port, &manifest.topology, &options.fronted)?;
    info!(
        problem_id = manifest.topology.problem_id,
        language = %manifest.topology.language,
        processes = manifest.processes.len(),
        instances = plan.instances.len(),
        "Topology validated"
    );
    Ok(Preflight {
        manifest,
        environment,
        plan,
    })
}

/// Starts the topology in `directory` and blocks until Ctrl-C or SIGTERM.
pub async fn start(base_port: u16, directory: impl Into<PathBuf>) -> Result<(), StartError> {
    start_with(StartOptions::new(base_port, directory), signal::shutdown_signal()).await
}

/// Like [`start`], stopping when `shutdown` resolves instead of on a signal.
pub async fn start_with<F>(options: StartOptions, shutdown: F) -> Result<(), StartError>
where
    F: Future<Output = ()>,
{
    let preflight = preflight(&options)?;
    print_environment(&preflight.environment);

    let proxy_program = match &options.proxy_program {
        Some(program) => program.clone(),
        None => std::env::current_exe()?,
    };
    let mut supervisor = ProcessSupervisor::new(SupervisorOptions {
        shell: options.shell.clone(),
        directory: options.directory.clone(),
        grace_period: options.grace_period,
        proxy_program,
        upstream_host: UPSTREAM_HOST.to_string(),
        mirror_output: options.mirror_output,
    });

    supervisor
        .launch(
            &preflight.manifest.processes,
            &preflight.plan,
            &preflight.environment,
        )
        .await?;
    supervisor.run_until(shutdown).await;
    Ok(())
}

fn print_environment(environment: &ResolvedEnvironment) {
    if environment.required.is_empty() {
        return;
    }
    println!("Using environmental variables:");
    for (name, value) in &environment.required {
        println!("{}={}", name, mask_value(value));
    }
}
