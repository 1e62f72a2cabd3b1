//! RestCoder local runner
//!
//! Starts every process type of a project with the instance counts from
//! `restcoder.yaml`, and puts a round-robin proxy on the public port when the
//! web process runs more than one instance.

pub mod commands;
pub mod config;
pub mod core;
pub mod environment;
pub mod error;
pub mod launcher;
pub mod manifest;
pub mod platform;
pub mod proxy;
pub mod signal;
pub mod supervisor;
pub mod utils;

// Re-export commonly used types for convenience
pub use crate::core::models::{InstanceState, ProcessSpec, RunningInstance, TopologyConfig};
pub use crate::core::ports::PortPlan;
pub use environment::{EnvironmentResolver, ResolvedEnvironment};
pub use error::{ConfigError, EnvError, ProxyError, SpawnError, StartError, ValidationError};
pub use launcher::{start, start_with, StartOptions};
pub use manifest::Manifest;
pub use proxy::{ProxyPool, ReverseProxy, RoundRobin, Upstream};
pub use supervisor::{ProcessSupervisor, SupervisorOptions};
