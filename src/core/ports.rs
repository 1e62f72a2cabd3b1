//! Deterministic port assignment, computed before anything is spawned.
//!
//! - fronted type with one instance: `base`
//! - fronted type with `n > 1` instances: `base+1 ..= base+n`, proxy on `base`
//! - k-th other type (declaration order, fronted type skipped):
//!   `base + 100 * (k + 1) + i`
//!
//! The layout for non-fronted types is internal and may change.

use crate::config::PORT_BLOCK_STRIDE;
use crate::core::models::TopologyConfig;
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstancePlan {
    pub process: String,
    pub instance_index: u32,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyPlan {
    pub process: String,
    pub listen_port: u16,
    pub upstream_ports: Vec<u16>,
}

impl ProxyPlan {
    pub fn first_upstream(&self) -> u16 {
        self.upstream_ports[0]
    }

    pub fn last_upstream(&self) -> u16 {
        self.upstream_ports[self.upstream_ports.len() - 1]
    }

    pub fn pool_size(&self) -> usize {
        self.upstream_ports.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortPlan {
    pub base_port: u16,
    pub instances: Vec<InstancePlan>,
    pub proxy: Option<ProxyPlan>,
}

impl PortPlan {
    pub fn compute(
        base_port: u16,
        topology: &TopologyConfig,
        fronted: &str,
    ) -> Result<Self, ConfigError> {
        let base = u32::from(base_port);
        let mut instances = Vec::with_capacity(topology.total_instances() as usize);
        let mut proxy = None;
        let mut block = 0u32;

        for (name, count) in &topology.instances {
            let count = *count;
            if count >= PORT_BLOCK_STRIDE {
                return Err(ConfigError::TooManyInstances {
                    name: name.clone(),
                    count,
                    max: PORT_BLOCK_STRIDE - 1,
                });
            }

            let first = if name == fronted {
                if count > 1 {
                    base + 1
                } else {
                    base
                }
            } else {
                block += 1;
                base + PORT_BLOCK_STRIDE * block
            };

            let mut ports = Vec::with_capacity(count as usize);
            for index in 0..count {
                let port = checked_port(name, first + index)?;
                ports.push(port);
                instances.push(InstancePlan {
                    process: name.clone(),
                    instance_index: index,
                    port,
                });
            }

            if name == fronted && count > 1 {
                proxy = Some(ProxyPlan {
                    process: name.clone(),
                    listen_port: base_port,
                    upstream_ports: ports,
                });
            }
        }

        Ok(Self {
            base_port,
            instances,
            proxy,
        })
    }

    pub fn ports_for<'a>(&'a self, process: &'a str) -> impl Iterator<Item = u16> + 'a {
        self.instances
            .iter()
            .filter(move |plan| plan.process == process)
            .map(|plan| plan.port)
    }
}

fn checked_port(name: &str, port: u32) -> Result<u16, ConfigError> {
    u16::try_from(port).map_err(|_| ConfigError::PortOutOfRange {
        name: name.to_string(),
        port,
    })
}
