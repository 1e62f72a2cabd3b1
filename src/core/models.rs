//! Topology, process entries and the runtime view of every spawned instance.

use std::fmt;

/// One `name:command` line of the Procfile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub name: String,
    pub command: String,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
        }
    }
}

/// Validated content of `restcoder.yaml`. Loaded once per invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyConfig {
    pub problem_id: i64,
    pub language: String,
    /// Process type → instance count, in descriptor order.
    pub instances: Vec<(String, u32)>,
    /// Required environment variables, in descriptor order.
    pub env: Vec<String>,
    /// Only read by the remote test runner.
    pub postman_collection_id: Option<String>,
}

impl TopologyConfig {
    pub fn instance_count(&self, name: &str) -> Option<u32> {
        self.instances
            .iter()
            .find(|(process, _)| process == name)
            .map(|(_, count)| *count)
    }

    pub fn process_names(&self) -> impl Iterator<Item = &str> {
        self.instances.iter().map(|(name, _)| name.as_str())
    }

    pub fn total_instances(&self) -> u32 {
        self.instances.iter().map(|(_, count)| *count).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceState {
    Starting,
    Running,
    Exited,
    Failed,
}

impl InstanceState {
    pub fn is_alive(&self) -> bool {
        matches!(self, InstanceState::Starting | InstanceState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::Exited => "exited",
            InstanceState::Failed => "failed",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supervisor-owned record of one spawned instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningInstance {
    pub process: String,
    pub instance_index: u32,
    pub port: u16,
    /// OS process id; also the process group id of the instance.
    pub pid: Option<u32>,
    pub state: InstanceState,
    pub exit_code: Option<i32>,
}

impl RunningInstance {
    pub fn starting(process: impl Into<String>, instance_index: u32, port: u16) -> Self {
        Self {
            process: process.into(),
            instance_index,
            port,
            pid: None,
            state: InstanceState::Starting,
            exit_code: None,
        }
    }

    /// Operator-facing label, `web.1` for the first `web` instance.
    pub fn label(&self) -> String {
        instance_label(&self.process, self.instance_index)
    }
}

pub fn instance_label(process: &str, instance_index: u32) -> String {
    format!("{}.{}", process, instance_index + 1)
}
