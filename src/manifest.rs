//! Loading and cross-checking `restcoder.yaml` and the `Procfile`.

use crate::config::{PROCFILE, TOPOLOGY_FILE};
use crate::core::models::{ProcessSpec, TopologyConfig};
use crate::error::{ConfigError, StartError, ValidationError};
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTopology {
    #[serde(default)]
    problem_id: Option<Value>,
    #[serde(default)]
    language: Option<Value>,
    #[serde(default)]
    instances: Option<Value>,
    #[serde(default)]
    env: Option<Vec<String>>,
    #[serde(default)]
    postman_collection_id: Option<Value>,
}

/// Topology and process entries that passed cross-validation.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub topology: TopologyConfig,
    pub processes: Vec<ProcessSpec>,
}

impl Manifest {
    pub fn load(directory: &Path) -> Result<Self, StartError> {
        let topology = parse_topology(directory)?;
        let processes = parse_process_specs(directory)?;
        cross_validate(&topology, &processes)?;
        Ok(Self {
            topology,
            processes,
        })
    }

    pub fn command_for(&self, name: &str) -> Option<&str> {
        self.processes
            .iter()
            .find(|spec| spec.name == name)
            .map(|spec| spec.command.as_str())
    }
}

pub fn parse_topology(directory: &Path) -> Result<TopologyConfig, ConfigError> {
    let path = directory.join(TOPOLOGY_FILE);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(ConfigError::DescriptorMissing { path });
        }
        Err(source) => return Err(ConfigError::Io { path, source }),
    };
    parse_topology_str(&content)
}

pub fn parse_topology_str(content: &str) -> Result<TopologyConfig, ConfigError> {
    let value: Value = serde_yaml::from_str(content)
        .map_err(|source| ConfigError::DescriptorMalformed { source })?;
    // An empty document is reported as missing keys rather than a parse error.
    let value = if value.is_null() {
        Value::Mapping(Mapping::new())
    } else {
        value
    };
    let raw: RawTopology = serde_yaml::from_value(value)
        .map_err(|source| ConfigError::DescriptorMalformed { source })?;

    let problem_id = match present(raw.problem_id) {
        None => return Err(ConfigError::MissingKey { key: "problemId" }),
        Some(value) => problem_id_from(&value)?,
    };

    let language = match present(raw.language) {
        None => return Err(ConfigError::MissingKey { key: "language" }),
        Some(Value::String(language)) if !language.trim().is_empty() => language,
        Some(Value::String(_)) => return Err(ConfigError::MissingKey { key: "language" }),
        Some(other) => {
            return Err(ConfigError::InvalidValue {
                message: format!("`language` must be a string, got {}", describe(&other)),
            })
        }
    };

    let instances = match present(raw.instances) {
        None => return Err(ConfigError::MissingKey { key: "instances" }),
        Some(Value::Mapping(mapping)) => instances_from(mapping)?,
        Some(other) => {
            return Err(ConfigError::InvalidValue {
                message: format!("`instances` must be a mapping, got {}", describe(&other)),
            })
        }
    };

    let postman_collection_id = match present(raw.postman_collection_id) {
        Some(Value::String(id)) => Some(id),
        Some(Value::Number(id)) => Some(id.to_string()),
        _ => None,
    };

    Ok(TopologyConfig {
        problem_id,
        language,
        instances,
        env: raw.env.unwrap_or_default(),
        postman_collection_id,
    })
}

fn present(value: Option<Value>) -> Option<Value> {
    value.filter(|value| !value.is_null())
}

fn problem_id_from(value: &Value) -> Result<i64, ConfigError> {
    let id = match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    };
    match id {
        // A zero id is treated like an absent one.
        Some(0) => Err(ConfigError::MissingKey { key: "problemId" }),
        Some(id) => Ok(id),
        None => Err(ConfigError::InvalidValue {
            message: format!("`problemId` must be an integer, got {}", describe(value)),
        }),
    }
}

fn instances_from(mapping: Mapping) -> Result<Vec<(String, u32)>, ConfigError> {
    let mut instances = Vec::with_capacity(mapping.len());
    for (key, value) in mapping {
        let name = match key {
            Value::String(name) => name,
            other => {
                return Err(ConfigError::InvalidValue {
                    message: format!("process names must be strings, got {}", describe(&other)),
                })
            }
        };
        let count = match &value {
            Value::Number(number) => number.as_i64(),
            _ => None,
        };
        let count = match count {
            Some(count) => count,
            None => {
                return Err(ConfigError::InvalidValue {
                    message: format!(
                        "instance count of \"{}\" must be an integer, got {}",
                        name,
                        describe(&value)
                    ),
                })
            }
        };
        let count = u32::try_from(count)
            .ok()
            .filter(|count| *count > 0)
            .ok_or(ConfigError::InvalidInstanceCount {
                name: name.clone(),
                count,
            })?;
        instances.push((name, count));
    }
    Ok(instances)
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a list",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

pub fn parse_process_specs(directory: &Path) -> Result<Vec<ProcessSpec>, ConfigError> {
    let path = directory.join(PROCFILE);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(ConfigError::ProcfileMissing { path });
        }
        Err(source) => return Err(ConfigError::Io { path, source }),
    };
    parse_process_specs_str(&content)
}

pub fn parse_process_specs_str(content: &str) -> Result<Vec<ProcessSpec>, ConfigError> {
    let mut processes: Vec<ProcessSpec> = Vec::new();
    let mut seen = HashSet::new();

    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((name, command)) = line.split_once(':') else {
            warn!(line = number + 1, "Ignoring Procfile line without `name:command`");
            continue;
        };
        let (name, command) = (name.trim(), command.trim());
        if name.is_empty() {
            warn!(line = number + 1, "Ignoring Procfile line without a process name");
            continue;
        }
        if !seen.insert(name.to_string()) {
            return Err(ConfigError::DuplicateProcess {
                name: name.to_string(),
            });
        }
        debug!(process = name, command, "Procfile entry");
        processes.push(ProcessSpec::new(name, command));
    }

    if processes.is_empty() {
        return Err(ConfigError::ProcfileEmpty);
    }
    Ok(processes)
}

/// Checks that the Procfile declares exactly the process types of the
/// descriptor. Missing names are reported before extra ones, each in
/// declaration order.
pub fn cross_validate(
    topology: &TopologyConfig,
    processes: &[ProcessSpec],
) -> Result<(), ValidationError> {
    let declared: HashSet<&str> = processes.iter().map(|spec| spec.name.as_str()).collect();
    if let Some(name) = topology.process_names().find(|name| !declared.contains(name)) {
        return Err(ValidationError::MissingProcess {
            name: name.to_string(),
        });
    }

    let required: HashSet<&str> = topology.process_names().collect();
    if let Some(spec) = processes
        .iter()
        .find(|spec| !required.contains(spec.name.as_str()))
    {
        return Err(ValidationError::ExtraProcess {
            name: spec.name.clone(),
        });
    }
    Ok(())
}
