//! Error types for the local runner
//!
//! One enum per failure family, wrapped by [`StartError`] which carries the
//! category and the exit code reported to the operator.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Descriptor or Procfile missing or malformed.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("restcoder.yaml is missing! You must execute this command under the root directory of your project. (looked in {path})")]
    DescriptorMissing { path: PathBuf },
    #[error("File restcoder.yaml is malformed: {source}")]
    DescriptorMalformed {
        #[source]
        source: serde_yaml::Error,
    },
    #[error("File restcoder.yaml is malformed. The `{key}` property is missing.")]
    MissingKey { key: &'static str },
    #[error("File restcoder.yaml is malformed. {message}")]
    InvalidValue { message: String },
    #[error("Process \"{name}\" must have a positive number of instances (got {count})")]
    InvalidInstanceCount { name: String, count: i64 },
    #[error("Process \"{name}\" requests {count} instances; at most {max} are supported")]
    TooManyInstances { name: String, count: u32, max: u32 },
    #[error("Port {port} assigned to \"{name}\" is out of range")]
    PortOutOfRange { name: String, port: u32 },
    #[error("Procfile is missing! (looked in {path})")]
    ProcfileMissing { path: PathBuf },
    #[error("Procfile is empty")]
    ProcfileEmpty,
    #[error("Process \"{name}\" is declared more than once in your Procfile")]
    DuplicateProcess { name: String },
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Process set in the Procfile disagrees with the descriptor.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Process \"{name}\" is missing in your Procfile")]
    MissingProcess { name: String },
    #[error("Process \"{name}\" is not allowed. Please remove it from your Procfile")]
    ExtraProcess { name: String },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EnvError {
    #[error("{}", unset_message(.name, *.env_file_found))]
    Unset { name: String, env_file_found: bool },
}

fn unset_message(name: &str, env_file_found: bool) -> String {
    if env_file_found {
        format!("Environmental variable \"{name}\" is not set. Please add it to the .env file.")
    } else {
        format!(
            "Environmental variable \"{name}\" is not set. Did you forget to create an .env file?"
        )
    }
}

/// The OS refused to create a child process.
#[derive(Error, Debug)]
#[error("Failed to start {label}: {source}")]
pub struct SpawnError {
    pub label: String,
    #[source]
    pub source: io::Error,
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Proxy could not bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("Upstream {target} is unreachable: {source}")]
    UpstreamUnreachable {
        target: String,
        #[source]
        source: io::Error,
    },
    #[error("Upstream {target} did not accept the connection in time")]
    ConnectTimeout { target: String },
    #[error("Upstream ports {first_port}..+{size} exceed the port range")]
    PortRange { first_port: u16, size: usize },
    #[error("Proxy pool is empty")]
    EmptyPool,
    #[error("Proxy I/O error on {peer}: {source}")]
    Io {
        peer: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Top level error of the `start` operation.
#[derive(Error, Debug)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Config,
    Validation,
    Environment,
    Spawn,
    Proxy,
    Io,
}

impl ErrorCategory {
    pub fn display_name(&self) -> &'static str {
        match self {
            ErrorCategory::Config => "Configuration",
            ErrorCategory::Validation => "Validation",
            ErrorCategory::Environment => "Environment",
            ErrorCategory::Spawn => "Process",
            ErrorCategory::Proxy => "Proxy",
            ErrorCategory::Io => "I/O",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl StartError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            StartError::Config(_) => ErrorCategory::Config,
            StartError::Validation(_) => ErrorCategory::Validation,
            StartError::Env(_) => ErrorCategory::Environment,
            StartError::Spawn(_) => ErrorCategory::Spawn,
            StartError::Proxy(_) => ErrorCategory::Proxy,
            StartError::Io(_) => ErrorCategory::Io,
        }
    }

    /// Non-zero exit code reported by the binary, one per category.
    pub fn exit_code(&self) -> u8 {
        match self.category() {
            ErrorCategory::Io => 1,
            ErrorCategory::Config => 2,
            ErrorCategory::Validation => 3,
            ErrorCategory::Environment => 4,
            ErrorCategory::Spawn => 5,
            ErrorCategory::Proxy => 6,
        }
    }

    /// Whether the failure happened before any process could have been started.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Config | ErrorCategory::Validation | ErrorCategory::Environment
        )
    }

    pub fn user_message(&self) -> String {
        format!("{} error: {}", self.category(), self)
    }
}
