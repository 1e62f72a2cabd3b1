//! `.env` loading and required-variable checks.
//!
//! The file is read into a [`ResolvedEnvironment`] instead of being written
//! into the orchestrator's own environment; children receive it at spawn
//! time. Variables already present in the parent environment win over file
//! entries.

use crate::config::ENV_FILE;
use crate::error::{ConfigError, EnvError};
use std::fs;
use std::io;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct ResolvedEnvironment {
    /// Whether `.env` existed in the project directory.
    pub file_found: bool,
    /// Entries loaded from the file that are not already set in the parent.
    pub file_vars: Vec<(String, String)>,
    /// Required variables and their resolved values, in declaration order.
    pub required: Vec<(String, String)>,
}

impl ResolvedEnvironment {
    /// Variables to add on top of the inherited environment of a child.
    pub fn child_vars(&self) -> impl Iterator<Item = (&str, &str)> {
        self.file_vars
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }
}

pub struct EnvironmentResolver;

impl EnvironmentResolver {
    /// Loads `<directory>/.env` (absent is fine) and checks every required
    /// name, failing on the first one that is unset or empty.
    pub fn resolve(directory: &Path, required: &[String]) -> Result<ResolvedEnvironment, EnvError> {
        let (file_found, entries) = match load_env_file(&directory.join(ENV_FILE)) {
            Ok(Some(entries)) => (true, entries),
            Ok(None) => (false, Vec::new()),
            Err(err) => {
                warn!(error = %err, "Could not read .env file; continuing without it");
                (true, Vec::new())
            }
        };

        let file_vars: Vec<(String, String)> = entries
            .into_iter()
            .filter(|(key, _)| std::env::var_os(key).is_none())
            .collect();

        let mut resolved = Vec::with_capacity(required.len());
        for name in required {
            match lookup(name, &file_vars) {
                Some(value) if !value.is_empty() => resolved.push((name.clone(), value)),
                _ => {
                    return Err(EnvError::Unset {
                        name: name.clone(),
                        env_file_found: file_found,
                    })
                }
            }
        }

        Ok(ResolvedEnvironment {
            file_found,
            file_vars,
            required: resolved,
        })
    }
}

fn lookup(name: &str, file_vars: &[(String, String)]) -> Option<String> {
    std::env::var(name).ok().or_else(|| {
        file_vars
            .iter()
            .rev()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
    })
}

/// `Ok(None)` when the file does not exist.
pub fn load_env_file(path: &Path) -> Result<Option<Vec<(String, String)>>, ConfigError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(parse_env(&content))),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

pub fn parse_env(content: &str) -> Vec<(String, String)> {
    let mut entries = Vec::new();
    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            warn!(line = number + 1, "Ignoring .env line without `KEY=VALUE`");
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            warn!(line = number + 1, "Ignoring .env line without a variable name");
            continue;
        }
        entries.push((key.to_string(), unquote(value.trim()).to_string()));
    }
    entries
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Mask values for display, keeping the first and last four characters of
/// long values.
pub fn mask_value(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 8 {
        return "***".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}***{tail}")
}
