//! Kernel module collaborator
//!
//! Abstract interface over the loaded module list and the module loader.
//! [`KldModules`] drives the base system tools; tests use an in-memory
//! implementation.

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

use crate::command::{capture, CommandError};

#[derive(Debug, thiserror::Error)]
pub enum KmodError {
    #[error("failed to query loaded modules: {0}")]
    Query(#[source] CommandError),

    #[error("failed to load {name}: {source}")]
    Load {
        name: String,
        #[source]
        source: CommandError,
    },
}

/// Does the loaded entry `loaded` satisfy a request for `requested`?
///
/// The bus part before `/` and a `.ko` suffix are ignored. Network drivers
/// built into the kernel drop their `if_` prefix, so `if_em` is satisfied by
/// `em`.
pub fn module_name_matches(loaded: &str, requested: &str) -> bool {
    let base = loaded.split_once('/').map_or(loaded, |(_, name)| name);
    let base = base.strip_suffix(".ko").unwrap_or(base);
    if base.is_empty() || requested.is_empty() {
        return false;
    }
    base == requested || requested.strip_prefix("if_") == Some(base)
}

/// Loaded-module queries and module loading
#[async_trait]
pub trait KernelModules: Send + Sync {
    /// Names of loaded files and the modules they contain
    async fn loaded(&self) -> Result<Vec<String>, KmodError>;

    /// Load a module by name
    async fn load(&self, name: &str) -> Result<(), KmodError>;

    async fn is_loaded(&self, name: &str) -> Result<bool, KmodError> {
        Ok(self
            .loaded()
            .await?
            .iter()
            .any(|entry| module_name_matches(entry, name)))
    }
}

/// Base-system implementation using `kldstat -v` and `kldload`
pub struct KldModules {
    kldstat: PathBuf,
    kldload: PathBuf,
}

impl Default for KldModules {
    fn default() -> Self {
        Self::new("/sbin/kldstat", "/sbin/kldload")
    }
}

impl KldModules {
    pub fn new(kldstat: impl Into<PathBuf>, kldload: impl Into<PathBuf>) -> Self {
        Self {
            kldstat: kldstat.into(),
            kldload: kldload.into(),
        }
    }
}

#[async_trait]
impl KernelModules for KldModules {
    async fn loaded(&self) -> Result<Vec<String>, KmodError> {
        let out = capture(&self.kldstat, &["-v"])
            .await
            .map_err(KmodError::Query)?;
        let names = parse_kldstat(&out);
        debug!(count = names.len(), "Read loaded module list");
        Ok(names)
    }

    async fn load(&self, name: &str) -> Result<(), KmodError> {
        capture(&self.kldload, &[name])
            .await
            .map(|_| ())
            .map_err(|source| KmodError::Load {
                name: name.to_string(),
                source,
            })
    }
}

/// Collect file and module names from `kldstat -v` output.
///
/// File lines carry five columns (`Id Refs Address Size Name (path)`);
/// module lines under "Contains modules:" carry two (`Id Name`).
pub fn parse_kldstat(output: &str) -> Vec<String> {
    let mut names = Vec::new();

    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = fields.first() else {
            continue;
        };
        if first.parse::<u32>().is_err() {
            continue;
        }
        match fields.len() {
            2 => names.push(fields[1].to_string()),
            n if n >= 5 => names.push(fields[4].to_string()),
            _ => {}
        }
    }

    names
}

/// In-memory module table (for testing)
#[cfg(test)]
pub struct InMemoryModules {
    loaded: std::sync::Mutex<Vec<String>>,
    load_calls: std::sync::Mutex<Vec<String>>,
    broken: Vec<String>,
}

#[cfg(test)]
impl InMemoryModules {
    pub fn new<I, S>(loaded: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            loaded: std::sync::Mutex::new(loaded.into_iter().map(Into::into).collect()),
            load_calls: std::sync::Mutex::new(Vec::new()),
            broken: Vec::new(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::<String>::new())
    }

    /// Loading these names fails
    pub fn with_broken(mut self, name: &str) -> Self {
        self.broken.push(name.to_string());
        self
    }

    pub fn load_calls(&self) -> Vec<String> {
        self.load_calls.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl KernelModules for InMemoryModules {
    async fn loaded(&self) -> Result<Vec<String>, KmodError> {
        Ok(self.loaded.lock().unwrap().clone())
    }

    async fn load(&self, name: &str) -> Result<(), KmodError> {
        self.load_calls.lock().unwrap().push(name.to_string());
        if self.broken.iter().any(|b| b == name) {
            return Err(KmodError::Load {
                name: name.to_string(),
                source: CommandError::Spawn {
                    command: format!("kldload {name}"),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "load refused"),
                },
            });
        }
        self.loaded.lock().unwrap().push(format!("{name}.ko"));
        Ok(())
    }
}
