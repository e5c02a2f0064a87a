use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;

/// Named secret lookups backed by some store. Implementations must not log
/// resolved values.
pub trait SecretStore: Send + Sync {
    fn resolve(&self, name: &str) -> Result<String, PipelineError>;
}

/// Secrets loaded from a flat YAML mapping of name to value.
pub struct FileStore {
    values: BTreeMap<String, String>,
}

impl FileStore {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read secrets file: {}", path.display()))?;
        let values: BTreeMap<String, String> = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse secrets YAML: {}", path.display()))?;
        Ok(Self { values })
    }
}

impl SecretStore for FileStore {
    fn resolve(&self, name: &str) -> Result<String, PipelineError> {
        self.values
            .get(name)
            .cloned()
            .ok_or_else(|| PipelineError::SecretResolution {
                name: name.to_string(),
                reason: "not present in secrets file".to_string(),
            })
    }
}

/// Secrets read from `CONVEYOR_SECRET_<NAME>` environment variables, the
/// fallback store when no secrets file is supplied.
pub struct EnvStore {
    prefix: String,
}

impl EnvStore {
    pub fn new() -> Self {
        Self {
            prefix: "CONVEYOR_SECRET_".to_string(),
        }
    }
}

impl Default for EnvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretStore for EnvStore {
    fn resolve(&self, name: &str) -> Result<String, PipelineError> {
        let var = format!("{}{}", self.prefix, name.to_uppercase());
        std::env::var(&var).map_err(|_| PipelineError::SecretResolution {
            name: name.to_string(),
            reason: format!("environment variable {var} is not set"),
        })
    }
}

/// In-memory store for tests and embedding.
#[derive(Default)]
pub struct MemoryStore {
    values: BTreeMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }
}

impl SecretStore for MemoryStore {
    fn resolve(&self, name: &str) -> Result<String, PipelineError> {
        self.values
            .get(name)
            .cloned()
            .ok_or_else(|| PipelineError::SecretResolution {
                name: name.to_string(),
                reason: "not present in store".to_string(),
            })
    }
}

/// One secret a stage asks for: the store lookup name plus the environment
/// variable the value is exposed under inside the scope. The shorthand form
/// `- accessKey` exposes the secret under its own name.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CredentialRequest {
    Name(String),
    Mapped { secret: String, env: String },
}

impl CredentialRequest {
    pub fn secret(&self) -> &str {
        match self {
            CredentialRequest::Name(name) => name,
            CredentialRequest::Mapped { secret, .. } => secret,
        }
    }

    pub fn env_name(&self) -> &str {
        match self {
            CredentialRequest::Name(name) => name,
            CredentialRequest::Mapped { env, .. } => env,
        }
    }
}

/// Resolved credentials for exactly one stage execution. The values live only
/// as long as the scope's body; they are never written into the process
/// environment and never appear in `Debug` output.
pub struct CredentialSet {
    values: Vec<(String, String)>,
}

impl CredentialSet {
    pub fn env(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Raw values, used to scrub captured tool output.
    pub fn redactions(&self) -> Vec<String> {
        self.values.iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.values.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("CredentialSet")
            .field("env", &names)
            .finish()
    }
}

/// Resolve every requested secret, hand the set to `body` and drop it on
/// every exit path. If any lookup fails the body never executes and no
/// partial injection is observable.
pub fn with_scope<T>(
    store: &dyn SecretStore,
    requests: &[CredentialRequest],
    body: impl FnOnce(&CredentialSet) -> T,
) -> Result<T, PipelineError> {
    let mut values = Vec::with_capacity(requests.len());
    for request in requests {
        let value = store.resolve(request.secret())?;
        values.push((request.env_name().to_string(), value));
    }
    let set = CredentialSet { values };
    Ok(body(&set))
}
