//! Immutable per-application identity.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Name, executable, environment and callback endpoint of an application.
///
/// Loaded once when the application starts and never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Application name (also the crash-log index).
    pub name: String,
    /// Worker executable handed to the isolation backend.
    pub executable: String,
    /// Extra environment for every worker.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Unix-domain endpoint the workers connect back to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl Manifest {
    /// Creates a manifest with an empty environment and the default endpoint.
    pub fn new(name: impl Into<String>, executable: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            executable: executable.into(),
            environment: BTreeMap::new(),
            endpoint: None,
        }
    }

    /// Parses and validates a JSON manifest.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let manifest: Manifest = serde_json::from_str(raw)
            .map_err(|source| ConfigError::Malformed { what: "manifest", source })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Rejects manifests without a name or executable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "name",
                reason: "must not be empty",
            });
        }
        if self.executable.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "executable",
                reason: "must not be empty",
            });
        }
        Ok(())
    }

    /// Endpoint workers are told to connect to.
    ///
    /// Defaults to `<tmp>/<name>.<pid>` when not configured.
    pub fn endpoint(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => std::env::temp_dir()
                .join(format!("{}.{}", self.name, std::process::id()))
                .to_string_lossy()
                .into_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json() {
        let manifest = Manifest::from_json(
            r#"{"name":"echo","executable":"/usr/bin/echo","environment":{"A":"1"}}"#,
        )
        .expect("valid manifest");
        assert_eq!(manifest.name, "echo");
        assert_eq!(manifest.environment.get("A").map(String::as_str), Some("1"));
        assert!(manifest.endpoint().contains("echo."));
    }

    #[test]
    fn test_rejects_empty_executable() {
        let err = Manifest::from_json(r#"{"name":"echo","executable":""}"#).unwrap_err();
        assert_eq!(err.as_label(), "config_invalid");
    }

    #[test]
    fn test_explicit_endpoint_wins() {
        let mut manifest = Manifest::new("echo", "/bin/echo");
        manifest.endpoint = Some("/run/echo.sock".into());
        assert_eq!(manifest.endpoint(), "/run/echo.sock");
    }
}
