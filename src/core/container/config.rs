use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// `[container]` table of `kernel.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Container engine binary (`docker`, `podman`, `container`).
    pub runtime: String,

    pub image: String,

    /// Hard wall-clock limit for one worker run.
    pub timeout_ms: u64,

    /// Bytes retained per output stream (stdout, stderr); the rest is drained and discarded.
    pub max_output_bytes: usize,

    /// Mounted read-write at `/workspace/project` for the main conversation only.
    pub project_root: Option<PathBuf>,

    /// Mounted read-only at `/workspace/env/credentials` when it exists.
    pub credentials_file: Option<PathBuf>,

    /// Extra environment passed to every worker.
    pub env: BTreeMap<String, String>,

    /// Extra engine arguments inserted before the image name.
    pub extra_args: Vec<String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            image: "kestrel-agent:latest".to_string(),
            timeout_ms: 300_000,
            max_output_bytes: 10 * 1024 * 1024,
            project_root: None,
            credentials_file: None,
            env: BTreeMap::new(),
            extra_args: Vec::new(),
        }
    }
}

impl ContainerConfig {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms.max(1))
    }

    pub fn project_root(&self) -> PathBuf {
        self.project_root
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_docker() {
        let config = ContainerConfig::default();
        assert_eq!(config.runtime, "docker");
        assert_eq!(config.timeout_ms, 300_000);
        assert_eq!(config.max_output_bytes, 10 * 1024 * 1024);
        assert!(config.credentials_file.is_none());
    }

    #[test]
    fn parse_partial_toml_keeps_defaults() {
        let content = r#"
runtime = "podman"
timeout_ms = 1000

[env]
TZ = "Europe/Berlin"
"#;
        let config: ContainerConfig = toml::from_str(content).unwrap();
        assert_eq!(config.runtime, "podman");
        assert_eq!(config.timeout_ms, 1000);
        assert_eq!(config.image, "kestrel-agent:latest");
        assert_eq!(config.env.get("TZ").map(String::as_str), Some("Europe/Berlin"));
    }

    #[test]
    fn zero_timeout_is_clamped() {
        let config = ContainerConfig {
            timeout_ms: 0,
            ..ContainerConfig::default()
        };
        assert_eq!(config.timeout(), std::time::Duration::from_millis(1));
    }
}
