use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Always blocked, whatever the operator file says.
pub const BUILTIN_BLOCKED_PATTERNS: &[&str] = &[
    ".ssh",
    ".gnupg",
    ".gpg",
    ".aws",
    ".azure",
    ".gcloud",
    ".kube",
    ".docker",
    "credentials",
    ".env",
    ".netrc",
    ".npmrc",
    ".pypirc",
    "id_rsa",
    "id_ed25519",
    "private_key",
    ".secret",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct AllowlistFile {
    allowed_roots: Vec<AllowedRootFile>,
    #[serde(default)]
    blocked_patterns: Vec<String>,
    #[serde(default = "default_non_main_read_only")]
    non_main_read_only: bool,
}

fn default_non_main_read_only() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct AllowedRootFile {
    path: String,
    #[serde(default)]
    allow_read_write: bool,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedRoot {
    /// Canonical absolute path.
    pub path: PathBuf,
    pub allow_read_write: bool,
    pub description: Option<String>,
}

/// Operator mount policy. Roots are canonicalized and the built-in blocklist is
/// merged in at load time; the value never changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountAllowlist {
    pub allowed_roots: Vec<AllowedRoot>,
    pub blocked_patterns: Vec<String>,
    pub non_main_read_only: bool,
}

impl MountAllowlist {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading mount allowlist {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("parsing mount allowlist {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let file: AllowlistFile = serde_json::from_str(content)?;

        let mut allowed_roots = Vec::with_capacity(file.allowed_roots.len());
        for root in file.allowed_roots {
            if root.path.trim().is_empty() {
                bail!("allowed root path must not be empty");
            }
            let expanded = expand_home(&root.path);
            match std::fs::canonicalize(&expanded) {
                Ok(path) => allowed_roots.push(AllowedRoot {
                    path,
                    allow_read_write: root.allow_read_write,
                    description: root.description,
                }),
                Err(e) => warn!(
                    "[mounts] Allowed root {} is not resolvable ({}), ignoring it",
                    expanded.display(),
                    e
                ),
            }
        }

        let mut blocked_patterns: Vec<String> = BUILTIN_BLOCKED_PATTERNS
            .iter()
            .map(|p| p.to_string())
            .collect();
        for pattern in file.blocked_patterns {
            let pattern = pattern.trim().to_string();
            if !pattern.is_empty() && !blocked_patterns.contains(&pattern) {
                blocked_patterns.push(pattern);
            }
        }

        Ok(Self {
            allowed_roots,
            blocked_patterns,
            non_main_read_only: file.non_main_read_only,
        })
    }
}

/// `~` and `~/x` resolve against the operator's home directory.
pub fn expand_home(raw: &str) -> PathBuf {
    let raw = raw.trim();
    if raw == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }
    if let Some(rest) = raw.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(raw)
}
