//! Mount capability checks for worker containers.
//!
//! A worker only ever sees host paths that resolve under an operator-approved
//! root and match no blocked pattern. Rejections degrade a launch; they never
//! abort it.

mod allowlist;

pub use allowlist::{MountAllowlist, expand_home};

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

pub const EXTRA_MOUNT_PREFIX: &str = "/workspace/extra";

/// A mount a conversation asks for in its `mountConfig`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountRequest {
    pub host_path: String,
    /// Relative path under `/workspace/extra`; defaults to the host path's file name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_path: Option<String>,
    #[serde(default = "default_readonly")]
    pub readonly: bool,
}

fn default_readonly() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedMount {
    pub allowed: bool,
    pub host_path: PathBuf,
    pub container_path: String,
    pub effective_readonly: bool,
    pub reason: String,
}

impl ValidatedMount {
    fn rejected(host_path: PathBuf, reason: String) -> Self {
        Self {
            allowed: false,
            host_path,
            container_path: String::new(),
            effective_readonly: true,
            reason,
        }
    }
}

/// Immutable per-process mount policy. Without an allowlist every additional mount is rejected.
#[derive(Debug, Clone)]
pub struct MountGuard {
    allowlist: Option<MountAllowlist>,
}

impl MountGuard {
    /// Load the allowlist once. A missing or invalid file yields a deny-all guard.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            info!(
                "[mounts] No mount allowlist at {}, additional mounts are disabled",
                path.display()
            );
            return Self::deny_all();
        }
        match MountAllowlist::load(path) {
            Ok(allowlist) => {
                info!(
                    "[mounts] Loaded allowlist with {} root(s), {} blocked pattern(s)",
                    allowlist.allowed_roots.len(),
                    allowlist.blocked_patterns.len()
                );
                Self::new(allowlist)
            }
            Err(e) => {
                warn!("[mounts] {:#}; additional mounts are disabled", e);
                Self::deny_all()
            }
        }
    }

    pub fn new(allowlist: MountAllowlist) -> Self {
        Self {
            allowlist: Some(allowlist),
        }
    }

    pub fn deny_all() -> Self {
        Self { allowlist: None }
    }

    pub fn allowlist(&self) -> Option<&MountAllowlist> {
        self.allowlist.as_ref()
    }

    pub fn validate_mount(&self, request: &MountRequest, is_main: bool) -> ValidatedMount {
        let requested_host = expand_home(&request.host_path);

        let Some(allowlist) = &self.allowlist else {
            return ValidatedMount::rejected(
                requested_host,
                "no mount allowlist configured".to_string(),
            );
        };

        // 1. container path must be a clean relative path
        let container_rel = match &request.container_path {
            Some(path) => path.trim().to_string(),
            None => requested_host
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        if let Err(reason) = check_container_path(&container_rel) {
            return ValidatedMount::rejected(requested_host, reason);
        }

        // 2. host path must resolve
        let canonical = match std::fs::canonicalize(&requested_host) {
            Ok(path) => path,
            Err(e) => {
                return ValidatedMount::rejected(
                    requested_host.clone(),
                    format!("host path {} cannot be resolved: {}", requested_host.display(), e),
                );
            }
        };

        // 3. under an allowed root (the most specific one wins)
        let Some(root) = allowlist
            .allowed_roots
            .iter()
            .filter(|root| canonical.starts_with(&root.path))
            .max_by_key(|root| root.path.components().count())
        else {
            return ValidatedMount::rejected(
                canonical.clone(),
                format!("{} is not under any allowed root", canonical.display()),
            );
        };

        // 4. blocked patterns
        let canonical_str = canonical.to_string_lossy();
        if let Some(pattern) = allowlist
            .blocked_patterns
            .iter()
            .find(|pattern| canonical_str.contains(pattern.as_str()))
        {
            return ValidatedMount::rejected(
                canonical.clone(),
                format!("{} matches blocked pattern '{}'", canonical.display(), pattern),
            );
        }

        // 5. policy can only tighten the requested mode
        let effective_readonly = request.readonly
            || !root.allow_read_write
            || (!is_main && allowlist.non_main_read_only);

        ValidatedMount {
            allowed: true,
            container_path: format!("{}/{}", EXTRA_MOUNT_PREFIX, container_rel),
            effective_readonly,
            reason: format!("under allowed root {}", root.path.display()),
            host_path: canonical,
        }
    }

    /// Validate every request and keep only the allowed ones. Rejections are logged.
    pub fn validate_additional_mounts(
        &self,
        requests: &[MountRequest],
        folder: &str,
        is_main: bool,
    ) -> Vec<ValidatedMount> {
        requests
            .iter()
            .filter_map(|request| {
                let validated = self.validate_mount(request, is_main);
                if validated.allowed {
                    Some(validated)
                } else {
                    warn!(
                        "[mounts] Rejected mount {} for '{}': {}",
                        request.host_path, folder, validated.reason
                    );
                    None
                }
            })
            .collect()
    }
}

fn check_container_path(path: &str) -> Result<(), String> {
    if path.is_empty() {
        return Err("container path is empty".to_string());
    }
    if path.starts_with('/') || path.starts_with('\\') {
        return Err(format!("container path '{}' must be relative", path));
    }
    if path.contains(':') {
        return Err(format!("container path '{}' must not contain ':'", path));
    }
    let traverses = Path::new(path)
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        || path.split(['/', '\\']).any(|segment| segment == "..");
    if traverses {
        return Err(format!("container path '{}' contains a parent segment", path));
    }
    Ok(())
}
