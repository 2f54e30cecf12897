//! Sandbox configuration: limits, policies and caps.
//!
//! # Enforcement
//!
//! ```text
//! SandboxCaps (system-wide)   ──► create() rejects specs above caps
//!     ≥ ResourceLimits (per sandbox)
//!         ≥ ResourceDemand (per task) ──► execute() rejects demands above limits
//! ```
//!
//! Filesystem checks are lexical: `..` segments are resolved without
//! touching the disk, and a path that climbs above an allowed root is
//! rejected. The isolation backend remains the real boundary.

use super::SandboxError;
use bastion_auth::Actions;
use bastion_types::SandboxId;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Per-sandbox resource envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory in MiB.
    pub memory_mb: u64,
    /// CPU share (100 = one core).
    pub cpu_percent: u32,
    /// Disk in MiB.
    pub disk_mb: u64,
    /// Network bandwidth in kbit/s.
    pub network_kbps: u64,
    /// Wall-clock limit per execution.
    pub max_duration_sec: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            cpu_percent: 100,
            disk_mb: 1_024,
            network_kbps: 1_024,
            max_duration_sec: 30,
        }
    }
}

impl ResourceLimits {
    /// Wall-clock limit as a [`Duration`].
    #[must_use]
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_sec)
    }
}

/// Resources a task declares it needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDemand {
    /// Memory in MiB.
    pub memory_mb: u64,
    /// CPU share (100 = one core).
    pub cpu_percent: u32,
    /// Disk in MiB.
    pub disk_mb: u64,
    /// Network bandwidth in kbit/s.
    pub network_kbps: u64,
}

impl ResourceDemand {
    /// Returns the first dimension exceeding `limits` as `(name, demand, limit)`.
    #[must_use]
    pub fn exceeds(&self, limits: &ResourceLimits) -> Option<(&'static str, u64, u64)> {
        [
            ("memory_mb", self.memory_mb, limits.memory_mb),
            ("cpu_percent", u64::from(self.cpu_percent), u64::from(limits.cpu_percent)),
            ("disk_mb", self.disk_mb, limits.disk_mb),
            ("network_kbps", self.network_kbps, limits.network_kbps),
        ]
        .into_iter()
        .find(|(_, demand, limit)| demand > limit)
    }
}

/// System-wide caps every sandbox must fit under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxCaps {
    /// Memory per sandbox.
    pub max_memory_mb: u64,
    /// CPU share per sandbox.
    pub max_cpu_percent: u32,
    /// Disk per sandbox.
    pub max_disk_mb: u64,
    /// Bandwidth per sandbox.
    pub max_network_kbps: u64,
    /// Wall-clock limit per execution.
    pub max_duration_sec: u64,
    /// Live sandboxes.
    pub max_sandboxes: usize,
}

impl SandboxCaps {
    /// Checks `limits` against the caps.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::InvalidConfig`] naming the first violation.
    pub fn check(&self, limits: &ResourceLimits) -> Result<(), SandboxError> {
        let checks = [
            ("memory_mb", limits.memory_mb, self.max_memory_mb),
            ("cpu_percent", u64::from(limits.cpu_percent), u64::from(self.max_cpu_percent)),
            ("disk_mb", limits.disk_mb, self.max_disk_mb),
            ("network_kbps", limits.network_kbps, self.max_network_kbps),
            ("max_duration_sec", limits.max_duration_sec, self.max_duration_sec),
        ];
        for (name, value, cap) in checks {
            if value > cap {
                return Err(SandboxError::InvalidConfig(format!(
                    "{name} {value} exceeds system cap {cap}"
                )));
            }
        }
        if limits.max_duration_sec == 0 {
            return Err(SandboxError::InvalidConfig(
                "max_duration_sec must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Outbound network access.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "hosts", rename_all = "snake_case")]
pub enum NetworkPolicy {
    /// No network access.
    #[default]
    Denied,
    /// Only listed hosts. `*.example.com` matches subdomains.
    AllowList(Vec<String>),
    /// Any host.
    Unrestricted,
}

impl NetworkPolicy {
    /// Returns `true` if `host` may be contacted.
    ///
    /// ```
    /// use bastion_runtime::sandbox::NetworkPolicy;
    ///
    /// let p = NetworkPolicy::AllowList(vec!["api.internal".into(), "*.cdn.net".into()]);
    /// assert!(p.permits("api.internal"));
    /// assert!(p.permits("img.cdn.net"));
    /// assert!(!p.permits("cdn.net.evil.io"));
    /// assert!(!NetworkPolicy::Denied.permits("api.internal"));
    /// ```
    #[must_use]
    pub fn permits(&self, host: &str) -> bool {
        match self {
            Self::Denied => false,
            Self::Unrestricted => true,
            Self::AllowList(hosts) => hosts.iter().any(|allowed| match allowed.strip_prefix("*.") {
                Some(suffix) => host
                    .strip_suffix(suffix)
                    .is_some_and(|prefix| prefix.ends_with('.') && prefix.len() > 1),
                None => allowed.eq_ignore_ascii_case(host),
            }),
        }
    }
}

/// Filesystem access.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemPolicy {
    /// Roots the task may touch. Relative paths resolve against the first.
    pub allowed_paths: Vec<PathBuf>,
    /// Reject all writes.
    pub read_only: bool,
}

impl FilesystemPolicy {
    /// Read-write access under `roots`.
    #[must_use]
    pub fn read_write(roots: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self {
            allowed_paths: roots.into_iter().map(Into::into).collect(),
            read_only: false,
        }
    }

    /// Read-only access under `roots`.
    #[must_use]
    pub fn read_only(roots: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self {
            read_only: true,
            ..Self::read_write(roots)
        }
    }

    /// Validates a read, returning the normalized path.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::PathDenied`] if the path resolves outside every root.
    pub fn validate_read(&self, path: &str) -> Result<PathBuf, SandboxError> {
        let base = self.allowed_paths.first().ok_or_else(|| SandboxError::PathDenied {
            path: path.to_string(),
            reason: "no filesystem access".into(),
        })?;
        let requested = Path::new(path);
        let absolute = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            base.join(requested)
        };
        let normalized = normalize(&absolute).ok_or_else(|| SandboxError::PathDenied {
            path: path.to_string(),
            reason: "path escapes the filesystem root".into(),
        })?;

        let inside = self
            .allowed_paths
            .iter()
            .filter_map(|root| normalize(root))
            .any(|root| normalized.starts_with(root));
        if !inside {
            return Err(SandboxError::PathDenied {
                path: path.to_string(),
                reason: "outside allowed paths".into(),
            });
        }
        Ok(normalized)
    }

    /// Validates a write, returning the normalized path.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::PathDenied`] if the policy is read-only or the
    /// path resolves outside every root.
    pub fn validate_write(&self, path: &str) -> Result<PathBuf, SandboxError> {
        if self.read_only {
            return Err(SandboxError::PathDenied {
                path: path.to_string(),
                reason: "filesystem is read-only".into(),
            });
        }
        self.validate_read(path)
    }
}

/// Resolves `.` and `..` lexically. Returns `None` if `..` climbs past the root.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() || out.as_os_str().is_empty() {
                    return None;
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}

/// Full description of a sandbox to create.
///
/// # Example
///
/// ```
/// use bastion_auth::Actions;
/// use bastion_runtime::sandbox::{FilesystemPolicy, ResourceLimits, SandboxSpec};
///
/// let spec = SandboxSpec::new("build-42", ResourceLimits::default())
///     .with_filesystem(FilesystemPolicy::read_only(["/srv/data"]))
///     .with_capabilities(Actions::READ);
/// assert!(spec.single_use);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSpec {
    /// Registry key.
    pub id: SandboxId,
    /// Resource envelope.
    pub limits: ResourceLimits,
    /// Network access.
    pub network: NetworkPolicy,
    /// Filesystem access.
    pub filesystem: FilesystemPolicy,
    /// Capabilities granted to tasks.
    pub capabilities: Actions,
    /// Destroy after the first execution completes.
    pub single_use: bool,
}

impl SandboxSpec {
    /// Creates a single-use spec with no network, no filesystem and no capabilities.
    #[must_use]
    pub fn new(id: impl Into<SandboxId>, limits: ResourceLimits) -> Self {
        Self {
            id: id.into(),
            limits,
            network: NetworkPolicy::Denied,
            filesystem: FilesystemPolicy::default(),
            capabilities: Actions::empty(),
            single_use: true,
        }
    }

    /// Sets the network policy.
    #[must_use]
    pub fn with_network(mut self, network: NetworkPolicy) -> Self {
        self.network = network;
        self
    }

    /// Sets the filesystem policy.
    #[must_use]
    pub fn with_filesystem(mut self, filesystem: FilesystemPolicy) -> Self {
        self.filesystem = filesystem;
        self
    }

    /// Sets granted capabilities.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Actions) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Keeps the sandbox registered after execution until explicitly destroyed.
    #[must_use]
    pub fn reusable(mut self) -> Self {
        self.single_use = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> SandboxCaps {
        SandboxCaps {
            max_memory_mb: 1_024,
            max_cpu_percent: 200,
            max_disk_mb: 2_048,
            max_network_kbps: 1_000,
            max_duration_sec: 60,
            max_sandboxes: 4,
        }
    }

    #[test]
    fn caps_accept_defaults() {
        let limits = ResourceLimits {
            network_kbps: 1_000,
            ..ResourceLimits::default()
        };
        assert!(caps().check(&limits).is_ok());
    }

    #[test]
    fn caps_reject_each_dimension() {
        let over = [
            ResourceLimits { memory_mb: 2_048, ..ResourceLimits::default() },
            ResourceLimits { cpu_percent: 300, ..ResourceLimits::default() },
            ResourceLimits { disk_mb: 4_096, ..ResourceLimits::default() },
            ResourceLimits { network_kbps: 5_000, ..ResourceLimits::default() },
            ResourceLimits { max_duration_sec: 600, ..ResourceLimits::default() },
            ResourceLimits { max_duration_sec: 0, network_kbps: 10, ..ResourceLimits::default() },
        ];
        for limits in over {
            assert!(
                matches!(caps().check(&limits), Err(SandboxError::InvalidConfig(_))),
                "{limits:?} should be rejected"
            );
        }
    }

    #[test]
    fn demand_exceeds_reports_dimension() {
        let limits = ResourceLimits::default();
        let demand = ResourceDemand {
            disk_mb: limits.disk_mb + 1,
            ..ResourceDemand::default()
        };
        assert_eq!(
            demand.exceeds(&limits),
            Some(("disk_mb", limits.disk_mb + 1, limits.disk_mb))
        );
        assert_eq!(ResourceDemand::default().exceeds(&limits), None);
    }

    #[test]
    fn filesystem_rejects_traversal() {
        let fs = FilesystemPolicy::read_write(["/srv/work"]);
        assert_eq!(
            fs.validate_read("data/in.csv").expect("inside root"),
            PathBuf::from("/srv/work/data/in.csv")
        );
        assert!(fs.validate_read("../secrets").is_err());
        assert!(fs.validate_read("/srv/work/../other").is_err());
        assert!(fs.validate_read("/etc/passwd").is_err());
        assert!(fs.validate_read("a/./b/../c").is_ok());
    }

    #[test]
    fn filesystem_read_only_blocks_writes() {
        let fs = FilesystemPolicy::read_only(["/srv/work"]);
        assert!(fs.validate_read("x").is_ok());
        assert!(matches!(
            fs.validate_write("x"),
            Err(SandboxError::PathDenied { .. })
        ));
    }

    #[test]
    fn empty_filesystem_policy_denies_everything() {
        assert!(FilesystemPolicy::default().validate_read("/tmp/x").is_err());
    }

    #[test]
    fn allow_list_exact_and_wildcard() {
        let p = NetworkPolicy::AllowList(vec!["db.local".into(), "*.svc".into()]);
        assert!(p.permits("DB.local"));
        assert!(p.permits("orders.svc"));
        assert!(!p.permits("svc"));
        assert!(!p.permits(".svc"));
        assert!(NetworkPolicy::Unrestricted.permits("anything"));
    }
}
