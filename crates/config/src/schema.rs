//! Config schema types: sandbox policy, unprivileged identity, mount defaults.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountboxConfig {
    pub sandbox: SandboxConfig,
    pub identity: IdentityConfig,
    pub mount: MountConfig,
}

/// Container policy applied to every sandboxed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Base image used when a request does not name one.
    pub image: String,
    /// Path of the container daemon's control socket. When unset, `DOCKER_HOST`
    /// (if it is a `unix://` URL) and then `/var/run/docker.sock` are used.
    pub socket: Option<PathBuf>,
    /// Memory cap in MiB.
    pub memory_limit_mib: u64,
    /// CPU quota as a fraction of one core (0.5 = half a core).
    pub cpu_quota: f64,
    /// Default wall-clock timeout in seconds.
    pub timeout_secs: u64,
    /// Working directory of the script inside the container.
    pub working_dir: String,
    /// Grace period (milliseconds) for draining output after a forced kill.
    pub kill_grace_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "ubuntu:latest".into(),
            socket: None,
            memory_limit_mib: 512,
            cpu_quota: 0.5,
            timeout_secs: 300,
            working_dir: "/workspace".into(),
            kill_grace_ms: 2_000,
        }
    }
}

/// The unprivileged account user scripts run as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub name: String,
    /// Preferred UID (and GID).
    pub uid: u32,
    /// First UID tried when `uid` is taken.
    pub fallback_first: u32,
    /// Last UID tried when `uid` is taken (inclusive).
    pub fallback_last: u32,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            name: "mountbox".into(),
            uid: 1001,
            fallback_first: 1002,
            fallback_last: 1010,
        }
    }
}

/// Defaults for network mounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    pub mount_point: String,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            mount_point: "/mnt/network".into(),
        }
    }
}
