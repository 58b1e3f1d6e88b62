//! The seam between the engine and the container daemon.

use std::{future::Future, pin::Pin};

use {async_trait::async_trait, bytes::Bytes, futures::Stream};

use crate::error::Result;

/// Raw multiplexed output of an attached container.
pub type OutputStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Resolves with the container's exit code once it stops.
pub type ExitFuture = Pin<Box<dyn Future<Output = Result<i64>> + Send>>;

/// Callback receiving one human-readable line per pull progress update.
pub type PullProgress<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Resource and capability limits applied to every sandbox.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxConstraints {
    pub memory_bytes: u64,
    /// Fraction of one CPU core.
    pub cpu_fraction: f64,
    pub capabilities: Vec<String>,
    pub auto_remove: bool,
}

impl Default for SandboxConstraints {
    fn default() -> Self {
        Self {
            memory_bytes: 512 * 1024 * 1024,
            cpu_fraction: 0.5,
            capabilities: vec!["SYS_ADMIN".into()],
            auto_remove: true,
        }
    }
}

impl From<&mountbox_config::SandboxConfig> for SandboxConstraints {
    fn from(cfg: &mountbox_config::SandboxConfig) -> Self {
        Self {
            memory_bytes: cfg.memory_limit_mib * 1024 * 1024,
            cpu_fraction: cfg.cpu_quota,
            ..Self::default()
        }
    }
}

impl SandboxConstraints {
    /// CPU limit in the daemon's billionths-of-a-core unit.
    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_fraction * 1e9).round() as i64
    }
}

/// Everything needed to create one sandbox.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub command: Vec<String>,
    pub working_dir: String,
    pub constraints: SandboxConstraints,
}

/// Operations the engine needs from an isolation daemon.
///
/// `kill` and `remove` treat a container that is already gone, or already
/// being removed, as success.
#[async_trait]
pub trait IsolationApi: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Check the control plane is reachable.
    async fn ping(&self) -> Result<()>;

    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Pull `image`, returning once the daemon reports the pull finished.
    async fn pull_image(&self, image: &str, progress: Option<PullProgress<'_>>) -> Result<()>;

    /// Create a container and return its id. The container is not started.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    /// Attach to the combined stdout/stderr stream. Call before `start`.
    async fn attach(&self, id: &str) -> Result<OutputStream>;

    /// Register interest in the next exit. Call before `start`.
    async fn arm_wait(&self, id: &str) -> Result<ExitFuture>;

    async fn start(&self, id: &str) -> Result<()>;

    async fn kill(&self, id: &str) -> Result<()>;

    async fn remove(&self, id: &str) -> Result<()>;
}
