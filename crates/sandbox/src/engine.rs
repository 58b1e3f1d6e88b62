//! Request → composed script → control-plane probe → image → supervised run.

use std::{sync::Arc, time::Duration};

use {
    mountbox_config::MountboxConfig,
    tokio::{sync::broadcast, time::Instant},
    tracing::{info, warn},
};

use crate::{
    compose::{ComposedScript, ComposerPolicy, ScriptComposer},
    docker::DockerEngine,
    events::{EngineEvent, EventSender, emit},
    error::Result,
    identity::IdentityPolicy,
    image::ImageResolver,
    isolation::{IsolationApi, PullProgress, SandboxConstraints},
    request::{ExecutionRequest, ExecutionResult},
    supervisor::SandboxSupervisor,
};

/// Policy the engine applies to every request.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub constraints: SandboxConstraints,
    pub composer: ComposerPolicy,
    pub kill_grace: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            constraints: SandboxConstraints::default(),
            composer: ComposerPolicy::default(),
            kill_grace: Duration::from_secs(2),
        }
    }
}

impl From<&MountboxConfig> for EngineSettings {
    fn from(cfg: &MountboxConfig) -> Self {
        Self {
            constraints: SandboxConstraints::from(&cfg.sandbox),
            composer: ComposerPolicy {
                working_dir: cfg.sandbox.working_dir.clone(),
                identity: IdentityPolicy::from(&cfg.identity),
                ..ComposerPolicy::default()
            },
            kill_grace: Duration::from_millis(cfg.sandbox.kill_grace_ms),
        }
    }
}

/// Runs [`ExecutionRequest`]s in fresh sandboxes, one container per request.
pub struct SandboxEngine {
    api: Arc<dyn IsolationApi>,
    composer: ScriptComposer,
    resolver: ImageResolver,
    supervisor: SandboxSupervisor,
    event_tx: EventSender,
}

impl SandboxEngine {
    pub fn new(api: Arc<dyn IsolationApi>, settings: EngineSettings) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        let supervisor = SandboxSupervisor::new(Arc::clone(&api), settings.constraints)
            .with_working_dir(settings.composer.working_dir.clone())
            .with_kill_grace(settings.kill_grace)
            .with_events(event_tx.clone());
        Self {
            resolver: ImageResolver::new(Arc::clone(&api)),
            composer: ScriptComposer::new(settings.composer),
            supervisor,
            api,
            event_tx,
        }
    }

    /// Docker-backed engine configured from `cfg`.
    pub fn from_config(cfg: &MountboxConfig) -> Result<Self> {
        Ok(Self::new(
            Arc::new(DockerEngine::from_config(&cfg.sandbox)?),
            EngineSettings::from(cfg),
        ))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    pub fn compose(&self, request: &ExecutionRequest) -> ComposedScript {
        self.composer.compose(request)
    }

    pub async fn ping(&self) -> Result<()> {
        self.api.ping().await
    }

    /// Make `image` available locally, publishing pull progress as events.
    pub async fn ensure_image(&self, image: &str) -> Result<()> {
        let report: PullProgress<'_> = &|line: &str| {
            emit(Some(&self.event_tx), EngineEvent::PullProgress {
                image: image.to_string(),
                line: line.to_string(),
            });
        };
        if self.resolver.ensure(image, Some(report)).await? {
            emit(Some(&self.event_tx), EngineEvent::ImagePulled {
                image: image.to_string(),
            });
        }
        Ok(())
    }

    /// Run one request to completion.
    ///
    /// Errors only for failures that prevent a run: an unreachable control
    /// plane, an unresolvable image, or the daemon refusing to create, attach
    /// or start the sandbox. Mount failures, script failures and timeouts are
    /// reported in the returned [`ExecutionResult`]. The timeout covers the
    /// whole request, image pull included.
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let deadline = Instant::now() + request.timeout();
        let script = self.composer.compose(request);
        info!(
            image = request.image(),
            mount = request.mount().map(|m| m.kind.fs_type()),
            privilege = ?request.privilege_mode(),
            stages = script.stages().len(),
            "executing request"
        );

        let prepare = async {
            self.api.ping().await?;
            self.ensure_image(request.image()).await
        };
        let result = match tokio::time::timeout_at(deadline, prepare).await {
            Ok(prepared) => {
                prepared?;
                self.supervisor
                    .run(request.image(), &script, deadline)
                    .await?
            },
            Err(_) => {
                warn!(image = request.image(), "deadline passed while preparing the image");
                ExecutionResult::timed_out(Vec::new(), Vec::new())
            },
        };
        if result.timed_out {
            warn!(timeout_secs = request.timeout().as_secs(), "request timed out");
        } else {
            info!(exit_code = ?result.exit_code, succeeded = result.succeeded, "request finished");
        }
        Ok(result)
    }
}
