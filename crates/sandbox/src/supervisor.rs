//! Drives one sandbox from creation to removal.
//!
//! `Created -> Started -> {Completed | Killed}`. The output stream, the exit
//! wait and the deadline are polled from a single `select!` loop, so the
//! decoder is owned by one task. The container is removed before
//! [`SandboxSupervisor::run`] returns, whatever happened.

use std::{sync::Arc, time::Duration};

use {
    futures::StreamExt,
    tokio::time::Instant,
    tracing::{debug, info, warn},
};

use crate::{
    compose::ComposedScript,
    demux::Demultiplexer,
    error::Result,
    events::{EngineEvent, EventSender, emit},
    isolation::{ContainerSpec, IsolationApi, OutputStream, SandboxConstraints},
    request::ExecutionResult,
};

/// Terminal state of a supervised container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminal {
    Completed(i64),
    Killed,
}

pub struct SandboxSupervisor {
    api: Arc<dyn IsolationApi>,
    constraints: SandboxConstraints,
    working_dir: String,
    kill_grace: Duration,
    events: Option<EventSender>,
}

impl SandboxSupervisor {
    pub fn new(api: Arc<dyn IsolationApi>, constraints: SandboxConstraints) -> Self {
        Self {
            api,
            constraints,
            working_dir: "/workspace".into(),
            kill_grace: Duration::from_secs(2),
            events: None,
        }
    }

    pub fn with_working_dir(mut self, working_dir: impl Into<String>) -> Self {
        self.working_dir = working_dir.into();
        self
    }

    /// How long to keep reading output after a kill, or after the exit when
    /// the stream stays open.
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Run `script` in a fresh container of `image`, killing it at `deadline`.
    ///
    /// A deadline that passes before the container starts yields a timed-out
    /// result without starting it.
    pub async fn run(
        &self,
        image: &str,
        script: &ComposedScript,
        deadline: Instant,
    ) -> Result<ExecutionResult> {
        let spec = ContainerSpec {
            image: image.to_string(),
            command: script.entry_command(),
            working_dir: self.working_dir.clone(),
            constraints: self.constraints.clone(),
        };
        let id = self.api.create(&spec).await?;
        info!(container = %id, image, "sandbox created");
        emit(self.events.as_ref(), EngineEvent::ContainerCreated { id: id.clone() });

        let outcome = self.supervise(&id, deadline).await;

        match self.api.remove(&id).await {
            Ok(()) => {
                debug!(container = %id, "sandbox removed");
                emit(self.events.as_ref(), EngineEvent::Removed { id: id.clone() });
            },
            Err(e) => warn!(container = %id, error = %e, "failed to remove sandbox"),
        }
        outcome
    }

    async fn supervise(&self, id: &str, deadline: Instant) -> Result<ExecutionResult> {
        let mut output = self.api.attach(id).await?;
        let mut exit = self.api.arm_wait(id).await?;
        if Instant::now() >= deadline {
            warn!(container = %id, "deadline passed before start");
            emit(self.events.as_ref(), EngineEvent::TimedOut { id: id.to_string() });
            return Ok(ExecutionResult::timed_out(Vec::new(), Vec::new()));
        }
        self.api.start(id).await?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        info!(container = %id, remaining_secs = remaining.as_secs_f64(), "sandbox started");
        emit(self.events.as_ref(), EngineEvent::ContainerStarted { id: id.to_string() });

        let deadline = tokio::time::sleep_until(deadline);
        tokio::pin!(deadline);

        let mut demux = Demultiplexer::new();
        let mut stream_open = true;
        let terminal = loop {
            tokio::select! {
                chunk = output.next(), if stream_open => match chunk {
                    Some(Ok(bytes)) => demux.feed(&bytes),
                    Some(Err(e)) => {
                        warn!(container = %id, error = %e, "output stream failed");
                        stream_open = false;
                    },
                    None => stream_open = false,
                },
                status = &mut exit => break Terminal::Completed(status?),
                () = &mut deadline => break Terminal::Killed,
            }
        };

        match terminal {
            Terminal::Completed(code) => {
                info!(container = %id, exit_code = code, "sandbox exited");
                emit(self.events.as_ref(), EngineEvent::Exited {
                    id: id.to_string(),
                    exit_code: code,
                });
            },
            Terminal::Killed => {
                warn!(container = %id, "sandbox timed out, killing");
                emit(self.events.as_ref(), EngineEvent::TimedOut { id: id.to_string() });
                if let Err(e) = self.api.kill(id).await {
                    warn!(container = %id, error = %e, "kill failed");
                }
            },
        }

        if stream_open {
            self.drain(id, &mut output, &mut demux).await;
        }
        let (stdout, stderr) = demux.finish();
        Ok(match terminal {
            Terminal::Completed(code) => ExecutionResult::completed(code, stdout, stderr),
            Terminal::Killed => ExecutionResult::timed_out(stdout, stderr),
        })
    }

    async fn drain(&self, id: &str, output: &mut OutputStream, demux: &mut Demultiplexer) {
        let read_all = async {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(bytes) => demux.feed(&bytes),
                    Err(e) => {
                        warn!(container = %id, error = %e, "output stream failed");
                        break;
                    },
                }
            }
        };
        if tokio::time::timeout(self.kill_grace, read_all).await.is_err() {
            warn!(
                container = %id,
                grace_ms = self.kill_grace.as_millis() as u64,
                "output stream still open after grace period"
            );
        }
    }
}
