//! Runs the composed script as a host process, without a sandbox.
//!
//! Install, mount, user script and unmount all run on the host with the
//! caller's privileges. There is no isolation and no privilege drop.

use std::{path::PathBuf, process::Stdio, time::Duration};

use {
    futures::StreamExt,
    tokio::process::{Child, Command},
    tokio_util::io::ReaderStream,
    tracing::{debug, info, warn},
};

use crate::{
    compose::{ComposerPolicy, ScriptComposer},
    error::Result,
    request::{ExecutionRequest, ExecutionResult},
};

/// Options for [`DirectRunner`].
#[derive(Debug, Clone)]
pub struct DirectOptions {
    /// Directory the user script starts in.
    pub working_dir: PathBuf,
    /// How long to keep reading output after the process group is killed.
    pub kill_grace: Duration,
}

impl Default for DirectOptions {
    fn default() -> Self {
        Self {
            working_dir: std::env::current_dir().unwrap_or_else(|_| std::env::temp_dir()),
            kill_grace: Duration::from_secs(2),
        }
    }
}

pub struct DirectRunner {
    opts: DirectOptions,
}

impl DirectRunner {
    pub fn new(opts: DirectOptions) -> Self {
        Self { opts }
    }

    fn composer(&self) -> ScriptComposer {
        let script_path = std::env::temp_dir().join(format!("mountbox-{}.sh", uuid::Uuid::new_v4()));
        ScriptComposer::new(ComposerPolicy {
            working_dir: self.opts.working_dir.display().to_string(),
            script_path: script_path.display().to_string(),
            ..ComposerPolicy::default()
        })
    }

    /// Run `request` on the host. The privilege mode is ignored.
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let script = self.composer().compose(&request.as_root());
        debug!(
            working_dir = %self.opts.working_dir.display(),
            timeout_secs = request.timeout().as_secs(),
            "direct exec"
        );

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script.text());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let mut stdout = child.stdout.take().map(ReaderStream::new);
        let mut stderr = child.stderr.take().map(ReaderStream::new);
        let mut out = Vec::new();
        let mut err = Vec::new();

        let deadline = tokio::time::sleep(request.timeout());
        tokio::pin!(deadline);

        let status = loop {
            tokio::select! {
                Some(chunk) = next_chunk(&mut stdout) => collect(chunk, &mut out, &mut stdout),
                Some(chunk) = next_chunk(&mut stderr) => collect(chunk, &mut err, &mut stderr),
                status = child.wait() => break Some(status?),
                () = &mut deadline => break None,
            }
        };

        if status.is_none() {
            warn!(timeout_secs = request.timeout().as_secs(), "direct exec timed out, killing");
            kill_group(&mut child).await;
        }

        let drain = async {
            while let Some(chunk) = next_chunk(&mut stdout).await {
                collect(chunk, &mut out, &mut stdout);
            }
            while let Some(chunk) = next_chunk(&mut stderr).await {
                collect(chunk, &mut err, &mut stderr);
            }
        };
        if tokio::time::timeout(self.opts.kill_grace, drain).await.is_err() {
            warn!("output pipes still open after grace period");
        }

        Ok(match status {
            Some(status) => {
                let code = status.code().map_or(-1, i64::from);
                info!(exit_code = code, "direct exec done");
                ExecutionResult::completed(code, out, err)
            },
            None => ExecutionResult::timed_out(out, err),
        })
    }
}

type Pipe<R> = Option<ReaderStream<R>>;

/// Next chunk of an open pipe; pending forever once the pipe is closed.
async fn next_chunk<R: tokio::io::AsyncRead + Unpin>(
    pipe: &mut Pipe<R>,
) -> Option<std::io::Result<bytes::Bytes>> {
    match pipe {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

fn collect<R>(chunk: std::io::Result<bytes::Bytes>, buf: &mut Vec<u8>, pipe: &mut Pipe<R>) {
    match chunk {
        Ok(bytes) => buf.extend_from_slice(&bytes),
        Err(e) => {
            warn!(error = %e, "failed reading child output");
            *pipe = None;
        },
    }
}

/// Kill the whole process group so background children release the pipes.
///
/// Goes through `kill(1)` because `killpg` needs libc and `unsafe_code` is
/// denied workspace-wide.
async fn kill_group(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let killed = Command::new("sh")
            .arg("-c")
            .arg(format!("kill -9 -{pid}"))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = killed {
            warn!(pid, error = %e, "failed to kill process group");
        }
    }
    if let Err(e) = child.kill().await {
        debug!(error = %e, "child already gone");
    }
}
