use std::{
    io::{Read, Write},
    path::PathBuf,
    process::ExitCode,
    time::Duration,
};

use {
    anyhow::{Context, Result, bail},
    clap::Args,
    mountbox_config::MountboxConfig,
    mountbox_sandbox::{
        ActionInput, DirectOptions, DirectRunner, DockerEngine, EngineEvent, EngineSettings,
        ExecutionResult, IsolationApi, RequestDefaults, SandboxEngine, ScriptComposer,
    },
    secrecy::SecretString,
    tokio::sync::broadcast::{self, error::RecvError},
    tracing::{debug, info},
};

/// Exit status reported when the script was killed at its deadline.
const TIMEOUT_EXIT: u8 = 124;
const REDACTED: &str = "********";

/// Script source and request fields shared by `run` and `compose`.
#[derive(Args, Debug, Default)]
pub struct RequestArgs {
    /// Script file to run; "-" reads it from stdin.
    pub script_file: Option<PathBuf>,

    /// Inline script instead of a file.
    #[arg(short = 'c', long = "command", conflicts_with = "script_file")]
    pub command: Option<String>,

    /// JSON action input; flags override its fields.
    #[arg(long, value_name = "FILE")]
    pub input: Option<PathBuf>,

    /// none, nfs, smb or cifs.
    #[arg(long)]
    pub mount_type: Option<String>,

    /// NFS export (host:/path) or SMB share (//host/share).
    #[arg(long)]
    pub mount_source: Option<String>,

    #[arg(long)]
    pub mount_point: Option<String>,

    /// Raw mount -o options.
    #[arg(long)]
    pub mount_options: Option<String>,

    #[arg(long)]
    pub mount_username: Option<String>,

    #[arg(long, env = "MOUNTBOX_MOUNT_PASSWORD", hide_env_values = true)]
    pub mount_password: Option<String>,

    #[arg(long)]
    pub image: Option<String>,

    /// Wall-clock limit in seconds.
    #[arg(long = "timeout", value_name = "SECS")]
    pub timeout_secs: Option<u64>,

    /// Keep root for the user script instead of dropping to the sandbox user.
    #[arg(long)]
    pub run_as_root: bool,
}

impl RequestArgs {
    fn into_input(self) -> Result<ActionInput> {
        let mut input = match &self.input {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                serde_json::from_str::<ActionInput>(&raw)
                    .with_context(|| format!("failed to parse action input {}", path.display()))?
            },
            None => ActionInput::default(),
        };

        match self.read_script()? {
            Some(script) => input.script = script,
            None if self.input.is_none() => {
                bail!("no script given: pass a script file, -c <SCRIPT> or --input <FILE>")
            },
            None => {},
        }

        overlay(&mut input.mount_type, self.mount_type);
        overlay(&mut input.mount_source, self.mount_source);
        overlay(&mut input.mount_point, self.mount_point);
        overlay(&mut input.mount_options, self.mount_options);
        overlay(&mut input.mount_username, self.mount_username);
        overlay(&mut input.image, self.image);
        overlay(&mut input.timeout_secs, self.timeout_secs);
        if let Some(password) = self.mount_password {
            input.mount_password = Some(SecretString::new(password));
        }
        input.run_as_root |= self.run_as_root;
        Ok(input)
    }

    fn read_script(&self) -> Result<Option<String>> {
        if let Some(command) = &self.command {
            return Ok(Some(command.clone()));
        }
        match &self.script_file {
            Some(path) if path.as_os_str() == "-" => {
                let mut script = String::new();
                std::io::stdin()
                    .read_to_string(&mut script)
                    .context("failed to read script from stdin")?;
                Ok(Some(script))
            },
            Some(path) => std::fs::read_to_string(path)
                .map(Some)
                .with_context(|| format!("failed to read script {}", path.display())),
            None => Ok(None),
        }
    }
}

fn overlay<T>(field: &mut Option<T>, flag: Option<T>) {
    if flag.is_some() {
        *field = flag;
    }
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub request: RequestArgs,

    /// Run on the host without a container: no isolation, no privilege drop.
    #[arg(long)]
    pub direct: bool,

    /// Print the result as JSON instead of replaying stdout/stderr.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ComposeArgs {
    #[command(flatten)]
    pub request: RequestArgs,

    /// Print the container entry command instead of the script.
    #[arg(long)]
    pub entry: bool,
}

pub async fn run(args: RunArgs, config: &MountboxConfig) -> Result<ExitCode> {
    let request = args
        .request
        .into_input()?
        .into_request(&RequestDefaults::from(config))?;

    let result = if args.direct {
        let runner = DirectRunner::new(DirectOptions {
            kill_grace: Duration::from_millis(config.sandbox.kill_grace_ms),
            ..DirectOptions::default()
        });
        runner.execute(&request).await.context("direct run failed")?
    } else {
        let engine = SandboxEngine::from_config(config)?;
        log_events(engine.subscribe_events());
        engine
            .execute(&request)
            .await
            .context("sandboxed run failed")?
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        std::io::stdout().write_all(&result.stdout)?;
        std::io::stderr().write_all(&result.stderr)?;
        if result.timed_out {
            eprintln!(
                "mountbox: script timed out after {}s",
                request.timeout().as_secs()
            );
        }
    }
    Ok(exit_status(&result))
}

pub fn compose(args: ComposeArgs, config: &MountboxConfig) -> Result<ExitCode> {
    print!("{}", render_compose(args, config)?);
    Ok(ExitCode::SUCCESS)
}

fn render_compose(args: ComposeArgs, config: &MountboxConfig) -> Result<String> {
    let mut input = args.request.into_input()?;
    if input.mount_password.is_some() {
        input.mount_password = Some(SecretString::new(REDACTED.to_string()));
    }
    let request = input.into_request(&RequestDefaults::from(config))?;
    let composer = ScriptComposer::new(EngineSettings::from(config).composer);
    let script = composer.compose(&request);
    Ok(if args.entry {
        let mut line = shell_words::join(script.entry_command());
        line.push('\n');
        line
    } else {
        script.text().to_string()
    })
}

pub async fn ping(config: &MountboxConfig) -> Result<ExitCode> {
    let docker = DockerEngine::from_config(&config.sandbox)?;
    docker.ping().await?;
    println!(
        "{} control plane reachable at {}",
        docker.backend_name(),
        docker.socket().display()
    );
    Ok(ExitCode::SUCCESS)
}

pub async fn pull(image: &str, config: &MountboxConfig) -> Result<ExitCode> {
    let engine = SandboxEngine::from_config(config)?;
    log_events(engine.subscribe_events());
    engine.ping().await?;
    engine.ensure_image(image).await?;
    println!("{image} is available");
    Ok(ExitCode::SUCCESS)
}

fn log_events(mut rx: broadcast::Receiver<EngineEvent>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(EngineEvent::PullProgress { image, line }) => info!(%image, "{line}"),
                Ok(event) => debug!(?event, "engine event"),
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "engine events dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn exit_status(result: &ExecutionResult) -> ExitCode {
    ExitCode::from(exit_value(result))
}

fn exit_value(result: &ExecutionResult) -> u8 {
    if result.timed_out {
        return TIMEOUT_EXIT;
    }
    // A failed run never reports 0, even when its code wraps to it.
    match result.exit_code.map(|code| u8::try_from(code.rem_euclid(256))) {
        Some(Ok(0)) if !result.succeeded => 1,
        Some(Ok(value)) => value,
        Some(Err(_)) | None => 1,
    }
}
