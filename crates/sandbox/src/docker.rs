//! [`IsolationApi`] over the Docker Engine API on its local unix socket.
//!
//! Lifecycle calls go through `bollard`. Attach is a raw HTTP upgrade so the
//! framed byte stream reaches [`crate::demux`] undecoded.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    pin::pin,
};

use {
    async_trait::async_trait,
    bollard::{
        API_DEFAULT_VERSION, Docker,
        errors::Error as BollardError,
        models::{ContainerCreateBody, CreateImageInfo, HostConfig},
        query_parameters::{
            CreateContainerOptions, CreateImageOptions, CreateImageOptionsBuilder,
            KillContainerOptions, RemoveContainerOptionsBuilder, StartContainerOptions,
            WaitContainerOptionsBuilder,
        },
    },
    bytes::Bytes,
    futures::{StreamExt, TryStreamExt},
    http::{Method, Request, StatusCode, header},
    http_body_util::{BodyExt, Full},
    hyper_util::{client::legacy::Client, rt::TokioIo},
    hyperlocal::{UnixClientExt, UnixConnector, Uri as UnixUri},
    tokio_util::io::ReaderStream,
    tracing::debug,
    url::form_urlencoded,
};

use crate::{
    error::{Error, Result},
    image::split_reference,
    isolation::{ContainerSpec, ExitFuture, IsolationApi, OutputStream, PullProgress},
};

pub const DEFAULT_SOCKET: &str = "/var/run/docker.sock";

/// Label set on every container this engine creates.
pub const MANAGED_LABEL: &str = "org.mountbox.managed";

/// Seconds bollard waits for a response head.
const DOCKER_TIMEOUT_SECS: u64 = 120;

/// Pick the daemon socket: explicit config, then a `unix://` `DOCKER_HOST`,
/// then the default path.
pub fn resolve_socket(configured: Option<&Path>, docker_host: Option<&str>) -> PathBuf {
    if let Some(path) = configured {
        return path.to_path_buf();
    }
    match docker_host.and_then(|host| host.strip_prefix("unix://")) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(DEFAULT_SOCKET),
    }
}

/// Container configuration for one sandbox.
pub fn container_body(spec: &ContainerSpec) -> ContainerCreateBody {
    let c = &spec.constraints;
    ContainerCreateBody {
        image: Some(spec.image.clone()),
        cmd: Some(spec.command.clone()),
        working_dir: Some(spec.working_dir.clone()),
        attach_stdin: Some(false),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        open_stdin: Some(false),
        tty: Some(false),
        labels: Some(HashMap::from([(
            MANAGED_LABEL.to_string(),
            "true".to_string(),
        )])),
        host_config: Some(HostConfig {
            memory: Some(i64::try_from(c.memory_bytes).unwrap_or(i64::MAX)),
            nano_cpus: Some(c.nano_cpus()),
            cap_add: Some(c.capabilities.clone()),
            auto_remove: Some(c.auto_remove),
            ..HostConfig::default()
        }),
        ..ContainerCreateBody::default()
    }
}

/// Pull parameters for `image`; digest references carry no tag.
pub fn pull_options(image: &str) -> CreateImageOptions {
    let (repository, tag) = split_reference(image);
    let builder = CreateImageOptionsBuilder::new().from_image(repository);
    match tag {
        Some(tag) => builder.tag(tag).build(),
        None => builder.build(),
    }
}

/// One pull progress update, rendered for humans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullLine {
    Progress(String),
    Failed(String),
}

/// Render one progress update. Updates without a status yield `None`.
pub fn pull_line(info: &CreateImageInfo) -> Option<PullLine> {
    if let Some(message) = info.error_detail.as_ref().and_then(|d| d.message.clone()) {
        return Some(PullLine::Failed(message));
    }
    let status = info.status.as_deref().filter(|s| !s.is_empty())?;
    let mut rendered = String::new();
    if let Some(id) = info.id.as_deref().filter(|id| !id.is_empty()) {
        rendered.push_str(id);
        rendered.push_str(": ");
    }
    rendered.push_str(status);
    if let Some(progress) = info.progress.as_deref().filter(|p| !p.is_empty()) {
        rendered.push(' ');
        rendered.push_str(progress);
    }
    Some(PullLine::Progress(rendered))
}

/// HTTP status the daemon answered with, if the failure came from it.
fn daemon_status(error: &BollardError) -> Option<u16> {
    match error {
        BollardError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

/// Treat success, plus a daemon answer in `tolerated`, as done.
fn tolerating(
    operation: &'static str,
    outcome: std::result::Result<(), BollardError>,
    tolerated: &[u16],
) -> Result<()> {
    match outcome {
        Ok(()) => Ok(()),
        Err(e) if daemon_status(&e).is_some_and(|s| tolerated.contains(&s)) => {
            debug!(operation, error = %e, "tolerated daemon answer");
            Ok(())
        },
        Err(e) => Err(Error::isolation(operation, e.to_string())),
    }
}

/// Exit code of the container's next exit.
async fn next_exit(docker: Docker, id: String) -> Result<i64> {
    let options = WaitContainerOptionsBuilder::new()
        .condition("next-exit")
        .build();
    let mut wait = pin!(docker.wait_container(&id, Some(options)));
    match wait.next().await {
        Some(Ok(response)) => Ok(response.status_code),
        // bollard reports non-zero exits as errors.
        Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
        Some(Err(e)) => Err(Error::isolation("wait", e.to_string())),
        None => Err(Error::isolation("wait", "wait ended without an exit status")),
    }
}

fn container_path(id: &str, action: &str, query: &[(&str, &str)]) -> String {
    let mut path = format!("/containers/{id}/{action}");
    if !query.is_empty() {
        let encoded = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(query)
            .finish();
        path.push('?');
        path.push_str(&encoded);
    }
    path
}

/// Docker Engine client bound to one unix socket.
pub struct DockerEngine {
    socket: PathBuf,
    docker: Docker,
    /// Raw client for the attach upgrade.
    client: Client<UnixConnector, Full<Bytes>>,
}

impl DockerEngine {
    pub fn new(socket: impl Into<PathBuf>) -> Result<Self> {
        let socket = socket.into();
        let docker = Docker::connect_with_unix(
            &socket.to_string_lossy(),
            DOCKER_TIMEOUT_SECS,
            API_DEFAULT_VERSION,
        )
        .map_err(|e| Error::ControlPlaneUnavailable {
            socket: socket.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            socket,
            docker,
            client: Client::unix(),
        })
    }

    /// Resolve the socket from config and `DOCKER_HOST`.
    pub fn from_config(cfg: &mountbox_config::SandboxConfig) -> Result<Self> {
        let docker_host = std::env::var("DOCKER_HOST").ok();
        Self::new(resolve_socket(cfg.socket.as_deref(), docker_host.as_deref()))
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    fn unavailable(&self, reason: impl Into<String>) -> Error {
        Error::ControlPlaneUnavailable {
            socket: self.socket.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl IsolationApi for DockerEngine {
    fn backend_name(&self) -> &'static str {
        "docker"
    }

    async fn ping(&self) -> Result<()> {
        if !self.socket.exists() {
            return Err(self.unavailable("socket does not exist"));
        }
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| self.unavailable(e.to_string()))
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if daemon_status(&e) == Some(404) => Ok(false),
            Err(e) => Err(Error::isolation("inspect image", e.to_string())),
        }
    }

    async fn pull_image(&self, image: &str, progress: Option<PullProgress<'_>>) -> Result<()> {
        let failed = |message: String| Error::ImageResolution {
            image: image.to_string(),
            message,
        };
        let mut updates = pin!(
            self.docker
                .create_image(Some(pull_options(image)), None, None)
        );
        while let Some(info) = updates.try_next().await.map_err(|e| failed(e.to_string()))? {
            match pull_line(&info) {
                Some(PullLine::Failed(message)) => return Err(failed(message)),
                Some(PullLine::Progress(text)) => {
                    debug!(image, progress = %text, "pull progress");
                    if let Some(report) = progress {
                        report(&text);
                    }
                },
                None => {},
            }
        }
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let created = self
            .docker
            .create_container(None::<CreateContainerOptions>, container_body(spec))
            .await
            .map_err(|e| Error::isolation("create", e.to_string()))?;
        Ok(created.id)
    }

    async fn attach(&self, id: &str) -> Result<OutputStream> {
        let path = container_path(id, "attach", &[("stream", "1"), ("stdout", "1"), ("stderr", "1")]);
        let request = Request::builder()
            .method(Method::POST)
            .uri(hyper::Uri::from(UnixUri::new(&self.socket, &path)))
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "tcp")
            .body(Full::new(Bytes::new()))
            .map_err(|e| Error::isolation("attach", e.to_string()))?;

        debug!(container = %id, "attaching");
        let response = self.client.request(request).await.map_err(|e| {
            if e.is_connect() {
                self.unavailable(e.to_string())
            } else {
                Error::isolation("attach", e.to_string())
            }
        })?;
        match response.status() {
            StatusCode::SWITCHING_PROTOCOLS => {
                let upgraded = hyper::upgrade::on(response)
                    .await
                    .map_err(|e| Error::isolation("attach", e.to_string()))?;
                Ok(Box::pin(ReaderStream::new(TokioIo::new(upgraded))))
            },
            status if status.is_success() => Ok(Box::pin(
                response.into_body().into_data_stream().map_err(std::io::Error::other),
            )),
            status => {
                let body = response
                    .into_body()
                    .collect()
                    .await
                    .map(|c| c.to_bytes())
                    .unwrap_or_default();
                Err(Error::isolation(
                    "attach",
                    format!("{status}: {}", String::from_utf8_lossy(&body).trim()),
                ))
            },
        }
    }

    async fn arm_wait(&self, id: &str) -> Result<ExitFuture> {
        let waiter = tokio::spawn(next_exit(self.docker.clone(), id.to_string()));
        // Let the wait request go out before the caller starts the container.
        tokio::task::yield_now().await;
        Ok(Box::pin(async move {
            waiter
                .await
                .map_err(|e| Error::isolation("wait", e.to_string()))?
        }))
    }

    async fn start(&self, id: &str) -> Result<()> {
        let outcome = self
            .docker
            .start_container(id, None::<StartContainerOptions>)
            .await;
        tolerating("start", outcome, &[304])
    }

    async fn kill(&self, id: &str) -> Result<()> {
        let outcome = self
            .docker
            .kill_container(id, None::<KillContainerOptions>)
            .await;
        tolerating("kill", outcome, &[404, 409])
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptionsBuilder::new().force(true).build();
        let outcome = self.docker.remove_container(id, Some(options)).await;
        tolerating("remove", outcome, &[404, 409])
    }
}
