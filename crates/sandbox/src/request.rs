//! Request and result types shared by the sandboxed and direct runners.

use std::{fmt, time::Duration};

use {
    chrono::{DateTime, Utc},
    secrecy::{ExposeSecret, SecretString},
    serde::{Deserialize, Serialize, Serializer},
};

use crate::error::{Error, Result};

/// Default mount point inside the sandbox.
pub const DEFAULT_MOUNT_POINT: &str = "/mnt/network";

/// Network filesystem flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    Nfs,
    Cifs,
}

impl MountKind {
    /// Parse the action-layer mount type. `"none"` and blank values mean no mount.
    pub fn parse(value: &str) -> Result<Option<Self>> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(None),
            "nfs" => Ok(Some(Self::Nfs)),
            "smb" | "cifs" => Ok(Some(Self::Cifs)),
            other => Err(Error::InvalidRequest(format!("unknown mount type: {other}"))),
        }
    }

    /// Filesystem type passed to `mount -t`.
    pub fn fs_type(self) -> &'static str {
        match self {
            Self::Nfs => "nfs",
            Self::Cifs => "cifs",
        }
    }
}

impl fmt::Display for MountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.fs_type())
    }
}

/// Username/password pair for SMB shares.
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::new(password.into()),
        }
    }

    pub(crate) fn password(&self) -> &str {
        self.password.expose_secret()
    }
}

impl Clone for Credentials {
    fn clone(&self) -> Self {
        Self::new(self.username.clone(), self.password().to_string())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// A network filesystem to mount before the user script runs.
#[derive(Debug, Clone)]
pub struct MountSpec {
    pub kind: MountKind,
    pub source: String,
    pub mount_point: String,
    /// Raw `-o` options; empty selects the per-kind default.
    pub options: String,
    /// Only rendered for [`MountKind::Cifs`].
    pub credentials: Option<Credentials>,
}

impl MountSpec {
    pub fn new(kind: MountKind, source: impl Into<String>) -> Self {
        Self {
            kind,
            source: source.into(),
            mount_point: DEFAULT_MOUNT_POINT.into(),
            options: String::new(),
            credentials: None,
        }
    }

    pub fn with_mount_point(mut self, mount_point: impl Into<String>) -> Self {
        self.mount_point = mount_point.into();
        self
    }

    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.options = options.into();
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

/// Whether the user script keeps root or runs as the unprivileged identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivilegeMode {
    #[default]
    DropPrivileges,
    RunAsRoot,
}

/// One invocation of the engine. Built fresh per run and never mutated.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    script: String,
    mount: Option<MountSpec>,
    image: String,
    timeout: Duration,
    privilege_mode: PrivilegeMode,
}

impl ExecutionRequest {
    pub fn builder(script: impl Into<String>) -> ExecutionRequestBuilder {
        ExecutionRequestBuilder {
            script: script.into(),
            mount: None,
            image: None,
            timeout_secs: None,
            privilege_mode: PrivilegeMode::default(),
        }
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn mount(&self) -> Option<&MountSpec> {
        self.mount.as_ref()
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn privilege_mode(&self) -> PrivilegeMode {
        self.privilege_mode
    }

    /// Copy of this request that keeps root.
    pub(crate) fn as_root(&self) -> Self {
        Self {
            privilege_mode: PrivilegeMode::RunAsRoot,
            ..self.clone()
        }
    }
}

/// Builder for [`ExecutionRequest`]; `build` validates the invariants.
#[derive(Debug, Clone)]
pub struct ExecutionRequestBuilder {
    script: String,
    mount: Option<MountSpec>,
    image: Option<String>,
    timeout_secs: Option<u64>,
    privilege_mode: PrivilegeMode,
}

impl ExecutionRequestBuilder {
    /// A mount with a blank source is dropped entirely.
    pub fn mount(mut self, mount: Option<MountSpec>) -> Self {
        self.mount = mount.filter(|m| !m.source.trim().is_empty());
        self
    }

    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn privilege_mode(mut self, mode: PrivilegeMode) -> Self {
        self.privilege_mode = mode;
        self
    }

    pub fn build(self) -> Result<ExecutionRequest> {
        let image = self
            .image
            .map(|i| i.trim().to_string())
            .ok_or_else(|| Error::InvalidRequest("image is required".into()))?;
        if image.is_empty() {
            return Err(Error::InvalidRequest("image must not be empty".into()));
        }
        let timeout_secs = self
            .timeout_secs
            .ok_or_else(|| Error::InvalidRequest("timeout is required".into()))?;
        if timeout_secs == 0 {
            return Err(Error::InvalidRequest(
                "timeout must be a positive number of seconds".into(),
            ));
        }
        Ok(ExecutionRequest {
            script: self.script,
            mount: self.mount,
            image,
            timeout: Duration::from_secs(timeout_secs),
            privilege_mode: self.privilege_mode,
        })
    }
}

/// Defaults applied when converting an [`ActionInput`].
#[derive(Debug, Clone)]
pub struct RequestDefaults {
    pub image: String,
    pub timeout_secs: u64,
    pub mount_point: String,
}

impl From<&mountbox_config::MountboxConfig> for RequestDefaults {
    fn from(cfg: &mountbox_config::MountboxConfig) -> Self {
        Self {
            image: cfg.sandbox.image.clone(),
            timeout_secs: cfg.sandbox.timeout_secs,
            mount_point: cfg.mount.mount_point.clone(),
        }
    }
}

/// The flat form submitted by the automation layer.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ActionInput {
    pub script: String,
    pub mount_type: Option<String>,
    pub mount_source: Option<String>,
    pub mount_point: Option<String>,
    pub mount_options: Option<String>,
    pub mount_username: Option<String>,
    pub mount_password: Option<SecretString>,
    pub image: Option<String>,
    pub timeout_secs: Option<u64>,
    pub run_as_root: bool,
}

impl ActionInput {
    pub fn into_request(self, defaults: &RequestDefaults) -> Result<ExecutionRequest> {
        let kind = MountKind::parse(self.mount_type.as_deref().unwrap_or("none"))?;
        let mount = match (kind, non_blank(self.mount_source)) {
            (Some(kind), Some(source)) => {
                let mut spec = MountSpec::new(kind, source)
                    .with_mount_point(
                        non_blank(self.mount_point).unwrap_or_else(|| defaults.mount_point.clone()),
                    )
                    .with_options(non_blank(self.mount_options).unwrap_or_default());
                if kind == MountKind::Cifs
                    && let Some(username) = non_blank(self.mount_username)
                {
                    let password = self
                        .mount_password
                        .map(|p| p.expose_secret().clone())
                        .unwrap_or_default();
                    spec = spec.with_credentials(Credentials::new(username, password));
                }
                Some(spec)
            },
            _ => None,
        };

        ExecutionRequest::builder(self.script)
            .mount(mount)
            .image(non_blank(self.image).unwrap_or_else(|| defaults.image.clone()))
            .timeout_secs(self.timeout_secs.unwrap_or(defaults.timeout_secs))
            .privilege_mode(if self.run_as_root {
                PrivilegeMode::RunAsRoot
            } else {
                PrivilegeMode::DropPrivileges
            })
            .build()
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Outcome of one run. Produced once, never mutated.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub succeeded: bool,
    #[serde(serialize_with = "lossy_text")]
    pub stdout: Vec<u8>,
    #[serde(serialize_with = "lossy_text")]
    pub stderr: Vec<u8>,
    pub exit_code: Option<i64>,
    pub timed_out: bool,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn completed(exit_code: i64, stdout: Vec<u8>, stderr: Vec<u8>) -> Self {
        Self {
            succeeded: exit_code == 0,
            stdout,
            stderr,
            exit_code: Some(exit_code),
            timed_out: false,
            timestamp: Utc::now(),
        }
    }

    pub fn timed_out(stdout: Vec<u8>, stderr: Vec<u8>) -> Self {
        Self {
            succeeded: false,
            stdout,
            stderr,
            exit_code: None,
            timed_out: true,
            timestamp: Utc::now(),
        }
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Stdout followed by stderr.
    pub fn combined_output(&self) -> String {
        let mut out = self.stdout_text();
        out.push_str(&self.stderr_text());
        out
    }
}

fn lossy_text<S: Serializer>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}
