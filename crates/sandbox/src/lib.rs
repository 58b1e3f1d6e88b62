//! Sandboxed execution engine.
//!
//! Runs a user shell script in a fresh, resource-bounded container, optionally
//! after mounting an NFS or SMB/CIFS share inside it. Mount failures never
//! stop the script; the script runs as an unprivileged account unless the
//! request keeps root. A direct host runner covers hosts without a daemon.

pub mod compose;
pub mod demux;
pub mod direct;
pub mod docker;
pub mod engine;
pub mod error;
pub mod events;
pub mod identity;
pub mod image;
pub mod isolation;
pub mod mount;
pub mod request;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

pub use {
    compose::{ComposedScript, ComposerPolicy, ScriptComposer, Stage, StageKind},
    direct::{DirectOptions, DirectRunner},
    docker::DockerEngine,
    engine::{EngineSettings, SandboxEngine},
    error::{Error, Result},
    events::EngineEvent,
    identity::IdentityPolicy,
    isolation::{IsolationApi, SandboxConstraints},
    request::{
        ActionInput, Credentials, ExecutionRequest, ExecutionResult, MountKind, MountSpec,
        PrivilegeMode, RequestDefaults,
    },
};
