use serde::Serialize;

/// Lifecycle notifications published while a request runs.
///
/// Delivery is best effort: with no subscriber, events are dropped.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// One line of image pull progress.
    PullProgress { image: String, line: String },
    /// The image was pulled.
    ImagePulled { image: String },
    ContainerCreated { id: String },
    ContainerStarted { id: String },
    /// The deadline passed and a kill was issued.
    TimedOut { id: String },
    /// The container stopped on its own.
    Exited { id: String, exit_code: i64 },
    /// The container was removed, or was already gone.
    Removed { id: String },
}

pub type EventSender = tokio::sync::broadcast::Sender<EngineEvent>;

pub(crate) fn emit(sender: Option<&EventSender>, event: EngineEvent) {
    if let Some(tx) = sender {
        let _ = tx.send(event);
    }
}
