//! Scripted in-memory [`IsolationApi`] for unit tests.

use std::{
    io,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    bytes::Bytes,
    futures::{StreamExt, stream},
    tokio::sync::watch,
};

use crate::{
    demux::{StreamKind, encode_frame},
    error::{Error, Result},
    isolation::{ContainerSpec, ExitFuture, IsolationApi, OutputStream, PullProgress},
};

/// What the fake container does once started.
#[derive(Debug, Clone)]
pub struct MockOutcome {
    pub frames: Vec<(StreamKind, Vec<u8>)>,
    /// `None` keeps the container running until it is killed.
    pub exit: Option<i64>,
    /// Raw stream chunk size; frames are split across chunks.
    pub chunk_size: usize,
    /// Keep the output stream open even after a kill.
    pub ignore_kill: bool,
}

impl MockOutcome {
    pub fn exit(code: i64) -> Self {
        Self {
            frames: Vec::new(),
            exit: Some(code),
            chunk_size: 5,
            ignore_kill: false,
        }
    }

    pub fn hang() -> Self {
        Self {
            exit: None,
            ..Self::exit(0)
        }
    }

    pub fn stdout(mut self, bytes: &[u8]) -> Self {
        self.frames.push((StreamKind::Stdout, bytes.to_vec()));
        self
    }

    pub fn stderr(mut self, bytes: &[u8]) -> Self {
        self.frames.push((StreamKind::Stderr, bytes.to_vec()));
        self
    }
}

pub struct MockIsolation {
    outcome: MockOutcome,
    image_present: AtomicBool,
    ping_error: Mutex<Option<String>>,
    pull_error: Mutex<Option<String>>,
    pull_delay: Mutex<Option<Duration>>,
    failing_operation: Mutex<Option<&'static str>>,
    stopped: watch::Sender<bool>,
    pub last_spec: Mutex<Option<ContainerSpec>>,
    pub pings: AtomicUsize,
    pub pulls: AtomicUsize,
    pub creates: AtomicUsize,
    pub attaches: AtomicUsize,
    pub waits: AtomicUsize,
    pub starts: AtomicUsize,
    pub kills: AtomicUsize,
    pub removes: AtomicUsize,
}

impl MockIsolation {
    pub fn new(outcome: MockOutcome) -> Self {
        let (stopped, _) = watch::channel(false);
        Self {
            outcome,
            image_present: AtomicBool::new(false),
            ping_error: Mutex::new(None),
            pull_error: Mutex::new(None),
            pull_delay: Mutex::new(None),
            failing_operation: Mutex::new(None),
            stopped,
            last_spec: Mutex::new(None),
            pings: AtomicUsize::new(0),
            pulls: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
            attaches: AtomicUsize::new(0),
            waits: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
            kills: AtomicUsize::new(0),
            removes: AtomicUsize::new(0),
        }
    }

    pub fn set_image_present(&self, present: bool) {
        self.image_present.store(present, Ordering::SeqCst);
    }

    pub fn fail_ping(&self, reason: &str) {
        *lock(&self.ping_error) = Some(reason.to_string());
    }

    pub fn fail_pull(&self, message: &str) {
        *lock(&self.pull_error) = Some(message.to_string());
    }

    /// Make every pull take `delay` before it reports anything.
    pub fn delay_pull(&self, delay: Duration) {
        *lock(&self.pull_delay) = Some(delay);
    }

    /// Make `create`, `attach`, `wait` or `start` fail.
    pub fn fail_on(&self, operation: &'static str) {
        *lock(&self.failing_operation) = Some(operation);
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        match *lock(&self.failing_operation) {
            Some(op) if op == operation => Err(Error::isolation(operation, "mock failure")),
            _ => Ok(()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl IsolationApi for MockIsolation {
    fn backend_name(&self) -> &'static str {
        "mock"
    }

    async fn ping(&self) -> Result<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        match lock(&self.ping_error).clone() {
            Some(reason) => Err(Error::ControlPlaneUnavailable {
                socket: "/nonexistent/mock.sock".into(),
                reason,
            }),
            None => Ok(()),
        }
    }

    async fn image_exists(&self, _image: &str) -> Result<bool> {
        Ok(self.image_present.load(Ordering::SeqCst))
    }

    async fn pull_image(&self, image: &str, progress: Option<PullProgress<'_>>) -> Result<()> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.pull_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = lock(&self.pull_error).clone() {
            return Err(Error::ImageResolution {
                image: image.to_string(),
                message,
            });
        }
        if let Some(progress) = progress {
            progress(&format!("{image}: Pull complete"));
        }
        self.set_image_present(true);
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.check("create")?;
        *lock(&self.last_spec) = Some(spec.clone());
        Ok("mock-container".into())
    }

    async fn attach(&self, _id: &str) -> Result<OutputStream> {
        self.attaches.fetch_add(1, Ordering::SeqCst);
        self.check("attach")?;
        let raw: Vec<u8> = self
            .outcome
            .frames
            .iter()
            .flat_map(|(kind, payload)| encode_frame(*kind, payload))
            .collect();
        let chunks: Vec<io::Result<Bytes>> = raw
            .chunks(self.outcome.chunk_size.max(1))
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();

        let linger = self.outcome.exit.is_none();
        let mut stopped = self.stopped.subscribe();
        let tail = stream::once(async move {
            if linger {
                let _ = stopped.wait_for(|s| *s).await;
            }
        })
        .filter_map(|()| async { None::<io::Result<Bytes>> });
        Ok(Box::pin(stream::iter(chunks).chain(tail)))
    }

    async fn arm_wait(&self, _id: &str) -> Result<ExitFuture> {
        self.waits.fetch_add(1, Ordering::SeqCst);
        self.check("wait")?;
        let exit = self.outcome.exit;
        let mut stopped = self.stopped.subscribe();
        Ok(Box::pin(async move {
            match exit {
                Some(code) => Ok(code),
                None => {
                    let _ = stopped.wait_for(|s| *s).await;
                    Ok(137)
                },
            }
        }))
    }

    async fn start(&self, _id: &str) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.check("start")
    }

    async fn kill(&self, _id: &str) -> Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        if !self.outcome.ignore_kill {
            self.stopped.send_replace(true);
        }
        Ok(())
    }

    async fn remove(&self, _id: &str) -> Result<()> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
