//! Make sure a base image is present locally before a sandbox is created.

use std::sync::Arc;

use tracing::{debug, info};

use crate::{
    error::{Error, Result},
    isolation::{IsolationApi, PullProgress},
};

/// Split an image reference into repository and tag.
///
/// A missing tag means `latest`. Digest references are returned whole with no
/// tag. A colon inside the registry host (`host:5000/repo`) is not a tag.
pub fn split_reference(image: &str) -> (&str, Option<&str>) {
    if image.contains('@') {
        return (image, None);
    }
    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    match image[name_start..].rfind(':') {
        Some(i) => {
            let split = name_start + i;
            (&image[..split], Some(&image[split + 1..]))
        },
        None => (image, Some("latest")),
    }
}

/// Inspect-then-pull resolution against the daemon's local cache.
pub struct ImageResolver {
    api: Arc<dyn IsolationApi>,
}

impl ImageResolver {
    pub fn new(api: Arc<dyn IsolationApi>) -> Self {
        Self { api }
    }

    /// Return once `image` is available locally, reporting whether it had to
    /// be pulled. Any failure is an [`Error::ImageResolution`].
    pub async fn ensure(&self, image: &str, progress: Option<PullProgress<'_>>) -> Result<bool> {
        let exists = self
            .api
            .image_exists(image)
            .await
            .map_err(|e| resolution_error(image, e))?;
        if exists {
            debug!(image, "image present locally");
            return Ok(false);
        }

        info!(image, backend = self.api.backend_name(), "pulling image");
        self.api
            .pull_image(image, progress)
            .await
            .map_err(|e| resolution_error(image, e))?;
        info!(image, "image pulled");
        Ok(true)
    }
}

fn resolution_error(image: &str, err: Error) -> Error {
    match err {
        Error::ControlPlaneUnavailable { .. } | Error::ImageResolution { .. } => err,
        other => Error::ImageResolution {
            image: image.to_string(),
            message: other.to_string(),
        },
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::testing::{MockIsolation, MockOutcome},
        rstest::rstest,
        std::sync::{Mutex, atomic::Ordering},
    };

    #[rstest]
    #[case("ubuntu", "ubuntu", Some("latest"))]
    #[case("ubuntu:22.04", "ubuntu", Some("22.04"))]
    #[case("library/alpine:3.20", "library/alpine", Some("3.20"))]
    #[case("registry.local:5000/tools/runner", "registry.local:5000/tools/runner", Some("latest"))]
    #[case("registry.local:5000/tools/runner:v2", "registry.local:5000/tools/runner", Some("v2"))]
    #[case("alpine@sha256:abcd", "alpine@sha256:abcd", None)]
    fn splits_references(#[case] image: &str, #[case] repo: &str, #[case] tag: Option<&str>) {
        assert_eq!(split_reference(image), (repo, tag));
    }

    #[tokio::test]
    async fn present_image_is_not_pulled() {
        let mock = Arc::new(MockIsolation::new(MockOutcome::exit(0)));
        mock.set_image_present(true);
        let pulled = ImageResolver::new(mock.clone())
            .ensure("ubuntu:latest", None)
            .await
            .unwrap();
        assert!(!pulled);
        assert_eq!(mock.pulls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_image_is_pulled_with_progress() {
        let mock = Arc::new(MockIsolation::new(MockOutcome::exit(0)));
        let lines = Mutex::new(Vec::new());
        let record: PullProgress<'_> = &|line: &str| lines.lock().unwrap().push(line.to_string());
        let pulled = ImageResolver::new(mock.clone())
            .ensure("alpine:3.20", Some(record))
            .await
            .unwrap();
        assert!(pulled);
        assert_eq!(mock.pulls.load(Ordering::SeqCst), 1);
        assert_eq!(*lines.lock().unwrap(), vec!["alpine:3.20: Pull complete".to_string()]);
    }

    #[tokio::test]
    async fn pull_failure_is_an_image_resolution_error() {
        let mock = Arc::new(MockIsolation::new(MockOutcome::exit(0)));
        mock.fail_pull("manifest unknown");
        let err = ImageResolver::new(mock.clone())
            .ensure("nope:missing", None)
            .await
            .unwrap_err();
        match err {
            Error::ImageResolution { image, message } => {
                assert_eq!(image, "nope:missing");
                assert!(message.contains("manifest unknown"));
            },
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(mock.creates.load(Ordering::SeqCst), 0);
    }
}
