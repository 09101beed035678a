//! Per-run image resolution.
//!
//! Container steps run against the content ID of their image, never the
//! mutable tag. Recipes are built once per run and tags are inspected once
//! per run no matter how many tasks use them; concurrent requests for the
//! same source block until the first one finishes. A resolution that was
//! cancelled is forgotten, so the next request starts over.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use step_spec::Step;
use thiserror::Error;
use tracing::{debug, info};

use super::{DockerCli, DockerError};
use crate::process::ProcessError;
use crate::signal::CancelToken;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
    #[error("image preparation was cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

impl From<DockerError> for ImageError {
    fn from(e: DockerError) -> Self {
        match e {
            DockerError::Process(ProcessError::Cancelled { .. }) => ImageError::Cancelled,
            other => ImageError::Failed(other.to_string()),
        }
    }
}

/// Where a container step's image comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImageSource {
    Image(String),
    Recipe(String),
}

impl ImageSource {
    pub fn of(step: &Step) -> Option<Self> {
        match (&step.image, &step.dockerfile) {
            (Some(image), None) => Some(ImageSource::Image(image.trim().to_string())),
            (None, Some(recipe)) => Some(ImageSource::Recipe(recipe.clone())),
            _ => None,
        }
    }
}

type Slot = Arc<OnceLock<Result<String, ImageError>>>;

#[derive(Debug)]
pub struct ImageResolver {
    docker: DockerCli,
    resolved: Mutex<HashMap<ImageSource, Slot>>,
}

impl ImageResolver {
    pub fn new(docker: DockerCli) -> Self {
        Self {
            docker,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    pub fn docker(&self) -> &DockerCli {
        &self.docker
    }

    /// Content digest for `source`. Failures are memoized too, so a broken
    /// recipe is built once and reported for every task that uses it.
    pub fn resolve(&self, source: &ImageSource, cancel: Option<&CancelToken>) -> Result<String, ImageError> {
        loop {
            let slot = self.slot(source)?;
            let result = slot
                .get_or_init(|| {
                    let result = match source {
                        ImageSource::Image(image) => self.docker.resolve_image(image, cancel),
                        ImageSource::Recipe(recipe) => self.docker.build(recipe, cancel),
                    };
                    if let Ok(digest) = &result {
                        info!(digest = %digest, "image resolved");
                    }
                    result.map_err(ImageError::from)
                })
                .clone();

            if result != Err(ImageError::Cancelled) {
                return result;
            }
            self.forget(source, &slot);
            // another caller's cancellation; ours may still want the image
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return result;
            }
            debug!(source = ?source, "retrying image resolution cancelled elsewhere");
        }
    }

    fn slot(&self, source: &ImageSource) -> Result<Slot, ImageError> {
        let mut resolved = self
            .resolved
            .lock()
            .map_err(|_| ImageError::Failed("image resolver lock poisoned".to_string()))?;
        Ok(Arc::clone(resolved.entry(source.clone()).or_default()))
    }

    fn forget(&self, source: &ImageSource, slot: &Slot) {
        if let Ok(mut resolved) = self.resolved.lock() {
            if resolved.get(source).is_some_and(|current| Arc::ptr_eq(current, slot)) {
                resolved.remove(source);
            }
        }
    }

    /// Pin every container step to its content digest.
    pub fn pin(
        &self,
        steps: &mut [Step],
        cancel: Option<&CancelToken>,
    ) -> Result<(), (usize, ImageError)> {
        for (index, step) in steps.iter_mut().enumerate() {
            let Some(source) = ImageSource::of(step) else {
                continue;
            };
            let digest = self.resolve(&source, cancel).map_err(|e| (index, e))?;
            step.image_content_digest = Some(digest);
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::TempDir;

    /// Fake docker CLI. Builds are counted, and stall while `slow` exists.
    fn counting_docker(dir: &Path) -> (DockerCli, std::path::PathBuf) {
        let counter = dir.join("builds");
        let path = dir.join("docker");
        fs::write(
            &path,
            format!(
                "#!/bin/sh\nif [ \"$1\" = build ]; then echo x >> {}; \
                 if [ -f {} ]; then sleep 30; fi; echo sha256:built; \
                 else echo sha256:tagged; fi\n",
                counter.display(),
                dir.join("slow").display()
            ),
        )
        .unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        (DockerCli::new(path), counter)
    }

    #[test]
    fn test_recipe_built_once() {
        let temp = TempDir::new().unwrap();
        let (docker, counter) = counting_docker(temp.path());
        let resolver = Arc::new(ImageResolver::new(docker));
        let source = ImageSource::Recipe("FROM alpine:3".into());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let resolver = Arc::clone(&resolver);
                let source = source.clone();
                std::thread::spawn(move || resolver.resolve(&source, None))
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), Ok("sha256:built".to_string()));
        }
        assert_eq!(fs::read_to_string(counter).unwrap().lines().count(), 1);
    }

    #[test]
    fn test_pin_sets_digest_on_container_steps() {
        let temp = TempDir::new().unwrap();
        let (docker, _) = counting_docker(temp.path());
        let resolver = ImageResolver::new(docker);

        let mut steps = vec![
            Step::command(["true"]),
            Step::docker_image("alpine:3", ["true"]),
            Step::docker_build("FROM alpine:3", ["true"]),
        ];
        resolver.pin(&mut steps, None).unwrap();
        assert_eq!(steps[0].image_content_digest, None);
        assert_eq!(steps[1].image_content_digest.as_deref(), Some("sha256:tagged"));
        assert_eq!(steps[2].image_content_digest.as_deref(), Some("sha256:built"));
    }

    #[test]
    fn test_cancelled_build_is_not_remembered() {
        let temp = TempDir::new().unwrap();
        let (docker, _) = counting_docker(temp.path());
        let resolver = ImageResolver::new(docker);
        let source = ImageSource::Recipe("FROM alpine:3".into());

        fs::write(temp.path().join("slow"), "").unwrap();
        let token = CancelToken::new();
        let canceller = token.clone();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(300));
            canceller.cancel();
        });
        let start = std::time::Instant::now();
        assert_eq!(resolver.resolve(&source, Some(&token)), Err(ImageError::Cancelled));
        assert!(start.elapsed() < std::time::Duration::from_secs(20));

        fs::remove_file(temp.path().join("slow")).unwrap();
        assert_eq!(resolver.resolve(&source, None), Ok("sha256:built".to_string()));
    }

    #[test]
    fn test_pin_reports_cancellation() {
        let temp = TempDir::new().unwrap();
        let (docker, _) = counting_docker(temp.path());
        let resolver = ImageResolver::new(docker);
        fs::write(temp.path().join("slow"), "").unwrap();

        let token = CancelToken::new();
        token.cancel();
        let mut steps = vec![Step::command(["true"]), Step::docker_build("FROM alpine:3", ["true"])];
        let err = resolver.pin(&mut steps, Some(&token)).unwrap_err();
        assert_eq!(err, (1, ImageError::Cancelled));
        assert_eq!(steps[1].image_content_digest, None);
    }

    #[test]
    fn test_docker_failure_is_kept_as_message() {
        let err = ImageError::from(DockerError::EmptyOutput { operation: "build" });
        assert!(matches!(err, ImageError::Failed(message) if message.contains("build")));
    }
}
