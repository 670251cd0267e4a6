//! Image presence cache.
//!
//! [`ImageCache::ensure`] guarantees an image is present locally. Each
//! distinct [`ImageRef`] gets its own once-cell, so concurrent callers for
//! the same image share one pull while unrelated images never wait on
//! each other. A failed pull leaves the cell empty and the next caller
//! tries again.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use container_engine_interface::ContainerEngine;
use harness_shared_types::{EngineError, ImageRef, JobError};

use crate::config::PullPolicy;

/// Process-lifetime set of images known to be present.
pub struct ImageCache {
    engine: Arc<dyn ContainerEngine>,
    policy: PullPolicy,
    entries: Mutex<HashMap<ImageRef, Arc<OnceCell<()>>>>,
}

impl ImageCache {
    pub fn new(engine: Arc<dyn ContainerEngine>, policy: PullPolicy) -> Self {
        Self {
            engine,
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Make sure `image` is present locally, pulling it if the policy allows.
    pub async fn ensure(&self, image: &ImageRef) -> Result<(), JobError> {
        let cell = {
            let mut entries = self.entries.lock().await;
            entries.entry(image.clone()).or_default().clone()
        };

        cell.get_or_try_init(|| self.resolve(image)).await?;
        Ok(())
    }

    /// Whether `image` has been resolved by this cache.
    pub async fn is_known(&self, image: &ImageRef) -> bool {
        self.entries
            .lock()
            .await
            .get(image)
            .map(|cell| cell.initialized())
            .unwrap_or(false)
    }

    async fn resolve(&self, image: &ImageRef) -> Result<(), JobError> {
        let pull_error = |source: EngineError| JobError::Pull {
            image: image.to_string(),
            source,
        };

        if self.policy != PullPolicy::Always {
            let present = self.engine.image_exists(image).await.map_err(pull_error)?;
            if present {
                debug!(image = %image, "Image already present");
                return Ok(());
            }
            if self.policy == PullPolicy::Never {
                return Err(pull_error(EngineError::NotFound(format!(
                    "{} is not present locally and pulling is disabled",
                    image
                ))));
            }
        }

        info!(image = %image, "Pulling image");
        self.engine.pull_image(image).await.map_err(pull_error)?;
        info!(image = %image, "Image pulled");
        Ok(())
    }
}

#[cfg(all(test, feature = "mock-engine"))]
mod tests {
    use super::*;
    use crate::mock::MockEngine;

    #[tokio::test]
    async fn test_present_image_is_not_pulled() {
        let engine = Arc::new(MockEngine::new());
        let image = ImageRef::new("busybox", "stable");
        engine.add_image(&image);

        let cache = ImageCache::new(engine.clone(), PullPolicy::IfMissing);
        cache.ensure(&image).await.unwrap();
        assert_eq!(engine.pull_count(&image), 0);
        assert!(cache.is_known(&image).await);
    }

    #[tokio::test]
    async fn test_missing_image_pulled_once() {
        let engine = Arc::new(MockEngine::new());
        let image = ImageRef::new("busybox", "stable");

        let cache = ImageCache::new(engine.clone(), PullPolicy::IfMissing);
        cache.ensure(&image).await.unwrap();
        cache.ensure(&image).await.unwrap();
        assert_eq!(engine.pull_count(&image), 1);
    }

    #[tokio::test]
    async fn test_always_policy_pulls_present_image_once() {
        let engine = Arc::new(MockEngine::new());
        let image = ImageRef::new("busybox", "stable");
        engine.add_image(&image);

        let cache = ImageCache::new(engine.clone(), PullPolicy::Always);
        cache.ensure(&image).await.unwrap();
        cache.ensure(&image).await.unwrap();
        assert_eq!(engine.pull_count(&image), 1);
    }

    #[tokio::test]
    async fn test_never_policy_fails_on_missing_image() {
        let engine = Arc::new(MockEngine::new());
        let image = ImageRef::new("busybox", "stable");

        let cache = ImageCache::new(engine.clone(), PullPolicy::Never);
        let err = cache.ensure(&image).await.unwrap_err();
        assert!(matches!(err, JobError::Pull { .. }));
        assert_eq!(engine.pull_count(&image), 0);
    }

    #[tokio::test]
    async fn test_failed_pull_is_retried_by_next_caller() {
        let engine = Arc::new(MockEngine::new());
        let image = ImageRef::new("unknown/repo", "v1");
        engine.add_unknown_repository("unknown/repo");

        let cache = ImageCache::new(engine.clone(), PullPolicy::IfMissing);
        assert!(matches!(cache.ensure(&image).await, Err(JobError::Pull { .. })));
        assert!(!cache.is_known(&image).await);
        assert!(cache.ensure(&image).await.is_err());
        assert_eq!(engine.pull_count(&image), 2);
    }
}
