use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::sandbox::backend::ContainerBackend;
use crate::sandbox::error::{Result, SandboxError};

/// Makes sure the images sandboxes run on are present locally
pub struct ImageManager {
    backend: Arc<dyn ContainerBackend>,
    base_image: String,
    ready: RwLock<HashSet<String>>,
    pull_lock: Mutex<()>,
}

impl ImageManager {
    pub fn new(backend: Arc<dyn ContainerBackend>, base_image: String) -> Self {
        Self {
            backend,
            base_image,
            ready: RwLock::new(HashSet::new()),
            pull_lock: Mutex::new(()),
        }
    }

    pub fn base_image(&self) -> &str {
        &self.base_image
    }

    pub async fn pull_base_image_if_missing(&self) -> Result<()> {
        self.ensure_image(&self.base_image).await
    }

    /// Check the exact reference and pull it when it is definitely absent.
    ///
    /// Inspection errors other than "not found" are returned as-is and never
    /// trigger a pull.
    pub async fn ensure_image(&self, reference: &str) -> Result<()> {
        if self.ready.read().await.contains(reference) {
            return Ok(());
        }

        let _guard = self.pull_lock.lock().await;
        if self.ready.read().await.contains(reference) {
            return Ok(());
        }

        let exists = self.backend.image_exists(reference).await.map_err(|e| match e {
            SandboxError::ImageInspectionFailed { .. } => e,
            other => SandboxError::ImageInspectionFailed {
                image: reference.to_string(),
                reason: other.to_string(),
            },
        })?;

        if exists {
            debug!("📦 Image {reference} already present");
        } else {
            info!("📦 Pulling image {reference}");
            self.backend.pull_image(reference).await.map_err(|e| {
                error!("📦 Failed to pull image {reference}: {e}");
                match e {
                    SandboxError::ImagePullFailed { .. } => e,
                    other => SandboxError::ImagePullFailed {
                        image: reference.to_string(),
                        reason: other.to_string(),
                    },
                }
            })?;
            info!("📦 Pulled image {reference}");
        }

        self.ready.write().await.insert(reference.to_string());
        Ok(())
    }

    /// Forget cached readiness so the next check hits the backend again
    pub async fn invalidate(&self) {
        self.ready.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::FakeSandboxRuntime;

    const IMAGE: &str = "archestra/mcp-server-sandbox:latest";

    #[tokio::test]
    async fn test_present_image_is_not_pulled() {
        let runtime = FakeSandboxRuntime::new();
        runtime.add_image(IMAGE);
        let images = ImageManager::new(runtime.clone(), IMAGE.to_string());

        images.pull_base_image_if_missing().await.unwrap();
        assert_eq!(runtime.pull_count(IMAGE), 0);
    }

    #[tokio::test]
    async fn test_missing_image_is_pulled_once() {
        let runtime = FakeSandboxRuntime::new();
        let images = ImageManager::new(runtime.clone(), IMAGE.to_string());

        images.pull_base_image_if_missing().await.unwrap();
        images.pull_base_image_if_missing().await.unwrap();
        assert_eq!(runtime.pull_count(IMAGE), 1);
    }

    #[tokio::test]
    async fn test_inspection_error_is_not_treated_as_missing() {
        let runtime = FakeSandboxRuntime::new();
        runtime.fail_image_inspection(IMAGE);
        let images = ImageManager::new(runtime.clone(), IMAGE.to_string());

        let err = images.pull_base_image_if_missing().await.unwrap_err();
        assert!(matches!(err, SandboxError::ImageInspectionFailed { .. }));
        assert_eq!(runtime.pull_count(IMAGE), 0);
    }

    #[tokio::test]
    async fn test_pull_failure() {
        let runtime = FakeSandboxRuntime::new();
        runtime.fail_image_pull(IMAGE);
        let images = ImageManager::new(runtime.clone(), IMAGE.to_string());

        let err = images.ensure_image(IMAGE).await.unwrap_err();
        assert!(matches!(err, SandboxError::ImagePullFailed { .. }));
    }
}
