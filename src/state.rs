//! Application state management

use std::sync::Arc;

use crate::config::Config;
use crate::upload::UploadService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    uploads: UploadService,
}

impl AppState {
    /// Create a new application state with filesystem staging
    pub fn new(config: Config) -> Self {
        let uploads = UploadService::from_config(&config.upload);
        Self::with_service(config, uploads)
    }

    /// Create a state around an already built upload service
    pub fn with_service(config: Config, uploads: UploadService) -> Self {
        Self {
            inner: Arc::new(AppStateInner { config, uploads }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the upload service
    pub fn uploads(&self) -> &UploadService {
        &self.inner.uploads
    }
}
