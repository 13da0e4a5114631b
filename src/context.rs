use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::ProgressStore;

/// Shared state handed to every component instead of module globals.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub progress: ProgressStore,
    /// Cancelled on SIGINT/SIGTERM.
    pub shutdown: CancellationToken,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        Self {
            progress: ProgressStore::new(config.progress_file.clone()),
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }
}
