use prometheus::Registry;
use std::sync::Arc;
use std::time::Instant;

use crate::config::AppConfig;
use crate::outbox::PostCommitRunner;
use crate::services::Collaborators;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub services: Collaborators,
    pub config: Arc<AppConfig>,
    pub started_at: Instant,
    pub registry: Registry,
    pub post_commit: PostCommitRunner,
}

impl AppState {
    pub fn new(services: Collaborators, config: AppConfig, registry: Registry) -> Self {
        Self {
            services,
            post_commit: PostCommitRunner::new(config.post_commit),
            config: Arc::new(config),
            started_at: Instant::now(),
            registry,
        }
    }
}
