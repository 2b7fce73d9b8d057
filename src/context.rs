use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::DiscBackend;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub backend: Arc<dyn DiscBackend>,
}

impl AppContext {
    pub fn new(config: AppConfig, backend: Arc<dyn DiscBackend>) -> Self {
        Self {
            config: Arc::new(config),
            backend,
        }
    }
}
