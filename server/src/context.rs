use crate::backend::FleetBackend;
use crate::cleanup::CleanupCoordinator;
use crate::config::ServerConfig;
use crate::registry::FleetRegistry;
use std::sync::Arc;

/// Everything a session, the control surface and the monitor share.
pub struct ServerContext {
    pub config: ServerConfig,
    pub registry: Arc<FleetRegistry>,
    pub backend: Arc<dyn FleetBackend>,
    pub cleanup: CleanupCoordinator,
}

impl ServerContext {
    pub fn new(config: ServerConfig, backend: Arc<dyn FleetBackend>) -> Arc<Self> {
        let registry = Arc::new(FleetRegistry::new());
        let cleanup = CleanupCoordinator::new(Arc::clone(&registry), Arc::clone(&backend), &config);

        Arc::new(Self {
            config,
            registry,
            backend,
            cleanup,
        })
    }
}
