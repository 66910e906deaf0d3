pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod models;
pub mod routes;

use std::sync::Arc;

use auth::tokens::CredentialResolver;
use config::Config;
use db::repository::Repository;
use gateway::backplane::Backplane;
use gateway::hub::Gateway;
use gateway::notify::NotificationDispatcher;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repository>,
    pub resolver: Arc<dyn CredentialResolver>,
    pub config: Arc<Config>,
    pub gateway: Arc<Gateway>,
    pub notifier: Arc<NotificationDispatcher>,
}

impl AppState {
    /// Wire the gateway and dispatcher over the given collaborators.
    ///
    /// The backplane listener is not started here; call
    /// [`Gateway::spawn_backplane_listener`] once the runtime is up.
    pub fn new(
        config: Config,
        repo: Arc<dyn Repository>,
        resolver: Arc<dyn CredentialResolver>,
        backplane: Arc<dyn Backplane>,
    ) -> Self {
        let gateway = Arc::new(Gateway::new(
            &config,
            repo.clone(),
            resolver.clone(),
            backplane,
        ));
        let notifier = Arc::new(NotificationDispatcher::new(gateway.clone(), repo.clone()));
        Self {
            repo,
            resolver,
            config: Arc::new(config),
            gateway,
            notifier,
        }
    }
}
