//! The host-facing lifecycle surface: [`Engine::start`] and
//! [`Engine::stop`].

use std::sync::Arc;

use tracing::info;

use crate::app::App;
use crate::chain::AdapterRegistry;
use crate::config::Config;
use crate::shutdown::Shutdown;
use crate::task_monitor::TaskMonitor;

pub struct Engine {
    app: Arc<App>,
    shutdown: Shutdown,
}

impl Engine {
    /// Connect to the database, validate configuration and spawn the
    /// periodic drivers.
    pub async fn start(config: Config, chains: AdapterRegistry) -> anyhow::Result<Self> {
        let app = App::new(config, chains).await?;
        let shutdown = Shutdown::new();

        TaskMonitor::init(app.clone(), shutdown.clone());

        info!("engine started");
        Ok(Self { app, shutdown })
    }

    #[must_use]
    pub fn app(&self) -> &Arc<App> {
        &self.app
    }

    /// Begin shutdown: both drivers stop at their next schedule boundary;
    /// in-flight adapter and repository calls run to completion.
    pub fn stop(&self) {
        self.shutdown.shutdown();
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.shutdown.is_shutting_down()
    }
}
