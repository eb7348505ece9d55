use std::sync::Arc;

use tracing::{instrument, warn};

use crate::asset::AssetRegistry;
use crate::chain::AdapterRegistry;
use crate::config::Config;
use crate::database::Database;

/// The shared application state both drivers operate on. There is no
/// in-memory coupling between them beyond this: the database is the only
/// shared mutable state.
pub struct App {
    pub config: Config,
    pub database: Arc<Database>,
    pub chains: AdapterRegistry,
    pub assets: AssetRegistry,
}

impl App {
    /// # Errors
    ///
    /// Will return `Err` if the asset configuration is inconsistent or the
    /// database is unreachable or out of date.
    #[instrument(name = "App::new", level = "debug", skip_all)]
    pub async fn new(config: Config, chains: AdapterRegistry) -> anyhow::Result<Arc<Self>> {
        let assets = AssetRegistry::from_config(&config)?;

        for chain_id in config.chains.keys() {
            if !chains.contains(chain_id) {
                warn!(%chain_id, "configured chain has no registered adapter");
            }
        }

        let database = Arc::new(Database::new(&config.database).await?);

        Ok(Arc::new(Self {
            config,
            database,
            chains,
            assets,
        }))
    }
}
