use std::sync::Arc;

use tokio::time::{self, MissedTickBehavior};
use tracing::error;

use crate::app::App;
use crate::database::methods::DbMethods as _;
use crate::deal::{machine, Severity};
use crate::queue::confirmations;
use crate::task_monitor::TaskMonitor;

/// The periodic deal driver: advances every active deal through its stage
/// machine, then refreshes confirmations of everything SUBMITTED.
///
/// The interval doubles as the reentrancy guard: a pass that overruns its
/// period makes the timer skip the missed ticks instead of stacking them.
pub async fn tick_deals(app: Arc<App>) -> anyhow::Result<()> {
    tracing::info!("Starting deal tick driver.");

    let mut timer = time::interval(app.config.app.tick_interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        timer.tick().await;

        let deal_ids = app.database.get_active_deal_ids().await?;
        TaskMonitor::log_active_deals(deal_ids.len());

        // One deal's failure must not stall the others.
        for deal_id in &deal_ids {
            if let Err(error) = machine::tick_deal(&app, deal_id).await {
                error!(%deal_id, ?error, "deal tick failed");
                app.database
                    .add_deal_event(
                        deal_id,
                        Severity::Warning,
                        None,
                        &format!("tick failed: {error:#}"),
                    )
                    .await
                    .ok();
            }
        }

        if let Err(error) = confirmations::monitor_submitted(&app).await {
            error!(?error, "confirmation monitor failed");
        }

        TaskMonitor::log_queue_depth(&app.database).await.ok();
    }
}
