use std::sync::Arc;

use tokio::time::{self, MissedTickBehavior};

use crate::app::App;
use crate::queue::processor;

/// The queue driver, independent of the deal tick: drains PENDING items and
/// recovers stuck transactions on its own, faster schedule.
///
/// Passes never overlap: the loop is serial and missed ticks are skipped.
pub async fn process_queue(app: Arc<App>) -> anyhow::Result<()> {
    tracing::info!("Starting queue processor.");

    let mut timer = time::interval(app.config.app.queue_interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        timer.tick().await;

        processor::run_pass(&app).await?;
    }
}
