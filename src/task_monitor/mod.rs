use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use once_cell::sync::Lazy;
use prometheus::{register_gauge, Gauge};
use tokio::select;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::app::App;
use crate::database::methods::DbMethods as _;
use crate::database::Database;
use crate::shutdown::Shutdown;

pub mod tasks;

const TICK_DEALS_BACKOFF: Duration = Duration::from_secs(5);
const PROCESS_QUEUE_BACKOFF: Duration = Duration::from_secs(5);
const LATE_DEPOSITS_BACKOFF: Duration = Duration::from_secs(5);

static ACTIVE_DEALS: Lazy<Gauge> =
    Lazy::new(|| register_gauge!("active_deals", "Deals not yet closed").unwrap());

static PENDING_QUEUE_ITEMS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("pending_queue_items", "Queue items awaiting submission").unwrap()
});

static SUBMITTED_QUEUE_ITEMS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "submitted_queue_items",
        "Queue items awaiting confirmation"
    )
    .unwrap()
});

/// A task manager for all long running tasks
///
/// It's assumed that there is only one instance at a time.
/// Spawning multiple `TaskMonitors` will result in undefined behavior,
/// including nonce duplication.
pub struct TaskMonitor;

impl TaskMonitor {
    /// Initialize and run the task monitor
    pub fn init(main_app: Arc<App>, shutdown: Shutdown) {
        let handles = FuturesUnordered::new();

        // Deal tick driver
        let app = main_app.clone();
        let tick_deals = move || tasks::tick_deals::tick_deals(app.clone());
        let tick_deals_handle = crate::utils::spawn_with_backoff_cancel_on_shutdown(
            tick_deals,
            TICK_DEALS_BACKOFF,
            shutdown.clone(),
        );
        handles.push(tick_deals_handle);

        // Queue processor. Allowed to finish its pass on shutdown so a
        // broadcast is never cut off between send and record.
        let app = main_app.clone();
        let process_queue = move || tasks::process_queue::process_queue(app.clone());
        let process_queue_handle = crate::utils::spawn_with_backoff(
            process_queue,
            PROCESS_QUEUE_BACKOFF,
            shutdown.clone(),
        );
        handles.push(process_queue_handle);

        // Late-deposit watcher over settled deals
        let app = main_app.clone();
        let watch_late = move || tasks::watch_late_deposits::watch_late_deposits(app.clone());
        let watch_late_handle = crate::utils::spawn_with_backoff_cancel_on_shutdown(
            watch_late,
            LATE_DEPOSITS_BACKOFF,
            shutdown.clone(),
        );
        handles.push(watch_late_handle);

        tokio::spawn(Self::monitor_shutdown(handles, shutdown));
    }

    async fn monitor_shutdown(mut handles: FuturesUnordered<JoinHandle<()>>, shutdown: Shutdown) {
        select! {
            // Wait for the shutdown signal
            _ = shutdown.await_shutdown_begin() => {
             }
            // Or wait for a task to panic
            _ = Self::await_task_panic(&mut handles, shutdown.clone()) => {}
        };
    }

    async fn await_task_panic(handles: &mut FuturesUnordered<JoinHandle<()>>, shutdown: Shutdown) {
        while let Some(result) = handles.next().await {
            if !shutdown.is_shutting_down() {
                match result {
                    Ok(_) => {
                        info!("task exited");
                    }
                    Err(error) => {
                        error!(?error, "task panicked");
                        // Instruct the rest of the engine to shutdown
                        shutdown.shutdown();
                        return;
                    }
                }
            }
        }
        warn!("all tasks have returned unexpectedly");
    }

    pub(crate) fn log_active_deals(count: usize) {
        #[allow(clippy::cast_precision_loss)]
        ACTIVE_DEALS.set(count as f64);
    }

    pub(crate) async fn log_queue_depth(database: &Database) -> anyhow::Result<()> {
        let pending = database.count_pending_items_total().await?;
        let submitted = database.count_submitted_items_total().await?;
        #[allow(clippy::cast_precision_loss)]
        {
            PENDING_QUEUE_ITEMS.set(pending as f64);
            SUBMITTED_QUEUE_ITEMS.set(submitted as f64);
        }
        Ok(())
    }
}
