pub mod process_queue;
pub mod tick_deals;
pub mod watch_late_deposits;
