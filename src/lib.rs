#![doc = include_str!("../Readme.md")]

pub mod app;
pub mod asset;
pub mod chain;
pub mod config;
pub mod database;
pub mod deal;
pub mod decimal;
pub mod engine;
pub mod gas_reimbursement;
pub mod queue;
pub mod shutdown;
pub mod task_monitor;
pub mod utils;

pub use crate::app::App;
pub use crate::chain::{AdapterRegistry, ChainAdapter};
pub use crate::config::Config;
pub use crate::engine::Engine;
