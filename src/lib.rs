pub mod amount;
pub mod chains;
pub mod classifier;
pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod monitor;
pub mod notifier;
pub mod state;
pub mod telegram;
