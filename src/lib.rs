// Library entry point for the marketplace core
// This exposes modules for testing while keeping main.rs as the binary entry point

pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;

use std::sync::Arc;

use config::Config;
use db::Database;
use services::{Notifier, PaymentGateway};

/// Application state shared across all handlers
pub struct AppState {
    pub db: Database,
    pub gateway: Arc<dyn PaymentGateway>,
    pub notifier: Notifier,
    pub config: Config,
}
