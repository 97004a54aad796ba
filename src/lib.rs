pub mod bridge;
pub mod bus;
pub mod config;
pub mod error;
pub mod filter;
pub mod handlers;
pub mod ids;
pub mod kv;
pub mod models;
pub mod store;

use std::sync::Arc;

use bus::EventBus;
use store::Db;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Db>,
    pub bus: Arc<EventBus>,
}
