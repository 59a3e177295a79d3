use std::sync::Arc;

use sqlx::SqlitePool;

use crate::scheduler::Scheduler;
use vodsync_spider::client::SpiderClient;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub spider: Arc<SpiderClient>,
    pub scheduler: Arc<Scheduler>,
}
