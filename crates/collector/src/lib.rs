pub mod dedup;
pub mod health;
pub mod orchestrator;
pub mod reconcile;
pub mod validator;

use thiserror::Error;

/// Only store failures are fatal to a collection task; everything narrower
/// (page errors, malformed items, dead sources) is counted and contained.
#[derive(Error, Debug)]
pub enum CollectError {
    #[error("store error: {0}")]
    Db(#[from] sqlx::Error),
}
