pub mod error;
pub mod routes;
pub mod runner;
pub mod scheduler;
pub mod state;
