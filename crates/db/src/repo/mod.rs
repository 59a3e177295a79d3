pub mod cache;
pub mod catalog;
pub mod health;
pub mod logs;
pub mod reports;
pub mod schedules;
pub mod sources;
pub mod tasks;
