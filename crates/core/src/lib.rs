pub mod error;
pub mod key;
pub mod play;
pub mod types;
