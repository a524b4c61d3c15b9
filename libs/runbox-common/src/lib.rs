pub mod config;
pub mod logging;
pub mod redis;
pub mod types;
