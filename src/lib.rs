pub mod client;
pub mod config;
pub mod error;
pub mod metadata;
pub mod pool;
pub mod process;
pub mod protocol;
pub mod reaper;
pub mod runner;
pub mod schedule;
pub mod server;
