use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForkparseError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Spawn error: {0}")]
    Spawn(#[from] SpawnError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("Failed to launch worker process: {0}")]
    LaunchFailed(String),

    #[error("Worker process died during startup with status {0}")]
    ProcessDiedDuringStartup(std::process::ExitStatus),

    #[error("Worker did not publish its ports within {0:?}")]
    StartupTimeout(Duration),
}

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Pool exhausted")]
    Exhausted,

    #[error("Pool is closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Parse did not complete within {0:?}")]
    Timeout(Duration),

    #[error("Worker crashed: {0}")]
    WorkerCrash(String),
}

pub type Result<T> = std::result::Result<T, ForkparseError>;
