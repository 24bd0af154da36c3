pub mod config;
pub mod discovery;
pub mod http;
pub mod metrics;
pub mod supervisor;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("docker error: {0}")]
    DockerError(#[from] bollard::errors::Error),

    #[error("reconcile error: {0}")]
    ReconcileError(#[from] fusis_nat::Error),

    #[error("invalid docker endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("{0}")]
    InvalidConfig(String),

    #[error("agent is already running")]
    AlreadyRunning,

    #[error("task failed: {0}")]
    Task(String),
}

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::IoError(_) => "io".into(),
            Error::DockerError(_) => "docker".into(),
            Error::ReconcileError(e) => e.metric_label(),
            Error::InvalidEndpoint(_) | Error::InvalidConfig(_) => "config".into(),
            Error::AlreadyRunning => "already_running".into(),
            Error::Task(_) => "task".into(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
