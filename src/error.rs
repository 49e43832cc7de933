//! Error types for the rover control core.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RoverError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config: {0}")]
    Config(String),

    #[error("serial device unavailable: {0}")]
    SerialUnavailable(String),

    #[error("NMEA: {0}")]
    Nmea(String),

    #[error("NTRIP authentication rejected: {0}")]
    NtripAuth(String),

    #[error("NTRIP connection: {0}")]
    NtripConnection(String),

    #[error("NTRIP timeout")]
    NtripTimeout,

    #[error("GPS unhealthy: {0}")]
    GpsUnhealthy(String),

    #[error("position data stale")]
    StalePosition,

    #[error("navigation: {0}")]
    Navigation(String),

    #[error("motor watchdog timeout")]
    WatchdogTimeout,

    #[error("motor driver: {0}")]
    MotorDriver(String),

    #[error("task join: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, RoverError>;
