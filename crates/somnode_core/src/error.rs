use somnode_types::CooldownReason;
use serde_json::Error as SerdeJsonError;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Filesystem error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization/deserialization error: {0}")]
    SerializationError(#[from] SerdeJsonError),
    #[error("Failed to spawn task '{name}': {source}")]
    TaskSpawnError { name: String, source: io::Error },
    #[error("Task '{name}' could not start its runtime: {source}")]
    TaskRuntimeError { name: String, source: io::Error },
    #[error("Task '{0}' panicked")]
    TaskPanicked(String),
}

/// How long the relay backs off after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownClass {
    Short,
    Medium,
}

/// The transient failure points of one relay attempt.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("DNS lookup failed for {host}: {source}")]
    Resolution { host: String, source: io::Error },
    #[error("Failed to allocate socket: {0}")]
    SocketAllocation(io::Error),
    #[error("Socket connect to {addr} failed: {source}")]
    Connect { addr: SocketAddr, source: io::Error },
    #[error("Socket send failed: {0}")]
    Write(io::Error),
    #[error("Socket receive failed: {0}")]
    Read(io::Error),
}

impl RelayError {
    pub fn cooldown_reason(&self) -> CooldownReason {
        match self {
            RelayError::Resolution { .. } => CooldownReason::ResolutionFailure,
            RelayError::SocketAllocation(_) | RelayError::Connect { .. } => CooldownReason::ConnectFailure,
            RelayError::Write(_) => CooldownReason::WriteFailure,
            RelayError::Read(_) => CooldownReason::ReadFailure,
        }
    }

    pub fn cooldown_class(&self) -> CooldownClass {
        match self {
            RelayError::Resolution { .. } | RelayError::SocketAllocation(_) => CooldownClass::Short,
            _ => CooldownClass::Medium,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_before_a_socket_exists_retry_quickly() {
        let err = RelayError::Resolution {
            host: "example.invalid".to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "nx"),
        };
        assert_eq!(err.cooldown_class(), CooldownClass::Short);
        assert_eq!(err.cooldown_reason(), CooldownReason::ResolutionFailure);

        let err = RelayError::SocketAllocation(io::Error::new(io::ErrorKind::Other, "emfile"));
        assert_eq!(err.cooldown_class(), CooldownClass::Short);
        assert_eq!(err.cooldown_reason(), CooldownReason::ConnectFailure);

        let err = RelayError::Connect {
            addr: "10.0.0.1:80".parse().expect("addr"),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert_eq!(err.cooldown_class(), CooldownClass::Medium);

        let err = RelayError::Read(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert_eq!(err.cooldown_class(), CooldownClass::Medium);
        assert_eq!(err.cooldown_reason(), CooldownReason::ReadFailure);
    }
}
