use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid pin: {0}")]
    InvalidPin(i32),

    #[error("Invalid command: {0}")]
    InvalidCommand(i32),

    #[error("GPIO error: {0}")]
    Gpio(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Errors the remote peer caused, answered in-band instead of logged loudly
    pub fn is_request_error(&self) -> bool {
        matches!(self, Self::InvalidPin(_) | Self::InvalidCommand(_))
    }
}

impl From<gpio_cdev::Error> for AppError {
    fn from(e: gpio_cdev::Error) -> Self {
        Self::Gpio(e.to_string())
    }
}

impl From<nix::Error> for AppError {
    fn from(e: nix::Error) -> Self {
        Self::Io(std::io::Error::from(e))
    }
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_errors() {
        assert!(AppError::InvalidPin(60).is_request_error());
        assert!(AppError::InvalidCommand(9).is_request_error());
        assert!(!AppError::Gpio("mmap failed".into()).is_request_error());
        assert!(!AppError::Protocol("short read".into()).is_request_error());
    }

    #[test]
    fn test_display() {
        assert_eq!(AppError::InvalidPin(-1).to_string(), "Invalid pin: -1");
        let io: AppError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert_eq!(io.to_string(), "IO error: boom");
    }
}
