//! Input validation errors

use thiserror::Error;

/// Rejection of viewer-supplied input before any stream is opened
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("monitorId parameter is required")]
    MissingMonitorId,

    #[error("Invalid monitorId")]
    InvalidMonitorId(String),
}

impl ValidationError {
    /// The raw input that failed validation, if any
    pub fn input(&self) -> Option<&str> {
        match self {
            Self::MissingMonitorId => None,
            Self::InvalidMonitorId(raw) => Some(raw),
        }
    }
}
