//! Error taxonomy shared by every component
//!
//! Native failures keep the OS error code and message. The other variants
//! map onto the Win32 numbering so callers see one code space on every
//! platform.

use std::io;
use std::sync::Mutex;

use serde::Serialize;

pub const ERROR_ACCESS_DENIED: i32 = 5;
pub const ERROR_INVALID_DATA: i32 = 13;
pub const ERROR_INVALID_PARAMETER: i32 = 87;
pub const ERROR_INVALID_SERVICE_CONTROL: i32 = 1052;
pub const ERROR_SERVICE_REQUEST_TIMEOUT: i32 = 1053;
pub const ERROR_SERVICE_DOES_NOT_EXIST: i32 = 1060;
pub const ERROR_SERVICE_MARKED_FOR_DELETE: i32 = 1072;
pub const ERROR_SERVICE_EXISTS: i32 = 1073;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("{operation} failed: {message} (code {code})")]
    Native {
        operation: String,
        code: i32,
        message: String,
    },

    #[error("Service not found: {0}")]
    NotFound(String),

    #[error("Service already exists: {0}")]
    AlreadyExists(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Service is marked for deletion: {0}")]
    MarkedForDeletion(String),

    #[error("Invalid configuration: {}", .0.join("; "))]
    InvalidConfiguration(Vec<String>),

    #[error("Timed out: {0}")]
    Timeout(String),
}

impl ServiceError {
    pub fn native(operation: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self::Native {
            operation: operation.into(),
            code,
            message: message.into(),
        }
    }

    /// Map an I/O failure of `operation` on `subject`
    pub fn from_io(operation: &str, subject: &str, err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(subject.to_string()),
            io::ErrorKind::PermissionDenied => {
                Self::AccessDenied(format!("{}: {}", operation, subject))
            }
            io::ErrorKind::AlreadyExists => Self::AlreadyExists(subject.to_string()),
            io::ErrorKind::InvalidInput => {
                Self::InvalidParameter(format!("{}: {}", subject, err))
            }
            _ => Self::native(
                operation,
                err.raw_os_error().unwrap_or(-1),
                err.to_string(),
            ),
        }
    }

    /// Native error code
    pub fn code(&self) -> i32 {
        match self {
            Self::Native { code, .. } => *code,
            Self::NotFound(_) => ERROR_SERVICE_DOES_NOT_EXIST,
            Self::AlreadyExists(_) => ERROR_SERVICE_EXISTS,
            Self::AccessDenied(_) => ERROR_ACCESS_DENIED,
            Self::InvalidParameter(_) => ERROR_INVALID_PARAMETER,
            Self::MarkedForDeletion(_) => ERROR_SERVICE_MARKED_FOR_DELETE,
            Self::InvalidConfiguration(_) => ERROR_INVALID_DATA,
            Self::Timeout(_) => ERROR_SERVICE_REQUEST_TIMEOUT,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// A secondary step that failed after the critical step succeeded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    pub step: String,
    pub code: i32,
    pub message: String,
}

impl Warning {
    pub fn new(step: impl Into<String>, err: &ServiceError) -> Self {
        Self {
            step: step.into(),
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.step, self.message)
    }
}

/// Outcome of an operation whose critical path succeeded
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OperationReport {
    pub warnings: Vec<Warning>,
}

impl OperationReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record and log a failed secondary step
    pub fn warn(&mut self, step: &str, err: &ServiceError) {
        log::warn!("{} failed (non-critical): {}", step, err);
        self.warnings.push(Warning::new(step, err));
    }

    pub fn extend(&mut self, warnings: impl IntoIterator<Item = Warning>) {
        self.warnings.extend(warnings);
    }

    /// True when some secondary step failed
    pub fn is_partial(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Holds the most recent error raised by an operation
#[derive(Debug, Default)]
pub struct ErrorSlot {
    last: Mutex<Option<ServiceError>>,
}

impl ErrorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pass a result through, remembering its error
    pub fn track<T>(&self, result: Result<T, ServiceError>) -> Result<T, ServiceError> {
        if let Err(e) = &result {
            self.set(e.clone());
        }
        result
    }

    pub fn set(&self, err: ServiceError) {
        if let Ok(mut last) = self.last.lock() {
            *last = Some(err);
        }
    }

    pub fn get(&self) -> Option<ServiceError> {
        self.last.lock().ok().and_then(|last| last.clone())
    }

    pub fn clear(&self) {
        if let Ok(mut last) = self.last.lock() {
            *last = None;
        }
    }
}
