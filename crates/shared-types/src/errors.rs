//! # Error Types
//!
//! Every failing OS call is reported as a [`PlatformError`] carrying the name
//! of the call, its return code and the last platform error code. Raw
//! platform error objects never cross a crate boundary.

use thiserror::Error;

/// `ERROR_ACCESS_DENIED`.
pub const ERROR_ACCESS_DENIED: u32 = 5;

/// `ERROR_INVALID_HANDLE`.
pub const ERROR_INVALID_HANDLE: u32 = 6;

/// `ERROR_INVALID_PARAMETER`.
pub const ERROR_INVALID_PARAMETER: u32 = 87;

/// `ERROR_NO_TOKEN`.
pub const ERROR_NO_TOKEN: u32 = 1008;

/// `ERROR_PIPE_BUSY`.
pub const ERROR_PIPE_BUSY: u32 = 231;

/// Uniform error for a failed OS call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("win32 error: {call} return:{return_code} win32:{os_error}")]
pub struct PlatformError {
    /// Name of the failing call, e.g. `"OpenProcess"`.
    pub call: String,
    /// The value the call returned.
    pub return_code: i64,
    /// The last platform error code observed after the call.
    pub os_error: u32,
}

impl PlatformError {
    /// Create a new error for `call`.
    pub fn new(call: impl Into<String>, return_code: i64, os_error: u32) -> Self {
        Self {
            call: call.into(),
            return_code,
            os_error,
        }
    }

    /// True if the failure was an access check.
    pub fn is_access_denied(&self) -> bool {
        self.os_error == ERROR_ACCESS_DENIED
    }

    /// True if one of the handles passed to the call was not valid.
    pub fn is_invalid_handle(&self) -> bool {
        self.os_error == ERROR_INVALID_HANDLE
    }
}

/// Result alias for platform calls.
pub type PlatformResult<T> = Result<T, PlatformError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_format() {
        let err = PlatformError::new("OpenProcess", 0, ERROR_ACCESS_DENIED);
        assert_eq!(err.to_string(), "win32 error: OpenProcess return:0 win32:5");
        assert!(err.is_access_denied());
        assert!(!err.is_invalid_handle());
    }
}
