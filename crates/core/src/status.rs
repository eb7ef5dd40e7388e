//! Status codes returned across the row-store boundary
//!
//! Row-store operations never return rich errors to the harness: they
//! report `Ok` or `Error`. Absence (`NotFound`) folds into `Error` like any
//! other failure.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of a row-store operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Operation succeeded
    Ok,
    /// Generic failure, including not-found
    Error,
}

impl Status {
    /// Fold a result into a status
    ///
    /// Fatal errors are logged before they are discarded, so a durability
    /// failure is never silently swallowed.
    pub fn from_result<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Status::Ok,
            Err(e) if e.is_fatal() => {
                tracing::error!(error = %e, "operation failed with fatal error");
                Status::Error
            }
            Err(e) => {
                tracing::debug!(error = %e, "operation failed");
                Status::Error
            }
        }
    }

    /// True for `Status::Ok`
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => write!(f, "OK"),
            Status::Error => write!(f, "ERROR"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_from_ok() {
        let r: Result<u32> = Ok(1);
        assert_eq!(Status::from_result(&r), Status::Ok);
    }

    #[test]
    fn test_not_found_is_error_status() {
        let r: Result<()> = Err(Error::not_found("user1"));
        assert_eq!(Status::from_result(&r), Status::Error);
    }

    #[test]
    fn test_fatal_is_error_status() {
        let r: Result<()> = Err(Error::durability("fence failed"));
        assert_eq!(Status::from_result(&r), Status::Error);
    }

    #[test]
    fn test_display() {
        assert_eq!(Status::Ok.to_string(), "OK");
        assert_eq!(Status::Error.to_string(), "ERROR");
        assert!(Status::Ok.is_ok());
        assert!(!Status::Error.is_ok());
    }
}
