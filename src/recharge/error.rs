//! Recharge Error Types

use thiserror::Error;

use super::state::RechargeStatus;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RechargeError {
    // === Validation Errors ===
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Amount must be positive and within range")]
    InvalidAmount,

    // === State Errors ===
    #[error("Recharge not found: {0}")]
    NotFound(String),

    #[error("Recharge {id} is already {status}")]
    AlreadyTerminal { id: String, status: RechargeStatus },

    #[error("Recharge {0} was modified concurrently")]
    ConcurrentModification(String),

    // === System Errors ===
    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl RechargeError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            RechargeError::MissingField(_) => "MISSING_FIELD",
            RechargeError::InvalidAmount => "INVALID_AMOUNT",
            RechargeError::NotFound(_) => "RECHARGE_NOT_FOUND",
            RechargeError::AlreadyTerminal { .. } => "RECHARGE_ALREADY_TERMINAL",
            RechargeError::ConcurrentModification(_) => "CONCURRENT_MODIFICATION",
            RechargeError::DatabaseError(_) => "DATABASE_ERROR",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            RechargeError::MissingField(_) | RechargeError::InvalidAmount => 400,
            RechargeError::NotFound(_) => 404,
            RechargeError::AlreadyTerminal { .. } | RechargeError::ConcurrentModification(_) => {
                409
            }
            RechargeError::DatabaseError(_) => 500,
        }
    }
}

impl From<sqlx::Error> for RechargeError {
    fn from(e: sqlx::Error) -> Self {
        RechargeError::DatabaseError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(RechargeError::InvalidAmount.code(), "INVALID_AMOUNT");
        assert_eq!(
            RechargeError::NotFound("r1".into()).code(),
            "RECHARGE_NOT_FOUND"
        );
        assert_eq!(
            RechargeError::AlreadyTerminal {
                id: "r1".into(),
                status: RechargeStatus::Failed
            }
            .code(),
            "RECHARGE_ALREADY_TERMINAL"
        );
    }

    #[test]
    fn test_http_status() {
        assert_eq!(RechargeError::MissingField("phoneNumber").http_status(), 400);
        assert_eq!(RechargeError::NotFound("r1".into()).http_status(), 404);
        assert_eq!(
            RechargeError::ConcurrentModification("r1".into()).http_status(),
            409
        );
        assert_eq!(RechargeError::DatabaseError("x".into()).http_status(), 500);
    }

    #[test]
    fn test_display() {
        let err = RechargeError::AlreadyTerminal {
            id: "r1".into(),
            status: RechargeStatus::Completed,
        };
        assert_eq!(err.to_string(), "Recharge r1 is already completed");
    }
}
