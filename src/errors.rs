use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::ride::RideStatus;

/// Main error type for the ride engine
#[derive(Debug)]
pub enum SparrowError {
    // HTTP and API errors
    NotFound(String),
    Conflict(String),
    InternalServer(String),

    // Store errors
    Store(String),
    StoreContention(String),

    // Serialization and parsing errors
    JsonParsing(String),
    JsonSerialization(String),

    // Not-found errors
    UserNotFound(String),
    DriverNotFound(String),
    RideNotFound(String),

    // Precondition errors
    RideAlreadyClaimed { ride_id: String, driver_id: String },
    InvalidTransition { from: RideStatus, to: RideStatus },
    OfferNotHeld { ride_id: String, driver_id: String },
    DriverNotAvailable(String),
    AlreadyRated(String),

    // Best-effort collaborator errors
    ClassifierFailed(String),

    // Validation errors
    ValidationFailed(Vec<ValidationError>),
    InvalidFieldValue { field: String, value: String, reason: String },

    // Configuration and setup errors
    ConfigurationError(String),
    InvalidConfiguration(String),

    ServiceUnavailable(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl fmt::Display for SparrowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SparrowError::NotFound(msg) => write!(f, "Not found: {}", msg),
            SparrowError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            SparrowError::InternalServer(msg) => write!(f, "Internal server error: {}", msg),

            SparrowError::Store(msg) => write!(f, "Store error: {}", msg),
            SparrowError::StoreContention(key) => write!(f, "Too much contention on {}", key),

            SparrowError::JsonParsing(msg) => write!(f, "JSON parsing error: {}", msg),
            SparrowError::JsonSerialization(msg) => write!(f, "JSON serialization error: {}", msg),

            SparrowError::UserNotFound(id) => write!(f, "User not found: {}", id),
            SparrowError::DriverNotFound(id) => write!(f, "Driver not found: {}", id),
            SparrowError::RideNotFound(id) => write!(f, "Ride not found: {}", id),

            SparrowError::RideAlreadyClaimed { ride_id, driver_id } => {
                write!(f, "Ride {} is already taken by driver {}", ride_id, driver_id)
            }
            SparrowError::InvalidTransition { from, to } => {
                write!(f, "Invalid ride transition: {} -> {}", from, to)
            }
            SparrowError::OfferNotHeld { ride_id, driver_id } => {
                write!(f, "Driver {} holds no offer for ride {}", driver_id, ride_id)
            }
            SparrowError::DriverNotAvailable(id) => write!(f, "Driver is not available: {}", id),
            SparrowError::AlreadyRated(msg) => write!(f, "Already rated: {}", msg),

            SparrowError::ClassifierFailed(msg) => write!(f, "Sentiment classification failed: {}", msg),

            SparrowError::ValidationFailed(errors) => {
                write!(f, "Validation failed: {} errors", errors.len())
            }
            SparrowError::InvalidFieldValue { field, value, reason } => {
                write!(f, "Invalid value '{}' for field '{}': {}", value, field, reason)
            }

            SparrowError::ConfigurationError(msg) => write!(f, "Configuration error: {}", msg),
            SparrowError::InvalidConfiguration(msg) => write!(f, "Invalid configuration: {}", msg),

            SparrowError::ServiceUnavailable(service) => write!(f, "Service unavailable: {}", service),
        }
    }
}

impl std::error::Error for SparrowError {}

impl IntoResponse for SparrowError {
    fn into_response(self) -> Response {
        let (status, error_type, message, details) = match self {
            SparrowError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg, None),
            SparrowError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg, None),

            SparrowError::ValidationFailed(errors) => {
                let details = serde_json::to_value(&errors).ok();
                (StatusCode::BAD_REQUEST, "validation_failed", "Validation errors occurred".to_string(), details)
            }
            SparrowError::InvalidFieldValue { field, reason, .. } => {
                (StatusCode::BAD_REQUEST, "invalid_field", format!("Invalid value for {}: {}", field, reason), None)
            }
            SparrowError::JsonParsing(msg) => (StatusCode::BAD_REQUEST, "invalid_json", msg, None),

            SparrowError::UserNotFound(id) => (StatusCode::NOT_FOUND, "user_not_found", format!("User not found: {}", id), None),
            SparrowError::DriverNotFound(id) => (StatusCode::NOT_FOUND, "driver_not_found", format!("Driver not found: {}", id), None),
            SparrowError::RideNotFound(id) => (StatusCode::NOT_FOUND, "ride_not_found", format!("Ride not found: {}", id), None),

            err @ SparrowError::RideAlreadyClaimed { .. } => {
                (StatusCode::CONFLICT, "ride_already_taken", err.to_string(), None)
            }
            err @ SparrowError::InvalidTransition { .. } => {
                (StatusCode::CONFLICT, "invalid_transition", err.to_string(), None)
            }
            err @ SparrowError::OfferNotHeld { .. } => (StatusCode::CONFLICT, "offer_not_held", err.to_string(), None),
            err @ SparrowError::DriverNotAvailable(_) => {
                (StatusCode::CONFLICT, "driver_not_available", err.to_string(), None)
            }
            err @ SparrowError::AlreadyRated(_) => (StatusCode::CONFLICT, "already_rated", err.to_string(), None),
            err @ SparrowError::StoreContention(_) => (StatusCode::CONFLICT, "contention", err.to_string(), None),

            SparrowError::ServiceUnavailable(service) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", format!("Service unavailable: {}", service), None)
            }

            // All other errors are treated as internal server errors
            err => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", err.to_string(), None),
        };

        let error_response = ErrorResponse {
            error: error_type.to_string(),
            message,
            details,
        };

        (status, axum::Json(error_response)).into_response()
    }
}

// Convenience type alias for Results
pub type SparrowResult<T> = Result<T, SparrowError>;

impl From<crate::services::store_service::StoreError> for SparrowError {
    fn from(err: crate::services::store_service::StoreError) -> Self {
        use crate::services::store_service::StoreError;
        match err {
            StoreError::Serialization(msg) => SparrowError::JsonSerialization(msg),
            StoreError::Contention(key) => SparrowError::StoreContention(key),
            other => SparrowError::Store(other.to_string()),
        }
    }
}

impl From<crate::services::sentiment::ClassifierError> for SparrowError {
    fn from(err: crate::services::sentiment::ClassifierError) -> Self {
        SparrowError::ClassifierFailed(err.to_string())
    }
}

impl From<serde_json::Error> for SparrowError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_syntax() || err.is_data() {
            SparrowError::JsonParsing(err.to_string())
        } else {
            SparrowError::JsonSerialization(err.to_string())
        }
    }
}

// Helper functions for creating common errors
impl SparrowError {
    pub fn not_found(resource: impl Into<String>) -> Self {
        SparrowError::NotFound(resource.into())
    }

    pub fn internal_error(msg: impl Into<String>) -> Self {
        SparrowError::InternalServer(msg.into())
    }

    pub fn validation_error(field: impl Into<String>, message: impl Into<String>) -> Self {
        SparrowError::ValidationFailed(vec![ValidationError {
            field: field.into(),
            message: message.into(),
        }])
    }

    pub fn invalid_value(field: impl Into<String>, value: impl fmt::Display, reason: impl Into<String>) -> Self {
        SparrowError::InvalidFieldValue {
            field: field.into(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    /// The actor asked for something the ride's current state forbids.
    /// Callers recover by re-entering matching or giving up; never fatal.
    pub fn is_precondition_failure(&self) -> bool {
        matches!(
            self,
            SparrowError::RideAlreadyClaimed { .. }
                | SparrowError::InvalidTransition { .. }
                | SparrowError::OfferNotHeld { .. }
                | SparrowError::DriverNotAvailable(_)
                | SparrowError::AlreadyRated(_)
                | SparrowError::Conflict(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SparrowError::NotFound(_)
                | SparrowError::UserNotFound(_)
                | SparrowError::DriverNotFound(_)
                | SparrowError::RideNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = SparrowError::RideNotFound("rid-250101-a1b2c".to_string());
        assert_eq!(error.to_string(), "Ride not found: rid-250101-a1b2c");

        let error = SparrowError::InvalidTransition {
            from: RideStatus::Completed,
            to: RideStatus::Cancelled,
        };
        assert_eq!(error.to_string(), "Invalid ride transition: completed -> cancelled");
    }

    #[test]
    fn test_validation_error() {
        let error = SparrowError::validation_error("distanceKm", "must not be negative");
        match error {
            SparrowError::ValidationFailed(errors) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].field, "distanceKm");
            }
            _ => panic!("Expected ValidationFailed error"),
        }
    }

    #[test]
    fn test_error_classes() {
        let taken = SparrowError::RideAlreadyClaimed {
            ride_id: "rid-250101-a1b2c".into(),
            driver_id: "drv-250101-a1b2c".into(),
        };
        assert!(taken.is_precondition_failure());
        assert!(!taken.is_not_found());
        assert!(SparrowError::DriverNotFound("x".into()).is_not_found());
    }

    #[test]
    fn test_status_codes() {
        let response = SparrowError::RideAlreadyClaimed {
            ride_id: "r".into(),
            driver_id: "d".into(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = SparrowError::UserNotFound("u".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = SparrowError::validation_error("rating", "out of range").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
