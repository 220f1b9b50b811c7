use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{error, warn};

use crate::clients::mpesa::GatewayError;
use crate::store::StoreError;
use crate::utils::response::error as error_response;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Ticket tier inactive: {0}")]
    TierInactive(String),

    #[error("Insufficient inventory: {0}")]
    InsufficientInventory(String),

    #[error("Payment gateway error: {0}")]
    GatewayError(#[from] GatewayError),

    #[error("Stale callback: {0}")]
    StaleCallback(String),

    #[error("Database error")]
    DatabaseError(#[from] StoreError),

    #[error("Internal server error")]
    InternalServerError(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::TierInactive(_) => StatusCode::CONFLICT,
            AppError::InsufficientInventory(_) => StatusCode::CONFLICT,
            AppError::GatewayError(_) => StatusCode::BAD_GATEWAY,
            AppError::StaleCallback(_) => StatusCode::CONFLICT,
            AppError::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::ValidationError(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::TierInactive(_) => "TIER_INACTIVE",
            AppError::InsufficientInventory(_) => "INSUFFICIENT_INVENTORY",
            AppError::GatewayError(_) => "GATEWAY_ERROR",
            AppError::StaleCallback(_) => "STALE_CALLBACK",
            AppError::DatabaseError(_) => "DATABASE_ERROR",
            AppError::InternalServerError(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    pub fn log(&self) {
        match self {
            // Client faults are routine on a storefront.
            AppError::ValidationError(msg)
            | AppError::NotFound(msg)
            | AppError::TierInactive(msg)
            | AppError::InsufficientInventory(msg)
            | AppError::StaleCallback(msg) => {
                warn!(code = self.code(), message = %msg, "Request rejected");
            }
            AppError::GatewayError(e) => {
                error!(error = ?e, "Payment gateway error");
            }
            AppError::DatabaseError(e) => {
                error!(error = ?e, "Database error");
            }
            AppError::InternalServerError(msg) => {
                error!(error = ?self, message = %msg, "Application error");
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();

        // Log internal details
        self.log();

        // Only expose high-level message to the client
        let public_message = match &self {
            AppError::ValidationError(msg)
            | AppError::NotFound(msg)
            | AppError::TierInactive(msg)
            | AppError::InsufficientInventory(msg)
            | AppError::StaleCallback(msg) => msg.clone(),
            AppError::GatewayError(e) => e.public_message(),
            AppError::DatabaseError(_) => "A database error occurred".to_string(),
            AppError::InternalServerError(_) => "An internal error occurred".to_string(),
        };

        error_response(code, public_message, None, status)
    }
}
