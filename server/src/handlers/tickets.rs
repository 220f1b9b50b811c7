use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::PaymentStatus;
use crate::services::credentials::VerificationPayload;
use crate::state::AppState;
use crate::utils::error::AppError;
use crate::utils::response::success;

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub payload: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Verification {
    valid: bool,
    ticket_id: Uuid,
    ticket_number: String,
    event_id: Uuid,
    status: PaymentStatus,
}

pub async fn verify(
    State(state): State<AppState>,
    payload: Result<Json<VerifyRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(request) = payload.map_err(|rejection| AppError::ValidationError(rejection.body_text()))?;
    let decoded = VerificationPayload::decode(&request.payload)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    let ticket = state
        .store
        .find_ticket(decoded.id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("ticket {} not found", decoded.id)))?;

    let valid = ticket.ticket_number == decoded.ticket && ticket.payment_status == PaymentStatus::Completed;
    let verification = Verification {
        valid,
        ticket_id: ticket.id,
        ticket_number: ticket.ticket_number,
        event_id: ticket.event_id,
        status: ticket.payment_status,
    };

    Ok(success(verification, "Ticket verification").into_response())
}
