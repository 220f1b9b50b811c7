use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use crate::models::{PaymentStatus, Ticket};
use crate::services::credentials::qr_data_url;
use crate::services::PurchaseRequest;
use crate::state::AppState;
use crate::utils::error::AppError;
use crate::utils::response::{accepted, success};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TicketStatusView {
    id: Uuid,
    ticket_number: String,
    status: PaymentStatus,
    /// Only issued once the ticket is paid for.
    qr_code: Option<String>,
}

fn ticket_view(ticket: Ticket) -> Result<TicketStatusView, AppError> {
    let qr_code = match ticket.payment_status {
        PaymentStatus::Completed => Some(
            qr_data_url(&ticket.verification_payload)
                .map_err(|e| AppError::InternalServerError(e.to_string()))?,
        ),
        _ => None,
    };
    Ok(TicketStatusView {
        id: ticket.id,
        ticket_number: ticket.ticket_number,
        status: ticket.payment_status,
        qr_code,
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchView {
    correlation_id: Uuid,
    status: PaymentStatus,
    receipt_code: Option<String>,
    tickets: Vec<TicketStatusView>,
}

/// A batch moves as a unit, so any PENDING ticket means the batch is pending.
fn batch_status(tickets: &[Ticket]) -> PaymentStatus {
    tickets
        .iter()
        .map(|t| t.payment_status)
        .find(|status| *status == PaymentStatus::Pending)
        .or_else(|| tickets.first().map(|t| t.payment_status))
        .unwrap_or(PaymentStatus::Pending)
}

pub async fn purchase(
    State(state): State<AppState>,
    payload: Result<Json<PurchaseRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(request) = payload.map_err(|rejection| AppError::ValidationError(rejection.body_text()))?;
    let receipt = state.reservations.purchase(request).await?;

    Ok(accepted(receipt, "Payment request sent. Complete the payment on your phone.").into_response())
}

pub async fn purchase_status(
    State(state): State<AppState>,
    Path(correlation_id): Path<String>,
) -> Result<Response, AppError> {
    let correlation_id = Uuid::parse_str(&correlation_id)
        .map_err(|_| AppError::ValidationError(format!("'{correlation_id}' is not a valid purchase id")))?;

    let tickets = state.store.tickets_in_batch(correlation_id).await?;
    if tickets.is_empty() {
        return Err(AppError::NotFound(format!("purchase {correlation_id} not found")));
    }

    let view = BatchView {
        correlation_id,
        status: batch_status(&tickets),
        receipt_code: tickets.iter().find_map(|t| t.receipt_code.clone()),
        tickets: tickets.into_iter().map(ticket_view).collect::<Result<_, _>>()?,
    };

    Ok(success(view, "Purchase status").into_response())
}
