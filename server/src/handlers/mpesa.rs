use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use serde::Serialize;
use tracing::{debug, warn};

use crate::clients::mpesa::StkCallbackEnvelope;
use crate::models::PaymentResult;
use crate::state::AppState;

/// The gateway only needs to know the callback arrived.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct CallbackAck {
    #[serde(rename = "ResultCode")]
    pub result_code: i32,
    #[serde(rename = "ResultDesc")]
    pub result_desc: &'static str,
}

const ACCEPTED: CallbackAck = CallbackAck {
    result_code: 0,
    result_desc: "Accepted",
};

pub async fn callback(State(state): State<AppState>, body: Bytes) -> Json<CallbackAck> {
    let envelope: StkCallbackEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, bytes = body.len(), "Unreadable payment callback acknowledged");
            return Json(ACCEPTED);
        }
    };

    let result = PaymentResult::from(envelope);
    match state.reconciliation.handle_callback(result).await {
        Ok(disposition) => debug!(?disposition, "Callback handled"),
        Err(e) => e.log(),
    }

    Json(ACCEPTED)
}
