//! Ticket numbers and the verification payload carried by a ticket's QR code.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use qrcode::render::svg;
use qrcode::types::QrError;
use qrcode::{EcLevel, QrCode};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

const TICKET_PREFIX: &str = "RD";
const SUFFIX_LEN: usize = 4;
const BASE36: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const QR_SIZE: u32 = 400;

fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

/// `RD` + upper-case base-36 millisecond timestamp + 4 random base-36 chars.
pub fn ticket_number(at: DateTime<Utc>) -> String {
    let millis = u64::try_from(at.timestamp_millis()).unwrap_or(0);
    let mut rng = rand::thread_rng();
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("{TICKET_PREFIX}{}{suffix}", to_base36(millis))
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid verification payload")]
pub struct InvalidPayload;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerificationPayload {
    pub id: Uuid,
    pub ticket: String,
    #[serde(rename = "issuedAt")]
    pub issued_at: i64,
}

impl VerificationPayload {
    pub fn new(ticket_id: Uuid, ticket_number: &str, issued_at: DateTime<Utc>) -> Self {
        Self {
            id: ticket_id,
            ticket: ticket_number.to_string(),
            issued_at: issued_at.timestamp_millis(),
        }
    }

    pub fn encode(&self) -> String {
        // Serializing a struct of a uuid, a string and an integer cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(encoded: &str) -> Result<Self, InvalidPayload> {
        let bytes = URL_SAFE_NO_PAD.decode(encoded.trim()).map_err(|_| InvalidPayload)?;
        serde_json::from_slice(&bytes).map_err(|_| InvalidPayload)
    }

    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.issued_at).single()
    }
}

#[derive(Debug, Error)]
#[error("cannot render QR code: {0}")]
pub struct QrRenderError(#[from] QrError);

/// The encoded payload as a scannable QR code, in an SVG data URL that can
/// go straight into an `<img src>`.
pub fn qr_data_url(encoded: &str) -> Result<String, QrRenderError> {
    let code = QrCode::with_error_correction_level(encoded.as_bytes(), EcLevel::M)?;
    let image = code
        .render::<svg::Color>()
        .min_dimensions(QR_SIZE, QR_SIZE)
        .quiet_zone(true)
        .dark_color(svg::Color("#000000"))
        .light_color(svg::Color("#ffffff"))
        .build();
    Ok(format!("data:image/svg+xml;base64,{}", STANDARD.encode(image)))
}
