//! Kenyan mobile number normalization.
//!
//! The payment gateway wants MSISDNs (`2547XXXXXXXX`), the SMS transport wants
//! E.164 (`+2547XXXXXXXX`). Purchasers type anything in between.

use thiserror::Error;

const COUNTRY_CODE: &str = "254";
const MSISDN_LEN: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("'{0}' is not a valid mobile number")]
pub struct InvalidPhoneNumber(pub String);

/// Normalize to `254XXXXXXXXX`.
pub fn to_msisdn(raw: &str) -> Result<String, InvalidPhoneNumber> {
    let mut cleaned: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-' && *c != '+')
        .collect();

    if let Some(local) = cleaned.strip_prefix('0') {
        cleaned = format!("{COUNTRY_CODE}{local}");
    } else if cleaned.len() == 9 && (cleaned.starts_with('7') || cleaned.starts_with('1')) {
        cleaned = format!("{COUNTRY_CODE}{cleaned}");
    }

    if cleaned.len() == MSISDN_LEN
        && cleaned.starts_with(COUNTRY_CODE)
        && cleaned.chars().all(|c| c.is_ascii_digit())
    {
        Ok(cleaned)
    } else {
        Err(InvalidPhoneNumber(raw.to_string()))
    }
}

/// Normalize to `+254XXXXXXXXX`.
pub fn to_e164(raw: &str) -> Result<String, InvalidPhoneNumber> {
    to_msisdn(raw).map(|msisdn| format!("+{msisdn}"))
}
