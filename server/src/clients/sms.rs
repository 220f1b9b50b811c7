//! Africa's Talking SMS transport.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

use crate::config::SmsConfig;
use crate::utils::phone;

/// Africa's Talking accepts at most this many recipients per request.
pub const MAX_RECIPIENTS_PER_REQUEST: usize = 100;
const ACCEPTED_STATUS: &str = "Success";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("sms transport unreachable: {0}")]
    Unreachable(String),

    #[error("sms request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("unexpected sms response: {0}")]
    InvalidResponse(String),

    #[error("no deliverable recipients")]
    NoRecipients,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientStatus {
    pub number: String,
    pub accepted: bool,
    pub status: String,
}

#[async_trait]
pub trait SmsTransport: Send + Sync {
    fn max_recipients(&self) -> usize {
        MAX_RECIPIENTS_PER_REQUEST
    }

    async fn send(
        &self,
        recipients: &[String],
        message: &str,
    ) -> Result<Vec<RecipientStatus>, TransportError>;
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(rename = "SMSMessageData")]
    data: SmsMessageData,
}

#[derive(Debug, Deserialize)]
struct SmsMessageData {
    #[serde(rename = "Recipients", default)]
    recipients: Vec<Recipient>,
}

#[derive(Debug, Deserialize)]
struct Recipient {
    number: String,
    status: String,
}

pub struct AfricasTalkingClient {
    client: Client,
    config: SmsConfig,
}

impl AfricasTalkingClient {
    pub fn new(config: SmsConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl SmsTransport for AfricasTalkingClient {
    async fn send(
        &self,
        recipients: &[String],
        message: &str,
    ) -> Result<Vec<RecipientStatus>, TransportError> {
        let mut statuses = Vec::new();
        let mut numbers = Vec::with_capacity(recipients.len());
        for raw in recipients {
            match phone::to_e164(raw) {
                Ok(number) => numbers.push(number),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping undeliverable recipient");
                    statuses.push(RecipientStatus {
                        number: raw.clone(),
                        accepted: false,
                        status: "InvalidPhoneNumber".to_string(),
                    });
                }
            }
        }
        if numbers.is_empty() {
            return Err(TransportError::NoRecipients);
        }

        let to = numbers.join(",");
        let mut form = vec![
            ("username", self.config.username.as_str()),
            ("to", to.as_str()),
            ("message", message),
        ];
        if let Some(sender_id) = self.config.sender_id.as_deref() {
            form.push(("from", sender_id));
        }

        let response = self
            .client
            .post(format!("{}/messaging", self.config.base_url))
            .header("apiKey", &self.config.api_key)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let body: SendResponse = response
            .json()
            .await
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;

        statuses.extend(body.data.recipients.into_iter().map(|r| RecipientStatus {
            accepted: r.status == ACCEPTED_STATUS,
            number: r.number,
            status: r.status,
        }));
        Ok(statuses)
    }
}
