pub mod mpesa;
pub mod sms;

pub use mpesa::{GatewayError, MpesaClient, PaymentGateway, PushAcknowledgement, PushRequest, PushStatus};
pub use sms::{AfricasTalkingClient, RecipientStatus, SmsTransport, TransportError};
