pub mod event;
pub mod fan;
pub mod payment;
pub mod ticket;

pub use event::Event;
pub use fan::FanProfile;
pub use payment::{PaymentResult, ProcessedCallback};
pub use ticket::{NewTicket, PaymentStatus, Ticket, TicketTier, UnknownPaymentStatus};
