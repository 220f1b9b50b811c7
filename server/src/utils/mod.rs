pub mod error;
pub mod phone;
pub mod response;
pub mod retry;
