//! Outbound SMTP for the relay.
//!
//! Only the client side is implemented: connect, EHLO, optional STARTTLS,
//! one envelope, DATA, QUIT.

pub mod client;
pub mod error;
pub mod response;
mod tls;

pub use client::{SmtpClient, encode_data};
pub use error::{ClientError, Result};
pub use response::Response;
