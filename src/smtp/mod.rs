//! SMTP client side of the relay: wire protocol and TLS upgrade

pub mod outbound;
pub mod tls;

pub use outbound::{AsyncSmtpClient, SmtpClientError, SmtpReply};
