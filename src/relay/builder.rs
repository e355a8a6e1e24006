//! One-time establishment of the authenticated, encrypted relay session

use async_trait::async_trait;
use std::io;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::config::RelayConfig;
use crate::relay::RelayTransport;
use crate::smtp::{tls, AsyncSmtpClient, SmtpClientError};
use crate::{log_info, verbose};

/// Session type produced by the SMTP builder
pub type SmtpSession = AsyncSmtpClient<TlsStream<TcpStream>>;

/// Why the relay session could not be established
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        source: io::Error,
    },
    #[error("invalid relay host name {0:?}")]
    InvalidServerName(String),
    #[error("TLS configuration error: {0}")]
    TlsConfig(#[from] rustls::Error),
    #[error("SMTP {stage} failed: {source}")]
    Protocol {
        stage: &'static str,
        source: SmtpClientError,
    },
}

impl SetupError {
    fn at(stage: &'static str) -> impl FnOnce(SmtpClientError) -> SetupError {
        move |source| SetupError::Protocol { stage, source }
    }
}

/// Produces the single session the relay runs on
///
/// The sequence is all-or-nothing: a partially set up transport is dropped,
/// never returned.
#[async_trait]
pub trait SessionBuilder: Send + Sync + 'static {
    type Transport: RelayTransport;

    async fn build(&self) -> Result<Self::Transport, SetupError>;
}

/// Builds an SMTP session: connect, greet, STARTTLS, authenticate
pub struct SmtpSessionBuilder {
    config: RelayConfig,
}

impl SmtpSessionBuilder {
    pub fn new(config: RelayConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionBuilder for SmtpSessionBuilder {
    type Transport = SmtpSession;

    async fn build(&self) -> Result<SmtpSession, SetupError> {
        let smtp = &self.config.smtp;
        let mail = &self.config.mail;

        // Resolve TLS settings up front so a bad host name fails before dialing
        let connector = tls::connector(smtp.skip_tls_verify)?;
        let server_name = tls::server_name(&smtp.server_domain)
            .map_err(|_| SetupError::InvalidServerName(smtp.server_domain.clone()))?;

        let address = smtp.address();
        verbose!("Establishing TCP connection with SMTP server {}", address);
        let stream = TcpStream::connect(&address)
            .await
            .map_err(|source| SetupError::Connect {
                address: address.clone(),
                source,
            })?;

        verbose!("Creating SMTP client");
        let mut client = AsyncSmtpClient::new(stream, &smtp.client_domain, smtp.command_timeout());
        client.read_greeting().await.map_err(SetupError::at("greeting"))?;

        verbose!("Sending HELLO to SMTP server");
        client.hello().await.map_err(SetupError::at("hello"))?;

        verbose!("Negotiating TLS encryption for SMTP communication");
        let mut client = client
            .starttls(&connector, server_name)
            .await
            .map_err(SetupError::at("STARTTLS"))?;

        verbose!("Authenticating to the SMTP server");
        client
            .auth_plain(&mail.source_address, &mail.source_password)
            .await
            .map_err(SetupError::at("authentication"))?;

        log_info!("Authenticated to SMTP server {} as {}", address, mail.source_address);
        Ok(client)
    }
}
