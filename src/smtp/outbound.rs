//! Outbound SMTP client for relaying through an authenticated submission server

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rustls::pki_types::ServerName;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::relay::RelayTransport;
use crate::verbose;

/// Result of an SMTP operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpReply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl SmtpReply {
    pub fn is_2xx(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

impl fmt::Display for SmtpReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.lines.join(" "))
    }
}

/// Error type for SMTP client operations
#[derive(Debug, Error)]
pub enum SmtpClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid SMTP reply: {0}")]
    InvalidReply(String),
    #[error("{command} rejected: {reply}")]
    Rejected {
        command: &'static str,
        reply: SmtpReply,
    },
    #[error("Connection closed unexpectedly")]
    ConnectionClosed,
    #[error("Timed out waiting for SMTP reply")]
    Timeout,
    #[error("Server does not offer STARTTLS")]
    StartTlsUnavailable,
    #[error("TLS handshake failed: {0}")]
    Tls(std::io::Error),
    #[error("No message body is open")]
    NoDataInProgress,
}

/// State of an open DATA section
///
/// Bytes are dot-stuffed and bare LF is widened to CRLF as they are written.
#[derive(Debug)]
struct BodyWriter {
    line_start: bool,
    last_was_cr: bool,
}

impl BodyWriter {
    fn new() -> Self {
        Self {
            line_start: true,
            last_was_cr: false,
        }
    }

    fn encode(&mut self, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(body.len() + body.len() / 32 + 2);
        for &byte in body {
            if self.line_start && byte == b'.' {
                out.push(b'.');
            }
            if byte == b'\n' && !self.last_was_cr {
                out.push(b'\r');
            }
            out.push(byte);
            self.line_start = byte == b'\n';
            self.last_was_cr = byte == b'\r';
        }
        out
    }

    /// Terminator that closes the body, including a CRLF if the last line is open
    fn terminator(&self) -> &'static [u8] {
        if self.line_start {
            b".\r\n"
        } else {
            b"\r\n.\r\n"
        }
    }
}

/// Async SMTP client for outbound mail delivery
pub struct AsyncSmtpClient<S> {
    stream: BufReader<S>,
    hostname: String,
    reply_timeout: Duration,
    extensions: Vec<String>,
    body: Option<BodyWriter>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncSmtpClient<S> {
    /// Create a new async SMTP client
    pub fn new(stream: S, hostname: &str, reply_timeout: Duration) -> Self {
        Self {
            stream: BufReader::new(stream),
            hostname: hostname.to_string(),
            reply_timeout,
            extensions: Vec::new(),
            body: None,
        }
    }

    /// Read an SMTP reply (possibly multiline)
    pub async fn read_reply(&mut self) -> Result<SmtpReply, SmtpClientError> {
        match tokio::time::timeout(self.reply_timeout, self.read_reply_lines()).await {
            Ok(result) => result,
            Err(_) => Err(SmtpClientError::Timeout),
        }
    }

    async fn read_reply_lines(&mut self) -> Result<SmtpReply, SmtpClientError> {
        let mut lines = Vec::new();
        let mut code: u16 = 0;

        loop {
            let mut line = String::new();
            let n = self.stream.read_line(&mut line).await?;
            if n == 0 {
                return Err(SmtpClientError::ConnectionClosed);
            }

            let line = line.trim_end_matches(['\r', '\n']);
            if line.len() < 3 || !line.is_char_boundary(3) {
                return Err(SmtpClientError::InvalidReply(line.to_string()));
            }

            let reply_code: u16 = line[..3]
                .parse()
                .map_err(|_| SmtpClientError::InvalidReply(line.to_string()))?;

            if code == 0 {
                code = reply_code;
            } else if code != reply_code {
                return Err(SmtpClientError::InvalidReply(format!(
                    "Inconsistent reply codes: {} vs {}",
                    code, reply_code
                )));
            }

            // "250" alone is a valid final line with no text
            let separator = line.as_bytes().get(3).copied().unwrap_or(b' ');
            let text = line.get(4..).unwrap_or("").to_string();
            lines.push(text);

            // Space separator means last line
            if separator == b' ' {
                break;
            }
        }

        Ok(SmtpReply { code, lines })
    }

    /// Send a command and wait for reply
    pub async fn command(&mut self, cmd: &str) -> Result<SmtpReply, SmtpClientError> {
        self.write_raw(format!("{}\r\n", cmd).as_bytes()).await?;
        self.read_reply().await
    }

    /// Send a command and require a specific reply class
    async fn command_expecting(
        &mut self,
        name: &'static str,
        cmd: &str,
        accept: fn(&SmtpReply) -> bool,
    ) -> Result<SmtpReply, SmtpClientError> {
        let reply = self.command(cmd).await?;
        verbose!("< {}", reply);
        if accept(&reply) {
            Ok(reply)
        } else {
            Err(SmtpClientError::Rejected {
                command: name,
                reply,
            })
        }
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), SmtpClientError> {
        let writer = self.stream.get_mut();
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read the initial greeting from the server
    pub async fn read_greeting(&mut self) -> Result<SmtpReply, SmtpClientError> {
        let greeting = self.read_reply().await?;
        verbose!("< {}", greeting);
        if greeting.code != 220 {
            return Err(SmtpClientError::Rejected {
                command: "greeting",
                reply: greeting,
            });
        }
        Ok(greeting)
    }

    /// Greet the server with EHLO, falling back to HELO
    pub async fn hello(&mut self) -> Result<SmtpReply, SmtpClientError> {
        verbose!("> EHLO {}", self.hostname);
        let reply = self.command(&format!("EHLO {}", self.hostname)).await?;
        verbose!("< {}", reply);
        if reply.is_2xx() {
            // First line is the server's greeting, the rest are extensions
            self.extensions = reply.lines.iter().skip(1).cloned().collect();
            return Ok(reply);
        }

        verbose!("> HELO {}", self.hostname);
        let helo = format!("HELO {}", self.hostname);
        let reply = self.command_expecting("HELO", &helo, SmtpReply::is_2xx).await?;
        self.extensions.clear();
        Ok(reply)
    }

    /// Check if the last EHLO advertised a capability
    pub fn has_extension(&self, capability: &str) -> bool {
        self.extensions.iter().any(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|keyword| keyword.eq_ignore_ascii_case(capability))
        })
    }

    /// Upgrade the connection with STARTTLS and greet again over TLS
    pub async fn starttls(
        mut self,
        connector: &TlsConnector,
        server_name: ServerName<'static>,
    ) -> Result<AsyncSmtpClient<TlsStream<S>>, SmtpClientError> {
        if !self.has_extension("STARTTLS") {
            return Err(SmtpClientError::StartTlsUnavailable);
        }

        verbose!("> STARTTLS");
        self.command_expecting("STARTTLS", "STARTTLS", |r| r.code == 220)
            .await?;

        let AsyncSmtpClient {
            stream,
            hostname,
            reply_timeout,
            ..
        } = self;

        let tls_stream = connector
            .connect(server_name, stream.into_inner())
            .await
            .map_err(SmtpClientError::Tls)?;
        verbose!("TLS handshake successful");

        // After TLS upgrade, need to send EHLO again
        let mut client = AsyncSmtpClient::new(tls_stream, &hostname, reply_timeout);
        client.hello().await?;
        Ok(client)
    }

    /// Authenticate with AUTH PLAIN
    pub async fn auth_plain(
        &mut self,
        username: &str,
        password: &str,
    ) -> Result<SmtpReply, SmtpClientError> {
        let credentials = BASE64.encode(format!("\0{}\0{}", username, password));
        verbose!("> AUTH PLAIN <credentials for {}>", username);
        self.command_expecting("AUTH", &format!("AUTH PLAIN {}", credentials), |r| {
            r.code == 235
        })
        .await
    }

    /// Send MAIL FROM command
    pub async fn mail_from(&mut self, address: &str) -> Result<SmtpReply, SmtpClientError> {
        verbose!("> MAIL FROM:<{}>", address);
        self.command_expecting("MAIL FROM", &format!("MAIL FROM:<{}>", address), |r| {
            r.code == 250
        })
        .await
    }

    /// Send RCPT TO command
    pub async fn rcpt_to(&mut self, address: &str) -> Result<SmtpReply, SmtpClientError> {
        verbose!("> RCPT TO:<{}>", address);
        self.command_expecting("RCPT TO", &format!("RCPT TO:<{}>", address), |r| {
            r.code == 250 || r.code == 251
        })
        .await
    }

    /// Send DATA and open the message body
    pub async fn open_data(&mut self) -> Result<SmtpReply, SmtpClientError> {
        verbose!("> DATA");
        let reply = self
            .command_expecting("DATA", "DATA", |r| r.code == 354)
            .await?;
        self.body = Some(BodyWriter::new());
        Ok(reply)
    }

    /// Write part of the message body
    pub async fn write_data(&mut self, body: &[u8]) -> Result<(), SmtpClientError> {
        let encoded = match self.body.as_mut() {
            Some(writer) => writer.encode(body),
            None => return Err(SmtpClientError::NoDataInProgress),
        };
        self.write_raw(&encoded).await?;
        verbose!("> [message body, {} bytes]", body.len());
        Ok(())
    }

    /// Terminate the message body and wait for the server to accept it
    pub async fn close_data(&mut self) -> Result<SmtpReply, SmtpClientError> {
        let writer = self.body.take().ok_or(SmtpClientError::NoDataInProgress)?;
        self.write_raw(writer.terminator()).await?;
        verbose!("> .");
        let reply = self.read_reply().await?;
        verbose!("< {}", reply);
        if reply.code != 250 {
            return Err(SmtpClientError::Rejected {
                command: "DATA",
                reply,
            });
        }
        Ok(reply)
    }

    /// Send RSET to abort the current transaction
    pub async fn reset(&mut self) -> Result<SmtpReply, SmtpClientError> {
        // An unterminated body would swallow RSET as message text
        if let Some(writer) = self.body.take() {
            self.write_raw(writer.terminator()).await?;
            let reply = self.read_reply().await?;
            verbose!("< {} (body closed before reset)", reply);
        }
        verbose!("> RSET");
        self.command_expecting("RSET", "RSET", |r| r.code == 250).await
    }

    /// Send QUIT command and close the stream
    pub async fn quit(&mut self) -> Result<SmtpReply, SmtpClientError> {
        verbose!("> QUIT");
        let reply = self
            .command_expecting("QUIT", "QUIT", |r| r.code == 221)
            .await?;
        self.stream.get_mut().shutdown().await?;
        Ok(reply)
    }
}

#[async_trait]
impl<S> RelayTransport for AsyncSmtpClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn mail_from(&mut self, address: &str) -> Result<(), SmtpClientError> {
        AsyncSmtpClient::mail_from(self, address).await.map(drop)
    }

    async fn rcpt_to(&mut self, address: &str) -> Result<(), SmtpClientError> {
        AsyncSmtpClient::rcpt_to(self, address).await.map(drop)
    }

    async fn open_body(&mut self) -> Result<(), SmtpClientError> {
        self.open_data().await.map(drop)
    }

    async fn write_body(&mut self, body: &[u8]) -> Result<(), SmtpClientError> {
        self.write_data(body).await
    }

    async fn commit_body(&mut self) -> Result<(), SmtpClientError> {
        self.close_data().await.map(drop)
    }

    async fn reset(&mut self) -> Result<(), SmtpClientError> {
        AsyncSmtpClient::reset(self).await.map(drop)
    }

    async fn quit(&mut self) -> Result<(), SmtpClientError> {
        AsyncSmtpClient::quit(self).await.map(drop)
    }
}
