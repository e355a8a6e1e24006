//! In-process SMTP relay for integration tests
//!
//! Speaks just enough submission SMTP for the relay client: greeting, EHLO,
//! STARTTLS (rustls with a self-signed certificate), AUTH PLAIN, one
//! transaction at a time, RSET and QUIT.

#![allow(dead_code)]

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rosetta_relay::config::RelayConfig;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

pub const USERNAME: &str = "source@test.com";
pub const PASSWORD: &str = "hunter2";
pub const TARGET: &str = "target@test.com";

/// How the fake relay should misbehave
#[derive(Debug, Clone, Copy, Default)]
pub struct Behavior {
    pub reject_rcpt: bool,
    /// Hold the reply to this command verb (e.g. "RCPT") for a while
    pub slow_reply: Option<(&'static str, Duration)>,
}

/// A message accepted by the fake relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub from: String,
    pub to: Vec<String>,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct Stats {
    pub connections: AtomicUsize,
    pub auths: AtomicUsize,
    pub resets: AtomicUsize,
    pub quits: AtomicUsize,
    pub messages: Mutex<Vec<Received>>,
}

impl Stats {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn auths(&self) -> usize {
        self.auths.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn quits(&self) -> usize {
        self.quits.load(Ordering::SeqCst)
    }

    pub fn messages(&self) -> Vec<Received> {
        self.messages.lock().unwrap().clone()
    }
}

pub struct FakeRelay {
    pub addr: SocketAddr,
    pub stats: Arc<Stats>,
}

impl FakeRelay {
    pub async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(Stats::default());
        let acceptor = acceptor();

        let task_stats = stats.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                task_stats.connections.fetch_add(1, Ordering::SeqCst);
                let stats = task_stats.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(socket, acceptor, behavior, stats).await;
                });
            }
        });

        Self { addr, stats }
    }

    /// Relay configuration pointing at this server
    pub fn config(&self) -> RelayConfig {
        config_for(self.addr.port())
    }
}

/// Relay configuration for a local server on `port`
pub fn config_for(port: u16) -> RelayConfig {
    let mut config = RelayConfig::default();
    config.smtp.server_domain = "localhost".to_string();
    config.smtp.server_port = port;
    config.smtp.client_domain = "client.test".to_string();
    config.smtp.skip_tls_verify = true;
    config.mail.source_address = USERNAME.to_string();
    config.mail.source_password = PASSWORD.to_string();
    config.mail.target_address = TARGET.to_string();
    config
}

/// A port with nothing listening on it
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn acceptor() -> TlsAcceptor {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(vec![cert.der().clone()], key)
    .unwrap();

    TlsAcceptor::from(Arc::new(config))
}

async fn read_line<S: AsyncRead + Unpin>(stream: &mut BufReader<S>) -> Option<String> {
    let mut line = String::new();
    match stream.read_line(&mut line).await {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
    }
}

async fn reply<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut BufReader<S>,
    text: &str,
) -> std::io::Result<()> {
    let writer = stream.get_mut();
    writer.write_all(text.as_bytes()).await?;
    writer.flush().await
}

/// Plaintext phase: greet, EHLO, then hand over to TLS on STARTTLS
async fn handle_connection(
    socket: TcpStream,
    acceptor: TlsAcceptor,
    behavior: Behavior,
    stats: Arc<Stats>,
) -> std::io::Result<()> {
    let mut plain = BufReader::new(socket);
    reply(&mut plain, "220 fake.relay ESMTP ready\r\n").await?;

    loop {
        let Some(line) = read_line(&mut plain).await else {
            return Ok(());
        };
        let verb = line.split_whitespace().next().unwrap_or("").to_ascii_uppercase();
        match verb.as_str() {
            "EHLO" => reply(&mut plain, "250-fake.relay\r\n250-8BITMIME\r\n250 STARTTLS\r\n").await?,
            "STARTTLS" => {
                reply(&mut plain, "220 2.0.0 Ready to start TLS\r\n").await?;
                break;
            }
            "QUIT" => return reply(&mut plain, "221 2.0.0 Bye\r\n").await,
            _ => reply(&mut plain, "530 5.7.0 Must issue a STARTTLS command first\r\n").await?,
        }
    }

    let tls = acceptor.accept(plain.into_inner()).await?;
    serve_secure(BufReader::new(tls), behavior, stats).await
}

#[derive(PartialEq, Eq)]
enum State {
    Connected,
    Greeted,
    Authenticated,
    MailFrom,
    RcptTo,
}

async fn serve_secure<S: AsyncRead + AsyncWrite + Unpin>(
    mut stream: BufReader<S>,
    behavior: Behavior,
    stats: Arc<Stats>,
) -> std::io::Result<()> {
    let mut state = State::Connected;
    let mut from = String::new();
    let mut to = Vec::new();

    while let Some(line) = read_line(&mut stream).await {
        let upper = line.to_ascii_uppercase();
        let verb = upper.split_whitespace().next().unwrap_or("").to_string();

        if let Some((slow, delay)) = behavior.slow_reply {
            if slow == verb {
                tokio::time::sleep(delay).await;
            }
        }

        match verb.as_str() {
            "EHLO" => {
                state = State::Greeted;
                reply(&mut stream, "250-fake.relay\r\n250 AUTH PLAIN\r\n").await?;
            }
            "AUTH" if state == State::Greeted => {
                let credentials = line.split_whitespace().nth(2).unwrap_or("");
                let expected = format!("\0{}\0{}", USERNAME, PASSWORD);
                let decoded = BASE64.decode(credentials).unwrap_or_default();
                if decoded == expected.as_bytes() {
                    stats.auths.fetch_add(1, Ordering::SeqCst);
                    state = State::Authenticated;
                    reply(&mut stream, "235 2.7.0 Authentication successful\r\n").await?;
                } else {
                    reply(&mut stream, "535 5.7.8 Authentication credentials invalid\r\n").await?;
                }
            }
            "MAIL" if state == State::Authenticated => {
                from = address_of(&line);
                state = State::MailFrom;
                reply(&mut stream, "250 2.1.0 OK\r\n").await?;
            }
            "RCPT" if state == State::MailFrom || state == State::RcptTo => {
                if behavior.reject_rcpt {
                    reply(&mut stream, "550 5.1.1 No such user\r\n").await?;
                } else {
                    to.push(address_of(&line));
                    state = State::RcptTo;
                    reply(&mut stream, "250 2.1.5 OK\r\n").await?;
                }
            }
            "DATA" if state == State::RcptTo => {
                reply(&mut stream, "354 End data with <CR><LF>.<CR><LF>\r\n").await?;
                let mut lines = Vec::new();
                loop {
                    let Some(line) = read_line(&mut stream).await else {
                        return Ok(());
                    };
                    if line == "." {
                        break;
                    }
                    let unstuffed = if line.starts_with("..") { &line[1..] } else { &line[..] };
                    lines.push(unstuffed.to_string());
                }
                stats.messages.lock().unwrap().push(Received {
                    from: std::mem::take(&mut from),
                    to: std::mem::take(&mut to),
                    data: lines.join("\r\n"),
                });
                state = State::Authenticated;
                reply(&mut stream, "250 2.0.0 OK queued\r\n").await?;
            }
            "RSET" => {
                stats.resets.fetch_add(1, Ordering::SeqCst);
                from.clear();
                to.clear();
                if state != State::Connected && state != State::Greeted {
                    state = State::Authenticated;
                }
                reply(&mut stream, "250 2.0.0 OK\r\n").await?;
            }
            "NOOP" => reply(&mut stream, "250 2.0.0 OK\r\n").await?,
            "QUIT" => {
                stats.quits.fetch_add(1, Ordering::SeqCst);
                return reply(&mut stream, "221 2.0.0 Bye\r\n").await;
            }
            _ => reply(&mut stream, "503 5.5.1 Bad sequence of commands\r\n").await?,
        }
    }

    Ok(())
}

fn address_of(line: &str) -> String {
    match (line.find('<'), line.rfind('>')) {
        (Some(start), Some(end)) if start < end => line[start + 1..end].to_string(),
        _ => String::new(),
    }
}
