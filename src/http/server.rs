use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::http::{HttpApp, HttpResponse, RequestError, RequestParser};
use crate::relay::SessionBuilder;
use crate::{log_error, log_info, verbose};

/// How long a client may take to send its request
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Accept connections until `shutdown` fires
///
/// Every request is handled on its own task with a token derived from
/// `shutdown`, so in-flight relays are abandoned when the process stops.
pub async fn run_http_server<B: SessionBuilder>(
    listener: TcpListener,
    app: Arc<HttpApp<B>>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    log_info!("HTTP server listening on {}", listener.local_addr()?);

    loop {
        let (socket, addr) = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    log_error!("Failed to accept HTTP connection: {}", e);
                    continue;
                }
            },
        };
        verbose!("New HTTP connection from {}", addr);

        let app = app.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, addr, app, shutdown).await {
                verbose!("Error handling HTTP connection from {}: {}", addr, e);
            }
        });
    }

    log_info!("HTTP server stopped accepting connections");
    Ok(())
}

/// Serve a single request, then close the connection
async fn handle_connection<B: SessionBuilder>(
    socket: TcpStream,
    addr: SocketAddr,
    app: Arc<HttpApp<B>>,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (mut reader, mut writer) = socket.into_split();

    let mut parser = RequestParser::new();
    let mut buf = vec![0u8; 8192];
    let request = loop {
        let n = tokio::time::timeout(READ_TIMEOUT, reader.read(&mut buf)).await??;
        if n == 0 {
            return Err(RequestError::Incomplete.into());
        }
        match parser.push(&buf[..n]) {
            Ok(Some(request)) => break request,
            Ok(None) => continue,
            Err(e) => {
                verbose!("Bad request from {}: {}", addr, e);
                writer
                    .write_all(&HttpResponse::bad_request(&e.to_string()).to_bytes())
                    .await?;
                writer.shutdown().await?;
                return Ok(());
            }
        }
    };

    let cancel = shutdown.child_token();
    let watcher = tokio::spawn(watch_request(reader, cancel.clone(), app.request_timeout()));

    let response = app.respond(&request, &cancel).await;
    watcher.abort();

    writer.write_all(&response.to_bytes()).await?;
    writer.shutdown().await?;
    Ok(())
}

/// Cancel `cancel` when the deadline passes or the client goes away
async fn watch_request(
    mut reader: OwnedReadHalf,
    cancel: CancellationToken,
    timeout: Option<Duration>,
) {
    let deadline = async {
        match timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = deadline => {
            verbose!("Request processing timed out");
            cancel.cancel();
        }
        _ = wait_for_disconnect(&mut reader) => {
            verbose!("Client disconnected before the response");
            cancel.cancel();
        }
    }
}

/// Resolves once the peer closes its side; stray bytes are discarded
async fn wait_for_disconnect(reader: &mut OwnedReadHalf) {
    let mut buf = [0u8; 512];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}
