use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::relay::{RelayTransport, SessionBuilder, SessionCell};
use crate::{log_error, log_info};

/// Closes the relay session once the process starts shutting down
///
/// QUIT waits its turn on the session's operation lock, so it never lands
/// between the steps of a send. The returned handle finishes after the QUIT
/// attempt, so the entrypoint can wait for it before exiting.
pub fn spawn_shutdown_watcher<B: SessionBuilder>(
    cell: Arc<SessionCell<B>>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        shutdown.cancelled().await;
        close_session(&cell).await;
    })
}

/// Send QUIT on the established session, if there is one
async fn close_session<B: SessionBuilder>(cell: &SessionCell<B>) {
    let Some(session) = cell.established() else {
        return;
    };

    log_info!("Shutting down SMTP client");
    let _operation = session.operation().await;
    let mut transport = session.wire().await;
    if let Err(e) = transport.quit().await {
        log_error!("SMTP client shutdown failed: {}", e);
    }
}
