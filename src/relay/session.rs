//! The shared relay session and the protocol surface the coordinator drives

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::smtp::SmtpClientError;

/// Protocol operations available on an established, authenticated session
///
/// Every method is one request/response exchange (or, for `write_body`, one
/// write) on the underlying transport. Implementations must not reorder them.
#[async_trait]
pub trait RelayTransport: Send + 'static {
    /// Announce the envelope sender
    async fn mail_from(&mut self, address: &str) -> Result<(), SmtpClientError>;

    /// Announce one envelope recipient
    async fn rcpt_to(&mut self, address: &str) -> Result<(), SmtpClientError>;

    /// Open the body-write channel
    async fn open_body(&mut self) -> Result<(), SmtpClientError>;

    /// Write message payload into the open body
    async fn write_body(&mut self, body: &[u8]) -> Result<(), SmtpClientError>;

    /// Close the body and commit the transaction
    async fn commit_body(&mut self) -> Result<(), SmtpClientError>;

    /// Abort any uncommitted transaction
    async fn reset(&mut self) -> Result<(), SmtpClientError>;

    /// Politely end the session
    async fn quit(&mut self) -> Result<(), SmtpClientError>;
}

/// Handle to the one live relay session
///
/// Cloning the handle shares the session. Two locks guard it:
/// - the operation lock, held for a whole send sequence or the final QUIT,
///   granted in arrival order;
/// - the wire lock around the transport, held by whoever is exchanging bytes
///   with the relay.
pub struct SessionHandle<T> {
    operation: Arc<Mutex<()>>,
    wire: Arc<Mutex<T>>,
}

impl<T> Clone for SessionHandle<T> {
    fn clone(&self) -> Self {
        Self {
            operation: self.operation.clone(),
            wire: self.wire.clone(),
        }
    }
}

impl<T: RelayTransport> SessionHandle<T> {
    pub fn new(transport: T) -> Self {
        Self {
            operation: Arc::new(Mutex::new(())),
            wire: Arc::new(Mutex::new(transport)),
        }
    }

    /// Wait for exclusive use of the session for one operation
    pub async fn operation(&self) -> OwnedMutexGuard<()> {
        self.operation.clone().lock_owned().await
    }

    /// Take the wire, waiting for any exchange still in flight
    pub async fn wire(&self) -> OwnedMutexGuard<T> {
        self.wire.clone().lock_owned().await
    }

    /// Whether two handles refer to the same session
    pub fn same_session(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.wire, &other.wire)
    }
}

impl<T> std::fmt::Debug for SessionHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle").finish_non_exhaustive()
    }
}
