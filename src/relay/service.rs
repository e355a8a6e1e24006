use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::log_error;
use crate::relay::{
    Message, OperationOutcome, OutcomeMapper, Redirect, RelayCoordinator, SessionBuilder,
    SessionCell, SmtpSessionBuilder,
};

/// Session cell, coordinator and mapper wired together for request handlers
pub struct RelayService<B: SessionBuilder> {
    cell: Arc<SessionCell<B>>,
    coordinator: RelayCoordinator,
    mapper: OutcomeMapper,
}

impl RelayService<SmtpSessionBuilder> {
    /// Service relaying through the configured SMTP server
    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(
            SmtpSessionBuilder::new(config.clone()),
            config.mail.source_address.clone(),
            config.mail.target_address.clone(),
        )
    }
}

impl<B: SessionBuilder> RelayService<B> {
    pub fn new(builder: B, source_address: String, target_address: String) -> Self {
        Self {
            cell: Arc::new(SessionCell::new(builder)),
            mapper: OutcomeMapper::new(target_address.clone()),
            coordinator: RelayCoordinator::new(source_address, target_address),
        }
    }

    /// The session cell, shared with the shutdown watcher
    pub fn cell(&self) -> Arc<SessionCell<B>> {
        self.cell.clone()
    }

    /// Relay one message and report how it went
    pub async fn send(&self, message: &Message, cancel: &CancellationToken) -> OperationOutcome {
        match self.cell.get().await {
            Ok(session) => self.coordinator.relay(&session, message, cancel).await,
            Err(e) => OperationOutcome::SetupFailure(e),
        }
    }

    /// Relay one message and pick the redirect for the caller
    pub async fn handle(&self, message: &Message, cancel: &CancellationToken) -> Redirect {
        let outcome = self.send(message, cancel).await;
        if !outcome.is_success() {
            log_error!("POST /email failed for sender {:?}: {}", message.sender, outcome);
        }
        self.mapper.map(&outcome, message)
    }
}
