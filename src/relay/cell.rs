use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::relay::{SessionBuilder, SessionHandle, SetupError};
use crate::{log_error, log_info};

/// Either the live session or the reason it could never be set up
pub type SessionResult<T> = Result<SessionHandle<T>, Arc<SetupError>>;

/// Lazily built, process-lifetime home of the relay session
///
/// The first `get` runs the builder; concurrent callers wait on that same
/// run and every caller afterwards sees the cached result. A failed setup is
/// cached as well and never retried.
pub struct SessionCell<B: SessionBuilder> {
    builder: B,
    session: OnceCell<SessionResult<B::Transport>>,
}

impl<B: SessionBuilder> SessionCell<B> {
    pub fn new(builder: B) -> Self {
        Self {
            builder,
            session: OnceCell::new(),
        }
    }

    /// Get the session, building it on first use
    pub async fn get(&self) -> SessionResult<B::Transport> {
        self.session
            .get_or_init(|| async {
                log_info!("Setting up SMTP client");
                match self.builder.build().await {
                    Ok(transport) => {
                        log_info!("SMTP client is ready");
                        Ok(SessionHandle::new(transport))
                    }
                    Err(e) => {
                        log_error!("SMTP client setup failed: {}", e);
                        Err(Arc::new(e))
                    }
                }
            })
            .await
            .clone()
    }

    /// The session, if one was successfully established; never triggers a build
    pub fn established(&self) -> Option<SessionHandle<B::Transport>> {
        match self.session.get() {
            Some(Ok(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Whether setup has run, successfully or not
    pub fn is_initialized(&self) -> bool {
        self.session.initialized()
    }
}
