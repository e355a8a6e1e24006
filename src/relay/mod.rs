//! Relay-session engine: one shared SMTP session, serialized and cancellable

mod builder;
mod cell;
mod coordinator;
mod message;
mod outcome;
mod service;
mod session;
mod shutdown;

pub use builder::{SessionBuilder, SetupError, SmtpSession, SmtpSessionBuilder};
pub use cell::{SessionCell, SessionResult};
pub use coordinator::{RelayCoordinator, Step, StepError, StepOutcome};
pub use message::Message;
pub use outcome::{OperationOutcome, OutcomeMapper, Redirect, RedirectStatus};
pub use service::RelayService;
pub use session::{RelayTransport, SessionHandle};
pub use shutdown::spawn_shutdown_watcher;
