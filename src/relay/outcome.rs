use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::fmt;
use std::sync::Arc;

use crate::relay::{Message, SetupError, Step, StepError};

/// Characters left as-is in mailto query values: RFC 3986 unreserved only
///
/// Stricter than path escaping on purpose: `&`, `=` and `+` in user text are
/// escaped too, so they cannot end or split the `subject`/`body` parameters.
const MAILTO_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// How one relay attempt ended
#[derive(Debug)]
pub enum OperationOutcome {
    Success,
    /// The session could never be established
    SetupFailure(Arc<SetupError>),
    /// The relay rejected a step, or the step's exchange failed
    StepFailure { step: Step, error: StepError },
    /// The request was abandoned; `step` is the one that was in flight or about to start
    Cancelled { step: Step },
}

impl OperationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, OperationOutcome::Success)
    }
}

impl fmt::Display for OperationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "sent"),
            Self::SetupFailure(e) => write!(f, "session setup failed: {}", e),
            Self::StepFailure { step, error } => write!(f, "{} step failed: {}", step, error),
            Self::Cancelled { step } => write!(f, "request was cancelled during {} step", step),
        }
    }
}

/// HTTP status used for a redirect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectStatus {
    /// 302, after the mail was accepted
    Found,
    /// 303, to the manual-send fallback
    SeeOther,
}

impl RedirectStatus {
    pub fn code(self) -> u16 {
        match self {
            RedirectStatus::Found => 302,
            RedirectStatus::SeeOther => 303,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            RedirectStatus::Found => "Found",
            RedirectStatus::SeeOther => "See Other",
        }
    }
}

/// Where the caller is sent once the relay attempt is over
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub location: String,
    pub status: RedirectStatus,
}

/// Maps every outcome to exactly one redirect
#[derive(Debug, Clone)]
pub struct OutcomeMapper {
    destination: String,
}

impl OutcomeMapper {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
        }
    }

    pub fn map(&self, outcome: &OperationOutcome, message: &Message) -> Redirect {
        match outcome {
            OperationOutcome::Success => Redirect {
                location: message.success_redirect_url.clone(),
                status: RedirectStatus::Found,
            },
            OperationOutcome::SetupFailure(_)
            | OperationOutcome::StepFailure { .. }
            | OperationOutcome::Cancelled { .. } => self.fallback(message),
        }
    }

    /// mailto link letting the visitor send the message themselves
    pub fn fallback(&self, message: &Message) -> Redirect {
        Redirect {
            location: format!(
                "mailto:{}?subject={}&body={}",
                self.destination,
                utf8_percent_encode(&message.subject, MAILTO_VALUE),
                utf8_percent_encode(&message.body, MAILTO_VALUE),
            ),
            status: RedirectStatus::SeeOther,
        }
    }
}
