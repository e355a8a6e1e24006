//! Serialized relay of one message over the shared session
//!
//! Only one operation runs its step sequence at a time; the others queue on
//! the session's operation lock in arrival order. Each step runs as its own
//! task and is raced against the operation's cancellation token. When the
//! token wins the step task is left running (it is not joined) and a reset is
//! queued behind it on the wire lock, so the relay sees the abandoned exchange
//! complete before the RSET. A rejected step is followed by a reset as well,
//! leaving the session ready for the next operation.
//!
//! SMTP cannot abort an open DATA section: the reset has to terminate the
//! body first. A cancellation that lands once the relay has answered DATA
//! with 354 therefore commits whatever body was written so far (possibly
//! empty) before the RSET, and the caller still sees `Cancelled`.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::relay::{Message, OperationOutcome, RelayTransport, SessionHandle};
use crate::smtp::SmtpClientError;
use crate::{log_warn, verbose};

/// One exchange of the send sequence, in protocol order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Sender,
    Recipient,
    OpenBody,
    WriteBody,
    CommitBody,
}

impl Step {
    pub const SEQUENCE: [Step; 5] = [
        Step::Sender,
        Step::Recipient,
        Step::OpenBody,
        Step::WriteBody,
        Step::CommitBody,
    ];

    fn describe(self) -> &'static str {
        match self {
            Step::Sender => "Setting SMTP email sender",
            Step::Recipient => "Setting SMTP email receiver",
            Step::OpenBody => "Starting SMTP email body",
            Step::WriteBody => "Writing SMTP email body",
            Step::CommitBody => "Sending SMTP email",
        }
    }

    async fn apply<T: RelayTransport>(
        self,
        transport: &mut T,
        envelope: &Envelope,
    ) -> Result<(), SmtpClientError> {
        match self {
            Step::Sender => transport.mail_from(&envelope.sender).await,
            Step::Recipient => transport.rcpt_to(&envelope.recipient).await,
            Step::OpenBody => transport.open_body().await,
            Step::WriteBody => transport.write_body(envelope.body.as_bytes()).await,
            Step::CommitBody => transport.commit_body().await,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Sender => "sender",
            Step::Recipient => "recipient",
            Step::OpenBody => "body-open",
            Step::WriteBody => "body-write",
            Step::CommitBody => "commit",
        };
        f.write_str(name)
    }
}

/// Why a single step did not complete
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Smtp(#[from] SmtpClientError),
    #[error("step task ended abnormally: {0}")]
    Task(String),
}

/// Result of racing one step against cancellation
#[derive(Debug)]
pub enum StepOutcome {
    Completed,
    Failed(StepError),
    Cancelled,
}

/// Addresses and rendered payload for one operation
struct Envelope {
    sender: String,
    recipient: String,
    body: String,
}

/// Drives the send sequence on the shared session, one operation at a time
pub struct RelayCoordinator {
    /// Envelope sender, the authenticated account
    source_address: String,
    /// Fixed destination mailbox
    target_address: String,
}

impl RelayCoordinator {
    pub fn new(source_address: impl Into<String>, target_address: impl Into<String>) -> Self {
        Self {
            source_address: source_address.into(),
            target_address: target_address.into(),
        }
    }

    /// Relay `message` over `session`, giving up at the next step boundary
    /// once `cancel` fires
    pub async fn relay<T: RelayTransport>(
        &self,
        session: &SessionHandle<T>,
        message: &Message,
        cancel: &CancellationToken,
    ) -> OperationOutcome {
        let envelope = Arc::new(Envelope {
            sender: self.source_address.clone(),
            recipient: self.target_address.clone(),
            body: message.render(&self.target_address),
        });

        let _operation = session.operation().await;

        for step in Step::SEQUENCE {
            verbose!("{}", step.describe());
            match run_step(step, session, &envelope, cancel).await {
                StepOutcome::Completed => {}
                StepOutcome::Failed(error) => {
                    verbose!("{} step failed: {}", step, error);
                    reset_transaction(session, step).await;
                    return OperationOutcome::StepFailure { step, error };
                }
                StepOutcome::Cancelled => {
                    verbose!("Aborting SMTP email during {} step", step);
                    reset_transaction(session, step).await;
                    return OperationOutcome::Cancelled { step };
                }
            }
        }

        OperationOutcome::Success
    }
}

/// Run one step as its own task and race it against `cancel`
async fn run_step<T: RelayTransport>(
    step: Step,
    session: &SessionHandle<T>,
    envelope: &Arc<Envelope>,
    cancel: &CancellationToken,
) -> StepOutcome {
    // Level-triggered: a token that already fired never starts the step
    if cancel.is_cancelled() {
        return StepOutcome::Cancelled;
    }

    let session = session.clone();
    let envelope = envelope.clone();
    let task = tokio::spawn(async move {
        let mut transport = session.wire().await;
        step.apply(&mut *transport, &envelope).await
    });

    tokio::select! {
        biased;
        _ = cancel.cancelled() => StepOutcome::Cancelled,
        joined = task => match joined {
            Ok(Ok(())) => StepOutcome::Completed,
            Ok(Err(e)) => StepOutcome::Failed(e.into()),
            Err(e) => StepOutcome::Failed(StepError::Task(e.to_string())),
        },
    }
}

/// Discard the relay-side transaction after a failed or cancelled step
async fn reset_transaction<T: RelayTransport>(session: &SessionHandle<T>, step: Step) {
    let mut transport = session.wire().await;
    if let Err(e) = transport.reset().await {
        log_warn!("SMTP reset after {} step failed: {}", step, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Mail(String),
        Rcpt(String),
        Open,
        Write(String),
        Commit,
        Reset,
    }

    /// Records every exchange; optionally stalls or rejects a chosen step
    struct ScriptedTransport {
        events: Arc<StdMutex<Vec<Event>>>,
        reject: Option<Step>,
        stall: Option<(Step, Duration)>,
    }

    impl ScriptedTransport {
        async fn exchange(&mut self, step: Step, event: Event) -> Result<(), SmtpClientError> {
            if let Some((stalled, delay)) = self.stall {
                if stalled == step {
                    tokio::time::sleep(delay).await;
                }
            }
            self.events.lock().unwrap().push(event);
            if self.reject == Some(step) {
                return Err(SmtpClientError::Rejected {
                    command: "RCPT TO",
                    reply: crate::smtp::SmtpReply {
                        code: 550,
                        lines: vec!["no such user".to_string()],
                    },
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RelayTransport for ScriptedTransport {
        async fn mail_from(&mut self, address: &str) -> Result<(), SmtpClientError> {
            self.exchange(Step::Sender, Event::Mail(address.to_string())).await
        }
        async fn rcpt_to(&mut self, address: &str) -> Result<(), SmtpClientError> {
            self.exchange(Step::Recipient, Event::Rcpt(address.to_string())).await
        }
        async fn open_body(&mut self) -> Result<(), SmtpClientError> {
            self.exchange(Step::OpenBody, Event::Open).await
        }
        async fn write_body(&mut self, body: &[u8]) -> Result<(), SmtpClientError> {
            let body = String::from_utf8_lossy(body).to_string();
            self.exchange(Step::WriteBody, Event::Write(body)).await
        }
        async fn commit_body(&mut self) -> Result<(), SmtpClientError> {
            self.exchange(Step::CommitBody, Event::Commit).await
        }
        async fn reset(&mut self) -> Result<(), SmtpClientError> {
            self.events.lock().unwrap().push(Event::Reset);
            Ok(())
        }
        async fn quit(&mut self) -> Result<(), SmtpClientError> {
            Ok(())
        }
    }

    fn session(
        reject: Option<Step>,
        stall: Option<(Step, Duration)>,
    ) -> (SessionHandle<ScriptedTransport>, Arc<StdMutex<Vec<Event>>>) {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let transport = ScriptedTransport {
            events: events.clone(),
            reject,
            stall,
        };
        (SessionHandle::new(transport), events)
    }

    fn message(subject: &str) -> Message {
        Message {
            sender: "Test sender".to_string(),
            subject: subject.to_string(),
            body: "Test body".to_string(),
            success_redirect_url: "http://localhost/success".to_string(),
        }
    }

    fn coordinator() -> RelayCoordinator {
        RelayCoordinator::new("source@test.com", "target@test.com")
    }

    #[tokio::test]
    async fn test_successful_sequence() {
        let (session, events) = session(None, None);
        let outcome = coordinator()
            .relay(&session, &message("Test subject"), &CancellationToken::new())
            .await;

        assert!(matches!(outcome, OperationOutcome::Success));
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                Event::Mail("source@test.com".to_string()),
                Event::Rcpt("target@test.com".to_string()),
                Event::Open,
                Event::Write(
                    "To: target@test.com\r\nSubject: Test subject\r\n\r\nTest body\r\n\r\nSent by Test sender"
                        .to_string()
                ),
                Event::Commit,
            ]
        );
    }

    #[tokio::test]
    async fn test_rejected_step_stops_sequence_and_resets() {
        let (session, events) = session(Some(Step::Recipient), None);
        let outcome = coordinator()
            .relay(&session, &message("Test subject"), &CancellationToken::new())
            .await;

        match outcome {
            OperationOutcome::StepFailure { step, .. } => assert_eq!(step, Step::Recipient),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                Event::Mail("source@test.com".to_string()),
                Event::Rcpt("target@test.com".to_string()),
                Event::Reset,
            ]
        );
    }

    #[tokio::test]
    async fn test_already_cancelled_never_starts() {
        let (session, events) = session(None, None);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = coordinator().relay(&session, &message("x"), &cancel).await;

        assert!(matches!(outcome, OperationOutcome::Cancelled { step: Step::Sender }));
        assert_eq!(*events.lock().unwrap(), vec![Event::Reset]);
    }

    #[tokio::test]
    async fn test_cancel_mid_sequence_resets() {
        let (session, events) = session(None, Some((Step::OpenBody, Duration::from_millis(200))));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let outcome = coordinator().relay(&session, &message("x"), &cancel).await;

        assert!(matches!(outcome, OperationOutcome::Cancelled { step: Step::OpenBody }));
        // The abandoned body-open finishes on the wire before the reset
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                Event::Mail("source@test.com".to_string()),
                Event::Rcpt("target@test.com".to_string()),
                Event::Open,
                Event::Reset,
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_operations_never_interleave() {
        let (session, events) = session(None, None);
        let coordinator = Arc::new(coordinator());

        let mut tasks = Vec::new();
        for i in 0..16 {
            let coordinator = coordinator.clone();
            let session = session.clone();
            tasks.push(tokio::spawn(async move {
                coordinator
                    .relay(&session, &message(&format!("subject {}", i)), &CancellationToken::new())
                    .await
            }));
        }
        for task in tasks {
            assert!(matches!(task.await.unwrap(), OperationOutcome::Success));
        }

        let events = events.lock().unwrap().clone();
        assert_eq!(events.len(), 16 * 5);
        for operation in events.chunks(5) {
            assert!(matches!(operation[0], Event::Mail(_)));
            assert!(matches!(operation[1], Event::Rcpt(_)));
            assert_eq!(operation[2], Event::Open);
            assert!(matches!(operation[3], Event::Write(_)));
            assert_eq!(operation[4], Event::Commit);
        }
    }
}
