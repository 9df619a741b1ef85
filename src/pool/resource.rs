//! One pooled slot: a connection, its message budget, and the task that
//! drives both.
//!
//! A resource moves through `Fresh → Connecting → Ready → Sending` and
//! ends in one of three ways: `Exhausted` when its message budget is
//! spent, `Failed` when the connection errors, or retired when the server
//! ends the idle session. The submission's completion channel is consumed
//! by the first outcome, so a late teardown can never reach a caller that
//! was already answered.

use tokio::sync::{mpsc, oneshot};

use crate::auth::Credentials;
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::transport::SmtpConnection;
use crate::types::{normalize_message_id, MailSource, SendInfo};

/// Identifier assigned to a resource at creation, monotonic per pool.
pub(crate) type ResourceId = u64;

/// One queued mail send: the mail and its one-shot completion channel.
pub(crate) struct Submission {
    pub(crate) mail: Box<dyn MailSource>,
    pub(crate) done: oneshot::Sender<SmtpResult<SendInfo>>,
}

/// Work handed to a resource by the dispatcher.
pub(crate) enum Assignment {
    /// Send this mail.
    Deliver(Submission),
    /// Quit the connection and end the task.
    Shutdown,
}

/// Terminal and progress notifications a resource reports back.
#[derive(Debug)]
pub(crate) enum ResourceEventKind {
    /// A send completed; the resource wants re-admission.
    SendSucceeded,
    /// The message budget is spent; the connection was quit.
    Exhausted { messages: usize },
    /// The connection failed; the in-flight caller already has the error.
    Failed { error: String },
    /// The server ended the idle session; nothing was in flight.
    Retired,
}

/// A notification tagged with the reporting resource.
#[derive(Debug)]
pub(crate) struct ResourceEvent {
    pub(crate) id: ResourceId,
    pub(crate) kind: ResourceEventKind,
}

/// The per-slot task state.
pub(crate) struct PoolResource {
    id: ResourceId,
    connection: Box<dyn SmtpConnection>,
    credentials: Option<Credentials>,
    max_messages: usize,
    messages: usize,
    connected: bool,
    assignments: mpsc::UnboundedReceiver<Assignment>,
    events: mpsc::UnboundedSender<ResourceEvent>,
}

impl PoolResource {
    pub(crate) fn new(
        id: ResourceId,
        connection: Box<dyn SmtpConnection>,
        credentials: Option<Credentials>,
        max_messages: usize,
        assignments: mpsc::UnboundedReceiver<Assignment>,
        events: mpsc::UnboundedSender<ResourceEvent>,
    ) -> Self {
        Self {
            id,
            connection,
            credentials,
            max_messages,
            messages: 0,
            connected: false,
            assignments,
            events,
        }
    }

    /// Drives the resource until a terminal state.
    pub(crate) async fn run(mut self) {
        loop {
            let assignment = if self.connected {
                tokio::select! {
                    biased;
                    assignment = self.assignments.recv() => assignment,
                    _ = self.connection.wait_end() => {
                        // Server ended the idle session; retire quietly.
                        self.connection.quit().await;
                        self.notify(ResourceEventKind::Retired);
                        return;
                    }
                }
            } else {
                self.assignments.recv().await
            };

            match assignment {
                Some(Assignment::Deliver(submission)) => {
                    if !self.deliver(submission).await {
                        return;
                    }
                }
                Some(Assignment::Shutdown) | None => {
                    self.connection.quit().await;
                    return;
                }
            }
        }
    }

    /// Handles one submission; returns false when the resource is done.
    async fn deliver(&mut self, submission: Submission) -> bool {
        let Submission { mut mail, done } = submission;

        if !self.connected {
            if let Err(err) = self.establish().await {
                let summary = err.to_string();
                let _ = done.send(Err(err));
                self.connection.quit().await;
                self.notify(ResourceEventKind::Failed { error: summary });
                return false;
            }
            self.connected = true;
        }

        let message_id = normalize_message_id(mail.message_id().as_deref());
        let outcome = async {
            let envelope = mail.envelope()?;
            let body = mail.body()?;
            let response = self.connection.send(&envelope, body).await?;
            Ok::<_, SmtpError>((envelope, response))
        }
        .await;

        // Failed sends count against the budget too.
        self.messages += 1;

        match outcome {
            Ok((envelope, response)) => {
                let _ = done.send(Ok(SendInfo {
                    envelope,
                    message_id,
                    response,
                }));

                if self.messages >= self.max_messages {
                    self.connection.quit().await;
                    self.notify(ResourceEventKind::Exhausted {
                        messages: self.messages,
                    });
                    false
                } else {
                    self.notify(ResourceEventKind::SendSucceeded);
                    true
                }
            }
            Err(err) => {
                let summary = err.to_string();
                let _ = done.send(Err(err));
                self.connection.quit().await;
                self.notify(ResourceEventKind::Failed { error: summary });
                false
            }
        }
    }

    /// Connects and logs in. A connection that ends during this phase is
    /// reported as a connect failure, not as a silent retirement.
    async fn establish(&mut self) -> SmtpResult<()> {
        let remap = |err: SmtpError, phase: &str| {
            if err.kind() == SmtpErrorKind::ConnectionClosed {
                SmtpError::connect(format!("Connection ended during {}: {}", phase, err.message()))
            } else {
                err
            }
        };

        self.connection
            .connect()
            .await
            .map_err(|e| remap(e, "connect"))?;

        if let Some(credentials) = &self.credentials {
            self.connection
                .login(credentials)
                .await
                .map_err(|e| match e.kind() {
                    SmtpErrorKind::ConnectionClosed => {
                        SmtpError::auth(format!("Connection ended during login: {}", e.message()))
                    }
                    _ => e,
                })?;
        }

        Ok(())
    }

    fn notify(&self, kind: ResourceEventKind) {
        let _ = self.events.send(ResourceEvent { id: self.id, kind });
    }
}
