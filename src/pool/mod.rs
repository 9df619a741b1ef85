//! The pooled SMTP sender.
//!
//! [`SmtpPool`] multiplexes an unbounded stream of submissions over a
//! bounded set of authenticated connections. Each connection carries at
//! most `max_messages` sends before it is rotated out, dispatch order is
//! FIFO, and an optional rate limit caps dispatches per rolling second.
//! Failures are reported to the caller whose message was in flight; the
//! pool never retries.

pub(crate) mod dispatcher;
pub(crate) mod rate;
pub(crate) mod resource;

use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::config::PoolOptions;
use crate::errors::{SmtpError, SmtpResult};
use crate::observability::{EventSink, PoolEvent};
use crate::transport::{ConnectionFactory, TcpConnectionFactory, CLIENT_VERSION};
use crate::types::{MailSource, PoolStatus, SendInfo};

use dispatcher::{Dispatcher, PoolCommand};
use resource::Submission;

/// Display name of this transport.
pub const NAME: &str = "SMTP (pool)";

/// Handle to a pooled SMTP sender.
///
/// Cheap to clone; all clones share one pool. The pool runs on the Tokio
/// runtime the handle was created in.
#[derive(Clone)]
pub struct SmtpPool {
    options: Arc<PoolOptions>,
    factory: Arc<dyn ConnectionFactory>,
    events: EventSink,
    commands: mpsc::UnboundedSender<PoolCommand>,
}

impl SmtpPool {
    /// Creates a pool over TCP connections.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(options: PoolOptions) -> SmtpResult<Self> {
        let options = Arc::new(options.normalize()?);
        let events = EventSink::new();
        let factory: Arc<dyn ConnectionFactory> =
            Arc::new(TcpConnectionFactory::new(options.clone(), events.clone()));
        Self::start(options, factory, events)
    }

    /// Creates a pool from an `smtp://` or `smtps://` URL.
    pub fn from_url(url: &str) -> SmtpResult<Self> {
        Self::new(PoolOptions::from_url(url)?)
    }

    /// Creates a pool over a custom connection factory.
    ///
    /// The seam used by the test suite; also useful for embedders that
    /// provide their own session implementation.
    pub fn with_connection_factory(
        options: PoolOptions,
        factory: Arc<dyn ConnectionFactory>,
    ) -> SmtpResult<Self> {
        let options = Arc::new(options.normalize()?);
        Self::start(options, factory, EventSink::new())
    }

    fn start(
        options: Arc<PoolOptions>,
        factory: Arc<dyn ConnectionFactory>,
        events: EventSink,
    ) -> SmtpResult<Self> {
        let credentials = options.credentials()?;
        let (commands, command_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(
            options.clone(),
            credentials,
            factory.clone(),
            events.clone(),
            command_rx,
        );
        tokio::spawn(dispatcher.run());

        Ok(Self {
            options,
            factory,
            events,
            commands,
        })
    }

    /// Returns the transport's display name.
    pub fn name(&self) -> &'static str {
        NAME
    }

    /// Returns the pool version combined with the connection client
    /// version.
    pub fn version(&self) -> String {
        format!("{}[client:{}]", env!("CARGO_PKG_VERSION"), CLIENT_VERSION)
    }

    /// Submits a mail for sending.
    ///
    /// The submission joins the FIFO queue immediately, before the
    /// returned future is first polled; awaiting the future yields the
    /// outcome exactly once. After [`close`](Self::close) the future
    /// resolves immediately with a pool-closed error.
    pub fn send(
        &self,
        mail: impl MailSource,
    ) -> impl Future<Output = SmtpResult<SendInfo>> + Send + 'static {
        let (done, outcome) = oneshot::channel();
        let _ = self.commands.send(PoolCommand::Send(Submission {
            mail: Box::new(mail),
            done,
        }));

        async move {
            match outcome.await {
                Ok(result) => result,
                // The dispatcher is gone; nothing will ever dispatch.
                Err(_) => Err(SmtpError::pool_closed()),
            }
        }
    }

    /// Probes the server: connects and, when credentials are configured,
    /// logs in. The probe session never joins the pool and is closed on
    /// success and on failure.
    pub async fn verify(&self) -> SmtpResult<bool> {
        let mut connection = self.factory.create();
        let result = async {
            connection.connect().await?;
            if let Some(credentials) = self.options.credentials()? {
                connection.login(&credentials).await?;
            }
            Ok(true)
        }
        .await;
        connection.quit().await;
        result
    }

    /// Closes the pool.
    ///
    /// Queued submissions fail with a pool-closed error, idle connections
    /// are shut down, and in-flight sends run to completion before their
    /// connections close. Idempotent; resolves once the queue is drained.
    pub async fn close(&self) {
        let (ack, done) = oneshot::channel();
        if self
            .commands
            .send(PoolCommand::Close { ack })
            .is_ok()
        {
            let _ = done.await;
        }
    }

    /// Returns true when a send issued now would dispatch without
    /// waiting: some connection is available, or a new one could be
    /// created.
    pub async fn is_idle(&self) -> bool {
        let (reply, answer) = oneshot::channel();
        if self.commands.send(PoolCommand::IsIdle(reply)).is_err() {
            return false;
        }
        answer.await.unwrap_or(false)
    }

    /// Returns a snapshot of the pool's occupancy.
    pub async fn status(&self) -> PoolStatus {
        let (reply, answer) = oneshot::channel();
        if self.commands.send(PoolCommand::Status(reply)).is_err() {
            return PoolStatus::default();
        }
        answer.await.unwrap_or_default()
    }

    /// Subscribes to the pool's log and idle events.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SmtpErrorKind;
    use crate::mocks::{MockServer, SendOutcome};
    use crate::observability::LogEventKind;
    use crate::types::{Envelope, Mail};
    use std::time::Duration;
    use tokio::time::{sleep, Instant};

    fn pool_with(server: &Arc<MockServer>, options: PoolOptions) -> SmtpPool {
        SmtpPool::with_connection_factory(options, MockServer::factory(server)).unwrap()
    }

    fn mail(from: &str, to: &str) -> Mail {
        Mail::new(Envelope::new(from, vec![to.to_string()]), b"hello\n".to_vec())
    }

    #[tokio::test(start_paused = true)]
    async fn single_send_delivers_body_and_message_id() {
        let server = MockServer::new();
        let pool = pool_with(
            &server,
            PoolOptions::builder()
                .host("localhost")
                .port(2525)
                .credentials("testuser", "testpass")
                .build()
                .unwrap(),
        );

        let body = "teretere, vana kere\n".repeat(1023);
        let mail = Mail::new(
            Envelope::new("sender@example.com", vec!["recipient@example.com".into()]),
            body.clone().into_bytes(),
        )
        .with_message_id("<abc.123@example.com>");

        let info = pool.send(mail).await.unwrap();
        assert_eq!(info.message_id, "abc.123@example.com");
        assert_eq!(info.envelope.from.as_deref(), Some("sender@example.com"));
        assert!(info.response.starts_with("250"));

        let sends = server.sends();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].body, body.as_bytes());

        pool.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn fan_out_uses_multiple_connections() {
        let server = MockServer::new();
        let pool = pool_with(&server, PoolOptions::default());

        let sends: Vec<_> = (0..100)
            .map(|i| pool.send(mail(&format!("sender{}@example.com", i), "rcpt@example.com")))
            .collect();
        for send in sends {
            send.await.unwrap();
        }

        assert!(server.connections_created() > 1);
        assert!(server.connections_created() <= 5);
        assert!(server.max_concurrent() <= 5);

        let per_connection = server.sends_per_connection();
        let total: usize = per_connection.iter().map(|(_, count)| count).sum();
        assert_eq!(total, 100);
        for (connection, count) in per_connection {
            assert!(count > 1, "connection #{} sent only {}", connection, count);
        }

        pool.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn mixed_failures_report_per_submission() {
        let server = MockServer::new();
        server.script(|envelope| {
            if envelope.from.as_deref() == Some("test@invalid.sender") {
                SendOutcome::Reject(550, "Sender rejected".into())
            } else {
                SendOutcome::Accept
            }
        });
        let pool = pool_with(&server, PoolOptions::default());

        let sends: Vec<_> = (0..40)
            .map(|i| {
                let from = if i % 2 == 0 {
                    "test@valid.sender"
                } else {
                    "test@invalid.sender"
                };
                pool.send(mail(from, "rcpt@example.com"))
            })
            .collect();

        for (i, send) in sends.into_iter().enumerate() {
            let result = send.await;
            if i % 2 == 0 {
                assert!(result.is_ok(), "submission {} should succeed", i);
            } else {
                let err = result.expect_err("odd submissions must fail");
                assert_eq!(err.kind(), SmtpErrorKind::Send);
                assert_eq!(err.smtp_code(), Some(550));
            }
        }

        // The pool kept dispatching after every failure.
        assert_eq!(server.sends().len(), 20);
        pool.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn max_messages_rotates_connections() {
        let server = MockServer::new();
        let pool = pool_with(
            &server,
            PoolOptions::builder()
                .max_connections(1)
                .max_messages(5)
                .build()
                .unwrap(),
        );

        let sends: Vec<_> = (0..100)
            .map(|i| pool.send(mail(&format!("s{}@example.com", i), "rcpt@example.com")))
            .collect();
        for send in sends {
            send.await.unwrap();
        }

        // One resource at a time, rotated out every five messages.
        assert_eq!(server.max_concurrent(), 1);
        assert_eq!(server.connections_created(), 20);
        for (connection, count) in server.sends_per_connection() {
            assert_eq!(count, 5, "connection #{} exceeded its budget", connection);
        }

        pool.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_enforces_throughput_floor() {
        let server = MockServer::new();
        let pool = pool_with(
            &server,
            PoolOptions::builder()
                .max_connections(10)
                .rate_limit(50)
                .build()
                .unwrap(),
        );

        let start = Instant::now();
        let sends: Vec<_> = (0..500)
            .map(|i| pool.send(mail(&format!("s{}@example.com", i), "rcpt@example.com")))
            .collect();
        for send in sends {
            send.await.unwrap();
        }

        // 500 messages at 50/s need at least nine full windows after the
        // initial burst.
        assert!(
            start.elapsed() >= Duration::from_secs(9),
            "rate limit finished too fast: {:?}",
            start.elapsed()
        );
        pool.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_rejects_pending_submissions() {
        let server = MockServer::new();
        server.send_delay(Duration::from_millis(5));
        let pool = pool_with(
            &server,
            PoolOptions::builder().max_connections(1).build().unwrap(),
        );

        let sends: Vec<_> = (0..20)
            .map(|i| pool.send(mail(&format!("s{}@example.com", i), "rcpt@example.com")))
            .collect();
        pool.close().await;

        let mut succeeded = 0;
        let mut rejected = 0;
        for send in sends {
            match send.await {
                Ok(_) => succeeded += 1,
                Err(err) => {
                    assert_eq!(err.kind(), SmtpErrorKind::PoolClosed);
                    rejected += 1;
                }
            }
        }
        // The in-flight send completes; everything queued is returned.
        assert_eq!(succeeded, 1);
        assert_eq!(rejected, 19);

        // Close is idempotent and later sends fail immediately.
        pool.close().await;
        let err = pool
            .send(mail("late@example.com", "rcpt@example.com"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::PoolClosed);
        assert!(!pool.is_idle().await);
    }

    #[tokio::test(start_paused = true)]
    async fn socket_timeout_fails_one_submission_only() {
        let server = MockServer::new();
        server.stall_delay(Duration::from_millis(200));
        server.script(|envelope| {
            if envelope.to.iter().any(|to| to == "test+timeout@valid.recipient") {
                SendOutcome::Stall
            } else {
                SendOutcome::Accept
            }
        });
        let pool = pool_with(
            &server,
            PoolOptions::builder().max_connections(1).build().unwrap(),
        );

        pool.send(mail("a@example.com", "test@valid.recipient"))
            .await
            .unwrap();

        let err = pool
            .send(mail("a@example.com", "test+timeout@valid.recipient"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::SocketTimeout);

        // The pool replaces the dead connection and keeps going.
        pool.send(mail("a@example.com", "test@valid.recipient"))
            .await
            .unwrap();
        assert_eq!(server.connections_created(), 2);

        pool.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn kill_mid_queue_still_completes_every_submission() {
        let server = MockServer::new();
        server.send_delay(Duration::from_millis(10));
        let pool = pool_with(
            &server,
            PoolOptions::builder().max_connections(2).build().unwrap(),
        );

        let sends: Vec<_> = (0..10)
            .map(|i| pool.send(mail(&format!("s{}@example.com", i), "rcpt@example.com")))
            .collect();

        // Cut every socket once roughly half the messages are through.
        sleep(Duration::from_millis(35)).await;
        server.kill_connections();

        for send in sends {
            send.await.unwrap();
        }
        assert_eq!(server.sends().len(), 10);

        pool.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn killed_idle_connections_retire_and_are_replaced() {
        let server = MockServer::new();
        let pool = pool_with(
            &server,
            PoolOptions::builder().max_connections(2).build().unwrap(),
        );

        let sends: Vec<_> = (0..6)
            .map(|i| pool.send(mail(&format!("s{}@example.com", i), "rcpt@example.com")))
            .collect();
        for send in sends {
            send.await.unwrap();
        }
        let before = server.connections_created();

        // Both connections now sit idle; ending them must retire the
        // resources without surfacing an error anywhere.
        server.kill_connections();
        sleep(Duration::from_millis(5)).await;
        assert_eq!(pool.status().await.connections, 0);

        let sends: Vec<_> = (0..4)
            .map(|i| pool.send(mail(&format!("late{}@example.com", i), "rcpt@example.com")))
            .collect();
        for send in sends {
            send.await.unwrap();
        }
        assert!(server.connections_created() > before);
        assert_eq!(server.sends().len(), 10);

        pool.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failures_reach_the_caller() {
        let server = MockServer::new();
        server.fail_connects(SmtpErrorKind::Connect);
        let pool = pool_with(&server, PoolOptions::default());

        let err = pool
            .send(mail("a@example.com", "rcpt@example.com"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::Connect);

        // The pool recovers once the server accepts connections again.
        server.accept_connects();
        sleep(Duration::from_millis(150)).await;
        pool.send(mail("a@example.com", "rcpt@example.com"))
            .await
            .unwrap();

        pool.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn verify_closes_its_connection_on_both_paths() {
        let server = MockServer::new();
        let pool = pool_with(
            &server,
            PoolOptions::builder()
                .credentials("testuser", "testpass")
                .build()
                .unwrap(),
        );

        assert!(pool.verify().await.unwrap());
        assert_eq!(server.open_connections(), 0);

        server.fail_logins(SmtpErrorKind::Auth);
        let err = pool.verify().await.unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::Auth);
        assert_eq!(server.open_connections(), 0);

        server.fail_connects(SmtpErrorKind::ConnectTimeout);
        let err = pool.verify().await.unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::ConnectTimeout);
        assert_eq!(server.open_connections(), 0);

        pool.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn is_idle_tracks_dispatch_capacity() {
        let server = MockServer::new();
        server.send_delay(Duration::from_millis(50));
        let pool = pool_with(
            &server,
            PoolOptions::builder().max_connections(1).build().unwrap(),
        );

        assert!(pool.is_idle().await);

        let send = pool.send(mail("a@example.com", "rcpt@example.com"));
        sleep(Duration::from_millis(10)).await;
        // The only slot is sending; a new submission would wait.
        assert!(!pool.is_idle().await);

        send.await.unwrap();
        sleep(Duration::from_millis(1)).await;
        assert!(pool.is_idle().await);

        pool.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn status_and_events_reflect_lifecycle() {
        let server = MockServer::new();
        let pool = pool_with(
            &server,
            PoolOptions::builder().max_connections(3).build().unwrap(),
        );
        let mut events = pool.subscribe();

        pool.send(mail("a@example.com", "rcpt@example.com"))
            .await
            .unwrap();
        sleep(Duration::from_millis(1)).await;

        let status = pool.status().await;
        assert_eq!(status.connections, 1);
        assert_eq!(status.available, 1);
        assert_eq!(status.queued, 0);
        assert_eq!(status.max_connections, 3);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let PoolEvent::Log(log) = event {
                seen.push(log.kind);
            }
        }
        assert!(seen.contains(&LogEventKind::Created));
        assert!(seen.contains(&LogEventKind::Message));
        assert!(seen.contains(&LogEventKind::Available));

        pool.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn submissions_share_a_resource_in_order() {
        let server = MockServer::new();
        server.send_delay(Duration::from_millis(2));
        let pool = pool_with(
            &server,
            PoolOptions::builder().max_connections(1).build().unwrap(),
        );

        let sends: Vec<_> = (0..10)
            .map(|i| pool.send(mail(&format!("s{}@example.com", i), "rcpt@example.com")))
            .collect();
        for send in sends {
            send.await.unwrap();
        }

        let senders: Vec<String> = server
            .sends()
            .iter()
            .map(|record| record.envelope.from.clone().unwrap())
            .collect();
        let expected: Vec<String> = (0..10).map(|i| format!("s{}@example.com", i)).collect();
        assert_eq!(senders, expected);

        pool.close().await;
    }

    #[test]
    fn name_and_version() {
        // No runtime needed for the metadata surface.
        assert_eq!(NAME, "SMTP (pool)");
        assert!(env!("CARGO_PKG_VERSION").len() > 1);
    }
}
