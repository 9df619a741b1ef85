//! Scripted connections for exercising the pool without a network.
//!
//! [`MockServer`] plays the remote side: it scripts per-envelope outcomes,
//! injects connect/login failures, simulates stalled transactions, and can
//! force-close every currently open session. Connections record their
//! traffic so tests can assert on fan-out and per-connection counts.

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::auth::Credentials;
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::transport::{ConnectionFactory, SmtpConnection};
use crate::types::{BodyStream, Envelope};

/// Scripted result for one transaction.
pub enum SendOutcome {
    /// Accept the message.
    Accept,
    /// Reject with the given reply code and text.
    Reject(u16, String),
    /// Never acknowledge; the session times out and fails.
    Stall,
}

type SendScript = dyn Fn(&Envelope) -> SendOutcome + Send + Sync;

/// Shared state standing in for the remote SMTP server.
pub struct MockServer {
    connect_error: Mutex<Option<SmtpErrorKind>>,
    login_error: Mutex<Option<SmtpErrorKind>>,
    script: Mutex<Arc<SendScript>>,
    send_delay: Mutex<Duration>,
    stall_delay: Mutex<Duration>,
    kill_generation: watch::Sender<u64>,
    next_connection: AtomicU64,
    active: AtomicUsize,
    max_active: AtomicUsize,
    sends: Mutex<Vec<SendRecord>>,
}

/// One recorded transaction.
#[derive(Debug, Clone)]
pub struct SendRecord {
    /// Connection the transaction ran on.
    pub connection: u64,
    /// The envelope as received.
    pub envelope: Envelope,
    /// Raw body bytes as submitted.
    pub body: Vec<u8>,
}

impl MockServer {
    /// Creates a server that accepts everything instantly.
    pub fn new() -> Arc<Self> {
        let (kill_generation, _) = watch::channel(0);
        Arc::new(Self {
            connect_error: Mutex::new(None),
            login_error: Mutex::new(None),
            script: Mutex::new(Arc::new(|_| SendOutcome::Accept)),
            send_delay: Mutex::new(Duration::from_millis(1)),
            stall_delay: Mutex::new(Duration::from_secs(300)),
            kill_generation,
            next_connection: AtomicU64::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            sends: Mutex::new(Vec::new()),
        })
    }

    /// Returns a factory producing connections against this server.
    pub fn factory(server: &Arc<MockServer>) -> Arc<dyn ConnectionFactory> {
        Arc::new(MockConnectionFactory {
            server: server.clone(),
        })
    }

    /// Makes every new connect attempt fail with the given kind.
    pub fn fail_connects(&self, kind: SmtpErrorKind) {
        *self.connect_error.lock().unwrap() = Some(kind);
    }

    /// Restores successful connects.
    pub fn accept_connects(&self) {
        *self.connect_error.lock().unwrap() = None;
    }

    /// Makes every login attempt fail with the given kind.
    pub fn fail_logins(&self, kind: SmtpErrorKind) {
        *self.login_error.lock().unwrap() = Some(kind);
    }

    /// Installs a per-envelope outcome script.
    pub fn script(&self, script: impl Fn(&Envelope) -> SendOutcome + Send + Sync + 'static) {
        *self.script.lock().unwrap() = Arc::new(script);
    }

    /// Sets the simulated transaction duration.
    pub fn send_delay(&self, delay: Duration) {
        *self.send_delay.lock().unwrap() = delay;
    }

    /// Sets how long a stalled transaction takes to fail.
    pub fn stall_delay(&self, delay: Duration) {
        *self.stall_delay.lock().unwrap() = delay;
    }

    /// Force-closes every session open right now; later connections are
    /// unaffected.
    pub fn kill_connections(&self) {
        self.kill_generation.send_modify(|generation| *generation += 1);
    }

    /// Number of connections ever opened.
    pub fn connections_created(&self) -> u64 {
        self.next_connection.load(Ordering::SeqCst)
    }

    /// Peak number of simultaneously open connections.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Number of sessions open right now.
    pub fn open_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// All recorded transactions, in completion order.
    pub fn sends(&self) -> Vec<SendRecord> {
        self.sends.lock().unwrap().clone()
    }

    /// Number of recorded transactions per connection.
    pub fn sends_per_connection(&self) -> Vec<(u64, usize)> {
        let records = self.sends.lock().unwrap();
        let mut counts: Vec<(u64, usize)> = Vec::new();
        for record in records.iter() {
            match counts.iter_mut().find(|(id, _)| *id == record.connection) {
                Some((_, count)) => *count += 1,
                None => counts.push((record.connection, 1)),
            }
        }
        counts
    }
}

struct MockConnectionFactory {
    server: Arc<MockServer>,
}

impl ConnectionFactory for MockConnectionFactory {
    fn create(&self) -> Box<dyn SmtpConnection> {
        let id = self.server.next_connection.fetch_add(1, Ordering::SeqCst) + 1;
        Box::new(MockConnection {
            id,
            server: self.server.clone(),
            birth_generation: *self.server.kill_generation.borrow(),
            connected: false,
        })
    }
}

/// One scripted session.
pub struct MockConnection {
    id: u64,
    server: Arc<MockServer>,
    birth_generation: u64,
    connected: bool,
}

impl fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockConnection")
            .field("id", &self.id)
            .field("connected", &self.connected)
            .finish()
    }
}

#[async_trait]
impl SmtpConnection for MockConnection {
    async fn connect(&mut self) -> SmtpResult<()> {
        if let Some(kind) = *self.server.connect_error.lock().unwrap() {
            return Err(SmtpError::new(kind, "Scripted connect failure"));
        }
        self.connected = true;
        let active = self.server.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.server.max_active.fetch_max(active, Ordering::SeqCst);
        Ok(())
    }

    async fn login(&mut self, _credentials: &Credentials) -> SmtpResult<()> {
        if let Some(kind) = *self.server.login_error.lock().unwrap() {
            return Err(SmtpError::new(kind, "Scripted login failure"));
        }
        Ok(())
    }

    async fn send(&mut self, envelope: &Envelope, mut body: BodyStream) -> SmtpResult<String> {
        let outcome = {
            let script = self.server.script.lock().unwrap().clone();
            script(envelope)
        };
        let delay = *self.server.send_delay.lock().unwrap();

        match outcome {
            SendOutcome::Accept => {
                sleep(delay).await;
                let mut bytes = Vec::new();
                body.read_to_end(&mut bytes)
                    .await
                    .map_err(|e| SmtpError::send(format!("Body read failed: {}", e)))?;
                self.server.sends.lock().unwrap().push(SendRecord {
                    connection: self.id,
                    envelope: envelope.clone(),
                    body: bytes,
                });
                Ok("250 OK: queued".to_string())
            }
            SendOutcome::Reject(code, message) => {
                sleep(delay).await;
                Err(SmtpError::from_reply(code, message, true))
            }
            SendOutcome::Stall => {
                let stall = *self.server.stall_delay.lock().unwrap();
                sleep(stall).await;
                Err(SmtpError::new(
                    SmtpErrorKind::SocketTimeout,
                    "Socket timed out waiting for the server",
                ))
            }
        }
    }

    async fn wait_end(&mut self) {
        let mut generation = self.server.kill_generation.subscribe();
        loop {
            if *generation.borrow() > self.birth_generation {
                return;
            }
            if generation.changed().await.is_err() {
                // Server state dropped; nothing will ever end the session.
                std::future::pending::<()>().await;
            }
        }
    }

    async fn quit(&mut self) {
        if self.connected {
            self.connected = false;
            self.server.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Envelope;

    #[tokio::test]
    async fn records_accepted_sends() {
        let server = MockServer::new();
        let factory = MockServer::factory(&server);
        let mut conn = factory.create();

        conn.connect().await.unwrap();
        let envelope = Envelope::new("a@b.c", vec!["d@e.f".into()]);
        let response = conn
            .send(&envelope, Box::new(std::io::Cursor::new(b"hi".to_vec())))
            .await
            .unwrap();
        assert!(response.starts_with("250"));
        conn.quit().await;

        let sends = server.sends();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].body, b"hi");
        assert_eq!(server.max_concurrent(), 1);
    }

    #[tokio::test]
    async fn scripted_rejection() {
        let server = MockServer::new();
        server.script(|envelope| {
            if envelope.from.as_deref() == Some("bad@sender") {
                SendOutcome::Reject(550, "No thanks".into())
            } else {
                SendOutcome::Accept
            }
        });
        let factory = MockServer::factory(&server);
        let mut conn = factory.create();
        conn.connect().await.unwrap();

        let envelope = Envelope::new("bad@sender", vec!["d@e.f".into()]);
        let err = conn
            .send(&envelope, Box::new(std::io::Cursor::new(Vec::new())))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::Send);
        assert_eq!(err.smtp_code(), Some(550));
    }

    #[tokio::test]
    async fn kill_only_affects_open_sessions() {
        let server = MockServer::new();
        let factory = MockServer::factory(&server);
        let mut old = factory.create();
        old.connect().await.unwrap();

        server.kill_connections();
        // The pre-kill session observes the end...
        old.wait_end().await;

        // ...while a session opened afterwards does not.
        let mut fresh = factory.create();
        fresh.connect().await.unwrap();
        tokio::select! {
            _ = fresh.wait_end() => panic!("fresh session should stay open"),
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
        }
    }
}
