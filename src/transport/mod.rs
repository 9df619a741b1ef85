//! SMTP connection collaborator.
//!
//! The pool drives connections through the [`SmtpConnection`] trait:
//! connect, login, send, quit, plus an end-of-stream watch used while the
//! connection sits idle between sends. [`TcpConnection`] is the real
//! implementation: TCP (optionally through a custom socket provider),
//! greeting, EHLO with HELO fallback, STARTTLS, AUTH, and streamed DATA
//! transactions with dot-stuffing and CRLF normalization.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::timeout;

use crate::auth::{AuthMethod, Authenticator, Credentials};
use crate::config::PoolOptions;
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::observability::{EventSink, LogEventKind};
use crate::protocol::{codes, DataEncoder, EsmtpCapabilities, SmtpCommand, SmtpResponse};
use crate::types::{BodyStream, Envelope};

/// Version tag of the bundled connection client, combined into the pool's
/// version string.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Body bytes read per chunk while streaming DATA.
const BODY_CHUNK_SIZE: usize = 8 * 1024;

/// One SMTP session as the pool sees it.
///
/// Implementations are driven strictly sequentially: `connect`, then
/// `login` when credentials are configured, then any number of `send`
/// calls, then `quit`. `wait_end` is polled only between sends.
#[async_trait]
pub trait SmtpConnection: Send + fmt::Debug {
    /// Establishes the transport and completes the EHLO (and STARTTLS)
    /// handshake.
    async fn connect(&mut self) -> SmtpResult<()>;

    /// Authenticates the session.
    async fn login(&mut self, credentials: &Credentials) -> SmtpResult<()>;

    /// Runs one MAIL/RCPT/DATA transaction and returns the server's final
    /// accept line.
    async fn send(&mut self, envelope: &Envelope, body: BodyStream) -> SmtpResult<String>;

    /// Resolves when the server ends the connection (or sends unsolicited
    /// traffic) while no transaction is in flight.
    async fn wait_end(&mut self);

    /// Sends QUIT and drops the transport. Best-effort and idempotent.
    async fn quit(&mut self);
}

/// Creates connections for pool resources and `verify`.
pub trait ConnectionFactory: Send + Sync {
    /// Creates a fresh, unconnected session.
    fn create(&self) -> Box<dyn SmtpConnection>;
}

/// Factory for [`TcpConnection`].
pub struct TcpConnectionFactory {
    options: Arc<PoolOptions>,
    events: EventSink,
}

impl TcpConnectionFactory {
    /// Creates a factory bound to the pool's options and event sink.
    pub fn new(options: Arc<PoolOptions>, events: EventSink) -> Self {
        Self { options, events }
    }
}

impl ConnectionFactory for TcpConnectionFactory {
    fn create(&self) -> Box<dyn SmtpConnection> {
        Box::new(TcpConnection::new(self.options.clone(), self.events.clone()))
    }
}

enum TransportStream {
    Plain(BufReader<TcpStream>),
    #[cfg(feature = "rustls-tls")]
    Rustls(BufReader<tokio_rustls::client::TlsStream<TcpStream>>),
    #[cfg(feature = "native-tls")]
    NativeTls(BufReader<tokio_native_tls::TlsStream<TcpStream>>),
}

/// Real SMTP session over TCP with optional TLS.
pub struct TcpConnection {
    options: Arc<PoolOptions>,
    events: EventSink,
    stream: Option<TransportStream>,
    capabilities: EsmtpCapabilities,
    tls: bool,
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("host", &self.options.host())
            .field("port", &self.options.port())
            .field("tls", &self.tls)
            .field("connected", &self.stream.is_some())
            .finish()
    }
}

impl TcpConnection {
    /// Creates an unconnected session.
    pub fn new(options: Arc<PoolOptions>, events: EventSink) -> Self {
        Self {
            options,
            events,
            stream: None,
            capabilities: EsmtpCapabilities::default(),
            tls: false,
        }
    }

    fn wire_log(&self, direction: &str, line: &str) {
        if self.options.debug {
            self.events
                .log(LogEventKind::Wire, format!("{} {}", direction, line));
        }
    }

    async fn open_socket(&self) -> SmtpResult<TcpStream> {
        let host = self.options.host();
        let port = self.options.port();

        if let Some(provider) = &self.options.socket_provider {
            return provider.open(host, port).await.map_err(|e| {
                SmtpError::connect(format!("Socket provider failed: {}", e)).with_cause(e)
            });
        }

        let addr = lookup_host((host, port))
            .await
            .map_err(|e| SmtpError::connect(format!("DNS lookup failed for {}: {}", host, e)))?
            .next()
            .ok_or_else(|| SmtpError::connect(format!("No addresses for {}", host)))?;

        match &self.options.local_address {
            Some(local) => {
                let ip: IpAddr = local.parse().map_err(|_| {
                    SmtpError::config(format!("Invalid local_address: {:?}", local))
                })?;
                let socket = match addr {
                    SocketAddr::V4(_) => TcpSocket::new_v4(),
                    SocketAddr::V6(_) => TcpSocket::new_v6(),
                }
                .map_err(|e| SmtpError::connect(format!("Socket creation failed: {}", e)))?;
                socket
                    .bind(SocketAddr::new(ip, 0))
                    .map_err(|e| SmtpError::connect(format!("Bind to {} failed: {}", ip, e)))?;
                socket
                    .connect(addr)
                    .await
                    .map_err(|e| Self::map_connect_error(e, addr))
            }
            None => TcpStream::connect(addr)
                .await
                .map_err(|e| Self::map_connect_error(e, addr)),
        }
    }

    fn map_connect_error(error: io::Error, addr: SocketAddr) -> SmtpError {
        match error.kind() {
            io::ErrorKind::TimedOut => SmtpError::new(
                SmtpErrorKind::ConnectTimeout,
                format!("Connect to {} timed out", addr),
            ),
            _ => SmtpError::connect(format!("Connect to {} failed: {}", addr, error)).with_cause(error),
        }
    }

    async fn read_response(&mut self, timeout_duration: Duration) -> SmtpResult<SmtpResponse> {
        let debug = self.options.debug;
        let events = self.events.clone();
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| SmtpError::connection_closed("Connection is not open"))?;

        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let read = match stream {
                TransportStream::Plain(reader) => {
                    read_line_timeout(reader, &mut line, timeout_duration).await?
                }
                #[cfg(feature = "rustls-tls")]
                TransportStream::Rustls(reader) => {
                    read_line_timeout(reader, &mut line, timeout_duration).await?
                }
                #[cfg(feature = "native-tls")]
                TransportStream::NativeTls(reader) => {
                    read_line_timeout(reader, &mut line, timeout_duration).await?
                }
            };

            if read == 0 {
                return Err(SmtpError::connection_closed("Server closed the connection"));
            }

            let line = line.trim_end().to_string();
            if debug {
                events.log(LogEventKind::Wire, format!("S: {}", line));
            }

            let continuation = line.len() >= 4 && line.as_bytes()[3] == b'-';
            lines.push(line);
            if !continuation {
                break;
            }
        }

        SmtpResponse::parse(&lines)
    }

    async fn write_raw(&mut self, data: &[u8]) -> SmtpResult<()> {
        let timeout_duration = self.options.socket_timeout();
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| SmtpError::connection_closed("Connection is not open"))?;

        match stream {
            TransportStream::Plain(reader) => {
                write_all_timeout(reader.get_mut(), data, timeout_duration).await
            }
            #[cfg(feature = "rustls-tls")]
            TransportStream::Rustls(reader) => {
                write_all_timeout(reader.get_mut(), data, timeout_duration).await
            }
            #[cfg(feature = "native-tls")]
            TransportStream::NativeTls(reader) => {
                write_all_timeout(reader.get_mut(), data, timeout_duration).await
            }
        }
    }

    async fn send_command(&mut self, command: &SmtpCommand) -> SmtpResult<SmtpResponse> {
        self.wire_log("C:", &command.to_redacted());
        let line = format!("{}\r\n", command.to_wire());
        self.write_raw(line.as_bytes()).await?;
        self.read_response(self.options.socket_timeout()).await
    }

    async fn send_line(&mut self, line: &str, redacted: &str) -> SmtpResult<SmtpResponse> {
        self.wire_log("C:", redacted);
        self.write_raw(format!("{}\r\n", line).as_bytes()).await?;
        self.read_response(self.options.socket_timeout()).await
    }

    async fn ehlo(&mut self) -> SmtpResult<()> {
        let name = self.options.client_name().to_string();
        let response = self.send_command(&SmtpCommand::Ehlo(name.clone())).await?;
        if response.is_success() {
            self.capabilities = EsmtpCapabilities::from_ehlo(&response);
            return Ok(());
        }

        // Pre-ESMTP server; fall back to HELO with no capabilities.
        let response = self.send_command(&SmtpCommand::Helo(name)).await?;
        if !response.is_success() {
            return Err(response.to_error(false));
        }
        self.capabilities = EsmtpCapabilities::default();
        Ok(())
    }

    async fn maybe_starttls(&mut self) -> SmtpResult<()> {
        if self.tls || self.options.ignore_tls {
            if self.options.require_tls && !self.tls {
                return Err(SmtpError::tls(
                    "require_tls is set but STARTTLS is disabled by ignore_tls",
                ));
            }
            return Ok(());
        }

        if !self.capabilities.starttls {
            if self.options.require_tls {
                return Err(SmtpError::tls("Server does not advertise STARTTLS"));
            }
            return Ok(());
        }

        let response = self.send_command(&SmtpCommand::StartTls).await?;
        if response.code != codes::SERVICE_READY {
            if self.options.require_tls {
                return Err(response.to_error(false));
            }
            return Ok(());
        }

        self.upgrade_tls().await?;

        // Capabilities may change on the encrypted channel.
        self.ehlo().await
    }

    async fn upgrade_tls(&mut self) -> SmtpResult<()> {
        let stream = match self.stream.take() {
            Some(TransportStream::Plain(reader)) => reader.into_inner(),
            Some(other) => {
                self.stream = Some(other);
                return Err(SmtpError::tls("Connection is already encrypted"));
            }
            None => return Err(SmtpError::connection_closed("Connection is not open")),
        };

        let servername = self
            .options
            .tls
            .servername
            .clone()
            .unwrap_or_else(|| self.options.host().to_string());

        #[cfg(feature = "rustls-tls")]
        {
            use tokio_rustls::rustls::pki_types::ServerName;

            let mut roots = tokio_rustls::rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let config = tokio_rustls::rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
            let server_name = ServerName::try_from(servername.clone())
                .map_err(|_| SmtpError::tls(format!("Invalid server name: {:?}", servername)))?;

            let tls_stream = timeout(
                self.options.socket_timeout(),
                connector.connect(server_name, stream),
            )
            .await
            .map_err(|_| SmtpError::new(SmtpErrorKind::SocketTimeout, "TLS handshake timed out"))?
            .map_err(|e| SmtpError::tls(format!("TLS handshake failed: {}", e)))?;

            self.stream = Some(TransportStream::Rustls(BufReader::new(tls_stream)));
            self.tls = true;
            Ok(())
        }

        #[cfg(all(feature = "native-tls", not(feature = "rustls-tls")))]
        {
            let mut builder = native_tls::TlsConnector::builder();
            if self.options.tls.accept_invalid_certs {
                builder.danger_accept_invalid_certs(true);
            }
            let connector = builder
                .build()
                .map_err(|e| SmtpError::tls(format!("TLS connector setup failed: {}", e)))?;
            let connector = tokio_native_tls::TlsConnector::from(connector);

            let tls_stream = timeout(
                self.options.socket_timeout(),
                connector.connect(&servername, stream),
            )
            .await
            .map_err(|_| SmtpError::new(SmtpErrorKind::SocketTimeout, "TLS handshake timed out"))?
            .map_err(|e| SmtpError::tls(format!("TLS handshake failed: {}", e)))?;

            self.stream = Some(TransportStream::NativeTls(BufReader::new(tls_stream)));
            self.tls = true;
            Ok(())
        }

        #[cfg(not(any(feature = "rustls-tls", feature = "native-tls")))]
        {
            let _ = stream;
            let _ = servername;
            Err(SmtpError::tls("No TLS backend compiled in"))
        }
    }

    async fn auth_plain(&mut self, user: &str, pass: &secrecy::SecretString) -> SmtpResult<()> {
        let response = self
            .send_command(&SmtpCommand::Auth {
                mechanism: "PLAIN".into(),
                initial_response: Some(Authenticator::plain_initial_response(user, pass)),
            })
            .await?;
        if response.code == codes::AUTH_SUCCESS {
            Ok(())
        } else {
            Err(response.to_error(false))
        }
    }

    async fn auth_login(&mut self, user: &str, pass: &secrecy::SecretString) -> SmtpResult<()> {
        let response = self
            .send_command(&SmtpCommand::Auth {
                mechanism: "LOGIN".into(),
                initial_response: None,
            })
            .await?;
        if response.code != codes::AUTH_CONTINUE {
            return Err(response.to_error(false));
        }

        let response = self
            .send_line(&Authenticator::login_username(user), "****")
            .await?;
        if response.code != codes::AUTH_CONTINUE {
            return Err(response.to_error(false));
        }

        let response = self
            .send_line(&Authenticator::login_password(pass), "****")
            .await?;
        if response.code == codes::AUTH_SUCCESS {
            Ok(())
        } else {
            Err(response.to_error(false))
        }
    }

    async fn auth_xoauth2(
        &mut self,
        user: &str,
        access_token: &secrecy::SecretString,
    ) -> SmtpResult<()> {
        let response = self
            .send_command(&SmtpCommand::Auth {
                mechanism: "XOAUTH2".into(),
                initial_response: Some(Authenticator::xoauth2_initial_response(user, access_token)),
            })
            .await?;

        match response.code {
            codes::AUTH_SUCCESS => Ok(()),
            codes::AUTH_CONTINUE => {
                // The server answered with an error challenge (typically a
                // base64 JSON payload for a rejected token). Acknowledge
                // with an empty line to receive the final status.
                let challenge = response.first_line().to_string();
                let final_response = self.send_line("", "").await?;
                let mut err = final_response.to_error(false);
                if err.kind() != SmtpErrorKind::Auth {
                    err = SmtpError::auth(format!("XOAUTH2 rejected: {}", challenge));
                }
                Err(err)
            }
            _ => Err(response.to_error(false)),
        }
    }

    async fn stream_body(&mut self, mut body: BodyStream) -> SmtpResult<String> {
        let mut encoder = DataEncoder::new();
        let mut chunk = vec![0u8; BODY_CHUNK_SIZE];
        let mut encoded = Vec::with_capacity(BODY_CHUNK_SIZE + 64);
        let socket_timeout = self.options.socket_timeout();
        let mut total = 0usize;

        loop {
            let read = body
                .read(&mut chunk)
                .await
                .map_err(|e| SmtpError::send(format!("Reading mail body failed: {}", e)))?;
            if read == 0 {
                break;
            }
            total += read;

            encoded.clear();
            encoder.push(&chunk[..read], &mut encoded);
            if !encoded.is_empty() {
                self.write_raw(&encoded).await?;
            }
        }

        encoded.clear();
        encoder.finish(&mut encoded);
        self.write_raw(&encoded).await?;

        if self.options.debug {
            self.wire_log("C:", &format!("<{} bytes of DATA>", total));
        }

        let response = self.read_response(socket_timeout).await?;
        if !response.is_success() {
            return Err(response.to_error(true));
        }
        Ok(response.full_message())
    }
}

#[async_trait]
impl SmtpConnection for TcpConnection {
    async fn connect(&mut self) -> SmtpResult<()> {
        let stream = timeout(self.options.connection_timeout(), self.open_socket())
            .await
            .map_err(|_| {
                SmtpError::new(
                    SmtpErrorKind::ConnectTimeout,
                    format!(
                        "Connect to {}:{} timed out",
                        self.options.host(),
                        self.options.port()
                    ),
                )
            })??;
        stream.set_nodelay(true).ok();
        self.stream = Some(TransportStream::Plain(BufReader::new(stream)));

        if self.options.secure() {
            self.upgrade_tls().await?;
        }

        let greeting = self
            .read_response(self.options.greeting_timeout())
            .await
            .map_err(|e| match e.kind() {
                SmtpErrorKind::SocketTimeout => SmtpError::new(
                    SmtpErrorKind::GreetingTimeout,
                    "Server greeting did not arrive in time",
                ),
                _ => e,
            })?;
        if greeting.code != codes::SERVICE_READY {
            return Err(greeting.to_error(false));
        }

        self.ehlo().await?;
        self.maybe_starttls().await
    }

    async fn login(&mut self, credentials: &Credentials) -> SmtpResult<()> {
        let available: Vec<AuthMethod> =
            self.capabilities.auth_mechanisms.iter().copied().collect();
        let method =
            Authenticator::select_method(&available, credentials, self.options.auth_method)?;

        match (method, credentials) {
            (AuthMethod::Plain, Credentials::Plain { user, pass }) => {
                self.auth_plain(user, pass).await
            }
            (AuthMethod::Login, Credentials::Plain { user, pass }) => {
                self.auth_login(user, pass).await
            }
            (AuthMethod::XOAuth2, Credentials::XOAuth2 { user, access_token }) => {
                self.auth_xoauth2(user, access_token).await
            }
            _ => Err(SmtpError::auth("Credentials do not match the mechanism")),
        }
    }

    async fn send(&mut self, envelope: &Envelope, body: BodyStream) -> SmtpResult<String> {
        envelope.validate()?;

        let response = self
            .send_command(&SmtpCommand::MailFrom {
                address: envelope.from.clone().unwrap_or_default(),
            })
            .await?;
        if !response.is_success() {
            return Err(response.to_error(true));
        }

        let mut accepted = 0usize;
        let mut last_rejection = None;
        for recipient in &envelope.to {
            let response = self
                .send_command(&SmtpCommand::RcptTo {
                    address: recipient.clone(),
                })
                .await?;
            if response.is_success() {
                accepted += 1;
            } else {
                last_rejection = Some(response);
            }
        }

        if accepted == 0 {
            let err = last_rejection
                .map(|r| r.to_error(true))
                .unwrap_or_else(|| SmtpError::send("All recipients were rejected"));
            // Leave the session reusable for the next transaction.
            let _ = self.send_command(&SmtpCommand::Rset).await;
            return Err(err);
        }

        let response = self.send_command(&SmtpCommand::Data).await?;
        if response.code != codes::START_MAIL_INPUT {
            return Err(response.to_error(true));
        }

        self.stream_body(body).await
    }

    async fn wait_end(&mut self) {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return,
        };

        // A peek that consumes nothing: end-of-stream, an error, or any
        // unsolicited traffic (a 421 shutdown notice) all end the session.
        let result = match stream {
            TransportStream::Plain(reader) => reader.fill_buf().await.map(|b| b.len()),
            #[cfg(feature = "rustls-tls")]
            TransportStream::Rustls(reader) => reader.fill_buf().await.map(|b| b.len()),
            #[cfg(feature = "native-tls")]
            TransportStream::NativeTls(reader) => reader.fill_buf().await.map(|b| b.len()),
        };

        if self.options.debug {
            match result {
                Ok(0) => self.wire_log("S:", "<connection closed by server>"),
                Ok(_) => self.wire_log("S:", "<unsolicited traffic, closing>"),
                Err(_) => self.wire_log("S:", "<socket error, closing>"),
            }
        }
    }

    async fn quit(&mut self) {
        if self.stream.is_some() {
            self.wire_log("C:", "QUIT");
            let _ = self.write_raw(b"QUIT\r\n").await;
            self.stream = None;
        }
    }
}

async fn read_line_timeout<R>(
    reader: &mut R,
    line: &mut String,
    timeout_duration: Duration,
) -> SmtpResult<usize>
where
    R: AsyncBufReadExt + Unpin,
{
    timeout(timeout_duration, reader.read_line(line))
        .await
        .map_err(|_| SmtpError::new(SmtpErrorKind::SocketTimeout, "Read timed out"))?
        .map_err(|e| SmtpError::connection_closed(format!("Read failed: {}", e)).with_cause(e))
}

async fn write_all_timeout<W>(
    writer: &mut W,
    data: &[u8],
    timeout_duration: Duration,
) -> SmtpResult<()>
where
    W: AsyncWrite + Unpin,
{
    timeout(timeout_duration, async {
        writer.write_all(data).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| SmtpError::new(SmtpErrorKind::SocketTimeout, "Write timed out"))?
    .map_err(|e: io::Error| SmtpError::connection_closed(format!("Write failed: {}", e)).with_cause(e))
}
