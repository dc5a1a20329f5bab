//! SMTP client implementation with support for TLS and STARTTLS.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

use mailcore_common::tracing;
use mailcore_tracing::traced;

use super::error::{ClientError, Result};
use super::params::MailParameters;
use super::response::Response;

/// Initial size of the read buffer for SMTP responses.
const BUFFER_SIZE: usize = 8192;

/// Maximum total bytes of response data a single client will read over its
/// entire lifetime, regardless of how many commands it sends. Guards against
/// a misbehaving or hostile server streaming an unbounded response.
const MAX_TOTAL_RESPONSE_BYTES: usize = 2 * 1024 * 1024;

/// An SMTP client connection that can be either plain TCP or TLS-wrapped.
enum ClientConnection {
    Plain(TcpStream),
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
}

impl ClientConnection {
    /// Sends data over the connection.
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.write_all(data).await?,
            Self::Tls(stream) => stream.write_all(data).await?,
        }
        Ok(())
    }

    /// Reads data from the connection into the provided buffer.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(n)
    }

    /// Upgrades a plain connection to TLS.
    async fn upgrade_to_tls(self, domain: &str, accept_invalid_certs: bool) -> Result<Self> {
        match self {
            Self::Plain(stream) => {
                let mut root_store = RootCertStore::empty();

                let certs = rustls_native_certs::load_native_certs();
                for cert in certs.certs {
                    root_store.add(cert).map_err(|e| {
                        ClientError::TlsError(format!("Failed to add certificate: {e}"))
                    })?;
                }
                if !certs.errors.is_empty() {
                    tracing::warn!(?certs.errors, "some certificates could not be loaded");
                }

                let mut config = ClientConfig::builder()
                    .with_root_certificates(root_store)
                    .with_no_client_auth();

                if accept_invalid_certs {
                    config
                        .dangerous()
                        .set_certificate_verifier(Arc::new(NoVerifier));
                }

                let connector = TlsConnector::from(Arc::new(config));
                let server_name = ServerName::try_from(domain.to_string())
                    .map_err(|e| ClientError::TlsError(format!("Invalid domain: {e}")))?;

                let tls_stream = connector
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| ClientError::TlsError(e.to_string()))?;

                Ok(Self::Tls(tls_stream))
            }
            Self::Tls(_) => Err(ClientError::TlsError(
                "connection is already TLS".to_string(),
            )),
        }
    }
}

/// A certificate verifier that accepts all certificates (for testing only).
#[derive(Debug)]
struct NoVerifier;

impl tokio_rustls::rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[tokio_rustls::rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: tokio_rustls::rustls::pki_types::UnixTime,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::ServerCertVerified,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<tokio_rustls::rustls::SignatureScheme> {
        vec![
            tokio_rustls::rustls::SignatureScheme::RSA_PKCS1_SHA256,
            tokio_rustls::rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            tokio_rustls::rustls::SignatureScheme::ED25519,
        ]
    }
}

/// Returns `true` if `code` is a permanent SMTP failure (5xx) that should
/// never be retried against the same server without changing the request.
#[must_use]
pub const fn is_permanent(code: u16) -> bool {
    code >= 500 && code < 600
}

/// The outcome of sending RCPT TO for one recipient as part of a combined
/// `mail_and_rcpt` transaction.
#[derive(Debug, Clone)]
pub struct RecipientOutcome {
    /// The recipient address as passed in.
    pub recipient: String,
    /// The server's response to RCPT TO for this recipient.
    pub response: Response,
}

impl RecipientOutcome {
    /// Returns `true` if the server accepted this recipient.
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        self.response.is_success()
    }
}

/// Inserts an extra leading `.` on any line of `chunk` that begins with one,
/// per RFC 5321 §4.5.2. `at_line_start` carries the line-start state across
/// calls for data written in several chunks. Returns the stuffed bytes and
/// the line-start state for the next call.
fn dot_stuff(chunk: &[u8], at_line_start: bool) -> (Vec<u8>, bool) {
    let mut out = Vec::with_capacity(chunk.len());
    let mut at_line_start = at_line_start;
    for &byte in chunk {
        if at_line_start && byte == b'.' {
            out.push(b'.');
        }
        out.push(byte);
        at_line_start = byte == b'\n';
    }
    (out, at_line_start)
}

/// A handle for streaming message content after a successful DATA command.
///
/// Obtained from [`SmtpClient::data_writer`]. Dropping this without calling
/// [`DataWriter::finish`] leaves the connection mid-transaction; the caller
/// must always call `finish`.
pub struct DataWriter<'a> {
    client: &'a mut SmtpClient,
    at_line_start: bool,
}

impl DataWriter<'_> {
    /// Writes a chunk of message data, transparently dot-stuffing any line
    /// that begins with `.` per RFC 5321 §4.5.2.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying write fails.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let connection = self
            .client
            .connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?;

        let (stuffed, at_line_start) = dot_stuff(chunk, self.at_line_start);
        connection.send(&stuffed).await?;
        self.at_line_start = at_line_start;

        Ok(())
    }

    /// Terminates the message with the end-of-data marker and reads the
    /// server's final response.
    ///
    /// # Errors
    ///
    /// Returns an error if sending the terminator or reading the response
    /// fails.
    pub async fn finish(self) -> Result<Response> {
        let connection = self
            .client
            .connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?;

        if !self.at_line_start {
            connection.send(b"\r\n").await?;
        }
        connection.send(b".\r\n").await?;

        self.client.read_response().await
    }
}

/// An SMTP client for sending commands and receiving responses.
pub struct SmtpClient {
    connection: Option<ClientConnection>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    total_bytes_read: usize,
    responses: Vec<Response>,
    extensions: Vec<(String, String)>,
    server_domain: String,
    accept_invalid_certs: bool,
}

impl SmtpClient {
    /// Creates a new SMTP client by connecting to the specified address.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails.
    #[traced]
    pub async fn connect(addr: &str, server_domain: String) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.map_err(ClientError::Io)?;

        Ok(Self {
            connection: Some(ClientConnection::Plain(stream)),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            total_bytes_read: 0,
            responses: Vec::new(),
            extensions: Vec::new(),
            server_domain,
            accept_invalid_certs: false,
        })
    }

    /// Sets whether to accept invalid TLS certificates.
    ///
    /// This is useful for testing with self-signed certificates.
    /// Default is `false` for security. Set to `true` for testing only.
    #[must_use]
    pub const fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// Reads the initial server greeting (220 response).
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the greeting is invalid.
    pub async fn read_greeting(&mut self) -> Result<Response> {
        self.read_response().await
    }

    /// Sends a command to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails.
    pub async fn send_command(&mut self, command: &str) -> Result<()> {
        let data = format!("{command}\r\n");
        self.connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?
            .send(data.as_bytes())
            .await?;
        Ok(())
    }

    /// Sends a raw command and reads the response.
    ///
    /// # Errors
    ///
    /// Returns an error if sending or reading fails.
    #[traced]
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        self.send_command(command).await?;
        self.read_response().await
    }

    /// Sends EHLO, recording any advertised extensions.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn ehlo(&mut self, domain: &str) -> Result<Response> {
        let response = self.command(&format!("EHLO {domain}")).await?;
        self.extensions = response
            .lines
            .iter()
            .skip(1)
            .filter_map(|line| {
                let mut parts = line.splitn(2, char::is_whitespace);
                let name = parts.next()?.to_ascii_uppercase();
                let params = parts.next().unwrap_or("").trim().to_string();
                Some((name, params))
            })
            .collect();
        Ok(response)
    }

    /// Sends HELO with the specified domain.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn helo(&mut self, domain: &str) -> Result<Response> {
        self.command(&format!("HELO {domain}")).await
    }

    /// Sends EHLO, falling back to HELO if the server rejects it. This is
    /// the usual way to open a session against a server of unknown vintage.
    ///
    /// # Errors
    ///
    /// Returns an error if both EHLO and the HELO fallback fail.
    pub async fn hello(&mut self, domain: &str) -> Result<Response> {
        let response = self.ehlo(domain).await?;
        if response.is_success() {
            return Ok(response);
        }
        self.helo(domain).await
    }

    /// Looks up whether the last EHLO response advertised `extension`
    /// (case-insensitive, e.g. `"STARTTLS"` or `"SIZE"`). Returns
    /// `(true, params)` if present, with `params` the text following the
    /// extension keyword (e.g. `"1000"` for `SIZE 1000`, empty for a bare
    /// extension like `STARTTLS`); `(false, "")` if absent.
    #[must_use]
    pub fn extension(&self, extension: &str) -> (bool, &str) {
        self.extensions
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(extension))
            .map_or((false, ""), |(_, params)| (true, params.as_str()))
    }

    /// Sends MAIL FROM command.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn mail_from(&mut self, from: &str, size: Option<usize>) -> Result<Response> {
        let cmd = if let Some(sz) = size {
            format!("MAIL FROM:<{from}> SIZE={sz}")
        } else {
            format!("MAIL FROM:<{from}>")
        };
        self.command(&cmd).await
    }

    /// Sends MAIL FROM command with generic ESMTP parameters (RFC 5321 §3.3).
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn mail_from_with_params(
        &mut self,
        from: &str,
        params: &MailParameters,
    ) -> Result<Response> {
        let cmd = if params.is_empty() {
            format!("MAIL FROM:<{from}>")
        } else {
            format!("MAIL FROM:<{from}> {params}")
        };
        self.command(&cmd).await
    }

    /// Sends RCPT TO command.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:<{to}>")).await
    }

    /// Sends MAIL FROM followed by RCPT TO for each recipient, continuing
    /// through individual recipient rejections rather than aborting the
    /// whole transaction, matching how a multi-recipient envelope degrades
    /// to a partial delivery rather than a total failure.
    ///
    /// # Errors
    ///
    /// Returns an error only if MAIL FROM itself fails or a connection
    /// error occurs; per-recipient SMTP errors are reported in the returned
    /// outcomes instead.
    #[traced]
    pub async fn mail_and_rcpt(
        &mut self,
        from: &str,
        size: Option<usize>,
        recipients: &[String],
    ) -> Result<(Response, Vec<RecipientOutcome>)> {
        let mail_response = self.mail_from(from, size).await?;
        if !mail_response.is_success() {
            return Err(ClientError::SmtpError {
                code: mail_response.code,
                message: mail_response.message(),
            });
        }

        let mut outcomes = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let response = self.rcpt_to(recipient).await?;
            outcomes.push(RecipientOutcome {
                recipient: recipient.clone(),
                response,
            });
        }

        Ok((mail_response, outcomes))
    }

    /// Sends DATA command (without message content).
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA").await
    }

    /// Sends DATA and, if accepted, returns a [`DataWriter`] for streaming
    /// the message body without materializing it as a single `String` first.
    ///
    /// # Errors
    ///
    /// Returns an error if the DATA command itself is rejected.
    pub async fn data_writer(&mut self) -> Result<DataWriter<'_>> {
        let response = self.data().await?;
        if !response.is_success() {
            return Err(ClientError::SmtpError {
                code: response.code,
                message: response.message(),
            });
        }

        Ok(DataWriter {
            client: self,
            at_line_start: true,
        })
    }

    /// Sends the message data followed by a dot on its own line.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails.
    pub async fn send_data(&mut self, data: &str) -> Result<Response> {
        let connection = self
            .connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?;

        connection.send(data.as_bytes()).await?;

        if data.ends_with("\r\n") {
            // already CRLF-terminated
        } else if data.ends_with('\n') {
            connection.send(b"\r").await?;
        } else {
            connection.send(b"\r\n").await?;
        }

        connection.send(b".\r\n").await?;

        self.read_response().await
    }

    /// Sends NOOP, which the server must accept without altering any
    /// transaction state.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn noop(&mut self) -> Result<Response> {
        self.command("NOOP").await
    }

    /// Sends QUIT command.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn quit(&mut self) -> Result<Response> {
        self.command("QUIT").await
    }

    /// Closes the connection without sending QUIT, e.g. after a fatal
    /// protocol error where a clean shutdown isn't possible.
    pub fn close(&mut self) {
        self.connection = None;
    }

    /// Sends STARTTLS command and upgrades the connection to TLS.
    ///
    /// # Errors
    ///
    /// Returns an error if STARTTLS fails or TLS upgrade fails.
    #[traced]
    pub async fn starttls(&mut self) -> Result<Response> {
        let response = self.command("STARTTLS").await?;

        if response.is_success() {
            let domain = self.server_domain.clone();
            let accept_invalid = self.accept_invalid_certs;

            if let Some(old_connection) = self.connection.take() {
                self.connection =
                    Some(old_connection.upgrade_to_tls(&domain, accept_invalid).await?);
            } else {
                return Err(ClientError::ConnectionClosed);
            }

            // A fresh TLS session invalidates anything learned pre-STARTTLS.
            self.extensions.clear();
        }

        Ok(response)
    }

    /// Sends RSET command to reset the transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn rset(&mut self) -> Result<Response> {
        self.command("RSET").await
    }

    /// Returns all responses received so far.
    #[must_use]
    pub fn responses(&self) -> &[Response] {
        &self.responses
    }

    /// Returns the last response received, if any.
    #[must_use]
    pub fn last_response(&self) -> Option<&Response> {
        self.responses.last()
    }

    /// Reads a complete SMTP response from the server.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails, the response is malformed, or the
    /// total-lifetime response byte cap is exceeded.
    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) =
                Response::parse_response(&self.buffer[..self.buffer_pos])?
            {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;

                self.responses.push(response.clone());

                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = (self.buffer.len() * 2).min(BUFFER_SIZE * 16);
                if new_size == self.buffer.len() {
                    return Err(ClientError::ParseError(
                        "response line exceeds maximum buffer size".to_string(),
                    ));
                }
                self.buffer.resize(new_size, 0);
            }

            let connection = self
                .connection
                .as_mut()
                .ok_or(ClientError::ConnectionClosed)?;
            let n = connection.read(&mut self.buffer[self.buffer_pos..]).await?;

            self.total_bytes_read += n;
            if self.total_bytes_read > MAX_TOTAL_RESPONSE_BYTES {
                return Err(ClientError::ParseError(format!(
                    "total response data exceeds {MAX_TOTAL_RESPONSE_BYTES} bytes"
                )));
            }

            self.buffer_pos += n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_permanent_classifies_by_status_code() {
        assert!(!is_permanent(250));
        assert!(!is_permanent(421));
        assert!(is_permanent(550));
        assert!(is_permanent(553));
        assert!(!is_permanent(221));
    }

    #[test]
    fn dot_stuff_escapes_a_leading_dot() {
        let (stuffed, at_line_start) = dot_stuff(b".leading dot\r\n", true);
        assert_eq!(stuffed, b"..leading dot\r\n");
        assert!(at_line_start);
    }

    #[test]
    fn dot_stuff_leaves_mid_line_dots_alone() {
        let (stuffed, _) = dot_stuff(b"a.b.c\r\n", true);
        assert_eq!(stuffed, b"a.b.c\r\n");
    }

    #[test]
    fn dot_stuff_tracks_line_start_across_chunk_boundaries() {
        let (first, at_line_start) = dot_stuff(b"body\r\n", true);
        assert_eq!(first, b"body\r\n");
        assert!(at_line_start);

        let (second, _) = dot_stuff(b".more\r\n", at_line_start);
        assert_eq!(second, b"..more\r\n");
    }

    #[test]
    fn dot_stuff_does_not_stuff_when_not_at_line_start() {
        let (stuffed, _) = dot_stuff(b".tail\r\n", false);
        assert_eq!(stuffed, b".tail\r\n");
    }
}
