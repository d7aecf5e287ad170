//! SMTP client with optional STARTTLS upgrade.

use ferry_common::{incoming, outgoing};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::{
    error::{ClientError, Result},
    response::Response,
    tls,
};

const BUFFER_SIZE: usize = 8192;

/// Replies larger than this are treated as a protocol error
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

enum Connection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Connection {
    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.write_all(data).await?,
            Self::Tls(stream) => stream.write_all(data).await?,
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.flush().await?,
            Self::Tls(stream) => stream.flush().await?,
        }
        Ok(())
    }

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
}

/// A single SMTP session to one server.
///
/// Each command method sends one command and returns the server's reply
/// without interpreting it; deciding what a reply means is left to the
/// caller.
pub struct SmtpClient {
    connection: Option<Connection>,
    buffer: Vec<u8>,
    filled: usize,
    server_name: String,
    accept_invalid_certs: bool,
}

impl SmtpClient {
    /// Open a TCP connection to `addr` (`host:port`). `server_name` is the
    /// name verified during a later STARTTLS.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails.
    pub async fn connect(addr: &str, server_name: impl Into<String>) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;

        Ok(Self {
            connection: Some(Connection::Plain(stream)),
            buffer: vec![0u8; BUFFER_SIZE],
            filled: 0,
            server_name: server_name.into(),
            accept_invalid_certs: false,
        })
    }

    #[must_use]
    pub const fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self.connection, Some(Connection::Tls(_)))
    }

    fn connection(&mut self) -> Result<&mut Connection> {
        self.connection.as_mut().ok_or(ClientError::ConnectionClosed)
    }

    /// Read the 220 banner.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the reply is malformed.
    pub async fn read_greeting(&mut self) -> Result<Response> {
        self.read_response().await
    }

    /// Send a raw command line and read its reply.
    ///
    /// # Errors
    ///
    /// Returns an error if sending or reading fails.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        outgoing!(command, "SMTP command");

        let connection = self.connection()?;
        connection.write_all(command.as_bytes()).await?;
        connection.write_all(b"\r\n").await?;
        connection.flush().await?;

        self.read_response().await
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn ehlo(&mut self, domain: &str) -> Result<Response> {
        self.command(&format!("EHLO {domain}")).await
    }

    /// `MAIL FROM`, where `None` is the null reverse-path `<>`.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn mail_from(&mut self, from: Option<&str>, size: Option<usize>) -> Result<Response> {
        let from = from.unwrap_or_default();
        match size {
            Some(size) => self.command(&format!("MAIL FROM:<{from}> SIZE={size}")).await,
            None => self.command(&format!("MAIL FROM:<{from}>")).await,
        }
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:<{to}>")).await
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA").await
    }

    /// Send the message after a 354 reply, then the terminating `.` line.
    ///
    /// Line endings are normalised to CRLF and lines beginning with `.` are
    /// dot-stuffed (RFC 5321 4.5.2); the receiving server undoes both.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails.
    pub async fn send_data(&mut self, message: &[u8]) -> Result<Response> {
        let encoded = encode_data(message);
        outgoing!(bytes = encoded.len(), "SMTP message data");

        let connection = self.connection()?;
        connection.write_all(&encoded).await?;
        connection.flush().await?;

        self.read_response().await
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn quit(&mut self) -> Result<Response> {
        self.command("QUIT").await
    }

    /// Issue STARTTLS and, when the server agrees, upgrade the connection.
    ///
    /// A non-2xx reply is returned as-is with the connection left in plain
    /// text.
    ///
    /// # Errors
    ///
    /// Returns an error if the command or the TLS handshake fails.
    pub async fn starttls(&mut self) -> Result<Response> {
        let response = self.command("STARTTLS").await?;
        if !response.is_success() {
            return Ok(response);
        }

        let Some(Connection::Plain(stream)) = self.connection.take() else {
            return Err(ClientError::TlsError(
                "Connection is already TLS".to_string(),
            ));
        };

        let connector = tls::connector(self.accept_invalid_certs)?;
        let name = tls::server_name(&self.server_name)?;
        let stream = connector
            .connect(name, stream)
            .await
            .map_err(|e| ClientError::TlsError(e.to_string()))?;

        self.connection = Some(Connection::Tls(Box::new(stream)));
        self.filled = 0;

        Ok(response)
    }

    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) = Response::parse_response(&self.buffer[..self.filled])? {
                self.buffer.copy_within(consumed..self.filled, 0);
                self.filled -= consumed;

                incoming!(code = response.code, message = %response.message(), "SMTP reply");
                return Ok(response);
            }

            if self.filled == self.buffer.len() {
                let grown = self.buffer.len() * 2;
                if grown > MAX_BUFFER_SIZE {
                    return Err(ClientError::ParseError(format!(
                        "Response too large (exceeds {MAX_BUFFER_SIZE} bytes)"
                    )));
                }
                self.buffer.resize(grown, 0);
            }

            let Some(connection) = self.connection.as_mut() else {
                return Err(ClientError::ConnectionClosed);
            };
            let n = connection.read(&mut self.buffer[self.filled..]).await?;
            self.filled += n;
        }
    }
}

/// Transparency encoding for the DATA phase, including the final `.` line
pub fn encode_data(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + message.len() / 64 + 5);

    let body = message.strip_suffix(b"\n").unwrap_or(message);
    if !message.is_empty() {
        for line in body.split(|b| *b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.first() == Some(&b'.') {
                out.push(b'.');
            }
            out.extend_from_slice(line);
            out.extend_from_slice(b"\r\n");
        }
    }

    out.extend_from_slice(b".\r\n");
    out
}
