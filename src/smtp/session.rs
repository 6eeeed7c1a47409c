//! Hand-driven SMTP client session.
//!
//! Each protocol step is its own method so callers can tell exactly which
//! one failed. The session owns the transport: dropping it closes the
//! connection, whatever state the dialogue was left in.

use std::future::Future;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
    BufStream,
};
use tokio::time::timeout;
use tokio_native_tls::native_tls;
use tracing::{debug, trace};

const MAX_REPLY_LINES: usize = 128;
/// RFC 5321 caps a reply line at 512 octets, CRLF included.
const MAX_REPLY_LINE_LEN: usize = 512;
/// How much of an offending line ends up in [`SmtpError::MalformedReply`].
const MALFORMED_EXCERPT_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum SmtpError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),
    #[error("no answer within {0:?}")]
    Timeout(Duration),
    #[error("connection closed by the relay")]
    ConnectionClosed,
    #[error("malformed reply: {0:?}")]
    MalformedReply(String),
    #[error("relay replied {0}")]
    Rejected(Reply),
    #[error("relay does not advertise AUTH")]
    AuthUnsupported,
}

/// A complete, possibly multi-line, server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl std::fmt::Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.lines.join(" "))
    }
}

/// Runs `fut` under `limit`, turning an elapsed deadline into
/// [`SmtpError::Timeout`].
pub(crate) async fn timed<T, E, F>(limit: Duration, fut: F) -> Result<T, SmtpError>
where
    F: Future<Output = Result<T, E>>,
    SmtpError: From<E>,
{
    match timeout(limit, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(SmtpError::Timeout(limit)),
    }
}

fn malformed(line: &str) -> SmtpError {
    let excerpt = line.chars().take(MALFORMED_EXCERPT_LEN).collect();
    SmtpError::MalformedReply(excerpt)
}

/// Splits one reply line into code, "is last line" and text.
fn parse_reply_line(line: &str) -> Result<(u16, bool, &str), SmtpError> {
    let line = line.trim_end_matches(['\r', '\n']);

    let code = line
        .get(..3)
        .filter(|code| code.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| malformed(line))?;

    match line.as_bytes().get(3) {
        None => Ok((code, true, "")),
        Some(b' ') => Ok((code, true, &line[4..])),
        Some(b'-') => Ok((code, false, &line[4..])),
        Some(_) => Err(malformed(line)),
    }
}

fn accept(reply: Reply, codes: &[u16]) -> Result<(), SmtpError> {
    if codes.contains(&reply.code) {
        Ok(())
    } else {
        Err(SmtpError::Rejected(reply))
    }
}

pub struct SmtpSession<S> {
    stream: BufStream<S>,
    timeout: Duration,
    extensions: Vec<String>,
}

impl<S> SmtpSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps an established transport and waits for the relay's `220`
    /// greeting. Nothing is sent yet; see [`SmtpSession::hello`].
    pub async fn open(stream: S, timeout: Duration) -> Result<Self, SmtpError> {
        let mut session = SmtpSession {
            stream: BufStream::new(stream),
            timeout,
            extensions: Vec::new(),
        };

        let greeting = session.read_reply().await?;
        debug!(greeting = %greeting, "connected to relay");
        accept(greeting, &[220])?;

        Ok(session)
    }

    /// Introduces ourselves with EHLO, or HELO if the relay refuses it, and
    /// records the advertised extensions.
    pub async fn hello(&mut self, helo_name: &str) -> Result<(), SmtpError> {
        let ehlo = self.command(&format!("EHLO {}", helo_name)).await?;
        if ehlo.code == 250 {
            self.extensions = ehlo
                .lines
                .into_iter()
                .skip(1)
                .map(|line| line.to_ascii_uppercase())
                .collect();
            return Ok(());
        }

        debug!(reply = %ehlo, "EHLO refused, falling back to HELO");
        self.extensions.clear();
        let helo = self.command(&format!("HELO {}", helo_name)).await?;
        accept(helo, &[250])
    }

    /// Parameters of an advertised EHLO extension, `""` if it has none.
    pub fn extension(&self, keyword: &str) -> Option<&str> {
        let keyword = keyword.to_ascii_uppercase();
        self.extensions.iter().find_map(|line| {
            let mut parts = line.splitn(2, ' ');
            match parts.next() {
                Some(name) if name == keyword => {
                    Some(parts.next().unwrap_or("").trim())
                }
                _ => None,
            }
        })
    }

    /// `AUTH PLAIN` with the credentials as initial response.
    pub async fn auth_plain(
        &mut self,
        username: &str,
        password: &str,
    ) -> Result<(), SmtpError> {
        let mechanisms = self.extension("AUTH").ok_or(SmtpError::AuthUnsupported)?;
        if !mechanisms.split_whitespace().any(|m| m == "PLAIN") {
            debug!(mechanisms, "PLAIN not listed by the relay, trying anyway");
        }

        let token = STANDARD.encode(format!("\0{}\0{}", username, password));
        trace!("C: AUTH PLAIN <redacted>");
        self.send_line(&format!("AUTH PLAIN {}", token)).await?;
        let reply = self.read_reply().await?;
        trace!(reply = %reply, "S:");

        accept(reply, &[235])
    }

    /// `MAIL FROM`, declaring an 8-bit body when the relay takes one.
    pub async fn mail_from(&mut self, sender: &str) -> Result<(), SmtpError> {
        let command = if self.extension("8BITMIME").is_some() {
            format!("MAIL FROM:<{}> BODY=8BITMIME", sender)
        } else {
            format!("MAIL FROM:<{}>", sender)
        };
        let reply = self.command(&command).await?;
        accept(reply, &[250])
    }

    pub async fn rcpt_to(&mut self, recipient: &str) -> Result<(), SmtpError> {
        let reply = self.command(&format!("RCPT TO:<{}>", recipient)).await?;
        accept(reply, &[250, 251])
    }

    /// Starts the DATA phase. The message is done once the returned stream
    /// is closed.
    pub async fn data(&mut self) -> Result<DataStream<'_, S>, SmtpError> {
        let reply = self.command("DATA").await?;
        accept(reply, &[354])?;

        Ok(DataStream {
            session: self,
            at_line_start: true,
            written: false,
            tail: [0; 2],
        })
    }

    /// Says goodbye and shuts the transport down.
    pub async fn quit(mut self) -> Result<(), SmtpError> {
        let reply = self.command("QUIT").await?;
        accept(reply, &[221])?;
        timed(self.timeout, self.stream.shutdown()).await
    }

    async fn command(&mut self, line: &str) -> Result<Reply, SmtpError> {
        trace!("C: {}", line);
        self.send_line(line).await?;
        let reply = self.read_reply().await?;
        trace!(reply = %reply, "S:");
        Ok(reply)
    }

    async fn send_line(&mut self, line: &str) -> Result<(), SmtpError> {
        let stream = &mut self.stream;
        timed(self.timeout, async {
            stream.write_all(line.as_bytes()).await?;
            stream.write_all(b"\r\n").await?;
            stream.flush().await
        })
        .await
    }

    /// Reads one CRLF-terminated line, never buffering more than
    /// [`MAX_REPLY_LINE_LEN`] bytes of it.
    async fn read_line(&mut self) -> Result<String, SmtpError> {
        let mut buf = Vec::new();
        let mut limited = (&mut self.stream).take(MAX_REPLY_LINE_LEN as u64);
        let read = timed(self.timeout, limited.read_until(b'\n', &mut buf)).await?;

        if read == 0 {
            return Err(SmtpError::ConnectionClosed);
        }
        let line = String::from_utf8_lossy(&buf);
        if !buf.ends_with(b"\n") {
            return if read < MAX_REPLY_LINE_LEN {
                Err(SmtpError::ConnectionClosed)
            } else {
                Err(malformed(&line))
            };
        }

        Ok(line.into_owned())
    }

    async fn read_reply(&mut self) -> Result<Reply, SmtpError> {
        let mut code = None;
        let mut lines = Vec::new();

        loop {
            let line = self.read_line().await?;

            let (line_code, last, text) = parse_reply_line(&line)?;
            if *code.get_or_insert(line_code) != line_code
                || lines.len() >= MAX_REPLY_LINES
            {
                return Err(malformed(&line));
            }
            lines.push(text.to_owned());

            if last {
                return Ok(Reply {
                    code: line_code,
                    lines,
                });
            }
        }
    }
}

/// Message content writer for the DATA phase. Lines starting with `.` are
/// dot-stuffed on the way out.
pub struct DataStream<'a, S> {
    session: &'a mut SmtpSession<S>,
    at_line_start: bool,
    written: bool,
    tail: [u8; 2],
}

impl<'a, S> DataStream<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), SmtpError> {
        let mut stuffed = Vec::with_capacity(bytes.len() + bytes.len() / 32);
        for &b in bytes {
            if self.at_line_start && b == b'.' {
                stuffed.push(b'.');
            }
            stuffed.push(b);
            self.at_line_start = b == b'\n';
            self.tail = [self.tail[1], b];
        }
        self.written |= !bytes.is_empty();

        let session = &mut *self.session;
        timed(session.timeout, session.stream.write_all(&stuffed)).await
    }

    /// Sends the end-of-data marker and waits for the relay to accept the
    /// message.
    pub async fn close(self) -> Result<(), SmtpError> {
        let marker: &[u8] = if !self.written || self.tail == *b"\r\n" {
            b".\r\n"
        } else {
            b"\r\n.\r\n"
        };

        let session = self.session;
        let stream = &mut session.stream;
        timed(session.timeout, async {
            stream.write_all(marker).await?;
            stream.flush().await
        })
        .await?;

        let reply = session.read_reply().await?;
        trace!(reply = %reply, "S:");
        accept(reply, &[250])
    }
}
