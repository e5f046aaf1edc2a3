//! SMTP session state machine
//!
//! One session per accepted connection, generic over the stream so the
//! same loop runs before and after a STARTTLS upgrade. Commands are
//! strictly sequential within a session; protocol errors end the
//! current transaction, never the connection, while timeouts and
//! unrecoverable frames close it with a 421.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SmtpConfig;
use crate::error::Error;
use crate::manager::MessageManager;

use super::command::Command;

pub(crate) const SERVER_NAME: &str = "inbucket";

/// Command lines longer than this are hostile; the connection closes.
const MAX_LINE: u64 = 4096;

/// Where the session loop left the connection.
pub(crate) enum SessionEnd<S> {
    Closed,
    /// The client was told to proceed with STARTTLS; the caller
    /// performs the handshake and restarts the session over TLS.
    UpgradeTls(S),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Awaiting EHLO/HELO.
    Ready,
    /// Awaiting MAIL FROM.
    MailFrom,
    /// Accumulating RCPT TO; DATA is legal once one is present.
    RcptTo,
}

enum DataEnd {
    Complete(Vec<u8>),
    TooLarge,
    TimedOut,
    Closed,
}

pub(crate) struct Session {
    pub config: Arc<SmtpConfig>,
    pub manager: Arc<MessageManager>,
    pub tls_available: bool,
    pub shutdown: CancellationToken,
}

impl Session {
    /// Drive one connection from greeting to QUIT, disconnect, or TLS
    /// upgrade.
    pub(crate) async fn run<S>(&self, stream: S) -> SessionEnd<S>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut reader = BufReader::new(stream);
        if write_line(&mut reader, &format!("220 {SERVER_NAME} ESMTP ready"))
            .await
            .is_err()
        {
            return SessionEnd::Closed;
        }
        self.command_loop(reader).await
    }

    /// Continue on the upgraded stream after STARTTLS. The session
    /// resets to awaiting EHLO, but no second banner is sent; the
    /// client proceeds straight to its command.
    pub(crate) async fn run_upgraded<S>(&self, stream: S) -> SessionEnd<S>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.command_loop(BufReader::new(stream)).await
    }

    async fn command_loop<S>(&self, mut reader: BufReader<S>) -> SessionEnd<S>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        macro_rules! reply {
            ($line:expr) => {
                if write_line(&mut reader, $line).await.is_err() {
                    return SessionEnd::Closed;
                }
            };
        }

        let mut state = State::Ready;
        let mut from = String::new();
        let mut recipients: Vec<String> = Vec::new();

        loop {
            let line = tokio::select! {
                () = self.shutdown.cancelled() => {
                    let _ = write_line(&mut reader, "421 4.3.0 service shutting down").await;
                    return SessionEnd::Closed;
                }
                read = timeout(self.config.command_timeout, read_line(&mut reader)) => {
                    match read {
                        Ok(Ok(Some(line))) => line,
                        Ok(Ok(None)) => return SessionEnd::Closed,
                        Ok(Err(e)) => {
                            debug!(error = %e, "command read failed");
                            return SessionEnd::Closed;
                        }
                        Err(_) => {
                            let _ = write_line(&mut reader, "421 4.4.2 idle timeout, closing").await;
                            return SessionEnd::Closed;
                        }
                    }
                }
            };

            let command = match Command::parse(&line) {
                Ok(command) => command,
                Err(e) => {
                    debug!(error = %e, "rejected command line");
                    reply!("501 5.5.4 syntax error in parameters");
                    continue;
                }
            };

            match command {
                Command::Noop => reply!("250 2.0.0 OK"),
                Command::Quit => {
                    reply!(&format!("221 2.0.0 {SERVER_NAME} closing connection"));
                    return SessionEnd::Closed;
                }
                Command::Rset => {
                    from.clear();
                    recipients.clear();
                    state = State::MailFrom;
                    reply!("250 2.0.0 flushed");
                }
                Command::Helo(client) => {
                    from.clear();
                    recipients.clear();
                    state = State::MailFrom;
                    reply!(&format!("250 {SERVER_NAME} greets {client}"));
                }
                Command::Ehlo(client) => {
                    from.clear();
                    recipients.clear();
                    state = State::MailFrom;

                    let mut caps = vec![
                        format!("{SERVER_NAME} greets {client}"),
                        "PIPELINING".to_string(),
                        "8BITMIME".to_string(),
                    ];
                    if self.tls_available {
                        caps.push("STARTTLS".to_string());
                    }
                    caps.push(format!("SIZE {}", self.config.max_message_bytes));

                    for (i, cap) in caps.iter().enumerate() {
                        let sep = if i + 1 == caps.len() { ' ' } else { '-' };
                        reply!(&format!("250{sep}{cap}"));
                    }
                }
                Command::StartTls => {
                    if self.tls_available {
                        reply!("220 2.0.0 ready to start TLS");
                        return SessionEnd::UpgradeTls(reader.into_inner());
                    }
                    reply!("454 4.7.0 TLS not available");
                }
                Command::MailFrom { path, size } => match state {
                    State::Ready => reply!("503 5.5.1 say hello first"),
                    State::RcptTo => reply!("503 5.5.1 nested MAIL command"),
                    State::MailFrom => {
                        if size.is_some_and(|s| s > self.config.max_message_bytes) {
                            reply!("552 5.3.4 message exceeds maximum size");
                        } else {
                            from = path;
                            state = State::RcptTo;
                            reply!("250 2.1.0 sender OK");
                        }
                    }
                },
                Command::RcptTo(path) => match state {
                    State::Ready => reply!("503 5.5.1 say hello first"),
                    State::MailFrom => reply!("503 5.5.1 need MAIL before RCPT"),
                    State::RcptTo => {
                        if recipients.len() >= self.config.max_recipients {
                            reply!("452 4.5.3 too many recipients");
                        } else {
                            match self.manager.policy().check_recipient(&path) {
                                Ok(_) => {
                                    recipients.push(path);
                                    reply!("250 2.1.5 recipient OK");
                                }
                                Err(Error::BadAddress(_)) => {
                                    reply!("501 5.1.3 bad recipient address syntax");
                                }
                                Err(Error::PolicyRejected(_)) => {
                                    reply!("550 5.7.1 recipient refused by policy");
                                }
                                Err(e) => {
                                    warn!(error = %e, "recipient check failed");
                                    reply!("451 4.3.0 recipient check failed");
                                }
                            }
                        }
                    }
                },
                Command::Data => {
                    if state != State::RcptTo || recipients.is_empty() {
                        reply!("503 5.5.1 need RCPT before DATA");
                        continue;
                    }
                    reply!("354 end data with <CRLF>.<CRLF>");

                    match self.read_data(&mut reader).await {
                        DataEnd::TimedOut => {
                            let _ = write_line(&mut reader, "421 4.4.2 data timeout, closing").await;
                            return SessionEnd::Closed;
                        }
                        DataEnd::Closed => return SessionEnd::Closed,
                        DataEnd::TooLarge => {
                            reply!("552 5.3.4 message too large, discarded");
                        }
                        DataEnd::Complete(source) => {
                            // Per-recipient policy verdicts were already
                            // reported at RCPT time; the transaction as a
                            // whole still succeeds.
                            match self.manager.deliver(&from, &recipients, &source).await {
                                Ok(stored) => {
                                    debug!(stored, "transaction complete");
                                    reply!("250 2.0.0 message accepted");
                                }
                                Err(Error::StoreFull) => {
                                    reply!("452 4.3.1 insufficient system storage");
                                }
                                Err(e) => {
                                    warn!(error = %e, "delivery failed");
                                    reply!("451 4.3.0 error processing message");
                                }
                            }
                        }
                    }
                    from.clear();
                    recipients.clear();
                    state = State::MailFrom;
                }
                Command::Unknown(verb) => {
                    debug!(verb = %verb, "unrecognized command");
                    reply!("500 5.5.2 command not recognized");
                }
            }
        }
    }

    /// Consume the DATA payload up to the `CRLF.CRLF` terminator,
    /// reversing dot-stuffing and enforcing the size cap. An oversized
    /// payload is discarded but still consumed, so the session can
    /// carry on afterwards.
    async fn read_data<S>(&self, reader: &mut BufReader<S>) -> DataEnd
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let max = usize::try_from(self.config.max_message_bytes).unwrap_or(usize::MAX);
        let mut buf: Vec<u8> = Vec::new();
        let mut too_large = false;

        loop {
            let mut line: Vec<u8> = Vec::new();
            let limit = self.config.max_message_bytes + 1024;
            let read = timeout(
                self.config.data_timeout,
                (&mut *reader).take(limit).read_until(b'\n', &mut line),
            )
            .await;

            match read {
                Err(_) => return DataEnd::TimedOut,
                Ok(Err(e)) => {
                    debug!(error = %e, "data read failed");
                    return DataEnd::Closed;
                }
                Ok(Ok(0)) => return DataEnd::Closed,
                Ok(Ok(_)) => {}
            }

            if !line.ends_with(b"\n") {
                // A single line blew straight through the size cap;
                // keep consuming until the terminator shows up.
                too_large = true;
                buf.clear();
                continue;
            }

            if line == b".\r\n" || (self.config.allow_bare_lf && line == b".\n") {
                break;
            }

            if too_large {
                continue;
            }

            // RFC 5321 4.5.2: a leading dot on a data line was added
            // by the client; strip it.
            let content: &[u8] = if line.first() == Some(&b'.') {
                &line[1..]
            } else {
                &line
            };

            if buf.len() + content.len() > max {
                too_large = true;
                buf.clear();
                continue;
            }
            buf.extend_from_slice(content);
        }

        if too_large {
            DataEnd::TooLarge
        } else {
            DataEnd::Complete(buf)
        }
    }
}

/// Read one command line, without its terminator.
///
/// `Ok(None)` means the peer disconnected. Over-long lines are treated
/// as unrecoverable.
async fn read_line<S>(reader: &mut BufReader<S>) -> std::io::Result<Option<String>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    let n = (&mut *reader).take(MAX_LINE).read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    if !buf.ends_with(b"\n") {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "command line too long",
        ));
    }
    let line = String::from_utf8_lossy(&buf)
        .trim_end_matches(['\r', '\n'])
        .to_string();
    Ok(Some(line))
}

/// Write a reply line (terminator added) and flush.
pub(crate) async fn write_line<S>(reader: &mut BufReader<S>, line: &str) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let stream = reader.get_mut();
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\r\n").await?;
    stream.flush().await
}
