//! Read-only POP3 server
//!
//! A thin consumer of the manager: `USER` names the mailbox (any
//! password is accepted — this is a capture service, there is nothing
//! to protect), the maildrop is a snapshot taken at login, and `DELE`
//! marks are committed through the manager on QUIT so hub subscribers
//! observe the deletions.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::manager::MessageManager;
use crate::message::MessageSummary;
use crate::metrics;

const GREETING: &str = "+OK inbucket POP3 server ready";
const COMMAND_TIMEOUT: Duration = Duration::from_secs(600);
const MAX_LINE: u64 = 1024;

pub struct Pop3Server {
    manager: Arc<MessageManager>,
}

/// Maildrop snapshot for one authenticated session.
///
/// Message numbers are 1-based and stable for the session's lifetime;
/// deleted numbers keep their slot but answer `-ERR`.
struct Maildrop {
    mailbox: String,
    messages: Vec<MessageSummary>,
    deleted: Vec<bool>,
}

impl Maildrop {
    fn get(&self, number: usize) -> Option<&MessageSummary> {
        if number == 0 || number > self.messages.len() || self.deleted[number - 1] {
            return None;
        }
        Some(&self.messages[number - 1])
    }

    fn live(&self) -> impl Iterator<Item = (usize, &MessageSummary)> {
        self.messages
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.deleted[*i])
            .map(|(i, m)| (i + 1, m))
    }

    fn stat(&self) -> (usize, u64) {
        self.live()
            .fold((0, 0), |(n, bytes), (_, m)| (n + 1, bytes + m.size))
    }
}

impl Pop3Server {
    #[must_use]
    pub fn new(manager: Arc<MessageManager>) -> Self {
        Self { manager }
    }

    /// Accept connections until `shutdown` fires.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
        tracker: TaskTracker,
    ) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "POP3 listening");
        }

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    debug!("POP3 accept loop stopped");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    metrics::counters()
                        .connections_opened
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(%peer, "POP3 connection accepted");

                    let server = Arc::clone(&self);
                    let shutdown = shutdown.clone();
                    tracker.spawn(async move {
                        server.handle_connection(stream, shutdown).await;
                    });
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, shutdown: CancellationToken) {
        let mut reader = BufReader::new(stream);
        if write_line(&mut reader, GREETING).await.is_err() {
            return;
        }

        let mut username: Option<String> = None;
        let mut maildrop: Option<Maildrop> = None;

        loop {
            let line = tokio::select! {
                () = shutdown.cancelled() => {
                    let _ = write_line(&mut reader, "-ERR server shutting down").await;
                    return;
                }
                read = timeout(COMMAND_TIMEOUT, read_line(&mut reader)) => {
                    match read {
                        Ok(Ok(Some(line))) => line,
                        Ok(Ok(None)) | Ok(Err(_)) => return,
                        Err(_) => {
                            let _ = write_line(&mut reader, "-ERR idle timeout").await;
                            return;
                        }
                    }
                }
            };

            let (verb, arg) = match line.split_once(char::is_whitespace) {
                Some((verb, arg)) => (verb.to_ascii_uppercase(), arg.trim()),
                None => (line.trim().to_ascii_uppercase(), ""),
            };

            let ok = match (verb.as_str(), &mut maildrop) {
                ("CAPA", _) => {
                    write_multiline(
                        &mut reader,
                        "+OK capability list follows",
                        &["USER", "UIDL", "TOP"],
                    )
                    .await
                }
                ("NOOP", _) => write_line(&mut reader, "+OK").await,
                ("QUIT", drop_state) => {
                    if let Some(maildrop) = drop_state.take() {
                        self.commit_deletes(&maildrop).await;
                    }
                    let _ = write_line(&mut reader, "+OK inbucket POP3 server signing off").await;
                    return;
                }
                ("USER", None) => {
                    if arg.is_empty() {
                        write_line(&mut reader, "-ERR USER requires a mailbox name").await
                    } else {
                        username = Some(arg.to_string());
                        write_line(&mut reader, "+OK send PASS").await
                    }
                }
                ("PASS", drop_state) if drop_state.is_none() => match username.clone() {
                    None => write_line(&mut reader, "-ERR send USER first").await,
                    Some(user) => match self.open_maildrop(&user) {
                        Ok(opened) => {
                            let (count, bytes) = opened.stat();
                            let reply =
                                format!("+OK maildrop has {count} messages ({bytes} octets)");
                            *drop_state = Some(opened);
                            write_line(&mut reader, &reply).await
                        }
                        Err(e) => {
                            debug!(user = %user, error = %e, "maildrop open failed");
                            write_line(&mut reader, "-ERR invalid mailbox").await
                        }
                    },
                },
                ("STAT", Some(maildrop)) => {
                    let (count, bytes) = maildrop.stat();
                    write_line(&mut reader, &format!("+OK {count} {bytes}")).await
                }
                ("LIST", Some(maildrop)) => {
                    if arg.is_empty() {
                        let lines: Vec<String> = maildrop
                            .live()
                            .map(|(n, m)| format!("{n} {}", m.size))
                            .collect();
                        let (count, bytes) = maildrop.stat();
                        let header = format!("+OK {count} messages ({bytes} octets)");
                        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
                        write_multiline(&mut reader, &header, &refs).await
                    } else {
                        match parse_number(arg).and_then(|n| maildrop.get(n).map(|m| (n, m))) {
                            Some((n, m)) => {
                                write_line(&mut reader, &format!("+OK {n} {}", m.size)).await
                            }
                            None => write_line(&mut reader, "-ERR no such message").await,
                        }
                    }
                }
                ("UIDL", Some(maildrop)) => {
                    if arg.is_empty() {
                        let lines: Vec<String> = maildrop
                            .live()
                            .map(|(n, m)| format!("{n} {}", m.id))
                            .collect();
                        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
                        write_multiline(&mut reader, "+OK", &refs).await
                    } else {
                        match parse_number(arg).and_then(|n| maildrop.get(n).map(|m| (n, m))) {
                            Some((n, m)) => {
                                write_line(&mut reader, &format!("+OK {n} {}", m.id)).await
                            }
                            None => write_line(&mut reader, "-ERR no such message").await,
                        }
                    }
                }
                ("RETR", Some(maildrop)) => match parse_number(arg) {
                    Some(n) => self.retr(&mut reader, maildrop, n, None).await,
                    None => write_line(&mut reader, "-ERR no such message").await,
                },
                ("TOP", Some(maildrop)) => {
                    let mut parts = arg.split_whitespace();
                    match (
                        parts.next().and_then(parse_number),
                        parts.next().and_then(|k| k.parse::<usize>().ok()),
                    ) {
                        (Some(n), Some(k)) => self.retr(&mut reader, maildrop, n, Some(k)).await,
                        _ => write_line(&mut reader, "-ERR TOP requires msg and line count").await,
                    }
                }
                ("DELE", Some(maildrop)) => match parse_number(arg) {
                    Some(n) if maildrop.get(n).is_some() => {
                        maildrop.deleted[n - 1] = true;
                        write_line(&mut reader, &format!("+OK message {n} deleted")).await
                    }
                    _ => write_line(&mut reader, "-ERR no such message").await,
                },
                ("RSET", Some(maildrop)) => {
                    maildrop.deleted.fill(false);
                    write_line(&mut reader, "+OK").await
                }
                (_, Some(_)) => write_line(&mut reader, "-ERR unknown command").await,
                (_, None) => write_line(&mut reader, "-ERR command not valid before PASS").await,
            };

            if ok.is_err() {
                return;
            }
        }
    }

    fn open_maildrop(&self, user: &str) -> crate::error::Result<Maildrop> {
        let mailbox = self.manager.policy().mailbox_name(user)?;
        let messages = self.manager.get_messages(&mailbox)?;
        let deleted = vec![false; messages.len()];
        Ok(Maildrop {
            mailbox,
            messages,
            deleted,
        })
    }

    async fn retr<S>(
        &self,
        reader: &mut BufReader<S>,
        maildrop: &Maildrop,
        number: usize,
        top_lines: Option<usize>,
    ) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(summary) = maildrop.get(number) else {
            return write_line(reader, "-ERR no such message").await;
        };

        let message = match self.manager.get_message(&maildrop.mailbox, &summary.id) {
            Ok(message) => message,
            Err(e) => {
                debug!(mailbox = %maildrop.mailbox, id = %summary.id, error = %e, "retr failed");
                return write_line(reader, "-ERR no such message").await;
            }
        };

        let body = match top_lines {
            None => {
                write_line(reader, &format!("+OK {} octets", message.summary.size)).await?;
                stuff_dots(&message.source)
            }
            Some(k) => {
                write_line(reader, "+OK").await?;
                stuff_dots(&head_of(&message.source, k))
            }
        };
        let stream = reader.get_mut();
        stream.write_all(&body).await?;
        stream.write_all(b".\r\n").await?;
        stream.flush().await
    }

    async fn commit_deletes(&self, maildrop: &Maildrop) {
        for (i, deleted) in maildrop.deleted.iter().enumerate() {
            if !deleted {
                continue;
            }
            let id = &maildrop.messages[i].id;
            if let Err(e) = self.manager.remove_message(&maildrop.mailbox, id).await {
                warn!(mailbox = %maildrop.mailbox, id = %id, error = %e, "DELE commit failed");
            }
        }
    }
}

/// Byte-stuff an RFC 5321 payload for the wire: lines starting with a
/// dot get one prepended. A source missing a final terminator gets one.
fn stuff_dots(source: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(source.len() + 16);
    for line in source.split_inclusive(|b| *b == b'\n') {
        if line.first() == Some(&b'.') {
            out.push(b'.');
        }
        out.extend_from_slice(line);
    }
    if !out.ends_with(b"\n") {
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Headers plus the first `lines` body lines, for TOP.
fn head_of(source: &[u8], lines: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut in_body = false;
    let mut body_lines = 0;
    for line in source.split_inclusive(|b| *b == b'\n') {
        if in_body {
            if body_lines >= lines {
                break;
            }
            body_lines += 1;
        } else if line == b"\r\n" || line == b"\n" {
            in_body = true;
        }
        out.extend_from_slice(line);
    }
    out
}

fn parse_number(arg: &str) -> Option<usize> {
    arg.trim().parse().ok().filter(|n| *n > 0)
}

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
    Ok(Some(
        String::from_utf8_lossy(&buf)
            .trim_end_matches(['\r', '\n'])
            .to_string(),
    ))
}

async fn write_line<S>(reader: &mut BufReader<S>, line: &str) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let stream = reader.get_mut();
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\r\n").await?;
    stream.flush().await
}

async fn write_multiline<S>(
    reader: &mut BufReader<S>,
    header: &str,
    lines: &[&str],
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_line(reader, header).await?;
    for line in lines {
        write_line(reader, line).await?;
    }
    write_line(reader, ".").await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_stuffing_doubles_leading_dots() {
        let stuffed = stuff_dots(b"one\r\n.two\r\n..three\r\n");
        assert_eq!(stuffed, b"one\r\n..two\r\n...three\r\n");
    }

    #[test]
    fn dot_stuffing_terminates_ragged_source() {
        assert_eq!(stuff_dots(b"no newline"), b"no newline\r\n");
    }

    #[test]
    fn head_of_keeps_headers_and_counted_body_lines() {
        let source = b"Subject: t\r\nFrom: a@x\r\n\r\none\r\ntwo\r\nthree\r\n";
        assert_eq!(head_of(source, 2), b"Subject: t\r\nFrom: a@x\r\n\r\none\r\ntwo\r\n");
        assert_eq!(head_of(source, 0), b"Subject: t\r\nFrom: a@x\r\n\r\n");
    }

    #[test]
    fn message_numbers_are_one_based_and_stable() {
        let summary = |id: &str| MessageSummary {
            mailbox: "u".to_string(),
            id: id.to_string(),
            from: "a@x".to_string(),
            to: vec!["u@y".to_string()],
            subject: "s".to_string(),
            date: chrono::Utc::now(),
            size: 10,
            seen: false,
        };
        let mut maildrop = Maildrop {
            mailbox: "u".to_string(),
            messages: vec![summary("1"), summary("2"), summary("3")],
            deleted: vec![false; 3],
        };

        assert_eq!(maildrop.get(1).unwrap().id, "1");
        assert!(maildrop.get(0).is_none());
        assert!(maildrop.get(4).is_none());

        maildrop.deleted[1] = true;
        assert!(maildrop.get(2).is_none());
        assert_eq!(maildrop.get(3).unwrap().id, "3");
        assert_eq!(maildrop.stat(), (2, 20));
        let numbers: Vec<usize> = maildrop.live().map(|(n, _)| n).collect();
        assert_eq!(numbers, vec![1, 3]);
    }
}
