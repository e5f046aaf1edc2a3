#![allow(dead_code)]

//! Shared test harness
//!
//! Boots the full application on ephemeral ports and provides a
//! minimal line-oriented SMTP client plus a bare-bones HTTP/1.1
//! helper, so the end-to-end tests talk to the real listeners.

use std::net::SocketAddr;
use std::time::Duration;

use inbucket::config::{Config, SmtpConfig, StorageConfig};
use inbucket::{App, MailboxNaming};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Everything on loopback port 0, memory storage, no cap, no retention.
pub fn test_config() -> Config {
    Config {
        mailbox_naming: MailboxNaming::Local,
        smtp: SmtpConfig {
            addr: "127.0.0.1:0".to_string(),
            max_recipients: 16,
            max_message_bytes: 10_240_000,
            command_timeout: Duration::from_secs(10),
            data_timeout: Duration::from_secs(10),
            max_connections: 8,
            allow_bare_lf: true,
            default_accept: true,
            accept_domains: Vec::new(),
            reject_domains: Vec::new(),
            default_store: true,
            store_domains: Vec::new(),
            tls_cert: None,
            tls_key: None,
        },
        pop3_addr: "127.0.0.1:0".to_string(),
        web_addr: "127.0.0.1:0".to_string(),
        storage: StorageConfig {
            backend: "memory".to_string(),
            params: String::new(),
            mailbox_message_cap: 0,
            retention_period: Duration::ZERO,
            retention_sleep: Duration::from_secs(60),
        },
        hub_buffer: 32,
        shutdown_timeout: Duration::from_secs(5),
    }
}

pub async fn start_app() -> App {
    App::start(test_config()).await.expect("start app")
}

pub async fn start_app_with(tweak: impl FnOnce(&mut Config)) -> App {
    let mut config = test_config();
    tweak(&mut config);
    App::start(config).await.expect("start app")
}

/// A deliberately small SMTP client: one command in, replies out.
pub struct SmtpClient {
    reader: BufReader<TcpStream>,
}

impl SmtpClient {
    /// Connect and consume the 220 greeting.
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect to SMTP");
        let mut client = Self {
            reader: BufReader::new(stream),
        };
        let greeting = client.read_line().await;
        assert!(
            greeting.starts_with("220"),
            "unexpected greeting: {greeting}"
        );
        client
    }

    pub async fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.expect("read reply");
        line.trim_end().to_string()
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.reader
            .get_mut()
            .write_all(bytes)
            .await
            .expect("write to server");
        self.reader.get_mut().flush().await.expect("flush");
    }

    /// Send one command and return its single-line reply.
    pub async fn cmd(&mut self, line: &str) -> String {
        self.send_raw(format!("{line}\r\n").as_bytes()).await;
        self.read_line().await
    }

    /// EHLO and collect the multi-line capability reply.
    pub async fn ehlo(&mut self, client_name: &str) -> Vec<String> {
        self.send_raw(format!("EHLO {client_name}\r\n").as_bytes())
            .await;
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await;
            let done = line.len() < 4 || !line[3..].starts_with('-');
            lines.push(line);
            if done {
                break;
            }
        }
        lines
    }

    /// Full transaction. `data` must be terminator-ready (CRLF line
    /// endings, no trailing dot line). Returns the reply to the dot.
    pub async fn send_mail(&mut self, from: &str, rcpts: &[&str], data: &str) -> String {
        let reply = self.cmd(&format!("MAIL FROM:<{from}>")).await;
        assert!(reply.starts_with("250"), "MAIL rejected: {reply}");
        for rcpt in rcpts {
            let reply = self.cmd(&format!("RCPT TO:<{rcpt}>")).await;
            assert!(reply.starts_with("250"), "RCPT rejected: {reply}");
        }
        let reply = self.cmd("DATA").await;
        assert!(reply.starts_with("354"), "DATA rejected: {reply}");
        self.send_raw(data.as_bytes()).await;
        self.cmd(".").await
    }
}

/// A line-oriented POP3 client in the same spirit.
pub struct Pop3Client {
    reader: BufReader<TcpStream>,
}

impl Pop3Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect to POP3");
        let mut client = Self {
            reader: BufReader::new(stream),
        };
        let greeting = client.read_line().await;
        assert!(greeting.starts_with("+OK"), "unexpected greeting: {greeting}");
        client
    }

    pub async fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.expect("read reply");
        line.trim_end().to_string()
    }

    pub async fn cmd(&mut self, line: &str) -> String {
        self.reader
            .get_mut()
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .expect("write to server");
        self.reader.get_mut().flush().await.expect("flush");
        self.read_line().await
    }

    /// Collect a multi-line response body up to the bare dot.
    pub async fn read_multiline(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await;
            if line == "." {
                break;
            }
            lines.push(line);
        }
        lines
    }
}

/// Minimal HTTP/1.1 exchange against the running web listener.
/// Returns (status code, body).
pub async fn http_request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    body: Option<&str>,
) -> (u16, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).await.expect("connect to HTTP");

    let mut request = format!("{method} {path} HTTP/1.1\r\nHost: inbucket.test\r\n");
    if let Some(body) = body {
        request.push_str("Content-Type: application/json\r\n");
        request.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    request.push_str("Connection: close\r\n\r\n");
    if let Some(body) = body {
        request.push_str(body);
    }
    stream
        .write_all(request.as_bytes())
        .await
        .expect("write request");

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.expect("read response");

    let header_end = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("complete response header");
    let head = String::from_utf8_lossy(&response[..header_end]).to_string();
    let status: u16 = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status line");

    let mut body = response[header_end + 4..].to_vec();
    // Responses come back chunked unless a content-length was known.
    if head.to_ascii_lowercase().contains("transfer-encoding: chunked") {
        body = dechunk(&body);
    }
    (status, body)
}

pub async fn http_get(addr: SocketAddr, path: &str) -> (u16, Vec<u8>) {
    http_request(addr, "GET", path, None).await
}

fn dechunk(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut rest = raw;
    loop {
        let Some(eol) = rest.windows(2).position(|w| w == b"\r\n") else {
            break;
        };
        let Ok(size) = usize::from_str_radix(String::from_utf8_lossy(&rest[..eol]).trim(), 16)
        else {
            break;
        };
        if size == 0 {
            break;
        }
        let start = eol + 2;
        out.extend_from_slice(&rest[start..start + size]);
        rest = &rest[start + size + 2..];
    }
    out
}
