//! Service configuration
//!
//! All tunables are read from `INBUCKET_`-prefixed environment
//! variables, with a `.env` file honored when present. Durations use
//! the compact `300ms` / `30s` / `5m` / `2h` notation and may be
//! concatenated (`1h30m`); `0` disables where documented.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::policy::{AddressPolicy, MailboxNaming};

const ENV_PREFIX: &str = "INBUCKET_";

/// SMTP ingress settings.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub addr: String,
    pub max_recipients: usize,
    /// Hard cap on a single DATA payload, in bytes.
    pub max_message_bytes: u64,
    pub command_timeout: Duration,
    pub data_timeout: Duration,
    /// Concurrent session cap; excess connections get an immediate 421.
    pub max_connections: usize,
    /// Accept a bare-LF `.` terminator in DATA as well as CRLF.
    pub allow_bare_lf: bool,
    pub default_accept: bool,
    pub accept_domains: Vec<String>,
    pub reject_domains: Vec<String>,
    pub default_store: bool,
    pub store_domains: Vec<String>,
    /// PEM certificate chain + private key; both present enables STARTTLS.
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

/// Storage backend selection and retention settings.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Backend name in the constructor registry (`memory` or `file`).
    pub backend: String,
    /// Backend parameter; the filesystem root for the `file` backend.
    pub params: String,
    /// Per-mailbox message cap; 0 means unlimited.
    pub mailbox_message_cap: usize,
    /// Maximum message age; zero disables the retention sweeper.
    pub retention_period: Duration,
    /// Sweep cadence.
    pub retention_sleep: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mailbox_naming: MailboxNaming,
    pub smtp: SmtpConfig,
    pub pop3_addr: String,
    pub web_addr: String,
    pub storage: StorageConfig,
    /// Per-subscriber hub queue length.
    pub hub_buffer: usize,
    /// Grace period for in-flight sessions on shutdown.
    pub shutdown_timeout: Duration,
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// Reads from `.env` if present. Every option has a default; only
    /// malformed values produce an error.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            mailbox_naming: env_str("MAILBOXNAMING", "local").parse()?,
            smtp: SmtpConfig {
                addr: env_str("SMTP_ADDR", "0.0.0.0:2500"),
                max_recipients: env_parse("SMTP_MAXRECIPIENTS", 200)?,
                max_message_bytes: env_parse("SMTP_MAXMESSAGEBYTES", 10_240_000)?,
                command_timeout: env_duration("SMTP_TIMEOUT", Duration::from_secs(300))?,
                data_timeout: env_duration("SMTP_DATATIMEOUT", Duration::from_secs(600))?,
                max_connections: env_parse("SMTP_MAXCONNECTIONS", 50)?,
                allow_bare_lf: env_bool("SMTP_ALLOWBARELF", true)?,
                default_accept: env_bool("SMTP_DEFAULTACCEPT", true)?,
                accept_domains: env_list("SMTP_ACCEPTDOMAINS"),
                reject_domains: env_list("SMTP_REJECTDOMAINS"),
                default_store: env_bool("SMTP_DEFAULTSTORE", true)?,
                store_domains: env_list("SMTP_STOREDOMAINS"),
                tls_cert: env_path("SMTP_TLSCERT"),
                tls_key: env_path("SMTP_TLSPRIVKEY"),
            },
            pop3_addr: env_str("POP3_ADDR", "0.0.0.0:1100"),
            web_addr: env_str("WEB_ADDR", "0.0.0.0:9000"),
            storage: StorageConfig {
                backend: env_str("STORAGE_TYPE", "memory"),
                params: env_str("STORAGE_PARAMS", ""),
                mailbox_message_cap: env_parse("STORAGE_MAILBOXMSGCAP", 500)?,
                retention_period: env_duration("STORAGE_RETENTIONPERIOD", Duration::ZERO)?,
                retention_sleep: env_duration("STORAGE_RETENTIONSLEEP", Duration::from_secs(60))?,
            },
            hub_buffer: env_parse("HUB_BUFFER", 32)?,
            shutdown_timeout: env_duration("SHUTDOWNTIMEOUT", Duration::from_secs(10))?,
        })
    }

    /// Address policy assembled from the naming mode and SMTP gates.
    #[must_use]
    pub fn policy(&self) -> AddressPolicy {
        AddressPolicy {
            naming: self.mailbox_naming,
            default_accept: self.smtp.default_accept,
            accept_domains: self.smtp.accept_domains.clone(),
            reject_domains: self.smtp.reject_domains.clone(),
            default_store: self.smtp.default_store,
            store_domains: self.smtp.store_domains.clone(),
        }
    }
}

fn env_raw(key: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{key}"))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn env_str(key: &str, default: &str) -> String {
    env_raw(key).unwrap_or_else(|| default.to_string())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env_raw(key).map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env_raw(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("invalid {ENV_PREFIX}{key}: {raw:?}"))),
        None => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match env_raw(key) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" | "on" => Ok(true),
            "false" | "no" | "0" | "off" => Ok(false),
            _ => Err(Error::Config(format!(
                "invalid {ENV_PREFIX}{key}: {raw:?}"
            ))),
        },
        None => Ok(default),
    }
}

/// Comma-separated list, trimmed and lowercased. Absent means empty.
fn env_list(key: &str) -> Vec<String> {
    env_raw(key)
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn env_duration(key: &str, default: Duration) -> Result<Duration> {
    match env_raw(key) {
        Some(raw) => parse_duration(raw.trim())
            .ok_or_else(|| Error::Config(format!("invalid {ENV_PREFIX}{key}: {raw:?}"))),
        None => Ok(default),
    }
}

/// Parse a compact duration such as `300ms`, `30s`, `5m`, `2h`, `1h30m`
/// or the bare zero `0`.
fn parse_duration(s: &str) -> Option<Duration> {
    if s == "0" {
        return Some(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.chars().take_while(char::is_ascii_digit).count();
        if digits == 0 {
            return None;
        }
        let value: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];

        let unit = rest.chars().take_while(char::is_ascii_alphabetic).count();
        let step = match &rest[..unit] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            "d" => Duration::from_secs(value * 86_400),
            _ => return None,
        };
        rest = &rest[unit..];
        total += step;
    }
    Some(total)
}
