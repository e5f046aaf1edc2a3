//! SMTP command parsing
//!
//! One line in, one [`Command`] out. Verbs are matched
//! case-insensitively; reverse/forward paths accept both the
//! angle-bracket form and a bare address, and source routes
//! (`<@relay:user@host>`) are reduced to the final address.

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Helo(String),
    Ehlo(String),
    MailFrom {
        /// Reverse path; empty for the null sender `<>`.
        path: String,
        /// Declared message size from the `SIZE=` parameter.
        size: Option<u64>,
    },
    RcptTo(String),
    Data,
    Rset,
    Noop,
    Quit,
    StartTls,
    Unknown(String),
}

impl Command {
    /// Parse one command line (without its terminator).
    ///
    /// Syntax problems inside a recognized verb are `Protocol` errors
    /// (a 501 to the client); an unrecognized verb parses as
    /// [`Command::Unknown`] (a 500).
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };

        match verb.to_ascii_uppercase().as_str() {
            "HELO" => Ok(Self::Helo(require_arg(rest, "HELO")?)),
            "EHLO" => Ok(Self::Ehlo(require_arg(rest, "EHLO")?)),
            "MAIL" => {
                let rest = strip_keyword(rest, "FROM:")
                    .ok_or_else(|| Error::Protocol("MAIL requires FROM:<address>".into()))?;
                let (path, params) = parse_path(rest);
                Ok(Self::MailFrom {
                    path,
                    size: parse_size(params)?,
                })
            }
            "RCPT" => {
                let rest = strip_keyword(rest, "TO:")
                    .ok_or_else(|| Error::Protocol("RCPT requires TO:<address>".into()))?;
                let (path, _) = parse_path(rest);
                if path.is_empty() {
                    return Err(Error::Protocol("RCPT requires a forward path".into()));
                }
                Ok(Self::RcptTo(path))
            }
            "DATA" => Ok(Self::Data),
            "RSET" => Ok(Self::Rset),
            "NOOP" => Ok(Self::Noop),
            "QUIT" => Ok(Self::Quit),
            "STARTTLS" => Ok(Self::StartTls),
            other => Ok(Self::Unknown(other.to_string())),
        }
    }
}

fn require_arg(rest: &str, verb: &str) -> Result<String> {
    if rest.is_empty() {
        return Err(Error::Protocol(format!("{verb} requires an argument")));
    }
    Ok(rest.to_string())
}

/// Case-insensitive keyword prefix strip (`FROM:` / `TO:`).
fn strip_keyword<'a>(rest: &'a str, keyword: &str) -> Option<&'a str> {
    match (rest.get(..keyword.len()), rest.get(keyword.len()..)) {
        (Some(head), Some(tail)) if head.eq_ignore_ascii_case(keyword) => {
            Some(tail.trim_start())
        }
        _ => None,
    }
}

/// Split an address path from its trailing ESMTP parameters.
fn parse_path(rest: &str) -> (String, &str) {
    let rest = rest.trim_start();
    if let Some(inner) = rest.strip_prefix('<') {
        if let Some(end) = inner.find('>') {
            return (strip_source_route(&inner[..end]), inner[end + 1..].trim());
        }
        // Unclosed bracket; take what is there.
        return (strip_source_route(inner), "");
    }
    match rest.split_once(char::is_whitespace) {
        Some((path, params)) => (strip_source_route(path), params.trim()),
        None => (strip_source_route(rest), ""),
    }
}

/// `<@relay1,@relay2:user@host>` -> `user@host`.
fn strip_source_route(path: &str) -> String {
    if path.starts_with('@') {
        if let Some(i) = path.rfind(':') {
            return path[i + 1..].to_string();
        }
    }
    path.to_string()
}

fn parse_size(params: &str) -> Result<Option<u64>> {
    for param in params.split_whitespace() {
        if let Some(value) = strip_keyword(param, "SIZE=") {
            let size = value
                .parse()
                .map_err(|_| Error::Protocol(format!("bad SIZE parameter {value:?}")))?;
            return Ok(Some(size));
        }
    }
    Ok(None)
}
