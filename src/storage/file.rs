//! On-disk backend
//!
//! Layout: `<root>/<digest[..3]>/<digest>/` per mailbox, where the
//! digest is the hex SHA-256 of the canonical name (the short prefix
//! directory caps per-directory child count, and hex digests keep the
//! paths portable — no `:` can appear). Each mailbox directory holds
//! one `<id>.raw` file per message, a `mailbox` sidecar naming the
//! canonical mailbox, and an `index.json` with the summaries so that
//! listings never open the sources.
//!
//! Every write lands in a temp file, is fsynced, and is renamed into
//! place; the raw source is durable before the index references it.
//! Reads tolerate a missing or corrupt index by rebuilding it from a
//! directory scan.

use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use mailparse::MailHeaderMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::message::{IncomingMessage, Message, MessageSummary};

use super::{Storage, check_terminated};

const INDEX_FILE: &str = "index.json";
const NAME_FILE: &str = "mailbox";
const RAW_EXT: &str = "raw";

#[derive(Debug, Serialize, Deserialize)]
struct IndexEntry {
    /// Arrival sequence; the monotone half of the id.
    seq: u64,
    summary: MessageSummary,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MailboxIndex {
    mailbox: String,
    next_seq: u64,
    entries: Vec<IndexEntry>,
}

/// Filesystem-backed [`Storage`] implementation.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileStore {
    /// Open (or create) a store rooted at `root` and rebuild any
    /// mailbox index lost since the last run.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let store = Self {
            root,
            locks: Mutex::new(HashMap::new()),
        };
        store.scan_for_missing_indexes()?;
        Ok(store)
    }

    fn mailbox_dir(&self, mailbox: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(mailbox.as_bytes()));
        self.root.join(&digest[..3]).join(digest)
    }

    fn lock_for(&self, mailbox: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(mailbox.to_string())
            .or_default()
            .clone()
    }

    /// One-time startup pass: any mailbox directory whose index is
    /// missing but whose name sidecar survives gets its index rebuilt.
    fn scan_for_missing_indexes(&self) -> Result<()> {
        for dir in mailbox_dirs(&self.root)? {
            if dir.join(INDEX_FILE).exists() {
                continue;
            }
            match fs::read_to_string(dir.join(NAME_FILE)) {
                Ok(name) => {
                    let name = name.trim().to_string();
                    debug!(mailbox = %name, "rebuilding missing index");
                    let lock = self.lock_for(&name);
                    let _guard = lock.lock().unwrap();
                    let index = rebuild_index(&dir, &name)?;
                    write_index(&dir, &index)?;
                }
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "skipping mailbox directory without name sidecar");
                }
            }
        }
        Ok(())
    }

    /// Load the index for a mailbox, rebuilding from a directory scan
    /// when it is missing or unreadable. Caller holds the mailbox lock.
    fn load_index(&self, mailbox: &str) -> Result<MailboxIndex> {
        let dir = self.mailbox_dir(mailbox);
        match fs::read(dir.join(INDEX_FILE)) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(index) => Ok(index),
                Err(e) => {
                    warn!(mailbox, error = %e, "corrupt index, rebuilding");
                    rebuild_index(&dir, mailbox)
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => rebuild_index(&dir, mailbox),
            Err(e) => Err(map_io(e)),
        }
    }
}

impl Storage for FileStore {
    fn add_message(&self, msg: IncomingMessage) -> Result<String> {
        check_terminated(&msg.source)?;

        let lock = self.lock_for(&msg.mailbox);
        let _guard = lock.lock().unwrap();

        let dir = self.mailbox_dir(&msg.mailbox);
        fs::create_dir_all(&dir).map_err(map_io)?;

        let mut index = self.load_index(&msg.mailbox)?;
        index.mailbox = msg.mailbox.clone();
        let name_file = dir.join(NAME_FILE);
        if !name_file.exists() {
            write_atomic(&name_file, msg.mailbox.as_bytes()).map_err(map_io)?;
        }

        index.next_seq += 1;
        let seq = index.next_seq;
        // Random suffix keeps ids unique across a crash that loses the
        // counter; arrival order is carried by the sequence.
        let suffix = Uuid::new_v4().simple().to_string();
        let id = format!("{seq}-{}", &suffix[..6]);

        write_atomic(&dir.join(format!("{id}.{RAW_EXT}")), &msg.source).map_err(map_io)?;

        let message = msg.into_message(id.clone());
        index.entries.push(IndexEntry {
            seq,
            summary: message.summary,
        });
        write_index(&dir, &index)?;
        Ok(id)
    }

    fn get_message(&self, mailbox: &str, id: &str) -> Result<Message> {
        let lock = self.lock_for(mailbox);
        let _guard = lock.lock().unwrap();

        let dir = self.mailbox_dir(mailbox);
        if !dir.exists() {
            return Err(Error::NotFound);
        }
        let index = self.load_index(mailbox)?;
        let entry = index
            .entries
            .iter()
            .find(|e| e.summary.id == id)
            .ok_or(Error::NotFound)?;

        let source = fs::read(dir.join(format!("{id}.{RAW_EXT}"))).map_err(map_io)?;
        Ok(Message {
            summary: entry.summary.clone(),
            source,
        })
    }

    fn get_messages(&self, mailbox: &str) -> Result<Vec<MessageSummary>> {
        let lock = self.lock_for(mailbox);
        let _guard = lock.lock().unwrap();

        if !self.mailbox_dir(mailbox).exists() {
            return Ok(Vec::new());
        }
        let index = self.load_index(mailbox)?;
        Ok(index.entries.into_iter().map(|e| e.summary).collect())
    }

    fn mark_seen(&self, mailbox: &str, id: &str) -> Result<()> {
        let lock = self.lock_for(mailbox);
        let _guard = lock.lock().unwrap();

        let dir = self.mailbox_dir(mailbox);
        if !dir.exists() {
            return Err(Error::NotFound);
        }
        let mut index = self.load_index(mailbox)?;
        let entry = index
            .entries
            .iter_mut()
            .find(|e| e.summary.id == id)
            .ok_or(Error::NotFound)?;
        if !entry.summary.seen {
            entry.summary.seen = true;
            write_index(&dir, &index)?;
        }
        Ok(())
    }

    fn remove_message(&self, mailbox: &str, id: &str) -> Result<()> {
        let lock = self.lock_for(mailbox);
        let _guard = lock.lock().unwrap();

        let dir = self.mailbox_dir(mailbox);
        if !dir.exists() {
            return Ok(());
        }
        let mut index = self.load_index(mailbox)?;
        let before = index.entries.len();
        index.entries.retain(|e| e.summary.id != id);
        if index.entries.len() == before {
            return Ok(());
        }

        match fs::remove_file(dir.join(format!("{id}.{RAW_EXT}"))) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(map_io(e)),
        }

        if index.entries.is_empty() {
            // A mailbox exists iff it holds at least one message.
            fs::remove_dir_all(&dir).map_err(map_io)?;
        } else {
            write_index(&dir, &index)?;
        }
        Ok(())
    }

    fn purge_messages(&self, mailbox: &str) -> Result<()> {
        let lock = self.lock_for(mailbox);
        let _guard = lock.lock().unwrap();

        match fs::remove_dir_all(self.mailbox_dir(mailbox)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_io(e)),
        }
    }

    fn visit_mailboxes(&self, f: &mut dyn FnMut(&str, &[MessageSummary]) -> bool) -> Result<()> {
        for dir in mailbox_dirs(&self.root)? {
            let index: MailboxIndex = match fs::read(dir.join(INDEX_FILE)) {
                Ok(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(index) => index,
                    Err(e) => {
                        warn!(dir = %dir.display(), error = %e, "skipping mailbox with corrupt index");
                        continue;
                    }
                },
                // Raced with a remove, or never indexed; either way
                // there is nothing consistent to report here.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(map_io(e)),
            };
            if index.entries.is_empty() {
                continue;
            }
            let name = index.mailbox;
            let summaries: Vec<MessageSummary> =
                index.entries.into_iter().map(|e| e.summary).collect();
            if !f(&name, &summaries) {
                break;
            }
        }
        Ok(())
    }
}

/// Enumerate `<root>/<prefix>/<digest>` mailbox directories.
fn mailbox_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for prefix in fs::read_dir(root).map_err(map_io)? {
        let prefix = prefix.map_err(map_io)?.path();
        if !prefix.is_dir() {
            continue;
        }
        for entry in fs::read_dir(&prefix).map_err(map_io)? {
            let path = entry.map_err(map_io)?.path();
            if path.is_dir() {
                dirs.push(path);
            }
        }
    }
    Ok(dirs)
}

/// Rebuild an index by scanning the mailbox directory for raw sources.
///
/// The envelope and seen flag live only in the index; a rebuild
/// recovers `from`/`to` best-effort from the headers and resets `seen`.
fn rebuild_index(dir: &Path, mailbox: &str) -> Result<MailboxIndex> {
    let mut index = MailboxIndex {
        mailbox: mailbox.to_string(),
        next_seq: 0,
        entries: Vec::new(),
    };
    if !dir.exists() {
        return Ok(index);
    }

    for entry in fs::read_dir(dir).map_err(map_io)? {
        let path = entry.map_err(map_io)?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(RAW_EXT) {
            continue;
        }
        let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some(seq) = id.split('-').next().and_then(|s| s.parse::<u64>().ok()) else {
            warn!(file = %path.display(), "skipping raw file with unparseable id");
            continue;
        };

        let source = fs::read(&path).map_err(map_io)?;
        let (from, to, subject, date) = header_fields(&source);
        index.entries.push(IndexEntry {
            seq,
            summary: MessageSummary {
                mailbox: mailbox.to_string(),
                id: id.to_string(),
                from,
                to,
                subject,
                date: date.unwrap_or_else(Utc::now),
                size: source.len() as u64,
                seen: false,
            },
        });
    }

    index.entries.sort_by_key(|e| e.seq);
    index.next_seq = index.entries.last().map_or(0, |e| e.seq);
    Ok(index)
}

/// Best-effort header recovery for index rebuilds.
fn header_fields(source: &[u8]) -> (String, Vec<String>, String, Option<DateTime<Utc>>) {
    let Ok(mail) = mailparse::parse_mail(source) else {
        return (String::new(), Vec::new(), String::new(), None);
    };
    let from = mail.headers.get_first_value("From").unwrap_or_default();
    let to = mail
        .headers
        .get_first_value("To")
        .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_default();
    let subject = mail.headers.get_first_value("Subject").unwrap_or_default();
    let date = mail
        .headers
        .get_first_value("Date")
        .and_then(|raw| mailparse::dateparse(&raw).ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0));
    (from, to, subject, date)
}

fn write_index(dir: &Path, index: &MailboxIndex) -> Result<()> {
    let bytes = serde_json::to_vec(index)
        .map_err(|e| Error::BadInput(format!("unserializable index: {e}")))?;
    write_atomic(&dir.join(INDEX_FILE), &bytes).map_err(map_io)
}

/// Write-temp + fsync + rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

fn map_io(e: std::io::Error) -> Error {
    match e.kind() {
        ErrorKind::NotFound => Error::NotFound,
        ErrorKind::StorageFull => Error::StoreFull,
        _ => Error::Io(e),
    }
}
