//! Storage backends
//!
//! The manager speaks to a backend through the [`Storage`] trait; all
//! cap, ordering, and notification policy lives above it. A new
//! backend implements the seven operations below and registers a
//! constructor, nothing more.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use std::sync::Arc;

use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::message::{IncomingMessage, Message, MessageSummary};

/// Backend contract consumed by the manager.
///
/// Implementations must be safe for concurrent callers on distinct
/// mailboxes; adds within one mailbox are serialized so that ids stay
/// monotone in arrival order.
pub trait Storage: Send + Sync {
    /// Assign an id, persist source and summary, and return the id.
    fn add_message(&self, msg: IncomingMessage) -> Result<String>;

    /// Full message including source. `NotFound` if missing.
    fn get_message(&self, mailbox: &str, id: &str) -> Result<Message>;

    /// Headers-only summaries sorted by arrival ascending. An unknown
    /// mailbox yields an empty list, not an error.
    fn get_messages(&self, mailbox: &str) -> Result<Vec<MessageSummary>>;

    /// Idempotent. `NotFound` if missing.
    fn mark_seen(&self, mailbox: &str, id: &str) -> Result<()>;

    /// Idempotent on "already gone".
    fn remove_message(&self, mailbox: &str, id: &str) -> Result<()>;

    /// Remove every message; succeeds on an empty or unknown mailbox.
    fn purge_messages(&self, mailbox: &str) -> Result<()>;

    /// Invoke `f` with each non-empty mailbox's summaries until it
    /// returns `false`. Each mailbox is presented as a consistent
    /// snapshot; mailboxes mutated mid-iteration may or may not be
    /// seen, but never torn.
    fn visit_mailboxes(&self, f: &mut dyn FnMut(&str, &[MessageSummary]) -> bool) -> Result<()>;
}

type Constructor = fn(&StorageConfig) -> Result<Arc<dyn Storage>>;

/// Constructor registry keyed by backend name.
const REGISTRY: &[(&str, Constructor)] = &[
    ("memory", |_| Ok(Arc::new(MemoryStore::new()))),
    ("file", |config| {
        if config.params.is_empty() {
            return Err(Error::Config(
                "file storage requires INBUCKET_STORAGE_PARAMS to name a root directory".into(),
            ));
        }
        Ok(Arc::new(FileStore::open(&config.params)?))
    }),
];

/// Construct the backend named by the configuration.
pub fn open(config: &StorageConfig) -> Result<Arc<dyn Storage>> {
    let name = config.backend.to_ascii_lowercase();
    REGISTRY
        .iter()
        .find(|(key, _)| *key == name)
        .map(|(_, build)| build(config))
        .ok_or_else(|| Error::Config(format!("unknown storage type {:?}", config.backend)))?
}

/// Shared add-time validation: a captured source must end with a line
/// terminator, otherwise the capture was cut short.
pub(crate) fn check_terminated(source: &[u8]) -> Result<()> {
    if source.last() != Some(&b'\n') {
        return Err(Error::BadInput("unterminated message source".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(backend: &str, params: &str) -> StorageConfig {
        StorageConfig {
            backend: backend.to_string(),
            params: params.to_string(),
            mailbox_message_cap: 500,
            retention_period: std::time::Duration::ZERO,
            retention_sleep: std::time::Duration::from_secs(60),
        }
    }

    #[test]
    fn registry_builds_memory() {
        assert!(open(&config("memory", "")).is_ok());
        assert!(open(&config("MEMORY", "")).is_ok());
    }

    #[test]
    fn registry_rejects_unknown_backend() {
        assert!(matches!(
            open(&config("redis", "")),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn file_backend_requires_path() {
        assert!(matches!(open(&config("file", "")), Err(Error::Config(_))));
    }

    #[test]
    fn unterminated_source_rejected() {
        assert!(check_terminated(b"Subject: x\r\n\r\nbody\r\n").is_ok());
        assert!(check_terminated(b"no newline at end").is_err());
        assert!(check_terminated(b"").is_err());
    }
}
