//! Fully in-memory backend
//!
//! Message sources live on the heap; nothing survives a restart. The
//! map of mailboxes is guarded by an outer lock, and each mailbox has
//! its own mutex so concurrent traffic to distinct mailboxes never
//! contends. Mailbox entries are retained once created; the leak is
//! bounded by the number of distinct names, which is acceptable for a
//! test fixture.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{Error, Result};
use crate::message::{IncomingMessage, Message, MessageSummary};

use super::{Storage, check_terminated};

#[derive(Debug, Default)]
struct MailboxInner {
    next_seq: u64,
    /// Arrival order; ids are monotone within the mailbox.
    messages: Vec<Message>,
}

/// In-memory [`Storage`] implementation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    mailboxes: RwLock<HashMap<String, Arc<Mutex<MailboxInner>>>>,
    total: AtomicUsize,
    /// Soft cap across all mailboxes; 0 means unlimited.
    max_total: usize,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that refuses adds once `max_total` messages are held.
    #[must_use]
    pub fn with_message_limit(max_total: usize) -> Self {
        Self {
            max_total,
            ..Self::default()
        }
    }

    fn mailbox(&self, name: &str) -> Option<Arc<Mutex<MailboxInner>>> {
        self.mailboxes.read().unwrap().get(name).cloned()
    }

    fn mailbox_or_create(&self, name: &str) -> Arc<Mutex<MailboxInner>> {
        if let Some(inner) = self.mailbox(name) {
            return inner;
        }
        self.mailboxes
            .write()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}

impl Storage for MemoryStore {
    fn add_message(&self, msg: IncomingMessage) -> Result<String> {
        check_terminated(&msg.source)?;
        if self.max_total > 0 && self.total.load(Ordering::Relaxed) >= self.max_total {
            return Err(Error::StoreFull);
        }

        let mailbox = self.mailbox_or_create(&msg.mailbox);
        let mut inner = mailbox.lock().unwrap();
        inner.next_seq += 1;
        let id = inner.next_seq.to_string();
        inner.messages.push(msg.into_message(id.clone()));
        self.total.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    fn get_message(&self, mailbox: &str, id: &str) -> Result<Message> {
        let inner = self.mailbox(mailbox).ok_or(Error::NotFound)?;
        let inner = inner.lock().unwrap();
        inner
            .messages
            .iter()
            .find(|m| m.summary.id == id)
            .cloned()
            .ok_or(Error::NotFound)
    }

    fn get_messages(&self, mailbox: &str) -> Result<Vec<MessageSummary>> {
        let Some(inner) = self.mailbox(mailbox) else {
            return Ok(Vec::new());
        };
        let inner = inner.lock().unwrap();
        Ok(inner.messages.iter().map(|m| m.summary.clone()).collect())
    }

    fn mark_seen(&self, mailbox: &str, id: &str) -> Result<()> {
        let inner = self.mailbox(mailbox).ok_or(Error::NotFound)?;
        let mut inner = inner.lock().unwrap();
        let msg = inner
            .messages
            .iter_mut()
            .find(|m| m.summary.id == id)
            .ok_or(Error::NotFound)?;
        msg.summary.seen = true;
        Ok(())
    }

    fn remove_message(&self, mailbox: &str, id: &str) -> Result<()> {
        let Some(inner) = self.mailbox(mailbox) else {
            return Ok(());
        };
        let mut inner = inner.lock().unwrap();
        let before = inner.messages.len();
        inner.messages.retain(|m| m.summary.id != id);
        if inner.messages.len() < before {
            self.total.fetch_sub(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn purge_messages(&self, mailbox: &str) -> Result<()> {
        let Some(inner) = self.mailbox(mailbox) else {
            return Ok(());
        };
        let mut inner = inner.lock().unwrap();
        self.total.fetch_sub(inner.messages.len(), Ordering::Relaxed);
        inner.messages.clear();
        Ok(())
    }

    fn visit_mailboxes(&self, f: &mut dyn FnMut(&str, &[MessageSummary]) -> bool) -> Result<()> {
        let snapshot: Vec<(String, Arc<Mutex<MailboxInner>>)> = self
            .mailboxes
            .read()
            .unwrap()
            .iter()
            .map(|(name, inner)| (name.clone(), Arc::clone(inner)))
            .collect();

        for (name, inner) in snapshot {
            let summaries: Vec<MessageSummary> = {
                let inner = inner.lock().unwrap();
                inner.messages.iter().map(|m| m.summary.clone()).collect()
            };
            if summaries.is_empty() {
                continue;
            }
            if !f(&name, &summaries) {
                break;
            }
        }
        Ok(())
    }
}
