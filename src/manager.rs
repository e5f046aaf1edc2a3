//! Message manager
//!
//! The single writer-side entry point. Ordering, cap enforcement, and
//! notification policy all live here so that storage backends stay
//! dumb: a backend persists and enumerates, the manager decides.
//!
//! Every mutation of a mailbox happens under that mailbox's async
//! lock, which makes the `add -> cap trim -> publish` sequence (and
//! therefore the order of hub events) well-defined even when several
//! deliveries race toward the same mailbox.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::hub::{Hub, Notification, NotificationKind};
use crate::message::{IncomingMessage, Message, MessageSummary};
use crate::metrics;
use crate::policy::AddressPolicy;
use crate::storage::Storage;

pub struct MessageManager {
    store: Arc<dyn Storage>,
    policy: AddressPolicy,
    hub: Arc<Hub>,
    /// Per-mailbox message cap; 0 means unlimited.
    cap: usize,
    /// Per-mailbox mutation locks, created on demand and retained.
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl MessageManager {
    #[must_use]
    pub fn new(store: Arc<dyn Storage>, policy: AddressPolicy, hub: Arc<Hub>, cap: usize) -> Self {
        Self {
            store,
            policy,
            hub,
            cap,
            locks: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn policy(&self) -> &AddressPolicy {
        &self.policy
    }

    #[must_use]
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    fn mailbox_lock(&self, mailbox: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(mailbox.to_string())
            .or_default()
            .clone()
    }

    /// Store a message for every accepted recipient.
    ///
    /// Recipients are normalized through the policy and deduplicated
    /// per canonical mailbox, so a transaction stores at most one copy
    /// per mailbox. Delivery is atomic per recipient: a failure for
    /// one mailbox does not roll back the others, and the caller
    /// learns about partial failure through the returned error.
    ///
    /// Returns the number of mailboxes that received the message.
    pub async fn deliver(&self, from: &str, recipients: &[String], source: &[u8]) -> Result<usize> {
        let mut mailboxes: Vec<String> = Vec::new();
        for rcpt in recipients {
            match self.policy.stores(rcpt) {
                Ok(true) => {
                    let name = self.policy.mailbox_name(rcpt)?;
                    if !mailboxes.contains(&name) {
                        mailboxes.push(name);
                    }
                }
                Ok(false) => {
                    debug!(recipient = %rcpt, "recipient filtered by store policy");
                }
                Err(e) => {
                    warn!(recipient = %rcpt, error = %e, "skipping undeliverable recipient");
                }
            }
        }

        let mut stored = 0;
        let mut store_full = false;
        let mut failed: Vec<String> = Vec::new();
        let mut reason = String::new();

        for mailbox in &mailboxes {
            let lock = self.mailbox_lock(mailbox);
            let _guard = lock.lock().await;

            let msg =
                IncomingMessage::capture(mailbox.clone(), from, recipients, source.to_vec());
            match self.store.add_message(msg) {
                Ok(id) => {
                    stored += 1;
                    metrics::counters()
                        .messages_received
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(mailbox = %mailbox, id = %id, size = source.len(), "message stored");
                    self.hub.publish(&Notification::new(
                        mailbox.as_str(),
                        NotificationKind::New,
                        Some(id),
                    ));
                    if let Err(e) = self.trim_cap(mailbox) {
                        warn!(mailbox = %mailbox, error = %e, "cap trim failed");
                    }
                }
                Err(Error::StoreFull) => {
                    warn!(mailbox = %mailbox, "store refused message: full");
                    store_full = true;
                    failed.push(mailbox.clone());
                }
                Err(e) => {
                    warn!(mailbox = %mailbox, error = %e, "store refused message");
                    reason = e.to_string();
                    failed.push(mailbox.clone());
                }
            }
        }

        if store_full {
            Err(Error::StoreFull)
        } else if failed.is_empty() {
            Ok(stored)
        } else {
            Err(Error::PartialDelivery { failed, reason })
        }
    }

    /// Trim oldest messages until the mailbox is back under the cap.
    /// Caller holds the mailbox lock.
    fn trim_cap(&self, mailbox: &str) -> Result<()> {
        if self.cap == 0 {
            return Ok(());
        }
        let summaries = self.store.get_messages(mailbox)?;
        if summaries.len() <= self.cap {
            return Ok(());
        }
        for summary in &summaries[..summaries.len() - self.cap] {
            self.store.remove_message(mailbox, &summary.id)?;
            metrics::counters()
                .messages_removed
                .fetch_add(1, Ordering::Relaxed);
            self.hub.publish(&Notification::new(
                mailbox,
                NotificationKind::Removed,
                Some(summary.id.clone()),
            ));
        }
        Ok(())
    }

    pub fn get_message(&self, mailbox: &str, id: &str) -> Result<Message> {
        self.store.get_message(mailbox, id)
    }

    pub fn get_messages(&self, mailbox: &str) -> Result<Vec<MessageSummary>> {
        self.store.get_messages(mailbox)
    }

    pub fn mark_seen(&self, mailbox: &str, id: &str) -> Result<()> {
        self.store.mark_seen(mailbox, id)
    }

    pub async fn remove_message(&self, mailbox: &str, id: &str) -> Result<()> {
        let lock = self.mailbox_lock(mailbox);
        let _guard = lock.lock().await;

        self.store.remove_message(mailbox, id)?;
        metrics::counters()
            .messages_removed
            .fetch_add(1, Ordering::Relaxed);
        self.hub.publish(&Notification::new(
            mailbox,
            NotificationKind::Removed,
            Some(id.to_string()),
        ));
        Ok(())
    }

    pub async fn purge_messages(&self, mailbox: &str) -> Result<()> {
        let lock = self.mailbox_lock(mailbox);
        let _guard = lock.lock().await;

        self.store.purge_messages(mailbox)?;
        self.hub
            .publish(&Notification::new(mailbox, NotificationKind::Purged, None));
        Ok(())
    }

    /// Launch the retention sweeper, or nothing when `max_age` is zero.
    ///
    /// Ticks that land while a sweep is still running are skipped, so
    /// sweeps never overlap. The task stops when `shutdown` fires.
    pub fn start_retention_sweeper(
        self: &Arc<Self>,
        every: Duration,
        max_age: Duration,
        shutdown: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        if max_age.is_zero() {
            return None;
        }
        let manager = Arc::clone(self);
        let every = every.max(Duration::from_millis(100));
        info!(?every, ?max_age, "retention sweeper started");

        Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        debug!("retention sweeper stopped");
                        break;
                    }
                    _ = tick.tick() => match manager.sweep(max_age).await {
                        Ok(0) => {}
                        Ok(removed) => info!(removed, "retention sweep pruned messages"),
                        Err(e) => warn!(error = %e, "retention sweep failed"),
                    },
                }
            }
        }))
    }

    /// One retention pass: remove every message older than `max_age`.
    ///
    /// Deletions go through [`Self::remove_message`] so that hub
    /// subscribers observe them.
    pub async fn sweep(&self, max_age: Duration) -> Result<usize> {
        let Ok(age) = chrono::Duration::from_std(max_age) else {
            return Ok(0);
        };
        let cutoff = Utc::now() - age;

        let mut expired: Vec<(String, String)> = Vec::new();
        self.store.visit_mailboxes(&mut |mailbox, summaries| {
            for summary in summaries {
                if summary.date < cutoff {
                    expired.push((mailbox.to_string(), summary.id.clone()));
                }
            }
            true
        })?;

        let mut removed = 0;
        for (mailbox, id) in expired {
            match self.remove_message(&mailbox, &id).await {
                Ok(()) => removed += 1,
                Err(Error::NotFound) => {}
                Err(e) => warn!(mailbox = %mailbox, id = %id, error = %e, "sweep delete failed"),
            }
        }
        Ok(removed)
    }
}
