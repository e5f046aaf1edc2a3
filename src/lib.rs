#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! Email capture and inspection service
//!
//! Accepts mail over SMTP for arbitrary recipients without bouncing or
//! forwarding, keeps it in a size-bounded per-mailbox store, and
//! exposes it over POP3, a REST API, and a WebSocket event stream.
//! Anything the SMTP ingress accepts becomes visible on every
//! retrieval surface, subject to the configured retention.

pub mod app;
pub mod config;
pub mod error;
pub mod hub;
pub mod manager;
pub mod message;
pub mod metrics;
pub mod policy;
pub mod pop3;
pub mod rest;
pub mod smtp;
pub mod storage;

pub use app::App;
pub use config::Config;
pub use error::{Error, Result};
pub use hub::{Hub, Notification, NotificationKind, Subscription};
pub use manager::MessageManager;
pub use message::{Message, MessageSummary};
pub use policy::{AddressPolicy, MailboxNaming};
pub use storage::{FileStore, MemoryStore, Storage};
