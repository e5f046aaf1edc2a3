//! Application assembly and lifecycle
//!
//! Wires the storage backend, manager, hub, and the three listeners
//! together, and owns the root cancellation token. Shutdown order:
//! stop accepting, give in-flight sessions a grace period, then close
//! the hub so monitors drain and finish.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::hub::Hub;
use crate::manager::MessageManager;
use crate::pop3::Pop3Server;
use crate::rest::{self, ApiState};
use crate::smtp::SmtpServer;
use crate::storage;

pub struct App {
    manager: Arc<MessageManager>,
    smtp_addr: SocketAddr,
    pop3_addr: SocketAddr,
    web_addr: SocketAddr,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    shutdown_timeout: Duration,
}

impl App {
    /// Bind all listeners and start serving.
    ///
    /// Addresses may use port 0 to let the OS choose; the bound
    /// addresses are available from the accessors afterwards.
    pub async fn start(config: Config) -> Result<Self> {
        // Both compiled-in rustls providers would make the builder
        // ambiguous; pick ring, tolerating a prior install.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let store = storage::open(&config.storage)?;
        let hub = Arc::new(Hub::new(config.hub_buffer));
        let manager = Arc::new(MessageManager::new(
            store,
            config.policy(),
            Arc::clone(&hub),
            config.storage.mailbox_message_cap,
        ));

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        let smtp_listener = TcpListener::bind(&config.smtp.addr).await?;
        let smtp_addr = smtp_listener.local_addr()?;
        let pop3_listener = TcpListener::bind(&config.pop3_addr).await?;
        let pop3_addr = pop3_listener.local_addr()?;
        let web_listener = TcpListener::bind(&config.web_addr).await?;
        let web_addr = web_listener.local_addr()?;

        let smtp = Arc::new(SmtpServer::new(config.smtp.clone(), Arc::clone(&manager))?);
        tracker.spawn(smtp.serve(smtp_listener, shutdown.clone(), tracker.clone()));

        let pop3 = Arc::new(Pop3Server::new(Arc::clone(&manager)));
        tracker.spawn(pop3.serve(pop3_listener, shutdown.clone(), tracker.clone()));

        let router = rest::router(ApiState {
            manager: Arc::clone(&manager),
        });
        let web_shutdown = shutdown.clone();
        tracker.spawn(async move {
            let served = axum::serve(web_listener, router)
                .with_graceful_shutdown(async move { web_shutdown.cancelled().await })
                .await;
            if let Err(e) = served {
                warn!(error = %e, "web server error");
            }
        });
        info!(%web_addr, "HTTP listening");

        manager.start_retention_sweeper(
            config.storage.retention_sleep,
            config.storage.retention_period,
            shutdown.clone(),
        );

        Ok(Self {
            manager,
            smtp_addr,
            pop3_addr,
            web_addr,
            shutdown,
            tracker,
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<MessageManager> {
        &self.manager
    }

    #[must_use]
    pub fn smtp_addr(&self) -> SocketAddr {
        self.smtp_addr
    }

    #[must_use]
    pub fn pop3_addr(&self) -> SocketAddr {
        self.pop3_addr
    }

    #[must_use]
    pub fn web_addr(&self) -> SocketAddr {
        self.web_addr
    }

    /// Orderly shutdown: stop accepting, wait out in-flight sessions
    /// up to the grace period, then close all hub subscribers.
    pub async fn shutdown(self) {
        info!("shutting down");
        self.shutdown.cancel();
        self.tracker.close();
        if tokio::time::timeout(self.shutdown_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("grace period expired with sessions still active");
        }
        self.manager.hub().close_all();
    }
}
