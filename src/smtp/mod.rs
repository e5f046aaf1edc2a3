//! SMTP ingress server
//!
//! Accepts mail for arbitrary recipients, never bounces, never
//! forwards. One task per connection, bounded by the configured
//! session cap; connections beyond the cap are greeted with a 421 and
//! dropped so the accept loop never stalls.

mod command;
mod session;

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::SmtpConfig;
use crate::error::{Error, Result};
use crate::manager::MessageManager;
use crate::metrics;

use session::{Session, SessionEnd};

pub struct SmtpServer {
    config: Arc<SmtpConfig>,
    manager: Arc<MessageManager>,
    tls: Option<TlsAcceptor>,
}

impl SmtpServer {
    /// Build the server, loading the STARTTLS certificate when one is
    /// configured.
    pub fn new(config: SmtpConfig, manager: Arc<MessageManager>) -> Result<Self> {
        let tls = match (&config.tls_cert, &config.tls_key) {
            (Some(cert), Some(key)) => Some(load_tls_acceptor(cert, key)?),
            (None, None) => None,
            _ => {
                return Err(Error::Config(
                    "STARTTLS requires both INBUCKET_SMTP_TLSCERT and INBUCKET_SMTP_TLSPRIVKEY"
                        .into(),
                ));
            }
        };
        Ok(Self {
            config: Arc::new(config),
            manager,
            tls,
        })
    }

    /// Accept connections until `shutdown` fires. Sessions run on the
    /// tracker so the caller can wait them out during shutdown.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
        tracker: TaskTracker,
    ) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "SMTP listening");
        }
        let permits = Arc::new(Semaphore::new(self.config.max_connections));

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    debug!("SMTP accept loop stopped");
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

                    match Arc::clone(&permits).try_acquire_owned() {
                        Ok(permit) => {
                            debug!(%peer, "SMTP connection accepted");
                            let server = Arc::clone(&self);
                            let shutdown = shutdown.clone();
                            tracker.spawn(async move {
                                server.handle_connection(stream, shutdown).await;
                                drop(permit);
                            });
                        }
                        Err(_) => {
                            metrics::counters()
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            debug!(%peer, "session cap reached, refusing connection");
                            tokio::spawn(async move {
                                let mut stream = stream;
                                let _ = stream
                                    .write_all(b"421 4.3.2 too many connections, try again later\r\n")
                                    .await;
                                let _ = stream.shutdown().await;
                            });
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, shutdown: CancellationToken) {
        let session = Session {
            config: Arc::clone(&self.config),
            manager: Arc::clone(&self.manager),
            tls_available: self.tls.is_some(),
            shutdown: shutdown.clone(),
        };

        match session.run(stream).await {
            SessionEnd::Closed => {}
            SessionEnd::UpgradeTls(stream) => {
                let Some(acceptor) = &self.tls else { return };
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        // The session restarts awaiting EHLO over the
                        // TLS stream; the pre-TLS state is discarded
                        // and no second greeting is sent.
                        let session = Session {
                            config: Arc::clone(&self.config),
                            manager: Arc::clone(&self.manager),
                            tls_available: false,
                            shutdown,
                        };
                        let _ = session.run_upgraded(tls_stream).await;
                    }
                    Err(e) => debug!(error = %e, "TLS handshake failed"),
                }
            }
        }
    }
}

fn load_tls_acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert)?))
        .collect::<std::io::Result<Vec<_>>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key)?))?
        .ok_or_else(|| Error::Tls(format!("no private key in {}", key.display())))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
