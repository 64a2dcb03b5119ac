use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::config::Config;
use crate::delivery::DeliveryManager;
use crate::metrics::Metrics;
use crate::policy::AddressPolicy;
use crate::session::{next_session_id, Session};

/// Owns the TCP listener and the lifecycle of every session it spawns.
pub struct Server {
    config: Arc<Config>,
    policy: Arc<dyn AddressPolicy>,
    delivery: Arc<dyn DeliveryManager>,
    metrics: Arc<Metrics>,
}

impl Server {
    pub fn new(
        config: Arc<Config>,
        policy: Arc<dyn AddressPolicy>,
        delivery: Arc<dyn DeliveryManager>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            policy,
            delivery,
            metrics,
        }
    }

    /// Binds the configured listen address. Split from [`Server::serve`]
    /// so callers (tests in particular) can discover the bound port before
    /// the accept loop starts, e.g. when `listen_addr`'s port is 0.
    pub async fn bind(&self) -> Result<TcpListener, std::io::Error> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        info!(addr = %listener.local_addr()?, "listening for SMTP connections");
        Ok(listener)
    }

    /// Binds the configured address and accepts connections until
    /// `shutdown` fires, then waits for every live session to drain
    /// before returning.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), std::io::Error> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Accepts connections on an already-bound listener until `shutdown`
    /// fires, then waits for every live session to drain before returning.
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), std::io::Error> {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(if self.config.max_connections > 0 {
            self.config.max_connections
        } else {
            tokio::sync::Semaphore::MAX_PERMITS
        }));

        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    info!("shutdown signal received, no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            self.spawn_session(&mut sessions, semaphore.clone(), stream, peer_addr.ip().to_string());
                        }
                        Err(e) => {
                            error!(error = %e, "accept error");
                        }
                    }
                }
            }
        }

        while sessions.join_next().await.is_some() {}
        Ok(())
    }

    fn spawn_session(
        &self,
        sessions: &mut JoinSet<()>,
        semaphore: Arc<tokio::sync::Semaphore>,
        stream: TcpStream,
        remote_host: String,
    ) {
        let id = next_session_id();
        let config = self.config.clone();
        let policy = self.policy.clone();
        let delivery = self.delivery.clone();
        let metrics = self.metrics.clone();

        sessions.spawn(async move {
            let permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            metrics.connection_opened();
            info!(session = id, peer = %remote_host, "new connection");

            let mut session = Session::new(id, remote_host, config, policy, delivery, metrics.clone());
            session.run(stream).await;

            metrics.connection_closed();
            drop(permit);
        });
    }
}
