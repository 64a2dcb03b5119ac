use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use inbucket_smtp::config::Config;
use inbucket_smtp::delivery::MemoryMailbox;
use inbucket_smtp::metrics::Metrics;
use inbucket_smtp::policy::PermissiveAddressPolicy;
use inbucket_smtp::server::Server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = Arc::new(Config::from_env());
    info!(
        listen = %config.listen_addr,
        domain = %config.domain,
        max_message_bytes = config.max_message_bytes,
        max_recipients = config.max_recipients,
        "starting inbucket-smtp"
    );

    let policy = Arc::new(PermissiveAddressPolicy);
    let delivery = Arc::new(MemoryMailbox::new());
    let metrics = Arc::new(Metrics::new());

    if config.metrics_interval_secs > 0 {
        let metrics_clone = metrics.clone();
        let interval_secs = config.metrics_interval_secs;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_secs));
            loop {
                interval.tick().await;
                info!(
                    connections_current = metrics_clone.connections_current.load(Ordering::Relaxed),
                    received_total = metrics_clone.received_total.load(Ordering::Relaxed),
                    warns_total = metrics_clone.warns_total.load(Ordering::Relaxed),
                    errors_total = metrics_clone.errors_total.load(Ordering::Relaxed),
                    "[METRICS]"
                );
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("ctrl-c received, starting graceful shutdown");
        let _ = shutdown_tx.send(true);
    });

    let server = Server::new(config, policy, delivery, metrics);
    server.run(shutdown_rx).await?;

    Ok(())
}
