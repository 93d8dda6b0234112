use herald_common::config::AppConfig;
use herald_notifier::HttpTransportFactory;
use herald_relay::queue::DequeueClient;
use herald_relay::service::RelayService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald_relay=info,herald_notifier=info".into()),
        )
        .json()
        .init();

    tracing::info!("Herald relay starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    let factory = HttpTransportFactory::new(config.transport_url.clone())?;
    let queue = DequeueClient::new(&config);

    let service = RelayService::new(config);
    service.start(queue, factory).await;

    shutdown_signal().await;
    tracing::info!("Received shutdown signal, stopping gracefully...");

    service.stop().await;

    tracing::info!("Herald relay stopped.");
    Ok(())
}

/// Resolve on Ctrl+C, or on SIGTERM where the platform has it.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
