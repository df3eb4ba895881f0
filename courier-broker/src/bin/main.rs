use std::time::Duration;

use clap::Parser;
use courier_broker::{http::server::run_server, DeliveryCoordinator};
use courier_config::{load_config, Cli};
use courier_models::errors::{runtime_error, SendableError};
use courier_utilities::startup;
use log::{error, info};
use tokio::{net::TcpListener, sync::oneshot};

#[tokio::main]
async fn main() -> Result<(), SendableError> {
    let cli = Cli::parse();
    startup::startup("Courier Broker", cli.log_level, cli.log_file.as_deref())?;

    let config = load_config(&cli.config).map_err(|err| runtime_error("courier.config", err))?;
    info!("Failure log: {}", config.failure_log_path().display());

    let coordinator = DeliveryCoordinator::from_config(&config)
        .await
        .map_err(|err| runtime_error("courier.startup", err))?;

    if !coordinator.failure_log().is_empty() {
        info!(
            "Resending {} failure(s) left by a previous run",
            coordinator.pending_failures()
        );
        coordinator.spawn_retry_all();
    }
    coordinator.spawn_periodic_sweep(Duration::from_secs(config.retry.sweep_interval_secs));

    let listener = TcpListener::bind(cli.listen)
        .await
        .map_err(|err| runtime_error("courier.listen", err))?;

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(run_server(listener, coordinator.clone(), async move {
        let _ = stop_rx.await;
    }));

    tokio::signal::ctrl_c()
        .await
        .map_err(|err| runtime_error("courier.signal", err))?;
    info!("Shutdown signal received. Stopping courier broker...");
    let _ = stop_tx.send(());

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!("HTTP server stopped with error: {}", err),
        Err(err) => {
            if !err.is_cancelled() {
                error!("HTTP server task join error: {}", err);
            }
        }
    }
    coordinator.shutdown().await;

    Ok(())
}
