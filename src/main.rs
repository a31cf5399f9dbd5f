use actix_web::{middleware, web, App, HttpServer};
use presence_push_service::{config, error, logging, routes, state::AppState};

#[actix_web::main]
async fn main() -> Result<(), error::AppError> {
    logging::init_tracing();
    let cfg = config::Config::from_env()?;
    let bind_addr = format!("0.0.0.0:{}", cfg.port);
    let shutdown_grace = cfg.shutdown_grace;

    let state = AppState::from_config(cfg).await?;

    tracing::info!(
        %bind_addr,
        broker = ?state.config.offline_broker,
        device_limit = ?state.config.device_limit.limit(),
        "starting presence-push-service"
    );

    let app_state = state.clone();
    let server = HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .app_data(web::Data::new(app_state.clone()))
            .configure(routes::configure)
    })
    .disable_signals()
    .shutdown_timeout(shutdown_grace.as_secs())
    .bind(&bind_addr)
    .map_err(|e| error::AppError::StartServer(format!("bind: {e}")))?
    .run();

    let handle = server.handle();
    actix_web::rt::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
            return;
        }
        tracing::info!("shutdown signal received");
        state.shutdown().await;
        handle.stop(true).await;
    });

    server
        .await
        .map_err(|e| error::AppError::StartServer(format!("server: {e}")))?;
    tracing::info!("presence-push-service stopped");
    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res,
            _ = terminate.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
