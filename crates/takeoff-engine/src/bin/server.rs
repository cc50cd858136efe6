//! Takeoff server binary
//!
//! Run with: cargo run -p takeoff-engine --bin takeoff-server
//! Set TAKEOFF_CONFIG to a TOML file to override the defaults.

use std::sync::Arc;
use takeoff_engine::{
    confidence::OllamaAuditor, intake::Intake, server::TakeoffServer, Orchestrator, TakeoffConfig,
};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "takeoff_engine=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = TakeoffConfig::from_env_or_default()?;

    tracing::info!("Configuration loaded");
    tracing::info!("  - Registry: {}", config.storage.database_path.display());
    tracing::info!("  - Stage service: {}", config.stages.base_url);
    tracing::info!("  - Auditor: {} ({})", config.auditor.model, config.auditor.base_url);
    tracing::info!(
        "  - Timeout window: {}s, {} retries, monitor every {}s",
        config.monitor.timeout_window_secs,
        config.monitor.max_retries,
        config.monitor.monitor_interval_secs
    );

    // Not fatal: unscored artifacts are excluded from confidence
    if !OllamaAuditor::new(&config.auditor)?.health_check().await? {
        tracing::warn!(
            "Auditor at {} is not reachable; confidence will be 0.0 until it is",
            config.auditor.base_url
        );
    }

    let intake_config = config.intake.clone();
    let orchestrator = Arc::new(Orchestrator::from_config(config)?);

    // Recovery must finish before the server accepts submissions
    let runtime = orchestrator.start().await?;
    let recovered = runtime.recovery().recovered.len();
    if recovered > 0 {
        tracing::warn!("Failed {} runs orphaned by the previous process", recovered);
    }
    if !runtime.recovery().is_clean() {
        tracing::error!(
            "Recovery left {} runs RUNNING; the timeout monitor will retry them",
            runtime.recovery().write_errors.len()
        );
    }

    let (intake_shutdown, intake_rx) = watch::channel(false);
    let intake = if intake_config.enabled {
        let intake = Intake::new(orchestrator.clone(), &intake_config)?;
        Some(tokio::spawn(intake.run(intake_rx)))
    } else {
        None
    };

    let server = TakeoffServer::new(orchestrator.clone());
    server.state().mark_ready();

    println!("\nServer starting...");
    println!("  API: http://{}", server.address());
    println!("  Health: http://{}/health", server.address());
    println!("  API Info: http://{}/api/info", server.address());
    println!("\nPress Ctrl+C to stop\n");

    server.serve(shutdown_signal()).await?;

    let _ = intake_shutdown.send(true);
    if let Some(intake) = intake {
        if let Err(e) = intake.await {
            tracing::error!("Intake task ended abnormally: {}", e);
        }
    }
    runtime.shutdown().await;

    if orchestrator.in_flight() > 0 {
        tracing::warn!(
            "{} runs still executing at exit; the next start will fail them",
            orchestrator.in_flight()
        );
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
