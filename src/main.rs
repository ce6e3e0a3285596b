use serveherd::admin::{AdminServer, PKG_NAME, VERSION};
use serveherd::config::Config;
use serveherd::registry::InstanceRegistry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("serveherd=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration, falling back to defaults when the file is absent
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("serveherd.toml"));

    let config = Config::load_or_default(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry = InstanceRegistry::new(config.serve.clone())?;

    let admin_addr: SocketAddr = format!("127.0.0.1:{}", config.server.admin_port)
        .parse()
        .map_err(|e| {
            error!(admin_port = config.server.admin_port, error = %e, "Invalid control API bind address");
            anyhow::anyhow!("Invalid control API bind address: {}", e)
        })?;

    // Generate or use configured admin token
    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated control API token (configure admin_token to set a fixed value)");
        token
    });

    let admin_server = AdminServer::new(admin_addr, Arc::clone(&registry), shutdown_rx, admin_token);
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Control API server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or config reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "Received SIGHUP, reloading configuration...");
                    if let Err(e) = registry.reload_config(&config_path) {
                        error!(error = %e, "Failed to reload configuration");
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    info!("Stopping all instances...");
    registry.shutdown().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), admin_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting serve manager");
    info!(
        admin_port = config.server.admin_port,
        "Control API configuration"
    );
    info!(
        executable = %config.serve.executable,
        args = ?config.serve.args,
        subcommand = %config.serve.subcommand,
        hostname = %config.serve.hostname,
        min_port = config.serve.port_range.min,
        max_port = config.serve.port_range.max,
        "Launch settings"
    );
    info!(
        health_path = %config.serve.health_path,
        probe_timeout_ms = config.serve.probe_timeout_ms,
        ready_poll_interval_ms = config.serve.ready_poll_interval_ms,
        ready_timeout_ms = config.serve.ready_timeout_ms,
        exit_policy = ?config.serve.exit_policy,
        "Readiness settings"
    );
    info!(
        shutdown_grace_period_secs = config.serve.shutdown_grace_period_secs,
        "Shutdown settings"
    );
}
