use cgigate::config::Config;
use cgigate::env::ServerEnv;
use cgigate::gateway::CgiGateway;
use cgigate::queue::QueueStats;
use cgigate::server::GatewayServer;
use cgigate::static_files::StaticFiles;
use cgigate::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

const DEFAULT_CONFIG_PATH: &str = "cgigate.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cgigate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration; a missing default file means built-in defaults
    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = if explicit_path.is_none() && !config_path.exists() {
        info!(path = %config_path.display(), "No configuration file, using defaults");
        Config::default()
    } else {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    };

    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server_env = Arc::new(ServerEnv::from_config(&config.cgi));
    info!(
        server_name = %server_env.server_name,
        server_port = server_env.server_port,
        software = %server_env.software,
        "CGI environment"
    );

    let gateway = Arc::new(CgiGateway::from_config(&config, server_env));
    let static_files = StaticFiles::new(config.cgi.root.clone());

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let server = GatewayServer::new(addr, Arc::clone(&gateway), static_files, shutdown_rx);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for the listener to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    let queue = gateway.queue();
    let stats = queue.stats();
    info!(
        running = queue.running(),
        waiting = queue.waiting(),
        admitted = QueueStats::get(&stats.admitted),
        queued = QueueStats::get(&stats.queued),
        promoted = QueueStats::get(&stats.promoted),
        rejected_full = QueueStats::get(&stats.rejected_full),
        rejected_timeout = QueueStats::get(&stats.rejected_timeout),
        abandoned = QueueStats::get(&stats.abandoned),
        run_timeouts = QueueStats::get(&stats.run_timeouts),
        "Admission statistics"
    );

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(
        name = PKG_NAME,
        version = VERSION,
        "Starting CGI gateway"
    );
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        "Server configuration"
    );
    info!(
        bin = %config.cgi.bin,
        root = %config.cgi.root.display(),
        ini = ?config.cgi.ini,
        extension = %config.cgi.extension,
        forward_stderr = config.cgi.forward_stderr,
        kill_on_disconnect = config.cgi.kill_on_disconnect,
        "Interpreter settings"
    );
    info!(
        process_limit = config.process.limit,
        process_timeout_ms = config.process.timeout_ms,
        queue_limit = config.queue.limit,
        queue_timeout_ms = config.queue.timeout_ms,
        "Admission settings"
    );
}
