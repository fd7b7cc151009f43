use clap::Parser;
use log::{error, info};
use server::config::ServerConfig;
use server::network::Server;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Maximum number of concurrent sessions
    #[arg(short = 'm', long, default_value = "32")]
    max_sessions: usize,

    /// Seconds between heartbeat probes
    #[arg(long, default_value = "5")]
    heartbeat_secs: u64,

    /// Unanswered heartbeats before a session is dropped
    #[arg(long, default_value = "3")]
    miss_threshold: u32,

    /// Datagrams buffered per session before sends to it are dropped
    #[arg(short = 'q', long, default_value = "256")]
    queue_capacity: usize,

    /// Maximum number of shared scene objects
    #[arg(long, default_value = "1024")]
    max_objects: usize,
}

impl Args {
    fn config(&self) -> ServerConfig {
        ServerConfig {
            max_sessions: self.max_sessions,
            outbound_capacity: self.queue_capacity,
            max_objects: self.max_objects,
            ..ServerConfig::default()
        }
        .with_bind_addr(format!("{}:{}", self.host, self.port))
        .with_heartbeat(Duration::from_secs(self.heartbeat_secs), self.miss_threshold)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.config();

    info!("Starting relay server...");
    info!("Max sessions: {}", config.max_sessions);
    info!(
        "Heartbeat every {:?}, session timeout {:?}",
        config.heartbeat_interval,
        config.session_timeout()
    );

    let mut server = Server::bind(&config).await?;
    let shutdown = server.shutdown_handle();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down gracefully...");
                shutdown.shutdown();
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    server.run().await?;

    Ok(())
}
