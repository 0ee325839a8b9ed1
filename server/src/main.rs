use clap::Parser;
use log::{error, info};
use server::game::World;
use server::{Server, ServerConfig};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// IP address to bind both transports to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// TCP port
    #[arg(short = 'p', long, default_value = "8080")]
    tcp_port: u16,

    /// UDP port
    #[arg(short = 'u', long, default_value = "8081")]
    udp_port: u16,

    /// Dispatcher ticks per second
    #[arg(short = 't', long, default_value = "20")]
    tick_rate: u32,

    /// Maximum sessions per transport
    #[arg(short = 'm', long, default_value = "64")]
    max_sessions: usize,

    /// Seconds before an idle TCP session is dropped
    #[arg(long, default_value = "30")]
    tcp_timeout: u64,

    /// Seconds before an idle UDP session is dropped
    #[arg(long, default_value = "60")]
    udp_timeout: u64,

    /// Seconds between world snapshots
    #[arg(long, default_value = "1")]
    world_update: f64,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            stream_addr: SocketAddr::new(self.host, self.tcp_port),
            datagram_addr: SocketAddr::new(self.host, self.udp_port),
            tick_rate: self.tick_rate,
            world_update_interval: Duration::from_secs_f64(self.world_update.max(0.01)),
            max_stream_sessions: self.max_sessions,
            max_datagram_sessions: self.max_sessions,
            stream_idle_timeout: Duration::from_secs(self.tcp_timeout),
            datagram_idle_timeout: Duration::from_secs(self.udp_timeout),
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = args.into_config();

    info!("Starting server...");
    info!("TCP on {}, UDP on {}", config.stream_addr, config.datagram_addr);
    info!("Tick rate: {}Hz", config.tick_rate);

    let mut server = Server::new(config, World::new());
    if let Err(e) = server.start().await {
        error!("Failed to start server: {}", e);
        return Err(e.into());
    }

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down gracefully...");

    server.stop().await;
    Ok(())
}
