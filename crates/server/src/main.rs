mod server;
mod simulation;

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use server::GameServer;
use tether::ServerConfig;

#[derive(Parser)]
#[command(name = "tether-server")]
#[command(about = "Headless tether game server")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = tether::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, help = "TOML file with server settings")]
    config: Option<PathBuf>,

    #[arg(short, long)]
    tick_rate: Option<u32>,

    #[arg(short, long)]
    max_clients: Option<usize>,

    #[arg(long)]
    hostname: Option<String>,

    #[arg(long)]
    map: Option<String>,

    #[arg(long, default_value_t = 30, help = "Seconds of silence before a client is dropped")]
    timeout: u64,

    #[arg(long, help = "Stop after this many seconds")]
    duration: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let bind_addr = format!("{}:{}", args.bind, args.port);

    let mut config = match &args.config {
        Some(path) => tether::config::load_toml::<ServerConfig>(path)?,
        None => ServerConfig::default(),
    };
    if let Some(tick_rate) = args.tick_rate {
        config.tick_rate = tick_rate;
    }
    if let Some(max_clients) = args.max_clients {
        config.max_clients = max_clients;
    }
    if let Some(hostname) = args.hostname {
        config.hostname = hostname;
    }
    if let Some(map) = args.map {
        config.map_name = map;
    }

    let mut server = GameServer::new(&bind_addr, config, Duration::from_secs(args.timeout))?;
    log::info!("Server started on {}", server.local_addr());

    if let Some(seconds) = args.duration {
        let running = server.running();
        thread::spawn(move || {
            thread::sleep(Duration::from_secs(seconds));
            running.store(false, Ordering::SeqCst);
        });
    }

    server.run();

    let stats = server.stats();
    log::info!(
        "Server shutting down ({} packets sent, {} received)",
        stats.packets_sent,
        stats.packets_received
    );
    Ok(())
}
