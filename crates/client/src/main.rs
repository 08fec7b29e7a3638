pub mod net;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use clap::Parser;

use net::{ClientConfig, NetworkClient};

#[derive(Parser)]
#[command(name = "tether-client")]
#[command(about = "Headless tether client")]
struct Args {
    #[arg(
        short,
        long,
        help = "Server address to connect to (e.g., 127.0.0.1:27960)"
    )]
    server: String,

    #[arg(short, long, help = "TOML file with client settings")]
    config: Option<PathBuf>,

    #[arg(long, help = "Disconnect after this many seconds")]
    duration: Option<u64>,

    #[arg(long, allow_hyphen_values = true, help = "Milliseconds subtracted from server time")]
    time_nudge: Option<i32>,

    #[arg(long, help = "Log every time base correction")]
    show_time_delta: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => tether::config::load_toml::<ClientConfig>(path)?,
        None => ClientConfig::default(),
    };
    if let Some(nudge) = args.time_nudge {
        config.connection.time_base.time_nudge_ms = nudge;
    }
    if args.show_time_delta {
        config.connection.time_base.show_time_delta = true;
    }

    let server_addr: SocketAddr = args.server.parse()?;
    let mut client = NetworkClient::new(config)?;
    client.connect(server_addr)?;

    if let Some(seconds) = args.duration {
        let running = client.running();
        thread::spawn(move || {
            thread::sleep(Duration::from_secs(seconds));
            running.store(false, Ordering::SeqCst);
        });
    }

    client.run()?;

    let stats = client.stats();
    log::info!(
        "Session ended in state {:?} ({} packets sent, {} received)",
        client.state(),
        stats.packets_sent,
        stats.packets_received
    );
    Ok(())
}
