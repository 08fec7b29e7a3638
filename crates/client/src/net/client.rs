use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tether::net::sequence_greater_than;
use tether::{
    ClientState, Connection, NetworkEndpoint, NetworkStats, ProtocolError, ServerCommand,
    CS_SERVERINFO,
};

use super::config::ClientConfig;
use super::input::InputState;

const DIAGNOSTICS_INTERVAL: Duration = Duration::from_secs(5);

pub struct NetworkClient {
    endpoint: NetworkEndpoint,
    connection: Connection,
    start_time: Instant,
    last_command_time: Instant,
    command_interval: Duration,
    last_handshake_time: Instant,
    handshake_interval: Duration,
    last_diagnostics_time: Instant,
    running: Arc<AtomicBool>,
}

impl NetworkClient {
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let mut endpoint = NetworkEndpoint::bind("0.0.0.0:0")?;
        endpoint.set_timeout(Duration::from_secs(config.connection_timeout_secs));

        let now = Instant::now();
        Ok(Self {
            endpoint,
            connection: Connection::new(config.connection.clone()),
            start_time: now,
            last_command_time: now,
            command_interval: Duration::from_secs_f64(1.0 / config.command_rate.max(1) as f64),
            last_handshake_time: now,
            handshake_interval: Duration::from_millis(config.handshake_resend_ms),
            last_diagnostics_time: now,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn state(&self) -> ClientState {
        self.connection.state()
    }

    pub fn stats(&self) -> &NetworkStats {
        self.endpoint.stats()
    }

    pub fn connect(&mut self, server_addr: SocketAddr) -> anyhow::Result<()> {
        log::info!("Connecting to {}", server_addr);

        self.endpoint.set_remote(server_addr);
        self.endpoint.touch();
        self.connection.connect(&mut self.endpoint)?;
        self.last_handshake_time = Instant::now();
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.connection.disconnect(&mut self.endpoint);
    }

    /// Milliseconds since the client started; the time base input.
    fn real_time(&self) -> i32 {
        self.start_time.elapsed().as_millis() as i32
    }

    /// Runs until the session ends or `running` is cleared.
    pub fn run(&mut self) -> anyhow::Result<()> {
        while self.running.load(Ordering::SeqCst) {
            self.update()?;
            if self.connection.state() == ClientState::Disconnected {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        if self.connection.is_connected() {
            self.disconnect();
        }
        Ok(())
    }

    pub fn update(&mut self) -> anyhow::Result<()> {
        if let Err(e) = self.connection.poll(&mut self.endpoint) {
            log::error!("Connection lost: {}", e);
            return Ok(());
        }

        if self.endpoint.is_timed_out() {
            log::warn!("Server connection timed out");
            self.connection.drop_connection("timed out");
            return Ok(());
        }

        match self.connection.state() {
            ClientState::Challenging | ClientState::Connecting => {
                if self.last_handshake_time.elapsed() >= self.handshake_interval {
                    self.connection.resend_handshake(&mut self.endpoint)?;
                    self.last_handshake_time = Instant::now();
                }
            }
            ClientState::Connected => {}
            ClientState::Primed | ClientState::Active => self.update_connected()?,
            ClientState::Disconnected => {}
        }

        Ok(())
    }

    fn update_connected(&mut self) -> anyhow::Result<()> {
        if let Err(e) = self.execute_server_commands() {
            log::warn!("{}", e);
            return Ok(());
        }

        let real_time = self.real_time();
        let Ok(server_time) = self.connection.advance_time(real_time) else {
            return Ok(());
        };

        if self.last_command_time.elapsed() >= self.command_interval {
            let elapsed = server_time.unwrap_or(real_time);
            let input = InputState::scripted(elapsed);
            self.connection.create_user_command(input.to_command(elapsed));
            self.connection.send_packet(&mut self.endpoint)?;
            self.last_command_time = Instant::now();
        }

        if self.last_diagnostics_time.elapsed() >= DIAGNOSTICS_INTERVAL {
            self.log_diagnostics(server_time);
            self.last_diagnostics_time = Instant::now();
        }
        Ok(())
    }

    fn execute_server_commands(&mut self) -> Result<(), ProtocolError> {
        let latest = self.connection.server_command_sequence();
        let mut next = self.connection.last_executed_server_command().wrapping_add(1);

        while !sequence_greater_than(next, latest) {
            match self.connection.fetch_server_command(next)? {
                Some(ServerCommand::Game { verb, args }) => {
                    log::info!("server: {} {}", verb, args.join(" "));
                }
                Some(ServerCommand::ConfigString { index, value }) => {
                    log::debug!("configstring {} = {}", index, value);
                }
                Some(_) | None => {}
            }
            next = next.wrapping_add(1);
        }
        Ok(())
    }

    fn log_diagnostics(&self, server_time: Option<i32>) {
        let time_base = self.connection.time_base();
        let (snapshot, snapshot_time) = self.connection.current_snapshot_time();
        let stats = self.endpoint.stats();

        log::info!(
            "server_time={:?} snapshot={}@{} delta={} extrapolated={} commands={} sent={} received={}",
            server_time,
            snapshot,
            snapshot_time,
            time_base.delta(),
            time_base.is_extrapolated(),
            self.connection.current_command_number(),
            stats.packets_sent,
            stats.packets_received,
        );
        if let Some(info) = self.connection.config_string(CS_SERVERINFO) {
            log::debug!("serverinfo {}", info);
        }
    }
}
