use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tether::{
    CommandTarget, NetworkEndpoint, NetworkStats, ServerConfig, SessionEvent, SessionManager,
    SnapshotMessage,
};

use crate::simulation::World;

const MOVER_COUNT: u32 = 4;

pub struct GameServer {
    endpoint: NetworkEndpoint,
    sessions: SessionManager,
    world: World,
    tick_duration: Duration,
    last_tick_time: Instant,
    accumulator: Duration,
    client_timeout: Duration,
    last_heard: HashMap<usize, Instant>,
    running: Arc<AtomicBool>,
}

impl GameServer {
    pub fn new(
        bind_addr: &str,
        config: ServerConfig,
        client_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let endpoint = NetworkEndpoint::bind(bind_addr)?;
        let tick_duration = Duration::from_millis(config.tick_interval_ms() as u64);
        let world = World::new(config.max_clients, MOVER_COUNT);
        let sessions = SessionManager::new(config)?;

        Ok(Self {
            endpoint,
            sessions,
            world,
            tick_duration,
            last_tick_time: Instant::now(),
            accumulator: Duration::ZERO,
            client_timeout,
            last_heard: HashMap::new(),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn stats(&self) -> &NetworkStats {
        self.endpoint.stats()
    }

    pub fn run(&mut self) {
        while self.running.load(Ordering::SeqCst) {
            self.tick_once();
            std::thread::sleep(Duration::from_millis(1));
        }
        self.shutdown_connections();
    }

    pub fn shutdown_connections(&mut self) {
        self.sessions.shutdown("server shutting down");
        self.flush();
        self.handle_events();
    }

    pub fn tick_once(&mut self) {
        let now = Instant::now();
        let delta = now - self.last_tick_time;
        self.last_tick_time = now;
        self.accumulator += delta;

        if let Err(e) = self.process_network() {
            log::error!("network error: {}", e);
        }

        while self.accumulator >= self.tick_duration {
            self.accumulator -= self.tick_duration;
            self.tick();
        }

        self.flush();
    }

    fn process_network(&mut self) -> io::Result<()> {
        let now = Instant::now();
        for (datagram, addr) in self.endpoint.receive_from()? {
            let Some((client_num, commands)) = self.sessions.process_datagram(addr, datagram) else {
                continue;
            };
            self.last_heard.insert(client_num, now);
            for cmd in &commands {
                self.world.apply_command(client_num, cmd);
            }
        }
        self.handle_events();
        Ok(())
    }

    fn handle_events(&mut self) {
        let events: Vec<SessionEvent> = self.sessions.drain_events().collect();
        for event in events {
            match event {
                SessionEvent::ClientConnected { client_num, addr } => {
                    log::info!("client {} connected from {}", client_num, addr);
                    self.world.spawn(client_num);
                    self.last_heard.insert(client_num, Instant::now());
                    self.sessions.send_server_command(
                        CommandTarget::All,
                        &format!("print \"client {} joined\"", client_num),
                    );
                }
                SessionEvent::ClientEntered { client_num } => {
                    log::info!("client {} entered the game", client_num);
                }
                SessionEvent::ClientCommand { client_num, text } => {
                    log::debug!("client {}: {}", client_num, text);
                }
                SessionEvent::ClientDropped { client_num, reason } => {
                    log::info!("client {} dropped: {}", client_num, reason);
                    self.world.despawn(client_num);
                    self.last_heard.remove(&client_num);
                }
            }
        }
    }

    fn tick(&mut self) {
        self.world.advance(self.tick_duration.as_millis() as i32);
        self.broadcast_snapshots();
        self.drop_timed_out();
    }

    fn broadcast_snapshots(&mut self) {
        let connected: Vec<usize> = self.sessions.sessions().map(|s| s.client_num()).collect();
        for client_num in connected {
            let Some(player_state) = self.world.player(client_num).copied() else {
                continue;
            };
            let command_number = self
                .sessions
                .session(client_num)
                .map_or(0, |s| s.last_user_command());

            self.sessions.send_snapshot(
                client_num,
                SnapshotMessage {
                    server_time: self.world.server_time(),
                    snap_flags: 0,
                    area_mask: [0xFF; 32],
                    command_number,
                    player_state,
                    entities: self.world.entities_for(client_num),
                },
            );
        }
        self.handle_events();
    }

    fn drop_timed_out(&mut self) {
        let timed_out: Vec<usize> = self
            .last_heard
            .iter()
            .filter(|(_, heard)| heard.elapsed() > self.client_timeout)
            .map(|(client_num, _)| *client_num)
            .collect();

        for client_num in timed_out {
            self.sessions.drop_client(client_num, "timed out");
        }
        self.handle_events();
    }

    fn flush(&mut self) {
        let outgoing: Vec<(SocketAddr, Vec<u8>)> = self.sessions.drain_outgoing().collect();
        for (addr, datagram) in outgoing {
            if let Err(e) = self.endpoint.send_to(&datagram, addr) {
                log::warn!("send to {} failed: {}", addr, e);
            }
        }
    }
}
