use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use tether::net::{encode_server_packet, SequencedCommand, ServerHeader, ServerPacket};
use tether::{
    ClientState, CommandTarget, Connection, DatagramChannel, EntityState, LoopbackChannel,
    NetworkEndpoint, PlayerState, ProtocolError, ReliableCommandLog, ServerCommand, ServerConfig,
    SessionEvent, SessionManager, SessionState, SnapshotMessage, UserCommand, CS_SERVERINFO,
};

const CLIENT_ADDR: ([u8; 4], u16) = ([10, 0, 0, 2], 27961);

fn client_addr() -> SocketAddr {
    SocketAddr::from(CLIENT_ADDR)
}

fn snapshot(server_time: i32, entity_count: u32) -> SnapshotMessage {
    SnapshotMessage {
        server_time,
        snap_flags: 0,
        area_mask: [0xFF; 32],
        command_number: 0,
        player_state: PlayerState {
            command_time: server_time,
            health: 100,
            ..Default::default()
        },
        entities: (0..entity_count).map(|n| EntityState::new(n, 1)).collect(),
    }
}

struct Harness {
    conn: Connection,
    client: LoopbackChannel,
    server: LoopbackChannel,
    manager: SessionManager,
}

impl Harness {
    fn new() -> Self {
        let (client, server) = LoopbackChannel::pair();
        Self {
            conn: Connection::default(),
            client,
            server,
            manager: SessionManager::new(ServerConfig::default()).unwrap(),
        }
    }

    /// Runs the handshake up to a loaded gamestate.
    fn connected() -> Self {
        let mut h = Self::new();
        h.conn.connect(&mut h.client).unwrap();
        h.pump_server();
        h.conn.poll(&mut h.client).unwrap();
        h.pump_server();
        h.conn.poll(&mut h.client).unwrap();
        assert_eq!(h.conn.state(), ClientState::Primed);
        h
    }

    /// Feeds every datagram queued towards the server and forwards the replies.
    fn pump_server(&mut self) -> Vec<UserCommand> {
        let mut commands = Vec::new();
        while let Some(datagram) = self.server.receive().unwrap() {
            if let Some((_, mut cmds)) = self.manager.process_datagram(client_addr(), datagram) {
                commands.append(&mut cmds);
            }
        }
        self.flush_server();
        commands
    }

    fn flush_server(&mut self) {
        let outgoing: Vec<_> = self.manager.drain_outgoing().collect();
        for (addr, datagram) in outgoing {
            assert_eq!(addr, client_addr());
            self.server.transmit(&datagram).unwrap();
        }
    }

    fn send_snapshot(&mut self, server_time: i32) {
        self.manager.send_snapshot(0, snapshot(server_time, 4));
        self.flush_server();
    }
}

#[test]
fn handshake_loads_gamestate() {
    let h = Harness::connected();

    assert_eq!(h.conn.client_num(), 0);
    assert_eq!(h.conn.server_id(), 1);
    assert!(h
        .conn
        .config_string(CS_SERVERINFO)
        .unwrap()
        .contains("\\mapname\\arena"));
    assert_eq!(h.manager.session(0).unwrap().state(), SessionState::Primed);
}

#[test]
fn first_snapshot_activates_time_base() {
    let mut h = Harness::connected();
    h.send_snapshot(1000);
    h.conn.poll(&mut h.client).unwrap();

    assert_eq!(h.conn.advance_time(0).unwrap(), Some(1000));
    assert_eq!(h.conn.state(), ClientState::Active);

    let (sequence, time) = h.conn.current_snapshot_time();
    assert_eq!(time, 1000);
    let snap = h.conn.fetch_snapshot(sequence).unwrap().unwrap();
    assert_eq!(snap.entities.len(), 4);
    assert_eq!(snap.player_state.health, 100);
    assert!(matches!(
        h.conn.fetch_snapshot(sequence + 1),
        Err(ProtocolError::FutureSnapshot { .. })
    ));
}

#[test]
fn future_snapshot_request_drops_connection() {
    let mut h = Harness::connected();
    let requested = h.conn.incoming_sequence() + 5;

    assert!(matches!(
        h.conn.fetch_snapshot(requested),
        Err(ProtocolError::FutureSnapshot { .. })
    ));
    assert_eq!(h.conn.state(), ClientState::Disconnected);
    assert!(!h.conn.is_connected());
    assert!(h.conn.disconnect_reason().is_some());
}

#[test]
fn future_user_command_request_drops_connection() {
    let mut h = Harness::connected();
    let requested = h.conn.current_command_number() + 1;

    assert!(matches!(
        h.conn.fetch_user_command(requested),
        Err(ProtocolError::FutureUserCommand { .. })
    ));
    assert_eq!(h.conn.state(), ClientState::Disconnected);
    assert!(h.conn.disconnect_reason().is_some());
}

#[test]
fn user_commands_reach_server_once() {
    let mut h = Harness::connected();
    h.send_snapshot(1000);
    h.conn.poll(&mut h.client).unwrap();

    for t in [1000, 1016, 1032] {
        h.conn.create_user_command(UserCommand::new(t));
    }
    h.conn.send_packet(&mut h.client).unwrap();
    let first = h.pump_server();
    assert_eq!(
        first.iter().map(|c| c.number).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(h.manager.session(0).unwrap().state(), SessionState::Active);

    h.conn.create_user_command(UserCommand::new(1048));
    h.conn.send_packet(&mut h.client).unwrap();
    let second = h.pump_server();
    assert_eq!(second.iter().map(|c| c.number).collect::<Vec<_>>(), vec![4]);
    assert_eq!(h.manager.session(0).unwrap().last_user_command(), 4);
    assert_eq!(h.conn.current_command_number(), 4);
}

#[test]
fn configstring_patch_replicates_through_cipher() {
    let mut h = Harness::connected();
    h.manager.set_config_string(5, "mapname\\test").unwrap();
    h.send_snapshot(1000);
    h.conn.poll(&mut h.client).unwrap();

    let sequence = h.conn.server_command_sequence();
    assert_eq!(sequence, 1);
    let command = h.conn.fetch_server_command(sequence).unwrap().unwrap();
    assert_eq!(
        command,
        ServerCommand::ConfigString {
            index: 5,
            value: "mapname\\test".into()
        }
    );
    assert_eq!(h.conn.config_string(5), Some("mapname\\test"));

    // both directions now key off non-empty command text
    h.conn.add_reliable_command("say \"hello\"").unwrap();
    h.conn.send_packet(&mut h.client).unwrap();
    h.pump_server();
    assert_eq!(h.manager.session(0).unwrap().reliable_acknowledge(), 1);
    assert!(h.manager.drain_events().any(|e| matches!(
        e,
        SessionEvent::ClientCommand { ref text, .. } if text == "say \"hello\""
    )));

    h.send_snapshot(1050);
    h.conn.poll(&mut h.client).unwrap();
    assert_eq!(h.conn.current_snapshot_time().1, 1050);
}

#[test]
fn game_commands_are_passed_through() {
    let mut h = Harness::connected();
    h.manager
        .send_server_command(CommandTarget::Client(0), "print \"round starts\"");
    h.send_snapshot(1000);
    h.conn.poll(&mut h.client).unwrap();

    assert_eq!(
        h.conn.fetch_server_command(1).unwrap(),
        Some(ServerCommand::Game {
            verb: "print".into(),
            args: vec!["round starts".into()],
        })
    );
}

#[test]
fn reordered_and_duplicate_datagrams_are_discarded() {
    let mut h = Harness::connected();
    for time in [1000, 1050, 1100] {
        h.send_snapshot(time);
    }
    h.client.reorder_incoming();
    h.conn.poll(&mut h.client).unwrap();

    let (newest, time) = h.conn.current_snapshot_time();
    assert_eq!(time, 1100);
    assert!(h.conn.fetch_snapshot(newest - 1).unwrap().is_none());

    h.manager.send_snapshot(0, snapshot(1150, 1));
    let (_, datagram) = h.manager.drain_outgoing().next().unwrap();
    h.server.transmit(&datagram).unwrap();
    h.server.transmit(&datagram).unwrap();
    h.conn.poll(&mut h.client).unwrap();

    assert_eq!(h.conn.current_snapshot_time(), (newest + 1, 1150));
    assert!(h.conn.is_connected());
}

#[test]
fn lost_packets_leave_gaps() {
    let mut h = Harness::connected();
    h.send_snapshot(1000);
    h.conn.poll(&mut h.client).unwrap();
    let (first, _) = h.conn.current_snapshot_time();

    h.send_snapshot(1050);
    assert_eq!(h.client.discard_incoming(), 1);
    h.send_snapshot(1100);
    h.conn.poll(&mut h.client).unwrap();

    assert!(h.conn.fetch_snapshot(first).unwrap().is_some());
    assert!(h.conn.fetch_snapshot(first + 1).unwrap().is_none());
    assert!(h.conn.fetch_snapshot(first + 2).unwrap().is_some());
}

#[test]
fn keystream_desync_drops_connection() {
    let mut h = Harness::connected();

    let mut wrong_log = ReliableCommandLog::new();
    wrong_log.insert(0, "not what the client sent");
    let payload = ServerPacket {
        snapshot: Some(snapshot(1000, 16)),
        ..Default::default()
    }
    .to_bytes()
    .unwrap();
    let header = ServerHeader::new(h.conn.incoming_sequence() + 1, 0);
    let datagram = encode_server_packet(h.conn.challenge(), header, &payload, &wrong_log);
    h.server.transmit(&datagram).unwrap();

    assert!(matches!(
        h.conn.poll(&mut h.client),
        Err(ProtocolError::Desync(_))
    ));
    assert_eq!(h.conn.state(), ClientState::Disconnected);
    assert!(h.conn.disconnect_reason().is_some());
}

#[test]
fn skipped_reliable_command_is_fatal() {
    let mut h = Harness::connected();

    let payload = ServerPacket {
        commands: vec![SequencedCommand {
            sequence: 3,
            text: "print \"too far\"".into(),
        }],
        ..Default::default()
    }
    .to_bytes()
    .unwrap();
    let header = ServerHeader::new(h.conn.incoming_sequence() + 1, 0);
    let datagram =
        encode_server_packet(h.conn.challenge(), header, &payload, &ReliableCommandLog::new());
    h.server.transmit(&datagram).unwrap();

    assert!(matches!(
        h.conn.poll(&mut h.client),
        Err(ProtocolError::LostReliableCommands {
            expected: 1,
            received: 3
        })
    ));
}

#[test]
fn server_kick_surfaces_as_disconnect() {
    let mut h = Harness::connected();
    h.manager.drop_client(0, "kicked by admin");
    h.flush_server();
    h.conn.poll(&mut h.client).unwrap();

    let sequence = h.conn.server_command_sequence();
    assert!(matches!(
        h.conn.fetch_server_command(sequence),
        Err(ProtocolError::ServerDisconnected { ref reason }) if reason == "kicked by admin"
    ));
    assert_eq!(h.conn.state(), ClientState::Disconnected);
    assert_eq!(h.manager.connected_count(), 0);
}

#[test]
fn client_disconnect_frees_server_slot() {
    let mut h = Harness::connected();
    h.send_snapshot(1000);
    h.conn.poll(&mut h.client).unwrap();

    h.conn.disconnect(&mut h.client);
    h.pump_server();

    assert_eq!(h.conn.state(), ClientState::Disconnected);
    assert!(h.manager.session(0).is_none());
    assert!(h.manager.drain_events().any(|e| matches!(
        e,
        SessionEvent::ClientDropped { ref reason, .. } if reason == "disconnected"
    )));
}

#[test]
fn handshake_over_udp() {
    let mut server_endpoint = NetworkEndpoint::bind("127.0.0.1:0").unwrap();
    let mut client_endpoint = NetworkEndpoint::bind("127.0.0.1:0").unwrap();
    client_endpoint.set_remote(server_endpoint.local_addr());

    let mut manager = SessionManager::new(ServerConfig::default()).unwrap();
    let mut conn = Connection::default();
    conn.connect(&mut client_endpoint).unwrap();

    let start = Instant::now();
    while conn.state() != ClientState::Primed && start.elapsed() < Duration::from_secs(2) {
        for (datagram, addr) in server_endpoint.receive_from().unwrap() {
            manager.process_datagram(addr, datagram);
        }
        let outgoing: Vec<_> = manager.drain_outgoing().collect();
        for (addr, datagram) in outgoing {
            server_endpoint.send_to(&datagram, addr).unwrap();
        }
        conn.poll(&mut client_endpoint).unwrap();
        thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(conn.state(), ClientState::Primed);
    assert_eq!(manager.lookup(client_endpoint.local_addr()), Some(0));
}
