use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use crate::config::ServerConfig;
use crate::config_string::{ConfigStringTable, PatchOutcome, CS_SERVERINFO, CS_SYSTEMINFO};
use crate::error::ProtocolError;
use crate::net::{
    decode_client_packet, encode_server_packet, is_out_of_band, rand_u32, sequence_greater_than,
    tokenize, ClientHeader, ClientPacket, CommandTarget, GameStateMessage, OutOfBand,
    ReliableCommandLog, ServerCommand, ServerHeader, ServerPacket, SnapshotMessage,
    CLIENT_HEADER_LEN, MAX_RELIABLE_COMMANDS, PROTOCOL_VERSION,
};
use crate::usercmd::UserCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Gamestate sent, not yet acknowledged.
    Primed,
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ClientConnected { client_num: usize, addr: SocketAddr },
    ClientEntered { client_num: usize },
    ClientCommand { client_num: usize, text: String },
    ClientDropped { client_num: usize, reason: String },
}

/// Server end of one client connection.
#[derive(Debug)]
pub struct ClientSession {
    client_num: usize,
    addr: SocketAddr,
    challenge: u32,
    state: SessionState,
    outgoing_sequence: u32,
    incoming_sequence: u32,
    message_acknowledge: u32,
    gamestate_message: u32,
    reliable_commands: ReliableCommandLog,
    reliable_acknowledge: u32,
    client_commands: ReliableCommandLog,
    last_user_command: u32,
}

impl ClientSession {
    fn new(client_num: usize, addr: SocketAddr, challenge: u32) -> Self {
        Self {
            client_num,
            addr,
            challenge,
            state: SessionState::Primed,
            outgoing_sequence: 0,
            incoming_sequence: 0,
            message_acknowledge: 0,
            gamestate_message: 0,
            reliable_commands: ReliableCommandLog::new(),
            reliable_acknowledge: 0,
            client_commands: ReliableCommandLog::new(),
            last_user_command: 0,
        }
    }

    pub fn client_num(&self) -> usize {
        self.client_num
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn challenge(&self) -> u32 {
        self.challenge
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn reliable_sequence(&self) -> u32 {
        self.reliable_commands.sequence()
    }

    pub fn reliable_acknowledge(&self) -> u32 {
        self.reliable_acknowledge
    }

    pub fn client_command_sequence(&self) -> u32 {
        self.client_commands.sequence()
    }

    /// Number of the newest user command executed for this client.
    pub fn last_user_command(&self) -> u32 {
        self.last_user_command
    }

    fn add_server_command(&mut self, text: &str) -> Result<u32, ProtocolError> {
        let outstanding = self
            .reliable_commands
            .sequence()
            .wrapping_sub(self.reliable_acknowledge);
        if outstanding as usize > MAX_RELIABLE_COMMANDS {
            return Err(ProtocolError::CommandOverflow { side: "server" });
        }
        Ok(self.reliable_commands.push(text))
    }

    /// Encrypts `packet` after attaching every unacknowledged reliable command.
    fn build_datagram(&mut self, mut packet: ServerPacket) -> Result<Vec<u8>, ProtocolError> {
        self.outgoing_sequence = self.outgoing_sequence.wrapping_add(1);
        packet.commands = self
            .reliable_commands
            .unacknowledged(self.reliable_acknowledge);

        let header = ServerHeader::new(self.outgoing_sequence, self.client_commands.sequence());
        Ok(encode_server_packet(
            self.challenge,
            header,
            &packet.to_bytes()?,
            &self.client_commands,
        ))
    }
}

/// Owns every connected client plus the authoritative configstring table.
///
/// Outgoing datagrams are queued with their destination; the caller drains
/// them with [`SessionManager::drain_outgoing`] and hands them to a socket.
pub struct SessionManager {
    config: ServerConfig,
    sessions: Vec<Option<ClientSession>>,
    challenges: HashMap<SocketAddr, u32>,
    config_strings: ConfigStringTable,
    outgoing: VecDeque<(SocketAddr, Vec<u8>)>,
    events: VecDeque<SessionEvent>,
}

impl SessionManager {
    pub fn new(config: ServerConfig) -> Result<Self, ProtocolError> {
        let mut config_strings = ConfigStringTable::new();
        config_strings.apply_patch(
            CS_SERVERINFO as i64,
            &format!(
                "\\sv_hostname\\{}\\mapname\\{}\\sv_maxclients\\{}",
                config.hostname, config.map_name, config.max_clients
            ),
        )?;
        config_strings.apply_patch(
            CS_SYSTEMINFO as i64,
            &format!("\\sv_serverid\\{}", config.server_id),
        )?;

        Ok(Self {
            sessions: (0..config.max_clients).map(|_| None).collect(),
            config,
            challenges: HashMap::new(),
            config_strings,
            outgoing: VecDeque::new(),
            events: VecDeque::new(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn max_clients(&self) -> usize {
        self.sessions.len()
    }

    pub fn config_string(&self, index: usize) -> Option<&str> {
        self.config_strings.get(index)
    }

    pub fn session(&self, client_num: usize) -> Option<&ClientSession> {
        self.sessions.get(client_num).and_then(Option::as_ref)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &ClientSession> {
        self.sessions.iter().flatten()
    }

    pub fn connected_count(&self) -> usize {
        self.sessions().count()
    }

    pub fn lookup(&self, addr: SocketAddr) -> Option<usize> {
        self.sessions()
            .find(|session| session.addr == addr)
            .map(|session| session.client_num)
    }

    pub fn drain_outgoing(&mut self) -> impl Iterator<Item = (SocketAddr, Vec<u8>)> + '_ {
        self.outgoing.drain(..)
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = SessionEvent> + '_ {
        self.events.drain(..)
    }

    /// Handles one inbound datagram. Returns the user commands it carried
    /// that are newer than anything already executed for that client.
    pub fn process_datagram(
        &mut self,
        addr: SocketAddr,
        datagram: Vec<u8>,
    ) -> Option<(usize, Vec<UserCommand>)> {
        if is_out_of_band(&datagram) {
            if let Err(e) = self.process_out_of_band(addr, &datagram) {
                log::warn!("out-of-band from {} failed: {}", addr, e);
            }
            return None;
        }

        let Some(client_num) = self.lookup(addr) else {
            log::debug!("sequenced datagram from unknown peer {}", addr);
            return None;
        };

        match self.process_client_packet(client_num, datagram) {
            Ok(Some(commands)) => Some((client_num, commands)),
            Ok(None) => None,
            Err(e) => {
                log::error!("client {}: {}", client_num, e);
                self.drop_client(client_num, &e.drop_reason());
                None
            }
        }
    }

    fn process_out_of_band(
        &mut self,
        addr: SocketAddr,
        datagram: &[u8],
    ) -> Result<(), ProtocolError> {
        match OutOfBand::decode(datagram)? {
            OutOfBand::GetChallenge => {
                let challenge = *self.challenges.entry(addr).or_insert_with(rand_u32);
                log::debug!("challenge {:#010x} for {}", challenge, addr);
                self.queue_out_of_band(addr, &OutOfBand::Challenge { challenge })
            }
            OutOfBand::Connect {
                challenge,
                protocol,
            } => self.accept_connect(addr, challenge, protocol),
            other => {
                log::debug!("ignoring {:?} from {}", other, addr);
                Ok(())
            }
        }
    }

    fn accept_connect(
        &mut self,
        addr: SocketAddr,
        challenge: u32,
        protocol: u32,
    ) -> Result<(), ProtocolError> {
        if protocol != PROTOCOL_VERSION {
            let reason = format!("server uses protocol version {}", PROTOCOL_VERSION);
            return self.queue_out_of_band(addr, &OutOfBand::Reject { reason });
        }
        if self.challenges.get(&addr) != Some(&challenge) {
            let reason = "no or bad challenge for address".to_string();
            return self.queue_out_of_band(addr, &OutOfBand::Reject { reason });
        }

        if let Some(client_num) = self.lookup(addr) {
            log::debug!("duplicate connect from client {}", client_num);
            let client_num = client_num as u32;
            return self.queue_out_of_band(addr, &OutOfBand::ConnectResponse { client_num });
        }

        let Some(client_num) = self.sessions.iter().position(Option::is_none) else {
            let reason = "server is full".to_string();
            return self.queue_out_of_band(addr, &OutOfBand::Reject { reason });
        };

        log::info!("client {} connected from {}", client_num, addr);
        self.sessions[client_num] = Some(ClientSession::new(client_num, addr, challenge));
        self.events
            .push_back(SessionEvent::ClientConnected { client_num, addr });

        self.queue_out_of_band(
            addr,
            &OutOfBand::ConnectResponse {
                client_num: client_num as u32,
            },
        )?;
        self.send_packet(client_num, None)
    }

    fn queue_out_of_band(
        &mut self,
        addr: SocketAddr,
        message: &OutOfBand,
    ) -> Result<(), ProtocolError> {
        self.outgoing.push_back((addr, message.encode()?));
        Ok(())
    }

    fn process_client_packet(
        &mut self,
        client_num: usize,
        mut datagram: Vec<u8>,
    ) -> Result<Option<Vec<UserCommand>>, ProtocolError> {
        let server_id = self.config.server_id;
        let Some(session) = self.sessions[client_num].as_mut() else {
            return Ok(None);
        };

        let peek = match ClientHeader::read(&datagram) {
            Ok(header) => header,
            Err(e) => {
                log::warn!("client {}: dropping runt datagram: {}", client_num, e);
                return Ok(None);
            }
        };
        if peek.server_id != server_id {
            log::debug!(
                "client {}: stale server id {} (current {})",
                client_num,
                peek.server_id,
                server_id
            );
            return Ok(None);
        }

        let header =
            decode_client_packet(session.challenge, &mut datagram, &session.reliable_commands)?;
        let packet =
            ClientPacket::from_bytes(&datagram[CLIENT_HEADER_LEN..]).map_err(ProtocolError::Desync)?;

        if !sequence_greater_than(packet.sequence, session.incoming_sequence) {
            log::debug!(
                "client {}: out of order datagram {} (last {})",
                client_num,
                packet.sequence,
                session.incoming_sequence
            );
            return Ok(None);
        }
        session.incoming_sequence = packet.sequence;

        if sequence_greater_than(header.message_ack, session.message_acknowledge) {
            session.message_acknowledge = header.message_ack;
        }

        session.reliable_acknowledge = header.reliable_ack;
        if session
            .reliable_commands
            .sequence()
            .wrapping_sub(session.reliable_acknowledge) as usize
            >= MAX_RELIABLE_COMMANDS
        {
            log::warn!("client {}: illegal reliable acknowledge", client_num);
            session.reliable_acknowledge = session.reliable_commands.sequence();
            return Ok(None);
        }

        if session.state == SessionState::Primed
            && !sequence_greater_than(session.gamestate_message, session.message_acknowledge)
        {
            log::info!("client {} entered the game", client_num);
            session.state = SessionState::Active;
            self.events.push_back(SessionEvent::ClientEntered { client_num });
        }

        let mut disconnect = false;
        for command in &packet.commands {
            let latest = session.client_commands.sequence();
            if !sequence_greater_than(command.sequence, latest) {
                continue;
            }
            let expected = latest.wrapping_add(1);
            if command.sequence != expected {
                return Err(ProtocolError::LostReliableCommands {
                    expected,
                    received: command.sequence,
                });
            }
            session.client_commands.insert(command.sequence, &command.text);

            if tokenize(&command.text).first().map(String::as_str) == Some("disconnect") {
                disconnect = true;
            }
            self.events.push_back(SessionEvent::ClientCommand {
                client_num,
                text: command.text.clone(),
            });
        }

        if disconnect {
            self.drop_client(client_num, "disconnected");
            return Ok(None);
        }

        let mut commands: Vec<UserCommand> = packet
            .user_commands
            .into_iter()
            .filter(|cmd| sequence_greater_than(cmd.number, session.last_user_command))
            .collect();
        commands.sort_by_key(|cmd| cmd.number.wrapping_sub(session.last_user_command));
        if let Some(last) = commands.last() {
            session.last_user_command = last.number;
        }

        Ok(Some(commands))
    }

    /// Queues a reliable command for one or all clients. Client numbers out
    /// of range are ignored. A client whose backlog overflows is dropped.
    pub fn send_server_command(&mut self, target: CommandTarget, text: &str) {
        let targets: Vec<usize> = match target {
            CommandTarget::All => self.sessions().map(ClientSession::client_num).collect(),
            CommandTarget::Client(client_num) if self.session(client_num).is_some() => {
                vec![client_num]
            }
            CommandTarget::Client(client_num) => {
                log::debug!("server command for absent client {} ignored", client_num);
                return;
            }
        };

        for client_num in targets {
            let Some(session) = self.sessions[client_num].as_mut() else {
                continue;
            };
            if let Err(e) = session.add_server_command(text) {
                log::warn!("client {}: {}", client_num, e);
                self.drop_client(client_num, &e.drop_reason());
            }
        }
    }

    /// Patches the authoritative table and replicates the change.
    pub fn set_config_string(&mut self, index: usize, value: &str) -> Result<(), ProtocolError> {
        if self.config_strings.apply_patch(index as i64, value)? == PatchOutcome::Unchanged {
            return Ok(());
        }

        let command = ServerCommand::ConfigString {
            index: index as i64,
            value: value.to_string(),
        };
        self.send_server_command(CommandTarget::All, &command.to_command_string());
        Ok(())
    }

    /// Sends a final `disconnect` and frees the slot.
    pub fn drop_client(&mut self, client_num: usize, reason: &str) {
        let Some(mut session) = self.sessions.get_mut(client_num).and_then(Option::take) else {
            return;
        };

        let command = ServerCommand::Disconnect {
            reason: Some(reason.to_string()),
        };
        // a full backlog would refuse the farewell; make room for it
        if session.add_server_command(&command.to_command_string()).is_err() {
            session.reliable_acknowledge = session.reliable_commands.sequence();
            session.reliable_commands.push(&command.to_command_string());
        }
        match session.build_datagram(ServerPacket::default()) {
            Ok(datagram) => self.outgoing.push_back((session.addr, datagram)),
            Err(e) => log::debug!("failed to build disconnect for {}: {}", client_num, e),
        }

        self.challenges.remove(&session.addr);
        log::info!("client {} dropped: {}", client_num, reason);
        self.events.push_back(SessionEvent::ClientDropped {
            client_num,
            reason: reason.to_string(),
        });
    }

    /// Sends `snapshot` to one client. Until the client acknowledges its
    /// gamestate, every packet repeats it.
    pub fn send_snapshot(&mut self, client_num: usize, snapshot: SnapshotMessage) {
        if let Err(e) = self.send_packet(client_num, Some(snapshot)) {
            log::error!("client {}: {}", client_num, e);
            self.drop_client(client_num, &e.drop_reason());
        }
    }

    fn send_packet(
        &mut self,
        client_num: usize,
        snapshot: Option<SnapshotMessage>,
    ) -> Result<(), ProtocolError> {
        let Some(session) = self.sessions.get_mut(client_num).and_then(Option::as_mut) else {
            return Ok(());
        };

        let gamestate = (session.state == SessionState::Primed).then(|| GameStateMessage {
            client_num: client_num as u32,
            command_sequence: session.reliable_acknowledge,
            config_strings: self.config_strings.entries(),
        });
        let carries_gamestate = gamestate.is_some();

        let datagram = session.build_datagram(ServerPacket {
            commands: Vec::new(),
            gamestate,
            snapshot,
        })?;
        if carries_gamestate && session.gamestate_message == 0 {
            session.gamestate_message = session.outgoing_sequence;
        }

        self.outgoing.push_back((session.addr, datagram));
        Ok(())
    }

    pub fn shutdown(&mut self, reason: &str) {
        let connected: Vec<usize> = self.sessions().map(ClientSession::client_num).collect();
        for client_num in connected {
            self.drop_client(client_num, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn handshake(manager: &mut SessionManager, from: SocketAddr) -> Vec<OutOfBand> {
        manager.process_datagram(from, OutOfBand::GetChallenge.encode().unwrap());
        let challenge = match OutOfBand::decode(&manager.drain_outgoing().next().unwrap().1) {
            Ok(OutOfBand::Challenge { challenge }) => challenge,
            other => panic!("expected challenge, got {other:?}"),
        };

        let connect = OutOfBand::Connect {
            challenge,
            protocol: PROTOCOL_VERSION,
        };
        manager.process_datagram(from, connect.encode().unwrap());
        manager
            .drain_outgoing()
            .filter_map(|(_, d)| OutOfBand::decode(&d).ok())
            .collect()
    }

    #[test]
    fn initial_configstrings() {
        let manager = SessionManager::new(ServerConfig::default()).unwrap();
        assert_eq!(manager.config_string(CS_SYSTEMINFO), Some("\\sv_serverid\\1"));
        assert!(manager.config_string(CS_SERVERINFO).unwrap().contains("\\mapname\\arena"));
    }

    #[test]
    fn connect_allocates_slot() {
        let mut manager = SessionManager::new(ServerConfig::default()).unwrap();
        let replies = handshake(&mut manager, addr(1000));

        assert_eq!(replies, vec![OutOfBand::ConnectResponse { client_num: 0 }]);
        assert_eq!(manager.lookup(addr(1000)), Some(0));
        assert_eq!(manager.session(0).unwrap().state(), SessionState::Primed);
        assert!(matches!(
            manager.drain_events().next(),
            Some(SessionEvent::ClientConnected { client_num: 0, .. })
        ));
    }

    #[test]
    fn full_server_rejects() {
        let mut manager = SessionManager::new(ServerConfig::default()).unwrap();
        handshake(&mut manager, addr(1000));

        let replies = handshake(&mut manager, addr(2000));
        assert!(matches!(replies.as_slice(), [OutOfBand::Reject { .. }]));
        assert_eq!(manager.connected_count(), 1);
    }

    #[test]
    fn bad_challenge_rejects() {
        let mut manager = SessionManager::new(ServerConfig::default()).unwrap();
        let connect = OutOfBand::Connect {
            challenge: 5,
            protocol: PROTOCOL_VERSION,
        };
        manager.process_datagram(addr(1000), connect.encode().unwrap());

        let (_, reply) = manager.drain_outgoing().next().unwrap();
        assert!(matches!(OutOfBand::decode(&reply), Ok(OutOfBand::Reject { .. })));
        assert_eq!(manager.connected_count(), 0);
    }

    #[test]
    fn out_of_range_target_is_ignored() {
        let mut manager = SessionManager::new(ServerConfig::default()).unwrap();
        handshake(&mut manager, addr(1000));

        manager.send_server_command(CommandTarget::Client(1), "print \"nobody\"");
        manager.send_server_command(CommandTarget::Client(usize::MAX), "print \"nobody\"");
        assert_eq!(manager.session(0).unwrap().reliable_sequence(), 0);

        manager.send_server_command(CommandTarget::All, "print \"everyone\"");
        assert_eq!(manager.session(0).unwrap().reliable_sequence(), 1);
    }

    #[test]
    fn command_overflow_drops_client() {
        let mut manager = SessionManager::new(ServerConfig::default()).unwrap();
        handshake(&mut manager, addr(1000));
        manager.drain_events().count();

        for _ in 0..=MAX_RELIABLE_COMMANDS + 1 {
            manager.send_server_command(CommandTarget::Client(0), "print spam");
        }

        assert!(manager.session(0).is_none());
        assert!(manager.drain_events().any(|e| matches!(
            e,
            SessionEvent::ClientDropped { ref reason, .. } if reason.contains("overflow")
        )));
    }

    #[test]
    fn set_config_string_broadcasts_once() {
        let mut manager = SessionManager::new(ServerConfig::default()).unwrap();
        handshake(&mut manager, addr(1000));

        manager.set_config_string(5, "mapname\\test").unwrap();
        manager.set_config_string(5, "mapname\\test").unwrap();

        assert_eq!(manager.session(0).unwrap().reliable_sequence(), 1);
        assert_eq!(manager.config_string(5), Some("mapname\\test"));
    }

    #[test]
    fn drop_client_frees_slot() {
        let mut manager = SessionManager::new(ServerConfig::default()).unwrap();
        handshake(&mut manager, addr(1000));

        manager.drop_client(0, "kicked");
        assert!(manager.session(0).is_none());
        assert_eq!(manager.drain_outgoing().count(), 1);

        manager.drop_client(0, "again");
        assert_eq!(manager.drain_outgoing().count(), 0);
    }
}
