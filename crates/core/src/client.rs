use crate::config::ConnectionConfig;
use crate::config_string::{ConfigStringTable, GameState, PatchOutcome, SystemInfo, CS_SYSTEMINFO};
use crate::error::ProtocolError;
use crate::net::{
    decode_server_packet, encode_client_packet, is_out_of_band, sequence_greater_than,
    ClientHeader, ClientPacket, DatagramChannel, GameStateMessage, OutOfBand, ReliableCommandLog,
    SequencedCommand, ServerCommand, ServerHeader, ServerPacket, SnapshotMessage,
    MAX_RELIABLE_COMMANDS, PROTOCOL_VERSION, SERVER_HEADER_LEN,
};
use crate::snapshot::{Frame, SnapFlags, Snapshot, SnapshotRing};
use crate::time::{ConnectionState, TimeBase};
use crate::usercmd::{UserCommand, UserCommandRing};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    /// `GetChallenge` sent.
    Challenging,
    /// `Connect` sent with the server's challenge.
    Connecting,
    /// Accepted, waiting for the gamestate.
    Connected,
    /// Gamestate loaded, waiting for the first snapshot.
    Primed,
    Active,
}

/// Client end of one server connection.
pub struct Connection {
    config: ConnectionConfig,
    phase: ClientState,
    challenge: u32,
    client_num: u32,
    system_info: SystemInfo,
    incoming_sequence: u32,
    outgoing_sequence: u32,
    reliable_commands: ReliableCommandLog,
    reliable_acknowledge: u32,
    server_commands: ReliableCommandLog,
    last_executed_server_command: u32,
    snapshots: SnapshotRing,
    user_commands: UserCommandRing,
    config_strings: ConfigStringTable,
    time: TimeBase,
    disconnect_reason: Option<String>,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new(ConnectionConfig::default())
    }
}

impl Connection {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            time: TimeBase::new(config.time_base.clone()),
            config,
            phase: ClientState::Disconnected,
            challenge: 0,
            client_num: 0,
            system_info: SystemInfo::default(),
            incoming_sequence: 0,
            outgoing_sequence: 0,
            reliable_commands: ReliableCommandLog::new(),
            reliable_acknowledge: 0,
            server_commands: ReliableCommandLog::new(),
            last_executed_server_command: 0,
            snapshots: SnapshotRing::default(),
            user_commands: UserCommandRing::default(),
            config_strings: ConfigStringTable::new(),
            disconnect_reason: None,
        }
    }

    pub fn state(&self) -> ClientState {
        match (self.phase, self.time.state()) {
            (ClientState::Primed, ConnectionState::Active) => ClientState::Active,
            (phase, _) => phase,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.phase,
            ClientState::Connected | ClientState::Primed | ClientState::Active
        )
    }

    pub fn client_num(&self) -> u32 {
        self.client_num
    }

    pub fn challenge(&self) -> u32 {
        self.challenge
    }

    pub fn server_id(&self) -> u32 {
        self.system_info.server_id
    }

    pub fn system_info(&self) -> &SystemInfo {
        &self.system_info
    }

    pub fn time_base(&self) -> &TimeBase {
        &self.time
    }

    pub fn time_base_mut(&mut self) -> &mut TimeBase {
        &mut self.time
    }

    pub fn incoming_sequence(&self) -> u32 {
        self.incoming_sequence
    }

    pub fn server_command_sequence(&self) -> u32 {
        self.server_commands.sequence()
    }

    pub fn last_executed_server_command(&self) -> u32 {
        self.last_executed_server_command
    }

    /// Why the last session ended, if it ended abnormally or by server request.
    pub fn disconnect_reason(&self) -> Option<&str> {
        self.disconnect_reason.as_deref()
    }

    /// Resets all session state and asks the server for a challenge.
    pub fn connect<C: DatagramChannel>(&mut self, channel: &mut C) -> Result<(), ProtocolError> {
        self.reset();
        self.phase = ClientState::Challenging;
        log::info!("requesting challenge");
        channel.transmit(&OutOfBand::GetChallenge.encode()?)?;
        Ok(())
    }

    /// Repeats whichever handshake step is outstanding.
    pub fn resend_handshake<C: DatagramChannel>(
        &mut self,
        channel: &mut C,
    ) -> Result<(), ProtocolError> {
        let message = match self.phase {
            ClientState::Challenging => OutOfBand::GetChallenge,
            ClientState::Connecting => OutOfBand::Connect {
                challenge: self.challenge,
                protocol: PROTOCOL_VERSION,
            },
            _ => return Ok(()),
        };
        channel.transmit(&message.encode()?)?;
        Ok(())
    }

    /// Sends a final `disconnect` to the server and tears the session down.
    pub fn disconnect<C: DatagramChannel>(&mut self, channel: &mut C) {
        if self.is_connected() && self.add_reliable_command("disconnect").is_ok() {
            if let Err(e) = self.send_packet(channel) {
                log::debug!("failed to send disconnect: {}", e);
            }
        }
        self.drop_connection("disconnected");
    }

    /// Local teardown, recording `reason`.
    pub fn drop_connection(&mut self, reason: &str) {
        if self.phase != ClientState::Disconnected {
            log::info!("connection dropped: {}", reason);
        }
        self.reset();
        self.disconnect_reason = Some(reason.to_string());
    }

    fn reset(&mut self) {
        let config = self.config.clone();
        *self = Self::new(config);
    }

    /// Drains and processes every pending datagram. A fatal error has
    /// already torn the session down when it is returned.
    pub fn poll<C: DatagramChannel>(&mut self, channel: &mut C) -> Result<(), ProtocolError> {
        while let Some(datagram) = channel.receive()? {
            let result = self
                .process_datagram(datagram)
                .and_then(|reply| match reply {
                    Some(bytes) => channel.transmit(&bytes).map_err(ProtocolError::from),
                    None => Ok(()),
                });

            if let Err(e) = result {
                log::error!("fatal: {}", e);
                self.drop_connection(&e.drop_reason());
                return Err(e);
            }
        }
        Ok(())
    }

    /// Handles one datagram, returning an out-of-band reply if the handshake
    /// needs one.
    pub fn process_datagram(
        &mut self,
        mut datagram: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, ProtocolError> {
        if is_out_of_band(&datagram) {
            return self.process_out_of_band(&datagram);
        }

        if !self.is_connected() {
            log::debug!("ignoring sequenced datagram while {:?}", self.phase);
            return Ok(None);
        }

        let peek = match ServerHeader::read(&datagram) {
            Ok(header) => header,
            Err(e) => {
                log::warn!("dropping runt datagram: {}", e);
                return Ok(None);
            }
        };
        if !sequence_greater_than(peek.sequence, self.incoming_sequence) {
            log::debug!(
                "out of order datagram {} (last {})",
                peek.sequence,
                self.incoming_sequence
            );
            return Ok(None);
        }

        let header = decode_server_packet(self.challenge, &mut datagram, &self.reliable_commands)?;
        let packet =
            ServerPacket::from_bytes(&datagram[SERVER_HEADER_LEN..]).map_err(ProtocolError::Desync)?;

        let dropped = header
            .sequence
            .wrapping_sub(self.incoming_sequence)
            .wrapping_sub(1);
        if dropped > 0 && self.incoming_sequence != 0 {
            log::debug!("{} datagrams dropped before {}", dropped, header.sequence);
        }
        self.incoming_sequence = header.sequence;

        self.reliable_acknowledge = header.reliable_ack;
        if self
            .reliable_commands
            .sequence()
            .wrapping_sub(self.reliable_acknowledge) as usize
            > MAX_RELIABLE_COMMANDS
        {
            self.reliable_acknowledge = self.reliable_commands.sequence();
        }

        if let Some(gamestate) = packet.gamestate {
            self.parse_gamestate(gamestate)?;
        }
        self.store_server_commands(&packet.commands)?;
        if let Some(snapshot) = packet.snapshot {
            self.parse_snapshot(header.sequence, snapshot);
        }

        Ok(None)
    }

    fn process_out_of_band(&mut self, datagram: &[u8]) -> Result<Option<Vec<u8>>, ProtocolError> {
        let message = match OutOfBand::decode(datagram) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("bad out-of-band datagram: {}", e);
                return Ok(None);
            }
        };

        match (self.phase, message) {
            (ClientState::Challenging, OutOfBand::Challenge { challenge }) => {
                log::debug!("received challenge {:#010x}", challenge);
                self.challenge = challenge;
                self.phase = ClientState::Connecting;
                let connect = OutOfBand::Connect {
                    challenge,
                    protocol: PROTOCOL_VERSION,
                };
                Ok(Some(connect.encode()?))
            }
            (ClientState::Connecting, OutOfBand::ConnectResponse { client_num }) => {
                log::info!("connected as client {}", client_num);
                self.client_num = client_num;
                self.phase = ClientState::Connected;
                Ok(None)
            }
            (ClientState::Challenging | ClientState::Connecting, OutOfBand::Reject { reason }) => {
                Err(ProtocolError::ServerDisconnected { reason })
            }
            (phase, message) => {
                log::debug!("ignoring {:?} while {:?}", message, phase);
                Ok(None)
            }
        }
    }

    fn parse_gamestate(&mut self, gamestate: GameStateMessage) -> Result<(), ProtocolError> {
        let system_info = gamestate
            .config_strings
            .iter()
            .find(|entry| entry.index as usize == CS_SYSTEMINFO)
            .map(|entry| SystemInfo::parse(&entry.value))
            .unwrap_or_default();

        // Repeats of the gamestate we already loaded ride along until the
        // server sees our acknowledgement.
        if self.phase != ClientState::Connected && system_info.server_id == self.server_id() {
            return Ok(());
        }

        self.config_strings.reset_from(&gamestate.config_strings)?;
        self.client_num = gamestate.client_num;
        self.system_info = system_info;

        if sequence_greater_than(gamestate.command_sequence, self.server_commands.sequence()) {
            self.server_commands.reset_to(gamestate.command_sequence);
        }

        self.snapshots.clear();
        self.time.prime();
        self.phase = ClientState::Primed;
        log::info!(
            "gamestate loaded: {} configstrings, server id {}",
            gamestate.config_strings.len(),
            self.server_id()
        );
        Ok(())
    }

    fn store_server_commands(&mut self, commands: &[SequencedCommand]) -> Result<(), ProtocolError> {
        for command in commands {
            let latest = self.server_commands.sequence();
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
            log::debug!("server command {}: {}", command.sequence, command.text);
            self.server_commands.insert(command.sequence, &command.text);
        }
        Ok(())
    }

    fn parse_snapshot(&mut self, message_num: u32, snapshot: SnapshotMessage) {
        if !matches!(self.phase, ClientState::Primed) {
            return;
        }

        let mut frame = Frame::new(message_num, snapshot.server_time);
        frame.snap_flags = SnapFlags::from_bits_truncate(snapshot.snap_flags);
        frame.server_command_sequence = self.server_commands.sequence();
        frame.area_mask = snapshot.area_mask;
        frame.command_number = snapshot.command_number;
        frame.player_state = snapshot.player_state;

        if self.snapshots.store(frame, &snapshot.entities) {
            self.time.snapshot_arrived(snapshot.server_time);
        }
    }

    /// Queues a reliable command for the server.
    pub fn add_reliable_command(&mut self, text: &str) -> Result<u32, ProtocolError> {
        let outstanding = self
            .reliable_commands
            .sequence()
            .wrapping_sub(self.reliable_acknowledge);
        if outstanding as usize > MAX_RELIABLE_COMMANDS {
            return Err(ProtocolError::CommandOverflow { side: "client" });
        }
        Ok(self.reliable_commands.push(text))
    }

    /// Stores a locally sampled input and returns its command number.
    pub fn create_user_command(&mut self, cmd: UserCommand) -> u32 {
        self.user_commands.push(cmd)
    }

    /// Sends one datagram carrying unacknowledged reliable commands and the
    /// most recent user commands.
    pub fn send_packet<C: DatagramChannel>(&mut self, channel: &mut C) -> Result<(), ProtocolError> {
        if !self.is_connected() {
            return Err(ProtocolError::NotConnected);
        }

        self.outgoing_sequence = self.outgoing_sequence.wrapping_add(1);
        let packet = ClientPacket {
            sequence: self.outgoing_sequence,
            commands: self.reliable_commands.unacknowledged(self.reliable_acknowledge),
            user_commands: self
                .user_commands
                .recent(self.config.max_user_commands_per_packet),
        };

        let header = ClientHeader::new(
            self.server_id(),
            self.incoming_sequence,
            self.server_commands.sequence(),
        );
        let datagram = encode_client_packet(
            self.challenge,
            header,
            &packet.to_bytes()?,
            &self.server_commands,
        );
        channel.transmit(&datagram)?;
        Ok(())
    }

    /// Per-frame time update; `real_time` is local milliseconds.
    pub fn advance_time(&mut self, real_time: i32) -> Result<Option<i32>, ProtocolError> {
        let result = self.time.advance(real_time);
        self.drop_on_fatal(result)
    }

    /// `Ok(None)` when the frame fell out of the ring. Asking for a frame
    /// that has not arrived yet is fatal and drops the connection.
    pub fn fetch_snapshot(&mut self, sequence: u32) -> Result<Option<Snapshot>, ProtocolError> {
        let result = self.snapshots.fetch(sequence);
        self.drop_on_fatal(result)
    }

    pub fn fetch_user_command(
        &mut self,
        number: u32,
    ) -> Result<Option<UserCommand>, ProtocolError> {
        let result = self.user_commands.fetch(number);
        self.drop_on_fatal(result)
    }

    fn drop_on_fatal<T>(&mut self, result: Result<T, ProtocolError>) -> Result<T, ProtocolError> {
        if let Err(e) = &result {
            log::error!("fatal: {}", e);
            self.drop_connection(&e.drop_reason());
        }
        result
    }

    pub fn current_command_number(&self) -> u32 {
        self.user_commands.current()
    }

    /// Returns the server command numbered `sequence` for game logic. `cs`
    /// patches the configstring table first; `disconnect` tears the session
    /// down and surfaces as an error.
    pub fn fetch_server_command(
        &mut self,
        sequence: u32,
    ) -> Result<Option<ServerCommand>, ProtocolError> {
        let result = self.execute_server_command(sequence);
        self.drop_on_fatal(result)
    }

    fn execute_server_command(
        &mut self,
        sequence: u32,
    ) -> Result<Option<ServerCommand>, ProtocolError> {
        let latest = self.server_commands.sequence();
        if self.server_commands.is_cycled_out(sequence) {
            return Err(ProtocolError::ServerCommandCycledOut {
                requested: sequence,
                latest,
            });
        }
        if sequence_greater_than(sequence, latest) {
            return Err(ProtocolError::ServerCommandNotReceived {
                requested: sequence,
                latest,
            });
        }

        let Some(text) = self.server_commands.get(sequence) else {
            return Ok(None);
        };
        let command = ServerCommand::parse(text);
        self.last_executed_server_command = sequence;

        match &command {
            ServerCommand::Disconnect { reason } => Err(ProtocolError::ServerDisconnected {
                reason: reason
                    .clone()
                    .unwrap_or_else(|| "server disconnected".to_string()),
            }),
            ServerCommand::ConfigString { index, value } => {
                self.config_string_modified(*index, value)?;
                Ok(Some(command))
            }
            ServerCommand::LevelShot if !self.config.local_server => Ok(None),
            _ => Ok(Some(command)),
        }
    }

    fn config_string_modified(&mut self, index: i64, value: &str) -> Result<(), ProtocolError> {
        if self.config_strings.apply_patch(index, value)? == PatchOutcome::Unchanged {
            return Ok(());
        }

        if index == CS_SYSTEMINFO as i64 {
            self.system_info = SystemInfo::parse(value);
            log::info!("system info changed, server id {}", self.system_info.server_id);
        }
        Ok(())
    }

    pub fn game_state(&self) -> GameState {
        self.config_strings.game_state()
    }

    pub fn config_string(&self, index: usize) -> Option<&str> {
        self.config_strings.get(index)
    }

    /// Message number and server time of the newest stored snapshot.
    pub fn current_snapshot_time(&self) -> (u32, i32) {
        let time = self
            .snapshots
            .latest()
            .map(|frame| frame.server_time)
            .unwrap_or(0);
        (self.snapshots.latest_sequence(), time)
    }
}
