//! Per-packet XOR obfuscation keyed off state both peers already share.
//!
//! Not confidentiality: the seed is the connection challenge mixed with
//! plaintext header fields, and the keystream is the text of the reliable
//! command both peers agree was last acknowledged. Byte `i` of the datagram
//! (counted from the start of the datagram, header included) is processed as
//!
//! ```text
//! key ^= keystream_char << (i & 1)
//! byte ^= key
//! ```
//!
//! so encode and decode must walk the bytes in the same order from the same
//! starting key. Only the low eight bits of `key` ever reach the payload.

use super::protocol::{ClientHeader, PacketError, ServerHeader};
use super::reliable::ReliableCommandLog;

pub const CLIENT_HEADER_LEN: usize = ClientHeader::LEN;
pub const SERVER_HEADER_LEN: usize = ServerHeader::LEN;

fn apply_keystream(mut key: u32, keystream: &[u8], data: &mut [u8], start: usize) {
    let mut cursor = 0;
    for (i, byte) in data.iter_mut().enumerate().skip(start) {
        if cursor >= keystream.len() {
            cursor = 0;
        }

        let c = match keystream.get(cursor) {
            Some(b'%') => b'.',
            Some(&c) => c,
            None => 0,
        };
        cursor += 1;

        key ^= u32::from(c) << (i & 1);
        *byte ^= key as u8;
    }
}

/// Client to server. `server_commands` is the client's copy of the server's
/// outgoing command log, indexed by `header.reliable_ack`.
pub fn encode_client_packet(
    challenge: u32,
    header: ClientHeader,
    payload: &[u8],
    server_commands: &ReliableCommandLog,
) -> Vec<u8> {
    let mut data = Vec::with_capacity(CLIENT_HEADER_LEN + payload.len());
    header.write(&mut data);
    data.extend_from_slice(payload);

    let key = challenge ^ header.server_id ^ header.message_ack;
    apply_keystream(
        key,
        server_commands.keystream(header.reliable_ack),
        &mut data,
        CLIENT_HEADER_LEN,
    );
    data
}

/// Server side of [`encode_client_packet`]: decrypts `datagram` in place.
/// `reliable_commands` is the server's outgoing log to this client.
pub fn decode_client_packet(
    challenge: u32,
    datagram: &mut [u8],
    reliable_commands: &ReliableCommandLog,
) -> Result<ClientHeader, PacketError> {
    let header = ClientHeader::read(datagram)?;

    let key = challenge ^ header.server_id ^ header.message_ack;
    apply_keystream(
        key,
        reliable_commands.keystream(header.reliable_ack),
        datagram,
        CLIENT_HEADER_LEN,
    );
    Ok(header)
}

/// Server to client. `client_commands` is the server's copy of this client's
/// outgoing command log, indexed by `header.reliable_ack`.
pub fn encode_server_packet(
    challenge: u32,
    header: ServerHeader,
    payload: &[u8],
    client_commands: &ReliableCommandLog,
) -> Vec<u8> {
    let mut data = Vec::with_capacity(SERVER_HEADER_LEN + payload.len());
    header.write(&mut data);
    data.extend_from_slice(payload);

    let key = challenge ^ header.sequence;
    apply_keystream(
        key,
        client_commands.keystream(header.reliable_ack),
        &mut data,
        SERVER_HEADER_LEN,
    );
    data
}

/// Client side of [`encode_server_packet`]: decrypts `datagram` in place.
/// `reliable_commands` is the client's own outgoing log.
pub fn decode_server_packet(
    challenge: u32,
    datagram: &mut [u8],
    reliable_commands: &ReliableCommandLog,
) -> Result<ServerHeader, PacketError> {
    let header = ServerHeader::read(datagram)?;

    let key = challenge ^ header.sequence;
    apply_keystream(
        key,
        reliable_commands.keystream(header.reliable_ack),
        datagram,
        SERVER_HEADER_LEN,
    );
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with(sequence: u32, text: &str) -> ReliableCommandLog {
        let mut log = ReliableCommandLog::new();
        log.insert(sequence, text);
        log
    }

    #[test]
    fn empty_keystream_scenario() {
        let log = ReliableCommandLog::new();
        let header = ClientHeader::new(1, 0, 0);

        let mut data = encode_client_packet(0x1234, header, &[0xAA, 0xBB], &log);
        assert_eq!(&data[..CLIENT_HEADER_LEN], &[1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        // key = 0x1234 ^ 1, empty keystream leaves it constant
        assert_eq!(&data[CLIENT_HEADER_LEN..], &[0xAA ^ 0x35, 0xBB ^ 0x35]);

        let decoded = decode_client_packet(0x1234, &mut data, &log).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(&data[CLIENT_HEADER_LEN..], &[0xAA, 0xBB]);
    }

    #[test]
    fn key_evolves_per_byte() {
        let log = log_with(5, "ab");
        let header = ServerHeader::new(0, 5);

        let data = encode_server_packet(0, header, &[0, 0, 0], &log);
        // i=8: key ^= 'a' << 0 = 0x61
        // i=9: key ^= 'b' << 1 = 0x61 ^ 0xC4 = 0xA5
        // i=10: wraps to 'a', key ^= 0x61 << 0 = 0xC4
        assert_eq!(&data[SERVER_HEADER_LEN..], &[0x61, 0xA5, 0xC4]);
    }

    #[test]
    fn percent_is_folded_as_dot() {
        let with_percent = log_with(2, "x%y");
        let with_dot = log_with(2, "x.y");
        let header = ClientHeader::new(9, 3, 2);
        let payload = [1u8, 2, 3, 4, 5, 6, 7];

        assert_eq!(
            encode_client_packet(77, header, &payload, &with_percent),
            encode_client_packet(77, header, &payload, &with_dot),
        );
    }

    #[test]
    fn server_round_trip() {
        let log = log_with(12, "userinfo \"\\name\\player\"");
        let header = ServerHeader::new(4000, 12);
        let payload: Vec<u8> = (0..=255).collect();

        let mut data = encode_server_packet(0xDEAD_BEEF, header, &payload, &log);
        assert_ne!(&data[SERVER_HEADER_LEN..], payload.as_slice());

        let decoded = decode_server_packet(0xDEAD_BEEF, &mut data, &log).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(&data[SERVER_HEADER_LEN..], payload.as_slice());
    }

    #[test]
    fn mismatched_logs_garble() {
        let sender = log_with(1, "cs 5 \"mapname\"");
        let receiver = log_with(1, "print \"other\"");
        let header = ClientHeader::new(1, 1, 1);
        let payload = b"the quick brown fox".to_vec();

        let mut data = encode_client_packet(42, header, &payload, &sender);
        decode_client_packet(42, &mut data, &receiver).unwrap();
        assert_ne!(&data[CLIENT_HEADER_LEN..], payload.as_slice());
    }

    #[test]
    fn header_only_datagram() {
        let log = ReliableCommandLog::new();
        let mut data = encode_client_packet(1, ClientHeader::new(2, 3, 4), &[], &log);
        assert_eq!(data.len(), CLIENT_HEADER_LEN);
        assert!(decode_client_packet(1, &mut data, &log).is_ok());
    }

    #[test]
    fn truncated_header_fails() {
        let log = ReliableCommandLog::new();
        let mut data = vec![0u8; 10];
        assert!(decode_server_packet(1, &mut data, &log).is_ok());
        assert!(decode_client_packet(1, &mut data, &log).is_err());
        assert!(decode_server_packet(1, &mut data[..5], &log).is_err());
    }
}
