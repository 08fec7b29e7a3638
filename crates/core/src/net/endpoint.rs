use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use super::channel::DatagramChannel;
use super::protocol::{PacketError, MAX_PACKET_SIZE};
use super::stats::NetworkStats;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Non-blocking UDP socket. Servers use [`NetworkEndpoint::receive_from`];
/// clients set a remote and use it as a [`DatagramChannel`].
pub struct NetworkEndpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
    remote_addr: Option<SocketAddr>,
    stats: NetworkStats,
    recv_buffer: Box<[u8; MAX_PACKET_SIZE]>,
    timeout: Duration,
    last_receive_time: Instant,
}

impl NetworkEndpoint {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;

        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            remote_addr: None,
            stats: NetworkStats::default(),
            recv_buffer: Box::new([0u8; MAX_PACKET_SIZE]),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            last_receive_time: Instant::now(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn set_remote(&mut self, addr: SocketAddr) {
        self.remote_addr = Some(addr);
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if data.len() > MAX_PACKET_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                PacketError::Oversize { len: data.len() },
            ));
        }

        let bytes = self.socket.send_to(data, addr)?;
        self.stats.record_sent(bytes);
        Ok(bytes)
    }

    /// Drains every datagram currently queued on the socket.
    pub fn receive_from(&mut self) -> io::Result<Vec<(Vec<u8>, SocketAddr)>> {
        let mut datagrams = Vec::new();

        loop {
            match self.socket.recv_from(&mut self.recv_buffer[..]) {
                Ok((size, addr)) => {
                    if size < 4 {
                        self.stats.packets_dropped += 1;
                        continue;
                    }

                    self.stats.record_received(size);
                    self.last_receive_time = Instant::now();
                    datagrams.push((self.recv_buffer[..size].to_vec(), addr));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        Ok(datagrams)
    }

    pub fn is_timed_out(&self) -> bool {
        self.last_receive_time.elapsed() > self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn touch(&mut self) {
        self.last_receive_time = Instant::now();
    }
}

impl DatagramChannel for NetworkEndpoint {
    fn transmit(&mut self, data: &[u8]) -> io::Result<()> {
        let addr = self
            .remote_addr
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "No remote address set"))?;
        self.send_to(data, addr).map(|_| ())
    }

    fn receive(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            match self.socket.recv_from(&mut self.recv_buffer[..]) {
                Ok((size, addr)) => {
                    if self.remote_addr.is_some_and(|remote| remote != addr) {
                        log::debug!("ignoring datagram from unexpected peer {}", addr);
                        self.stats.packets_dropped += 1;
                        continue;
                    }

                    self.stats.record_received(size);
                    self.last_receive_time = Instant::now();
                    return Ok(Some(self.recv_buffer[..size].to_vec()));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_loopback_datagram() {
        let mut server = NetworkEndpoint::bind("127.0.0.1:0").unwrap();
        let mut client = NetworkEndpoint::bind("127.0.0.1:0").unwrap();
        client.set_remote(server.local_addr());

        client.transmit(b"getchallenge").unwrap();

        let mut received = Vec::new();
        for _ in 0..200 {
            received = server.receive_from().unwrap();
            if !received.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, b"getchallenge");
        assert_eq!(received[0].1, client.local_addr());
        assert_eq!(client.stats().packets_sent, 1);
    }

    #[test]
    fn oversized_datagram_is_not_sent() {
        let mut client = NetworkEndpoint::bind("127.0.0.1:0").unwrap();
        let target = client.local_addr();

        let err = client
            .send_to(&vec![0u8; MAX_PACKET_SIZE + 1], target)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(matches!(
            err.get_ref().and_then(|e| e.downcast_ref::<PacketError>()),
            Some(PacketError::Oversize { len }) if *len == MAX_PACKET_SIZE + 1
        ));
        assert_eq!(client.stats().packets_sent, 0);
    }
}
