//! The UDP [`DatagramSocket`](crate::DatagramSocket) used outside tests.

use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use web_time::Duration;

use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::DatagramSocket;

const RECV_BUFFER_SIZE: usize = 4096;
/// A packet larger than this may be fragmented, so ideally we wouldn't send packets larger than
/// this.
/// Source: <https://stackoverflow.com/a/35697810/775982>
const IDEAL_MAX_UDP_PACKET_SIZE: usize = 508;

/// A non-blocking IPv4 UDP socket with broadcast enabled. Listens on 0.0.0.0 at a given port.
///
/// [`wait_readable`] briefly switches the socket to blocking mode with a read timeout, so a
/// bounded wait costs no CPU. A datagram read while waiting is kept and handed out by the
/// next [`recv_from`].
///
/// [`wait_readable`]: DatagramSocket::wait_readable
/// [`recv_from`]: DatagramSocket::recv_from
#[derive(Debug)]
pub struct UdpDatagramSocket {
    socket: UdpSocket,
    /// Receive buffer - reused across reads
    recv_buffer: [u8; RECV_BUFFER_SIZE],
    pending: VecDeque<(SocketAddrV4, Vec<u8>)>,
}

impl UdpDatagramSocket {
    /// Binds an UDP socket to 0.0.0.0:port, sets it to non-blocking mode and allows broadcast.
    /// Port 0 lets the OS pick an ephemeral port.
    ///
    /// # Errors
    /// Returns the I/O error if the port is taken or the socket cannot be configured.
    pub fn bind_to_port(port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))?;
        socket.set_nonblocking(true)?;
        socket.set_broadcast(true)?;
        Ok(Self {
            socket,
            recv_buffer: [0; RECV_BUFFER_SIZE],
            pending: VecDeque::new(),
        })
    }

    /// Reads at most one datagram from the OS into `pending`.
    /// Returns `false` if nothing arrived before the socket's current deadline.
    fn read_one(&mut self) -> io::Result<bool> {
        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((len, SocketAddr::V4(source))) => {
                    let payload = self.recv_buffer.get(..len).unwrap_or_default().to_vec();
                    self.pending.push_back((source, payload));
                    return Ok(true);
                },
                Ok((_, SocketAddr::V6(source))) => {
                    report_violation!(
                        ViolationSeverity::Warning,
                        ViolationKind::NetworkProtocol,
                        "Ignoring datagram from IPv6 source {}",
                        source
                    );
                },
                Err(ref err)
                    if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    return Ok(false)
                },
                // ICMP unreachable from an earlier send_to, reported on some platforms
                Err(ref err)
                    if matches!(
                        err.kind(),
                        ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused
                    ) => {},
                Err(err) => return Err(err),
            }
        }
    }
}

impl DatagramSocket for UdpDatagramSocket {
    fn send_to(&mut self, payload: &[u8], addr: SocketAddrV4) -> io::Result<()> {
        // Oversized packets risk fragmentation; the usual cause is a large input budget.
        if payload.len() > IDEAL_MAX_UDP_PACKET_SIZE {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "Sending UDP packet of size {} bytes, which is larger than ideal ({})",
                payload.len(),
                IDEAL_MAX_UDP_PACKET_SIZE
            );
        }
        self.socket.send_to(payload, addr).map(|_| ())
    }

    fn recv_from(&mut self) -> io::Result<Option<(SocketAddrV4, Vec<u8>)>> {
        if self.pending.is_empty() {
            self.read_one()?;
        }
        Ok(self.pending.pop_front())
    }

    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        if !self.pending.is_empty() {
            return Ok(true);
        }
        if timeout.is_zero() {
            return self.read_one();
        }
        self.socket.set_nonblocking(false)?;
        self.socket.set_read_timeout(Some(timeout))?;
        let result = self.read_one();
        self.socket.set_nonblocking(true)?;
        result
    }

    fn local_addr(&self) -> io::Result<SocketAddrV4> {
        match self.socket.local_addr()? {
            SocketAddr::V4(addr) => Ok(addr),
            SocketAddr::V6(addr) => Err(io::Error::new(
                ErrorKind::Unsupported,
                format!("socket bound to IPv6 address {addr}"),
            )),
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use web_time::Instant;

    // Sockets bind to 0.0.0.0:port, but sending to 0.0.0.0 is not portable.
    #[cfg(not(miri))]
    #[track_caller]
    fn loopback(socket: &UdpDatagramSocket) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, socket.local_addr().unwrap().port())
    }

    #[test]
    #[cfg(not(miri))] // Miri cannot execute foreign functions like socket()
    fn test_udp_socket_bind_to_ephemeral_port() {
        let socket = UdpDatagramSocket::bind_to_port(0).unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }

    #[test]
    #[cfg(not(miri))]
    fn test_udp_socket_recv_is_non_blocking() {
        let mut socket = UdpDatagramSocket::bind_to_port(0).unwrap();
        assert!(socket.recv_from().unwrap().is_none());
    }

    #[test]
    #[cfg(not(miri))]
    fn test_wait_readable_times_out() {
        let mut socket = UdpDatagramSocket::bind_to_port(0).unwrap();
        let start = Instant::now();
        assert!(!socket.wait_readable(Duration::from_millis(30)).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(20));
        // still non-blocking afterwards
        assert!(socket.recv_from().unwrap().is_none());
    }

    #[test]
    #[cfg(not(miri))]
    fn test_send_wait_and_receive() {
        let mut sender = UdpDatagramSocket::bind_to_port(0).unwrap();
        let mut receiver = UdpDatagramSocket::bind_to_port(0).unwrap();
        let target = loopback(&receiver);

        sender.send_to(&[0xFF, 7], target).unwrap();
        assert!(receiver.wait_readable(Duration::from_secs(2)).unwrap());
        // the datagram read by the wait is not lost
        let (source, payload) = receiver.recv_from().unwrap().unwrap();
        assert_eq!(payload, vec![0xFF, 7]);
        assert_eq!(source.port(), sender.local_addr().unwrap().port());
    }

    #[test]
    #[cfg(not(miri))]
    fn test_multiple_datagrams_keep_their_boundaries() {
        let mut sender = UdpDatagramSocket::bind_to_port(0).unwrap();
        let mut receiver = UdpDatagramSocket::bind_to_port(0).unwrap();
        let target = loopback(&receiver);

        sender.send_to(&[1], target).unwrap();
        sender.send_to(&[2, 2], target).unwrap();

        let mut received = Vec::new();
        while received.len() < 2 && receiver.wait_readable(Duration::from_secs(2)).unwrap() {
            while let Some((_, payload)) = receiver.recv_from().unwrap() {
                received.push(payload);
            }
        }
        assert_eq!(received, vec![vec![1], vec![2, 2]]);
    }

    #[test]
    fn test_ideal_max_udp_packet_size_constant() {
        assert_eq!(IDEAL_MAX_UDP_PACKET_SIZE, 508);
        const _: () = assert!(RECV_BUFFER_SIZE > IDEAL_MAX_UDP_PACKET_SIZE);
    }
}
