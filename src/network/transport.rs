//! One datagram endpoint with per-peer channels.
//!
//! A [`TransportSession`] owns the socket for the whole lobby → handshake → lockstep flow.
//! Peers are bound to channels by player index so the protocol layers can address them by
//! slot and learn which slot a datagram came from.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddrV4};

use tracing::trace;
use web_time::Duration;

use crate::network::udp_socket::UdpDatagramSocket;
use crate::sessions::roster::Roster;
use crate::{DatagramSocket, NetplayError, PlayerIndex, MAX_PLAYERS, NETPLAY_PORT};

/// Where an outgoing datagram goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// The peer bound to this slot.
    Peer(PlayerIndex),
    /// The broadcast target (local discovery).
    Broadcast,
}

/// A received datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Who sent it.
    pub source: SocketAddrV4,
    /// The slot bound to `source`, if any.
    pub channel: Option<PlayerIndex>,
    /// Raw bytes, type byte first.
    pub payload: Vec<u8>,
}

/// A datagram endpoint with [`MAX_PLAYERS`] peer channels and a broadcast channel.
///
/// Every failure of the underlying socket is returned as [`NetplayError::SocketError`].
#[derive(Debug)]
pub struct TransportSession<S: DatagramSocket = UdpDatagramSocket> {
    socket: S,
    channels: [Option<SocketAddrV4>; MAX_PLAYERS],
    broadcast_target: SocketAddrV4,
    requeued: VecDeque<Datagram>,
}

impl TransportSession<UdpDatagramSocket> {
    /// Opens a UDP endpoint on `port` (0 for ephemeral).
    ///
    /// # Errors
    /// Returns [`NetplayError::SocketError`] if the socket cannot be created or bound.
    pub fn open(port: u16) -> Result<Self, NetplayError> {
        let socket = UdpDatagramSocket::bind_to_port(port)
            .map_err(|err| NetplayError::socket(&format!("bind 0.0.0.0:{port}"), &err))?;
        Ok(Self::with_socket(socket))
    }

    /// Opens the well-known endpoint a hosting peer uses.
    ///
    /// # Errors
    /// Returns [`NetplayError::SocketError`] if [`NETPLAY_PORT`] is unavailable.
    pub fn open_hosting() -> Result<Self, NetplayError> {
        Self::open(NETPLAY_PORT)
    }

    /// Opens an endpoint on an OS-assigned port, as a joining peer does.
    ///
    /// # Errors
    /// Returns [`NetplayError::SocketError`] if the socket cannot be created.
    pub fn open_ephemeral() -> Result<Self, NetplayError> {
        Self::open(0)
    }
}

impl<S: DatagramSocket> TransportSession<S> {
    /// Wraps an existing socket. No channel is bound; broadcast goes to
    /// `255.255.255.255:NETPLAY_PORT`.
    pub fn with_socket(socket: S) -> Self {
        Self {
            socket,
            channels: [None; MAX_PLAYERS],
            broadcast_target: SocketAddrV4::new(Ipv4Addr::BROADCAST, NETPLAY_PORT),
            requeued: VecDeque::new(),
        }
    }

    /// Binds slot `index` to `addr`, replacing any previous binding.
    ///
    /// # Errors
    /// Returns [`NetplayError::InvalidRequest`] if `index` is out of range.
    pub fn bind_channel(&mut self, index: PlayerIndex, addr: SocketAddrV4) -> Result<(), NetplayError> {
        let slot = self
            .channels
            .get_mut(index.as_usize())
            .ok_or_else(|| NetplayError::invalid(format!("player index {index} out of range")))?;
        *slot = Some(addr);
        Ok(())
    }

    /// Binds every present remote slot of `roster` and clears the others.
    pub fn bind_roster(&mut self, roster: &Roster) {
        self.channels = [None; MAX_PLAYERS];
        for (index, addr) in roster.peers() {
            if let Some(slot) = self.channels.get_mut(index.as_usize()) {
                *slot = Some(addr);
            }
        }
    }

    /// Clears every channel binding.
    pub fn unbind_all(&mut self) {
        self.channels = [None; MAX_PLAYERS];
    }

    /// The address bound to `index`.
    #[must_use]
    pub fn peer_address(&self, index: PlayerIndex) -> Option<SocketAddrV4> {
        self.channels.get(index.as_usize()).copied().flatten()
    }

    /// The slot bound to `addr`, matched by host and port.
    #[must_use]
    pub fn channel_of(&self, addr: SocketAddrV4) -> Option<PlayerIndex> {
        self.channels
            .iter()
            .position(|bound| *bound == Some(addr))
            .map(PlayerIndex::new)
    }

    /// Changes where [`Channel::Broadcast`] sends go.
    pub fn set_broadcast_target(&mut self, target: SocketAddrV4) {
        self.broadcast_target = target;
    }

    /// Sends `payload` on a channel. An unbound peer channel is an invalid request.
    ///
    /// # Errors
    /// Returns [`NetplayError::SocketError`] if the socket rejects the datagram.
    pub fn send(&mut self, channel: Channel, payload: &[u8]) -> Result<(), NetplayError> {
        let target = match channel {
            Channel::Peer(index) => self.peer_address(index).ok_or_else(|| {
                NetplayError::invalid(format!("no peer bound to channel {index}"))
            })?,
            Channel::Broadcast => self.broadcast_target,
        };
        self.send_to(target, payload)
    }

    /// Sends `payload` to an address that need not be bound.
    ///
    /// # Errors
    /// Returns [`NetplayError::SocketError`] if the socket rejects the datagram.
    pub fn send_to(&mut self, target: SocketAddrV4, payload: &[u8]) -> Result<(), NetplayError> {
        trace!(%target, len = payload.len(), "send");
        self.socket
            .send_to(payload, target)
            .map_err(|err| NetplayError::socket(&format!("send to {target}"), &err))
    }

    /// Blocks up to `timeout` until a datagram can be received. Returns `false` on timeout.
    ///
    /// # Errors
    /// Returns [`NetplayError::SocketError`] on a socket failure.
    pub fn poll(&mut self, timeout: Duration) -> Result<bool, NetplayError> {
        if !self.requeued.is_empty() {
            return Ok(true);
        }
        self.socket
            .wait_readable(timeout)
            .map_err(|err| NetplayError::socket("poll", &err))
    }

    /// Returns the next datagram without blocking.
    ///
    /// # Errors
    /// Returns [`NetplayError::SocketError`] on a socket failure.
    pub fn receive(&mut self) -> Result<Option<Datagram>, NetplayError> {
        if let Some(datagram) = self.requeued.pop_front() {
            return Ok(Some(datagram));
        }
        let received = self
            .socket
            .recv_from()
            .map_err(|err| NetplayError::socket("receive", &err))?;
        Ok(received.map(|(source, payload)| {
            trace!(%source, len = payload.len(), "receive");
            Datagram {
                source,
                channel: self.channel_of(source),
                payload,
            }
        }))
    }

    /// Hands a datagram back so the next [`receive`](Self::receive) returns it first.
    ///
    /// The channel is looked up against the bindings as they are now. If they change
    /// before the datagram is received, call `refresh_requeued_channels`.
    pub fn requeue(&mut self, mut datagram: Datagram) {
        datagram.channel = self.channel_of(datagram.source);
        self.requeued.push_front(datagram);
    }

    /// Re-tags requeued datagrams after the bindings changed.
    pub(crate) fn refresh_requeued_channels(&mut self) {
        let channels = self.channels;
        for datagram in &mut self.requeued {
            datagram.channel = channels
                .iter()
                .position(|bound| *bound == Some(datagram.source))
                .map(PlayerIndex::new);
        }
    }

    /// The local endpoint address.
    ///
    /// # Errors
    /// Returns [`NetplayError::SocketError`] if the socket cannot report it.
    pub fn local_addr(&self) -> Result<SocketAddrV4, NetplayError> {
        self.socket
            .local_addr()
            .map_err(|err| NetplayError::socket("local address", &err))
    }

    /// The wrapped socket.
    pub fn socket(&self) -> &S {
        &self.socket
    }

    /// The wrapped socket, mutably.
    pub fn socket_mut(&mut self) -> &mut S {
        &mut self.socket
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
    use crate::network::memory_socket::{MemoryNetwork, MemorySocket};

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    fn transport(network: &MemoryNetwork, port: u16) -> TransportSession<MemorySocket> {
        TransportSession::with_socket(network.bind(addr(port)))
    }

    #[test]
    fn test_send_on_bound_channel_tags_source() {
        let network = MemoryNetwork::new();
        let mut host = transport(&network, 1);
        let mut client = transport(&network, 2);
        host.bind_channel(PlayerIndex::new(1), addr(2)).unwrap();
        client.bind_channel(PlayerIndex::HOST, addr(1)).unwrap();

        host.send(Channel::Peer(PlayerIndex::new(1)), &[0x00, 1]).unwrap();
        assert!(client.poll(Duration::from_millis(10)).unwrap());
        let datagram = client.receive().unwrap().unwrap();
        assert_eq!(datagram.source, addr(1));
        assert_eq!(datagram.channel, Some(PlayerIndex::HOST));
        assert_eq!(datagram.payload, vec![0x00, 1]);
    }

    #[test]
    fn test_unbound_source_has_no_channel() {
        let network = MemoryNetwork::new();
        let mut stranger = transport(&network, 9);
        let mut host = transport(&network, 1);
        stranger.send_to(addr(1), &[0xFF, 4]).unwrap();
        assert_eq!(host.receive().unwrap().unwrap().channel, None);
    }

    #[test]
    fn test_send_on_unbound_channel_is_invalid() {
        let network = MemoryNetwork::new();
        let mut host = transport(&network, 1);
        let err = host
            .send(Channel::Peer(PlayerIndex::new(2)), &[0])
            .unwrap_err();
        assert!(matches!(err, NetplayError::InvalidRequest { .. }));
    }

    #[test]
    fn test_bind_channel_rejects_out_of_range() {
        let network = MemoryNetwork::new();
        let mut host = transport(&network, 1);
        assert!(host
            .bind_channel(PlayerIndex::new(MAX_PLAYERS), addr(2))
            .is_err());
    }

    #[test]
    fn test_requeue_is_received_first() {
        let network = MemoryNetwork::new();
        let mut host = transport(&network, 1);
        let mut client = transport(&network, 2);
        client.send_to(addr(1), &[0x00]).unwrap();
        host.requeue(Datagram {
            source: addr(2),
            channel: None,
            payload: vec![0x01],
        });
        host.bind_channel(PlayerIndex::new(1), addr(2)).unwrap();
        host.refresh_requeued_channels();

        assert!(host.poll(Duration::ZERO).unwrap());
        let first = host.receive().unwrap().unwrap();
        assert_eq!(first.payload, vec![0x01]);
        assert_eq!(first.channel, Some(PlayerIndex::new(1)));
        assert_eq!(host.receive().unwrap().unwrap().payload, vec![0x00]);
        assert!(host.receive().unwrap().is_none());
    }

    #[test]
    fn test_broadcast_reaches_every_socket_on_the_port() {
        let network = MemoryNetwork::new();
        let mut lister = transport(&network, 5);
        let mut host_a = TransportSession::with_socket(
            network.bind(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), NETPLAY_PORT)),
        );
        let mut host_b = TransportSession::with_socket(
            network.bind(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), NETPLAY_PORT)),
        );
        lister.send(Channel::Broadcast, &[0xFF, 4]).unwrap();
        assert!(host_a.receive().unwrap().is_some());
        assert!(host_b.receive().unwrap().is_some());
    }

    #[test]
    fn test_poll_times_out_without_traffic() {
        let network = MemoryNetwork::new();
        let mut host = transport(&network, 1);
        assert!(!host.poll(Duration::from_millis(5)).unwrap());
    }
}
