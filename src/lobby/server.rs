//! The global discovery service.
//!
//! Hosts register with `ANNOUNCE_GAME` and withdraw with `REMOVE_GAME`. A listing player
//! sends `REQUEST_GAME_SERVERS` and gets back every registered host; each host is told
//! the requester's address with `ANNOUNCE_PLAYER` so it can open its NAT mapping first.
//!
//! [`DiscoveryServer::handle`] is pure; [`DiscoveryServer::pump`] wires it to a transport.

use std::collections::BTreeMap;
use std::net::SocketAddrV4;
use std::sync::Arc;

use smallvec::smallvec;
use tracing::{debug, trace};
use web_time::{Duration, Instant};

use crate::network::messages::{AddressList, LobbyMessage, MessageKind};
use crate::network::transport::TransportSession;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{report_violation_to, DatagramSocket, NetplayError};

/// Configuration for [`DiscoveryServer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiscoveryServerConfig {
    /// Registrations not refreshed for this long are dropped by
    /// [`prune`](DiscoveryServer::prune).
    ///
    /// Default: 30s (ten missed announcements at the default lobby interval)
    pub expiry: Duration,
}

impl Default for DiscoveryServerConfig {
    fn default() -> Self {
        Self {
            expiry: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Registration {
    game_id: u32,
    last_seen: Instant,
}

/// Registry of hosts advertising a game.
#[derive(Default)]
pub struct DiscoveryServer {
    config: DiscoveryServerConfig,
    hosts: BTreeMap<SocketAddrV4, Registration>,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for DiscoveryServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            config,
            hosts,
            violation_observer,
        } = self;
        f.debug_struct("DiscoveryServer")
            .field("config", config)
            .field("hosts", &hosts.len())
            .field("has_violation_observer", &violation_observer.is_some())
            .finish()
    }
}

impl DiscoveryServer {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(config: DiscoveryServerConfig) -> Self {
        Self {
            config,
            hosts: BTreeMap::new(),
            violation_observer: None,
        }
    }

    /// Routes protocol violations to `observer` instead of the tracing log.
    #[must_use]
    pub fn with_violation_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.violation_observer = Some(observer);
        self
    }

    /// Registered host addresses with their game ids.
    pub fn hosts(&self) -> impl Iterator<Item = (SocketAddrV4, u32)> + '_ {
        self.hosts.iter().map(|(addr, reg)| (*addr, reg.game_id))
    }

    /// Number of registered hosts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// Returns `true` if no host is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Applies one message and returns the packets to send in reply.
    pub fn handle(
        &mut self,
        source: SocketAddrV4,
        message: &LobbyMessage,
        now: Instant,
    ) -> Vec<(SocketAddrV4, LobbyMessage)> {
        match message {
            LobbyMessage::AnnounceGame { game_id } => {
                let previous = self.hosts.insert(
                    source,
                    Registration {
                        game_id: *game_id,
                        last_seen: now,
                    },
                );
                if previous.is_none() {
                    debug!(%source, game_id, "host registered");
                }
                Vec::new()
            },
            LobbyMessage::RemoveGame { game_id } => {
                if self
                    .hosts
                    .get(&source)
                    .is_some_and(|reg| reg.game_id == *game_id)
                {
                    self.hosts.remove(&source);
                    debug!(%source, game_id, "host withdrew");
                }
                Vec::new()
            },
            LobbyMessage::RequestGameServers => {
                let servers: AddressList = self
                    .hosts
                    .keys()
                    .copied()
                    .filter(|host| *host != source)
                    .take(usize::from(u8::MAX))
                    .collect();
                let mut replies = Vec::with_capacity(servers.len() + 1);
                for host in &servers {
                    replies.push((
                        *host,
                        LobbyMessage::AnnouncePlayer {
                            players: smallvec![source],
                        },
                    ));
                }
                trace!(%source, hosts = servers.len(), "server list requested");
                replies.push((source, LobbyMessage::GameServers { servers }));
                replies
            },
            LobbyMessage::Ping {
                reply: false,
                timestamp_ms,
            } => vec![(
                source,
                LobbyMessage::Ping {
                    reply: true,
                    timestamp_ms: *timestamp_ms,
                },
            )],
            other => {
                trace!(%source, command = ?other.command(), "ignoring lobby message");
                Vec::new()
            },
        }
    }

    /// Drops registrations older than the expiry. Returns how many were dropped.
    pub fn prune(&mut self, now: Instant) -> usize {
        let expiry = self.config.expiry;
        let before = self.hosts.len();
        self.hosts
            .retain(|_, reg| now.saturating_duration_since(reg.last_seen) < expiry);
        let dropped = before - self.hosts.len();
        if dropped > 0 {
            debug!(dropped, "expired host registrations");
        }
        dropped
    }

    /// Prunes, then handles every queued datagram and sends the replies.
    /// Returns the number of datagrams handled.
    ///
    /// # Errors
    /// Returns [`NetplayError::SocketError`] on a transport failure.
    pub fn pump<S: DatagramSocket>(
        &mut self,
        transport: &mut TransportSession<S>,
        now: Instant,
    ) -> Result<usize, NetplayError> {
        self.prune(now);
        let mut handled = 0;
        while let Some(datagram) = transport.receive()? {
            handled += 1;
            let decoded = MessageKind::classify(&datagram.payload).and_then(|kind| match kind {
                MessageKind::Lobby => LobbyMessage::decode(&datagram.payload).map(Some),
                MessageKind::Sync | MessageKind::NewGame => Ok(None),
            });
            match decoded {
                Ok(Some(message)) => {
                    for (target, reply) in self.handle(datagram.source, &message, now) {
                        transport.send_to(target, &reply.encode())?;
                    }
                },
                Ok(None) => trace!(source = %datagram.source, "ignoring match traffic"),
                Err(err) => {
                    report_violation_to!(
                        self.violation_observer,
                        ViolationSeverity::Warning,
                        ViolationKind::NetworkProtocol,
                        "dropping packet from {}: {}",
                        datagram.source,
                        err
                    );
                },
            }
        }
        Ok(handled)
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
    use crate::lobby::{LobbyDiscovery, LobbyState};
    use crate::network::memory_socket::MemoryNetwork;
    use crate::sessions::config::LobbyConfig;
    use crate::telemetry::CollectingObserver;
    use crate::{DISCOVERY_PORT, NETPLAY_PORT};
    use std::net::Ipv4Addr;

    fn addr(last: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(172, 16, 0, last), port)
    }

    #[test]
    fn announce_registers_and_remove_withdraws() {
        let mut server = DiscoveryServer::default();
        let now = Instant::now();
        assert!(server
            .handle(addr(1, NETPLAY_PORT), &LobbyMessage::AnnounceGame { game_id: 7 }, now)
            .is_empty());
        assert_eq!(server.hosts().collect::<Vec<_>>(), vec![(addr(1, NETPLAY_PORT), 7)]);

        // a different game id does not withdraw the registration
        server.handle(addr(1, NETPLAY_PORT), &LobbyMessage::RemoveGame { game_id: 8 }, now);
        assert_eq!(server.len(), 1);
        server.handle(addr(1, NETPLAY_PORT), &LobbyMessage::RemoveGame { game_id: 7 }, now);
        assert!(server.is_empty());
    }

    #[test]
    fn server_list_request_notifies_each_host() {
        let mut server = DiscoveryServer::default();
        let now = Instant::now();
        server.handle(addr(1, NETPLAY_PORT), &LobbyMessage::AnnounceGame { game_id: 1 }, now);
        server.handle(addr(2, NETPLAY_PORT), &LobbyMessage::AnnounceGame { game_id: 2 }, now);

        let requester = addr(9, 50_000);
        let replies = server.handle(requester, &LobbyMessage::RequestGameServers, now);
        assert_eq!(replies.len(), 3);
        for host in [addr(1, NETPLAY_PORT), addr(2, NETPLAY_PORT)] {
            assert!(replies.contains(&(
                host,
                LobbyMessage::AnnouncePlayer {
                    players: smallvec![requester],
                }
            )));
        }
        let Some((to, LobbyMessage::GameServers { servers })) = replies.last() else {
            panic!("expected a server list last, got {replies:?}");
        };
        assert_eq!(*to, requester);
        assert_eq!(servers.as_slice(), &[addr(1, NETPLAY_PORT), addr(2, NETPLAY_PORT)]);
    }

    #[test]
    fn stale_registrations_are_pruned() {
        let mut server = DiscoveryServer::new(DiscoveryServerConfig {
            expiry: Duration::from_secs(10),
        });
        let t0 = Instant::now();
        server.handle(addr(1, NETPLAY_PORT), &LobbyMessage::AnnounceGame { game_id: 1 }, t0);
        server.handle(
            addr(2, NETPLAY_PORT),
            &LobbyMessage::AnnounceGame { game_id: 2 },
            t0 + Duration::from_secs(8),
        );
        assert_eq!(server.prune(t0 + Duration::from_secs(12)), 1);
        assert_eq!(server.hosts().map(|(_, id)| id).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn lobby_lists_a_game_through_the_server() {
        let network = MemoryNetwork::new();
        let server_addr = addr(100, DISCOVERY_PORT);
        let host_addr = addr(1, NETPLAY_PORT);
        let guest_addr = addr(2, 40_000);
        let mut server_t = TransportSession::with_socket(network.bind(server_addr));
        let mut host_t = TransportSession::with_socket(network.bind(host_addr));
        let mut guest_t = TransportSession::with_socket(network.bind(guest_addr));

        let config = |name: &str, id: u32| LobbyConfig {
            global_server: Some(server_addr),
            local_discovery: None,
            ..LobbyConfig::new(name).with_unique_id(id)
        };
        let mut server = DiscoveryServer::default();
        let mut host = LobbyDiscovery::new(config("host", 11)).unwrap();
        let mut guest = LobbyDiscovery::new(config("guest", 22)).unwrap();
        host.start();
        host.set_hosting(&mut host_t, true).unwrap();
        guest.start();

        let now = Instant::now();
        let _ = host.poll(&mut host_t, now).unwrap();
        server.pump(&mut server_t, now).unwrap();
        let _ = guest.poll(&mut guest_t, now).unwrap();
        server.pump(&mut server_t, now).unwrap();
        for _ in 0..2 {
            let _ = host.poll(&mut host_t, now).unwrap();
            let _ = guest.poll(&mut guest_t, now).unwrap();
        }

        assert_eq!(guest.state(), LobbyState::Listing);
        let game = guest.games().get(11).unwrap();
        assert_eq!(game.host, host_addr);
        // the host opened its firewall towards the guest
        assert!(network.count_sent(host_addr, guest_addr, 0xFF) >= 2);
    }

    #[test]
    fn garbage_is_reported_and_skipped() {
        let network = MemoryNetwork::new();
        let server_addr = addr(100, DISCOVERY_PORT);
        let mut server_t = TransportSession::with_socket(network.bind(server_addr));
        let observer = Arc::new(CollectingObserver::new());
        let mut server = DiscoveryServer::default().with_violation_observer(observer.clone());

        network.inject(addr(5, 1), server_addr, &[0xFF]);
        network.inject(addr(5, 1), server_addr, &LobbyMessage::AnnounceGame { game_id: 3 }.encode());
        assert_eq!(server.pump(&mut server_t, Instant::now()).unwrap(), 2);
        assert_eq!(server.len(), 1);
        crate::assert_violation!(observer, ViolationKind::NetworkProtocol);
    }
}
