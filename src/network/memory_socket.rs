//! In-process datagram network for unit tests.
//!
//! Every [`MemorySocket`] bound on a [`MemoryNetwork`] gets an inbox. Sends to an unbound
//! address vanish like UDP would, sends to `255.255.255.255:port` reach every other socket
//! on that port, and drop rules let a test lose specific packets deterministically.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use web_time::{Duration, Instant};

use crate::DatagramSocket;

type Datagram = (SocketAddrV4, Vec<u8>);

#[derive(Debug)]
struct DropRule {
    from: SocketAddrV4,
    to: SocketAddrV4,
    remaining: usize,
}

#[derive(Debug, Default)]
struct NetworkState {
    inboxes: BTreeMap<SocketAddrV4, VecDeque<Datagram>>,
    drop_rules: Vec<DropRule>,
    log: Vec<(SocketAddrV4, SocketAddrV4, Vec<u8>)>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<NetworkState>,
    arrived: Condvar,
}

/// A shared in-memory network.
#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryNetwork {
    shared: Arc<Shared>,
}

impl MemoryNetwork {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Creates a socket reachable at `addr`.
    pub(crate) fn bind(&self, addr: SocketAddrV4) -> MemorySocket {
        self.shared.state.lock().inboxes.entry(addr).or_default();
        MemorySocket {
            addr,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Silently drops the next `count` datagrams sent from `from` to `to`.
    pub(crate) fn drop_next(&self, from: SocketAddrV4, to: SocketAddrV4, count: usize) {
        self.shared.state.lock().drop_rules.push(DropRule {
            from,
            to,
            remaining: count,
        });
    }

    /// Injects a datagram as if `from` had sent it.
    pub(crate) fn inject(&self, from: SocketAddrV4, to: SocketAddrV4, payload: &[u8]) {
        let mut state = self.shared.state.lock();
        if let Some(inbox) = state.inboxes.get_mut(&to) {
            inbox.push_back((from, payload.to_vec()));
        }
        self.shared.arrived.notify_all();
    }

    /// Every datagram handed to the network so far, dropped ones included.
    pub(crate) fn sent_log(&self) -> Vec<(SocketAddrV4, SocketAddrV4, Vec<u8>)> {
        self.shared.state.lock().log.clone()
    }

    /// Number of datagrams `from` sent to `to` whose first byte is `tag`.
    pub(crate) fn count_sent(&self, from: SocketAddrV4, to: SocketAddrV4, tag: u8) -> usize {
        self.shared
            .state
            .lock()
            .log
            .iter()
            .filter(|(f, t, p)| *f == from && *t == to && p.first() == Some(&tag))
            .count()
    }
}

/// One endpoint on a [`MemoryNetwork`].
#[derive(Debug)]
pub(crate) struct MemorySocket {
    addr: SocketAddrV4,
    shared: Arc<Shared>,
}

impl DatagramSocket for MemorySocket {
    fn send_to(&mut self, payload: &[u8], to: SocketAddrV4) -> io::Result<()> {
        let mut state = self.shared.state.lock();
        state.log.push((self.addr, to, payload.to_vec()));

        let from = self.addr;
        if let Some(rule) = state
            .drop_rules
            .iter_mut()
            .find(|r| r.from == from && r.to == to && r.remaining > 0)
        {
            rule.remaining -= 1;
            return Ok(());
        }

        if *to.ip() == Ipv4Addr::BROADCAST {
            for (addr, inbox) in &mut state.inboxes {
                if addr.port() == to.port() && *addr != from {
                    inbox.push_back((from, payload.to_vec()));
                }
            }
        } else if let Some(inbox) = state.inboxes.get_mut(&to) {
            inbox.push_back((from, payload.to_vec()));
        }
        self.shared.arrived.notify_all();
        Ok(())
    }

    fn recv_from(&mut self) -> io::Result<Option<Datagram>> {
        Ok(self
            .shared
            .state
            .lock()
            .inboxes
            .get_mut(&self.addr)
            .and_then(VecDeque::pop_front))
    }

    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if state
                .inboxes
                .get(&self.addr)
                .is_some_and(|inbox| !inbox.is_empty())
            {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            self.shared.arrived.wait_for(&mut state, deadline - now);
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddrV4> {
        Ok(self.addr)
    }
}

impl Drop for MemorySocket {
    fn drop(&mut self) {
        self.shared.state.lock().inboxes.remove(&self.addr);
    }
}
