//! Fuzz target for the discovery server.
//!
//! Feeds arbitrary datagrams from a handful of sources, with arbitrary clock steps,
//! and checks that a host never holds more than one registration.

#![no_main]

use arbitrary::Arbitrary;
use fortress_lockstep::{DiscoveryServer, LobbyMessage};
use libfuzzer_sys::fuzz_target;
use std::net::{Ipv4Addr, SocketAddrV4};
use web_time::{Duration, Instant};

#[derive(Debug, Arbitrary)]
struct Request {
    source: u8,
    advance_secs: u8,
    payload: Vec<u8>,
}

fuzz_target!(|requests: Vec<Request>| {
    let mut server = DiscoveryServer::default();
    let mut now = Instant::now();

    for request in requests {
        now += Duration::from_secs(u64::from(request.advance_secs % 40));
        let source = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, request.source % 8), 44_046);
        server.prune(now);
        if let Ok(message) = LobbyMessage::decode(&request.payload) {
            for (target, _) in server.handle(source, &message, now) {
                // replies only ever go to addresses that talked to us
                assert!(target.ip().octets()[3] < 8);
            }
        }
        assert!(server.len() <= 8);
    }
});
