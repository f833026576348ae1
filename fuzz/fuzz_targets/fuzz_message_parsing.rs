//! Fuzz target for datagram decoding.
//!
//! Arbitrary bytes must never panic a decoder. Sync and start packets that do decode
//! must survive a re-encode unchanged.

#![no_main]

use fortress_lockstep::{LobbyMessage, Message, MessageKind, StartPacket, SyncPacket};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = MessageKind::classify(data);
    let _ = SyncPacket::decode(data);
    let _ = StartPacket::decode(data);
    let _ = LobbyMessage::decode(data);

    match Message::decode(data) {
        Ok(Message::Sync(packet)) => {
            assert_eq!(SyncPacket::decode(&packet.encode()), Ok(packet));
        },
        Ok(Message::Start(packet)) => {
            assert_eq!(StartPacket::decode(&packet.encode()), Ok(packet));
        },
        Ok(Message::Lobby(message)) => {
            // names are decoded lossily, so only check the re-encode decodes
            assert!(LobbyMessage::decode(&message.encode()).is_ok());
        },
        Err(_) => {},
    }
});
