//! Typed encode/decode of the three packet families.
//!
//! | Family | Byte 0      | Layout |
//! |--------|-------------|--------|
//! | Sync   | `0x00`      | `frame(4) seed(4) (op, keycode)*` |
//! | Start  | `0x01`      | `sender(1) turbo(1) wave(4) lives(4) seed(4)` |
//! | Lobby  | `0xFF`      | `command(1) payload` |

use std::net::{Ipv4Addr, SocketAddrV4};

use smallvec::SmallVec;

use crate::frame_buffer::InputRecord;
use crate::lobby::snapshot::GameInfoSnapshot;
use crate::network::codec::{CodecError, CodecResult, PacketReader, PacketWriter};
use crate::sessions::game_start::{GameParams, MatchRules};
use crate::{Frame, PlayerIndex, PLAYER_NAME_LEN};

/// Type byte of a lockstep sync packet.
pub const SYNC_MSG: u8 = 0x00;
/// Type byte of a game-start packet.
pub const NEW_GAME: u8 = 0x01;
/// Type byte of every lobby packet.
pub const LOBBY_MSG: u8 = 0xFF;

/// Bytes before the first input record of a sync packet.
pub const SYNC_HEADER_LEN: usize = 9;
/// Exact size of a start packet.
pub const START_PACKET_LEN: usize = 15;
/// High bit of the start packet's lives field: the rest is a death-match count.
const DEATH_MATCH_FLAG: u32 = 0x8000_0000;

/// Addresses carried by `GAME_SERVERS` and `ANNOUNCE_PLAYER`.
pub type AddressList = SmallVec<[SocketAddrV4; 4]>;

/// Packet family, read from the first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Lockstep frame payload.
    Sync,
    /// Game-start handshake.
    NewGame,
    /// Lobby and discovery traffic.
    Lobby,
}

impl MessageKind {
    /// Classifies a datagram without decoding it.
    ///
    /// # Errors
    /// Fails on an empty datagram or an unknown type byte.
    pub fn classify(bytes: &[u8]) -> CodecResult<Self> {
        match bytes.first().copied() {
            Some(SYNC_MSG) => Ok(Self::Sync),
            Some(NEW_GAME) => Ok(Self::NewGame),
            Some(LOBBY_MSG) => Ok(Self::Lobby),
            Some(tag) => Err(CodecError::UnknownMessageType { tag }),
            None => Err(CodecError::UnexpectedEnd {
                needed: 1,
                remaining: 0,
            }),
        }
    }
}

/// One peer's input for one frame, stamped with its frame number and seed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncPacket {
    /// Frame the input belongs to.
    pub frame: Frame,
    /// The sender's shared generator state for that frame.
    pub seed: u32,
    /// Input records in the order they were queued.
    pub records: SmallVec<[InputRecord; 16]>,
}

impl SyncPacket {
    /// Encodes the packet.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = PacketWriter::with_capacity(SYNC_HEADER_LEN + self.records.len() * 2);
        writer
            .put_u8(SYNC_MSG)
            .put_u32(self.frame.as_u32())
            .put_u32(self.seed);
        for record in &self.records {
            writer.put_u8(record.op).put_u8(record.keycode);
        }
        writer.into_bytes()
    }

    /// Decodes a sync packet, type byte included.
    ///
    /// # Errors
    /// Fails on a wrong type byte, a short header, or an odd-length record section.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let mut reader = PacketReader::new(bytes);
        expect_tag(&mut reader, SYNC_MSG)?;
        let frame = Frame::new(reader.read_u32()?);
        let seed = reader.read_u32()?;
        let rest = reader.read_rest();
        if rest.len() % 2 != 0 {
            return Err(CodecError::TrailingBytes { count: 1 });
        }
        let records = rest
            .chunks_exact(2)
            .map(|pair| InputRecord::new(pair[0], pair[1]))
            .collect();
        Ok(Self {
            frame,
            seed,
            records,
        })
    }
}

/// The game-start packet. The host sends it with sender 0; each client echoes it back
/// with its own index as the ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StartPacket {
    /// The slot the sender claims.
    pub sender: PlayerIndex,
    /// Match parameters chosen by the host.
    pub params: GameParams,
    /// Initial state of the shared generator.
    pub seed: u32,
}

impl StartPacket {
    /// Encodes the packet.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let lives = match self.params.rules {
            MatchRules::Lives(lives) => lives & !DEATH_MATCH_FLAG,
            MatchRules::DeathMatch(players) => DEATH_MATCH_FLAG | (players & !DEATH_MATCH_FLAG),
        };
        let mut writer = PacketWriter::with_capacity(START_PACKET_LEN);
        writer
            .put_u8(NEW_GAME)
            .put_u8(self.sender.as_usize() as u8)
            .put_u8(u8::from(self.params.turbo))
            .put_u32(self.params.wave)
            .put_u32(lives)
            .put_u32(self.seed);
        writer.into_bytes()
    }

    /// Decodes a start packet, type byte included.
    ///
    /// # Errors
    /// Fails on a wrong type byte, a wrong length, or an out-of-range sender index.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let mut reader = PacketReader::new(bytes);
        expect_tag(&mut reader, NEW_GAME)?;
        let sender = PlayerIndex::new(reader.read_u8()? as usize);
        if !sender.is_valid() {
            return Err(CodecError::InvalidField {
                field: "sender",
                value: sender.as_usize() as u32,
            });
        }
        let turbo = reader.read_u8()? != 0;
        let wave = reader.read_u32()?;
        let lives = reader.read_u32()?;
        let seed = reader.read_u32()?;
        reader.finish()?;

        let rules = if lives & DEATH_MATCH_FLAG != 0 {
            MatchRules::DeathMatch(lives & !DEATH_MATCH_FLAG)
        } else {
            MatchRules::Lives(lives)
        };
        Ok(Self {
            sender,
            params: GameParams { wave, turbo, rules },
            seed,
        })
    }
}

/// Lobby sub-command byte, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LobbyCommand {
    /// Host advertises its game to the discovery server.
    AnnounceGame = 0,
    /// Host withdraws its game.
    RemoveGame = 1,
    /// Ask the discovery server for hosts.
    RequestGameServers = 2,
    /// Discovery server's host list.
    GameServers = 3,
    /// Ask a host for its snapshot.
    RequestGameInfo = 4,
    /// A host's snapshot.
    GameInfo = 5,
    /// Discovery server tells a host who is about to contact it.
    AnnouncePlayer = 6,
    /// Courtesy packet that opens a NAT mapping toward the receiver.
    OpenFirewall = 7,
    /// Ask to join (or stay in) a game.
    RequestJoin = 8,
    /// Leave a game.
    RequestLeave = 9,
    /// Round-trip probe.
    Ping = 10,
}

impl LobbyCommand {
    /// Maps a wire byte back to a command.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::AnnounceGame,
            1 => Self::RemoveGame,
            2 => Self::RequestGameServers,
            3 => Self::GameServers,
            4 => Self::RequestGameInfo,
            5 => Self::GameInfo,
            6 => Self::AnnouncePlayer,
            7 => Self::OpenFirewall,
            8 => Self::RequestJoin,
            9 => Self::RequestLeave,
            10 => Self::Ping,
            _ => return None,
        })
    }
}

/// A decoded lobby packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LobbyMessage {
    /// See [`LobbyCommand::AnnounceGame`].
    AnnounceGame {
        /// The advertised game.
        game_id: u32,
    },
    /// See [`LobbyCommand::RemoveGame`].
    RemoveGame {
        /// The withdrawn game.
        game_id: u32,
    },
    /// See [`LobbyCommand::RequestGameServers`].
    RequestGameServers,
    /// See [`LobbyCommand::GameServers`].
    GameServers {
        /// Registered hosts.
        servers: AddressList,
    },
    /// See [`LobbyCommand::RequestGameInfo`].
    RequestGameInfo,
    /// See [`LobbyCommand::GameInfo`].
    GameInfo(GameInfoSnapshot),
    /// See [`LobbyCommand::AnnouncePlayer`].
    AnnouncePlayer {
        /// Players about to contact the host.
        players: AddressList,
    },
    /// See [`LobbyCommand::OpenFirewall`].
    OpenFirewall,
    /// See [`LobbyCommand::RequestJoin`].
    RequestJoin {
        /// The game to join.
        game_id: u32,
        /// The joiner's unique id.
        player_id: u32,
        /// The joiner's display name.
        name: String,
    },
    /// See [`LobbyCommand::RequestLeave`].
    RequestLeave {
        /// The game to leave.
        game_id: u32,
        /// The leaver's unique id.
        player_id: u32,
    },
    /// See [`LobbyCommand::Ping`].
    Ping {
        /// `false` for a probe, `true` for the echo.
        reply: bool,
        /// Sender-relative milliseconds, echoed unchanged.
        timestamp_ms: u32,
    },
}

impl LobbyMessage {
    /// The sub-command byte of this message.
    #[must_use]
    pub const fn command(&self) -> LobbyCommand {
        match self {
            Self::AnnounceGame { .. } => LobbyCommand::AnnounceGame,
            Self::RemoveGame { .. } => LobbyCommand::RemoveGame,
            Self::RequestGameServers => LobbyCommand::RequestGameServers,
            Self::GameServers { .. } => LobbyCommand::GameServers,
            Self::RequestGameInfo => LobbyCommand::RequestGameInfo,
            Self::GameInfo(_) => LobbyCommand::GameInfo,
            Self::AnnouncePlayer { .. } => LobbyCommand::AnnouncePlayer,
            Self::OpenFirewall => LobbyCommand::OpenFirewall,
            Self::RequestJoin { .. } => LobbyCommand::RequestJoin,
            Self::RequestLeave { .. } => LobbyCommand::RequestLeave,
            Self::Ping { .. } => LobbyCommand::Ping,
        }
    }

    /// Encodes the packet.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = PacketWriter::new();
        writer.put_u8(LOBBY_MSG).put_u8(self.command() as u8);
        match self {
            Self::AnnounceGame { game_id } | Self::RemoveGame { game_id } => {
                writer.put_u32(*game_id);
            },
            Self::RequestGameServers | Self::RequestGameInfo | Self::OpenFirewall => {},
            Self::GameServers { servers: list } | Self::AnnouncePlayer { players: list } => {
                put_address_list(&mut writer, list);
            },
            Self::GameInfo(snapshot) => snapshot.encode_into(&mut writer),
            Self::RequestJoin {
                game_id,
                player_id,
                name,
            } => {
                writer
                    .put_u32(*game_id)
                    .put_u32(*player_id)
                    .put_fixed(name.as_bytes(), PLAYER_NAME_LEN);
            },
            Self::RequestLeave { game_id, player_id } => {
                writer.put_u32(*game_id).put_u32(*player_id);
            },
            Self::Ping {
                reply,
                timestamp_ms,
            } => {
                writer.put_u8(u8::from(*reply)).put_u32(*timestamp_ms);
            },
        }
        writer.into_bytes()
    }

    /// Decodes a lobby packet, type byte included.
    ///
    /// # Errors
    /// Fails on a wrong type byte, an unknown sub-command, or a short payload.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let mut reader = PacketReader::new(bytes);
        expect_tag(&mut reader, LOBBY_MSG)?;
        let raw = reader.read_u8()?;
        let command = LobbyCommand::from_u8(raw).ok_or(CodecError::InvalidField {
            field: "lobby command",
            value: u32::from(raw),
        })?;
        let message = match command {
            LobbyCommand::AnnounceGame => Self::AnnounceGame {
                game_id: reader.read_u32()?,
            },
            LobbyCommand::RemoveGame => Self::RemoveGame {
                game_id: reader.read_u32()?,
            },
            LobbyCommand::RequestGameServers => Self::RequestGameServers,
            LobbyCommand::GameServers => Self::GameServers {
                servers: read_address_list(&mut reader)?,
            },
            LobbyCommand::RequestGameInfo => Self::RequestGameInfo,
            LobbyCommand::GameInfo => Self::GameInfo(GameInfoSnapshot::decode_from(&mut reader)?),
            LobbyCommand::AnnouncePlayer => Self::AnnouncePlayer {
                players: read_address_list(&mut reader)?,
            },
            LobbyCommand::OpenFirewall => Self::OpenFirewall,
            LobbyCommand::RequestJoin => Self::RequestJoin {
                game_id: reader.read_u32()?,
                player_id: reader.read_u32()?,
                name: read_name(&mut reader)?,
            },
            LobbyCommand::RequestLeave => Self::RequestLeave {
                game_id: reader.read_u32()?,
                player_id: reader.read_u32()?,
            },
            LobbyCommand::Ping => Self::Ping {
                reply: reader.read_u8()? != 0,
                timestamp_ms: reader.read_u32()?,
            },
        };
        Ok(message)
    }
}

/// Any packet this crate understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A lockstep frame payload.
    Sync(SyncPacket),
    /// A start packet or its ack.
    Start(StartPacket),
    /// A lobby packet.
    Lobby(LobbyMessage),
}

impl Message {
    /// Classifies and decodes a datagram.
    ///
    /// # Errors
    /// Propagates the decode error of the matching family.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        Ok(match MessageKind::classify(bytes)? {
            MessageKind::Sync => Self::Sync(SyncPacket::decode(bytes)?),
            MessageKind::NewGame => Self::Start(StartPacket::decode(bytes)?),
            MessageKind::Lobby => Self::Lobby(LobbyMessage::decode(bytes)?),
        })
    }

    /// Encodes the packet.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Sync(packet) => packet.encode(),
            Self::Start(packet) => packet.encode(),
            Self::Lobby(message) => message.encode(),
        }
    }
}

fn expect_tag(reader: &mut PacketReader<'_>, tag: u8) -> CodecResult<()> {
    let found = reader.read_u8()?;
    if found == tag {
        Ok(())
    } else {
        Err(CodecError::UnknownMessageType { tag: found })
    }
}

/// Writes a `host(4) port(2)` pair.
pub(crate) fn put_address(writer: &mut PacketWriter, addr: SocketAddrV4) {
    writer.put_bytes(&addr.ip().octets()).put_u16(addr.port());
}

/// Reads a `host(4) port(2)` pair.
pub(crate) fn read_address(reader: &mut PacketReader<'_>) -> CodecResult<SocketAddrV4> {
    let host = Ipv4Addr::from(reader.read_array::<4>()?);
    Ok(SocketAddrV4::new(host, reader.read_u16()?))
}

/// Reads a fixed-width NUL-padded name.
pub(crate) fn read_name(reader: &mut PacketReader<'_>) -> CodecResult<String> {
    let raw = reader.read_bytes(PLAYER_NAME_LEN)?;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    Ok(String::from_utf8_lossy(raw.get(..end).unwrap_or_default()).into_owned())
}

fn put_address_list(writer: &mut PacketWriter, list: &[SocketAddrV4]) {
    let count = list.len().min(u8::MAX as usize);
    writer.put_u8(count as u8);
    for addr in list.iter().take(count) {
        put_address(writer, *addr);
    }
}

fn read_address_list(reader: &mut PacketReader<'_>) -> CodecResult<AddressList> {
    let count = reader.read_u8()? as usize;
    (0..count).map(|_| read_address(reader)).collect()
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
    use smallvec::smallvec;

    fn addr(last: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, last), port)
    }

    #[test]
    fn test_sync_packet_layout() {
        let packet = SyncPacket {
            frame: Frame::new(0x0102_0304),
            seed: 0xAABB_CCDD,
            records: smallvec![InputRecord::new(1, 0x41), InputRecord::new(2, 0x41)],
        };
        let bytes = packet.encode();
        assert_eq!(
            bytes,
            [0x00, 1, 2, 3, 4, 0xAA, 0xBB, 0xCC, 0xDD, 1, 0x41, 2, 0x41]
        );
        assert_eq!(SyncPacket::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_sync_packet_rejects_short_header_and_odd_records() {
        assert!(SyncPacket::decode(&[0x00, 0, 0, 0, 1, 0, 0]).is_err());
        assert!(SyncPacket::decode(&[0x00, 0, 0, 0, 1, 0, 0, 0, 0, 7]).is_err());
        assert!(SyncPacket::decode(&[0x01, 0, 0, 0, 1, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_start_packet_layout_with_lives() {
        let packet = StartPacket {
            sender: PlayerIndex::HOST,
            params: GameParams {
                wave: 3,
                turbo: true,
                rules: MatchRules::Lives(5),
            },
            seed: 0x0000_BEEF,
        };
        let bytes = packet.encode();
        assert_eq!(bytes.len(), START_PACKET_LEN);
        assert_eq!(
            bytes,
            [0x01, 0, 1, 0, 0, 0, 3, 0, 0, 0, 5, 0, 0, 0xBE, 0xEF]
        );
        assert_eq!(StartPacket::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_start_packet_death_match_sets_high_bit() {
        let packet = StartPacket {
            sender: PlayerIndex::new(2),
            params: GameParams {
                wave: 1,
                turbo: false,
                rules: MatchRules::DeathMatch(3),
            },
            seed: 1,
        };
        let bytes = packet.encode();
        assert_eq!(&bytes[7..11], &[0x80, 0, 0, 3]);
        assert_eq!(StartPacket::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_start_packet_rejects_bad_sender_and_length() {
        let mut bytes = StartPacket {
            sender: PlayerIndex::new(1),
            params: GameParams::default(),
            seed: 9,
        }
        .encode();
        bytes.push(0);
        assert!(StartPacket::decode(&bytes).is_err());
        bytes.pop();
        bytes[1] = 7;
        assert_eq!(
            StartPacket::decode(&bytes),
            Err(CodecError::InvalidField {
                field: "sender",
                value: 7
            })
        );
    }

    #[test]
    fn test_lobby_command_bytes_follow_wire_order() {
        for raw in 0u8..=10 {
            assert_eq!(LobbyCommand::from_u8(raw).unwrap() as u8, raw);
        }
        assert_eq!(LobbyCommand::from_u8(11), None);
        assert_eq!(
            LobbyMessage::RequestGameInfo.encode(),
            [LOBBY_MSG, LobbyCommand::RequestGameInfo as u8]
        );
    }

    #[test]
    fn test_address_list_layout() {
        let message = LobbyMessage::GameServers {
            servers: smallvec![addr(1, 0xAC0E), addr(2, 80)],
        };
        let bytes = message.encode();
        assert_eq!(
            bytes,
            [0xFF, 3, 2, 10, 0, 0, 1, 0xAC, 0x0E, 10, 0, 0, 2, 0, 80]
        );
        assert_eq!(LobbyMessage::decode(&bytes).unwrap(), message);
    }

    #[test]
    fn test_address_list_count_larger_than_payload_fails() {
        assert!(LobbyMessage::decode(&[0xFF, 6, 2, 10, 0, 0, 1, 0, 80]).is_err());
    }

    #[test]
    fn test_request_join_name_is_padded_and_trimmed() {
        let message = LobbyMessage::RequestJoin {
            game_id: 7,
            player_id: 99,
            name: "ana".to_owned(),
        };
        let bytes = message.encode();
        assert_eq!(bytes.len(), 2 + 4 + 4 + PLAYER_NAME_LEN);
        assert_eq!(&bytes[10..14], b"ana\0");
        assert_eq!(LobbyMessage::decode(&bytes).unwrap(), message);
    }

    #[test]
    fn test_ping_and_unknown_command() {
        let ping = LobbyMessage::Ping {
            reply: true,
            timestamp_ms: 1234,
        };
        assert_eq!(LobbyMessage::decode(&ping.encode()).unwrap(), ping);
        assert!(LobbyMessage::decode(&[0xFF, 42]).is_err());
        assert!(LobbyMessage::decode(&[0xFF]).is_err());
    }

    #[test]
    fn test_classify() {
        assert_eq!(MessageKind::classify(&[0x00]).unwrap(), MessageKind::Sync);
        assert_eq!(MessageKind::classify(&[0x01]).unwrap(), MessageKind::NewGame);
        assert_eq!(MessageKind::classify(&[0xFF]).unwrap(), MessageKind::Lobby);
        assert!(MessageKind::classify(&[0x80]).is_err());
        assert!(MessageKind::classify(&[]).is_err());
    }

    #[test]
    fn test_message_dispatches_by_family() {
        let bytes = LobbyMessage::OpenFirewall.encode();
        assert_eq!(
            Message::decode(&bytes).unwrap(),
            Message::Lobby(LobbyMessage::OpenFirewall)
        );
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod property_tests {
    use super::*;
    use crate::test_config::{proptest_config, CaseWeight};
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(proptest_config(CaseWeight::Message))]

        /// Property: decoding never panics on arbitrary datagrams.
        #[test]
        fn prop_decode_arbitrary_bytes_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..128)) {
            let _ = Message::decode(&bytes);
        }

        /// Property: sync packets keep every record and its order.
        #[test]
        fn prop_sync_records_preserved(frame in any::<u32>(), seed in any::<u32>(),
                                       raw in proptest::collection::vec(any::<(u8, u8)>(), 0..64)) {
            let packet = SyncPacket {
                frame: Frame::new(frame),
                seed,
                records: raw.iter().map(|&(op, key)| InputRecord::new(op, key)).collect(),
            };
            let bytes = packet.encode();
            prop_assert_eq!(bytes.len(), SYNC_HEADER_LEN + raw.len() * 2);
            prop_assert_eq!(SyncPacket::decode(&bytes).unwrap(), packet);
        }
    }
}
