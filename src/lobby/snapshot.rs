//! Game snapshots and the list of discovered games.
//!
//! A [`GameInfoSnapshot`] is what a host advertises: its game id, the death-match value,
//! and exactly [`MAX_PLAYERS`] player slots. Player id 0 marks an empty slot. Ping stats
//! are measured locally and never leave the process.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::network::codec::{CodecResult, PacketReader, PacketWriter};
use crate::network::messages::{put_address, read_address, read_name};
use crate::{PlayerIndex, MAX_PLAYERS, PLAYER_NAME_LEN};

/// Round-trip measurements for one remote player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PingStats {
    last_ms: Option<u32>,
    min_ms: Option<u32>,
    max_ms: Option<u32>,
    total_ms: u64,
    samples: u32,
}

impl PingStats {
    /// Adds one round-trip sample.
    pub fn record(&mut self, rtt_ms: u32) {
        self.last_ms = Some(rtt_ms);
        self.min_ms = Some(self.min_ms.map_or(rtt_ms, |min| min.min(rtt_ms)));
        self.max_ms = Some(self.max_ms.map_or(rtt_ms, |max| max.max(rtt_ms)));
        self.total_ms = self.total_ms.saturating_add(u64::from(rtt_ms));
        self.samples = self.samples.saturating_add(1);
    }

    /// The most recent sample.
    #[must_use]
    pub const fn last_ms(&self) -> Option<u32> {
        self.last_ms
    }

    /// The smallest sample.
    #[must_use]
    pub const fn min_ms(&self) -> Option<u32> {
        self.min_ms
    }

    /// The largest sample.
    #[must_use]
    pub const fn max_ms(&self) -> Option<u32> {
        self.max_ms
    }

    /// Mean of every sample.
    #[must_use]
    pub fn average_ms(&self) -> Option<u32> {
        if self.samples == 0 {
            return None;
        }
        u32::try_from(self.total_ms / u64::from(self.samples)).ok()
    }

    /// Number of samples taken.
    #[must_use]
    pub const fn samples(&self) -> u32 {
        self.samples
    }
}

/// One player slot of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GameInfoPlayer {
    /// Unique id of the player, 0 for an empty slot.
    pub player_id: u32,
    /// Where the host sees the player.
    pub address: SocketAddrV4,
    /// Display name, at most 16 bytes on the wire.
    pub name: String,
    /// Local round-trip measurements. Not serialized.
    pub ping: PingStats,
}

impl Default for GameInfoPlayer {
    fn default() -> Self {
        Self {
            player_id: 0,
            address: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            name: String::new(),
            ping: PingStats::default(),
        }
    }
}

impl GameInfoPlayer {
    /// Creates an occupied slot.
    #[must_use]
    pub fn new(player_id: u32, address: SocketAddrV4, name: impl Into<String>) -> Self {
        Self {
            player_id,
            address,
            name: name.into(),
            ping: PingStats::default(),
        }
    }

    /// Returns `true` if nobody holds the slot.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.player_id == 0
    }
}

/// What a host advertises about its game.
///
/// # Examples
///
/// ```
/// use fortress_lockstep::{GameInfoPlayer, GameInfoSnapshot, PlayerIndex};
/// use std::net::{Ipv4Addr, SocketAddrV4};
///
/// let mut game = GameInfoSnapshot::new(0xCAFE, 0);
/// let host = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 44046);
/// game.players[0] = GameInfoPlayer::new(0xCAFE, host, "host");
/// assert_eq!(game.free_slot(), Some(PlayerIndex::new(1)));
/// assert_eq!(game.slot_of(0xCAFE), Some(PlayerIndex::HOST));
/// assert_eq!(game.player_count(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GameInfoSnapshot {
    /// The game's id, which is the host's unique id.
    pub game_id: u32,
    /// Death-match frag count, 0 for a regular game.
    pub death_match: u8,
    /// Player slots. Slot 0 is the host.
    pub players: [GameInfoPlayer; MAX_PLAYERS],
}

impl GameInfoSnapshot {
    /// Encoded size: game id, death match, then per slot id, host, port and name.
    pub const ENCODED_LEN: usize = 5 + MAX_PLAYERS * (4 + 4 + 2 + PLAYER_NAME_LEN);

    /// Creates a snapshot with every slot empty.
    #[must_use]
    pub fn new(game_id: u32, death_match: u8) -> Self {
        Self {
            game_id,
            death_match,
            players: Default::default(),
        }
    }

    /// The slot holding `player_id`. Never matches id 0.
    #[must_use]
    pub fn slot_of(&self, player_id: u32) -> Option<PlayerIndex> {
        if player_id == 0 {
            return None;
        }
        self.players
            .iter()
            .position(|player| player.player_id == player_id)
            .map(PlayerIndex::new)
    }

    /// The slot whose address is `addr`.
    #[must_use]
    pub fn slot_at(&self, addr: SocketAddrV4) -> Option<PlayerIndex> {
        self.players
            .iter()
            .position(|player| !player.is_empty() && player.address == addr)
            .map(PlayerIndex::new)
    }

    /// The first empty non-host slot.
    #[must_use]
    pub fn free_slot(&self) -> Option<PlayerIndex> {
        self.players
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, player)| player.is_empty())
            .map(|(i, _)| PlayerIndex::new(i))
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn player_count(&self) -> usize {
        self.players.iter().filter(|player| !player.is_empty()).count()
    }

    /// Ids of the occupied slots, in slot order.
    pub fn player_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.players
            .iter()
            .filter(|player| !player.is_empty())
            .map(|player| player.player_id)
    }

    /// Copies ping stats from `older` for every player still present.
    pub fn inherit_ping(&mut self, older: &Self) {
        for player in self.players.iter_mut().filter(|p| !p.is_empty()) {
            if let Some(previous) = older
                .players
                .iter()
                .find(|p| p.player_id == player.player_id)
            {
                player.ping = previous.ping;
            }
        }
    }

    /// Appends the wire form. Ping stats are not written.
    pub fn encode_into(&self, writer: &mut PacketWriter) {
        writer.put_u32(self.game_id).put_u8(self.death_match);
        for player in &self.players {
            writer.put_u32(player.player_id);
            put_address(writer, player.address);
            writer.put_fixed(player.name.as_bytes(), PLAYER_NAME_LEN);
        }
    }

    /// Reads the wire form.
    ///
    /// # Errors
    /// Fails if fewer than [`ENCODED_LEN`](Self::ENCODED_LEN) bytes remain.
    pub fn decode_from(reader: &mut PacketReader<'_>) -> CodecResult<Self> {
        let mut snapshot = Self::new(reader.read_u32()?, reader.read_u8()?);
        for player in &mut snapshot.players {
            player.player_id = reader.read_u32()?;
            player.address = read_address(reader)?;
            player.name = read_name(reader)?;
        }
        Ok(snapshot)
    }
}

/// A game seen in the lobby, with the address its host answered from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredGame {
    /// The host's address as seen by us.
    pub host: SocketAddrV4,
    /// The latest snapshot.
    pub snapshot: GameInfoSnapshot,
}

impl DiscoveredGame {
    /// The game's id.
    #[must_use]
    pub const fn game_id(&self) -> u32 {
        self.snapshot.game_id
    }
}

/// Discovered games in first-seen order, keyed by game id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GameList {
    games: Vec<DiscoveredGame>,
}

impl GameList {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates the entry with the same game id in place, or appends a new one.
    /// Returns `true` if the game was new.
    pub fn merge(&mut self, host: SocketAddrV4, mut snapshot: GameInfoSnapshot) -> bool {
        match self
            .games
            .iter_mut()
            .find(|game| game.game_id() == snapshot.game_id)
        {
            Some(existing) => {
                snapshot.inherit_ping(&existing.snapshot);
                existing.host = host;
                existing.snapshot = snapshot;
                false
            },
            None => {
                self.games.push(DiscoveredGame { host, snapshot });
                true
            },
        }
    }

    /// Removes a game. Returns it if it was listed.
    pub fn remove(&mut self, game_id: u32) -> Option<DiscoveredGame> {
        let position = self.games.iter().position(|game| game.game_id() == game_id)?;
        Some(self.games.remove(position))
    }

    /// The entry for `game_id`.
    #[must_use]
    pub fn get(&self, game_id: u32) -> Option<&DiscoveredGame> {
        self.games.iter().find(|game| game.game_id() == game_id)
    }

    /// Every entry in first-seen order.
    pub fn iter(&self) -> impl Iterator<Item = &DiscoveredGame> + '_ {
        self.games.iter()
    }

    /// Number of listed games.
    #[must_use]
    pub fn len(&self) -> usize {
        self.games.len()
    }

    /// Returns `true` if nothing is listed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.games.is_empty()
    }

    /// Forgets every game.
    pub fn clear(&mut self) {
        self.games.clear();
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
    use crate::network::codec::CodecError;

    fn addr(last: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, last), port)
    }

    fn sample() -> GameInfoSnapshot {
        let mut snapshot = GameInfoSnapshot::new(77, 5);
        snapshot.players[0] = GameInfoPlayer::new(77, addr(1, 44046), "host");
        snapshot.players[2] = GameInfoPlayer::new(91, addr(9, 50123), "sixteen-byte-nam");
        snapshot
    }

    #[test]
    fn encoded_form_has_fixed_width() {
        let mut writer = PacketWriter::new();
        sample().encode_into(&mut writer);
        assert_eq!(writer.len(), GameInfoSnapshot::ENCODED_LEN);

        let bytes = writer.into_bytes();
        assert_eq!(&bytes[..5], &[0, 0, 0, 77, 5]);
        // slot 1 is empty: id 0, address 0.0.0.0:0, 16 NULs
        let slot1 = 5 + 26;
        assert!(bytes[slot1..slot1 + 26].iter().all(|&b| b == 0));
    }

    #[test]
    fn decode_reads_back_every_slot_but_not_ping() {
        let mut original = sample();
        original.players[2].ping.record(40);
        let mut writer = PacketWriter::new();
        original.encode_into(&mut writer);
        let bytes = writer.into_bytes();

        let decoded = GameInfoSnapshot::decode_from(&mut PacketReader::new(&bytes)).unwrap();
        assert_eq!(decoded.players[2].name, "sixteen-byte-nam");
        assert_eq!(decoded.players[2].address, addr(9, 50123));
        assert_eq!(decoded.players[2].ping, PingStats::default());
        assert!(decoded.players[1].is_empty());
        assert_eq!(decoded.death_match, 5);
    }

    #[test]
    fn long_names_are_truncated_on_the_wire() {
        let mut snapshot = GameInfoSnapshot::new(1, 0);
        snapshot.players[0] = GameInfoPlayer::new(1, addr(1, 1), "a-name-well-past-sixteen-bytes");
        let mut writer = PacketWriter::new();
        snapshot.encode_into(&mut writer);
        let bytes = writer.into_bytes();
        let decoded = GameInfoSnapshot::decode_from(&mut PacketReader::new(&bytes)).unwrap();
        assert_eq!(decoded.players[0].name, "a-name-well-past");
    }

    #[test]
    fn truncated_snapshot_fails() {
        let mut writer = PacketWriter::new();
        sample().encode_into(&mut writer);
        let bytes = writer.into_bytes();
        let err = GameInfoSnapshot::decode_from(&mut PacketReader::new(&bytes[..40])).unwrap_err();
        assert!(matches!(err, CodecError::UnexpectedEnd { .. }));
    }

    #[test]
    fn slot_queries() {
        let snapshot = sample();
        assert_eq!(snapshot.slot_of(91), Some(PlayerIndex::new(2)));
        assert_eq!(snapshot.slot_of(0), None);
        assert_eq!(snapshot.slot_at(addr(9, 50123)), Some(PlayerIndex::new(2)));
        assert_eq!(snapshot.free_slot(), Some(PlayerIndex::new(1)));
        assert_eq!(snapshot.player_ids().collect::<Vec<_>>(), vec![77, 91]);
    }

    #[test]
    fn full_game_has_no_free_slot() {
        let mut snapshot = sample();
        snapshot.players[1] = GameInfoPlayer::new(5, addr(5, 5), "p");
        assert_eq!(snapshot.free_slot(), None);
        assert_eq!(snapshot.player_count(), MAX_PLAYERS);
    }

    #[test]
    fn same_game_id_updates_in_place() {
        let mut list = GameList::new();
        assert!(list.merge(addr(1, 44046), sample()));
        let mut other = GameInfoSnapshot::new(12, 0);
        other.players[0] = GameInfoPlayer::new(12, addr(2, 44046), "other");
        assert!(list.merge(addr(2, 44046), other));

        let mut updated = sample();
        updated.death_match = 9;
        assert!(!list.merge(addr(1, 44046), updated));
        assert_eq!(list.len(), 2);
        let ids: Vec<_> = list.iter().map(DiscoveredGame::game_id).collect();
        assert_eq!(ids, vec![77, 12]);
        assert_eq!(list.get(77).unwrap().snapshot.death_match, 9);
    }

    #[test]
    fn merge_keeps_local_ping_stats() {
        let mut list = GameList::new();
        let mut first = sample();
        first.players[0].ping.record(20);
        list.merge(addr(1, 44046), first);
        list.merge(addr(1, 44046), sample());
        assert_eq!(list.get(77).unwrap().snapshot.players[0].ping.last_ms(), Some(20));
    }

    #[test]
    fn remove_drops_only_that_game() {
        let mut list = GameList::new();
        list.merge(addr(1, 44046), sample());
        assert!(list.remove(3).is_none());
        assert_eq!(list.remove(77).map(|g| g.game_id()), Some(77));
        assert!(list.is_empty());
    }

    #[test]
    fn ping_stats_track_min_max_and_mean() {
        let mut ping = PingStats::default();
        assert_eq!(ping.average_ms(), None);
        for rtt in [30, 10, 50] {
            ping.record(rtt);
        }
        assert_eq!(ping.last_ms(), Some(50));
        assert_eq!(ping.min_ms(), Some(10));
        assert_eq!(ping.max_ms(), Some(50));
        assert_eq!(ping.average_ms(), Some(30));
        assert_eq!(ping.samples(), 3);
    }
}
