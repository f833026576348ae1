//! Who is in the match and where to reach them.
//!
//! A [`Roster`] is the fixed array of [`MAX_PLAYERS`] slots plus the local index. The lobby
//! produces one from the agreed snapshot; the handshake and the lockstep session consume it.

use std::net::SocketAddrV4;

use crate::{NetplayError, PlayerIndex, MAX_PLAYERS};

/// One participant position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PlayerSlot {
    /// Where the participant is reached. `None` for the local slot and for empty slots.
    pub address: Option<SocketAddrV4>,
    /// Whether the slot takes part in the match.
    pub present: bool,
    /// Whether this is us.
    pub local: bool,
}

/// The fixed set of participant slots.
///
/// # Examples
///
/// ```
/// use fortress_lockstep::{PlayerIndex, Roster};
/// use std::net::{Ipv4Addr, SocketAddrV4};
///
/// let peer = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 20), 50_000);
/// let roster = Roster::new(PlayerIndex::HOST)?.with_peer(PlayerIndex::new(1), peer)?;
/// assert!(roster.is_host());
/// assert_eq!(roster.present_count(), 2);
/// assert_eq!(roster.index_of(peer), Some(PlayerIndex::new(1)));
/// # Ok::<(), fortress_lockstep::NetplayError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Roster {
    slots: [PlayerSlot; MAX_PLAYERS],
    local: PlayerIndex,
}

impl Roster {
    /// Creates a roster holding only the local participant at `local`.
    ///
    /// # Errors
    /// Returns [`NetplayError::InvalidRequest`] if `local` is out of range.
    pub fn new(local: PlayerIndex) -> Result<Self, NetplayError> {
        let mut slots = [PlayerSlot::default(); MAX_PLAYERS];
        let slot = slots
            .get_mut(local.as_usize())
            .ok_or_else(|| NetplayError::invalid(format!("local index {local} out of range")))?;
        slot.present = true;
        slot.local = true;
        Ok(Self { slots, local })
    }

    /// Adds a remote participant. Builder form of [`set_peer`](Self::set_peer).
    ///
    /// # Errors
    /// See [`set_peer`](Self::set_peer).
    pub fn with_peer(mut self, index: PlayerIndex, addr: SocketAddrV4) -> Result<Self, NetplayError> {
        self.set_peer(index, addr)?;
        Ok(self)
    }

    /// Marks slot `index` present at `addr`.
    ///
    /// # Errors
    /// Returns [`NetplayError::InvalidRequest`] if `index` is out of range, is the local
    /// slot, or `addr` is already bound to another slot.
    pub fn set_peer(&mut self, index: PlayerIndex, addr: SocketAddrV4) -> Result<(), NetplayError> {
        if index == self.local {
            return Err(NetplayError::invalid(format!(
                "slot {index} is the local participant"
            )));
        }
        if let Some(existing) = self.index_of(addr).filter(|existing| *existing != index) {
            return Err(NetplayError::invalid(format!(
                "{addr} is already bound to slot {existing}"
            )));
        }
        let slot = self
            .slots
            .get_mut(index.as_usize())
            .ok_or_else(|| NetplayError::invalid(format!("player index {index} out of range")))?;
        slot.address = Some(addr);
        slot.present = true;
        Ok(())
    }

    /// The local participant's index.
    #[must_use]
    pub const fn local(&self) -> PlayerIndex {
        self.local
    }

    /// Returns `true` if we are the host.
    #[must_use]
    pub const fn is_host(&self) -> bool {
        self.local.is_host()
    }

    /// The slot at `index`.
    #[must_use]
    pub fn slot(&self, index: PlayerIndex) -> Option<&PlayerSlot> {
        self.slots.get(index.as_usize())
    }

    /// Every slot in index order.
    #[must_use]
    pub fn slots(&self) -> &[PlayerSlot; MAX_PLAYERS] {
        &self.slots
    }

    /// Present remote participants and their addresses.
    pub fn peers(&self) -> impl Iterator<Item = (PlayerIndex, SocketAddrV4)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.present && !slot.local)
            .filter_map(|(i, slot)| slot.address.map(|addr| (PlayerIndex::new(i), addr)))
    }

    /// Present participants, local included.
    pub fn present_players(&self) -> impl Iterator<Item = PlayerIndex> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.present)
            .map(|(i, _)| PlayerIndex::new(i))
    }

    /// Number of present participants, local included.
    #[must_use]
    pub fn present_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.present).count()
    }

    /// The host's address, when we are not the host.
    #[must_use]
    pub fn host_address(&self) -> Option<SocketAddrV4> {
        self.slot(PlayerIndex::HOST).and_then(|slot| slot.address)
    }

    /// The slot bound to `addr`.
    #[must_use]
    pub fn index_of(&self, addr: SocketAddrV4) -> Option<PlayerIndex> {
        self.slots
            .iter()
            .position(|slot| slot.address == Some(addr))
            .map(PlayerIndex::new)
    }

    /// Checks that the roster can start a match.
    ///
    /// # Errors
    /// Returns [`NetplayError::InvalidRequest`] if nobody else is present, or if a client
    /// roster has no host address.
    pub fn validate(&self) -> Result<(), NetplayError> {
        if self.present_count() < 2 {
            return Err(NetplayError::invalid(
                "a match needs at least one remote participant",
            ));
        }
        if !self.is_host() && self.host_address().is_none() {
            return Err(NetplayError::invalid("client roster has no host address"));
        }
        Ok(())
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
    use std::net::Ipv4Addr;

    fn addr(last: u8) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, last), 4000)
    }

    #[test]
    fn new_roster_holds_only_local() {
        let roster = Roster::new(PlayerIndex::new(1)).unwrap();
        assert_eq!(roster.present_count(), 1);
        assert!(roster.slot(PlayerIndex::new(1)).unwrap().local);
        assert!(!roster.is_host());
        assert_eq!(roster.peers().count(), 0);
        assert!(roster.validate().is_err());
    }

    #[test]
    fn out_of_range_local_is_rejected() {
        assert!(Roster::new(PlayerIndex::new(MAX_PLAYERS)).is_err());
    }

    #[test]
    fn peers_skip_local_and_empty_slots() {
        let roster = Roster::new(PlayerIndex::new(1))
            .unwrap()
            .with_peer(PlayerIndex::HOST, addr(1))
            .unwrap();
        let peers: Vec<_> = roster.peers().collect();
        assert_eq!(peers, vec![(PlayerIndex::HOST, addr(1))]);
        assert_eq!(roster.host_address(), Some(addr(1)));
        assert!(roster.validate().is_ok());
        let present: Vec<_> = roster.present_players().collect();
        assert_eq!(present, vec![PlayerIndex::HOST, PlayerIndex::new(1)]);
    }

    #[test]
    fn set_peer_rejects_local_slot_and_duplicate_address() {
        let mut roster = Roster::new(PlayerIndex::HOST).unwrap();
        assert!(roster.set_peer(PlayerIndex::HOST, addr(2)).is_err());
        roster.set_peer(PlayerIndex::new(1), addr(2)).unwrap();
        assert!(roster.set_peer(PlayerIndex::new(2), addr(2)).is_err());
        // rebinding the same slot to the same address is fine
        roster.set_peer(PlayerIndex::new(1), addr(2)).unwrap();
    }

    #[test]
    fn client_without_host_address_is_invalid() {
        let roster = Roster::new(PlayerIndex::new(2))
            .unwrap()
            .with_peer(PlayerIndex::new(1), addr(3))
            .unwrap();
        assert!(roster.validate().is_err());
    }
}
