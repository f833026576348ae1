//! The outbound payload of the current frame.
//!
//! Input recorded during frame `N` is sent with frame `N`'s sync packet, so the buffer
//! is filled between two barriers and frozen once it is sent. The lockstep session keeps
//! two of these and swaps them each frame, which keeps the previous frame's bytes around
//! for a peer that is one frame behind.

use smallvec::SmallVec;

use crate::network::codec::PacketWriter;
use crate::network::messages::{SYNC_HEADER_LEN, SYNC_MSG};
use crate::Frame;

/// One input event: an opaque op code and the key it applies to.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
pub struct InputRecord {
    /// What happened, e.g. [`KEY_PRESS`](crate::KEY_PRESS).
    pub op: u8,
    /// Which key.
    pub keycode: u8,
}

impl InputRecord {
    /// Creates a record.
    #[inline]
    #[must_use]
    pub const fn new(op: u8, keycode: u8) -> Self {
        Self { op, keycode }
    }
}

/// A sync packet under construction: the 9-byte header followed by input records,
/// bounded by a byte budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrameBuffer {
    writer: PacketWriter,
    budget: usize,
}

impl OutboundFrameBuffer {
    /// Creates an empty buffer that holds at most `budget` bytes, header included.
    ///
    /// A budget smaller than the header is raised to the header size.
    #[must_use]
    pub fn new(budget: usize) -> Self {
        let budget = budget.max(SYNC_HEADER_LEN);
        let mut buffer = Self {
            writer: PacketWriter::with_capacity(budget),
            budget,
        };
        buffer.reset();
        buffer
    }

    /// Writes the frame number and seed into the header. Records are kept.
    pub fn stamp(&mut self, frame: Frame, seed: u32) {
        self.writer
            .set_u32_at(1, frame.as_u32())
            .set_u32_at(5, seed);
    }

    /// Appends a record. Returns `false` and leaves the buffer unchanged when the
    /// record would exceed the budget.
    pub fn push(&mut self, record: InputRecord) -> bool {
        if self.writer.len() + 2 > self.budget {
            return false;
        }
        self.writer.put_u8(record.op).put_u8(record.keycode);
        true
    }

    /// Drops every record and zeroes the header fields.
    pub fn reset(&mut self) {
        self.writer.truncate(0);
        self.writer.put_u8(SYNC_MSG).put_u32(0).put_u32(0);
    }

    /// The encoded packet.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.writer.as_bytes()
    }

    /// Number of queued records.
    #[must_use]
    pub fn record_count(&self) -> usize {
        (self.writer.len() - SYNC_HEADER_LEN) / 2
    }

    /// Returns `true` when no record is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.record_count() == 0
    }

    /// The byte budget.
    #[must_use]
    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Queued records in order.
    #[must_use]
    pub fn records(&self) -> SmallVec<[InputRecord; 16]> {
        self.as_bytes()
            .get(SYNC_HEADER_LEN..)
            .unwrap_or_default()
            .chunks_exact(2)
            .map(|pair| match pair {
                [op, keycode] => InputRecord::new(*op, *keycode),
                _ => InputRecord::default(),
            })
            .collect()
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
    use crate::network::messages::SyncPacket;
    use crate::{KEY_PRESS, KEY_RELEASE};

    #[test]
    fn test_new_buffer_is_a_bare_header() {
        let buffer = OutboundFrameBuffer::new(64);
        assert_eq!(buffer.as_bytes(), &[SYNC_MSG, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_stamp_keeps_records() {
        let mut buffer = OutboundFrameBuffer::new(64);
        assert!(buffer.push(InputRecord::new(KEY_PRESS, b'a')));
        buffer.stamp(Frame::new(4), 0xDEAD_BEEF);
        let packet = SyncPacket::decode(buffer.as_bytes()).unwrap();
        assert_eq!(packet.frame, Frame::new(4));
        assert_eq!(packet.seed, 0xDEAD_BEEF);
        assert_eq!(packet.records.as_slice(), &[InputRecord::new(KEY_PRESS, b'a')]);
    }

    #[test]
    fn test_push_rejects_records_past_budget() {
        let mut buffer = OutboundFrameBuffer::new(SYNC_HEADER_LEN + 4);
        assert!(buffer.push(InputRecord::new(KEY_PRESS, 1)));
        assert!(buffer.push(InputRecord::new(KEY_RELEASE, 1)));
        assert!(!buffer.push(InputRecord::new(KEY_PRESS, 2)));
        assert_eq!(buffer.record_count(), 2);
        assert_eq!(buffer.as_bytes().len(), SYNC_HEADER_LEN + 4);
    }

    #[test]
    fn test_tiny_budget_still_holds_header() {
        let mut buffer = OutboundFrameBuffer::new(0);
        assert_eq!(buffer.budget(), SYNC_HEADER_LEN);
        assert!(!buffer.push(InputRecord::new(KEY_PRESS, 1)));
    }

    #[test]
    fn test_reset_clears_records_and_header() {
        let mut buffer = OutboundFrameBuffer::new(64);
        buffer.push(InputRecord::new(KEY_PRESS, 9));
        buffer.stamp(Frame::new(2), 5);
        buffer.reset();
        assert!(buffer.is_empty());
        assert_eq!(buffer.as_bytes().len(), SYNC_HEADER_LEN);
        assert_eq!(&buffer.as_bytes()[1..], &[0; 8]);
    }

    #[test]
    fn test_records_preserve_order() {
        let mut buffer = OutboundFrameBuffer::new(64);
        for key in 0..5 {
            buffer.push(InputRecord::new(KEY_PRESS, key));
        }
        let keys: Vec<u8> = buffer.records().iter().map(|r| r.keycode).collect();
        assert_eq!(keys, vec![0, 1, 2, 3, 4]);
    }
}
