use std::any::{Any, TypeId};
use std::collections::BTreeMap;

use crate::buffer::ownership_queue::{OwnershipCircularQueue, OwnershipSlot};
use crate::CommandFrame;

/// Attribute values recorded for one command frame, at most one per type.
#[derive(Debug, Default)]
pub struct AttributeSnapshot {
    command_frame: CommandFrame,
    values: BTreeMap<TypeId, Box<dyn Any>>,
}

impl AttributeSnapshot {
    /// The recorded value of type `T`, if any.
    #[must_use]
    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// Number of recorded attribute types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if nothing was recorded for this frame.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl OwnershipSlot for AttributeSnapshot {
    type Owner = TypeId;

    fn command_frame(&self) -> CommandFrame {
        self.command_frame
    }

    fn reset(&mut self, frame: CommandFrame) {
        self.command_frame = frame;
        self.values.clear();
    }

    fn has_ownership(&self, owner: &TypeId) -> bool {
        self.values.contains_key(owner)
    }
}

/// Per-frame history of attribute values that collaborators restore from
/// before a replay.
///
/// Each attribute type acts as the owner of its entry, so a type can be
/// recorded once per frame. The buffer is emptied whenever the command frame
/// counters are hard reset.
#[derive(Debug)]
pub struct SnapshotBuffer {
    queue: OwnershipCircularQueue<AttributeSnapshot>,
}

impl SnapshotBuffer {
    /// Creates a buffer holding up to `frame_budget` frames.
    #[must_use]
    pub fn new(frame_budget: u32) -> Self {
        Self {
            queue: OwnershipCircularQueue::new(frame_budget),
        }
    }

    /// Records `value` for `frame`.
    ///
    /// Returns `false` if the frame is older than the buffered window or a
    /// `T` was already recorded for it.
    pub fn record_attribute_snapshot<T: 'static>(&mut self, frame: CommandFrame, value: T) -> bool {
        match self.queue.claim_slot(TypeId::of::<T>(), frame) {
            Some(slot) => {
                slot.values.insert(TypeId::of::<T>(), Box::new(value));
                true
            },
            None => false,
        }
    }

    /// The `T` recorded for `frame`, if it is still buffered.
    #[must_use]
    pub fn read_attribute_from_snapshot<T: 'static>(&self, frame: CommandFrame) -> Option<&T> {
        self.queue.read_data(frame).and_then(AttributeSnapshot::get::<T>)
    }

    /// The whole snapshot for `frame`.
    #[must_use]
    pub fn read_snapshot(&self, frame: CommandFrame) -> Option<&AttributeSnapshot> {
        self.queue.read_data(frame)
    }

    /// Drops every frame up to and including `frame`.
    pub fn ack(&mut self, frame: CommandFrame) {
        self.queue.ack_data(frame);
    }

    /// Drops every frame.
    pub fn empty(&mut self) {
        self.queue.empty();
    }

    /// Number of buffered frames.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.queue.count()
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

    #[derive(Debug, PartialEq)]
    struct Health(u32);

    #[derive(Debug, PartialEq)]
    struct Position(i32, i32);

    #[test]
    fn records_one_value_per_type_and_frame() {
        let mut buffer = SnapshotBuffer::new(8);
        let frame = CommandFrame::new(3);
        assert!(buffer.record_attribute_snapshot(frame, Health(100)));
        assert!(buffer.record_attribute_snapshot(frame, Position(1, 2)));
        assert!(!buffer.record_attribute_snapshot(frame, Health(50)));

        assert_eq!(buffer.read_attribute_from_snapshot::<Health>(frame), Some(&Health(100)));
        assert_eq!(
            buffer.read_attribute_from_snapshot::<Position>(frame),
            Some(&Position(1, 2))
        );
        assert_eq!(buffer.read_snapshot(frame).map(AttributeSnapshot::len), Some(2));
    }

    #[test]
    fn missing_type_or_frame_reads_none() {
        let mut buffer = SnapshotBuffer::new(8);
        buffer.record_attribute_snapshot(CommandFrame::new(2), Health(1));
        assert!(buffer.read_attribute_from_snapshot::<Position>(CommandFrame::new(2)).is_none());
        assert!(buffer.read_attribute_from_snapshot::<Health>(CommandFrame::new(3)).is_none());
        // gap frames are readable but empty
        assert!(buffer.read_snapshot(CommandFrame::new(1)).unwrap().is_empty());
    }

    #[test]
    fn empty_discards_history() {
        let mut buffer = SnapshotBuffer::new(8);
        for n in 1..=4 {
            buffer.record_attribute_snapshot(CommandFrame::new(n), Health(n));
        }
        buffer.ack(CommandFrame::new(2));
        assert!(buffer.read_attribute_from_snapshot::<Health>(CommandFrame::new(2)).is_none());
        assert_eq!(buffer.read_attribute_from_snapshot::<Health>(CommandFrame::new(3)), Some(&Health(3)));
        buffer.empty();
        assert_eq!(buffer.count(), 0);
        assert!(buffer.read_attribute_from_snapshot::<Health>(CommandFrame::new(4)).is_none());
    }
}
