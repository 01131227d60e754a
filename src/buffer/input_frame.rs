//! Per-frame input storage for the ownership ring, with a cached wire block.

use std::cell::OnceCell;

use smallvec::SmallVec;

use crate::buffer::ownership_queue::OwnershipSlot;
use crate::input::atom::INPUT_ATOM_SCHEMA_VERSION;
use crate::network::codec::{CodecResult, PacketWriter};
use crate::{CommandFrame, InputAtom, OwnerId};

/// One command frame's worth of input across every owner.
///
/// Atoms are stored contiguously, grouped by owner in write order. The
/// encoded wire block for the frame is cached on first use so a frame that
/// appears in several consecutive redundant packets is only encoded once.
/// Any write or reset drops the cache.
#[derive(Debug, Default)]
pub struct InputFrame {
    command_frame: CommandFrame,
    input_queue: Vec<InputAtom>,
    order_counter: SmallVec<[(OwnerId, u32); 4]>,
    shared_serialization: OnceCell<Vec<u8>>,
}

impl InputFrame {
    /// Creates an empty frame stamped with `frame`.
    #[must_use]
    pub fn new(frame: CommandFrame) -> Self {
        Self {
            command_frame: frame,
            ..Self::default()
        }
    }

    /// All atoms, grouped by owner in write order.
    #[must_use]
    pub fn atoms(&self) -> &[InputAtom] {
        &self.input_queue
    }

    /// Owners and their atom counts, in write order.
    pub fn owners(&self) -> impl Iterator<Item = (OwnerId, u32)> + '_ {
        self.order_counter.iter().copied()
    }

    /// The atoms written by `owner`, if it wrote to this frame.
    #[must_use]
    pub fn atoms_for(&self, owner: OwnerId) -> Option<&[InputAtom]> {
        let mut offset = 0usize;
        for (candidate, count) in self.owners() {
            let count = count as usize;
            if candidate == owner {
                return self.input_queue.get(offset..offset + count);
            }
            offset += count;
        }
        None
    }

    /// Appends `count` default atoms for `owner` and returns them for filling.
    ///
    /// Returns `None` if `owner` already wrote to this frame. A zero count
    /// still records ownership and yields an empty slice.
    pub fn allocate_item(&mut self, owner: OwnerId, count: usize) -> Option<&mut [InputAtom]> {
        if self.has_ownership(&owner) {
            return None;
        }
        let start = self.input_queue.len();
        self.input_queue
            .resize(start + count, InputAtom::default());
        self.order_counter.push((owner, count as u32));
        self.shared_serialization.take();
        Some(&mut self.input_queue[start..])
    }

    /// Copies `atoms` in for `owner`. Returns `false` if `owner` already wrote to this frame.
    pub fn add_item(&mut self, owner: OwnerId, atoms: &[InputAtom]) -> bool {
        match self.allocate_item(owner, atoms.len()) {
            Some(slot) => {
                slot.copy_from_slice(atoms);
                true
            },
            None => false,
        }
    }

    /// Returns the cached wire block for this frame, encoding it on first use.
    ///
    /// Layout: `[frame: u32][atom count: i32][size scope: version u8, atoms...]`.
    pub fn shared_serialization(&self) -> CodecResult<&[u8]> {
        if let Some(bytes) = self.shared_serialization.get() {
            return Ok(bytes);
        }
        let bytes = self.encode_block()?;
        Ok(self.shared_serialization.get_or_init(|| bytes))
    }

    /// Returns `true` if the wire block is currently cached.
    #[must_use]
    pub fn has_cached_serialization(&self) -> bool {
        self.shared_serialization.get().is_some()
    }

    fn encode_block(&self) -> CodecResult<Vec<u8>> {
        let mut writer = PacketWriter::new();
        writer.write(&self.command_frame.as_u32())?;
        writer.write(&(self.input_queue.len() as i32))?;
        writer.write_size_scoped(|block| {
            let mut written = block.write(&INPUT_ATOM_SCHEMA_VERSION)?;
            for atom in &self.input_queue {
                written += block.write(atom)?;
            }
            Ok(written)
        })?;
        Ok(writer.into_bytes())
    }
}

impl OwnershipSlot for InputFrame {
    type Owner = OwnerId;

    fn command_frame(&self) -> CommandFrame {
        self.command_frame
    }

    fn reset(&mut self, frame: CommandFrame) {
        self.command_frame = frame;
        self.input_queue.clear();
        self.order_counter.clear();
        self.shared_serialization.take();
    }

    fn has_ownership(&self, owner: &OwnerId) -> bool {
        self.order_counter.iter().any(|(o, _)| o == owner)
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
    use crate::network::codec::PacketReader;
    use crate::{ActionId, InputValue, TriggerEvent};

    fn atom(id: u32) -> InputAtom {
        InputAtom::new(
            ActionId::new(id),
            TriggerEvent::Triggered,
            InputValue::axis1d(id as f32),
        )
    }

    #[test]
    fn one_write_per_owner() {
        let mut frame = InputFrame::new(CommandFrame::new(3));
        assert!(frame.add_item(OwnerId::new(1), &[atom(1), atom(2)]));
        assert!(!frame.add_item(OwnerId::new(1), &[atom(3)]));
        assert!(frame.allocate_item(OwnerId::new(1), 1).is_none());
        assert!(frame.add_item(OwnerId::new(2), &[atom(4)]));

        assert_eq!(frame.atoms().len(), 3);
        assert_eq!(frame.atoms_for(OwnerId::new(2)), Some(&[atom(4)][..]));
        assert_eq!(
            frame.owners().collect::<Vec<_>>(),
            vec![(OwnerId::new(1), 2), (OwnerId::new(2), 1)]
        );
    }

    #[test]
    fn zero_count_allocation_records_ownership() {
        let mut frame = InputFrame::new(CommandFrame::new(1));
        let slot = frame.allocate_item(OwnerId::new(5), 0).unwrap();
        assert!(slot.is_empty());
        assert!(frame.has_ownership(&OwnerId::new(5)));
        assert!(frame.allocate_item(OwnerId::new(5), 0).is_none());
    }

    #[test]
    fn verify_resets_stale_slot() {
        let mut frame = InputFrame::new(CommandFrame::new(2));
        frame.add_item(OwnerId::new(1), &[atom(1)]);
        assert!(frame.verify(CommandFrame::new(2)));
        assert!(!frame.verify(CommandFrame::new(66)));
        assert_eq!(frame.command_frame(), CommandFrame::new(66));
        assert!(frame.atoms().is_empty());
        assert!(!frame.has_ownership(&OwnerId::new(1)));
    }

    #[test]
    fn serialization_is_cached_until_written() {
        let mut frame = InputFrame::new(CommandFrame::new(9));
        frame.add_item(OwnerId::new(1), &[atom(1)]);
        assert!(!frame.has_cached_serialization());

        let first = frame.shared_serialization().unwrap().to_vec();
        assert!(frame.has_cached_serialization());
        assert_eq!(frame.shared_serialization().unwrap(), &first[..]);

        frame.add_item(OwnerId::new(2), &[atom(2)]);
        assert!(!frame.has_cached_serialization());
        assert_ne!(frame.shared_serialization().unwrap(), &first[..]);
    }

    #[test]
    fn wire_block_layout() {
        let mut frame = InputFrame::new(CommandFrame::new(12));
        frame.add_item(OwnerId::new(1), &[atom(1), atom(2)]);
        let bytes = frame.shared_serialization().unwrap().to_vec();

        let mut reader = PacketReader::new(&bytes);
        let number: u32 = reader.read().unwrap();
        let count: i32 = reader.read().unwrap();
        let size = reader.read_size_scope().unwrap();
        assert_eq!(number, 12);
        assert_eq!(count, 2);
        assert_eq!(size, reader.remaining());

        let version: u8 = reader.read().unwrap();
        assert_eq!(version, INPUT_ATOM_SCHEMA_VERSION);
        let first: InputAtom = reader.read().unwrap();
        assert_eq!(first, atom(1));
    }
}
