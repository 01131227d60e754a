//! Wire packets exchanged by [`NetChannel`](crate::NetChannel)s.
//!
//! - [`InputNetPacket`] (client to server, unreliable): the client's latest
//!   frame plus a redundant window of recent [`InputFrame`] blocks.
//! - [`DeltaNetPacket`] (server to client, ordered): a server frame chained
//!   to the previous one, carrying procedure payloads. Packets for the
//!   owning connection start with a [`DeltaPacketPrefix`].

use serde::{Deserialize, Serialize};

use crate::buffer::input_frame::InputFrame;
use crate::buffer::ownership_queue::{CircularQueueView, OwnershipCircularQueue};
use crate::input::atom::INPUT_ATOM_SCHEMA_VERSION;
use crate::network::codec::{self, CodecError, CodecOperation, CodecResult, PacketReader, PacketWriter};
use crate::{CommandFrame, InputAtom, OwnerId};

/// Bitmask describing what a [`DeltaNetPacket`] carries.
///
/// The low 28 bits select payload procedures; the high nibble holds fault flags.
#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct DeltaPacketType(u32);

impl DeltaPacketType {
    /// No payload.
    pub const NONE: DeltaPacketType = DeltaPacketType(0);
    /// Movement corrections.
    pub const MOVEMENT: DeltaPacketType = DeltaPacketType(1);
    /// Ability state corrections.
    pub const STATE_ABILITY_SCRIPT: DeltaPacketType = DeltaPacketType(1 << 1);
    /// The client's input for the current server frame expired.
    pub const FAULT_FRAME_EXPIRY: DeltaPacketType = DeltaPacketType(0x1000_0000);
    /// Every fault bit.
    pub const FAULT_MASK: DeltaPacketType = DeltaPacketType(0xF000_0000);

    /// Wraps raw bits.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        DeltaPacketType(bits)
    }

    /// A single procedure bit. Returns `None` for fault-range indices.
    #[must_use]
    pub const fn procedure(index: u32) -> Option<Self> {
        if index < 28 {
            Some(DeltaPacketType(1 << index))
        } else {
            None
        }
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns `true` if every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: DeltaPacketType) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets the bits of `other`.
    pub fn insert(&mut self, other: DeltaPacketType) {
        self.0 |= other.0;
    }

    /// Returns `true` if any fault bit is set.
    #[must_use]
    pub const fn is_fault(self) -> bool {
        self.0 & Self::FAULT_MASK.0 != 0
    }

    /// Returns `true` if no bit is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The set procedure bits, lowest first.
    pub fn procedures(self) -> impl Iterator<Item = DeltaPacketType> {
        (0..28)
            .map(|index| DeltaPacketType(1 << index))
            .filter(move |bit| self.contains(*bit))
    }
}

impl std::ops::BitOr for DeltaPacketType {
    type Output = DeltaPacketType;

    fn bitor(self, rhs: Self) -> Self::Output {
        DeltaPacketType(self.0 | rhs.0)
    }
}

/// Telemetry at the start of every local delta payload.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeltaPacketPrefix {
    /// Frames of the owner's input the server still holds.
    pub buffer_depth: u32,
    /// Set when the packet carries a fault.
    pub fault: bool,
}

impl DeltaPacketPrefix {
    /// Writes the prefix as a size-scoped block.
    pub fn write(&self, writer: &mut PacketWriter) -> CodecResult<usize> {
        writer.write_size_scoped(|block| {
            let written = block.write(&self.buffer_depth)?;
            Ok(written + block.write(&self.fault)?)
        })
    }

    /// Reads a prefix block, skipping any trailing bytes inside it.
    pub fn read(reader: &mut PacketReader<'_>) -> CodecResult<Self> {
        let size = reader.read_size_scope()?;
        let mut block = reader.sub_reader(size)?;
        let buffer_depth = block.read()?;
        let fault = block.read()?;
        Ok(Self {
            buffer_depth,
            fault,
        })
    }
}

/// Server to client correction packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaNetPacket {
    /// The server frame this packet describes.
    pub server_command_frame: CommandFrame,
    /// The server frame of the previous packet on the same channel.
    pub prev_server_command_frame: CommandFrame,
    /// Set for the connection that owns the channel.
    pub local: bool,
    /// Payload and fault bits.
    pub packet_type: DeltaPacketType,
    /// Prefix (local only) followed by one size-scoped block per procedure bit.
    pub raw_data: Vec<u8>,
}

impl DeltaNetPacket {
    /// Creates an empty packet for `server_command_frame`.
    #[must_use]
    pub fn new(server_command_frame: CommandFrame, packet_type: DeltaPacketType) -> Self {
        Self {
            server_command_frame,
            prev_server_command_frame: CommandFrame::ZERO,
            local: false,
            packet_type,
            raw_data: Vec::new(),
        }
    }

    /// Encodes the packet for the wire.
    pub fn to_bytes(&self) -> CodecResult<Vec<u8>> {
        codec::encode(self)
    }

    /// Decodes a packet from the wire.
    pub fn from_bytes(bytes: &[u8]) -> CodecResult<Self> {
        codec::decode_value(bytes)
    }
}

/// Supplies storage for the frames of a redundant input window.
pub trait InputFrameAllocator {
    /// Returns `false` if `frame` is already stored or too old to take.
    fn accepts(&self, frame: CommandFrame) -> bool;

    /// Stores the decoded atoms for `frame`. Returns `false` if rejected.
    fn store(&mut self, frame: CommandFrame, atoms: &[InputAtom]) -> bool;
}

/// Allocates decoded frames for one owner in an input ring.
#[derive(Debug)]
pub struct OwnerFrameAllocator<'a> {
    queue: &'a mut OwnershipCircularQueue<InputFrame>,
    owner: OwnerId,
}

impl<'a> OwnerFrameAllocator<'a> {
    /// Writes into `queue` on behalf of `owner`.
    #[must_use]
    pub fn new(queue: &'a mut OwnershipCircularQueue<InputFrame>, owner: OwnerId) -> Self {
        Self { queue, owner }
    }
}

impl InputFrameAllocator for OwnerFrameAllocator<'_> {
    fn accepts(&self, frame: CommandFrame) -> bool {
        self.queue.can_claim(&self.owner, frame)
    }

    fn store(&mut self, frame: CommandFrame, atoms: &[InputAtom]) -> bool {
        self.queue.record_item_data(self.owner, atoms, frame)
    }
}

/// Client to server input packet.
///
/// ```
/// use command_frame_net::{CommandFrame, InputFrame, InputNetPacket, OwnershipCircularQueue, OwnerId};
/// use command_frame_net::network::packet::OwnerFrameAllocator;
///
/// let owner = OwnerId::new(1);
/// let mut client: OwnershipCircularQueue<InputFrame> = OwnershipCircularQueue::new(32);
/// for frame in 1..=3 {
///     client.allocate_item_data(owner, 0, CommandFrame::new(frame));
/// }
/// let packet = InputNetPacket::build_from_view(client.read_range_data_shrink(CommandFrame::new(3), 16))
///     .expect("encoding should succeed");
///
/// let mut server: OwnershipCircularQueue<InputFrame> = OwnershipCircularQueue::new(32);
/// let accepted = packet
///     .read_redundant_data(&mut OwnerFrameAllocator::new(&mut server, owner))
///     .expect("decoding should succeed");
/// assert_eq!(accepted, 3);
/// assert_eq!(packet.client_command_frame, CommandFrame::new(3));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputNetPacket {
    /// The newest frame in the window.
    pub client_command_frame: CommandFrame,
    /// Concatenated frame blocks, oldest first.
    pub raw_data: Vec<u8>,
}

impl InputNetPacket {
    /// Packs every written frame of `view`, reusing each frame's cached block.
    ///
    /// Gap frames that no owner wrote carry nothing and are left out.
    pub fn build_from_view(view: CircularQueueView<'_, InputFrame>) -> CodecResult<Self> {
        let mut writer = PacketWriter::new();
        for frame in view.iter().filter(|frame| frame.owners().next().is_some()) {
            writer.write_raw(frame.shared_serialization()?);
        }
        Ok(Self {
            client_command_frame: view.last_frame().unwrap_or_default(),
            raw_data: writer.into_bytes(),
        })
    }

    /// Decodes the window, asking `allocator` for storage per frame.
    ///
    /// Frames the allocator declines are skipped by their declared size.
    /// Returns the number of frames decoded.
    pub fn read_redundant_data<A>(&self, allocator: &mut A) -> CodecResult<usize>
    where
        A: InputFrameAllocator + ?Sized,
    {
        let mut reader = PacketReader::new(&self.raw_data);
        let mut accepted = 0;
        while !reader.is_exhausted() {
            let frame = CommandFrame::new(reader.read::<u32>()?);
            let declared: i32 = reader.read()?;
            let count = usize::try_from(declared).map_err(|_| {
                CodecError::decode(
                    format!("negative atom count {declared} for frame {frame}"),
                    CodecOperation::DecodePacket,
                )
            })?;
            let size = reader.read_size_scope()?;
            // every atom takes at least one byte after the version byte
            if count > size.saturating_sub(1) {
                return Err(CodecError::decode(
                    format!("{count} atoms cannot fit a {size} byte block for frame {frame}"),
                    CodecOperation::DecodePacket,
                ));
            }

            if !allocator.accepts(frame) {
                reader.skip(size)?;
                continue;
            }
            let atoms = Self::decode_block(reader.sub_reader(size)?, count)?;
            if allocator.store(frame, &atoms) {
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    /// Decodes a whole atom block before anything is stored.
    fn decode_block(mut block: PacketReader<'_>, count: usize) -> CodecResult<Vec<InputAtom>> {
        let version: u8 = block.read()?;
        if version != INPUT_ATOM_SCHEMA_VERSION {
            return Err(CodecError::decode(
                format!("input atom schema {version} is not supported"),
                CodecOperation::DecodePacket,
            ));
        }
        let mut atoms = Vec::with_capacity(count);
        for _ in 0..count {
            atoms.push(block.read()?);
        }
        Ok(atoms)
    }

    /// Encodes the packet for the wire.
    pub fn to_bytes(&self) -> CodecResult<Vec<u8>> {
        codec::encode(self)
    }

    /// Decodes a packet from the wire.
    pub fn from_bytes(bytes: &[u8]) -> CodecResult<Self> {
        codec::decode_value(bytes)
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
    use crate::buffer::ownership_queue::OwnershipSlot;
    use crate::{ActionId, InputValue, TriggerEvent};

    const OWNER: OwnerId = OwnerId::new(7);

    fn atom(id: u32) -> InputAtom {
        InputAtom::new(
            ActionId::new(id),
            TriggerEvent::Started,
            InputValue::axis2d(id as f32, 0.5),
        )
    }

    fn client_ring(frames: std::ops::RangeInclusive<u32>) -> OwnershipCircularQueue<InputFrame> {
        let mut queue = OwnershipCircularQueue::new(32);
        for n in frames {
            assert!(queue.record_item_data(OWNER, &[atom(n), atom(n + 100)], CommandFrame::new(n)));
        }
        queue
    }

    #[test]
    fn packet_type_bits() {
        let mut kind = DeltaPacketType::MOVEMENT;
        kind.insert(DeltaPacketType::FAULT_FRAME_EXPIRY);
        assert!(kind.is_fault());
        assert!(kind.contains(DeltaPacketType::MOVEMENT));
        assert!(!kind.contains(DeltaPacketType::STATE_ABILITY_SCRIPT));
        let all = DeltaPacketType::MOVEMENT | DeltaPacketType::STATE_ABILITY_SCRIPT;
        let bits: Vec<u32> = all.procedures().map(DeltaPacketType::bits).collect();
        assert_eq!(bits, vec![1, 2]);
        assert_eq!(DeltaPacketType::procedure(28), None);
        assert!(!DeltaPacketType::MOVEMENT.is_fault());
    }

    #[test]
    fn prefix_survives_trailing_fields() {
        let mut writer = PacketWriter::new();
        writer
            .write_size_scoped(|block| {
                let mut n = block.write(&9u32)?;
                n += block.write(&true)?;
                n += block.write(&0xABCDu16)?;
                Ok(n)
            })
            .unwrap();
        writer.write(&42u32).unwrap();
        let bytes = writer.into_bytes();
        let mut reader = PacketReader::new(&bytes);
        let prefix = DeltaPacketPrefix::read(&mut reader).unwrap();
        assert_eq!(
            prefix,
            DeltaPacketPrefix {
                buffer_depth: 9,
                fault: true
            }
        );
        assert_eq!(reader.read::<u32>().unwrap(), 42);
    }

    #[test]
    fn window_decodes_into_empty_ring() {
        let client = client_ring(1..=5);
        let packet =
            InputNetPacket::build_from_view(client.read_range_data_shrink(CommandFrame::new(5), 3))
                .unwrap();
        assert_eq!(packet.client_command_frame, CommandFrame::new(5));

        let mut server = OwnershipCircularQueue::new(32);
        let accepted = packet
            .read_redundant_data(&mut OwnerFrameAllocator::new(&mut server, OWNER))
            .unwrap();
        assert_eq!(accepted, 3);
        assert!(server.read_data(CommandFrame::new(2)).unwrap().atoms().is_empty());
        for n in 3..=5 {
            let frame = server.read_data(CommandFrame::new(n)).unwrap();
            assert_eq!(frame.atoms_for(OWNER).unwrap(), &[atom(n), atom(n + 100)]);
        }
    }

    #[test]
    fn already_buffered_frames_are_skipped() {
        let client = client_ring(1..=6);
        let first =
            InputNetPacket::build_from_view(client.read_range_data_shrink(CommandFrame::new(4), 4))
                .unwrap();
        let second =
            InputNetPacket::build_from_view(client.read_range_data_shrink(CommandFrame::new(6), 4))
                .unwrap();

        let mut server = OwnershipCircularQueue::new(32);
        let mut allocator = OwnerFrameAllocator::new(&mut server, OWNER);
        assert_eq!(first.read_redundant_data(&mut allocator).unwrap(), 4);
        assert_eq!(second.read_redundant_data(&mut allocator).unwrap(), 2);
        assert_eq!(server.count_owner(&OWNER), 6);
        assert_eq!(
            server.read_data(CommandFrame::new(6)).unwrap().atoms_for(OWNER).unwrap(),
            &[atom(6), atom(106)]
        );
    }

    #[test]
    fn gap_frames_are_not_sent() {
        let mut client = OwnershipCircularQueue::new(32);
        assert!(client.record_item_data(OWNER, &[atom(2)], CommandFrame::new(2)));
        assert!(client.record_item_data(OWNER, &[atom(5)], CommandFrame::new(5)));
        let packet =
            InputNetPacket::build_from_view(client.read_range_data_shrink(CommandFrame::new(5), 16))
                .unwrap();

        let mut server = OwnershipCircularQueue::new(32);
        let accepted = packet
            .read_redundant_data(&mut OwnerFrameAllocator::new(&mut server, OWNER))
            .unwrap();
        assert_eq!(accepted, 2);
        assert_eq!(server.count_owner(&OWNER), 2);
        assert!(server.read_data(CommandFrame::new(3)).unwrap().atoms_for(OWNER).is_none());
        assert_eq!(
            server.read_data(CommandFrame::new(5)).unwrap().atoms_for(OWNER).unwrap(),
            &[atom(5)]
        );
    }

    #[test]
    fn blocks_are_cached_per_frame() {
        let client = client_ring(1..=3);
        let view = client.read_range_data_shrink(CommandFrame::new(3), 3);
        assert!(view.iter().all(|frame| !frame.has_cached_serialization()));
        let once = InputNetPacket::build_from_view(view).unwrap();
        assert!(view.iter().all(InputFrame::has_cached_serialization));
        let twice = InputNetPacket::build_from_view(view).unwrap();
        assert_eq!(once, twice);
        assert_eq!(view.get(0).map(OwnershipSlot::command_frame), Some(CommandFrame::new(1)));
    }

    #[test]
    fn unsupported_schema_is_rejected() {
        let mut writer = PacketWriter::new();
        writer.write(&1u32).unwrap();
        writer.write(&1i32).unwrap();
        writer
            .write_size_scoped(|block| {
                let mut n = block.write(&(INPUT_ATOM_SCHEMA_VERSION + 1))?;
                n += block.write(&atom(1))?;
                Ok(n)
            })
            .unwrap();
        let packet = InputNetPacket {
            client_command_frame: CommandFrame::new(1),
            raw_data: writer.into_bytes(),
        };
        let mut server = OwnershipCircularQueue::new(32);
        let result = packet.read_redundant_data(&mut OwnerFrameAllocator::new(&mut server, OWNER));
        assert!(matches!(result, Err(CodecError::DecodeError { .. })));
    }

    fn block_with_count(frame: u32, declared: i32, atoms: &[InputAtom]) -> InputNetPacket {
        let mut writer = PacketWriter::new();
        writer.write(&frame).unwrap();
        writer.write(&declared).unwrap();
        writer
            .write_size_scoped(|block| {
                let mut n = block.write(&INPUT_ATOM_SCHEMA_VERSION)?;
                for atom in atoms {
                    n += block.write(atom)?;
                }
                Ok(n)
            })
            .unwrap();
        InputNetPacket {
            client_command_frame: CommandFrame::new(frame),
            raw_data: writer.into_bytes(),
        }
    }

    #[test]
    fn malformed_block_leaves_frame_open_for_a_later_copy() {
        let mut server = OwnershipCircularQueue::new(32);
        let short = block_with_count(4, 3, &[atom(5)]);
        assert!(short
            .read_redundant_data(&mut OwnerFrameAllocator::new(&mut server, OWNER))
            .is_err());
        assert_eq!(server.count_owner(&OWNER), 0);
        assert!(server
            .read_data(CommandFrame::new(4))
            .and_then(|f| f.atoms_for(OWNER))
            .is_none());

        let valid = block_with_count(4, 1, &[atom(5)]);
        let accepted = valid
            .read_redundant_data(&mut OwnerFrameAllocator::new(&mut server, OWNER))
            .unwrap();
        assert_eq!(accepted, 1);
        assert_eq!(server.count_owner(&OWNER), 1);
        assert_eq!(
            server.read_data(CommandFrame::new(4)).unwrap().atoms_for(OWNER).unwrap(),
            &[atom(5)]
        );
    }

    #[test]
    fn oversized_atom_count_is_rejected_before_allocating() {
        let mut server = OwnershipCircularQueue::new(32);
        let packet = block_with_count(2, i32::MAX, &[atom(1)]);
        let result = packet.read_redundant_data(&mut OwnerFrameAllocator::new(&mut server, OWNER));
        assert!(matches!(result, Err(CodecError::DecodeError { .. })));
        assert!(server.is_empty());
        assert_eq!(server.count_owner(&OWNER), 0);
    }

    #[test]
    fn truncated_window_is_an_error() {
        let client = client_ring(1..=2);
        let mut packet =
            InputNetPacket::build_from_view(client.read_range_data_shrink(CommandFrame::new(2), 2))
                .unwrap();
        packet.raw_data.truncate(packet.raw_data.len() - 3);
        let mut server = OwnershipCircularQueue::new(32);
        assert!(packet
            .read_redundant_data(&mut OwnerFrameAllocator::new(&mut server, OWNER))
            .is_err());
    }

    #[test]
    fn packets_cross_the_wire() {
        let mut delta = DeltaNetPacket::new(CommandFrame::new(12), DeltaPacketType::MOVEMENT);
        delta.prev_server_command_frame = CommandFrame::new(11);
        delta.local = true;
        delta.raw_data = vec![1, 2, 3];
        let decoded = DeltaNetPacket::from_bytes(&delta.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, delta);

        let input = InputNetPacket {
            client_command_frame: CommandFrame::new(4),
            raw_data: vec![9; 5],
        };
        assert_eq!(InputNetPacket::from_bytes(&input.to_bytes().unwrap()).unwrap(), input);
    }
}
