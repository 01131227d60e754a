//! Per-player command frame channel.
//!
//! One [`NetChannel`] exists per connected player on the server and one,
//! for the local player, on the client. It carries two legs:
//!
//! - **Input** (client to server, unreliable). Every packet repeats a
//!   window of recent frames, so a lost packet is covered by the next one.
//!   The server side also watches for a client whose input ran dry and
//!   answers with a fault delta.
//! - **Delta** (server to client, ordered). Each packet names the server
//!   frame of the packet sent before it. The client applies a packet only
//!   when that previous frame is the last one it applied; packets that
//!   arrive early wait in an out-of-order map, duplicates are dropped.
//!
//! Local delta packets start with a [`DeltaPacketPrefix`] that is read on
//! receipt regardless of ordering. It feeds the time dilation controller and
//! triggers a hard frame reset when the client has fallen behind the server.
//!
//! The channel never owns the manager. Every operation that needs manager
//! state takes a [`ChannelHost`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::network::codec::{CodecResult, PacketReader, PacketWriter};
use crate::network::packet::{DeltaNetPacket, DeltaPacketPrefix, DeltaPacketType, InputNetPacket};
use crate::network::procedure::NetPacketProcedure;
use crate::network::transport::ChannelTransport;
use crate::report_violation_to;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{CommandFrame, OwnerId};

/// Channel state.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// Created but not attached to a manager yet.
    #[default]
    Unknown,
    /// Regular flow.
    Normal,
    /// Server side: the client's input ran dry; waiting for it to get ahead again.
    WaitCatch,
    /// Client side: a procedure requested a rewind that is being replayed.
    WaitRewind,
}

/// Manager operations a channel calls back into.
pub trait ChannelHost {
    /// The real command frame.
    fn real_command_frame(&self) -> CommandFrame;

    /// Returns `true` while frames are being replayed.
    fn is_rewinding(&self) -> bool;

    /// Server: buffers the input frames carried by `packet` for `owner`.
    fn receive_input(&mut self, owner: OwnerId, packet: &InputNetPacket);

    /// Server: frames of `owner`'s input still buffered.
    fn buffered_frames(&self, owner: OwnerId) -> u32;

    /// Client: snaps every frame counter to `frame`.
    fn reset_command_frame(&mut self, frame: CommandFrame);

    /// Client: forwards a server buffer report to the time dilation controller.
    fn update_time_dilation(&mut self, buffer_depth: u32, fault: bool);

    /// Client: the server consumed every frame up to `frame`.
    fn client_receive_command_ack(&mut self, frame: CommandFrame);

    /// Client: re-simulates every frame after `frame`.
    fn replay_frames(&mut self, frame: CommandFrame);
}

/// Per-player channel. See the [module docs](self).
pub struct NetChannel {
    owner: OwnerId,
    state: ChannelState,
    // Server: last frame sent. Client: last frame applied.
    last_server_command_frame: CommandFrame,
    last_client_command_frame: CommandFrame,
    unordered_packets: BTreeMap<CommandFrame, DeltaNetPacket>,
    procedures: BTreeMap<DeltaPacketType, Box<dyn NetPacketProcedure>>,
    transport: Box<dyn ChannelTransport>,
    observer: Option<Arc<dyn ViolationObserver>>,
    applied_deltas: u64,
}

impl fmt::Debug for NetChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetChannel")
            .field("owner", &self.owner)
            .field("state", &self.state)
            .field("last_server_command_frame", &self.last_server_command_frame)
            .field("last_client_command_frame", &self.last_client_command_frame)
            .field("unordered_packets", &self.unordered_packets.keys().collect::<Vec<_>>())
            .field("procedures", &self.procedures.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl NetChannel {
    /// Creates an unattached channel for `owner`.
    #[must_use]
    pub fn new(owner: OwnerId, transport: Box<dyn ChannelTransport>) -> Self {
        Self {
            owner,
            state: ChannelState::Unknown,
            last_server_command_frame: CommandFrame::ZERO,
            last_client_command_frame: CommandFrame::ZERO,
            unordered_packets: BTreeMap::new(),
            procedures: BTreeMap::new(),
            transport,
            observer: None,
            applied_deltas: 0,
        }
    }

    /// The player this channel belongs to.
    #[must_use]
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Server: frame of the last delta sent. Client: frame of the last delta applied.
    #[must_use]
    pub fn last_server_command_frame(&self) -> CommandFrame {
        self.last_server_command_frame
    }

    /// Server: newest client frame reported by an input packet.
    #[must_use]
    pub fn last_client_command_frame(&self) -> CommandFrame {
        self.last_client_command_frame
    }

    /// Number of delta packets waiting for their predecessor.
    #[must_use]
    pub fn unordered_len(&self) -> usize {
        self.unordered_packets.len()
    }

    /// Number of delta packets applied so far.
    #[must_use]
    pub fn applied_deltas(&self) -> u64 {
        self.applied_deltas
    }

    /// Marks the channel as attached to a manager.
    pub(crate) fn attach(&mut self, observer: Option<Arc<dyn ViolationObserver>>) {
        self.observer = observer;
        if self.state == ChannelState::Unknown {
            self.state = ChannelState::Normal;
        }
    }

    /// Replaces the outbound transport, e.g. after a reconnect.
    pub fn set_transport(&mut self, transport: Box<dyn ChannelTransport>) {
        self.transport = transport;
    }

    /// Registers `procedure` for a single procedure bit.
    ///
    /// Returns `false` if `kind` is not exactly one non-fault bit. Replaces
    /// any procedure already registered for that bit.
    pub fn register_net_packet_procedure(
        &mut self,
        kind: DeltaPacketType,
        procedure: Box<dyn NetPacketProcedure>,
    ) -> bool {
        if kind.is_fault() || kind.bits().count_ones() != 1 {
            return false;
        }
        self.procedures.insert(kind, procedure);
        true
    }

    /// Removes the procedure registered for `kind`.
    pub fn unregister_net_packet_procedure(&mut self, kind: DeltaPacketType) -> bool {
        self.procedures.remove(&kind).is_some()
    }

    /// Returns `true` if a procedure is registered for `kind`.
    #[must_use]
    pub fn has_net_packet_procedure(&self, kind: DeltaPacketType) -> bool {
        self.procedures.contains_key(&kind)
    }

    // =====================================================================
    // Client to server
    // =====================================================================

    /// Client: sends the redundant input window.
    pub fn client_send_input(&mut self, packet: &InputNetPacket) {
        tracing::trace!(
            owner = %self.owner,
            client_frame = %packet.client_command_frame,
            bytes = packet.raw_data.len(),
            "sending input packet"
        );
        self.transport.send_input(packet);
    }

    /// Server: buffers a client's input and runs fault detection.
    pub fn server_receive_input(&mut self, host: &mut dyn ChannelHost, packet: &InputNetPacket) {
        tracing::trace!(owner = %self.owner, client_frame = %packet.client_command_frame, "received input");
        self.last_client_command_frame = packet.client_command_frame;
        host.receive_input(self.owner, packet);

        let rcf = host.real_command_frame();
        let buffered = host.buffered_frames(self.owner);
        let client_frame = packet.client_command_frame;
        if self.state == ChannelState::Normal && client_frame < rcf && buffered == 0 {
            self.state = ChannelState::WaitCatch;
            report_violation_to!(
                self.observer,
                rcf,
                ViolationSeverity::Warning,
                ViolationKind::NetChannel,
                "owner {} fell behind (client frame {}, server frame {}); waiting for catch-up",
                self.owner,
                client_frame,
                rcf
            );
            self.server_send_delta(&*host, rcf, DeltaPacketType::FAULT_FRAME_EXPIRY);
        } else if self.state == ChannelState::WaitCatch && client_frame > rcf && buffered != 0 {
            tracing::debug!(owner = %self.owner, client_frame = %client_frame, "client caught up");
            self.state = ChannelState::Normal;
        }
    }

    // =====================================================================
    // Server to client
    // =====================================================================

    /// Server: sends the delta for `server_frame`, chained to the previous one.
    ///
    /// Every registered procedure writes its block. Encoding failures are
    /// reported and the packet is not sent.
    pub fn server_send_delta(
        &mut self,
        host: &dyn ChannelHost,
        server_frame: CommandFrame,
        packet_type: DeltaPacketType,
    ) {
        let mut packet = DeltaNetPacket::new(server_frame, packet_type);
        packet.prev_server_command_frame = self.last_server_command_frame;
        packet.local = true;

        let prefix = DeltaPacketPrefix {
            buffer_depth: host.buffered_frames(self.owner),
            fault: packet_type.is_fault(),
        };
        match self.write_delta_payload(&mut packet, prefix) {
            Ok(()) => {
                self.last_server_command_frame = server_frame;
                tracing::trace!(
                    owner = %self.owner,
                    server_frame = %server_frame,
                    prev = %packet.prev_server_command_frame,
                    buffer_depth = prefix.buffer_depth,
                    "sending delta packet"
                );
                self.transport.send_delta(&packet);
            },
            Err(err) => {
                report_violation_to!(
                    self.observer,
                    server_frame,
                    ViolationSeverity::Error,
                    ViolationKind::Serialization,
                    "failed to encode delta for owner {}: {}",
                    self.owner,
                    err
                );
            },
        }
    }

    fn write_delta_payload(
        &mut self,
        packet: &mut DeltaNetPacket,
        prefix: DeltaPacketPrefix,
    ) -> CodecResult<()> {
        let mut writer = PacketWriter::new();
        if packet.local {
            prefix.write(&mut writer)?;
        }
        for (kind, procedure) in &mut self.procedures {
            packet.packet_type.insert(*kind);
            let server_frame = packet.server_command_frame;
            writer.write_size_scoped(|block| procedure.on_server_net_sync(block, server_frame))?;
        }
        packet.raw_data = writer.into_bytes();
        Ok(())
    }

    /// Client: reads the prefix, then applies or buffers the packet in chain order.
    pub fn client_receive_delta(&mut self, host: &mut dyn ChannelHost, packet: DeltaNetPacket) {
        tracing::trace!(
            owner = %self.owner,
            server_frame = %packet.server_command_frame,
            prev = %packet.prev_server_command_frame,
            last = %self.last_server_command_frame,
            "received delta packet"
        );

        if packet.local {
            if let Err(err) = self.process_delta_prefix(host, &packet) {
                report_violation_to!(
                    self.observer,
                    packet.server_command_frame,
                    ViolationSeverity::Error,
                    ViolationKind::Serialization,
                    "dropping delta with unreadable prefix: {}",
                    err
                );
                return;
            }
        }

        // a tracker still at zero has nothing to chain to and takes the first packet as is
        let prev = packet.prev_server_command_frame;
        if prev == self.last_server_command_frame || self.last_server_command_frame.is_zero() {
            self.process_delta_packaged(host, packet);
            self.verify_unordered_packets(host);
        } else if prev > self.last_server_command_frame {
            tracing::debug!(owner = %self.owner, prev = %prev, "buffering out-of-order delta");
            self.unordered_packets.insert(prev, packet);
        } else {
            tracing::trace!(owner = %self.owner, prev = %prev, "dropping duplicate delta");
        }
    }

    fn process_delta_prefix(
        &mut self,
        host: &mut dyn ChannelHost,
        packet: &DeltaNetPacket,
    ) -> CodecResult<()> {
        let mut reader = PacketReader::new(&packet.raw_data);
        let prefix = DeltaPacketPrefix::read(&mut reader)?;

        if host.real_command_frame() <= packet.server_command_frame {
            self.reset_command_frame(
                host,
                packet.server_command_frame,
                packet.prev_server_command_frame,
            );
            return Ok(());
        }

        host.update_time_dilation(prefix.buffer_depth, prefix.fault);
        Ok(())
    }

    fn reset_command_frame(
        &mut self,
        host: &mut dyn ChannelHost,
        server_frame: CommandFrame,
        prev_server_frame: CommandFrame,
    ) {
        report_violation_to!(
            self.observer,
            server_frame,
            ViolationSeverity::Warning,
            ViolationKind::FrameSync,
            "client frame {} is not ahead of server frame {}; hard reset",
            host.real_command_frame(),
            server_frame
        );
        host.reset_command_frame(server_frame);
        self.last_server_command_frame = prev_server_frame;
        self.unordered_packets.retain(|key, _| *key > server_frame);
        host.update_time_dilation(0, true);
    }

    fn process_delta_packaged(&mut self, host: &mut dyn ChannelHost, packet: DeltaNetPacket) {
        let server_frame = packet.server_command_frame;
        tracing::trace!(
            owner = %self.owner,
            from = %self.last_server_command_frame,
            to = %server_frame,
            "applying delta"
        );
        self.last_server_command_frame = server_frame;
        self.applied_deltas += 1;

        if packet.local {
            host.client_receive_command_ack(server_frame);
        }

        let rewind = match self.dispatch_procedures(&packet) {
            Ok(rewind) => rewind,
            Err(err) => {
                report_violation_to!(
                    self.observer,
                    server_frame,
                    ViolationSeverity::Error,
                    ViolationKind::Serialization,
                    "delta payload for owner {} is malformed: {}",
                    self.owner,
                    err
                );
                false
            },
        };

        if rewind {
            self.state = ChannelState::WaitRewind;
            for procedure in self.procedures.values_mut() {
                procedure.on_client_rewind(server_frame);
            }
            host.replay_frames(server_frame);
        }

        self.state = ChannelState::Normal;
        self.unordered_packets.remove(&packet.prev_server_command_frame);
    }

    fn dispatch_procedures(&mut self, packet: &DeltaNetPacket) -> CodecResult<bool> {
        let mut reader = PacketReader::new(&packet.raw_data);
        if packet.local {
            let size = reader.read_size_scope()?;
            reader.skip(size)?;
        }

        let mut rewind = false;
        for kind in packet.packet_type.procedures() {
            let size = reader.read_size_scope()?;
            let mut block = reader.sub_reader(size)?;
            match self.procedures.get_mut(&kind) {
                Some(procedure) => {
                    rewind |= procedure
                        .on_client_net_sync(&mut block, packet.server_command_frame)?
                        .rewind;
                },
                None => {
                    report_violation_to!(
                        self.observer,
                        packet.server_command_frame,
                        ViolationSeverity::Warning,
                        ViolationKind::NetChannel,
                        "no procedure registered for delta bit {:#x}; skipped {} bytes",
                        kind.bits(),
                        size
                    );
                },
            }
        }
        Ok(rewind)
    }

    /// Client: applies buffered packets that are now contiguous.
    pub fn verify_unordered_packets(&mut self, host: &mut dyn ChannelHost) {
        while let Some(packet) = self.unordered_packets.remove(&self.last_server_command_frame) {
            self.process_delta_packaged(host, packet);
        }
    }

    /// Client: drops buffered packets older than the last applied frame.
    pub fn shrink_unordered_packets(&mut self) {
        let last = self.last_server_command_frame;
        self.unordered_packets.retain(|key, _| *key >= last);
    }

    /// Client: per-frame maintenance, skipped while rewinding.
    pub fn fixed_tick(&mut self, host: &mut dyn ChannelHost) {
        if host.is_rewinding() {
            return;
        }
        self.verify_unordered_packets(host);
        self.shrink_unordered_packets();
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
    use crate::network::procedure::ProcedureSync;
    use crate::network::transport::LoopbackTransport;
    use crate::telemetry::CollectingObserver;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, Default)]
    struct MockHost {
        rcf: u32,
        buffered: u32,
        rewinding: bool,
        inputs: Vec<CommandFrame>,
        resets: Vec<CommandFrame>,
        dilation: Vec<(u32, bool)>,
        acks: Vec<CommandFrame>,
        replays: Vec<CommandFrame>,
    }

    impl ChannelHost for MockHost {
        fn real_command_frame(&self) -> CommandFrame {
            CommandFrame::new(self.rcf)
        }

        fn is_rewinding(&self) -> bool {
            self.rewinding
        }

        fn receive_input(&mut self, _owner: OwnerId, packet: &InputNetPacket) {
            self.inputs.push(packet.client_command_frame);
        }

        fn buffered_frames(&self, _owner: OwnerId) -> u32 {
            self.buffered
        }

        fn reset_command_frame(&mut self, frame: CommandFrame) {
            self.rcf = frame.as_u32();
            self.resets.push(frame);
        }

        fn update_time_dilation(&mut self, buffer_depth: u32, fault: bool) {
            self.dilation.push((buffer_depth, fault));
        }

        fn client_receive_command_ack(&mut self, frame: CommandFrame) {
            self.acks.push(frame);
        }

        fn replay_frames(&mut self, frame: CommandFrame) {
            self.replays.push(frame);
        }
    }

    /// Writes the server frame; asks for a rewind when told to.
    struct EchoProcedure {
        rewind_on: Option<u32>,
        seen: Rc<RefCell<Vec<u32>>>,
        rewinds: Rc<RefCell<Vec<u32>>>,
    }

    impl NetPacketProcedure for EchoProcedure {
        fn on_server_net_sync(
            &mut self,
            writer: &mut PacketWriter,
            server_frame: CommandFrame,
        ) -> CodecResult<usize> {
            writer.write(&server_frame.as_u32())
        }

        fn on_client_net_sync(
            &mut self,
            reader: &mut PacketReader<'_>,
            _server_frame: CommandFrame,
        ) -> CodecResult<ProcedureSync> {
            let frame: u32 = reader.read()?;
            self.seen.borrow_mut().push(frame);
            Ok(ProcedureSync {
                rewind: self.rewind_on == Some(frame),
            })
        }

        fn on_client_rewind(&mut self, server_frame: CommandFrame) {
            self.rewinds.borrow_mut().push(server_frame.as_u32());
        }
    }

    fn echo(rewind_on: Option<u32>) -> (Box<EchoProcedure>, Rc<RefCell<Vec<u32>>>, Rc<RefCell<Vec<u32>>>) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let rewinds = Rc::new(RefCell::new(Vec::new()));
        let procedure = Box::new(EchoProcedure {
            rewind_on,
            seen: Rc::clone(&seen),
            rewinds: Rc::clone(&rewinds),
        });
        (procedure, seen, rewinds)
    }

    fn channel() -> (NetChannel, LoopbackTransport) {
        let (end, probe) = LoopbackTransport::pair();
        let mut channel = NetChannel::new(OwnerId::new(1), Box::new(end));
        channel.attach(None);
        (channel, probe)
    }

    /// Server-encoded chain `1..=n` with the echo procedure.
    fn chain(n: u32) -> Vec<DeltaNetPacket> {
        let (mut server, probe) = channel();
        let (procedure, _, _) = echo(None);
        server.register_net_packet_procedure(DeltaPacketType::MOVEMENT, procedure);
        let host = MockHost {
            buffered: 3,
            ..MockHost::default()
        };
        for frame in 1..=n {
            server.server_send_delta(&host, CommandFrame::new(frame), DeltaPacketType::NONE);
        }
        probe.drain_deltas()
    }

    #[test]
    fn server_stamps_chain() {
        let packets = chain(3);
        let links: Vec<(u32, u32)> = packets
            .iter()
            .map(|p| (p.server_command_frame.as_u32(), p.prev_server_command_frame.as_u32()))
            .collect();
        assert_eq!(links, vec![(1, 0), (2, 1), (3, 2)]);
        assert!(packets.iter().all(|p| p.local));
        assert!(packets[0].packet_type.contains(DeltaPacketType::MOVEMENT));
    }

    #[test]
    fn out_of_order_deltas_apply_in_chain_order() {
        let packets = chain(4);
        let (mut client, _) = channel();
        let (procedure, seen, _) = echo(None);
        client.register_net_packet_procedure(DeltaPacketType::MOVEMENT, procedure);
        let mut host = MockHost {
            rcf: 20,
            ..MockHost::default()
        };

        client.client_receive_delta(&mut host, packets[0].clone());
        client.client_receive_delta(&mut host, packets[3].clone());
        client.client_receive_delta(&mut host, packets[2].clone());
        assert_eq!(*seen.borrow(), vec![1]);
        assert_eq!(client.unordered_len(), 2);
        client.client_receive_delta(&mut host, packets[1].clone());

        assert_eq!(*seen.borrow(), vec![1, 2, 3, 4]);
        assert_eq!(client.applied_deltas(), 4);
        assert_eq!(client.unordered_len(), 0);
        assert_eq!(
            host.acks,
            (1..=4).map(CommandFrame::new).collect::<Vec<_>>()
        );
        // every local packet reports its prefix, in arrival order
        assert_eq!(host.dilation, vec![(3, false); 4]);
    }

    #[test]
    fn zero_tracker_adopts_first_packet() {
        let (mut client, _) = channel();
        let mut host = MockHost {
            rcf: 60,
            ..MockHost::default()
        };
        let mut packet = DeltaNetPacket::new(CommandFrame::new(50), DeltaPacketType::NONE);
        packet.prev_server_command_frame = CommandFrame::new(49);
        client.client_receive_delta(&mut host, packet);
        for _ in 0..5 {
            client.fixed_tick(&mut host);
        }
        assert_eq!(client.applied_deltas(), 1);
        assert_eq!(client.last_server_command_frame(), CommandFrame::new(50));
        assert_eq!(client.unordered_len(), 0);
        // non-local packets do not acknowledge input
        assert!(host.acks.is_empty());

        let mut next = DeltaNetPacket::new(CommandFrame::new(52), DeltaPacketType::NONE);
        next.prev_server_command_frame = CommandFrame::new(51);
        client.client_receive_delta(&mut host, next);
        assert_eq!(client.unordered_len(), 1);
        assert_eq!(client.applied_deltas(), 1);
    }

    #[test]
    fn duplicate_delta_is_dropped() {
        let packets = chain(3);
        let (mut client, _) = channel();
        let (procedure, seen, _) = echo(None);
        client.register_net_packet_procedure(DeltaPacketType::MOVEMENT, procedure);
        let mut host = MockHost {
            rcf: 20,
            ..MockHost::default()
        };
        for packet in &packets {
            client.client_receive_delta(&mut host, packet.clone());
        }
        client.client_receive_delta(&mut host, packets[1].clone());
        assert_eq!(*seen.borrow(), vec![1, 2, 3]);
        assert_eq!(client.last_server_command_frame(), CommandFrame::new(3));
        assert_eq!(client.unordered_len(), 0);
    }

    #[test]
    fn client_behind_server_hard_resets() {
        let packets = chain(6);
        let (mut client, _) = channel();
        let (procedure, seen, _) = echo(None);
        client.register_net_packet_procedure(DeltaPacketType::MOVEMENT, procedure);
        let mut host = MockHost {
            rcf: 2,
            ..MockHost::default()
        };

        // the client joined late; only packets from frame 5 on reach it
        client.client_receive_delta(&mut host, packets[5].clone());
        client.client_receive_delta(&mut host, packets[4].clone());

        assert_eq!(host.resets, vec![CommandFrame::new(6)]);
        assert_eq!(host.dilation, vec![(0, true), (3, false)]);
        assert_eq!(*seen.borrow(), vec![6]);
        assert_eq!(client.last_server_command_frame(), CommandFrame::new(6));
    }

    #[test]
    fn reset_discards_stale_unordered_packets() {
        let packets = chain(8);
        let (mut client, _) = channel();
        let (procedure, _, _) = echo(None);
        client.register_net_packet_procedure(DeltaPacketType::MOVEMENT, procedure);
        let mut host = MockHost {
            rcf: 20,
            ..MockHost::default()
        };
        client.client_receive_delta(&mut host, packets[0].clone()); // (1,0) seeds the tracker
        client.client_receive_delta(&mut host, packets[3].clone()); // (4,3) buffered
        client.client_receive_delta(&mut host, packets[7].clone()); // (8,7) buffered
        assert_eq!(client.unordered_len(), 2);

        host.rcf = 5;
        client.client_receive_delta(&mut host, packets[5].clone()); // (6,5): reset to 6
        assert_eq!(host.resets, vec![CommandFrame::new(6)]);
        assert_eq!(client.unordered_len(), 1);
        assert_eq!(client.last_server_command_frame(), CommandFrame::new(6));
    }

    #[test]
    fn rewind_request_replays_from_server_frame() {
        let packets = chain(2);
        let (mut client, _) = channel();
        let (procedure, _, rewinds) = echo(Some(2));
        client.register_net_packet_procedure(DeltaPacketType::MOVEMENT, procedure);
        let mut host = MockHost {
            rcf: 10,
            ..MockHost::default()
        };
        for packet in packets {
            client.client_receive_delta(&mut host, packet);
        }
        assert_eq!(*rewinds.borrow(), vec![2]);
        assert_eq!(host.replays, vec![CommandFrame::new(2)]);
        assert_eq!(client.state(), ChannelState::Normal);
    }

    #[test]
    fn missing_procedure_is_skipped() {
        let packets = chain(2);
        let (end, _) = LoopbackTransport::pair();
        let observer = Arc::new(CollectingObserver::new());
        let mut client = NetChannel::new(OwnerId::new(1), Box::new(end));
        client.attach(Some(observer.clone()));
        let mut host = MockHost {
            rcf: 10,
            ..MockHost::default()
        };
        for packet in packets {
            client.client_receive_delta(&mut host, packet);
        }
        assert_eq!(client.applied_deltas(), 2);
        assert_eq!(host.acks.len(), 2);
        crate::assert_violation!(observer, ViolationKind::NetChannel);
    }

    #[test]
    fn fixed_tick_shrinks_stale_packets() {
        let packets = chain(4);
        let (mut client, _) = channel();
        let mut host = MockHost {
            rcf: 20,
            ..MockHost::default()
        };
        client.client_receive_delta(&mut host, packets[0].clone());
        client.client_receive_delta(&mut host, packets[1].clone());
        // a stale entry keyed below the applied frame
        client
            .unordered_packets
            .insert(CommandFrame::new(1), packets[1].clone());
        client.client_receive_delta(&mut host, packets[3].clone());

        host.rewinding = true;
        client.fixed_tick(&mut host);
        assert_eq!(client.unordered_len(), 2);

        host.rewinding = false;
        client.fixed_tick(&mut host);
        assert_eq!(client.unordered_len(), 1);
        assert_eq!(client.last_server_command_frame(), CommandFrame::new(2));
    }

    #[test]
    fn server_enters_and_leaves_wait_catch() {
        let (mut server, probe) = channel();
        let observer = Arc::new(CollectingObserver::new());
        server.attach(Some(observer.clone()));
        let mut host = MockHost {
            rcf: 10,
            buffered: 0,
            ..MockHost::default()
        };
        let input = |frame| InputNetPacket {
            client_command_frame: CommandFrame::new(frame),
            raw_data: Vec::new(),
        };

        server.server_receive_input(&mut host, &input(8));
        assert_eq!(server.state(), ChannelState::WaitCatch);
        let faults = probe.drain_deltas();
        assert_eq!(faults.len(), 1);
        assert!(faults[0].packet_type.is_fault());
        assert_eq!(faults[0].server_command_frame, CommandFrame::new(10));
        crate::assert_violation!(observer, ViolationKind::NetChannel);

        // equal frames satisfy neither transition
        host.buffered = 2;
        server.server_receive_input(&mut host, &input(10));
        assert_eq!(server.state(), ChannelState::WaitCatch);

        server.server_receive_input(&mut host, &input(12));
        assert_eq!(server.state(), ChannelState::Normal);
        assert_eq!(host.inputs.len(), 3);
        assert_eq!(server.last_client_command_frame(), CommandFrame::new(12));
    }

    #[test]
    fn fault_prefix_reaches_dilation() {
        let (mut server, probe) = channel();
        let host = MockHost::default();
        server.server_send_delta(&host, CommandFrame::new(3), DeltaPacketType::FAULT_FRAME_EXPIRY);
        let packet = probe.drain_deltas().remove(0);

        let (mut client, _) = channel();
        let mut client_host = MockHost {
            rcf: 9,
            ..MockHost::default()
        };
        client.client_receive_delta(&mut client_host, packet);
        assert_eq!(client_host.dilation, vec![(0, true)]);
    }

    #[test]
    fn procedure_registration_rejects_masks() {
        let (mut channel, _) = channel();
        let (a, _, _) = echo(None);
        let (b, _, _) = echo(None);
        let (c, _, _) = echo(None);
        assert!(!channel.register_net_packet_procedure(DeltaPacketType::FAULT_FRAME_EXPIRY, a));
        assert!(!channel.register_net_packet_procedure(
            DeltaPacketType::MOVEMENT | DeltaPacketType::STATE_ABILITY_SCRIPT,
            b
        ));
        assert!(channel.register_net_packet_procedure(DeltaPacketType::STATE_ABILITY_SCRIPT, c));
        assert!(channel.has_net_packet_procedure(DeltaPacketType::STATE_ABILITY_SCRIPT));
        assert!(channel.unregister_net_packet_procedure(DeltaPacketType::STATE_ABILITY_SCRIPT));
    }
}
