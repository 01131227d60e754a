//! Payload handlers for delta packets.
//!
//! A [`NetPacketProcedure`] is registered on a [`NetChannel`](crate::NetChannel)
//! under one [`DeltaPacketType`](crate::DeltaPacketType) bit. On the server it
//! writes that bit's block into every outgoing delta; on the client it reads
//! the block back and may ask the channel to rewind and replay.

use crate::network::codec::{CodecResult, PacketReader, PacketWriter};
use crate::CommandFrame;

/// Outcome of applying one procedure block on the client.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ProcedureSync {
    /// The local simulation diverged and must be replayed from the server frame.
    pub rewind: bool,
}

impl ProcedureSync {
    /// No correction needed.
    pub const IN_SYNC: ProcedureSync = ProcedureSync { rewind: false };
    /// Replay from the server frame.
    pub const REWIND: ProcedureSync = ProcedureSync { rewind: true };
}

/// Serializes and applies one kind of delta payload.
pub trait NetPacketProcedure {
    /// Server side: appends this procedure's payload for `server_frame`.
    /// Returns the number of bytes written.
    fn on_server_net_sync(
        &mut self,
        writer: &mut PacketWriter,
        server_frame: CommandFrame,
    ) -> CodecResult<usize>;

    /// Client side: reads the payload written by [`on_server_net_sync`](Self::on_server_net_sync).
    fn on_client_net_sync(
        &mut self,
        reader: &mut PacketReader<'_>,
        server_frame: CommandFrame,
    ) -> CodecResult<ProcedureSync>;

    /// Client side: called on every procedure before a replay from `server_frame`.
    /// Restore authoritative state here.
    fn on_client_rewind(&mut self, server_frame: CommandFrame) {
        let _ = server_frame;
    }
}
