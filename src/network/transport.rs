//! The seam between a [`NetChannel`](crate::NetChannel) and the socket layer.
//!
//! A channel only ever pushes packets out through its [`ChannelTransport`].
//! Delivery is the transport owner's job: received packets are handed back
//! to the manager with
//! [`server_receive_input`](crate::CommandFrameManager::server_receive_input) and
//! [`client_receive_delta`](crate::CommandFrameManager::client_receive_delta).
//!
//! [`LoopbackTransport`] is an in-memory pair for tests and local play. Both
//! ends share one queue per direction, so a test can hold a clone of either
//! end, drop or reorder what it drains, and deliver the rest by hand.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::network::packet::{DeltaNetPacket, InputNetPacket};
use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};

/// Outbound leg of a channel.
///
/// Sends never block and never fail from the caller's point of view; a
/// transport that cannot deliver a packet drops it, the same as a lossy link.
pub trait ChannelTransport {
    /// Client to server, unreliable.
    fn send_input(&mut self, packet: &InputNetPacket);

    /// Server to client, reliable.
    fn send_delta(&mut self, packet: &DeltaNetPacket);
}

#[derive(Debug, Default)]
struct LoopbackQueues {
    inputs: VecDeque<Vec<u8>>,
    deltas: VecDeque<Vec<u8>>,
}

/// In-memory transport. Packets are encoded on send and decoded on drain.
///
/// ```
/// use command_frame_net::{ChannelTransport, CommandFrame, InputNetPacket, LoopbackTransport};
///
/// let (mut client_end, server_end) = LoopbackTransport::pair();
/// client_end.send_input(&InputNetPacket {
///     client_command_frame: CommandFrame::new(3),
///     raw_data: Vec::new(),
/// });
/// let received = server_end.drain_inputs();
/// assert_eq!(received.len(), 1);
/// assert_eq!(received[0].client_command_frame, CommandFrame::new(3));
/// ```
#[derive(Debug, Clone, Default)]
pub struct LoopbackTransport {
    queues: Arc<Mutex<LoopbackQueues>>,
}

impl LoopbackTransport {
    /// Creates two connected ends, conventionally `(client_end, server_end)`.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let end = Self::default();
        (end.clone(), end)
    }

    /// Takes every queued input packet, oldest first.
    #[must_use]
    pub fn drain_inputs(&self) -> Vec<InputNetPacket> {
        let encoded: Vec<Vec<u8>> = self.queues.lock().inputs.drain(..).collect();
        encoded
            .iter()
            .filter_map(|bytes| match InputNetPacket::from_bytes(bytes) {
                Ok(packet) => Some(packet),
                Err(err) => {
                    report_violation!(
                        ViolationSeverity::Error,
                        ViolationKind::Serialization,
                        "dropping undecodable input packet: {}",
                        err
                    );
                    None
                },
            })
            .collect()
    }

    /// Takes every queued delta packet, oldest first.
    #[must_use]
    pub fn drain_deltas(&self) -> Vec<DeltaNetPacket> {
        let encoded: Vec<Vec<u8>> = self.queues.lock().deltas.drain(..).collect();
        encoded
            .iter()
            .filter_map(|bytes| match DeltaNetPacket::from_bytes(bytes) {
                Ok(packet) => Some(packet),
                Err(err) => {
                    report_violation!(
                        ViolationSeverity::Error,
                        ViolationKind::Serialization,
                        "dropping undecodable delta packet: {}",
                        err
                    );
                    None
                },
            })
            .collect()
    }

    /// Number of input packets waiting to be drained.
    #[must_use]
    pub fn pending_inputs(&self) -> usize {
        self.queues.lock().inputs.len()
    }

    /// Number of delta packets waiting to be drained.
    #[must_use]
    pub fn pending_deltas(&self) -> usize {
        self.queues.lock().deltas.len()
    }
}

impl ChannelTransport for LoopbackTransport {
    fn send_input(&mut self, packet: &InputNetPacket) {
        match packet.to_bytes() {
            Ok(bytes) => self.queues.lock().inputs.push_back(bytes),
            Err(err) => report_violation!(
                ViolationSeverity::Error,
                ViolationKind::Serialization,
                "failed to encode input packet: {}",
                err
            ),
        }
    }

    fn send_delta(&mut self, packet: &DeltaNetPacket) {
        match packet.to_bytes() {
            Ok(bytes) => self.queues.lock().deltas.push_back(bytes),
            Err(err) => report_violation!(
                ViolationSeverity::Error,
                ViolationKind::Serialization,
                "failed to encode delta packet: {}",
                err
            ),
        }
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
    use crate::{CommandFrame, DeltaPacketType};

    #[test]
    fn ends_share_queues() {
        let (mut client_end, mut server_end) = LoopbackTransport::pair();
        let observer = server_end.clone();

        client_end.send_input(&InputNetPacket {
            client_command_frame: CommandFrame::new(1),
            raw_data: vec![1, 2],
        });
        server_end.send_delta(&DeltaNetPacket::new(CommandFrame::new(2), DeltaPacketType::NONE));

        assert_eq!(observer.pending_inputs(), 1);
        assert_eq!(observer.pending_deltas(), 1);
        let deltas = client_end.drain_deltas();
        assert_eq!(deltas[0].server_command_frame, CommandFrame::new(2));
        assert_eq!(server_end.drain_inputs()[0].raw_data, vec![1, 2]);
        assert_eq!(observer.pending_inputs(), 0);
    }

    #[test]
    fn drain_preserves_send_order() {
        let (mut client_end, server_end) = LoopbackTransport::pair();
        for n in 1..=3 {
            client_end.send_input(&InputNetPacket {
                client_command_frame: CommandFrame::new(n),
                raw_data: Vec::new(),
            });
        }
        let frames: Vec<u32> = server_end
            .drain_inputs()
            .iter()
            .map(|packet| packet.client_command_frame.as_u32())
            .collect();
        assert_eq!(frames, vec![1, 2, 3]);
    }
}
