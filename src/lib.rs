//! # Command Frame Net
//!
//! A deterministic rollback networking core built around a fixed-tick
//! *command frame* loop. Each tick the [`CommandFrameManager`] records local
//! input, replicates it to the server inside a redundant window of recent
//! frames, and applies ordered delta corrections coming back from the server.
//! When a correction requires it, the manager replays every frame between
//! the rewind point and the present using the input it has already buffered.
//!
//! The crate does not own game state. Movement and ability code subscribe to
//! the ordered frame hooks, read input through their bindings, and restore
//! their own state before a replay is requested.
//!
//! ```
//! use command_frame_net::{CommandFrameConfig, CommandFrameManager, NetMode, OwnerId};
//! use command_frame_net::network::transport::LoopbackTransport;
//!
//! let mut server = CommandFrameManager::new(NetMode::DedicatedServer, CommandFrameConfig::default())
//!     .expect("default config is valid");
//! let (client_end, server_end) = LoopbackTransport::pair();
//! server.post_login(OwnerId::new(1), Box::new(server_end));
//!
//! let mut client = CommandFrameManager::new(NetMode::Client, CommandFrameConfig::default())
//!     .expect("default config is valid");
//! client.register_client_channel(OwnerId::new(1), Box::new(client_end));
//!
//! client.flush_command_frame(1.0 / 30.0 + 0.001);
//! assert_eq!(client.real_command_frame().as_u32(), 1);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use buffer::input_frame::InputFrame;
pub use buffer::ownership_queue::{CircularQueueView, OwnershipCircularQueue, OwnershipSlot};
pub use buffer::snapshot::{AttributeSnapshot, SnapshotBuffer};
pub use config::{CommandFrameConfig, TimeDilationConfig};
pub use error::CommandFrameError;
pub use hooks::{FrameHooks, FramePhase, FrameTick, HookHandle};
pub use input::atom::{
    ActionId, ActionRef, InputAtom, InputValue, InputValueType, NetHandle, TriggerEvent,
};
pub use input::binding::{BindingHandle, InputLayer, InputStack};
pub use input::source::{CommandInputQueue, InputGroup, InputSource};
pub use manager::{CommandFrameManager, ListenerHandle};
pub use network::channel::{ChannelHost, ChannelState, NetChannel};
pub use network::packet::{DeltaNetPacket, DeltaPacketPrefix, DeltaPacketType, InputNetPacket};
pub use network::procedure::{NetPacketProcedure, ProcedureSync};
pub use network::transport::{ChannelTransport, LoopbackTransport};
pub use time_dilation::{TimeDilation, TimeDilationState};

pub mod buffer {
    //! Frame-keyed storage shared by the capture, send and consume paths.

    #[doc(hidden)]
    pub mod input_frame;
    pub mod ownership_queue;
    #[doc(hidden)]
    pub mod snapshot;
}
pub mod config;
#[doc(hidden)]
pub mod error;
pub mod hooks;
pub mod input {
    //! Input atoms, the input source seam and per-player bindings.

    pub mod atom;
    pub mod binding;
    pub mod source;
}
#[doc(hidden)]
pub mod manager;
pub mod network {
    //! Wire packets, the per-connection channel and its transport seam.

    /// Binary codec for packet serialization.
    ///
    /// Centralizes the bincode configuration and the size-scoped framing
    /// used inside packet payloads.
    pub mod codec;

    pub mod channel;
    pub mod packet;
    pub mod procedure;
    pub mod transport;
}
pub mod telemetry;
#[doc(hidden)]
pub mod time_dilation;

/// Internal module exposing implementation details for testing.
///
/// # WARNING: No Stability Guarantees
///
/// **This module is NOT part of the public API.** It exists for the
/// property tests and integration tests in this repository and may change
/// without notice.
#[doc(hidden)]
pub mod __internal {
    pub use crate::buffer::ownership_queue::round_up_capacity;
    pub use crate::time_dilation::PingAverager;
}

// #############
// # CONSTANTS #
// #############

/// Smallest server-side input buffer depth the time dilation controller aims for.
pub const MIN_COMMAND_FRAMES: u32 = 4;

/// Largest server-side input buffer depth, and the input ring's frame budget.
pub const MAX_COMMAND_FRAMES: u32 = 32;

/// Upper bound on the number of frames re-sent in each input packet.
pub const MAX_REDUNDANT_COMMAND_FRAMES: u32 = 16;

/// Number of frames kept in the attribute snapshot buffer.
pub const MAX_SNAPSHOT_BUFFER_FRAMES: u32 = 32;

/// Fixed simulation rate in frames per second.
pub const FIXED_FRAME_RATE: u32 = 30;

/// Maximum number of fixed frames run for a single real tick before the
/// accumulator is dropped.
pub const MAX_FIXED_FRAMES_PER_TICK: u32 = 4;

/// A command frame is one discrete fixed-timestep simulation tick.
///
/// Frame `0` is the state before the first fixed tick; the first recorded
/// frame is `1`.
///
/// # Examples
///
/// ```
/// use command_frame_net::CommandFrame;
///
/// let frame = CommandFrame::new(9);
/// assert_eq!((frame + 1).as_u32(), 10);
/// assert_eq!(frame.saturating_sub(20), CommandFrame::ZERO);
/// assert!(frame + 1 > frame);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct CommandFrame(u32);

impl CommandFrame {
    /// The frame before any fixed tick has run.
    pub const ZERO: CommandFrame = CommandFrame(0);

    /// Creates a frame from its raw counter value.
    #[inline]
    #[must_use]
    pub const fn new(frame: u32) -> Self {
        CommandFrame(frame)
    }

    /// Returns the raw counter value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns `true` for the initial frame.
    #[inline]
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Subtracts `frames`, stopping at [`CommandFrame::ZERO`].
    #[inline]
    #[must_use]
    pub const fn saturating_sub(self, frames: u32) -> Self {
        CommandFrame(self.0.saturating_sub(frames))
    }

    /// Number of frames from `earlier` up to `self`, or zero if `earlier` is later.
    #[inline]
    #[must_use]
    pub const fn frames_since(self, earlier: CommandFrame) -> u32 {
        self.0.saturating_sub(earlier.0)
    }
}

impl std::fmt::Display for CommandFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Add<u32> for CommandFrame {
    type Output = CommandFrame;

    #[inline]
    fn add(self, rhs: u32) -> Self::Output {
        CommandFrame(self.0.wrapping_add(rhs))
    }
}

impl std::ops::AddAssign<u32> for CommandFrame {
    #[inline]
    fn add_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl From<u32> for CommandFrame {
    #[inline]
    fn from(value: u32) -> Self {
        CommandFrame(value)
    }
}

impl From<CommandFrame> for u32 {
    #[inline]
    fn from(frame: CommandFrame) -> Self {
        frame.0
    }
}

/// Identifies the player (and its connection) that owns input written into a frame.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct OwnerId(u32);

impl OwnerId {
    /// Creates an owner id.
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        OwnerId(id)
    }

    /// Returns the underlying id.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for OwnerId {
    #[inline]
    fn from(value: u32) -> Self {
        OwnerId(value)
    }
}

// #############
// #   ENUMS   #
// #############

/// Which side of the connection a [`CommandFrameManager`] runs on.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NetMode {
    /// Captures local input, sends it to the server and applies delta corrections.
    Client,
    /// Consumes buffered client input and sends delta packets to every channel.
    DedicatedServer,
    /// Runs the frame loop and hooks without any networking.
    #[default]
    Standalone,
}

impl NetMode {
    /// Returns `true` for [`NetMode::Client`].
    #[inline]
    #[must_use]
    pub const fn is_client(self) -> bool {
        matches!(self, NetMode::Client)
    }

    /// Returns `true` for [`NetMode::DedicatedServer`].
    #[inline]
    #[must_use]
    pub const fn is_dedicated_server(self) -> bool {
        matches!(self, NetMode::DedicatedServer)
    }
}

// ###################
// # UNIT TESTS      #
// ###################

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    // ==========================================
    // CommandFrame Tests
    // ==========================================

    #[test]
    fn command_frame_arithmetic() {
        let mut frame = CommandFrame::new(3);
        frame += 2;
        assert_eq!(frame, CommandFrame::new(5));
        assert_eq!(frame + 1, CommandFrame::new(6));
        assert_eq!(frame.saturating_sub(10), CommandFrame::ZERO);
        assert_eq!(frame.frames_since(CommandFrame::new(2)), 3);
        assert_eq!(CommandFrame::new(2).frames_since(frame), 0);
    }

    #[test]
    fn command_frame_conversions() {
        let frame: CommandFrame = 42u32.into();
        let raw: u32 = frame.into();
        assert_eq!(raw, 42);
        assert_eq!(frame.to_string(), "42");
        assert!(CommandFrame::default().is_zero());
    }

    #[test]
    fn command_frame_ordering() {
        assert!(CommandFrame::new(1) < CommandFrame::new(2));
        assert_eq!(
            CommandFrame::new(4).max(CommandFrame::new(9)),
            CommandFrame::new(9)
        );
    }

    // ==========================================
    // OwnerId / NetMode Tests
    // ==========================================

    #[test]
    fn owner_id_display_and_order() {
        let a = OwnerId::new(1);
        let b = OwnerId::from(2);
        assert!(a < b);
        assert_eq!(format!("{a}"), "1");
        assert_eq!(b.as_u32(), 2);
    }

    #[test]
    fn net_mode_helpers() {
        assert!(NetMode::Client.is_client());
        assert!(!NetMode::Client.is_dedicated_server());
        assert!(NetMode::DedicatedServer.is_dedicated_server());
        assert_eq!(NetMode::default(), NetMode::Standalone);
    }

    #[test]
    fn constants_are_consistent() {
        assert!(MIN_COMMAND_FRAMES < MAX_COMMAND_FRAMES);
        assert!(MAX_REDUNDANT_COMMAND_FRAMES <= MAX_COMMAND_FRAMES);
        assert!(FIXED_FRAME_RATE > 0);
        assert!(MAX_FIXED_FRAMES_PER_TICK > 0);
    }
}
