//! Shared test utilities for integration tests.
//!
//! This module provides common helpers that are used across multiple test
//! files to avoid duplication.
//!
//! # Frame Stepping
//!
//! [`advance`] runs exactly one fixed frame by feeding the scheduler half
//! steps until the real frame moves. This keeps long runs free of the
//! floating point drift that fixed-size deltas accumulate, and works under
//! any time dilation below 2x.
//!
//! # Loopback Sessions
//!
//! [`LoopbackSession`] wires one dedicated server and one client together.
//! Packets sit in the shared loopback queues until a test delivers them, so
//! tests can drop, duplicate or reorder them freely:
//!
//! ```ignore
//! let mut session = LoopbackSession::new(CommandFrameConfig::default());
//! session.lead_client(3);
//! for _ in 0..10 {
//!     session.tick();
//! }
//! ```

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use std::sync::Arc;

use command_frame_net::network::codec::{CodecResult, PacketReader, PacketWriter};
use command_frame_net::telemetry::CollectingObserver;
use command_frame_net::{
    ActionId, CommandFrame, CommandFrameConfig, CommandFrameManager, DeltaNetPacket, InputAtom,
    InputSource, InputValue, LoopbackTransport, NetMode, NetPacketProcedure, OwnerId,
    ProcedureSync, TriggerEvent,
};

/// Action used by the movement atoms in these tests.
#[allow(dead_code)]
pub const MOVE_ACTION: ActionId = ActionId::new(7);

/// Upper bound on half-step flushes per frame before [`advance`] gives up.
const MAX_FLUSHES_PER_FRAME: usize = 16;

/// Installs a `tracing` subscriber that writes through the test harness.
///
/// Safe to call from every test; only the first call installs it.
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// A triggered movement atom carrying `value`.
#[allow(dead_code)]
#[must_use]
pub fn move_atom(value: f32) -> InputAtom {
    InputAtom::new(MOVE_ACTION, TriggerEvent::Triggered, InputValue::axis1d(value))
}

/// Runs exactly one fixed frame.
///
/// # Panics
///
/// Panics if the manager does not advance, e.g. a client without a local owner.
pub fn advance<S: InputSource>(manager: &mut CommandFrameManager<S>) {
    let target = manager.real_command_frame() + 1;
    let half_step = manager.config().fixed_delta_seconds() * 0.5;
    for _ in 0..MAX_FLUSHES_PER_FRAME {
        if manager.real_command_frame() >= target {
            return;
        }
        manager.flush_command_frame(half_step);
    }
    assert!(
        manager.real_command_frame() >= target,
        "manager stuck at frame {} (target {})",
        manager.real_command_frame(),
        target
    );
}

/// Runs `frames` fixed frames.
#[allow(dead_code)]
pub fn advance_by<S: InputSource>(manager: &mut CommandFrameManager<S>, frames: u32) {
    for _ in 0..frames {
        advance(manager);
    }
}

/// A dedicated server and one client joined by a loopback link.
#[allow(dead_code)]
pub struct LoopbackSession {
    pub server: CommandFrameManager,
    pub client: CommandFrameManager,
    pub owner: OwnerId,
    /// Both ends of the link share these queues.
    pub link: LoopbackTransport,
    pub server_observer: Arc<CollectingObserver>,
    pub client_observer: Arc<CollectingObserver>,
}

#[allow(dead_code)]
impl LoopbackSession {
    /// Creates both managers and registers player 1 on each side.
    ///
    /// # Panics
    ///
    /// Panics if `config` is invalid.
    #[must_use]
    pub fn new(config: CommandFrameConfig) -> Self {
        let owner = OwnerId::new(1);
        let server_observer = Arc::new(CollectingObserver::new());
        let client_observer = Arc::new(CollectingObserver::new());

        let mut server = CommandFrameManager::new(NetMode::DedicatedServer, config)
            .expect("server config")
            .with_violation_observer(server_observer.clone());
        let mut client = CommandFrameManager::new(NetMode::Client, config)
            .expect("client config")
            .with_violation_observer(client_observer.clone());

        let (client_end, server_end) = LoopbackTransport::pair();
        let link = client_end.clone();
        server.post_login(owner, Box::new(server_end));
        client.register_client_channel(owner, Box::new(client_end));

        Self {
            server,
            client,
            owner,
            link,
            server_observer,
            client_observer,
        }
    }

    /// Hands every queued input packet to the server. Returns how many were delivered.
    pub fn deliver_inputs(&mut self) -> usize {
        let packets = self.link.drain_inputs();
        for packet in &packets {
            self.server
                .server_receive_input(self.owner, packet)
                .expect("server channel registered");
        }
        packets.len()
    }

    /// Discards every queued input packet. Returns how many were dropped.
    pub fn drop_inputs(&mut self) -> usize {
        self.link.drain_inputs().len()
    }

    /// Takes every queued delta packet without delivering it.
    #[must_use]
    pub fn take_deltas(&mut self) -> Vec<DeltaNetPacket> {
        self.link.drain_deltas()
    }

    /// Hands `packet` to the client.
    pub fn deliver_delta(&mut self, packet: DeltaNetPacket) {
        self.client
            .client_receive_delta(self.owner, packet)
            .expect("client channel registered");
    }

    /// Hands every queued delta packet to the client. Returns how many were delivered.
    pub fn deliver_deltas(&mut self) -> usize {
        let packets = self.take_deltas();
        let delivered = packets.len();
        for packet in packets {
            self.deliver_delta(packet);
        }
        delivered
    }

    /// Runs the client `frames` ahead and delivers its input.
    pub fn lead_client(&mut self, frames: u32) {
        advance_by(&mut self.client, frames);
        self.deliver_inputs();
    }

    /// One frame on both sides, with every packet delivered in order.
    pub fn tick(&mut self) {
        advance(&mut self.client);
        self.deliver_inputs();
        advance(&mut self.server);
        self.deliver_deltas();
    }

    /// Number of input frames the server holds for the client.
    #[must_use]
    pub fn server_buffered(&self) -> u32 {
        self.server.buffered_frames(self.owner)
    }
}

/// Delta procedure that ships the server frame and records what the client saw.
///
/// Clones share their logs, so a test keeps one clone and registers the other.
#[allow(dead_code)]
#[derive(Debug, Default, Clone)]
pub struct RecordingProcedure {
    /// Server frames the client read, in application order.
    pub synced: Rc<RefCell<Vec<u32>>>,
    /// Server frames passed to `on_client_rewind`.
    pub rewinds: Rc<RefCell<Vec<u32>>>,
    /// Server frames for which the client requests a rewind.
    pub rewind_on: Rc<RefCell<BTreeSet<u32>>>,
}

impl NetPacketProcedure for RecordingProcedure {
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
        server_frame: CommandFrame,
    ) -> CodecResult<ProcedureSync> {
        let written: u32 = reader.read()?;
        assert_eq!(written, server_frame.as_u32(), "payload belongs to its packet");
        self.synced.borrow_mut().push(written);
        if self.rewind_on.borrow().contains(&written) {
            Ok(ProcedureSync::REWIND)
        } else {
            Ok(ProcedureSync::IN_SYNC)
        }
    }

    fn on_client_rewind(&mut self, server_frame: CommandFrame) {
        self.rewinds.borrow_mut().push(server_frame.as_u32());
    }
}
