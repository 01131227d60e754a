//! Tests for InvariantChecker implementations.
//!
//! Debug builds already run `debug_check_invariants!` after every fixed
//! frame. These tests call `check_invariants()` directly between operations.
//!
//! # Invariants Tested
//!
//! ## OwnershipCircularQueue
//! - head_frame <= end_frame
//! - The window spans at most `max_frames` frames
//! - Every readable slot is stamped with its own frame
//!
//! ## CommandFrameManager
//! - internal frame <= real frame
//! - previous frame <= real frame
//! - The input ring passes its own checks

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use command_frame_net::telemetry::{InvariantChecker, ViolationKind};
use command_frame_net::{
    CommandFrame, CommandFrameConfig, CommandFrameManager, DeltaPacketType, InputFrame, NetMode,
    OwnerId, OwnershipCircularQueue,
};

use crate::common::{advance, move_atom, LoopbackSession, RecordingProcedure};

const A: OwnerId = OwnerId::new(1);
const B: OwnerId = OwnerId::new(2);

fn frame(n: u32) -> CommandFrame {
    CommandFrame::new(n)
}

fn assert_ring_ok(queue: &OwnershipCircularQueue<InputFrame>, context: &str) {
    if let Err(violation) = queue.check_invariants() {
        panic!("{context}: {violation}");
    }
}

// ============================================================================
// OwnershipCircularQueue
// ============================================================================

#[test]
fn test_ring_new_is_valid() {
    let queue: OwnershipCircularQueue<InputFrame> = OwnershipCircularQueue::new(8);
    assert_ring_ok(&queue, "new");
    assert!(queue.is_empty());
    assert_eq!(queue.max_frames() as usize, queue.capacity() - 1);
}

#[test]
fn test_ring_invariants_through_write_slide_and_ack() {
    let mut queue: OwnershipCircularQueue<InputFrame> = OwnershipCircularQueue::new(8);
    let limit = queue.max_frames();

    for n in 1..=limit {
        assert!(queue.record_item_data(A, &[move_atom(n as f32)], frame(n)));
        assert_ring_ok(&queue, "sequential write");
    }

    // Writing past the budget slides head forward.
    assert!(queue.record_item_data(B, &[], frame(limit + 5)));
    assert_ring_ok(&queue, "slide");
    assert!(queue.end_frame().frames_since(queue.head_frame()) <= limit);
    assert!(queue.read_data(frame(1)).is_none());

    queue.ack_data(frame(limit));
    assert_ring_ok(&queue, "ack inside window");
    assert_eq!(queue.head_frame(), frame(limit + 1));

    queue.ack_next_data();
    assert_ring_ok(&queue, "ack next");

    queue.ack_data(frame(limit + 100));
    assert_ring_ok(&queue, "ack past end");
    assert!(queue.is_empty());
    assert_eq!(queue.head_frame(), frame(limit + 100));

    assert!(queue.record_item_data(A, &[], frame(limit + 100)));
    assert_ring_ok(&queue, "write after rebase");
}

#[test]
fn test_ring_rejects_stale_and_duplicate_writes() {
    let mut queue: OwnershipCircularQueue<InputFrame> = OwnershipCircularQueue::new(8);
    assert!(queue.record_item_data(A, &[move_atom(1.0)], frame(3)));
    assert!(!queue.record_item_data(A, &[move_atom(2.0)], frame(3)));
    assert!(queue.record_item_data(B, &[move_atom(3.0)], frame(3)));

    let slot = queue.read_data(frame(3)).unwrap();
    assert_eq!(slot.atoms_for(A), Some(&[move_atom(1.0)][..]));
    assert_eq!(slot.atoms_for(B), Some(&[move_atom(3.0)][..]));

    queue.ack_data(frame(3));
    assert!(!queue.record_item_data(A, &[], frame(3)));
    assert_ring_ok(&queue, "after rejected writes");
}

// ============================================================================
// CommandFrameManager
// ============================================================================

#[test]
fn test_manager_new_is_valid() {
    for mode in [NetMode::Client, NetMode::DedicatedServer, NetMode::Standalone] {
        let manager = CommandFrameManager::new(mode, CommandFrameConfig::default()).unwrap();
        assert!(manager.check_invariants().is_ok(), "{mode:?}");
    }
}

#[test]
fn test_manager_invariants_through_session_resets_and_replays() {
    let mut session = LoopbackSession::new(CommandFrameConfig::default());
    let owner = session.owner;
    let log = RecordingProcedure::default();
    log.rewind_on.borrow_mut().extend([4, 9, 10]);
    assert!(session
        .server
        .channel_mut(owner)
        .unwrap()
        .register_net_packet_procedure(
            DeltaPacketType::MOVEMENT,
            Box::new(RecordingProcedure::default())
        ));
    assert!(session
        .client
        .channel_mut(owner)
        .unwrap()
        .register_net_packet_procedure(DeltaPacketType::MOVEMENT, Box::new(log.clone())));

    // Server starts ahead so the first delta forces a hard reset.
    for _ in 0..3 {
        advance(&mut session.server);
    }
    for _ in 0..20 {
        session.tick();
        session.server.check_invariants().unwrap();
        session.client.check_invariants().unwrap();
        session.server.input_buffer().check_invariants().unwrap();
        session.client.input_buffer().check_invariants().unwrap();
    }

    assert!(session
        .client_observer
        .has_violation(ViolationKind::FrameSync));
    assert!(!log.rewinds.borrow().is_empty());
}

#[test]
fn test_manager_invariants_after_shutdown() {
    let mut manager =
        CommandFrameManager::new(NetMode::Standalone, CommandFrameConfig::default()).unwrap();
    for _ in 0..5 {
        advance(&mut manager);
    }
    manager.reset_command_frame(frame(2));
    assert!(manager.check_invariants().is_ok());
    manager.shutdown();
    assert!(manager.check_invariants().is_ok());
}
