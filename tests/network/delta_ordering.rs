//! Delta packets reach the client procedures in server frame order.
//!
//! The loopback link never reorders on its own, so these tests take the
//! queued deltas and hand them over in whatever order the scenario needs.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use command_frame_net::telemetry::ViolationKind;
use command_frame_net::{assert_no_violations, assert_violation};
use command_frame_net::{CommandFrame, CommandFrameConfig, DeltaPacketType};

use crate::common::{advance, init_tracing, LoopbackSession, RecordingProcedure};

/// Session with a [`RecordingProcedure`] on both ends of the movement bit.
/// Returns the client-side log.
fn recording_session() -> (LoopbackSession, RecordingProcedure) {
    init_tracing();
    let mut session = LoopbackSession::new(CommandFrameConfig::default());
    let owner = session.owner;

    let server_channel = session.server.channel_mut(owner).expect("server channel");
    assert!(server_channel.register_net_packet_procedure(
        DeltaPacketType::MOVEMENT,
        Box::new(RecordingProcedure::default()),
    ));

    let client_log = RecordingProcedure::default();
    let client_channel = session.client.channel_mut(owner).expect("client channel");
    assert!(client_channel
        .register_net_packet_procedure(DeltaPacketType::MOVEMENT, Box::new(client_log.clone())));

    (session, client_log)
}

/// Advances both sides `frames` times with input delivered and deltas held back.
fn hold_deltas(session: &mut LoopbackSession, frames: u32) {
    for _ in 0..frames {
        advance(&mut session.client);
        session.deliver_inputs();
        advance(&mut session.server);
    }
}

#[test]
fn steady_state_applies_every_delta_in_order() {
    let (mut session, log) = recording_session();
    session.lead_client(4);

    for _ in 0..10 {
        session.tick();
    }

    // The first server frame sends nothing; frames 1..=9 follow.
    assert_eq!(*log.synced.borrow(), (1..=9).collect::<Vec<_>>());
    let channel = session.client.channel(session.owner).expect("client channel");
    assert_eq!(channel.last_server_command_frame(), CommandFrame::new(9));
    assert_eq!(channel.applied_deltas(), 9);
    assert_eq!(channel.unordered_len(), 0);

    // Each applied delta acknowledges the client input up to its frame.
    assert_eq!(session.client.input_buffer().head_frame(), CommandFrame::new(10));

    assert_no_violations!(session.client_observer);
    assert_no_violations!(session.server_observer);
}

#[test]
fn out_of_order_deltas_wait_for_their_predecessor() {
    let (mut session, log) = recording_session();
    session.lead_client(4);
    session.tick();

    hold_deltas(&mut session, 4);
    let mut deltas = session.take_deltas();
    assert_eq!(deltas.len(), 4);
    let fourth = deltas.pop().unwrap();
    let third = deltas.pop().unwrap();
    let second = deltas.pop().unwrap();
    let first = deltas.pop().unwrap();

    session.deliver_delta(first);
    session.deliver_delta(fourth);
    session.deliver_delta(third);
    {
        let channel = session.client.channel(session.owner).expect("client channel");
        assert_eq!(channel.unordered_len(), 2);
        assert_eq!(*log.synced.borrow(), vec![1]);
    }

    session.deliver_delta(second);
    assert_eq!(*log.synced.borrow(), vec![1, 2, 3, 4]);
    let channel = session.client.channel(session.owner).expect("client channel");
    assert_eq!(channel.unordered_len(), 0);
    assert_eq!(channel.last_server_command_frame(), CommandFrame::new(4));
}

#[test]
fn fresh_client_takes_the_first_delta_it_sees() {
    let (mut session, log) = recording_session();
    session.lead_client(4);
    session.tick();

    hold_deltas(&mut session, 3);
    let mut deltas = session.take_deltas();
    let third = deltas.pop().unwrap();
    session.deliver_delta(third);
    assert_eq!(*log.synced.borrow(), vec![3]);

    // Anything older than the adopted frame is stale.
    for stale in deltas {
        session.deliver_delta(stale);
    }
    let channel = session.client.channel(session.owner).expect("client channel");
    assert_eq!(channel.applied_deltas(), 1);
    assert_eq!(channel.unordered_len(), 0);
    assert_eq!(channel.last_server_command_frame(), CommandFrame::new(3));
}

#[test]
fn duplicate_deltas_are_dropped() {
    let (mut session, log) = recording_session();
    session.lead_client(4);
    session.tick();

    hold_deltas(&mut session, 2);
    let deltas = session.take_deltas();
    assert_eq!(deltas.len(), 2);

    session.deliver_delta(deltas[0].clone());
    session.deliver_delta(deltas[0].clone());
    session.deliver_delta(deltas[1].clone());
    session.deliver_delta(deltas[0].clone());

    assert_eq!(*log.synced.borrow(), vec![1, 2]);
    let channel = session.client.channel(session.owner).expect("client channel");
    assert_eq!(channel.applied_deltas(), 2);
    assert_eq!(channel.unordered_len(), 0);
}

#[test]
fn client_behind_server_is_reset_to_the_delta_frame() {
    let (mut session, log) = recording_session();

    for _ in 0..5 {
        advance(&mut session.server);
    }
    advance(&mut session.client);

    let deltas = session.take_deltas();
    assert_eq!(deltas.len(), 4);
    let latest = deltas[3].clone();
    assert_eq!(latest.server_command_frame, CommandFrame::new(4));

    session.deliver_delta(latest);
    assert_eq!(session.client.real_command_frame(), CommandFrame::new(4));
    assert_eq!(session.client.internal_command_frame(), CommandFrame::new(4));
    assert_eq!(*log.synced.borrow(), vec![4]);
    assert_violation!(session.client_observer, ViolationKind::FrameSync);

    // Older packets from before the reset are stale.
    for stale in deltas.into_iter().take(3) {
        session.deliver_delta(stale);
    }
    let channel = session.client.channel(session.owner).expect("client channel");
    assert_eq!(channel.applied_deltas(), 1);
    assert_eq!(channel.last_server_command_frame(), CommandFrame::new(4));
    assert_eq!(*log.synced.borrow(), vec![4]);
}

#[test]
fn unregistered_bits_are_skipped_without_losing_the_packet() {
    let (mut session, log) = recording_session();
    let server_channel = session.server.channel_mut(session.owner).expect("server channel");
    assert!(server_channel.register_net_packet_procedure(
        DeltaPacketType::STATE_ABILITY_SCRIPT,
        Box::new(RecordingProcedure::default()),
    ));

    session.lead_client(4);
    for _ in 0..4 {
        session.tick();
    }

    assert_eq!(*log.synced.borrow(), vec![1, 2, 3]);
    assert_violation!(session.client_observer, ViolationKind::NetChannel);
}
