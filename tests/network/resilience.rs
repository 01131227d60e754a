//! Recovery from starved servers, late clients and lossy links.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::cell::RefCell;
use std::rc::Rc;

use command_frame_net::telemetry::ViolationKind;
use command_frame_net::{assert_no_violations, assert_violation};
use command_frame_net::{
    ChannelState, CommandFrame, CommandFrameConfig, DeltaPacketType, InputGroup,
    TimeDilationState, TriggerEvent,
};

use crate::common::{
    advance, advance_by, init_tracing, move_atom, LoopbackSession, RecordingProcedure, MOVE_ACTION,
};

#[test]
fn starved_server_faults_and_waits_for_catch_up() {
    init_tracing();
    let mut session = LoopbackSession::new(CommandFrameConfig::default());

    advance_by(&mut session.server, 6);
    advance_by(&mut session.client, 3);
    let stale = session.take_deltas();
    assert_eq!(stale.len(), 5);

    // Both packets arrive after the server consumed their frames.
    assert_eq!(session.deliver_inputs(), 2);
    assert_eq!(session.server_buffered(), 0);
    let server_channel = session.server.channel(session.owner).expect("server channel");
    assert_eq!(server_channel.state(), ChannelState::WaitCatch);
    assert_violation!(session.server_observer, ViolationKind::NetChannel);

    let mut faults = session.take_deltas();
    assert_eq!(faults.len(), 1, "one fault per starvation");
    let fault = faults.remove(0);
    assert!(fault.packet_type.contains(DeltaPacketType::FAULT_FRAME_EXPIRY));
    assert_eq!(fault.server_command_frame, CommandFrame::new(6));

    // The client jumps to the server frame and speeds up.
    session.deliver_delta(fault);
    assert_eq!(session.client.real_command_frame(), CommandFrame::new(6));
    assert_eq!(session.client.time_dilation().state(), TimeDilationState::Dilate);
    assert_violation!(session.client_observer, ViolationKind::FrameSync);

    // Input for frames past the server frame ends the wait.
    advance_by(&mut session.client, 4);
    assert_eq!(session.deliver_inputs(), 4);
    let server_channel = session.server.channel(session.owner).expect("server channel");
    assert_eq!(server_channel.state(), ChannelState::Normal);
    assert_eq!(session.server_buffered(), 3);
    assert_eq!(
        session
            .server_observer
            .violations_of_kind(ViolationKind::NetChannel)
            .len(),
        1
    );
}

#[test]
fn waiting_channel_sends_no_further_faults() {
    let mut session = LoopbackSession::new(CommandFrameConfig::default());
    advance_by(&mut session.server, 6);
    advance_by(&mut session.client, 4);
    session.take_deltas();

    assert_eq!(session.deliver_inputs(), 3);
    let faults = session
        .take_deltas()
        .into_iter()
        .filter(|packet| packet.packet_type.is_fault())
        .count();
    assert_eq!(faults, 1);
}

#[test]
fn client_ahead_of_server_keeps_its_frames() {
    let mut session = LoopbackSession::new(CommandFrameConfig::default());
    session.lead_client(6);
    for _ in 0..6 {
        session.tick();
    }

    // No reset: the client stays ahead by the lead it started with.
    assert_eq!(session.client.real_command_frame(), CommandFrame::new(12));
    assert_eq!(session.server.real_command_frame(), CommandFrame::new(6));
    assert!(!session
        .client_observer
        .has_violation(ViolationKind::FrameSync));
    assert_ne!(
        session.client.time_dilation().state(),
        TimeDilationState::Dilate,
        "no fault was signalled"
    );
}

#[test]
fn lossy_link_converges() {
    init_tracing();
    let mut session = LoopbackSession::new(CommandFrameConfig::default());
    let owner = session.owner;

    let log = RecordingProcedure::default();
    assert!(session
        .server
        .channel_mut(owner)
        .expect("server channel")
        .register_net_packet_procedure(
            DeltaPacketType::MOVEMENT,
            Box::new(RecordingProcedure::default())
        ));
    assert!(session
        .client
        .channel_mut(owner)
        .expect("client channel")
        .register_net_packet_procedure(DeltaPacketType::MOVEMENT, Box::new(log.clone())));

    let simulated = Rc::new(RefCell::new(Vec::new()));
    {
        let simulated = Rc::clone(&simulated);
        session
            .server
            .player_input_stack_mut(owner)
            .controller_mut()
            .bind_action(MOVE_ACTION, TriggerEvent::Triggered, move |atom| {
                simulated.borrow_mut().push(atom.value.as_axis1d() as u32);
            });
    }

    let capture = |session: &mut LoopbackSession| {
        let rcf = session.client.real_command_frame().as_u32();
        if rcf > 0 {
            session
                .client
                .input_source_mut()
                .record_input(move_atom(rcf as f32), InputGroup::Move);
        }
    };

    for _ in 0..4 {
        capture(&mut session);
        advance(&mut session.client);
    }
    session.deliver_inputs();

    for i in 0..60 {
        capture(&mut session);
        advance(&mut session.client);
        // every third input batch is lost
        if i % 3 == 1 {
            session.drop_inputs();
        } else {
            session.deliver_inputs();
        }
        advance(&mut session.server);
        // deltas arrive in bursts of three, newest first once the tracker is seeded
        if i % 3 == 2 {
            let mut burst = session.take_deltas();
            if i > 2 {
                burst.reverse();
            }
            for packet in burst {
                session.deliver_delta(packet);
            }
        }
    }

    assert_eq!(*simulated.borrow(), (1..=60).collect::<Vec<_>>());
    assert_eq!(*log.synced.borrow(), (1..=59).collect::<Vec<_>>());

    let channel = session.client.channel(owner).expect("client channel");
    assert_eq!(channel.last_server_command_frame(), CommandFrame::new(59));
    assert_eq!(channel.unordered_len(), 0);
    assert_eq!(channel.applied_deltas(), 59);

    assert_no_violations!(session.server_observer);
    assert_no_violations!(session.client_observer);
}
