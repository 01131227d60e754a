//! Every input packet carries a window of recent frames, so a lost packet
//! costs nothing as long as a later window still covers its frames.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::cell::RefCell;
use std::rc::Rc;

use command_frame_net::network::packet::OwnerFrameAllocator;
use command_frame_net::{assert_no_violations, CommandFrameConfig, InputGroup, TriggerEvent};
use command_frame_net::{CommandFrame, InputFrame, InputNetPacket, OwnerId, OwnershipCircularQueue};

use crate::common::{advance, init_tracing, move_atom, LoopbackSession, MOVE_ACTION};

const OWNER: OwnerId = OwnerId::new(1);

fn frame(n: u32) -> CommandFrame {
    CommandFrame::new(n)
}

#[test]
fn later_window_recovers_a_lost_packet() {
    let mut client: OwnershipCircularQueue<InputFrame> = OwnershipCircularQueue::new(32);
    for n in 8..=17 {
        assert!(client.record_item_data(OWNER, &[move_atom(n as f32)], frame(n)));
    }

    let lost = InputNetPacket::build_from_view(client.read_range_data(frame(15), 8))
        .expect("encode first window");
    let delivered = InputNetPacket::build_from_view(client.read_range_data(frame(17), 8))
        .expect("encode second window");
    assert_eq!(lost.client_command_frame, frame(15));
    assert_eq!(delivered.client_command_frame, frame(17));

    let mut server: OwnershipCircularQueue<InputFrame> = OwnershipCircularQueue::new(32);
    server.ack_data(frame(8));
    let accepted = delivered
        .read_redundant_data(&mut OwnerFrameAllocator::new(&mut server, OWNER))
        .expect("decode second window");
    assert_eq!(accepted, 8);

    for n in 10..=17 {
        let atoms = server
            .read_data(frame(n))
            .and_then(|f| f.atoms_for(OWNER))
            .expect("frame covered by the delivered window");
        assert_eq!(atoms, &[move_atom(n as f32)]);
    }
    // Only the lost packet carried these.
    for n in 8..=9 {
        let written = server.read_data(frame(n)).and_then(|f| f.atoms_for(OWNER));
        assert!(written.is_none(), "frame {n} should be missing");
    }
}

#[test]
fn overlapping_windows_are_written_once() {
    let mut client: OwnershipCircularQueue<InputFrame> = OwnershipCircularQueue::new(32);
    for n in 1..=6 {
        assert!(client.record_item_data(OWNER, &[move_atom(n as f32)], frame(n)));
    }
    let early = InputNetPacket::build_from_view(client.read_range_data_shrink(frame(4), 16))
        .expect("encode");
    let late = InputNetPacket::build_from_view(client.read_range_data_shrink(frame(6), 16))
        .expect("encode");

    let mut server: OwnershipCircularQueue<InputFrame> = OwnershipCircularQueue::new(32);
    let mut allocator = OwnerFrameAllocator::new(&mut server, OWNER);
    assert_eq!(early.read_redundant_data(&mut allocator).expect("decode"), 4);
    assert_eq!(late.read_redundant_data(&mut allocator).expect("decode"), 2);

    assert_eq!(server.count_owner(&OWNER), 6);
    let atoms = server.read_data(frame(3)).and_then(|f| f.atoms_for(OWNER));
    assert_eq!(atoms, Some(&[move_atom(3.0)][..]));
}

#[test]
fn dropped_input_packets_do_not_starve_the_server() {
    init_tracing();
    let mut session = LoopbackSession::new(CommandFrameConfig::default());
    let simulated = Rc::new(RefCell::new(Vec::new()));
    {
        let simulated = Rc::clone(&simulated);
        session
            .server
            .player_input_stack_mut(session.owner)
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

    for i in 0..12 {
        capture(&mut session);
        advance(&mut session.client);
        if i % 2 == 0 {
            session.drop_inputs();
        } else {
            session.deliver_inputs();
        }
        advance(&mut session.server);
        session.deliver_deltas();
    }

    assert_eq!(*simulated.borrow(), (1..=12).collect::<Vec<_>>());
    assert_no_violations!(session.server_observer);
}

#[test]
fn window_is_capped_at_the_redundant_frame_limit() {
    let config = CommandFrameConfig {
        max_redundant_frames: 4,
        ..CommandFrameConfig::default()
    };
    let mut session = LoopbackSession::new(config);
    for _ in 0..10 {
        advance(&mut session.client);
    }

    let packets = session.link.drain_inputs();
    let newest = packets.last().expect("client sent input");
    assert_eq!(newest.client_command_frame, frame(9));

    let mut server: OwnershipCircularQueue<InputFrame> = OwnershipCircularQueue::new(32);
    let accepted = newest
        .read_redundant_data(&mut OwnerFrameAllocator::new(&mut server, OWNER))
        .expect("decode");
    assert_eq!(accepted, 4);
    assert_eq!(server.head_frame(), frame(0));
    assert!(server.read_data(frame(6)).and_then(|f| f.atoms_for(OWNER)).is_some());
    assert!(server.read_data(frame(5)).and_then(|f| f.atoms_for(OWNER)).is_none());
}
