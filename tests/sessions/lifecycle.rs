//! Manager lifecycle, channel listeners, hooks and snapshots.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use web_time::Instant;

use command_frame_net::telemetry::{
    CollectingObserver, CompositeObserver, TracingObserver, ViolationKind,
};
use command_frame_net::{
    assert_violation, ActionRef, CommandFrame, CommandFrameConfig, CommandFrameError,
    CommandFrameManager, FramePhase, InputAtom, InputGroup, LoopbackTransport, NetHandle, NetMode,
    OwnerId, TriggerEvent,
};

use crate::common::{advance, advance_by, init_tracing, move_atom, LoopbackSession, MOVE_ACTION};

#[test]
fn test_invalid_config_is_rejected() {
    let config = CommandFrameConfig {
        max_redundant_frames: 64,
        max_buffered_frames: 8,
        ..CommandFrameConfig::default()
    };
    let result = CommandFrameManager::new(NetMode::DedicatedServer, config);
    assert!(matches!(result, Err(CommandFrameError::InvalidConfig { .. })));
}

#[test]
fn test_tick_converts_wall_time_into_fixed_frames() {
    let mut manager =
        CommandFrameManager::new(NetMode::Standalone, CommandFrameConfig::default()).unwrap();
    let start = Instant::now();

    manager.tick(start);
    assert_eq!(manager.real_command_frame(), CommandFrame::ZERO);

    manager.tick(start + Duration::from_millis(110));
    assert_eq!(manager.real_command_frame(), CommandFrame::new(3));
}

#[test]
fn test_long_stall_is_dropped_not_replayed() {
    init_tracing();
    let observer = Arc::new(CollectingObserver::new());
    let mut manager =
        CommandFrameManager::new(NetMode::Standalone, CommandFrameConfig::default())
            .unwrap()
            .with_violation_observer(observer.clone());
    let start = Instant::now();

    manager.tick(start);
    manager.tick(start + Duration::from_secs(2));
    assert_eq!(manager.real_command_frame(), CommandFrame::new(4));
    assert_violation!(observer, ViolationKind::Scheduler);

    // The backlog is gone; the next short tick runs a single frame.
    manager.tick(start + Duration::from_secs(2) + Duration::from_millis(40));
    assert_eq!(manager.real_command_frame(), CommandFrame::new(5));
}

#[test]
fn test_violations_fan_out_to_every_observer() {
    init_tracing();
    let first = Arc::new(CollectingObserver::new());
    let second = Arc::new(CollectingObserver::new());
    let mut composite = CompositeObserver::new();
    composite.add(first.clone());
    composite.add(Arc::new(TracingObserver));
    composite.add(second.clone());

    let mut manager =
        CommandFrameManager::new(NetMode::Standalone, CommandFrameConfig::default()).unwrap();
    manager.set_violation_observer(Arc::new(composite));
    let start = Instant::now();
    manager.tick(start);
    manager.tick(start + Duration::from_secs(2));

    assert_violation!(first, ViolationKind::Scheduler);
    assert_violation!(second, ViolationKind::Scheduler);
    assert_eq!(first.len(), second.len());
}

#[test]
fn test_client_waits_for_its_channel() {
    let mut client =
        CommandFrameManager::new(NetMode::Client, CommandFrameConfig::default()).unwrap();
    client.flush_command_frame(1.0);
    assert_eq!(client.real_command_frame(), CommandFrame::ZERO);
    assert!(!client.is_prepared());

    let (client_end, _server_end) = LoopbackTransport::pair();
    client.register_client_channel(OwnerId::new(4), Box::new(client_end));
    assert!(client.is_prepared());
    advance(&mut client);
    assert_eq!(client.real_command_frame(), CommandFrame::new(1));
}

#[test]
fn test_shutdown_and_initialize_start_over() {
    let mut session = LoopbackSession::new(CommandFrameConfig::default());
    session.lead_client(3);
    advance_by(&mut session.server, 2);

    session.client.shutdown();
    assert!(!session.client.is_initialized());
    assert_eq!(session.client.channel_count(), 0);
    assert_eq!(session.client.real_command_frame(), CommandFrame::ZERO);
    assert!(session.client.input_buffer().is_empty());
    session.client.flush_command_frame(1.0);
    assert_eq!(session.client.real_command_frame(), CommandFrame::ZERO);

    session.client.initialize();
    let (client_end, server_end) = LoopbackTransport::pair();
    session.server.post_login(session.owner, Box::new(server_end));
    session
        .client
        .register_client_channel(session.owner, Box::new(client_end.clone()));
    advance_by(&mut session.client, 2);
    assert_eq!(session.client.real_command_frame(), CommandFrame::new(2));

    // The server kept its channel and now talks over the new link.
    assert_eq!(session.server.channel_count(), 1);
    assert_eq!(client_end.drain_inputs().len(), 1);
    assert!(session.link.drain_inputs().is_empty());
}

#[test]
fn test_channel_listeners_see_every_login() {
    let mut server =
        CommandFrameManager::new(NetMode::DedicatedServer, CommandFrameConfig::default()).unwrap();
    let everyone = Rc::new(RefCell::new(Vec::new()));
    let second = Rc::new(RefCell::new(0));

    let any = {
        let everyone = Rc::clone(&everyone);
        server.bind_on_channel_registered(None, move |owner| everyone.borrow_mut().push(owner))
    };

    for id in 1..=2 {
        let (_, server_end) = LoopbackTransport::pair();
        server.post_login(OwnerId::new(id), Box::new(server_end));
    }
    assert_eq!(*everyone.borrow(), vec![OwnerId::new(1), OwnerId::new(2)]);

    // Binding after the login fires straight away.
    {
        let second = Rc::clone(&second);
        server.bind_on_channel_registered(Some(OwnerId::new(2)), move |_| *second.borrow_mut() += 1);
    }
    assert_eq!(*second.borrow(), 1);

    assert!(server.unbind_on_channel_registered(any));
    assert!(server.logout(OwnerId::new(1)));
    let (_, server_end) = LoopbackTransport::pair();
    server.post_login(OwnerId::new(3), Box::new(server_end));
    assert_eq!(everyone.borrow().len(), 2);
    assert_eq!(server.channel_count(), 2);
}

#[test]
fn test_hooks_follow_real_and_internal_frames() {
    let mut manager =
        CommandFrameManager::new(NetMode::Standalone, CommandFrameConfig::default()).unwrap();
    let seen = Rc::new(RefCell::new(Vec::new()));
    for phase in FramePhase::ALL {
        let seen = Rc::clone(&seen);
        manager.subscribe(phase, move |tick| {
            seen.borrow_mut().push((phase, tick.real_frame.as_u32()));
        });
    }

    advance_by(&mut manager, 2);

    use FramePhase::*;
    assert_eq!(
        *seen.borrow(),
        vec![
            (PreBegin, 1),
            (Begin, 1),
            (PostBegin, 1),
            (PreEnd, 1),
            (End, 1),
            (PostEnd, 1),
            (PreBegin, 2),
            (Begin, 2),
            (PostBegin, 2),
        ]
    );
}

#[test]
fn test_replicated_actions_resolve_on_the_server() {
    let mut session = LoopbackSession::new(CommandFrameConfig::default());
    let handle = NetHandle::new(3);
    session.server.register_replicated_action(handle, MOVE_ACTION);

    let fired = Rc::new(RefCell::new(Vec::new()));
    {
        let fired = Rc::clone(&fired);
        session
            .server
            .player_input_stack_mut(session.owner)
            .controller_mut()
            .bind_action(MOVE_ACTION, TriggerEvent::Triggered, move |atom| {
                fired.borrow_mut().push(atom.value.as_axis1d());
            });
    }

    let replicated = InputAtom {
        action: ActionRef::Replicated(handle),
        ..move_atom(2.0)
    };
    let unknown = InputAtom {
        action: ActionRef::Replicated(NetHandle::new(9)),
        ..move_atom(5.0)
    };
    let source = session.client.input_source_mut();
    source.record_input(replicated, InputGroup::Move);
    source.record_input(unknown, InputGroup::Move);

    session.lead_client(2);
    advance(&mut session.server);
    assert_eq!(*fired.borrow(), vec![2.0]);
}

#[test]
fn test_snapshots_are_dropped_on_hard_reset() {
    let mut session = LoopbackSession::new(CommandFrameConfig::default());
    advance_by(&mut session.server, 5);

    for value in 1..=3_u32 {
        advance(&mut session.client);
        let frame = session.client.real_command_frame();
        assert!(session.client.record_attribute_snapshot(frame, value * 10));
        assert!(!session.client.record_attribute_snapshot(frame, value));
    }
    assert_eq!(
        session
            .client
            .read_attribute_from_snapshot::<u32>(CommandFrame::new(2)),
        Some(&20)
    );
    assert_eq!(
        session
            .client
            .read_attribute_from_snapshot::<f32>(CommandFrame::new(2)),
        None
    );

    let latest = session.take_deltas().pop().unwrap();
    session.deliver_delta(latest);
    assert_violation!(session.client_observer, ViolationKind::FrameSync);
    assert_eq!(session.client.snapshot_buffer().count(), 0);
    assert_eq!(
        session
            .client
            .read_attribute_from_snapshot::<u32>(CommandFrame::new(2)),
        None
    );
}
