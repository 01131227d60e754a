//! Rewind and replay driven by delta procedures.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::float_cmp
)]

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use command_frame_net::network::codec::{CodecResult, PacketReader, PacketWriter};
use command_frame_net::{assert_no_violations, CommandFrameConfig, FramePhase, TriggerEvent};
use command_frame_net::{
    CommandFrame, DeltaPacketType, InputGroup, NetPacketProcedure, ProcedureSync,
};

use crate::common::{advance, init_tracing, move_atom, LoopbackSession, RecordingProcedure, MOVE_ACTION};

/// Frame whose local prediction is deliberately wrong.
const MISPREDICTED: u32 = 5;
const MISPREDICTION: f32 = 100.0;

type Shared<T> = Rc<RefCell<T>>;

/// Server side: ships the authoritative running total.
struct AuthorityProcedure {
    total: Shared<f32>,
}

impl NetPacketProcedure for AuthorityProcedure {
    fn on_server_net_sync(
        &mut self,
        writer: &mut PacketWriter,
        _server_frame: CommandFrame,
    ) -> CodecResult<usize> {
        writer.write(&*self.total.borrow())
    }

    fn on_client_net_sync(
        &mut self,
        reader: &mut PacketReader<'_>,
        _server_frame: CommandFrame,
    ) -> CodecResult<ProcedureSync> {
        let _: f32 = reader.read()?;
        Ok(ProcedureSync::IN_SYNC)
    }
}

/// Client side: compares the authoritative total against its prediction
/// and restores it before a replay.
struct PredictionProcedure {
    total: Shared<f32>,
    history: Shared<BTreeMap<u32, f32>>,
    rewinds: Shared<Vec<u32>>,
    correction: Option<f32>,
}

impl NetPacketProcedure for PredictionProcedure {
    fn on_server_net_sync(
        &mut self,
        writer: &mut PacketWriter,
        _server_frame: CommandFrame,
    ) -> CodecResult<usize> {
        writer.write(&*self.total.borrow())
    }

    fn on_client_net_sync(
        &mut self,
        reader: &mut PacketReader<'_>,
        server_frame: CommandFrame,
    ) -> CodecResult<ProcedureSync> {
        let authoritative: f32 = reader.read()?;
        let predicted = self.history.borrow().get(&server_frame.as_u32()).copied();
        if predicted == Some(authoritative) {
            return Ok(ProcedureSync::IN_SYNC);
        }
        self.correction = Some(authoritative);
        Ok(ProcedureSync::REWIND)
    }

    fn on_client_rewind(&mut self, server_frame: CommandFrame) {
        self.rewinds.borrow_mut().push(server_frame.as_u32());
        if let Some(total) = self.correction.take() {
            *self.total.borrow_mut() = total;
            self.history.borrow_mut().insert(server_frame.as_u32(), total);
        }
    }
}

struct PredictionGame {
    session: LoopbackSession,
    server_total: Shared<f32>,
    client_total: Shared<f32>,
    history: Shared<BTreeMap<u32, f32>>,
    rewinds: Shared<Vec<u32>>,
    replayed_frames: Shared<Vec<u32>>,
}

impl PredictionGame {
    fn new() -> Self {
        init_tracing();
        let mut session = LoopbackSession::new(CommandFrameConfig::default());
        let owner = session.owner;
        let server_total = Rc::new(RefCell::new(0.0_f32));
        let client_total = Rc::new(RefCell::new(0.0_f32));
        let history = Rc::new(RefCell::new(BTreeMap::new()));
        let rewinds = Rc::new(RefCell::new(Vec::new()));
        let replayed_frames = Rc::new(RefCell::new(Vec::new()));

        // Both sides fold movement into their total; the client only during replay.
        for (manager, total) in [
            (&mut session.server, &server_total),
            (&mut session.client, &client_total),
        ] {
            let total = Rc::clone(total);
            manager
                .player_input_stack_mut(owner)
                .controller_mut()
                .bind_action(MOVE_ACTION, TriggerEvent::Triggered, move |atom| {
                    *total.borrow_mut() += atom.value.as_axis1d();
                });
        }

        assert!(session
            .server
            .channel_mut(owner)
            .unwrap()
            .register_net_packet_procedure(
                DeltaPacketType::MOVEMENT,
                Box::new(AuthorityProcedure {
                    total: Rc::clone(&server_total),
                }),
            ));
        assert!(session
            .client
            .channel_mut(owner)
            .unwrap()
            .register_net_packet_procedure(
                DeltaPacketType::MOVEMENT,
                Box::new(PredictionProcedure {
                    total: Rc::clone(&client_total),
                    history: Rc::clone(&history),
                    rewinds: Rc::clone(&rewinds),
                    correction: None,
                }),
            ));

        {
            let total = Rc::clone(&client_total);
            let history = Rc::clone(&history);
            session.client.subscribe(FramePhase::End, move |tick| {
                if tick.is_rewinding() {
                    history
                        .borrow_mut()
                        .insert(tick.internal_frame.as_u32(), *total.borrow());
                }
            });
        }
        {
            let replayed = Rc::clone(&replayed_frames);
            session.client.subscribe(FramePhase::Begin, move |tick| {
                if tick.is_rewinding() {
                    replayed.borrow_mut().push(tick.internal_frame.as_u32());
                }
            });
        }

        Self {
            session,
            server_total,
            client_total,
            history,
            rewinds,
            replayed_frames,
        }
    }

    /// Records this frame's movement and applies the local prediction.
    fn capture(&mut self) {
        let frame = self.session.client.real_command_frame().as_u32();
        if frame == 0 {
            return;
        }
        let value = frame as f32;
        self.session
            .client
            .input_source_mut()
            .record_input(move_atom(value), InputGroup::Move);

        let predicted = if frame == MISPREDICTED {
            value + MISPREDICTION
        } else {
            value
        };
        let mut total = self.client_total.borrow_mut();
        *total += predicted;
        self.history.borrow_mut().insert(frame, *total);
    }

    fn lead(&mut self, frames: u32) {
        for _ in 0..frames {
            self.capture();
            advance(&mut self.session.client);
        }
        self.session.deliver_inputs();
    }

    fn tick(&mut self) {
        self.capture();
        self.session.tick();
    }
}

fn sum_to(frame: u32) -> f32 {
    (1..=frame).map(|n| n as f32).sum()
}

#[test]
fn misprediction_is_corrected_by_replay() {
    let mut game = PredictionGame::new();
    game.lead(4);
    for _ in 0..12 {
        game.tick();
    }

    // One rewind, at the mispredicted frame, replaying what the client
    // had recorded past it when the correction arrived.
    assert_eq!(*game.rewinds.borrow(), vec![MISPREDICTED]);
    assert_eq!(*game.replayed_frames.borrow(), vec![6, 7, 8, 9]);

    let client_rcf = game.session.client.real_command_frame().as_u32();
    assert_eq!(client_rcf, 16);
    assert_eq!(*game.client_total.borrow(), sum_to(client_rcf - 1));
    assert_eq!(*game.server_total.borrow(), sum_to(12));
    assert_eq!(
        game.session.client.internal_command_frame(),
        game.session.client.real_command_frame()
    );
    assert_no_violations!(game.session.client_observer);
}

#[test]
fn replay_rebuilds_the_same_history() {
    let mut game = PredictionGame::new();
    game.lead(4);
    for _ in 0..12 {
        game.tick();
    }

    let history = game.history.borrow();
    for frame in 1..=15 {
        assert_eq!(history.get(&frame).copied(), Some(sum_to(frame)), "frame {frame}");
    }
}

#[test]
fn requested_rewind_replays_up_to_the_present() {
    init_tracing();
    let mut session = LoopbackSession::new(CommandFrameConfig::default());
    let owner = session.owner;
    let log = RecordingProcedure::default();
    log.rewind_on.borrow_mut().insert(3);

    assert!(session
        .server
        .channel_mut(owner)
        .unwrap()
        .register_net_packet_procedure(DeltaPacketType::MOVEMENT, Box::new(RecordingProcedure::default())));
    assert!(session
        .client
        .channel_mut(owner)
        .unwrap()
        .register_net_packet_procedure(DeltaPacketType::MOVEMENT, Box::new(log.clone())));

    let replayed = Rc::new(RefCell::new(Vec::new()));
    {
        let replayed = Rc::clone(&replayed);
        session.client.subscribe(FramePhase::Begin, move |tick| {
            replayed
                .borrow_mut()
                .push((tick.internal_frame.as_u32(), tick.is_rewinding()));
        });
    }

    session.lead_client(2);
    for _ in 0..5 {
        session.tick();
    }

    assert_eq!(*log.rewinds.borrow(), vec![3]);
    assert_eq!(*log.synced.borrow(), vec![1, 2, 3, 4]);
    // Delta 3 arrives once the client is at frame 6.
    let rewinding: Vec<u32> = replayed
        .borrow()
        .iter()
        .filter(|(_, rewinding)| *rewinding)
        .map(|(frame, _)| *frame)
        .collect();
    assert_eq!(rewinding, vec![4, 5]);
    assert_eq!(
        session.client.internal_command_frame(),
        session.client.real_command_frame()
    );
}
