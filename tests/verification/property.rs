//! Property-based tests for the input ring, the redundant input codec and
//! delta ordering.
//!
//! These tests use proptest to verify invariants hold under random inputs.
//!
//! # Properties Tested
//!
//! ## OwnershipCircularQueue
//! - Structural checks pass after any sequence of writes and acks
//! - head_frame never moves backwards
//! - An owner writes a given frame at most once
//! - Window reads return the documented lengths
//!
//! ## Redundant input
//! - A frame reaches the server iff some delivered window covered it
//!
//! ## Delta ordering
//! - Any delivery order of a delta chain is applied in server order
//!
//! ## Time dilation
//! - Only the single cycle and the forced return to `Dilate` are reachable

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::float_cmp
)]

use command_frame_net::__internal::PingAverager;
use command_frame_net::network::packet::OwnerFrameAllocator;
use command_frame_net::telemetry::InvariantChecker;
use command_frame_net::{
    ChannelHost, CommandFrame, CommandFrameConfig, DeltaPacketType, InputFrame, InputNetPacket,
    LoopbackTransport, NetChannel, OwnerId, OwnershipCircularQueue, OwnershipSlot, TimeDilation,
    TimeDilationState,
};
use proptest::prelude::*;

use crate::common::{move_atom, RecordingProcedure};

const OWNER: OwnerId = OwnerId::new(1);

// ============================================================================
// Property Test Strategies
// ============================================================================

#[derive(Debug, Clone)]
enum RingOp {
    Write { owner: u32, frame: u32 },
    Ack(u32),
    AckNext,
    Empty,
}

fn ring_op_strategy() -> impl Strategy<Value = RingOp> {
    prop_oneof![
        6 => (1u32..4, 0u32..200).prop_map(|(owner, frame)| RingOp::Write { owner, frame }),
        2 => (0u32..220).prop_map(RingOp::Ack),
        1 => Just(RingOp::AckNext),
        1 => Just(RingOp::Empty),
    ]
}

/// Strategy for ring frame budgets
fn budget_strategy() -> impl Strategy<Value = u32> {
    prop_oneof![Just(8u32), Just(16), Just(32)]
}

fn apply(queue: &mut OwnershipCircularQueue<InputFrame>, op: &RingOp) {
    match *op {
        RingOp::Write { owner, frame } => {
            let atoms = [move_atom(frame as f32)];
            queue.record_item_data(OwnerId::new(owner), &atoms, CommandFrame::new(frame));
        },
        RingOp::Ack(frame) => queue.ack_data(CommandFrame::new(frame)),
        RingOp::AckNext => queue.ack_next_data(),
        RingOp::Empty => queue.empty(),
    }
}

// ============================================================================
// OwnershipCircularQueue Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Structural invariants and the window bound hold after every operation.
    #[test]
    fn prop_ring_invariants_hold(
        budget in budget_strategy(),
        ops in proptest::collection::vec(ring_op_strategy(), 1..120),
    ) {
        let mut queue: OwnershipCircularQueue<InputFrame> = OwnershipCircularQueue::new(budget);
        for op in &ops {
            apply(&mut queue, op);
            prop_assert!(queue.check_invariants().is_ok(), "after {:?}: {:?}", op, queue.check_invariants());
            prop_assert!(queue.head_frame() <= queue.end_frame());
            prop_assert!(queue.count() <= queue.max_frames());
        }
    }

    /// head_frame is monotonic under writes, acks and empties.
    #[test]
    fn prop_ring_head_is_monotonic(
        ops in proptest::collection::vec(ring_op_strategy(), 1..120),
    ) {
        let mut queue: OwnershipCircularQueue<InputFrame> = OwnershipCircularQueue::new(16);
        let mut head = queue.head_frame();
        for op in &ops {
            apply(&mut queue, op);
            prop_assert!(queue.head_frame() >= head, "head moved back on {:?}", op);
            head = queue.head_frame();
        }
    }

    /// A successful write is never repeated for the same owner and frame.
    #[test]
    fn prop_ring_owner_writes_once(
        ops in proptest::collection::vec(ring_op_strategy(), 0..60),
        owner in 1u32..4,
        frame in 0u32..200,
    ) {
        let mut queue: OwnershipCircularQueue<InputFrame> = OwnershipCircularQueue::new(16);
        for op in &ops {
            apply(&mut queue, op);
        }
        let owner = OwnerId::new(owner);
        let frame = CommandFrame::new(frame);
        if queue.record_item_data(owner, &[move_atom(1.0)], frame) {
            prop_assert!(!queue.record_item_data(owner, &[move_atom(2.0)], frame));
            let atoms = queue.read_data(frame).and_then(|slot| slot.atoms_for(owner));
            prop_assert_eq!(atoms, Some(&[move_atom(1.0)][..]));
        }
    }

    /// Shrinking reads inside the window return `min(count, frame - head + 1)` frames.
    #[test]
    fn prop_ring_shrink_window_length(
        ops in proptest::collection::vec(ring_op_strategy(), 1..60),
        offset in 0u32..64,
        count in 1u32..40,
    ) {
        let mut queue: OwnershipCircularQueue<InputFrame> = OwnershipCircularQueue::new(32);
        for op in &ops {
            apply(&mut queue, op);
        }
        prop_assume!(!queue.is_empty());
        let head = queue.head_frame();
        let frame = head + offset % queue.count();

        let view = queue.read_range_data_shrink(frame, count);
        let expected = count.min(frame.frames_since(head) + 1);
        prop_assert_eq!(view.len(), expected as usize);
        prop_assert_eq!(view.last_frame(), Some(frame));
        for (i, slot) in view.iter().enumerate() {
            prop_assert_eq!(slot.command_frame(), view.first_frame() + i as u32);
        }
    }

    /// Exact reads are either the whole window or nothing.
    #[test]
    fn prop_ring_exact_window_is_all_or_nothing(
        ops in proptest::collection::vec(ring_op_strategy(), 1..60),
        frame in 0u32..220,
        count in 1u32..40,
    ) {
        let mut queue: OwnershipCircularQueue<InputFrame> = OwnershipCircularQueue::new(32);
        for op in &ops {
            apply(&mut queue, op);
        }
        let frame = CommandFrame::new(frame);
        let view = queue.read_range_data(frame, count);
        let fits = frame.as_u32() + 1 >= count
            && frame.saturating_sub(count - 1) >= queue.head_frame()
            && frame < queue.end_frame();
        if fits {
            prop_assert_eq!(view.len(), count as usize);
        } else {
            prop_assert!(view.is_empty());
        }
    }
}

// ============================================================================
// Redundant Input Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// With windows of `window` frames, frame `f` arrives iff a delivered
    /// packet sent at some frame in `f..f + window` survived.
    #[test]
    fn prop_redundant_windows_recover_covered_frames(
        window in 1u32..8,
        delivered in proptest::collection::vec(any::<bool>(), 1..40),
    ) {
        let last = delivered.len() as u32;
        let mut client: OwnershipCircularQueue<InputFrame> = OwnershipCircularQueue::new(64);
        let mut server: OwnershipCircularQueue<InputFrame> = OwnershipCircularQueue::new(64);

        for frame in 1..=last {
            prop_assert!(client.record_item_data(OWNER, &[move_atom(frame as f32)], CommandFrame::new(frame)));
            let packet = InputNetPacket::build_from_view(
                client.read_range_data_shrink(CommandFrame::new(frame), window),
            ).unwrap();
            if delivered[(frame - 1) as usize] {
                packet.read_redundant_data(&mut OwnerFrameAllocator::new(&mut server, OWNER)).unwrap();
            }
        }

        for frame in 1..=last {
            let covered = (frame..frame + window)
                .filter(|sent| *sent <= last)
                .any(|sent| delivered[(sent - 1) as usize]);
            let atoms = server
                .read_data(CommandFrame::new(frame))
                .and_then(|slot| slot.atoms_for(OWNER));
            match atoms {
                Some(atoms) => {
                    prop_assert!(covered, "frame {} arrived without a covering packet", frame);
                    prop_assert_eq!(atoms, &[move_atom(frame as f32)][..]);
                },
                None => prop_assert!(!covered, "frame {} was covered but is missing", frame),
            }
        }
    }
}

// ============================================================================
// Delta Ordering Properties
// ============================================================================

/// A client host that is always far ahead of the server.
#[derive(Default)]
struct AheadHost {
    acked: Vec<CommandFrame>,
}

impl ChannelHost for AheadHost {
    fn real_command_frame(&self) -> CommandFrame {
        CommandFrame::new(10_000)
    }

    fn is_rewinding(&self) -> bool {
        false
    }

    fn receive_input(&mut self, _owner: OwnerId, _packet: &InputNetPacket) {}

    fn buffered_frames(&self, _owner: OwnerId) -> u32 {
        4
    }

    fn reset_command_frame(&mut self, _frame: CommandFrame) {
        panic!("a client ahead of the server never resets");
    }

    fn update_time_dilation(&mut self, _buffer_depth: u32, _fault: bool) {}

    fn client_receive_command_ack(&mut self, frame: CommandFrame) {
        self.acked.push(frame);
    }

    fn replay_frames(&mut self, _frame: CommandFrame) {}
}

fn delta_permutation_strategy() -> impl Strategy<Value = Vec<usize>> {
    (1usize..24).prop_flat_map(|len| Just((0..len).collect::<Vec<_>>()).prop_shuffle())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Once the first delta has seeded the tracker, however the rest of the
    /// chain is reordered or duplicated in transit, procedures see every
    /// frame exactly once and in order.
    #[test]
    fn prop_delta_chain_applies_in_server_order(
        order in delta_permutation_strategy(),
        duplicate in any::<proptest::sample::Index>(),
    ) {
        let link = LoopbackTransport::pair().0;
        let mut server = NetChannel::new(OWNER, Box::new(link.clone()));
        server.register_net_packet_procedure(DeltaPacketType::MOVEMENT, Box::new(RecordingProcedure::default()));
        let mut host = AheadHost::default();
        let total = order.len() as u32 + 1;
        for frame in 1..=total {
            server.server_send_delta(&host, CommandFrame::new(frame), DeltaPacketType::NONE);
        }
        let chain = link.drain_deltas();
        prop_assert_eq!(chain.len(), total as usize);

        let log = RecordingProcedure::default();
        let mut client = NetChannel::new(OWNER, Box::new(LoopbackTransport::default()));
        client.register_net_packet_procedure(DeltaPacketType::MOVEMENT, Box::new(log.clone()));
        client.client_receive_delta(&mut host, chain[0].clone());

        let mut deliveries: Vec<usize> = order.iter().map(|index| index + 1).collect();
        deliveries.insert(duplicate.index(order.len() + 1), order[duplicate.index(order.len())] + 1);
        for index in deliveries {
            client.client_receive_delta(&mut host, chain[index].clone());
        }

        let expected: Vec<u32> = (1..=total).collect();
        prop_assert_eq!(&*log.synced.borrow(), &expected);
        prop_assert_eq!(client.unordered_len(), 0);
        prop_assert_eq!(client.applied_deltas(), u64::from(total));
        let acked: Vec<u32> = host.acked.iter().map(|frame| frame.as_u32()).collect();
        prop_assert_eq!(acked, expected);
    }
}

// ============================================================================
// Time Dilation Properties
// ============================================================================

#[derive(Debug, Clone)]
enum DilationOp {
    Report { depth: u32, fault: bool },
    Ticks { count: u32, ping_ms: f32 },
}

fn dilation_op_strategy() -> impl Strategy<Value = DilationOp> {
    prop_oneof![
        3 => (0u32..40, proptest::bool::weighted(0.1))
            .prop_map(|(depth, fault)| DilationOp::Report { depth, fault }),
        5 => (1u32..40, prop_oneof![Just(0.0f32), 20.0f32..400.0])
            .prop_map(|(count, ping_ms)| DilationOp::Ticks { count, ping_ms }),
    ]
}

fn is_allowed_transition(from: TimeDilationState, to: TimeDilationState) -> bool {
    use TimeDilationState::*;
    matches!(
        (from, to),
        (Default, Dilate)
            | (Dilate, PredictMax)
            | (PredictMax, RealMax)
            | (RealMax, Shrink)
            | (Shrink, Default)
            | (_, Dilate)
    )
}

proptest! {
    /// Whatever the reports and ping, the controller only moves along the
    /// cycle or back into `Dilate`.
    #[test]
    fn prop_dilation_only_follows_the_cycle(
        ops in proptest::collection::vec(dilation_op_strategy(), 1..60),
    ) {
        let mut dilation = TimeDilation::new(&CommandFrameConfig::default());
        let mut state = dilation.state();
        let check = |dilation: &TimeDilation, state: &mut TimeDilationState| {
            let next = dilation.state();
            let allowed = next == *state || is_allowed_transition(*state, next);
            *state = next;
            allowed
        };

        for op in ops {
            match op {
                DilationOp::Report { depth, fault } => {
                    dilation.update(depth, fault);
                    let from = state;
                    prop_assert!(check(&dilation, &mut state), "{:?} -> {:?}", from, dilation.state());
                },
                DilationOp::Ticks { count, ping_ms } => {
                    for _ in 0..count {
                        dilation.fixed_tick(1.0 / 30.0, ping_ms);
                        let from = state;
                        prop_assert!(check(&dilation, &mut state), "{:?} -> {:?}", from, dilation.state());
                    }
                },
            }
        }
    }
}

// ============================================================================
// Ping Averaging Properties
// ============================================================================

proptest! {
    /// A steady ping averages to itself.
    #[test]
    fn prop_steady_ping_averages_to_itself(
        ping in 1.0f32..500.0,
        samples in 1usize..40,
        capacity in 1usize..16,
    ) {
        let mut averager = PingAverager::new(capacity, 1.5);
        for _ in 0..samples {
            averager.push(ping);
        }
        prop_assert!(averager.is_valid());
        prop_assert!((averager.average() - ping).abs() <= ping * 1e-5);
    }

    /// The average never leaves the range of the samples.
    #[test]
    fn prop_ping_average_is_bounded(
        pings in proptest::collection::vec(1.0f32..500.0, 1..40),
    ) {
        let mut averager = PingAverager::new(8, 1.5);
        for ping in &pings {
            averager.push(*ping);
        }
        if averager.is_valid() {
            let min = pings.iter().copied().fold(f32::MAX, f32::min);
            let max = pings.iter().copied().fold(f32::MIN, f32::max);
            prop_assert!(averager.average() >= min * (1.0 - 1e-5));
            prop_assert!(averager.average() <= max * (1.0 + 1e-5));
        }
    }
}
