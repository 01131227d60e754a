//! Frame-keyed ring buffer with per-owner write tracking.
//!
//! [`OwnershipCircularQueue`] stores one slot per command frame in a ring
//! whose capacity is a power of two, so mapping a frame to its slot is a
//! bitmask. The readable window is `head_frame..end_frame`. Writing past
//! `end_frame` slides the window forward, evicting the oldest frames once
//! the frame budget is exceeded. Each owner may write a given frame once.
//!
//! The queue also keeps an outstanding-frame counter per owner. Writes
//! increment it and acknowledgements decrement it for owners present in the
//! acknowledged frames. Eviction does not touch the counters, so
//! [`count_owner`](OwnershipCircularQueue::count_owner) can overcount after a
//! forced slide until the owner's frames are acknowledged or the queue is
//! emptied.
//!
//! # Example
//!
//! ```
//! use command_frame_net::{CommandFrame, InputFrame, OwnershipCircularQueue, OwnerId};
//!
//! let mut queue: OwnershipCircularQueue<InputFrame> = OwnershipCircularQueue::new(32);
//! let owner = OwnerId::new(1);
//! for frame in 1..=5 {
//!     assert!(queue.allocate_item_data(owner, 0, CommandFrame::new(frame)).is_some());
//! }
//! let window = queue.read_range_data_shrink(CommandFrame::new(5), 3);
//! assert_eq!(window.first_frame(), CommandFrame::new(3));
//! assert_eq!(window.len(), 3);
//!
//! queue.ack_data(CommandFrame::new(3));
//! assert_eq!(queue.head_frame(), CommandFrame::new(4));
//! assert_eq!(queue.count_owner(&owner), 2);
//! ```

use std::collections::BTreeMap;
use std::fmt::Debug;

use crate::buffer::input_frame::InputFrame;
use crate::telemetry::{InvariantChecker, InvariantViolation};
use crate::{CommandFrame, InputAtom, OwnerId};

/// Returns the ring capacity used for a frame budget: the next power of two
/// strictly greater than `frame_budget`.
#[must_use]
pub fn round_up_capacity(frame_budget: u32) -> usize {
    (frame_budget as usize + 1).next_power_of_two()
}

/// A ring slot that is stamped with the frame it holds and tracks which owners wrote it.
pub trait OwnershipSlot: Default {
    /// Identifies a writer.
    type Owner: Copy + Ord + Debug;

    /// The frame this slot currently holds.
    fn command_frame(&self) -> CommandFrame;

    /// Clears the slot and stamps it with `frame`.
    fn reset(&mut self, frame: CommandFrame);

    /// Returns `true` if `owner` has written to this slot since its last reset.
    fn has_ownership(&self, owner: &Self::Owner) -> bool;

    /// Returns `true` if the slot holds `frame`; otherwise resets it to `frame` and returns `false`.
    fn verify(&mut self, frame: CommandFrame) -> bool {
        if self.command_frame() == frame {
            true
        } else {
            self.reset(frame);
            false
        }
    }
}

/// Fixed-capacity ring of frame slots. See the [module docs](self).
#[derive(Debug)]
pub struct OwnershipCircularQueue<S: OwnershipSlot> {
    slots: Vec<S>,
    mask: u32,
    head: CommandFrame,
    end: CommandFrame,
    counter: BTreeMap<S::Owner, u32>,
}

impl<S: OwnershipSlot> OwnershipCircularQueue<S> {
    /// Creates a queue able to hold `frame_budget` frames.
    #[must_use]
    pub fn new(frame_budget: u32) -> Self {
        let capacity = round_up_capacity(frame_budget);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, S::default);
        Self {
            slots,
            mask: (capacity - 1) as u32,
            head: CommandFrame::ZERO,
            end: CommandFrame::ZERO,
            counter: BTreeMap::new(),
        }
    }

    /// Number of slots in the ring.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Largest number of frames the window can span.
    #[must_use]
    pub fn max_frames(&self) -> u32 {
        self.mask
    }

    /// First readable frame.
    #[must_use]
    pub fn head_frame(&self) -> CommandFrame {
        self.head
    }

    /// One past the last readable frame.
    #[must_use]
    pub fn end_frame(&self) -> CommandFrame {
        self.end
    }

    /// Number of frames in the readable window.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.end.frames_since(self.head)
    }

    /// Number of frames `owner` has written that are not yet acknowledged.
    #[must_use]
    pub fn count_owner(&self, owner: &S::Owner) -> u32 {
        self.counter.get(owner).copied().unwrap_or(0)
    }

    /// Returns `true` if no frame is readable.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head == self.end
    }

    #[inline]
    fn index(&self, frame: CommandFrame) -> usize {
        (frame.as_u32() & self.mask) as usize
    }

    /// Returns `true` if `frame` is inside the readable window.
    #[must_use]
    pub fn contains(&self, frame: CommandFrame) -> bool {
        self.head <= frame && frame < self.end
    }

    /// The slot for `frame`, if it is readable.
    #[must_use]
    pub fn read_data(&self, frame: CommandFrame) -> Option<&S> {
        if !self.contains(frame) {
            return None;
        }
        self.slots.get(self.index(frame))
    }

    /// Mutable access to the slot for `frame`, if it is readable.
    pub fn read_data_mut(&mut self, frame: CommandFrame) -> Option<&mut S> {
        if !self.contains(frame) {
            return None;
        }
        let index = self.index(frame);
        self.slots.get_mut(index)
    }

    /// The exact `count` frames ending at `frame`, or an empty view if any
    /// of them is outside the readable window.
    #[must_use]
    pub fn read_range_data(&self, frame: CommandFrame, count: u32) -> CircularQueueView<'_, S> {
        let last = frame.as_u32();
        if count == 0 || last + 1 < count {
            return self.view(frame, 0);
        }
        let first = CommandFrame::new(last + 1 - count);
        if first < self.head || frame >= self.end {
            return self.view(frame, 0);
        }
        self.view(first, count)
    }

    /// The largest window of at most `count` frames ending at
    /// `min(frame, end_frame - 1)` and starting no earlier than `head_frame`.
    #[must_use]
    pub fn read_range_data_shrink(&self, frame: CommandFrame, count: u32) -> CircularQueueView<'_, S> {
        if self.is_empty() || count == 0 {
            return self.view(frame, 0);
        }
        let count = count.min(frame.as_u32() + 1);
        let last = frame.min(CommandFrame::new(self.end.as_u32() - 1));
        let first = CommandFrame::new(frame.as_u32() + 1 - count).max(self.head);
        if first > last {
            return self.view(first, 0);
        }
        self.view(first, last.frames_since(first) + 1)
    }

    fn view(&self, first: CommandFrame, len: u32) -> CircularQueueView<'_, S> {
        CircularQueueView {
            slots: &self.slots,
            mask: self.mask,
            first,
            len,
        }
    }

    /// Returns `true` if [`claim_slot`](Self::claim_slot) would accept `owner` at `frame`.
    #[must_use]
    pub fn can_claim(&self, owner: &S::Owner, frame: CommandFrame) -> bool {
        if frame < self.head {
            return false;
        }
        match self.read_data(frame) {
            Some(slot) => slot.command_frame() != frame || !slot.has_ownership(owner),
            None => true,
        }
    }

    /// Claims the slot for `owner` at `frame`, sliding the window if needed.
    ///
    /// Returns `None` if `frame` is older than `head_frame` or `owner`
    /// already wrote it. On success the owner's counter is incremented and
    /// the caller must record the owner's data in the returned slot.
    pub fn claim_slot(&mut self, owner: S::Owner, frame: CommandFrame) -> Option<&mut S> {
        if frame < self.head {
            return None;
        }

        if frame < self.end {
            let index = self.index(frame);
            let slot = &mut self.slots[index];
            slot.verify(frame);
            if slot.has_ownership(&owner) {
                return None;
            }
        } else {
            let old_end = self.end;
            if frame.frames_since(self.head) + 1 > self.mask {
                self.head = CommandFrame::new(frame.as_u32() + 1 - self.mask);
            }
            self.end = frame + 1;

            let mut fresh = old_end.max(self.head);
            while fresh <= frame {
                let index = self.index(fresh);
                self.slots[index].reset(fresh);
                fresh += 1;
            }
        }

        *self.counter.entry(owner).or_insert(0) += 1;
        let index = self.index(frame);
        self.slots.get_mut(index)
    }

    /// Acknowledges every frame up to and including `frame`.
    ///
    /// Frames before `head_frame` are ignored. If `frame` is at or beyond
    /// `end_frame` the queue is emptied and rebased so that `frame` becomes
    /// the next writable frame.
    pub fn ack_data(&mut self, frame: CommandFrame) {
        if frame < self.head {
            return;
        }
        if frame < self.end {
            let mut acked = self.head;
            while acked <= frame {
                self.release_owners(acked);
                acked += 1;
            }
            self.head = frame + 1;
        } else {
            self.empty();
            self.head = frame;
            self.end = frame;
        }
    }

    /// Acknowledges the oldest buffered frame.
    pub fn ack_next_data(&mut self) {
        if self.is_empty() {
            return;
        }
        self.release_owners(self.head);
        self.head += 1;
        if self.is_empty() {
            self.counter.clear();
        }
    }

    /// Drops every buffered frame and all owner counters. The window keeps its position.
    pub fn empty(&mut self) {
        self.head = self.end;
        self.counter.clear();
    }

    fn release_owners(&mut self, frame: CommandFrame) {
        let index = self.index(frame);
        let slot = &self.slots[index];
        if slot.command_frame() != frame {
            return;
        }
        for (owner, outstanding) in self.counter.iter_mut() {
            if slot.has_ownership(owner) {
                *outstanding = outstanding.saturating_sub(1);
            }
        }
    }
}

impl OwnershipCircularQueue<InputFrame> {
    /// Allocates `count` atoms for `owner` at `frame`.
    ///
    /// Returns `None` if the frame is too old or `owner` already wrote it.
    /// A zero count claims the frame and returns an empty slice.
    pub fn allocate_item_data(
        &mut self,
        owner: OwnerId,
        count: usize,
        frame: CommandFrame,
    ) -> Option<&mut [InputAtom]> {
        self.claim_slot(owner, frame)
            .and_then(|slot| slot.allocate_item(owner, count))
    }

    /// Copies `atoms` in for `owner` at `frame`. Returns `false` if rejected.
    pub fn record_item_data(
        &mut self,
        owner: OwnerId,
        atoms: &[InputAtom],
        frame: CommandFrame,
    ) -> bool {
        self.claim_slot(owner, frame)
            .is_some_and(|slot| slot.add_item(owner, atoms))
    }
}

impl<S: OwnershipSlot> InvariantChecker for OwnershipCircularQueue<S> {
    /// Checks the invariants of the queue.
    ///
    /// # Invariants
    ///
    /// 1. `head_frame <= end_frame`
    /// 2. The window spans at most `max_frames` frames
    /// 3. Every readable slot is stamped with its own frame
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.head > self.end {
            return Err(
                InvariantViolation::new("OwnershipCircularQueue", "head beyond end").with_details(
                    format!("head={}, end={}", self.head, self.end),
                ),
            );
        }

        if self.count() > self.mask {
            return Err(InvariantViolation::new(
                "OwnershipCircularQueue",
                "window exceeds frame budget",
            )
            .with_details(format!("count={}, max={}", self.count(), self.mask)));
        }

        let mut frame = self.head;
        while frame < self.end {
            let stamped = self.slots[self.index(frame)].command_frame();
            if stamped != frame {
                return Err(InvariantViolation::new(
                    "OwnershipCircularQueue",
                    "readable slot holds another frame",
                )
                .with_details(format!("frame={}, stamped={}", frame, stamped)));
            }
            frame += 1;
        }

        Ok(())
    }
}

/// A borrowed run of consecutive frames from an [`OwnershipCircularQueue`].
///
/// The view never copies slots; it maps positions back into the ring.
#[derive(Debug)]
pub struct CircularQueueView<'a, S> {
    slots: &'a [S],
    mask: u32,
    first: CommandFrame,
    len: u32,
}

impl<S> Clone for CircularQueueView<'_, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for CircularQueueView<'_, S> {}

impl<'a, S> CircularQueueView<'a, S> {
    /// Number of frames in the view.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Returns `true` if the view is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Oldest frame in the view.
    #[must_use]
    pub fn first_frame(&self) -> CommandFrame {
        self.first
    }

    /// Newest frame in the view.
    #[must_use]
    pub fn last_frame(&self) -> Option<CommandFrame> {
        (self.len > 0).then(|| self.first + (self.len - 1))
    }

    /// The slot at position `offset` from the oldest frame.
    #[must_use]
    pub fn get(&self, offset: usize) -> Option<&'a S> {
        if offset >= self.len() {
            return None;
        }
        let index = (self.first.as_u32().wrapping_add(offset as u32) & self.mask) as usize;
        self.slots.get(index)
    }

    /// Slots from oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &'a S> + 'a {
        let slots = self.slots;
        let mask = self.mask;
        let first = self.first.as_u32();
        (0..self.len).filter_map(move |offset| {
            slots.get((first.wrapping_add(offset) & mask) as usize)
        })
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
    use crate::{ActionId, InputValue, TriggerEvent};

    type Queue = OwnershipCircularQueue<InputFrame>;

    const A: OwnerId = OwnerId::new(1);
    const B: OwnerId = OwnerId::new(2);

    fn frame(n: u32) -> CommandFrame {
        CommandFrame::new(n)
    }

    fn atom(id: u32) -> InputAtom {
        InputAtom::new(
            ActionId::new(id),
            TriggerEvent::Triggered,
            InputValue::from_bool(true),
        )
    }

    #[test]
    fn capacity_is_power_of_two_above_budget() {
        assert_eq!(round_up_capacity(32), 64);
        assert_eq!(round_up_capacity(31), 32);
        assert_eq!(round_up_capacity(0), 1);
        let queue = Queue::new(32);
        assert_eq!(queue.capacity(), 64);
        assert_eq!(queue.max_frames(), 63);
    }

    #[test]
    fn allocate_extends_window() {
        let mut queue = Queue::new(8);
        let slot = queue.allocate_item_data(A, 2, frame(3)).unwrap();
        slot[0] = atom(1);
        slot[1] = atom(2);
        assert_eq!(queue.head_frame(), frame(0));
        assert_eq!(queue.end_frame(), frame(4));
        assert_eq!(queue.read_data(frame(3)).unwrap().atoms(), &[atom(1), atom(2)]);
        assert!(queue.read_data(frame(1)).unwrap().atoms().is_empty());
        assert!(queue.read_data(frame(4)).is_none());
        assert_eq!(queue.count_owner(&A), 1);
    }

    #[test]
    fn rejects_duplicate_owner_but_accepts_others() {
        let mut queue = Queue::new(8);
        assert!(queue.record_item_data(A, &[atom(1)], frame(1)));
        assert!(!queue.record_item_data(A, &[atom(2)], frame(1)));
        assert!(queue.allocate_item_data(A, 1, frame(1)).is_none());
        assert!(queue.record_item_data(B, &[atom(3)], frame(1)));
        assert_eq!(queue.read_data(frame(1)).unwrap().atoms().len(), 2);
        assert_eq!(queue.count_owner(&A), 1);
        assert_eq!(queue.count_owner(&B), 1);
    }

    #[test]
    fn can_claim_matches_claim_slot() {
        let mut queue = Queue::new(8);
        assert!(queue.can_claim(&A, frame(3)));
        assert!(queue.record_item_data(A, &[atom(1)], frame(3)));
        assert!(!queue.can_claim(&A, frame(3)));
        assert!(queue.can_claim(&B, frame(3)));
        assert!(queue.can_claim(&A, frame(40)));
        queue.ack_data(frame(3));
        assert!(!queue.can_claim(&B, frame(3)));
        assert!(queue.can_claim(&A, frame(4)));
    }

    #[test]
    fn rejects_frames_before_head() {
        let mut queue = Queue::new(8);
        for n in 1..=4 {
            queue.allocate_item_data(A, 0, frame(n)).unwrap();
        }
        queue.ack_data(frame(2));
        assert_eq!(queue.head_frame(), frame(3));
        assert!(queue.allocate_item_data(B, 0, frame(2)).is_none());
        assert!(queue.allocate_item_data(B, 0, frame(3)).is_some());
    }

    #[test]
    fn slide_evicts_oldest_frames() {
        let mut queue = Queue::new(4); // capacity 8, budget 7
        for n in 0..7 {
            queue.record_item_data(A, &[atom(n)], frame(n));
        }
        assert_eq!(queue.head_frame(), frame(0));
        queue.record_item_data(A, &[atom(7)], frame(7));
        assert_eq!(queue.head_frame(), frame(1));
        assert_eq!(queue.end_frame(), frame(8));
        assert!(queue.read_data(frame(0)).is_none());

        // eviction leaves the outstanding count alone
        assert_eq!(queue.count_owner(&A), 8);
        crate::debug_check_invariants!(queue);
        assert!(queue.check_invariants().is_ok());
    }

    #[test]
    fn far_jump_resets_window() {
        let mut queue = Queue::new(4);
        queue.record_item_data(A, &[atom(1)], frame(1));
        queue.record_item_data(B, &[atom(2)], frame(100));
        assert_eq!(queue.head_frame(), frame(94));
        assert_eq!(queue.end_frame(), frame(101));
        for n in 94..100 {
            assert!(queue.read_data(frame(n)).unwrap().atoms().is_empty());
        }
        assert!(queue.check_invariants().is_ok());
    }

    #[test]
    fn ack_decrements_only_present_owners() {
        let mut queue = Queue::new(8);
        queue.record_item_data(A, &[atom(1)], frame(1));
        queue.record_item_data(A, &[atom(1)], frame(2));
        queue.record_item_data(B, &[atom(2)], frame(2));
        queue.ack_data(frame(1));
        assert_eq!(queue.count_owner(&A), 1);
        assert_eq!(queue.count_owner(&B), 1);
        queue.ack_next_data();
        assert_eq!(queue.count_owner(&A), 0);
        assert_eq!(queue.count_owner(&B), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn ack_is_monotonic() {
        let mut queue = Queue::new(8);
        for n in 1..=6 {
            queue.allocate_item_data(A, 0, frame(n)).unwrap();
        }
        queue.ack_data(frame(4));
        assert_eq!(queue.head_frame(), frame(5));
        queue.ack_data(frame(2));
        assert_eq!(queue.head_frame(), frame(5));
    }

    #[test]
    fn ack_past_end_rebases() {
        let mut queue = Queue::new(8);
        queue.allocate_item_data(A, 0, frame(2)).unwrap();
        queue.ack_data(frame(20));
        assert!(queue.is_empty());
        assert_eq!(queue.head_frame(), frame(20));
        assert_eq!(queue.count_owner(&A), 0);
        assert!(queue.allocate_item_data(A, 0, frame(20)).is_some());
        assert!(queue.allocate_item_data(A, 0, frame(19)).is_none());
    }

    #[test]
    fn ack_next_on_empty_is_noop() {
        let mut queue = Queue::new(8);
        queue.ack_next_data();
        assert_eq!(queue.head_frame(), frame(0));
        assert_eq!(queue.end_frame(), frame(0));
    }

    #[test]
    fn range_read_is_exact_or_empty() {
        let mut queue = Queue::new(16);
        for n in 3..=9 {
            queue.allocate_item_data(A, 0, frame(n)).unwrap();
        }
        queue.ack_data(frame(3));
        let window = queue.read_range_data(frame(8), 4);
        assert_eq!(window.first_frame(), frame(5));
        assert_eq!(window.last_frame(), Some(frame(8)));
        assert!(queue.read_range_data(frame(8), 6).is_empty());
        assert!(queue.read_range_data(frame(10), 2).is_empty());
    }

    #[test]
    fn shrink_read_clips_both_ends() {
        let mut queue = Queue::new(16);
        for n in 10..=15 {
            queue.allocate_item_data(A, 0, frame(n)).unwrap();
        }
        queue.ack_data(frame(9));
        assert_eq!(queue.head_frame(), frame(10));

        let window = queue.read_range_data_shrink(frame(15), 16);
        assert_eq!(window.first_frame(), frame(10));
        assert_eq!(window.len(), 6);

        let window = queue.read_range_data_shrink(frame(40), 4);
        assert!(window.is_empty());

        let window = queue.read_range_data_shrink(frame(12), 2);
        let frames: Vec<CommandFrame> = window.iter().map(|slot| slot.command_frame()).collect();
        assert_eq!(frames, vec![frame(11), frame(12)]);
        assert_eq!(window.get(2).map(OwnershipSlot::command_frame), None);
    }

    #[test]
    fn shrink_read_near_zero() {
        let mut queue = Queue::new(16);
        queue.allocate_item_data(A, 0, frame(1)).unwrap();
        let window = queue.read_range_data_shrink(frame(1), 16);
        assert_eq!(window.first_frame(), frame(0));
        assert_eq!(window.len(), 2);
    }
}
