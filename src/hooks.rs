//! Ordered frame-phase callbacks.
//!
//! Every fixed frame the [`CommandFrameManager`](crate::CommandFrameManager)
//! broadcasts six phases in a fixed order:
//!
//! ```text
//! PreEnd -> End -> PostEnd        (closing the previous frame)
//! PreBegin -> Begin -> PostBegin  (opening the next frame)
//! ```
//!
//! Callbacks in a phase run in subscription order. A callback may cancel any
//! [`HookHandle`], including its own, while a broadcast is running; cancelled
//! entries are skipped immediately and removed once the broadcast finishes.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use crate::CommandFrame;

/// Frame phases, in broadcast order within their half of the frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FramePhase {
    /// Before the new frame is opened.
    PreBegin,
    /// The new frame is opened; server input has not been simulated yet.
    Begin,
    /// After input for the new frame was simulated.
    PostBegin,
    /// Before the previous frame is closed.
    PreEnd,
    /// The previous frame is closed.
    End,
    /// After delta packets for the previous frame were sent.
    PostEnd,
}

impl FramePhase {
    /// All phases.
    pub const ALL: [FramePhase; 6] = [
        FramePhase::PreBegin,
        FramePhase::Begin,
        FramePhase::PostBegin,
        FramePhase::PreEnd,
        FramePhase::End,
        FramePhase::PostEnd,
    ];

    const fn index(self) -> usize {
        match self {
            FramePhase::PreBegin => 0,
            FramePhase::Begin => 1,
            FramePhase::PostBegin => 2,
            FramePhase::PreEnd => 3,
            FramePhase::End => 4,
            FramePhase::PostEnd => 5,
        }
    }
}

/// Arguments passed to every frame hook.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct FrameTick {
    /// Fixed step in seconds.
    pub delta_time: f32,
    /// The real command frame.
    pub real_frame: CommandFrame,
    /// The frame being simulated; behind `real_frame` during a replay.
    pub internal_frame: CommandFrame,
}

impl FrameTick {
    /// Returns `true` if this tick belongs to a replay.
    #[must_use]
    pub fn is_rewinding(&self) -> bool {
        self.internal_frame < self.real_frame
    }
}

/// Subscription token returned by [`FrameHooks::subscribe`].
///
/// Dropping the handle does not unsubscribe; call [`HookHandle::cancel`].
#[derive(Debug, Clone)]
pub struct HookHandle {
    id: u64,
    phase: FramePhase,
    alive: Rc<Cell<bool>>,
}

impl HookHandle {
    /// The phase this hook is subscribed to.
    #[must_use]
    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    /// Stops the hook from being called again.
    pub fn cancel(&self) {
        self.alive.set(false);
    }

    /// Returns `false` once the hook was cancelled.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.alive.get()
    }
}

type HookCallback = Box<dyn FnMut(&FrameTick)>;

struct HookEntry {
    id: u64,
    alive: Rc<Cell<bool>>,
    callback: HookCallback,
}

/// Callback lists for every [`FramePhase`]. See the [module docs](self).
#[derive(Default)]
pub struct FrameHooks {
    next_id: u64,
    phases: [Vec<HookEntry>; 6],
}

impl fmt::Debug for FrameHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for phase in FramePhase::ALL {
            map.entry(&phase, &self.len(phase));
        }
        map.finish()
    }
}

impl FrameHooks {
    /// Creates empty hook lists.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `callback` to `phase`.
    pub fn subscribe(
        &mut self,
        phase: FramePhase,
        callback: impl FnMut(&FrameTick) + 'static,
    ) -> HookHandle {
        let id = self.next_id;
        self.next_id += 1;
        let alive = Rc::new(Cell::new(true));
        self.phases[phase.index()].push(HookEntry {
            id,
            alive: Rc::clone(&alive),
            callback: Box::new(callback),
        });
        HookHandle { id, phase, alive }
    }

    /// Removes the hook. Returns `false` if it was already gone.
    pub fn unsubscribe(&mut self, handle: &HookHandle) -> bool {
        handle.cancel();
        let list = &mut self.phases[handle.phase.index()];
        let before = list.len();
        list.retain(|entry| entry.id != handle.id);
        list.len() != before
    }

    /// Number of live hooks in `phase`.
    #[must_use]
    pub fn len(&self, phase: FramePhase) -> usize {
        self.phases[phase.index()]
            .iter()
            .filter(|entry| entry.alive.get())
            .count()
    }

    /// Returns `true` if no phase has a live hook.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        FramePhase::ALL.into_iter().all(|phase| self.len(phase) == 0)
    }

    /// Removes every hook.
    pub fn clear(&mut self) {
        for list in &mut self.phases {
            for entry in list.drain(..) {
                entry.alive.set(false);
            }
        }
    }

    /// Calls every live hook of `phase` in subscription order.
    pub fn broadcast(&mut self, phase: FramePhase, tick: &FrameTick) {
        let list = &mut self.phases[phase.index()];
        for entry in list.iter_mut() {
            if entry.alive.get() {
                (entry.callback)(tick);
            }
        }
        list.retain(|entry| entry.alive.get());
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
    use std::cell::RefCell;

    fn tick(real: u32, internal: u32) -> FrameTick {
        FrameTick {
            delta_time: 1.0 / 30.0,
            real_frame: CommandFrame::new(real),
            internal_frame: CommandFrame::new(internal),
        }
    }

    #[test]
    fn broadcast_in_subscription_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut hooks = FrameHooks::new();
        for tag in ["a", "b", "c"] {
            let log = Rc::clone(&log);
            hooks.subscribe(FramePhase::Begin, move |_| log.borrow_mut().push(tag));
        }
        hooks.broadcast(FramePhase::Begin, &tick(1, 1));
        hooks.broadcast(FramePhase::End, &tick(1, 1));
        assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn cancel_during_broadcast_skips_later_hooks() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut hooks = FrameHooks::new();
        let victim: Rc<RefCell<Option<HookHandle>>> = Rc::new(RefCell::new(None));

        {
            let log = Rc::clone(&log);
            let victim = Rc::clone(&victim);
            hooks.subscribe(FramePhase::End, move |_| {
                log.borrow_mut().push("first");
                if let Some(handle) = victim.borrow().as_ref() {
                    handle.cancel();
                }
            });
        }
        let log2 = Rc::clone(&log);
        let handle = hooks.subscribe(FramePhase::End, move |_| log2.borrow_mut().push("second"));
        *victim.borrow_mut() = Some(handle.clone());

        hooks.broadcast(FramePhase::End, &tick(2, 2));
        assert_eq!(*log.borrow(), vec!["first"]);
        assert!(!handle.is_active());
        assert_eq!(hooks.len(FramePhase::End), 1);
    }

    #[test]
    fn unsubscribe_removes_entry() {
        let mut hooks = FrameHooks::new();
        let handle = hooks.subscribe(FramePhase::PostBegin, |_| {});
        assert!(!hooks.is_empty());
        assert!(hooks.unsubscribe(&handle));
        assert!(!hooks.unsubscribe(&handle));
        assert!(hooks.is_empty());
    }

    #[test]
    fn tick_reports_rewinding() {
        assert!(tick(10, 6).is_rewinding());
        assert!(!tick(10, 10).is_rewinding());
    }
}
