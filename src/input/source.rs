//! The seam between the host input system and the command frame loop.
//!
//! Each fixed frame a client drains the [`InputSource`] into the input ring.
//! [`CommandInputQueue`] is the bundled implementation: it groups atoms into
//! priority filters so that, for example, movement atoms always precede
//! aim atoms inside a frame.

use crate::InputAtom;

/// Supplies the atoms captured since the last fixed frame.
pub trait InputSource {
    /// Number of atoms waiting to be popped.
    fn input_num(&self) -> usize;

    /// Moves up to `out.len()` pending atoms into `out` and returns how many
    /// were written. Any atoms that did not fit stay pending.
    fn pop_inputs_into(&mut self, out: &mut [InputAtom]) -> usize;

    /// Discards all pending atoms.
    fn clear_input(&mut self);
}

/// Priority group an atom is recorded under.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InputGroup {
    /// Local-only input; never synced to the server.
    Default,
    /// General actions.
    Common,
    /// Aiming.
    Aim,
    /// Movement.
    Move,
}

impl InputGroup {
    /// Pop priority; higher drains first. `None` for [`InputGroup::Default`].
    #[must_use]
    pub const fn priority(self) -> Option<u32> {
        match self {
            InputGroup::Default => None,
            InputGroup::Common => Some(1),
            InputGroup::Aim => Some(10),
            InputGroup::Move => Some(100),
        }
    }
}

#[derive(Debug)]
struct InputFilter {
    group: InputGroup,
    priority: u32,
    atoms: Vec<InputAtom>,
}

/// Prioritised [`InputSource`].
///
/// ```
/// use command_frame_net::{ActionId, CommandInputQueue, InputAtom, InputGroup, InputSource,
///     InputValue, TriggerEvent};
///
/// let mut queue = CommandInputQueue::new();
/// let fire = InputAtom::new(ActionId::new(1), TriggerEvent::Triggered, InputValue::from_bool(true));
/// let walk = InputAtom::new(ActionId::new(2), TriggerEvent::Triggered, InputValue::axis2d(1.0, 0.0));
/// queue.record_input(fire, InputGroup::Common);
/// queue.record_input(walk, InputGroup::Move);
///
/// let mut out = [InputAtom::default(); 2];
/// assert_eq!(queue.pop_inputs_into(&mut out), 2);
/// assert_eq!(out[0], walk);
/// assert_eq!(out[1], fire);
/// ```
#[derive(Debug)]
pub struct CommandInputQueue {
    // sorted by descending priority
    filters: Vec<InputFilter>,
    local_only: Vec<InputAtom>,
}

impl Default for CommandInputQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandInputQueue {
    /// Creates a queue with the Common, Aim and Move filters.
    #[must_use]
    pub fn new() -> Self {
        let mut filters: Vec<InputFilter> = [InputGroup::Common, InputGroup::Aim, InputGroup::Move]
            .into_iter()
            .filter_map(|group| {
                group.priority().map(|priority| InputFilter {
                    group,
                    priority,
                    atoms: Vec::new(),
                })
            })
            .collect();
        filters.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self {
            filters,
            local_only: Vec::new(),
        }
    }

    /// Records an atom under `group`. [`InputGroup::Default`] atoms are kept
    /// apart and can only be read through [`CommandInputQueue::take_local_inputs`].
    pub fn record_input(&mut self, atom: InputAtom, group: InputGroup) {
        if group == InputGroup::Default {
            self.local_only.push(atom);
            return;
        }
        if let Some(filter) = self.filters.iter_mut().find(|f| f.group == group) {
            filter.atoms.push(atom);
        }
    }

    /// Drains the local-only atoms.
    pub fn take_local_inputs(&mut self) -> Vec<InputAtom> {
        std::mem::take(&mut self.local_only)
    }
}

impl InputSource for CommandInputQueue {
    fn input_num(&self) -> usize {
        self.filters.iter().map(|f| f.atoms.len()).sum()
    }

    fn pop_inputs_into(&mut self, out: &mut [InputAtom]) -> usize {
        let mut written = 0;
        for filter in &mut self.filters {
            let room = out.len() - written;
            if room == 0 {
                break;
            }
            let take = room.min(filter.atoms.len());
            for (slot, atom) in out[written..written + take]
                .iter_mut()
                .zip(filter.atoms.drain(..take))
            {
                *slot = atom;
            }
            written += take;
        }
        written
    }

    fn clear_input(&mut self) {
        for filter in &mut self.filters {
            filter.atoms.clear();
        }
        self.local_only.clear();
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

    fn atom(id: u32) -> InputAtom {
        InputAtom::new(
            ActionId::new(id),
            TriggerEvent::Triggered,
            InputValue::from_bool(true),
        )
    }

    #[test]
    fn pops_by_priority_then_recording_order() {
        let mut queue = CommandInputQueue::new();
        queue.record_input(atom(1), InputGroup::Common);
        queue.record_input(atom(2), InputGroup::Aim);
        queue.record_input(atom(3), InputGroup::Move);
        queue.record_input(atom(4), InputGroup::Aim);
        assert_eq!(queue.input_num(), 4);

        let mut out = [InputAtom::default(); 4];
        assert_eq!(queue.pop_inputs_into(&mut out), 4);
        let ids: Vec<ActionId> = out
            .iter()
            .map(|a| match a.action {
                crate::ActionRef::Local(id) => id,
                crate::ActionRef::Replicated(_) => panic!("unexpected replicated atom"),
            })
            .collect();
        assert_eq!(
            ids,
            vec![
                ActionId::new(3),
                ActionId::new(2),
                ActionId::new(4),
                ActionId::new(1)
            ]
        );
        assert_eq!(queue.input_num(), 0);
    }

    #[test]
    fn short_buffer_leaves_remaining_atoms() {
        let mut queue = CommandInputQueue::new();
        queue.record_input(atom(1), InputGroup::Move);
        queue.record_input(atom(2), InputGroup::Common);

        let mut out = [InputAtom::default(); 1];
        assert_eq!(queue.pop_inputs_into(&mut out), 1);
        assert_eq!(out[0], atom(1));
        assert_eq!(queue.input_num(), 1);
    }

    #[test]
    fn default_group_is_not_synced() {
        let mut queue = CommandInputQueue::new();
        queue.record_input(atom(9), InputGroup::Default);
        assert_eq!(queue.input_num(), 0);
        assert_eq!(queue.take_local_inputs(), vec![atom(9)]);
    }

    #[test]
    fn clear_discards_everything() {
        let mut queue = CommandInputQueue::new();
        queue.record_input(atom(1), InputGroup::Move);
        queue.record_input(atom(2), InputGroup::Default);
        queue.clear_input();
        assert_eq!(queue.input_num(), 0);
        assert!(queue.take_local_inputs().is_empty());
    }
}
