//! Per-player action bindings consumed by input simulation.
//!
//! A player's [`InputStack`] walks pawn layers first, then the controller
//! layer, then any pushed layers. Every binding whose action and trigger
//! match an atom is invoked, in that order.

use std::collections::BTreeMap;

use smallvec::SmallVec;

use crate::{ActionId, InputAtom, TriggerEvent};

/// Callback run when a bound action fires during simulation.
pub type BindingCallback = Box<dyn FnMut(&InputAtom)>;

/// Identifies a binding inside its layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BindingHandle(u32);

struct InputBinding {
    handle: BindingHandle,
    action: ActionId,
    trigger: TriggerEvent,
    callback: BindingCallback,
}

/// A set of bindings contributed by one pawn component, controller or pushed context.
#[derive(Default)]
pub struct InputLayer {
    bindings: Vec<InputBinding>,
    next_handle: u32,
}

impl std::fmt::Debug for InputLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputLayer")
            .field("bindings", &self.bindings.len())
            .finish()
    }
}

impl InputLayer {
    /// Creates an empty layer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `callback` to `action` firing with `trigger`.
    pub fn bind_action(
        &mut self,
        action: ActionId,
        trigger: TriggerEvent,
        callback: impl FnMut(&InputAtom) + 'static,
    ) -> BindingHandle {
        let handle = BindingHandle(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1);
        self.bindings.push(InputBinding {
            handle,
            action,
            trigger,
            callback: Box::new(callback),
        });
        handle
    }

    /// Removes a binding. Returns `false` if it was already gone.
    pub fn remove_binding(&mut self, handle: BindingHandle) -> bool {
        let before = self.bindings.len();
        self.bindings.retain(|binding| binding.handle != handle);
        before != self.bindings.len()
    }

    /// Number of bindings in this layer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Returns `true` if the layer has no bindings.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum LayerSlot {
    Pawn(usize),
    Controller,
    Pushed(usize),
}

/// Location of one binding inside an [`InputStack`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct BindingSlot {
    layer: LayerSlot,
    index: usize,
}

/// Bindings of one action, in stack order.
pub(crate) type ActionBindings = BTreeMap<ActionId, SmallVec<[BindingSlot; 2]>>;

/// One player's layered bindings.
#[derive(Debug, Default)]
pub struct InputStack {
    pawn_layers: Vec<InputLayer>,
    controller: InputLayer,
    pushed: Vec<InputLayer>,
}

impl InputStack {
    /// Creates an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a pawn layer and returns its index.
    pub fn add_pawn_layer(&mut self, layer: InputLayer) -> usize {
        self.pawn_layers.push(layer);
        self.pawn_layers.len() - 1
    }

    /// Removes every pawn layer, e.g. when the player's pawn is replaced.
    pub fn clear_pawn_layers(&mut self) {
        self.pawn_layers.clear();
    }

    /// The controller's own layer.
    pub fn controller_mut(&mut self) -> &mut InputLayer {
        &mut self.controller
    }

    /// Pushes a layer on top of the stack.
    pub fn push_layer(&mut self, layer: InputLayer) {
        self.pushed.push(layer);
    }

    /// Pops the top pushed layer.
    pub fn pop_layer(&mut self) -> Option<InputLayer> {
        self.pushed.pop()
    }

    /// Maps every bound action to its bindings, pawn layers first.
    pub(crate) fn action_bindings(&self) -> ActionBindings {
        let mut map = ActionBindings::new();
        let layers = self
            .pawn_layers
            .iter()
            .enumerate()
            .map(|(i, layer)| (LayerSlot::Pawn(i), layer))
            .chain(std::iter::once((LayerSlot::Controller, &self.controller)))
            .chain(
                self.pushed
                    .iter()
                    .enumerate()
                    .map(|(i, layer)| (LayerSlot::Pushed(i), layer)),
            );
        for (slot, layer) in layers {
            for (index, binding) in layer.bindings.iter().enumerate() {
                map.entry(binding.action)
                    .or_default()
                    .push(BindingSlot { layer: slot, index });
            }
        }
        map
    }

    /// Invokes the binding at `slot` if its trigger matches the atom.
    pub(crate) fn invoke(&mut self, slot: BindingSlot, atom: &InputAtom) -> bool {
        let layer = match slot.layer {
            LayerSlot::Pawn(i) => self.pawn_layers.get_mut(i),
            LayerSlot::Controller => Some(&mut self.controller),
            LayerSlot::Pushed(i) => self.pushed.get_mut(i),
        };
        let Some(binding) = layer.and_then(|layer| layer.bindings.get_mut(slot.index)) else {
            return false;
        };
        if binding.trigger != atom.trigger_event || atom.trigger_event == TriggerEvent::None {
            return false;
        }
        (binding.callback)(atom);
        true
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
    use crate::InputValue;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn recorder(log: &Rc<RefCell<Vec<&'static str>>>, tag: &'static str) -> impl FnMut(&InputAtom) {
        let log = Rc::clone(log);
        move |_| log.borrow_mut().push(tag)
    }

    #[test]
    fn bindings_fire_in_stack_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let jump = ActionId::new(1);

        let mut stack = InputStack::new();
        let mut pushed = InputLayer::new();
        pushed.bind_action(jump, TriggerEvent::Triggered, recorder(&log, "pushed"));
        stack.push_layer(pushed);
        stack
            .controller_mut()
            .bind_action(jump, TriggerEvent::Triggered, recorder(&log, "controller"));
        let mut pawn = InputLayer::new();
        pawn.bind_action(jump, TriggerEvent::Triggered, recorder(&log, "pawn"));
        stack.add_pawn_layer(pawn);

        let atom = InputAtom::new(jump, TriggerEvent::Triggered, InputValue::from_bool(true));
        let map = stack.action_bindings();
        for slot in &map[&jump] {
            stack.invoke(*slot, &atom);
        }
        assert_eq!(*log.borrow(), vec!["pawn", "controller", "pushed"]);
    }

    #[test]
    fn trigger_must_match() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let fire = ActionId::new(2);
        let mut stack = InputStack::new();
        stack
            .controller_mut()
            .bind_action(fire, TriggerEvent::Completed, recorder(&log, "completed"));

        let map = stack.action_bindings();
        let started = InputAtom::new(fire, TriggerEvent::Started, InputValue::default());
        assert!(!stack.invoke(map[&fire][0], &started));
        let completed = InputAtom::new(fire, TriggerEvent::Completed, InputValue::default());
        assert!(stack.invoke(map[&fire][0], &completed));
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn removed_binding_is_not_indexed() {
        let mut layer = InputLayer::new();
        let handle = layer.bind_action(ActionId::new(3), TriggerEvent::Triggered, |_| {});
        assert!(layer.remove_binding(handle));
        assert!(!layer.remove_binding(handle));
        assert!(layer.is_empty());

        let mut stack = InputStack::new();
        stack.add_pawn_layer(layer);
        assert!(stack.action_bindings().is_empty());
    }
}
