//! Recorded input events.
//!
//! An [`InputAtom`] is one triggered input action captured during a command
//! frame. Atoms are plain data: once recorded they are copied into the input
//! ring, encoded into input packets and replayed unchanged.

use serde::{Deserialize, Serialize};

/// Wire schema version of [`InputAtom`]. Written at the start of every
/// encoded atom block; decoders reject any other value.
pub const INPUT_ATOM_SCHEMA_VERSION: u8 = 1;

/// Process-local identifier of an input action.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ActionId(u32);

impl ActionId {
    /// Creates an action id.
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        ActionId(id)
    }

    /// Returns the underlying id.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

/// Session-wide network handle of a replicated input action.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct NetHandle(u32);

impl NetHandle {
    /// Creates a network handle.
    #[inline]
    #[must_use]
    pub const fn new(handle: u32) -> Self {
        NetHandle(handle)
    }

    /// Returns the underlying handle.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

/// Which action an atom refers to.
///
/// Locally captured atoms carry the [`ActionId`] directly; atoms decoded
/// from a peer may carry a [`NetHandle`] that the receiver resolves through
/// its replicated action table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionRef {
    /// An action known to this process.
    Local(ActionId),
    /// An action identified by its replicated handle.
    Replicated(NetHandle),
}

impl Default for ActionRef {
    fn default() -> Self {
        ActionRef::Local(ActionId::default())
    }
}

/// Trigger state reported by the input system for an action.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerEvent {
    /// No trigger state; never matches a binding.
    #[default]
    None,
    /// The action fired this frame.
    Triggered,
    /// The action started evaluating.
    Started,
    /// The action is still being evaluated.
    Ongoing,
    /// Evaluation stopped before the action fired.
    Canceled,
    /// The action finished firing.
    Completed,
}

/// Shape of an input value.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InputValueType {
    /// A button: `x > 0` means pressed.
    #[default]
    Bool,
    /// One axis.
    Axis1D,
    /// Two axes.
    Axis2D,
    /// Three axes.
    Axis3D,
}

/// A tagged input value stored as a 3-vector.
#[derive(Debug, Default, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputValue {
    /// How many components are meaningful.
    pub value_type: InputValueType,
    /// The components; unused ones are zero.
    pub components: [f32; 3],
}

impl InputValue {
    /// A button value.
    #[must_use]
    pub fn from_bool(pressed: bool) -> Self {
        Self {
            value_type: InputValueType::Bool,
            components: [if pressed { 1.0 } else { 0.0 }, 0.0, 0.0],
        }
    }

    /// A one-axis value.
    #[must_use]
    pub fn axis1d(x: f32) -> Self {
        Self {
            value_type: InputValueType::Axis1D,
            components: [x, 0.0, 0.0],
        }
    }

    /// A two-axis value.
    #[must_use]
    pub fn axis2d(x: f32, y: f32) -> Self {
        Self {
            value_type: InputValueType::Axis2D,
            components: [x, y, 0.0],
        }
    }

    /// A three-axis value.
    #[must_use]
    pub fn axis3d(x: f32, y: f32, z: f32) -> Self {
        Self {
            value_type: InputValueType::Axis3D,
            components: [x, y, z],
        }
    }

    /// Interprets the value as a button.
    #[must_use]
    pub fn as_bool(&self) -> bool {
        self.components[0] > 0.0
    }

    /// The first component.
    #[must_use]
    pub fn as_axis1d(&self) -> f32 {
        self.components[0]
    }

    /// The first two components.
    #[must_use]
    pub fn as_axis2d(&self) -> [f32; 2] {
        [self.components[0], self.components[1]]
    }
}

/// One recorded input event.
#[derive(Debug, Default, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputAtom {
    /// The action this event belongs to.
    pub action: ActionRef,
    /// Trigger state at capture time.
    pub trigger_event: TriggerEvent,
    /// World time at which the action last triggered.
    pub last_triggered_time: f32,
    /// Seconds the action has been evaluated.
    pub elapsed_processed_time: f32,
    /// Seconds the action has been triggering.
    pub elapsed_triggered_time: f32,
    /// The action value.
    pub value: InputValue,
}

impl InputAtom {
    /// Creates an atom for a local action with zeroed timing fields.
    #[must_use]
    pub fn new(action: ActionId, trigger_event: TriggerEvent, value: InputValue) -> Self {
        Self {
            action: ActionRef::Local(action),
            trigger_event,
            value,
            ..Self::default()
        }
    }

    /// Sets the timing fields.
    #[must_use]
    pub fn with_timing(
        mut self,
        last_triggered_time: f32,
        elapsed_processed_time: f32,
        elapsed_triggered_time: f32,
    ) -> Self {
        self.last_triggered_time = last_triggered_time;
        self.elapsed_processed_time = elapsed_processed_time;
        self.elapsed_triggered_time = elapsed_triggered_time;
        self
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
    use crate::network::codec::{decode, encode};

    #[test]
    fn values_keep_their_tag() {
        assert!(InputValue::from_bool(true).as_bool());
        assert!(!InputValue::from_bool(false).as_bool());
        assert_eq!(InputValue::axis2d(0.5, -1.0).as_axis2d(), [0.5, -1.0]);
        assert_eq!(
            InputValue::axis3d(1.0, 2.0, 3.0).value_type,
            InputValueType::Axis3D
        );
    }

    #[test]
    fn atom_layout_is_fixed_width() {
        let local = InputAtom::new(
            ActionId::new(4),
            TriggerEvent::Triggered,
            InputValue::axis1d(1.0),
        );
        let replicated = InputAtom {
            action: ActionRef::Replicated(NetHandle::new(u32::MAX)),
            ..local
        };
        let a = encode(&local).unwrap();
        let b = encode(&replicated).unwrap();
        assert_eq!(a.len(), b.len());

        let (decoded, used): (InputAtom, _) = decode(&b).unwrap();
        assert_eq!(decoded, replicated);
        assert_eq!(used, b.len());
    }

    #[test]
    fn default_atom_never_triggers() {
        let atom = InputAtom::default();
        assert_eq!(atom.trigger_event, TriggerEvent::None);
        assert_eq!(atom.action, ActionRef::Local(ActionId::new(0)));
    }
}
