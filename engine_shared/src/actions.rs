//! Per-entity action state.
//!
//! Maps wire ids to a pressure in `[0, 1]`. Only non-zero pressures are
//! stored; a missing entry reads as zero.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::bindings::{Device, WireId};

/// Action pressures plus the relative mouse movement accumulated since the
/// last clear.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionState {
    values: BTreeMap<WireId, f32>,
    mouse: [f32; 2],
    device: Option<Device>,
}

impl ActionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` for `action`. Returns `false` when nothing changed.
    pub fn set_action(&mut self, action: WireId, value: f32) -> bool {
        if self.get_action_value(action) == value {
            return false;
        }
        if value == 0.0 {
            self.values.remove(&action);
        } else {
            self.values.insert(action, value);
        }
        true
    }

    pub fn get_action_value(&self, action: WireId) -> f32 {
        self.values.get(&action).copied().unwrap_or(0.0)
    }

    /// Device that produced the latest local input, if any.
    pub fn device(&self) -> Option<Device> {
        self.device
    }

    pub fn set_device(&mut self, device: Device) {
        self.device = Some(device);
    }

    pub fn add_mouse_movement(&mut self, dx: f32, dy: f32) {
        self.mouse[0] += dx;
        self.mouse[1] += dy;
    }

    pub fn mouse_movement(&self) -> [f32; 2] {
        self.mouse
    }

    /// Drops every action and resets the mouse accumulator to the origin.
    pub fn clear(&mut self) {
        self.values.clear();
        self.mouse = [0.0, 0.0];
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Active actions in wire id order.
    pub fn iter(&self) -> impl Iterator<Item = (WireId, f32)> + '_ {
        self.values.iter().map(|(k, v)| (*k, *v))
    }

    pub fn to_frame(&self) -> ActionFrame {
        ActionFrame {
            actions: self.iter().collect(),
            mouse: self.mouse,
        }
    }

    /// Replaces the whole state with a frame received from the network.
    ///
    /// Returns `true` if any observable value changed.
    pub fn apply_frame(&mut self, frame: &ActionFrame) -> bool {
        let mut next = BTreeMap::new();
        for &(action, value) in &frame.actions {
            if value != 0.0 {
                next.insert(action, value);
            }
        }
        let changed = next != self.values || frame.mouse != self.mouse;
        self.values = next;
        self.mouse = frame.mouse;
        changed
    }
}

/// Wire form of an action state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionFrame {
    /// `(wire id, pressure)` pairs, non-zero only.
    pub actions: Vec<(WireId, f32)>,
    #[serde(default)]
    pub mouse: [f32; 2],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_deletes_and_absent_reads_zero() {
        let mut state = ActionState::new();
        assert_eq!(state.get_action_value(5), 0.0);
        assert!(state.set_action(5, 1.0));
        assert_eq!(state.get_action_value(5), 1.0);
        assert!(state.set_action(5, 0.0));
        assert!(state.is_empty());
    }

    #[test]
    fn same_value_is_not_a_change() {
        let mut state = ActionState::new();
        assert!(state.set_action(5, 0.5));
        assert!(!state.set_action(5, 0.5));
        assert!(!state.set_action(6, 0.0));
    }

    #[test]
    fn clear_resets_actions_and_mouse() {
        let mut state = ActionState::new();
        state.set_action(1, 1.0);
        state.set_action(7, 0.25);
        state.add_mouse_movement(3.0, -4.0);
        state.clear();
        for action in [1, 7, 99] {
            assert_eq!(state.get_action_value(action), 0.0);
        }
        assert_eq!(state.mouse_movement(), [0.0, 0.0]);
    }

    #[test]
    fn frame_replaces_state() {
        let mut state = ActionState::new();
        state.set_action(1, 1.0);
        let frame = ActionFrame {
            actions: vec![(5, 0.75), (6, 0.0)],
            mouse: [1.0, 2.0],
        };
        assert!(state.apply_frame(&frame));
        assert_eq!(state.get_action_value(1), 0.0);
        assert_eq!(state.get_action_value(5), 0.75);
        assert_eq!(state.to_frame().actions, vec![(5, 0.75)]);
        assert!(!state.apply_frame(&frame));
    }
}
