//! User settings store.
//!
//! Holds JSON values by key and announces every change on the event bus as
//! `EngineEvent::SettingsChanged`. Persisting settings is the host's job.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    bindings::KeyTable,
    event::{EngineEvent, EventBus},
};

pub const MOVEMENT_DEADZONE: &str = "movement_deadzone";
pub const MOUSE_SENSITIVITY: &str = "mouse_sensitivity";
pub const CUSTOM_CONTROLS: &str = "custom_controls";

pub const DEFAULT_DEADZONE: f32 = 0.2;
pub const DEFAULT_MOUSE_SENSITIVITY: f32 = 1.0;

/// Key/value settings with change notification.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    values: BTreeMap<String, Value>,
    bus: Option<EventBus>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings that publish `SettingsChanged` on `bus`.
    pub fn with_bus(bus: EventBus) -> Self {
        Self {
            values: BTreeMap::new(),
            bus: Some(bus),
        }
    }

    /// Loads a JSON object of settings without publishing anything.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        Ok(Self {
            values: serde_json::from_str(s)?,
            bus: None,
        })
    }

    pub fn attach_bus(&mut self, bus: EventBus) {
        self.bus = Some(bus);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Stores `value`; publishes a change event if it differs from the old one.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if self.values.get(&key) == Some(&value) {
            return;
        }
        debug!(%key, %value, "Setting changed");
        self.values.insert(key.clone(), value);
        if let Some(bus) = &self.bus {
            bus.publish(EngineEvent::SettingsChanged { key });
        }
    }

    fn get_f32(&self, key: &str) -> Option<f32> {
        self.get(key).and_then(Value::as_f64).map(|v| v as f32)
    }

    /// Controller deadzone, clamped into `[0, 1)`.
    pub fn movement_deadzone(&self) -> f32 {
        self.get_f32(MOVEMENT_DEADZONE)
            .filter(|v| v.is_finite())
            .map(|v| v.clamp(0.0, 0.99))
            .unwrap_or(DEFAULT_DEADZONE)
    }

    pub fn mouse_sensitivity(&self) -> f32 {
        self.get_f32(MOUSE_SENSITIVITY)
            .filter(|v| v.is_finite() && *v > 0.0)
            .unwrap_or(DEFAULT_MOUSE_SENSITIVITY)
    }

    /// User key overrides; an empty table when unset or malformed.
    pub fn custom_controls(&self) -> KeyTable {
        let Some(value) = self.get(CUSTOM_CONTROLS) else {
            return KeyTable::new();
        };
        match serde_json::from_value(value.clone()) {
            Ok(table) => table,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed custom controls");
                KeyTable::new()
            }
        }
    }
}
