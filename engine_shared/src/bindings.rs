//! Input bindings.
//!
//! A binding names a logical action, gives it a stable wire id shared with
//! the server, and lists the raw key that triggers it on each device.
//!
//! - `BindingSet`: the bindings of one entity kind.
//! - `BindingRegistry`: entity kind -> binding set, plus user key overrides.
//! - `BoundActionIndex`: raw key -> wire ids, derived from the registry.
//!
//! Default tables are `'static` and never mutated; every set built from them
//! is an owned copy.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    str::FromStr,
};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Numeric action identifier used on the wire.
pub type WireId = u16;

/// Custom key table: device name -> action name -> raw key string.
///
/// This is the shape users store under the `custom_controls` setting.
pub type KeyTable = BTreeMap<String, BTreeMap<String, String>>;

/// Input device family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    Keyboard,
    Mouse,
    Controller,
}

impl Device {
    pub fn name(self) -> &'static str {
        match self {
            Device::Keyboard => "keyboard",
            Device::Mouse => "mouse",
            Device::Controller => "controller",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Device {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keyboard" => Ok(Device::Keyboard),
            "mouse" => Ok(Device::Mouse),
            "controller" | "gamepad" => Ok(Device::Controller),
            other => bail!("unknown device: {other}"),
        }
    }
}

/// A raw, device-specific input key.
///
/// String forms: `"87"` (keyboard code), `"mouse0"`, `"buttons3"`,
/// `"+axes0"` / `"-axes0"` (controller axis direction).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum RawKey {
    Key(u32),
    MouseButton(u8),
    Button(u8),
    Axis { index: u8, positive: bool },
}

impl RawKey {
    /// Device this key belongs to.
    pub fn device(self) -> Device {
        match self {
            RawKey::Key(_) => Device::Keyboard,
            RawKey::MouseButton(_) => Device::Mouse,
            RawKey::Button(_) | RawKey::Axis { .. } => Device::Controller,
        }
    }

    pub fn axis(index: u8, positive: bool) -> Self {
        RawKey::Axis { index, positive }
    }
}

impl fmt::Display for RawKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawKey::Key(code) => write!(f, "{code}"),
            RawKey::MouseButton(button) => write!(f, "mouse{button}"),
            RawKey::Button(button) => write!(f, "buttons{button}"),
            RawKey::Axis { index, positive } => {
                let sign = if *positive { '+' } else { '-' };
                write!(f, "{sign}axes{index}")
            }
        }
    }
}

impl FromStr for RawKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix("+axes") {
            let index = rest.parse().with_context(|| format!("axis index in {s:?}"))?;
            return Ok(RawKey::axis(index, true));
        }
        if let Some(rest) = s.strip_prefix("-axes") {
            let index = rest.parse().with_context(|| format!("axis index in {s:?}"))?;
            return Ok(RawKey::axis(index, false));
        }
        if let Some(rest) = s.strip_prefix("buttons") {
            let button = rest.parse().with_context(|| format!("button in {s:?}"))?;
            return Ok(RawKey::Button(button));
        }
        if let Some(rest) = s.strip_prefix("mouse") {
            let button = rest.parse().with_context(|| format!("mouse button in {s:?}"))?;
            return Ok(RawKey::MouseButton(button));
        }
        let code = s.parse().with_context(|| format!("key code {s:?}"))?;
        Ok(RawKey::Key(code))
    }
}

impl From<RawKey> for String {
    fn from(key: RawKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for RawKey {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// One logical action and the raw key bound to it per device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub name: String,
    pub wire_id: WireId,
    pub keys: BTreeMap<Device, RawKey>,
}

/// A row of a static default table.
#[derive(Debug, Clone, Copy)]
pub struct BindingDef {
    pub name: &'static str,
    pub wire_id: WireId,
    pub keys: &'static [(Device, &'static str)],
}

/// Ordered bindings for one entity kind. Names are unique within a set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingSet {
    bindings: Vec<Binding>,
}

impl BindingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an owned set from a static default table.
    pub fn from_static(defs: &[BindingDef]) -> Self {
        let mut set = Self::new();
        for def in defs {
            let mut keys = BTreeMap::new();
            for (device, spec) in def.keys {
                match spec.parse::<RawKey>() {
                    Ok(key) => {
                        keys.insert(*device, key);
                    }
                    Err(e) => warn!(action = def.name, error = %e, "Skipping bad default key"),
                }
            }
            set.push(Binding {
                name: def.name.to_string(),
                wire_id: def.wire_id,
                keys,
            });
        }
        set
    }

    /// Adds a binding, replacing any existing binding with the same name in place.
    pub fn push(&mut self, binding: Binding) {
        match self.bindings.iter_mut().find(|b| b.name == binding.name) {
            Some(slot) => *slot = binding,
            None => self.bindings.push(binding),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Binding> {
        self.bindings.iter().find(|b| b.name == name)
    }

    pub fn wire_id(&self, name: &str) -> Option<WireId> {
        self.get(name).map(|b| b.wire_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Binding> {
        self.bindings.iter()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Applies a custom key table to this set and returns how many keys changed.
    ///
    /// Unknown devices, unknown actions and unparseable keys are ignored.
    pub fn load(&mut self, table: &KeyTable) -> usize {
        let mut applied = 0;
        for (device_name, actions) in table {
            let device = match device_name.parse::<Device>() {
                Ok(device) => device,
                Err(_) => {
                    debug!(device = %device_name, "Ignoring unknown device in key table");
                    continue;
                }
            };
            for (action, spec) in actions {
                let Some(binding) = self.bindings.iter_mut().find(|b| &b.name == action) else {
                    debug!(%action, "Ignoring unknown action in key table");
                    continue;
                };
                match spec.parse::<RawKey>() {
                    Ok(key) => {
                        binding.keys.insert(device, key);
                        applied += 1;
                    }
                    Err(e) => warn!(%action, %device, error = %e, "Ignoring unparseable key"),
                }
            }
        }
        applied
    }

    /// Returns a copy of this set with `table` applied; `self` is untouched.
    pub fn loaded(&self, table: &KeyTable) -> Self {
        let mut copy = self.clone();
        copy.load(table);
        copy
    }

    /// Composes this (more specific) set over `base`.
    ///
    /// Base order is kept; entries of `self` replace base entries of the same
    /// name, and names only `self` defines are appended in `self` order.
    pub fn merge(&self, base: &BindingSet) -> BindingSet {
        let mut merged = base.clone();
        for binding in &self.bindings {
            merged.push(binding.clone());
        }
        merged
    }
}

/// Binding sets per entity kind plus the active user overrides.
#[derive(Debug, Clone, Default)]
pub struct BindingRegistry {
    sets: BTreeMap<String, BindingSet>,
    overrides: KeyTable,
}

impl BindingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in entity kinds.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_bindings(ENTITY_KIND, entity_bindings());
        registry.register_bindings(SHIP_KIND, ship_bindings());
        registry
    }

    /// Associates `set` with an entity kind, replacing any previous set.
    pub fn register_bindings(&mut self, kind: impl Into<String>, set: BindingSet) {
        let kind = kind.into();
        debug!(%kind, bindings = set.len(), "Registered bindings");
        self.sets.insert(kind, set);
    }

    /// Effective bindings for `kind`, overrides applied.
    pub fn bindings_for(&self, kind: &str) -> Option<BindingSet> {
        self.sets.get(kind).map(|set| set.loaded(&self.overrides))
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.sets.keys().map(String::as_str)
    }

    /// Replaces the user override table. Registered sets keep their defaults.
    pub fn load(&mut self, table: KeyTable) {
        self.overrides = table;
    }

    pub fn clear_overrides(&mut self) {
        self.overrides.clear();
    }

    pub fn overrides(&self) -> &KeyTable {
        &self.overrides
    }

    /// Builds the raw key index over every registered kind, in kind order.
    pub fn build_index(&self) -> BoundActionIndex {
        let effective: Vec<BindingSet> = self
            .sets
            .values()
            .map(|set| set.loaded(&self.overrides))
            .collect();
        BoundActionIndex::build(effective.iter().flat_map(BindingSet::iter))
    }
}

/// Raw key -> wire ids to activate when that key fires.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoundActionIndex {
    by_key: HashMap<RawKey, Vec<WireId>>,
}

impl BoundActionIndex {
    /// Builds the index. A wire id appears at most once per key.
    pub fn build<'a>(bindings: impl IntoIterator<Item = &'a Binding>) -> Self {
        let mut by_key: HashMap<RawKey, Vec<WireId>> = HashMap::new();
        for binding in bindings {
            for key in binding.keys.values() {
                let actions = by_key.entry(*key).or_default();
                if !actions.contains(&binding.wire_id) {
                    actions.push(binding.wire_id);
                }
            }
        }
        Self { by_key }
    }

    /// Wire ids bound to `key`, empty if unbound.
    pub fn actions_for(&self, key: &RawKey) -> &[WireId] {
        self.by_key.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn keys(&self) -> impl Iterator<Item = &RawKey> {
        self.by_key.keys()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

/// Kind name of the generic base entity.
pub const ENTITY_KIND: &str = "entity";
/// Kind name of the player ship.
pub const SHIP_KIND: &str = "ship";

/// Actions every controllable entity understands.
pub const ENTITY_BINDINGS: &[BindingDef] = &[
    BindingDef {
        name: "SCOREBOARD",
        wire_id: 20,
        keys: &[(Device::Keyboard, "9"), (Device::Controller, "buttons8")],
    },
    BindingDef {
        name: "MENU",
        wire_id: 21,
        keys: &[(Device::Keyboard, "27"), (Device::Controller, "buttons9")],
    },
];

/// Ship flight controls.
pub const SHIP_BINDINGS: &[BindingDef] = &[
    BindingDef {
        name: "FIRE",
        wire_id: 1,
        keys: &[
            (Device::Keyboard, "32"),
            (Device::Mouse, "mouse0"),
            (Device::Controller, "buttons0"),
        ],
    },
    BindingDef {
        name: "BOOST",
        wire_id: 2,
        keys: &[(Device::Keyboard, "16"), (Device::Controller, "buttons7")],
    },
    BindingDef {
        name: "FORWARD",
        wire_id: 5,
        keys: &[(Device::Keyboard, "87"), (Device::Controller, "+axes1")],
    },
    BindingDef {
        name: "BACKWARD",
        wire_id: 6,
        keys: &[(Device::Keyboard, "83"), (Device::Controller, "-axes1")],
    },
    BindingDef {
        name: "LEFT",
        wire_id: 7,
        keys: &[(Device::Keyboard, "65"), (Device::Controller, "+axes0")],
    },
    BindingDef {
        name: "RIGHT",
        wire_id: 8,
        keys: &[(Device::Keyboard, "68"), (Device::Controller, "-axes0")],
    },
];

pub fn entity_bindings() -> BindingSet {
    BindingSet::from_static(ENTITY_BINDINGS)
}

/// Ship bindings layered over the base entity bindings.
pub fn ship_bindings() -> BindingSet {
    BindingSet::from_static(SHIP_BINDINGS).merge(&entity_bindings())
}
