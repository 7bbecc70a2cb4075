//! `engine_shared`
//!
//! Shared libraries used by both client and server.
//!
//! Design goals:
//! - One source of truth for wire ids, wire messages and the physics codec.
//! - Plain owned data; no global state.
//! - Traits at the seams to the renderer and asset side.
//! - No `unsafe`.

pub mod actions;
pub mod bindings;
pub mod config;
pub mod event;
pub mod net;
pub mod physics;
pub mod render;
pub mod resources;
pub mod settings;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::actions::*;
    pub use crate::bindings::*;
    pub use crate::config::*;
    pub use crate::event::*;
    pub use crate::net::*;
    pub use crate::physics::{PhysicsBody, PhysicsSnapshot};
}
