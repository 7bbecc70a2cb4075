//! `engine_server`
//!
//! Development sync server:
//! - Fixed timestep simulation loop
//! - WebSocket endpoints (`ping`, `join`, `input`, `state`, `reset`)
//! - Small HTTP API (`/api/status`, `/api/loadouts`)

pub mod server;
pub mod sim;

pub use server::{bind_ephemeral, GameServer};
