//! `engine_client`
//!
//! Client-side systems:
//! - Controls dispatch (raw input → bound actions → entities)
//! - Controller polling with deadzone and edge filtering
//! - Entity action state and input propagation
//! - Network session (persistent socket + plain HTTP calls)
//! - Reconciliation of server-authoritative state

pub mod client;
pub mod controls;
pub mod entity;
pub mod gamepad;
#[cfg(feature = "gilrs")]
pub mod gilrs_backend;
pub mod http;
pub mod session;
pub mod sync;

pub use client::GameClient;
pub use controls::{Controls, ControlsError};
pub use http::{ApiClient, ApiError};
pub use session::{Backoff, NetworkSession, SessionError};
