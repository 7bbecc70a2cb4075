//! Native controller backend built on gilrs.
//!
//! `Gilrs` is not `Send`, so it lives on its own OS thread and publishes
//! samples into a [`GamepadSlot`]. The first pad to connect is used until
//! it disconnects.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use gilrs::{Axis, Button, Event, EventType, GamepadId, Gilrs};
use tracing::{debug, error, info};

use crate::gamepad::{GamepadSlot, GamepadState};

/// Standard-layout axis order.
const AXES: [Axis; 4] = [
    Axis::LeftStickX,
    Axis::LeftStickY,
    Axis::RightStickX,
    Axis::RightStickY,
];

/// Standard-layout button order.
const BUTTONS: [Button; 16] = [
    Button::South,
    Button::East,
    Button::West,
    Button::North,
    Button::LeftTrigger,
    Button::RightTrigger,
    Button::LeftTrigger2,
    Button::RightTrigger2,
    Button::Select,
    Button::Start,
    Button::LeftThumb,
    Button::RightThumb,
    Button::DPadUp,
    Button::DPadDown,
    Button::DPadLeft,
    Button::DPadRight,
];

/// Builds a standard-layout sample. gilrs reports stick Y as up-positive;
/// samples use down-positive, so Y axes are flipped here.
fn standard_layout(axis: impl Fn(Axis) -> f32, button: impl Fn(Button) -> f32) -> GamepadState {
    GamepadState {
        axes: AXES
            .iter()
            .map(|&a| match a {
                Axis::LeftStickY | Axis::RightStickY => -axis(a),
                _ => axis(a),
            })
            .collect(),
        buttons: BUTTONS.iter().map(|&b| button(b)).collect(),
    }
}

fn sample(gilrs: &Gilrs, id: GamepadId) -> GamepadState {
    let pad = gilrs.gamepad(id);
    standard_layout(
        |a| pad.value(a),
        |b| pad.button_data(b).map_or(0.0, |d| d.value()),
    )
}

/// Owns the backend thread. Dropping it stops the thread.
#[derive(Debug)]
pub struct GilrsBackend {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl GilrsBackend {
    /// Starts sampling every `period` into `slot`.
    pub fn spawn(slot: GamepadSlot, period: Duration) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let thread = std::thread::Builder::new()
            .name("gilrs-input".into())
            .spawn(move || run(slot, period, &flag))?;
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }
}

impl Drop for GilrsBackend {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run(slot: GamepadSlot, period: Duration, stop: &AtomicBool) {
    let mut gilrs = match Gilrs::new() {
        Ok(g) => g,
        Err(e) => {
            error!(error = %e, "Failed to initialize gilrs");
            return;
        }
    };
    let mut active = gilrs
        .gamepads()
        .find(|(_, pad)| pad.is_connected())
        .map(|(id, _)| id);
    info!(pad = ?active, "gilrs initialized");

    while !stop.load(Ordering::Relaxed) {
        while let Some(Event { id, event, .. }) = gilrs.next_event() {
            match event {
                EventType::Connected if active.is_none() => {
                    info!(name = gilrs.gamepad(id).name(), "Gamepad connected");
                    active = Some(id);
                }
                EventType::Disconnected if active == Some(id) => {
                    info!(name = gilrs.gamepad(id).name(), "Gamepad disconnected");
                    active = None;
                    slot.disconnect();
                }
                _ => {}
            }
        }
        if let Some(id) = active {
            slot.update(sample(&gilrs, id));
        }
        std::thread::sleep(period);
    }
    slot.disconnect();
    debug!("gilrs thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stick_up_reads_negative_like_other_sources() {
        let state = standard_layout(
            |a| if a == Axis::LeftStickY { 0.8 } else { 0.0 },
            |b| if b == Button::South { 1.0 } else { 0.0 },
        );
        assert_eq!(state.axes, vec![0.0, -0.8, 0.0, 0.0]);
        assert_eq!(state.buttons.len(), 16);
        assert_eq!(state.buttons[0], 1.0);
        assert!(state.buttons[1..].iter().all(|&v| v == 0.0));
    }
}
