//! Controller polling.
//!
//! Gamepads are poll-only, so a repeating task samples the pad, runs the
//! deadzone and edge filter, and forwards non-empty frames to the controls
//! dispatcher over a channel.
//!
//! Filter rules, per tick:
//! 1. If no axis exceeds the deadzone, every axis reads zero (global
//!    deadzone, so stick drift on one axis cannot leak through).
//! 2. Axis sign is inverted so pushing up/left reads positive, matching the
//!    button-style bindings (`+axes1` is forward).
//! 3. Buttons below the deadzone read zero.
//! 4. A key that is zero now and was zero last tick is dropped; only
//!    non-zero values and the single transition into zero are emitted.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use engine_shared::bindings::RawKey;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info};

/// Raw pad sample. Axes in `[-1, 1]`, buttons in `[0, 1]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GamepadState {
    pub axes: Vec<f32>,
    pub buttons: Vec<f32>,
}

/// A poll-only controller.
pub trait GamepadSource: Send + 'static {
    fn connected(&self) -> bool;
    /// Latest sample, or `None` if the pad has nothing to report this tick.
    fn read(&mut self) -> Option<GamepadState>;
}

/// Gamepad whose state is written by platform code (e.g. a dedicated input
/// thread) and read by the poll loop.
#[derive(Debug, Clone, Default)]
pub struct GamepadSlot {
    inner: Arc<Mutex<Option<GamepadState>>>,
}

impl GamepadSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a fresh sample and marks the pad connected.
    pub fn update(&self, state: GamepadState) {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = Some(state);
    }

    /// Marks the pad disconnected.
    pub fn disconnect(&self) {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

impl GamepadSource for GamepadSlot {
    fn connected(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    fn read(&mut self) -> Option<GamepadState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Deadzone and zero-edge filter.
#[derive(Debug, Clone)]
pub struct DeadzoneFilter {
    deadzone: f32,
    held: BTreeSet<RawKey>,
}

impl DeadzoneFilter {
    pub fn new(deadzone: f32) -> Self {
        Self {
            deadzone,
            held: BTreeSet::new(),
        }
    }

    pub fn deadzone(&self) -> f32 {
        self.deadzone
    }

    pub fn set_deadzone(&mut self, deadzone: f32) {
        self.deadzone = deadzone;
    }

    /// Runs one tick. Entries are in `RawKey` order.
    pub fn process(&mut self, state: &GamepadState) -> Vec<(RawKey, f32)> {
        let deadzone = self.deadzone;
        let any_axis = state.axes.iter().any(|a| a.abs() > deadzone);

        let mut frame = BTreeMap::new();
        for (i, raw) in state.axes.iter().enumerate() {
            let Ok(index) = u8::try_from(i) else { break };
            let v = if any_axis { -raw } else { 0.0 };
            frame.insert(RawKey::axis(index, true), v.max(0.0));
            frame.insert(RawKey::axis(index, false), (-v).max(0.0));
        }
        for (i, raw) in state.buttons.iter().enumerate() {
            let Ok(index) = u8::try_from(i) else { break };
            let v = if raw.abs() < deadzone { 0.0 } else { *raw };
            frame.insert(RawKey::Button(index), v);
        }

        let mut out = Vec::new();
        let mut held = BTreeSet::new();
        for (key, value) in frame {
            if value != 0.0 {
                held.insert(key);
                out.push((key, value));
            } else if self.held.contains(&key) {
                out.push((key, 0.0));
            }
        }
        self.held = held;
        out
    }

    /// Zero entries for every key still held; used when the pad goes away.
    pub fn release_all(&mut self) -> Vec<(RawKey, f32)> {
        std::mem::take(&mut self.held)
            .into_iter()
            .map(|key| (key, 0.0))
            .collect()
    }
}

/// Output of the poll loop.
#[derive(Debug, Clone, PartialEq)]
pub enum PadEvent {
    Frame(Vec<(RawKey, f32)>),
    Disconnected,
}

/// Owns a running poll loop. Dropping it stops the loop.
#[derive(Debug)]
pub struct PollHandle {
    task: JoinHandle<()>,
}

impl PollHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the loop without emitting releases.
    pub fn cancel(self) {
        self.task.abort();
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Starts polling `source` every `period` until it disconnects or the
/// handle is dropped. Must be called inside a tokio runtime.
pub fn spawn_poll_loop<S: GamepadSource>(
    mut source: S,
    mut deadzone: watch::Receiver<f32>,
    period: Duration,
    tx: mpsc::UnboundedSender<PadEvent>,
) -> PollHandle {
    let task = tokio::spawn(async move {
        let mut filter = DeadzoneFilter::new(*deadzone.borrow_and_update());
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(period_ms = period.as_millis() as u64, "Controller poll loop started");

        loop {
            ticker.tick().await;
            if deadzone.has_changed().unwrap_or(false) {
                filter.set_deadzone(*deadzone.borrow_and_update());
            }
            if !source.connected() {
                let released = filter.release_all();
                if !released.is_empty() {
                    let _ = tx.send(PadEvent::Frame(released));
                }
                let _ = tx.send(PadEvent::Disconnected);
                break;
            }
            let Some(state) = source.read() else {
                continue;
            };
            let frame = filter.process(&state);
            if frame.is_empty() {
                continue;
            }
            if tx.send(PadEvent::Frame(frame)).is_err() {
                break;
            }
        }
        debug!("Controller poll loop stopped");
    });
    PollHandle { task }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pad(axes: &[f32], buttons: &[f32]) -> GamepadState {
        GamepadState {
            axes: axes.to_vec(),
            buttons: buttons.to_vec(),
        }
    }

    #[test]
    fn small_axes_from_rest_emit_nothing() {
        let mut f = DeadzoneFilter::new(0.2);
        assert!(f.process(&pad(&[0.1, -0.19, 0.2], &[])).is_empty());
    }

    #[test]
    fn deadzone_is_global_not_per_axis() {
        let mut f = DeadzoneFilter::new(0.2);
        let out = f.process(&pad(&[0.5, 0.05], &[]));
        // Axis 0 pushed right reads on the negative key; axis 1 keeps its small value.
        assert_eq!(
            out,
            vec![(RawKey::axis(0, false), 0.5), (RawKey::axis(1, false), 0.05)]
        );
    }

    #[test]
    fn stick_up_is_forward() {
        let mut f = DeadzoneFilter::new(0.2);
        let out = f.process(&pad(&[0.0, -1.0], &[]));
        assert_eq!(out, vec![(RawKey::axis(1, true), 1.0)]);
    }

    #[test]
    fn releasing_into_deadzone_emits_one_zero() {
        let mut f = DeadzoneFilter::new(0.2);
        f.process(&pad(&[0.0, -0.8], &[]));
        let out = f.process(&pad(&[0.0, -0.1], &[]));
        assert_eq!(out, vec![(RawKey::axis(1, true), 0.0)]);
        assert!(f.process(&pad(&[0.0, -0.1], &[])).is_empty());
    }

    #[test]
    fn button_zero_twice_emits_nothing() {
        let mut f = DeadzoneFilter::new(0.2);
        assert!(f.process(&pad(&[], &[0.0])).is_empty());
        assert!(f.process(&pad(&[], &[0.0])).is_empty());
    }

    #[test]
    fn button_press_then_release_emits_single_zero() {
        let mut f = DeadzoneFilter::new(0.2);
        assert_eq!(f.process(&pad(&[], &[0.6])), vec![(RawKey::Button(0), 0.6)]);
        assert_eq!(f.process(&pad(&[], &[0.0])), vec![(RawKey::Button(0), 0.0)]);
    }

    #[test]
    fn held_button_keeps_emitting() {
        let mut f = DeadzoneFilter::new(0.2);
        f.process(&pad(&[], &[1.0]));
        assert_eq!(f.process(&pad(&[], &[1.0])), vec![(RawKey::Button(0), 1.0)]);
    }

    #[test]
    fn buttons_below_deadzone_clamp() {
        let mut f = DeadzoneFilter::new(0.2);
        assert!(f.process(&pad(&[], &[0.1, 0.0])).is_empty());
    }

    #[test]
    fn release_all_zeroes_held_keys() {
        let mut f = DeadzoneFilter::new(0.2);
        f.process(&pad(&[0.0, -1.0], &[1.0]));
        assert_eq!(
            f.release_all(),
            vec![(RawKey::Button(0), 0.0), (RawKey::axis(1, true), 0.0)]
        );
        assert!(f.release_all().is_empty());
    }

    #[tokio::test]
    async fn poll_loop_emits_frames_then_disconnect() {
        let slot = GamepadSlot::new();
        slot.update(pad(&[], &[1.0]));
        let (dz_tx, dz_rx) = watch::channel(0.2);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_poll_loop(slot.clone(), dz_rx, Duration::from_millis(1), tx);

        assert_eq!(
            rx.recv().await,
            Some(PadEvent::Frame(vec![(RawKey::Button(0), 1.0)]))
        );
        slot.disconnect();
        let mut saw_release = false;
        while let Some(event) = rx.recv().await {
            match event {
                PadEvent::Frame(f) if f == vec![(RawKey::Button(0), 0.0)] => saw_release = true,
                PadEvent::Frame(_) => {}
                PadEvent::Disconnected => break,
            }
        }
        assert!(saw_release);
        drop(dz_tx);
        handle.cancel();
    }
}
