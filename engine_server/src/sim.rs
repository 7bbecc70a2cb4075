//! Minimal ship kinematics for the development server.
//!
//! Keep simulation in a fixed timestep; the step only depends on the stored
//! action vector and `dt`.

use engine_shared::{
    actions::ActionFrame,
    bindings::{ship_bindings, WireId},
    physics::PhysicsBody,
};

/// Units per second at full thrust.
pub const THRUST_SPEED: f64 = 4.0;
/// Radians per second at full turn.
pub const TURN_RATE: f64 = 2.5;
/// Boost multiplier on thrust.
pub const BOOST_FACTOR: f64 = 1.75;

/// Wire ids the simulation reads, resolved from the ship binding table.
#[derive(Debug, Clone, Copy)]
pub struct ShipControls {
    forward: WireId,
    backward: WireId,
    left: WireId,
    right: WireId,
    boost: WireId,
}

impl Default for ShipControls {
    fn default() -> Self {
        let set = ship_bindings();
        let id = |name: &str| set.wire_id(name).unwrap_or(WireId::MAX);
        Self {
            forward: id("FORWARD"),
            backward: id("BACKWARD"),
            left: id("LEFT"),
            right: id("RIGHT"),
            boost: id("BOOST"),
        }
    }
}

fn value(frame: &ActionFrame, action: WireId) -> f64 {
    frame
        .actions
        .iter()
        .find(|(id, _)| *id == action)
        .map_or(0.0, |(_, v)| f64::from(*v))
}

impl ShipControls {
    /// Advances `body` by `dt` seconds under `input`.
    pub fn step(&self, body: &mut PhysicsBody, input: &ActionFrame, dt: f64) {
        let turn = value(input, self.left) - value(input, self.right);
        let mut thrust = value(input, self.forward) - value(input, self.backward);
        if value(input, self.boost) > 0.0 {
            thrust *= BOOST_FACTOR;
        }

        body.angular_velocity = turn * TURN_RATE;
        body.angle += body.angular_velocity * dt;
        let speed = thrust * THRUST_SPEED;
        body.velocity = [body.angle.cos() * speed, body.angle.sin() * speed];
        body.position[0] += body.velocity[0] * dt;
        body.position[1] += body.velocity[1] * dt;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(actions: &[(WireId, f32)]) -> ActionFrame {
        ActionFrame {
            actions: actions.to_vec(),
            mouse: [0.0, 0.0],
        }
    }

    #[test]
    fn forward_moves_along_heading() {
        let ship = ShipControls::default();
        let mut body = PhysicsBody::default();
        ship.step(&mut body, &frame(&[(5, 1.0)]), 0.5);
        assert!((body.position[0] - 2.0).abs() < 1e-9);
        assert_eq!(body.position[1], 0.0);
    }

    #[test]
    fn idle_ship_stops() {
        let ship = ShipControls::default();
        let mut body = PhysicsBody {
            velocity: [3.0, 1.0],
            angular_velocity: 1.0,
            ..Default::default()
        };
        ship.step(&mut body, &ActionFrame::default(), 0.1);
        assert_eq!(body.velocity, [0.0, 0.0]);
        assert_eq!(body.angular_velocity, 0.0);
        assert_eq!(body.position, [0.0, 0.0]);
    }

    #[test]
    fn left_turns_counterclockwise() {
        let ship = ShipControls::default();
        let mut body = PhysicsBody::default();
        ship.step(&mut body, &frame(&[(7, 1.0)]), 1.0);
        assert!((body.angle - TURN_RATE).abs() < 1e-9);
    }
}
