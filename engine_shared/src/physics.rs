//! Physics sync codec.
//!
//! The simulation itself runs elsewhere; this module only moves a body's
//! kinematic state across the network. A snapshot is a fixed-order tuple of
//! 4-decimal strings:
//!
//! `[[angularVelocity], [posX, posY], [velX, velY], [angle]]`

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Digits kept after the decimal point on the wire.
pub const SNAPSHOT_PRECISION: usize = 4;

/// Kinematic state of a 2D rigid body.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PhysicsBody {
    pub angular_velocity: f64,
    pub position: [f64; 2],
    pub velocity: [f64; 2],
    pub angle: f64,
}

/// Fixed-precision wire form of a `PhysicsBody`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicsSnapshot(
    pub [String; 1],
    pub [String; 2],
    pub [String; 2],
    pub [String; 1],
);

fn fixed(v: f64) -> String {
    format!("{:.*}", SNAPSHOT_PRECISION, v)
}

fn parse(s: &str, field: &str) -> anyhow::Result<f64> {
    s.trim()
        .parse::<f64>()
        .with_context(|| format!("parse snapshot {field} {s:?}"))
}

/// Encodes a body; `None` when there is no body.
pub fn encode(body: Option<&PhysicsBody>) -> Option<PhysicsSnapshot> {
    body.map(PhysicsBody::snapshot)
}

/// Writes a snapshot onto `body` in place. No-op when `snapshot` is `None`.
///
/// All components are parsed before anything is written, so a malformed
/// snapshot leaves `body` untouched.
pub fn decode(snapshot: Option<&PhysicsSnapshot>, body: &mut PhysicsBody) -> anyhow::Result<()> {
    let Some(PhysicsSnapshot([av], [px, py], [vx, vy], [angle])) = snapshot else {
        return Ok(());
    };
    let angular_velocity = parse(av, "angular velocity")?;
    let angle = parse(angle, "angle")?;
    let position = [parse(px, "position x")?, parse(py, "position y")?];
    let velocity = [parse(vx, "velocity x")?, parse(vy, "velocity y")?];

    body.angular_velocity = angular_velocity;
    body.angle = angle;
    body.position = position;
    body.velocity = velocity;
    Ok(())
}

impl PhysicsBody {
    pub fn snapshot(&self) -> PhysicsSnapshot {
        PhysicsSnapshot(
            [fixed(self.angular_velocity)],
            [fixed(self.position[0]), fixed(self.position[1])],
            [fixed(self.velocity[0]), fixed(self.velocity[1])],
            [fixed(self.angle)],
        )
    }

    /// Builds a body from a snapshot.
    pub fn from_snapshot(snapshot: &PhysicsSnapshot) -> anyhow::Result<Self> {
        let mut body = Self::default();
        decode(Some(snapshot), &mut body)?;
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() <= 0.5e-4 + 1e-9, "{a} vs {b}");
    }

    #[test]
    fn snapshot_wire_shape() {
        let body = PhysicsBody {
            angular_velocity: 0.5,
            position: [1.0, -2.25],
            velocity: [3.14159, 0.0],
            angle: 1.0,
        };
        let json = serde_json::to_string(&encode(Some(&body))).unwrap();
        assert_eq!(
            json,
            r#"[["0.5000"],["1.0000","-2.2500"],["3.1416","0.0000"],["1.0000"]]"#
        );
    }

    #[test]
    fn no_body_encodes_to_none() {
        assert_eq!(encode(None), None);
    }

    #[test]
    fn decode_none_is_noop() {
        let mut body = PhysicsBody {
            angle: 2.0,
            ..Default::default()
        };
        decode(None, &mut body).unwrap();
        assert_eq!(body.angle, 2.0);
    }

    #[test]
    fn roundtrip_to_four_decimals() {
        let samples = [
            PhysicsBody {
                angular_velocity: -12.345678,
                position: [1234.56789, -0.00004],
                velocity: [99.99995, -7.1],
                angle: std::f64::consts::PI,
            },
            PhysicsBody {
                angular_velocity: 0.0,
                position: [-1e6 + 0.123456, 42.0],
                velocity: [0.00006, -0.00006],
                angle: -6.283185,
            },
        ];
        for src in samples {
            let mut dst = PhysicsBody::default();
            decode(encode(Some(&src)).as_ref(), &mut dst).unwrap();
            assert_close(dst.angular_velocity, src.angular_velocity);
            assert_close(dst.position[0], src.position[0]);
            assert_close(dst.position[1], src.position[1]);
            assert_close(dst.velocity[0], src.velocity[0]);
            assert_close(dst.velocity[1], src.velocity[1]);
            assert_close(dst.angle, src.angle);
        }
    }

    #[test]
    fn malformed_snapshot_leaves_body_untouched() {
        let original = PhysicsBody {
            angular_velocity: 1.0,
            position: [2.0, 3.0],
            velocity: [4.0, 5.0],
            angle: 6.0,
        };
        let mut snap = PhysicsBody::default().snapshot();
        snap.2[1] = "fast".to_string();
        let mut body = original;
        assert!(decode(Some(&snap), &mut body).is_err());
        assert_eq!(body, original);
    }
}
