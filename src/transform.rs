//! Joint-angle ↔ tick-space transform.
//!
//! The device addresses every joint in *ticks*: encoder counts biased by
//! [`POSITION_BIAS`] so negative positions fit a u16. The transform per
//! joint is
//!
//! ```text
//! tick  = round((s · angle + offset) / enc_to_rad) + BIAS      s = ±1
//! angle = s · ((tick - BIAS) · enc_to_rad - offset)
//! ```
//!
//! Angles are clamped to the configured joint limits before conversion, so
//! every tick written to the wire stays within `[0, 2·BIAS]`.

use crate::config::JointConfig;
use crate::protocol::{NO_READING, POSITION_BIAS};

/// Per-joint converter between radians and biased tick-space.
#[derive(Debug, Clone, Copy)]
pub struct JointTransform {
    sign: f64,
    offset: f64,
    enc_to_rad: f64,
    lower_limit: f64,
    upper_limit: f64,
}

impl JointTransform {
    /// Build the transform from a joint's configuration.
    pub fn new(joint: &JointConfig) -> Self {
        Self {
            sign: if joint.invert { -1.0 } else { 1.0 },
            offset: joint.offset,
            enc_to_rad: joint.enc_to_rad(),
            lower_limit: joint.lower_limit,
            upper_limit: joint.upper_limit,
        }
    }

    /// Clamp an angle to the joint's hardware limits.
    pub fn clamp(&self, angle: f64) -> f64 {
        angle.clamp(self.lower_limit, self.upper_limit)
    }

    /// Convert an angle (radians) to a biased tick. The angle is clamped to
    /// the joint limits first; the result is clamped to the representable
    /// tick range as a backstop.
    pub fn angle_to_tick(&self, angle: f64) -> u16 {
        let angle = self.clamp(angle);
        let raw = ((self.sign * angle + self.offset) / self.enc_to_rad).round() as i32;
        let tick = raw + i32::from(POSITION_BIAS);
        tick.clamp(0, 2 * i32::from(POSITION_BIAS)) as u16
    }

    /// Convert a biased tick back to an angle in radians.
    pub fn tick_to_angle(&self, tick: u16) -> f64 {
        let raw = f64::from(i32::from(tick) - i32::from(POSITION_BIAS));
        self.sign * (raw * self.enc_to_rad - self.offset)
    }

    /// Interpret a raw feedback position. [`NO_READING`] keeps the previous
    /// angle; anything else converts like a tick.
    pub fn feedback_angle(&self, raw: i16, last_angle: f64) -> f64 {
        if raw == NO_READING {
            last_angle
        } else {
            // Feedback positions are unbiased encoder counts.
            self.sign * (f64::from(raw) * self.enc_to_rad - self.offset)
        }
    }
}

/// Encoder-to-motor ratio persisted in the device config,
/// `round(256 · enc_to_rad / mot_to_rad)`.
pub fn enc_to_mot_ratio(enc_to_rad: f64, mot_to_rad: f64) -> u16 {
    (256.0 * enc_to_rad / mot_to_rad).round() as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JointConfig, JointKind};
    use std::f64::consts::PI;

    fn joint(invert: bool, offset: f64) -> JointConfig {
        JointConfig {
            name: "shoulder".into(),
            kind: JointKind::X,
            address: 1,
            encoder_steps_per_turn: 4640,
            motor_steps_per_turn: 4640,
            lower_limit: -1.0,
            upper_limit: 1.0,
            offset,
            length: -1.0,
            invert,
            joystick_axis: -1,
            joystick_invert: false,
            max_current: 80,
            hold_current: 20,
        }
    }

    #[test]
    fn test_zero_angle_maps_to_bias() {
        let t = JointTransform::new(&joint(false, 0.0));
        assert_eq!(t.angle_to_tick(0.0), POSITION_BIAS);
    }

    #[test]
    fn test_quarter_turn_example() {
        // enc_to_rad = 2π/4640, π/4 → round(4640/8) = 580 ticks above bias.
        let t = JointTransform::new(&joint(false, 0.0));
        assert_eq!(t.angle_to_tick(PI / 4.0), 16384 + 580);
    }

    #[test]
    fn test_roundtrip_within_half_resolution() {
        let t = JointTransform::new(&joint(false, 0.1));
        let enc_to_rad = 2.0 * PI / 4640.0;
        for &angle in &[-0.9, -0.33, 0.0, 0.125, 0.77, 1.0] {
            let back = t.tick_to_angle(t.angle_to_tick(angle));
            assert!(
                (back - angle).abs() <= enc_to_rad / 2.0,
                "angle {angle} came back as {back}"
            );
        }
    }

    #[test]
    fn test_inverted_joint_roundtrip() {
        let t = JointTransform::new(&joint(true, 0.05));
        let angle = 0.5;
        let back = t.tick_to_angle(t.angle_to_tick(angle));
        assert!((back - angle).abs() <= 2.0 * PI / 4640.0 / 2.0);
    }

    #[test]
    fn test_limits_yield_in_range_ticks() {
        let t = JointTransform::new(&joint(false, 0.0));
        for angle in [-1.0, 1.0, -5.0, 5.0] {
            let tick = t.angle_to_tick(angle);
            assert!(tick <= 2 * POSITION_BIAS);
        }
    }

    #[test]
    fn test_no_reading_retains_last_angle() {
        let t = JointTransform::new(&joint(false, 0.0));
        assert_eq!(t.feedback_angle(NO_READING, 0.42), 0.42);
        assert!(t.feedback_angle(0, 0.42).abs() < 1e-9);
    }

    #[test]
    fn test_enc_to_mot_ratio() {
        assert_eq!(enc_to_mot_ratio(1.0, 1.0), 256);
        assert_eq!(enc_to_mot_ratio(2.0, 1.0), 512);
        assert_eq!(enc_to_mot_ratio(1.0, 2.0), 128);
    }
}
