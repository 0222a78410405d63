//! Authored keyframes and sequences.
//!
//! These are the pure data records exchanged between the authoring layer and
//! the motion core: a keyframe maps joint names to target angles and carries
//! speed, pause and digital-output annotations. Widget and viewer state stay
//! with the authoring layer; nothing here references a view.

pub mod player;
pub mod text;
pub mod timeline;

use std::collections::BTreeMap;

use crate::error::{MotionError, MotionResult};
use crate::protocol::wire::OutputCommand;
use crate::protocol::MAX_KEYFRAMES;

/// Digital-output annotation in authoring form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputAction {
    /// Leave the output untouched.
    #[default]
    Ignore,
    /// Drive the output high.
    Set,
    /// Drive the output low.
    Reset,
}

impl OutputAction {
    /// Map to the wire-form output command.
    pub fn to_wire(self) -> OutputCommand {
        match self {
            OutputAction::Ignore => OutputCommand::Nop,
            OutputAction::Set => OutputCommand::Set,
            OutputAction::Reset => OutputCommand::Reset,
        }
    }

    /// Numeric form used by the text serialisation.
    pub fn as_u8(self) -> u8 {
        match self {
            OutputAction::Ignore => 0,
            OutputAction::Set => 1,
            OutputAction::Reset => 2,
        }
    }

    /// Parse the numeric text form.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => OutputAction::Ignore,
            1 => OutputAction::Set,
            2 => OutputAction::Reset,
            _ => return None,
        })
    }
}

/// One authored keyframe: target joint angles plus timing annotations.
#[derive(Debug, Clone, PartialEq)]
pub struct Keyframe {
    /// Target angle in radians per joint name.
    pub angles: BTreeMap<String, f64>,
    /// Segment speed as a percentage of the configured maximum, 1..=100.
    pub speed: u8,
    /// Hold time after reaching this frame, seconds, 0..=1000.
    pub pause: f64,
    /// Digital output action applied at this frame.
    pub output: OutputAction,
}

impl Keyframe {
    /// Create a keyframe, clamping speed and pause to their legal ranges.
    pub fn new(angles: BTreeMap<String, f64>, speed: u8, pause: f64, output: OutputAction) -> Self {
        Self {
            angles,
            speed: speed.clamp(1, 100),
            pause: pause.clamp(0.0, 1000.0),
            output,
        }
    }

    /// L∞ distance to another keyframe: the largest per-joint angle change.
    /// Joints present on only one side contribute nothing.
    pub fn distance(&self, other: &Keyframe) -> f64 {
        self.angles
            .iter()
            .filter_map(|(name, &angle)| {
                other.angles.get(name).map(|&o| (angle - o).abs())
            })
            .fold(0.0, f64::max)
    }
}

/// An ordered list of keyframes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sequence {
    frames: Vec<Keyframe>,
}

impl Sequence {
    /// Create an empty sequence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a keyframe, rejecting growth past the device capacity.
    pub fn push(&mut self, frame: Keyframe) -> MotionResult<()> {
        if self.frames.len() >= MAX_KEYFRAMES {
            return Err(MotionError::SequenceTooLong(self.frames.len() + 1));
        }
        self.frames.push(frame);
        Ok(())
    }

    /// Number of keyframes.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// True when the sequence holds no keyframes.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// The keyframes in order.
    pub fn frames(&self) -> &[Keyframe] {
        &self.frames
    }
}

impl FromIterator<Keyframe> for Sequence {
    fn from_iter<T: IntoIterator<Item = Keyframe>>(iter: T) -> Self {
        Self {
            frames: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(pairs: &[(&str, f64)]) -> Keyframe {
        let angles = pairs.iter().map(|(n, a)| (n.to_string(), *a)).collect();
        Keyframe::new(angles, 50, 0.0, OutputAction::Ignore)
    }

    #[test]
    fn test_speed_and_pause_clamped() {
        let kf = Keyframe::new(BTreeMap::new(), 0, -2.0, OutputAction::Ignore);
        assert_eq!(kf.speed, 1);
        assert_eq!(kf.pause, 0.0);

        let kf = Keyframe::new(BTreeMap::new(), 200, 2000.0, OutputAction::Ignore);
        assert_eq!(kf.speed, 100);
        assert_eq!(kf.pause, 1000.0);
    }

    #[test]
    fn test_distance_is_infinity_norm() {
        let a = frame(&[("shoulder", 0.0), ("elbow", 0.2)]);
        let b = frame(&[("shoulder", 0.5), ("elbow", -0.1)]);
        assert!((a.distance(&b) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_sequence_capacity() {
        let mut seq = Sequence::new();
        for _ in 0..MAX_KEYFRAMES {
            seq.push(frame(&[("j", 0.0)])).unwrap();
        }
        assert!(matches!(
            seq.push(frame(&[("j", 0.0)])),
            Err(MotionError::SequenceTooLong(_))
        ));
    }
}
