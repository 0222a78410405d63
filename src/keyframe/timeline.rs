//! Time-parameterised playback timeline.
//!
//! The build phase turns an ordered keyframe list into a chain of timeline
//! items carrying per-joint angles and velocities plus relative and absolute
//! times. Segment time is the keyframe distance (L∞ across joints, so the
//! slowest joint limits the segment) divided by the commanded speed:
//!
//! ```text
//! t = distance / (speed_percent/100 · speed_limit)
//! ```
//!
//! A keyframe with a pause inserts an extra hold item of that duration. In
//! looped mode a final item closes the ring back to the first frame. Both
//! the real-time player and the sequence uploader consume this timeline.

use std::collections::BTreeMap;

use super::{OutputAction, Sequence};
use crate::error::{MotionError, MotionResult};

/// Minimum segment time, guards against zero-distance frames at full speed.
const MIN_SEGMENT_TIME: f64 = 0.02;

/// Per-joint state at one timeline item.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimelineJoint {
    /// Target angle in radians.
    pub angle: f64,
    /// Nominal velocity into this item, radians per second.
    pub velocity: f64,
}

/// One node of the playback timeline.
#[derive(Debug, Clone)]
pub struct TimelineItem {
    /// Per-joint targets keyed by joint name.
    pub joints: BTreeMap<String, TimelineJoint>,
    /// Seconds from the previous item to this one.
    pub relative_time: f64,
    /// Seconds from the start of the timeline.
    pub absolute_time: f64,
    /// Digital output action applied when this item is reached.
    pub output: OutputAction,
}

/// The full timeline produced by the build phase.
#[derive(Debug, Clone)]
pub struct Timeline {
    /// Items in playback order; the first item sits at time zero.
    pub items: Vec<TimelineItem>,
    /// Whether the timeline closes back on its first frame.
    pub looped: bool,
}

impl Timeline {
    /// Build a timeline from a sequence.
    ///
    /// `speed_limit` is the configured maximum joint speed in radians per
    /// second; each keyframe's speed percentage scales it.
    pub fn build(sequence: &Sequence, looped: bool, speed_limit: f64) -> MotionResult<Self> {
        if sequence.is_empty() {
            return Err(MotionError::InvalidState(
                "cannot build a timeline from an empty sequence".to_string(),
            ));
        }
        if speed_limit <= 0.0 {
            return Err(MotionError::Configuration(format!(
                "speed limit must be positive, got {speed_limit}"
            )));
        }

        let frames = sequence.frames();
        let mut items: Vec<TimelineItem> = Vec::with_capacity(frames.len() + 2);
        let mut absolute = 0.0;

        for (index, frame) in frames.iter().enumerate() {
            let (relative, velocities) = if index == 0 {
                (0.0, zero_velocities(frame.angles.keys()))
            } else {
                segment(&frames[index - 1].angles, frame, speed_limit)
            };

            absolute += relative;
            items.push(TimelineItem {
                joints: frame
                    .angles
                    .iter()
                    .map(|(name, &angle)| {
                        (
                            name.clone(),
                            TimelineJoint {
                                angle,
                                velocity: velocities.get(name).copied().unwrap_or(0.0),
                            },
                        )
                    })
                    .collect(),
                relative_time: relative,
                absolute_time: absolute,
                output: frame.output,
            });

            if frame.pause > 0.0 {
                absolute += frame.pause;
                let mut hold = items[items.len() - 1].clone();
                hold.relative_time = frame.pause;
                hold.absolute_time = absolute;
                hold.output = OutputAction::Ignore;
                hold.joints.values_mut().for_each(|j| j.velocity = 0.0);
                items.push(hold);
            }
        }

        if looped && frames.len() > 1 {
            let last = &frames[frames.len() - 1];
            let (relative, velocities) = segment(&last.angles, &frames[0], speed_limit);
            absolute += relative;
            items.push(TimelineItem {
                joints: frames[0]
                    .angles
                    .iter()
                    .map(|(name, &angle)| {
                        (
                            name.clone(),
                            TimelineJoint {
                                angle,
                                velocity: velocities.get(name).copied().unwrap_or(0.0),
                            },
                        )
                    })
                    .collect(),
                relative_time: relative,
                absolute_time: absolute,
                output: frames[0].output,
            });
        }

        Ok(Self { items, looped })
    }

    /// Total duration in seconds.
    pub fn duration(&self) -> f64 {
        self.items.last().map(|i| i.absolute_time).unwrap_or(0.0)
    }
}

fn zero_velocities<'a, I: Iterator<Item = &'a String>>(names: I) -> BTreeMap<String, f64> {
    names.map(|n| (n.clone(), 0.0)).collect()
}

/// Segment time and per-joint velocities from `from` angles into `to`.
fn segment(
    from: &BTreeMap<String, f64>,
    to: &super::Keyframe,
    speed_limit: f64,
) -> (f64, BTreeMap<String, f64>) {
    let distance = to
        .angles
        .iter()
        .filter_map(|(name, &angle)| from.get(name).map(|&f| (angle - f).abs()))
        .fold(0.0, f64::max);

    let speed = f64::from(to.speed) / 100.0 * speed_limit;
    let time = (distance / speed).max(MIN_SEGMENT_TIME);

    let velocities = to
        .angles
        .iter()
        .map(|(name, &angle)| {
            let delta = from.get(name).map(|&f| (angle - f).abs()).unwrap_or(0.0);
            (name.clone(), delta / time)
        })
        .collect();

    (time, velocities)
}
