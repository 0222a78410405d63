//! Host-side real-time keyframe player.
//!
//! Used when the host drives playback directly over the link instead of
//! committing the sequence to the device. The player holds a position on the
//! timeline (the *slider*), advances it by wall-clock time at 50 Hz, and for
//! every step emits one commanded angle and velocity per joint.
//!
//! Velocities adapt to the arm's measured tracking error: each joint's
//! commanded velocity is scaled by the ratio of observed to expected motion,
//! clamped to ±`velocity_adaption_strength` around unity, so a lagging joint
//! is sped up slightly and a leading one reined in.

use std::collections::BTreeMap;
use std::time::Duration;

use super::timeline::Timeline;
use super::OutputAction;

/// Nominal step period of the playback loop.
pub const STEP_PERIOD: Duration = Duration::from_millis(20);

/// One commanded joint state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JointCommand {
    /// Commanded angle, radians.
    pub angle: f64,
    /// Commanded velocity, radians per second.
    pub velocity: f64,
}

/// Output of one player step.
#[derive(Debug, Clone)]
pub struct PlayerSample {
    /// Commanded state per joint.
    pub joints: BTreeMap<String, JointCommand>,
    /// Digital output action crossed since the previous step.
    pub output: OutputAction,
    /// Set on the final sample of a non-looped timeline.
    pub finished: bool,
}

/// Tuning knobs for the step loop.
#[derive(Debug, Clone, Copy)]
pub struct PlayerTuning {
    /// Seconds added to every segment time when deriving velocities,
    /// keeping the commanded speed slightly conservative.
    pub time_correction: f64,
    /// Half-width of the adaptive velocity factor around 1.0.
    pub velocity_adaption_strength: f64,
}

impl Default for PlayerTuning {
    fn default() -> Self {
        Self {
            time_correction: 0.08,
            velocity_adaption_strength: 0.15,
        }
    }
}

/// Real-time interpolating player over a built [`Timeline`].
#[derive(Debug)]
pub struct KeyframePlayer {
    timeline: Timeline,
    tuning: PlayerTuning,
    slider: f64,
    current: usize,
    interpolating: bool,
    finished: bool,
    observed: BTreeMap<String, f64>,
    last_tx: BTreeMap<String, JointCommand>,
    last_dt: f64,
}

impl KeyframePlayer {
    /// Create a player at the start of the timeline.
    ///
    /// With `interpolating` unset, the player snaps each joint to the next
    /// item's angle instead of blending, which matches the behaviour used
    /// for single-keyframe test moves.
    pub fn new(timeline: Timeline, interpolating: bool) -> Self {
        Self {
            timeline,
            tuning: PlayerTuning::default(),
            slider: 0.0,
            current: 0,
            interpolating,
            finished: false,
            observed: BTreeMap::new(),
            last_tx: BTreeMap::new(),
            last_dt: 0.0,
        }
    }

    /// Override the default tuning.
    pub fn with_tuning(mut self, tuning: PlayerTuning) -> Self {
        self.tuning = tuning;
        self
    }

    /// Record a joint angle observed from device feedback, used by the
    /// adaptive velocity correction on the next step.
    pub fn observe(&mut self, joint: &str, angle: f64) {
        self.observed.insert(joint.to_string(), angle);
    }

    /// True once a non-looped timeline has emitted its final sample.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Current slider position in seconds.
    pub fn position(&self) -> f64 {
        self.slider
    }

    /// Advance the slider by `dt` seconds and emit the commanded state.
    pub fn step(&mut self, dt: f64) -> PlayerSample {
        let items = &self.timeline.items;
        self.last_dt = dt;

        if self.finished || items.len() < 2 {
            self.finished = true;
            return self.sample_at_item(items.len().saturating_sub(1), OutputAction::Ignore, true);
        }

        self.slider += dt;
        let total = self.timeline.duration();

        if self.slider >= total {
            if self.timeline.looped {
                self.slider -= total;
                self.current = 0;
            } else {
                self.finished = true;
                let output = items[items.len() - 1].output;
                return self.sample_at_item(items.len() - 1, output, true);
            }
        }

        // Advance past items whose time has come, remembering any output
        // action crossed on the way.
        let mut output = OutputAction::Ignore;
        while self.current + 1 < items.len()
            && items[self.current + 1].absolute_time < self.slider
        {
            self.current += 1;
            if items[self.current].output != OutputAction::Ignore {
                output = items[self.current].output;
            }
        }

        self.sample_between(self.current, output)
    }

    fn sample_between(&mut self, index: usize, output: OutputAction) -> PlayerSample {
        let items = &self.timeline.items;
        let next_index = (index + 1).min(items.len() - 1);
        let cur = &items[index];
        let next = &items[next_index];

        let weight = if next.relative_time > 0.0 {
            ((self.slider - cur.absolute_time) / next.relative_time).clamp(0.0, 1.0)
        } else {
            1.0
        };

        let mut joints = BTreeMap::new();
        for (name, target) in &next.joints {
            let from = cur.joints.get(name).map(|j| j.angle).unwrap_or(target.angle);
            let angle = if self.interpolating {
                from + weight * (target.angle - from)
            } else {
                target.angle
            };

            let nominal =
                (target.angle - from).abs() / (next.relative_time + self.tuning.time_correction);
            let velocity = nominal * self.adaption_factor(name);

            joints.insert(
                name.clone(),
                JointCommand { angle, velocity },
            );
        }

        let sample = PlayerSample {
            joints,
            output,
            finished: false,
        };
        self.last_tx = sample.joints.clone();
        sample
    }

    fn sample_at_item(&mut self, index: usize, output: OutputAction, finished: bool) -> PlayerSample {
        let item = &self.timeline.items[index];
        let joints: BTreeMap<String, JointCommand> = item
            .joints
            .iter()
            .map(|(name, j)| {
                (
                    name.clone(),
                    JointCommand {
                        angle: j.angle,
                        velocity: j.velocity,
                    },
                )
            })
            .collect();
        self.last_tx = joints.clone();
        PlayerSample {
            joints,
            output,
            finished,
        }
    }

    /// Per-joint velocity factor derived from the measured tracking error.
    fn adaption_factor(&self, joint: &str) -> f64 {
        let strength = self.tuning.velocity_adaption_strength;
        let (Some(rx), Some(tx)) = (self.observed.get(joint), self.last_tx.get(joint)) else {
            return 1.0;
        };
        if self.last_dt <= 0.0 || tx.velocity <= f64::EPSILON {
            return 1.0;
        }
        let ratio = (tx.angle - rx).abs() / (self.last_dt * tx.velocity);
        ratio.clamp(1.0 - strength, 1.0 + strength)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyframe::{Keyframe, Sequence};

    fn timeline(looped: bool) -> Timeline {
        let seq: Sequence = [
            Keyframe::new([("a".to_string(), 0.0)].into(), 50, 0.0, OutputAction::Ignore),
            Keyframe::new([("a".to_string(), 0.5)].into(), 50, 0.0, OutputAction::Set),
        ]
        .into_iter()
        .collect();
        // 0.5 rad at 0.5 rad/s → 1 s segment.
        Timeline::build(&seq, looped, 1.0).unwrap()
    }

    #[test]
    fn test_interpolates_linearly() {
        let mut player = KeyframePlayer::new(timeline(false), true);
        let sample = player.step(0.5);
        let a = sample.joints["a"];
        assert!((a.angle - 0.25).abs() < 1e-9);
        // 0.5 rad over (1.0 + 0.08) s.
        assert!((a.velocity - 0.5 / 1.08).abs() < 1e-9);
        assert!(!sample.finished);
    }

    #[test]
    fn test_snap_mode_targets_next_item() {
        let mut player = KeyframePlayer::new(timeline(false), false);
        let sample = player.step(0.1);
        assert_eq!(sample.joints["a"].angle, 0.5);
    }

    #[test]
    fn test_completion_of_unlooped_timeline() {
        let mut player = KeyframePlayer::new(timeline(false), true);
        player.step(0.9);
        let sample = player.step(0.5);
        assert!(sample.finished);
        assert_eq!(sample.joints["a"].angle, 0.5);
        assert!(player.is_finished());
    }

    #[test]
    fn test_looped_timeline_wraps_slider() {
        let mut player = KeyframePlayer::new(timeline(true), true);
        // Looped timeline: 1 s out + 1 s back = 2 s total.
        player.step(1.5);
        let before_wrap = player.position();
        assert!(before_wrap < 2.0);
        player.step(0.6);
        assert!(player.position() < 1.0, "slider should have wrapped");
        assert!(!player.is_finished());
    }

    #[test]
    fn test_output_action_reported_once_crossed() {
        let mut player = KeyframePlayer::new(timeline(false), true);
        let early = player.step(0.2);
        assert_eq!(early.output, OutputAction::Ignore);
        let done = player.step(1.0);
        assert_eq!(done.output, OutputAction::Set);
    }

    #[test]
    fn test_adaption_speeds_up_lagging_joint() {
        let mut player = KeyframePlayer::new(timeline(false), true);
        player.step(0.1);
        // Report a large lag: observed angle far behind the command.
        player.observe("a", -2.0);
        let sample = player.step(0.1);
        let nominal = 0.5 / 1.08;
        assert!((sample.joints["a"].velocity - nominal * 1.15).abs() < 1e-9);
    }

    #[test]
    fn test_adaption_neutral_without_observations() {
        let mut player = KeyframePlayer::new(timeline(false), true);
        player.step(0.1);
        let sample = player.step(0.1);
        let nominal = 0.5 / 1.08;
        assert!((sample.joints["a"].velocity - nominal).abs() < 1e-9);
    }
}
