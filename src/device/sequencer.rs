//! On-device playback sequencer.
//!
//! Given a committed keyframe sequence, the sequencer interpolates target
//! ticks across the keyframe timeline and runs a look-ahead velocity
//! correction loop per axis: instead of commanding the nominal segment
//! velocity it predicts where each axis should be `lookahead` milliseconds
//! from now, reads the encoder, and commands the velocity that closes the
//! gap in exactly that window. Axes that lag speed up, axes that lead slow
//! down, and all axes land together.
//!
//! The original firmware ran this as a blocking loop that polled the
//! command buffer between axis passes; here each [`Sequencer::step`] call
//! is one such pass, so the dispatcher naturally interleaves at the same
//! cadence.

use log::{debug, warn};

use super::bus::{JointBus, JointBusExt};
use crate::protocol::wire::{DeviceConfig, OutputCommand, WireKeyframe};
use crate::protocol::{MAX_KEYFRAMES, NUM_AXES, POSITION_BIAS};

/// Tick tolerance for the "already at the start keyframe" check.
const START_TOLERANCE: i64 = 50;

/// Consecutive in-position passes required before playback begins.
const START_HITS: u8 = 10;

/// Time budget for reaching the start keyframe, milliseconds.
const START_TIMEOUT_MS: u64 = 8_000;

/// Hold window used past the final keyframe in non-loop mode, milliseconds.
const HOLD_DURATION_MS: u64 = 100;

/// Stable-high samples required on the sync line.
const SYNC_STABLE_SAMPLES: u8 = 20;

/// Delay between sync detection and the synchronised restart, milliseconds.
const SYNC_ASSERT_DELAY_MS: u64 = 20;

/// Shared pull-up line used to synchronise multiple arms.
pub trait SyncLine: Send {
    /// Stop driving the line low.
    fn release(&mut self);
    /// Drive the line low.
    fn assert_low(&mut self);
    /// Sample the line.
    fn is_high(&self) -> bool;
}

/// Sync stand-in for a single arm: the pull-up keeps the line high.
#[derive(Debug, Default)]
pub struct SoloSync;

impl SyncLine for SoloSync {
    fn release(&mut self) {}
    fn assert_low(&mut self) {}
    fn is_high(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlayState {
    Idle,
    /// Driving every axis to keyframe 0 before playback.
    ToStart {
        deadline: u64,
        hits: u8,
        looped: bool,
    },
    /// Interpolating the segment `from → to`.
    Segment {
        from: usize,
        to: usize,
        started: u64,
        ends: u64,
        looped: bool,
    },
    /// Loop-mode handshake with peer arms before wrapping.
    SyncWait {
        stable: u8,
        assert_at: Option<u64>,
    },
}

/// The playback engine.
pub struct Sequencer {
    config: DeviceConfig,
    frames: Vec<WireKeyframe>,
    state: PlayState,
    abort: bool,
}

impl Sequencer {
    /// Create a sequencer from a boot-validated config and keyframe store.
    pub fn new(config: DeviceConfig, frames: Vec<WireKeyframe>) -> Self {
        Self {
            config,
            frames,
            state: PlayState::Idle,
            abort: false,
        }
    }

    /// Current device configuration.
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Replace the configuration. Caller must check [`Self::is_playing`].
    pub fn set_config(&mut self, config: DeviceConfig) {
        self.config = config;
    }

    /// The in-RAM keyframe buffer.
    pub fn frames(&self) -> &[WireKeyframe] {
        &self.frames
    }

    /// Stored keyframe by index.
    pub fn keyframe(&self, index: usize) -> Option<&WireKeyframe> {
        self.frames.get(index)
    }

    /// Write one keyframe into the RAM buffer. Caller must check
    /// [`Self::is_playing`]; out-of-range indices are rejected.
    pub fn save_keyframe(&mut self, index: usize, frame: WireKeyframe) -> bool {
        if index >= MAX_KEYFRAMES || index > self.frames.len() {
            return false;
        }
        if index == self.frames.len() {
            self.frames.push(frame);
        } else {
            self.frames[index] = frame;
        }
        true
    }

    /// True while a playback state is active.
    pub fn is_playing(&self) -> bool {
        self.state != PlayState::Idle
    }

    /// Request playback. The sequencer first verifies the arm is at
    /// keyframe 0 and drives it there if not.
    pub fn start(&mut self, looped: bool, now: u64, bus: &mut dyn JointBus) {
        if self.is_playing() || self.frames.is_empty() {
            return;
        }
        self.abort = false;
        if self.at_start_keyframe(bus) {
            debug!("already at start keyframe, playback begins");
            self.enter_playback(looped, now);
        } else {
            self.state = PlayState::ToStart {
                deadline: now + START_TIMEOUT_MS,
                hits: 0,
                looped,
            };
        }
    }

    /// Flag the playback loop to stop at its next iteration. Motors keep
    /// their last commanded velocity; the host follows up with a motion
    /// command to hold.
    pub fn stop(&mut self) {
        if self.is_playing() {
            self.abort = true;
        }
    }

    /// One playback iteration (one axis pass). `now` is the 1 kHz tick.
    pub fn step(&mut self, now: u64, bus: &mut dyn JointBus, sync: &mut dyn SyncLine, output: &mut bool) {
        if self.abort {
            self.abort = false;
            self.state = PlayState::Idle;
            debug!("playback aborted");
            return;
        }

        match self.state {
            PlayState::Idle => {}
            PlayState::ToStart {
                deadline,
                hits,
                looped,
            } => self.step_to_start(now, deadline, hits, looped, bus),
            PlayState::Segment {
                from,
                to,
                started,
                ends,
                looped,
            } => {
                if now >= ends {
                    self.apply_output(self.frames[to].output, output);
                    self.advance_segment(to, now, looped);
                } else {
                    self.axis_pass(from, to, now - started, looped, bus);
                }
            }
            PlayState::SyncWait { stable, assert_at } => {
                self.step_sync(now, stable, assert_at, sync);
            }
        }
    }

    fn at_start_keyframe(&self, bus: &mut dyn JointBus) -> bool {
        let first = &self.frames[0];
        for axis in 0..self.active_axes() {
            let Ok(encoder) = bus.read_encoder(axis as u8 + 1) else {
                return false;
            };
            let target = i64::from(first.ticks[axis]);
            let position = i64::from(encoder) + i64::from(POSITION_BIAS);
            if (target - position).abs() >= START_TOLERANCE {
                return false;
            }
        }
        true
    }

    fn step_to_start(
        &mut self,
        now: u64,
        deadline: u64,
        hits: u8,
        looped: bool,
        bus: &mut dyn JointBus,
    ) {
        if now >= deadline {
            warn!("start keyframe not reached within {START_TIMEOUT_MS} ms");
            for axis in 0..self.active_axes() {
                let _ = bus.set_velocity(axis as u8 + 1, 0);
            }
            self.state = PlayState::Idle;
            return;
        }

        if self.at_start_keyframe(bus) {
            let hits = hits + 1;
            if hits >= START_HITS {
                self.enter_playback(looped, now);
            } else {
                self.state = PlayState::ToStart {
                    deadline,
                    hits,
                    looped,
                };
            }
            return;
        }

        // Conservative approach velocity.
        let first = self.frames[0];
        for axis in 0..self.active_axes() {
            let id = axis as u8 + 1;
            let velocity = i64::from(self.config.enc_to_mot[axis]) * 94 / 256;
            let _ = bus.set_destination(id, first.ticks[axis]);
            let _ = bus.set_velocity(id, velocity.clamp(1, i64::from(u16::MAX)) as u16);
        }
        self.state = PlayState::ToStart {
            deadline,
            hits: 0,
            looped,
        };
    }

    fn enter_playback(&mut self, looped: bool, now: u64) {
        if self.frames.len() < 2 {
            self.state = PlayState::Idle;
            return;
        }
        self.state = PlayState::Segment {
            from: 0,
            to: 1,
            started: now,
            ends: now + segment_duration(&self.frames, 1),
            looped,
        };
    }

    fn advance_segment(&mut self, completed: usize, now: u64, looped: bool) {
        if completed + 1 < self.frames.len() {
            self.state = PlayState::Segment {
                from: completed,
                to: completed + 1,
                started: now,
                ends: now + segment_duration(&self.frames, completed + 1),
                looped,
            };
        } else if looped {
            self.state = PlayState::SyncWait {
                stable: 0,
                assert_at: None,
            };
        } else {
            debug!("sequence complete");
            self.state = PlayState::Idle;
        }
    }

    fn step_sync(&mut self, now: u64, stable: u8, assert_at: Option<u64>, sync: &mut dyn SyncLine) {
        match assert_at {
            None => {
                if stable == 0 {
                    sync.release();
                }
                let stable = if sync.is_high() { stable + 1 } else { 0 };
                if stable >= SYNC_STABLE_SAMPLES {
                    self.state = PlayState::SyncWait {
                        stable,
                        assert_at: Some(now + SYNC_ASSERT_DELAY_MS),
                    };
                } else {
                    self.state = PlayState::SyncWait {
                        stable,
                        assert_at: None,
                    };
                }
            }
            Some(at) => {
                if now >= at {
                    sync.assert_low();
                    // Wrap to keyframe 1; frame 0 is only the starting pose.
                    self.state = PlayState::Segment {
                        from: self.frames.len() - 1,
                        to: 1,
                        started: now,
                        ends: now + segment_duration(&self.frames, 1),
                        looped: true,
                    };
                }
            }
        }
    }

    /// One pass over all axes of the running segment. `elapsed` is the time
    /// already spent in this segment.
    fn axis_pass(&self, from: usize, to: usize, elapsed: u64, looped: bool, bus: &mut dyn JointBus) {
        let duration = segment_duration(&self.frames, to);
        let lookahead = u64::from(self.config.lookahead);
        let bias = i64::from(POSITION_BIAS);

        for axis in 0..self.active_axes() {
            let id = axis as u8 + 1;
            let ratio = i64::from(self.config.enc_to_mot[axis]);
            let from_ticks = i64::from(self.frames[from].ticks[axis]) - bias;
            let to_ticks = i64::from(self.frames[to].ticks[axis]) - bias;

            let encoder = if lookahead > 0 {
                bus.read_encoder(id).ok()
            } else {
                None
            };

            match encoder {
                Some(encoder) => {
                    let dest = self.lookahead_destination(from, to, axis, elapsed + lookahead, looped);
                    let velocity = corrected_velocity(dest, i64::from(encoder), lookahead, ratio);
                    let _ = bus.set_destination(id, clamp_tick(dest + bias));
                    let _ = bus.set_velocity(id, velocity);
                }
                None => {
                    // Encoder unreadable or look-ahead disabled: nominal
                    // segment velocity toward the segment target.
                    let fallback =
                        ratio * ((to_ticks - from_ticks).abs() * 1000 / duration as i64) / 256;
                    let _ = bus.set_destination(id, self.frames[to].ticks[axis]);
                    let _ = bus.set_velocity(id, fallback.clamp(0, i64::from(u16::MAX)) as u16);
                }
            }
        }
    }

    /// Expected unbiased position of `axis`, `delta_ms` after the start of
    /// the segment `from → to`, walking keyframes as far as the window
    /// reaches.
    fn lookahead_destination(
        &self,
        from: usize,
        to: usize,
        axis: usize,
        delta_ms: u64,
        looped: bool,
    ) -> i64 {
        let bias = i64::from(POSITION_BIAS);
        let mut delta_ms = delta_ms;
        let mut wfrom = from;
        let mut wto = to;
        let mut wdur = segment_duration(&self.frames, to);
        let mut hold = false;

        while delta_ms > wdur {
            delta_ms -= wdur;
            if wto + 1 < self.frames.len() {
                wfrom = wto;
                wto += 1;
                wdur = segment_duration(&self.frames, wto);
            } else if looped {
                // Frame 0 is the starting pose; loops wrap to frame 1.
                wfrom = wto;
                wto = 1;
                wdur = segment_duration(&self.frames, 1);
            } else {
                wfrom = wto;
                wdur = HOLD_DURATION_MS;
                hold = true;
                break;
            }
        }

        let from_ticks = i64::from(self.frames[wfrom].ticks[axis]) - bias;
        if hold {
            return from_ticks;
        }
        let to_ticks = i64::from(self.frames[wto].ticks[axis]) - bias;
        from_ticks + (delta_ms as i64) * (1000 * (to_ticks - from_ticks) / wdur as i64) / 1000
    }

    fn active_axes(&self) -> usize {
        (self.config.active_axes as usize).min(NUM_AXES)
    }

    fn apply_output(&self, command: OutputCommand, output: &mut bool) {
        match command {
            OutputCommand::Nop => {}
            OutputCommand::Set => *output = true,
            OutputCommand::Reset => *output = false,
        }
    }
}

fn segment_duration(frames: &[WireKeyframe], to: usize) -> u64 {
    u64::from(frames[to].duration).max(1)
}

/// Velocity that closes the gap between the predicted destination and the
/// observed encoder within the look-ahead window. Clamped to keep the motor
/// controller responsive without exceeding its rated speed.
fn corrected_velocity(dest: i64, encoder: i64, lookahead: u64, ratio: i64) -> u16 {
    let nominal = (1000 * (dest - encoder) / lookahead.max(1) as i64).abs() * ratio / 256;
    nominal.clamp(100, ratio * 7000 / 256) as u16
}

fn clamp_tick(value: i64) -> u16 {
    value.clamp(0, 2 * i64::from(POSITION_BIAS)) as u16
}
