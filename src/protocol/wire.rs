//! Packed payload layouts for the extended protocol.
//!
//! All multi-byte fields are little-endian and structs carry no alignment
//! padding, matching the `#pragma pack` layout the microcontroller persists
//! to non-volatile memory. Encoding and decoding go through `bytes`'
//! [`Buf`]/[`BufMut`] so the byte order is explicit at every field.

use bytes::{Buf, BufMut};

use super::{MAX_KEYFRAMES, NUM_AXES, POSITION_BIAS};
use crate::error::{MotionError, MotionResult};

/// Digital-output annotation carried by keyframes and motion commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum OutputCommand {
    /// Leave the output untouched.
    #[default]
    Nop = 0,
    /// Drive the output high after the segment.
    Set = 1,
    /// Drive the output low after the segment.
    Reset = 2,
}

impl OutputCommand {
    /// Decode from the wire byte; unknown values read as `Nop`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => OutputCommand::Set,
            2 => OutputCommand::Reset,
            _ => OutputCommand::Nop,
        }
    }
}

/// Device configuration record, persisted alongside the keyframe store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Number of valid keyframes in the store.
    pub num_keyframes: u16,
    /// Number of axes participating in playback.
    pub active_axes: u16,
    /// Per-axis encoder-to-motor ratio, `round(256 · enc_to_rad / mot_to_rad)`.
    pub enc_to_mot: [u16; NUM_AXES],
    /// Look-ahead window in milliseconds for the velocity correction loop.
    pub lookahead: u16,
}

impl DeviceConfig {
    /// Encoded size in bytes.
    pub const SIZE: usize = 2 + 2 + 2 * NUM_AXES + 2;

    /// Serialize into the packed wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.put_u16_le(self.num_keyframes);
        buf.put_u16_le(self.active_axes);
        for &ratio in &self.enc_to_mot {
            buf.put_u16_le(ratio);
        }
        buf.put_u16_le(self.lookahead);
        buf
    }

    /// Parse from the packed wire layout.
    pub fn decode(mut bytes: &[u8]) -> MotionResult<Self> {
        if bytes.len() != Self::SIZE {
            return Err(MotionError::BadFrame(format!(
                "config payload is {} bytes, expected {}",
                bytes.len(),
                Self::SIZE
            )));
        }
        let num_keyframes = bytes.get_u16_le();
        let active_axes = bytes.get_u16_le();
        let mut enc_to_mot = [0u16; NUM_AXES];
        for ratio in &mut enc_to_mot {
            *ratio = bytes.get_u16_le();
        }
        let lookahead = bytes.get_u16_le();
        Ok(Self {
            num_keyframes,
            active_axes,
            enc_to_mot,
            lookahead,
        })
    }

    /// Erased-flash image: every field reads back 0xFFFF.
    pub fn erased() -> Self {
        Self {
            num_keyframes: 0xFFFF,
            active_axes: 0xFFFF,
            enc_to_mot: [0xFFFF; NUM_AXES],
            lookahead: 0xFFFF,
        }
    }

    /// Boot-time validation. An erased or overlong image is replaced by the
    /// factory default of four axes and an empty sequence.
    pub fn validated(self) -> Self {
        if self.active_axes == 0xFFFF || self.num_keyframes as usize >= MAX_KEYFRAMES {
            Self {
                num_keyframes: 0,
                active_axes: 4,
                enc_to_mot: [256; NUM_AXES],
                lookahead: 200,
            }
        } else {
            self
        }
    }
}

/// One keyframe in wire form: a timed target in biased tick-space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireKeyframe {
    /// Segment duration in milliseconds. Zero only on the initial frame.
    pub duration: u16,
    /// Per-axis target, encoder position + [`POSITION_BIAS`].
    pub ticks: [u16; NUM_AXES],
    /// Digital output action applied after the segment.
    pub output: OutputCommand,
}

impl WireKeyframe {
    /// Encoded size in bytes.
    pub const SIZE: usize = 2 + 2 * NUM_AXES + 1;

    /// A zero-duration frame holding every axis at the bias origin.
    pub fn origin() -> Self {
        Self {
            duration: 0,
            ticks: [POSITION_BIAS; NUM_AXES],
            output: OutputCommand::Nop,
        }
    }

    /// Serialize into the packed wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.put_u16_le(self.duration);
        for &tick in &self.ticks {
            buf.put_u16_le(tick);
        }
        buf.put_u8(self.output as u8);
        buf
    }

    /// Parse from the packed wire layout.
    pub fn decode(mut bytes: &[u8]) -> MotionResult<Self> {
        if bytes.len() != Self::SIZE {
            return Err(MotionError::BadFrame(format!(
                "keyframe payload is {} bytes, expected {}",
                bytes.len(),
                Self::SIZE
            )));
        }
        let duration = bytes.get_u16_le();
        let mut ticks = [0u16; NUM_AXES];
        for tick in &mut ticks {
            *tick = bytes.get_u16_le();
        }
        let output = OutputCommand::from_u8(bytes.get_u8());
        Ok(Self {
            duration,
            ticks,
            output,
        })
    }
}

/// Payload of a `SaveKeyframe` request: slot index plus the frame itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveKeyframe {
    /// Slot in the device's RAM keyframe buffer.
    pub index: u8,
    /// The frame to store.
    pub keyframe: WireKeyframe,
}

impl SaveKeyframe {
    /// Encoded size in bytes.
    pub const SIZE: usize = 1 + WireKeyframe::SIZE;

    /// Serialize into the packed wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.put_u8(self.index);
        buf.extend_from_slice(&self.keyframe.encode());
        buf
    }

    /// Parse from the packed wire layout.
    pub fn decode(bytes: &[u8]) -> MotionResult<Self> {
        if bytes.len() != Self::SIZE {
            return Err(MotionError::BadFrame(format!(
                "save-keyframe payload is {} bytes, expected {}",
                bytes.len(),
                Self::SIZE
            )));
        }
        Ok(Self {
            index: bytes[0],
            keyframe: WireKeyframe::decode(&bytes[1..])?,
        })
    }
}

/// Feedback flag: the sequencer is currently playing.
pub const FLAG_PLAYING: u8 = 0x01;

/// Play flag: restart from keyframe 1 after the last segment.
pub const FLAG_LOOP: u8 = 0x01;

/// Device status reply carrying per-axis encoder positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Feedback {
    /// Number of axes with meaningful position slots.
    pub num_axes: u8,
    /// Status flags, see [`FLAG_PLAYING`].
    pub flags: u8,
    /// Raw positions; [`super::NO_READING`] marks a stale slot.
    pub positions: [i16; NUM_AXES],
}

impl Feedback {
    /// Encoded size in bytes.
    pub const SIZE: usize = 2 + 2 * NUM_AXES;

    /// True while the device sequencer is running.
    pub fn is_playing(&self) -> bool {
        self.flags & FLAG_PLAYING != 0
    }

    /// Serialize into the packed wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.put_u8(self.num_axes);
        buf.put_u8(self.flags);
        for &pos in &self.positions {
            buf.put_i16_le(pos);
        }
        buf
    }

    /// Parse from the packed wire layout.
    pub fn decode(mut bytes: &[u8]) -> MotionResult<Self> {
        if bytes.len() != Self::SIZE {
            return Err(MotionError::BadFrame(format!(
                "feedback payload is {} bytes, expected {}",
                bytes.len(),
                Self::SIZE
            )));
        }
        let num_axes = bytes.get_u8();
        let flags = bytes.get_u8();
        let mut positions = [0i16; NUM_AXES];
        for pos in &mut positions {
            *pos = bytes.get_i16_le();
        }
        Ok(Self {
            num_axes,
            flags,
            positions,
        })
    }
}

/// Direct motion command: one destination and velocity per axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Motion {
    /// Per-axis destinations in biased tick-space.
    pub ticks: [u16; NUM_AXES],
    /// Per-axis motor velocities.
    pub velocity: [u16; NUM_AXES],
    /// Number of axes to apply.
    pub num_axes: u8,
    /// Digital output action to apply with the move.
    pub output: OutputCommand,
}

impl Motion {
    /// Encoded size in bytes.
    pub const SIZE: usize = 4 * NUM_AXES + 2;

    /// Serialize into the packed wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        for &tick in &self.ticks {
            buf.put_u16_le(tick);
        }
        for &vel in &self.velocity {
            buf.put_u16_le(vel);
        }
        buf.put_u8(self.num_axes);
        buf.put_u8(self.output as u8);
        buf
    }

    /// Parse from the packed wire layout.
    pub fn decode(mut bytes: &[u8]) -> MotionResult<Self> {
        if bytes.len() != Self::SIZE {
            return Err(MotionError::BadFrame(format!(
                "motion payload is {} bytes, expected {}",
                bytes.len(),
                Self::SIZE
            )));
        }
        let mut ticks = [0u16; NUM_AXES];
        for tick in &mut ticks {
            *tick = bytes.get_u16_le();
        }
        let mut velocity = [0u16; NUM_AXES];
        for vel in &mut velocity {
            *vel = bytes.get_u16_le();
        }
        let num_axes = bytes.get_u8();
        let output = OutputCommand::from_u8(bytes.get_u8());
        Ok(Self {
            ticks,
            velocity,
            num_axes,
            output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_roundtrip() {
        let config = DeviceConfig {
            num_keyframes: 2,
            active_axes: 5,
            enc_to_mot: [256, 128, 256, 512, 300, 256, 256, 256],
            lookahead: 200,
        };
        let bytes = config.encode();
        assert_eq!(bytes.len(), DeviceConfig::SIZE);
        assert_eq!(DeviceConfig::decode(&bytes).unwrap(), config);
    }

    #[test]
    fn test_keyframe_roundtrip() {
        let kf = WireKeyframe {
            duration: 1500,
            ticks: [16384, 16964, 15804, 16384, 16384, 16384, 16384, 16384],
            output: OutputCommand::Set,
        };
        let bytes = kf.encode();
        assert_eq!(bytes.len(), WireKeyframe::SIZE);
        assert_eq!(WireKeyframe::decode(&bytes).unwrap(), kf);
    }

    #[test]
    fn test_save_keyframe_roundtrip() {
        let save = SaveKeyframe {
            index: 17,
            keyframe: WireKeyframe::origin(),
        };
        assert_eq!(SaveKeyframe::decode(&save.encode()).unwrap(), save);
    }

    #[test]
    fn test_feedback_roundtrip_and_flags() {
        let fb = Feedback {
            num_axes: 4,
            flags: FLAG_PLAYING,
            positions: [0, -120, 580, super::super::NO_READING, 0, 0, 0, 0],
        };
        let decoded = Feedback::decode(&fb.encode()).unwrap();
        assert_eq!(decoded, fb);
        assert!(decoded.is_playing());
    }

    #[test]
    fn test_motion_roundtrip() {
        let motion = Motion {
            ticks: [16384; 8],
            velocity: [250, 100, 7000, 0, 0, 0, 0, 0],
            num_axes: 3,
            output: OutputCommand::Reset,
        };
        assert_eq!(Motion::decode(&motion.encode()).unwrap(), motion);
    }

    #[test]
    fn test_short_payload_rejected() {
        assert!(DeviceConfig::decode(&[0u8; DeviceConfig::SIZE - 1]).is_err());
        assert!(WireKeyframe::decode(&[0u8; 4]).is_err());
        assert!(Feedback::decode(&[]).is_err());
    }

    #[test]
    fn test_boot_validation_resets_erased_image() {
        let config = DeviceConfig::erased().validated();
        assert_eq!(config.num_keyframes, 0);
        assert_eq!(config.active_axes, 4);

        let overlong = DeviceConfig {
            num_keyframes: MAX_KEYFRAMES as u16,
            active_axes: 4,
            enc_to_mot: [256; NUM_AXES],
            lookahead: 200,
        };
        assert_eq!(overlong.validated().num_keyframes, 0);

        let good = DeviceConfig {
            num_keyframes: 2,
            active_axes: 4,
            enc_to_mot: [256; NUM_AXES],
            lookahead: 200,
        };
        assert_eq!(good.clone().validated(), good);
    }
}
