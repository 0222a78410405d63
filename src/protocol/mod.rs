//! Wire protocol between the host and the arm microcontroller.
//!
//! Two protocols share the serial link. In passthrough mode the host talks
//! plain ASCII (`#<id><reg><value>\r`) straight to the per-joint motor
//! controllers on the RS-485 bus; see [`ascii`]. In extended mode the
//! microcontroller terminates a framed binary protocol; see [`frame`] for
//! the packet envelope and [`wire`] for the payload layouts.
//!
//! Every extended-mode request is answered by exactly one reply packet
//! carrying the same command code, so the host can match answers without
//! sequence numbers.

pub mod ascii;
pub mod frame;
pub mod wire;

/// First byte of every extended-protocol packet.
pub const START_BYTE: u8 = 0xFF;

/// Protocol version carried in every packet header.
pub const PROTOCOL_VERSION: u8 = 10;

/// Terminator byte closing every extended-protocol packet.
pub const TERMINATOR: u8 = 0x0D;

/// Number of axis slots in every fixed-layout payload.
pub const NUM_AXES: usize = 8;

/// Capacity of the device-side keyframe store.
pub const MAX_KEYFRAMES: usize = 128;

/// Zero reference for tick-space. Encoder positions are biased by this
/// amount on the wire so negative positions fit in a u16.
pub const POSITION_BIAS: u16 = 16384;

/// Feedback position meaning "no fresh encoder reading".
pub const NO_READING: i16 = 0x7FFF;

/// Literal key required in the payload of a `Reset` packet before the
/// device jumps into its bootloader.
pub const RESET_KEY: [u8; 8] = [0x0A, 0x65, 0x38, 0x47, 0x82, 0xAB, 0xBF, 0x00];

/// Extended-protocol command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Enter extended mode / keep-alive. Echoed verbatim by the device.
    Init = 0,
    /// Jump to the bootloader if the payload carries [`RESET_KEY`].
    Reset = 1,
    /// Query (empty payload) or replace (full payload) the device config.
    Config = 2,
    /// Read one stored keyframe by index.
    ReadKeyframe = 3,
    /// Write one keyframe into the device's RAM buffer.
    SaveKeyframe = 4,
    /// Leave extended mode and fall back to passthrough.
    Exit = 5,
    /// Flush the RAM keyframe buffer and config to non-volatile memory.
    Commit = 6,
    /// Start sequence playback on the device.
    Play = 7,
    /// Abort playback.
    Stop = 8,
    /// Query axis positions and the playing flag.
    Feedback = 9,
    /// Direct per-axis destination/velocity command (host-driven playback).
    Motion = 10,
}

impl Command {
    /// Number of defined command codes.
    pub const COUNT: u8 = 11;

    /// Decode a command byte. Returns `None` for codes outside the table.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Command::Init,
            1 => Command::Reset,
            2 => Command::Config,
            3 => Command::ReadKeyframe,
            4 => Command::SaveKeyframe,
            5 => Command::Exit,
            6 => Command::Commit,
            7 => Command::Play,
            8 => Command::Stop,
            9 => Command::Feedback,
            10 => Command::Motion,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes_roundtrip() {
        for code in 0..Command::COUNT {
            let cmd = Command::from_u8(code).unwrap();
            assert_eq!(cmd as u8, code);
        }
        assert!(Command::from_u8(Command::COUNT).is_none());
        assert!(Command::from_u8(0xFF).is_none());
    }
}
