//! Extended-protocol packet envelope.
//!
//! Every packet is `FF <version> <command> <length> <payload…> <checksum> 0D`
//! with the checksum being the bitwise complement of the 8-bit sum of
//! version, command, length and all payload bytes. The canonical INIT
//! packet therefore reads `FF 0A 00 00 F1 0D`.
//!
//! Decoding runs through a seven-state byte machine that drops back to
//! `Start` on the first byte that breaks the grammar, so stray bus noise
//! can never produce a packet. A `0xFF` that causes a mismatch is re-examined
//! as a possible new start byte.

use super::{Command, PROTOCOL_VERSION, START_BYTE, TERMINATOR};

/// A parsed extended-protocol packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Command code from the header.
    pub command: Command,
    /// Raw payload bytes, little-endian packed.
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a packet from a command and payload.
    pub fn new(command: Command, payload: Vec<u8>) -> Self {
        Self { command, payload }
    }

    /// Encode this packet into its on-wire byte form.
    pub fn encode(&self) -> Vec<u8> {
        encode(self.command, &self.payload)
    }
}

/// Compute the packet checksum over version, command, length and payload.
pub fn checksum(command: u8, payload: &[u8]) -> u8 {
    let mut sum = PROTOCOL_VERSION
        .wrapping_add(command)
        .wrapping_add(payload.len() as u8);
    for &b in payload {
        sum = sum.wrapping_add(b);
    }
    !sum
}

/// Encode a command and payload into a complete framed packet.
pub fn encode(command: Command, payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= u8::MAX as usize);
    let mut out = Vec::with_capacity(payload.len() + 6);
    out.push(START_BYTE);
    out.push(PROTOCOL_VERSION);
    out.push(command as u8);
    out.push(payload.len() as u8);
    out.extend_from_slice(payload);
    out.push(checksum(command as u8, payload));
    out.push(TERMINATOR);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Start,
    Version,
    Command,
    Length,
    Payload,
    Checksum,
    End,
}

/// Incremental packet decoder.
///
/// Feed bytes one at a time with [`FrameDecoder::push`]; a complete packet
/// is returned once its terminator byte checks out. The decoder owns no I/O
/// and is shared by the host transport and the device dispatcher.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    command: u8,
    length: u8,
    payload: Vec<u8>,
}

impl FrameDecoder {
    /// Create a decoder in the `Start` state.
    pub fn new() -> Self {
        Self {
            state: DecodeState::Start,
            command: 0,
            length: 0,
            payload: Vec::new(),
        }
    }

    /// Drop any partial packet and return to the `Start` state.
    pub fn reset(&mut self) {
        self.state = DecodeState::Start;
        self.payload.clear();
    }

    /// Consume one byte. Returns a packet when the byte completes one.
    pub fn push(&mut self, byte: u8) -> Option<Packet> {
        match self.state {
            DecodeState::Start => {
                if byte == START_BYTE {
                    self.state = DecodeState::Version;
                }
            }
            DecodeState::Version => {
                if byte == PROTOCOL_VERSION {
                    self.state = DecodeState::Command;
                } else {
                    self.mismatch(byte);
                }
            }
            DecodeState::Command => {
                if byte < Command::COUNT {
                    self.command = byte;
                    self.state = DecodeState::Length;
                } else {
                    self.mismatch(byte);
                }
            }
            DecodeState::Length => {
                self.length = byte;
                self.payload.clear();
                self.state = if byte == 0 {
                    DecodeState::Checksum
                } else {
                    DecodeState::Payload
                };
            }
            DecodeState::Payload => {
                self.payload.push(byte);
                if self.payload.len() == self.length as usize {
                    self.state = DecodeState::Checksum;
                }
            }
            DecodeState::Checksum => {
                if byte == checksum(self.command, &self.payload) {
                    self.state = DecodeState::End;
                } else {
                    self.mismatch(byte);
                }
            }
            DecodeState::End => {
                let done = byte == TERMINATOR;
                if !done {
                    self.mismatch(byte);
                    return None;
                }
                self.state = DecodeState::Start;
                let command = Command::from_u8(self.command)?;
                return Some(Packet {
                    command,
                    payload: std::mem::take(&mut self.payload),
                });
            }
        }
        None
    }

    /// Feed a byte slice, collecting every packet it completes.
    pub fn push_all(&mut self, bytes: &[u8]) -> Vec<Packet> {
        bytes.iter().filter_map(|&b| self.push(b)).collect()
    }

    fn mismatch(&mut self, byte: u8) {
        self.payload.clear();
        // A failing 0xFF may itself start the next packet.
        self.state = if byte == START_BYTE {
            DecodeState::Version
        } else {
            DecodeState::Start
        };
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_packet_bytes() {
        let bytes = encode(Command::Init, &[]);
        assert_eq!(bytes, vec![0xFF, 0x0A, 0x00, 0x00, 0xF1, 0x0D]);
    }

    #[test]
    fn test_roundtrip_with_payload() {
        let payload = vec![0x01, 0x02, 0xFF, 0x00, 0x7F];
        let bytes = encode(Command::SaveKeyframe, &payload);

        let mut dec = FrameDecoder::new();
        let packets = dec.push_all(&bytes);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].command, Command::SaveKeyframe);
        assert_eq!(packets[0].payload, payload);
    }

    #[test]
    fn test_decoder_survives_leading_noise() {
        let mut bytes = vec![0x31, 0x5A, 0x50, 0x0D, 0xFF, 0x03];
        bytes.extend(encode(Command::Feedback, &[0x04, 0x00]));

        let mut dec = FrameDecoder::new();
        let packets = dec.push_all(&bytes);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].command, Command::Feedback);
    }

    #[test]
    fn test_decoder_rejects_bad_checksum() {
        let mut bytes = encode(Command::Play, &[0x01]);
        let checksum_index = bytes.len() - 2;
        bytes[checksum_index] ^= 0x01;

        let mut dec = FrameDecoder::new();
        assert!(dec.push_all(&bytes).is_empty());

        // The decoder must recover for the next well-formed packet.
        let good = encode(Command::Stop, &[]);
        assert_eq!(dec.push_all(&good).len(), 1);
    }

    #[test]
    fn test_decoder_rejects_unknown_command() {
        let mut bytes = encode(Command::Motion, &[]);
        bytes[2] = Command::COUNT; // first code past the table
        bytes[4] = checksum(Command::COUNT, &[]);

        let mut dec = FrameDecoder::new();
        assert!(dec.push_all(&bytes).is_empty());
    }

    #[test]
    fn test_packet_split_across_reads() {
        let bytes = encode(Command::Config, &[0x02, 0x00, 0x04, 0x00]);
        let (a, b) = bytes.split_at(3);

        let mut dec = FrameDecoder::new();
        assert!(dec.push_all(a).is_empty());
        let packets = dec.push_all(b);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].command, Command::Config);
    }

    #[test]
    fn test_false_start_then_real_packet() {
        // 0xFF followed by a non-version byte, then a valid packet.
        let mut bytes = vec![0xFF, 0x42];
        bytes.extend(encode(Command::Init, &[]));

        let mut dec = FrameDecoder::new();
        assert_eq!(dec.push_all(&bytes).len(), 1);
    }
}
