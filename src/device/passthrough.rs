//! Passthrough-mode INIT detector.
//!
//! In passthrough mode every host byte is forwarded verbatim to the RS-485
//! bus, except that the microcontroller watches for the exact byte image
//! of an `INIT` packet, which switches it into extended mode. The matcher
//! must buffer-and-replay: when the Nth byte of a partial match breaks the
//! pattern, the N-1 bytes already swallowed are owed to the bus before the
//! failing byte is reconsidered.

use crate::protocol::frame::encode;
use crate::protocol::Command;

/// Outcome of feeding one byte to the matcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchResult {
    /// Byte swallowed as part of a potential INIT prefix.
    Pending,
    /// Not (or no longer) a match; forward these bytes to the bus.
    Forward(Vec<u8>),
    /// The complete INIT image arrived: switch to extended mode.
    Matched,
}

/// Byte-by-byte comparator against the INIT packet image.
#[derive(Debug)]
pub struct InitMatcher {
    image: Vec<u8>,
    matched: usize,
}

impl InitMatcher {
    /// New matcher armed with the canonical INIT image.
    pub fn new() -> Self {
        Self {
            image: encode(Command::Init, &[]),
            matched: 0,
        }
    }

    /// Feed one host byte.
    pub fn push(&mut self, byte: u8) -> MatchResult {
        if byte == self.image[self.matched] {
            self.matched += 1;
            if self.matched == self.image.len() {
                self.matched = 0;
                return MatchResult::Matched;
            }
            return MatchResult::Pending;
        }

        // Replay the swallowed prefix, then re-examine the failing byte:
        // it may itself start a fresh match.
        let mut replay = self.image[..self.matched].to_vec();
        self.matched = 0;
        if byte == self.image[0] {
            self.matched = 1;
        } else {
            replay.push(byte);
        }
        MatchResult::Forward(replay)
    }
}

impl Default for InitMatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(matcher: &mut InitMatcher, bytes: &[u8]) -> (Vec<u8>, bool) {
        let mut forwarded = Vec::new();
        let mut matched = false;
        for &b in bytes {
            match matcher.push(b) {
                MatchResult::Pending => {}
                MatchResult::Forward(bytes) => forwarded.extend(bytes),
                MatchResult::Matched => matched = true,
            }
        }
        (forwarded, matched)
    }

    #[test]
    fn test_clean_init_matches() {
        let mut m = InitMatcher::new();
        let (forwarded, matched) = feed(&mut m, &[0xFF, 0x0A, 0x00, 0x00, 0xF1, 0x0D]);
        assert!(matched);
        assert!(forwarded.is_empty());
    }

    #[test]
    fn test_init_split_across_reads() {
        let mut m = InitMatcher::new();
        let (f1, m1) = feed(&mut m, &[0xFF, 0x0A, 0x00]);
        assert!(!m1);
        assert!(f1.is_empty());
        let (f2, m2) = feed(&mut m, &[0x00, 0xF1, 0x0D]);
        assert!(m2);
        assert!(f2.is_empty());
    }

    #[test]
    fn test_ascii_traffic_forwarded_untouched() {
        let mut m = InitMatcher::new();
        let (forwarded, matched) = feed(&mut m, b"#1ZP\r#2n16384\r");
        assert!(!matched);
        assert_eq!(forwarded, b"#1ZP\r#2n16384\r".to_vec());
    }

    #[test]
    fn test_partial_match_replayed_before_failing_byte() {
        let mut m = InitMatcher::new();
        // Three matching bytes, then a mismatch.
        let (forwarded, matched) = feed(&mut m, &[0xFF, 0x0A, 0x00, 0x42]);
        assert!(!matched);
        assert_eq!(forwarded, vec![0xFF, 0x0A, 0x00, 0x42]);
    }

    #[test]
    fn test_failing_byte_can_restart_match() {
        let mut m = InitMatcher::new();
        // 0xFF 0xFF: the second 0xFF aborts the first match but starts a
        // new one, so only the first 0xFF is forwarded.
        let (forwarded, matched) = feed(&mut m, &[0xFF, 0xFF, 0x0A, 0x00, 0x00, 0xF1, 0x0D]);
        assert!(matched);
        assert_eq!(forwarded, vec![0xFF]);
    }
}
