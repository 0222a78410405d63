//! Host transport: packet and register traffic over a [`Link`].
//!
//! Owns the serial link exclusively and implements the two wire dialects:
//! ASCII register queries for passthrough mode and framed packets for
//! extended mode. Reply matching is by command code; stray bytes are
//! resynchronised by scanning forward for the header triple (start byte,
//! version, expected command), bounded so a babbling bus cannot wedge the
//! host.
//!
//! Failure taxonomy (see the error module): a write accepted as zero bytes
//! or ten consecutive read timeouts is fatal and surfaces as
//! [`MotionError::LinkLost`]; checksum and prefix trouble is transient and
//! only fails the operation in flight.

use std::time::Duration;

use log::{debug, trace, warn};

use super::link::Link;
use crate::error::{MotionError, MotionResult};
use crate::protocol::ascii::{self, Reply};
use crate::protocol::frame::{encode, FrameDecoder, Packet};
use crate::protocol::{Command, PROTOCOL_VERSION, START_BYTE};

/// Blocking wait per read attempt.
pub const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Consecutive read timeouts that count as a dead link.
const FATAL_TIMEOUTS: u32 = 10;

/// Resync scan bound: one maximal packet.
const RESYNC_WINDOW: usize = 300;

/// Exclusive owner of the serial link.
pub struct Transport {
    link: Box<dyn Link>,
    rx: Vec<u8>,
    consecutive_timeouts: u32,
    /// Header resynchronisations performed, for diagnostics.
    pub resyncs: u64,
}

impl Transport {
    /// Wrap a link. Call [`Transport::open`] before use.
    pub fn new(link: Box<dyn Link>) -> Self {
        Self {
            link,
            rx: Vec::new(),
            consecutive_timeouts: 0,
            resyncs: 0,
        }
    }

    /// Port identification.
    pub fn name(&self) -> String {
        self.link.name()
    }

    /// Open the link.
    pub async fn open(&mut self) -> MotionResult<()> {
        self.rx.clear();
        self.consecutive_timeouts = 0;
        self.link.open().await
    }

    /// Close the link.
    pub async fn close(&mut self) -> MotionResult<()> {
        self.link.close().await
    }

    /// Write the whole buffer; zero accepted bytes is transport-fatal.
    pub async fn write_all(&mut self, bytes: &[u8]) -> MotionResult<()> {
        let mut offset = 0;
        while offset < bytes.len() {
            let written = self.link.write(&bytes[offset..]).await?;
            if written == 0 {
                return Err(MotionError::LinkLost("write accepted 0 bytes".to_string()));
            }
            offset += written;
        }
        Ok(())
    }

    async fn read_more(&mut self) -> MotionResult<bool> {
        let chunk = self.link.read(READ_TIMEOUT).await?;
        if chunk.is_empty() {
            self.consecutive_timeouts += 1;
            if self.consecutive_timeouts >= FATAL_TIMEOUTS {
                return Err(MotionError::LinkLost(format!(
                    "{FATAL_TIMEOUTS} consecutive read timeouts"
                )));
            }
            return Ok(false);
        }
        self.consecutive_timeouts = 0;
        self.rx.extend_from_slice(&chunk);
        Ok(true)
    }

    /// Send one ASCII register command and wait for its `\r`-terminated
    /// echo. `None` means the controller did not answer in time, which the
    /// connection layer treats as "no robot on this address". A probe
    /// timeout here does not count toward the fatal-timeout budget, or the
    /// fifteen-attempt detection loop could never run its course.
    pub async fn ascii_query(
        &mut self,
        id: u8,
        register: &str,
        value: Option<i32>,
    ) -> MotionResult<Option<Reply>> {
        self.rx.clear();
        self.write_all(&ascii::command(id, register, value)).await?;

        let mut attempts = 0;
        loop {
            if let Some(at) = self.rx.iter().position(|&b| b == b'\r') {
                let line: Vec<u8> = self.rx.drain(..=at).collect();
                let text = String::from_utf8_lossy(&line[..line.len() - 1]).to_string();
                trace!("ascii reply: {text}");
                return Ok(ascii::parse_reply(&text));
            }
            attempts += 1;
            if attempts > 3 {
                return Ok(None);
            }
            let chunk = self.link.read(READ_TIMEOUT).await?;
            if chunk.is_empty() {
                return Ok(None);
            }
            self.rx.extend_from_slice(&chunk);
        }
    }

    /// Send one extended-mode packet and wait for the reply that carries
    /// the same command code.
    pub async fn request(&mut self, command: Command, payload: &[u8]) -> MotionResult<Packet> {
        self.write_all(&encode(command, payload)).await?;
        self.await_reply(command).await
    }

    async fn await_reply(&mut self, command: Command) -> MotionResult<Packet> {
        let mut scanned = 0usize;
        loop {
            if let Some(packet) = self.scan_packet(command)? {
                return Ok(packet);
            }
            scanned += self.rx.len();
            if scanned > RESYNC_WINDOW {
                return Err(MotionError::BadFrame(format!(
                    "no {command:?} reply within {RESYNC_WINDOW} bytes"
                )));
            }
            // A timeout here just loops again; FATAL_TIMEOUTS bounds it.
            self.read_more().await?;
        }
    }

    /// Scan the receive buffer for a reply to `command`, discarding noise
    /// up to the next plausible header.
    fn scan_packet(&mut self, command: Command) -> MotionResult<Option<Packet>> {
        loop {
            let Some(start) = self.find_header(command) else {
                // Nothing resembling our header: keep at most a partial
                // header tail, drop the rest as noise.
                let keep = self.rx.len().min(2);
                if self.rx.len() > keep {
                    self.rx.drain(..self.rx.len() - keep);
                }
                return Ok(None);
            };
            if start > 0 {
                self.resyncs += 1;
                warn!("resync: dropping {start} stray bytes");
                self.rx.drain(..start);
            }

            let mut decoder = FrameDecoder::new();
            for (index, &byte) in self.rx.iter().enumerate() {
                if let Some(packet) = decoder.push(byte) {
                    self.rx.drain(..=index);
                    if packet.command == command {
                        debug!("reply {:?} ({} payload bytes)", packet.command, packet.payload.len());
                        return Ok(Some(packet));
                    }
                    return Err(MotionError::ReplyMismatch {
                        expected: format!("{command:?}"),
                        got: format!("{:?}", packet.command),
                    });
                }
            }

            // Incomplete packet: wait for more bytes unless the candidate
            // header has gone stale without completing.
            if self.rx.len() > RESYNC_WINDOW {
                self.rx.drain(..1);
                self.resyncs += 1;
                continue;
            }
            return Ok(None);
        }
    }

    fn find_header(&self, command: Command) -> Option<usize> {
        self.rx.windows(3).position(|w| {
            w[0] == START_BYTE && w[1] == PROTOCOL_VERSION && w[2] == command as u8
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::link::MockLink;
    use crate::protocol::wire::Feedback;
    use crate::protocol::NUM_AXES;

    fn transport_with(link: MockLink) -> Transport {
        Transport::new(Box::new(link))
    }

    #[tokio::test]
    async fn test_ascii_query_roundtrip() {
        let mut link = MockLink::new();
        link.push_reply(b"1ZP+0\r");
        let mut transport = transport_with(link);
        transport.open().await.unwrap();

        let reply = transport.ascii_query(1, "ZP", None).await.unwrap().unwrap();
        assert_eq!(reply.id, 1);
        assert_eq!(reply.register, "ZP");
        assert_eq!(reply.value, Some(0));
    }

    #[tokio::test]
    async fn test_ascii_query_timeout_is_none() {
        let mut transport = transport_with(MockLink::new());
        transport.open().await.unwrap();
        let reply = transport.ascii_query(1, "ZP", None).await.unwrap();
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_request_matches_reply() {
        let mut link = MockLink::new();
        link.push_reply(&encode(Command::Init, &[]));
        let mut transport = transport_with(link);
        transport.open().await.unwrap();

        let reply = transport.request(Command::Init, &[]).await.unwrap();
        assert_eq!(reply.command, Command::Init);
        assert!(reply.payload.is_empty());
    }

    #[tokio::test]
    async fn test_request_resyncs_past_noise() {
        let fb = Feedback {
            num_axes: 4,
            flags: 0,
            positions: [0; NUM_AXES],
        };
        let mut reply = b"ZZ\x01".to_vec();
        reply.extend(encode(Command::Feedback, &fb.encode()));

        let mut link = MockLink::new();
        link.push_reply(&reply);
        let mut transport = transport_with(link);
        transport.open().await.unwrap();

        let packet = transport.request(Command::Feedback, &[]).await.unwrap();
        assert_eq!(packet.command, Command::Feedback);
        assert_eq!(transport.resyncs, 1);
    }

    #[tokio::test]
    async fn test_request_mismatched_command_errors() {
        let mut link = MockLink::new();
        link.push_reply(&encode(Command::Stop, &[]));
        let mut transport = transport_with(link);
        transport.open().await.unwrap();

        let err = transport.request(Command::Play, &[0]).await.unwrap_err();
        assert!(matches!(err, MotionError::ReplyMismatch { .. }));
    }

    #[tokio::test]
    async fn test_zero_byte_write_is_fatal() {
        let mut link = MockLink::new();
        link.fail_writes = true;
        let mut transport = transport_with(link);
        transport.open().await.unwrap();

        let err = transport.write_all(b"#1ZP\r").await.unwrap_err();
        assert!(matches!(err, MotionError::LinkLost(_)));
    }

    #[tokio::test]
    async fn test_consecutive_timeouts_are_fatal() {
        let mut transport = transport_with(MockLink::new());
        transport.open().await.unwrap();

        let err = transport.request(Command::Feedback, &[]).await.unwrap_err();
        assert!(matches!(err, MotionError::LinkLost(_)));
    }
}
