//! Serial link adapters.
//!
//! The transport talks to the arm through the [`Link`] trait so the same
//! code drives a real serial port, a scripted mock in unit tests, or the
//! full device simulation. The serial implementation wraps the `serialport`
//! crate and performs its blocking I/O on Tokio's blocking executor, with
//! the handle behind an `Arc<Mutex>` so reads and writes serialise.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::device::nvm::MemNvm;
use crate::device::Device;
use crate::error::{MotionError, MotionResult};

/// Serial configuration shared by every link: 115200 baud, 8N1, no
/// handshake.
pub const BAUD_RATE: u32 = 115_200;

/// Ports probed by the cycling opener before wrapping around.
pub const PORT_CYCLE: usize = 15;

/// Byte-level connection to the arm.
#[async_trait]
pub trait Link: Send {
    /// Human-readable port identification.
    fn name(&self) -> String;

    /// Open the underlying port.
    async fn open(&mut self) -> MotionResult<()>;

    /// Close the underlying port.
    async fn close(&mut self) -> MotionResult<()>;

    /// Write bytes, returning how many were accepted. A return of zero is
    /// the transport-fatal signal.
    async fn write(&mut self, bytes: &[u8]) -> MotionResult<usize>;

    /// Read whatever arrives within `timeout`. An empty result is a
    /// timeout, not an error.
    async fn read(&mut self, timeout: Duration) -> MotionResult<Vec<u8>>;
}

/// Candidate port names in ascending order.
///
/// Falls back to conventional platform names when enumeration yields
/// nothing, so the cycling opener always has something to probe.
#[cfg(feature = "serial")]
pub fn candidate_ports() -> Vec<String> {
    let mut names: Vec<String> = serialport::available_ports()
        .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
        .unwrap_or_default();
    names.sort();
    if names.is_empty() {
        for index in 0..PORT_CYCLE {
            if cfg!(windows) {
                names.push(format!("COM{index}"));
            } else {
                names.push(format!("/dev/ttyUSB{index}"));
            }
        }
    }
    names
}

/// Round-robin over candidate ports, wrapping modulo [`PORT_CYCLE`].
#[derive(Debug)]
pub struct PortCycler {
    names: Vec<String>,
    index: usize,
}

impl PortCycler {
    /// Cycle over the given names.
    pub fn new(names: Vec<String>) -> Self {
        Self { names, index: 0 }
    }

    /// Next port to try.
    pub fn next_port(&mut self) -> Option<String> {
        if self.names.is_empty() {
            return None;
        }
        let limit = self.names.len().min(PORT_CYCLE);
        let name = self.names[self.index % limit].clone();
        self.index = (self.index + 1) % limit;
        Some(name)
    }
}

/// Real serial port link.
#[cfg(feature = "serial")]
pub struct SerialLink {
    port_name: String,
    handle: Option<Arc<Mutex<Box<dyn serialport::SerialPort>>>>,
}

#[cfg(feature = "serial")]
impl SerialLink {
    /// Link to the named port; nothing is opened yet.
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            handle: None,
        }
    }
}

#[cfg(feature = "serial")]
#[async_trait]
impl Link for SerialLink {
    fn name(&self) -> String {
        self.port_name.clone()
    }

    async fn open(&mut self) -> MotionResult<()> {
        let port_name = self.port_name.clone();
        let port = tokio::task::spawn_blocking(move || {
            serialport::new(&port_name, BAUD_RATE)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(serialport::FlowControl::None)
                .timeout(Duration::from_millis(20))
                .open()
        })
        .await
        .map_err(|e| MotionError::LinkLost(format!("open task failed: {e}")))?
        .map_err(|e| MotionError::LinkLost(format!("cannot open {}: {e}", self.port_name)))?;

        self.handle = Some(Arc::new(Mutex::new(port)));
        log::debug!("serial port {} opened at {} baud", self.port_name, BAUD_RATE);
        Ok(())
    }

    async fn close(&mut self) -> MotionResult<()> {
        if self.handle.take().is_some() {
            log::debug!("serial port {} closed", self.port_name);
        }
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> MotionResult<usize> {
        let handle = self.handle.as_ref().ok_or(MotionError::PortNotConnected)?;
        let handle = Arc::clone(handle);
        let bytes = bytes.to_vec();
        tokio::task::spawn_blocking(move || {
            use std::io::Write;
            let mut port = handle.lock().map_err(|_| {
                MotionError::LinkLost("serial handle poisoned".to_string())
            })?;
            let written = port.write(&bytes)?;
            port.flush()?;
            Ok(written)
        })
        .await
        .map_err(|e| MotionError::LinkLost(format!("write task failed: {e}")))?
    }

    async fn read(&mut self, timeout: Duration) -> MotionResult<Vec<u8>> {
        let handle = self.handle.as_ref().ok_or(MotionError::PortNotConnected)?;
        let handle = Arc::clone(handle);
        tokio::task::spawn_blocking(move || {
            use std::io::Read;
            let mut port = handle.lock().map_err(|_| {
                MotionError::LinkLost("serial handle poisoned".to_string())
            })?;
            let deadline = std::time::Instant::now() + timeout;
            let mut buffer = [0u8; 256];
            loop {
                match port.read(&mut buffer) {
                    Ok(0) => return Err(MotionError::LinkLost("serial EOF".to_string())),
                    Ok(n) => return Ok(buffer[..n].to_vec()),
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                        if std::time::Instant::now() >= deadline {
                            return Ok(Vec::new());
                        }
                    }
                    Err(e) => return Err(MotionError::Io(e)),
                }
            }
        })
        .await
        .map_err(|e| MotionError::LinkLost(format!("read task failed: {e}")))?
    }
}

/// Scripted link for unit tests: canned replies, optional write failure.
#[derive(Debug, Default)]
pub struct MockLink {
    /// Bytes written by the code under test, in order.
    pub written: Vec<Vec<u8>>,
    replies: VecDeque<Vec<u8>>,
    pending: VecDeque<u8>,
    /// When set, `write` reports zero bytes accepted.
    pub fail_writes: bool,
    /// When set, writes start failing once this many have succeeded.
    pub fail_after: Option<usize>,
    open: bool,
}

impl MockLink {
    /// Empty mock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply delivered on the read following the next write.
    pub fn push_reply(&mut self, bytes: &[u8]) {
        self.replies.push_back(bytes.to_vec());
    }
}

#[async_trait]
impl Link for MockLink {
    fn name(&self) -> String {
        "mock".to_string()
    }

    async fn open(&mut self) -> MotionResult<()> {
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) -> MotionResult<()> {
        self.open = false;
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> MotionResult<usize> {
        if !self.open {
            return Err(MotionError::PortNotConnected);
        }
        if self.fail_writes || self.fail_after.is_some_and(|n| self.written.len() >= n) {
            return Ok(0);
        }
        self.written.push(bytes.to_vec());
        if let Some(reply) = self.replies.pop_front() {
            self.pending.extend(reply);
        }
        Ok(bytes.len())
    }

    async fn read(&mut self, _timeout: Duration) -> MotionResult<Vec<u8>> {
        if !self.open {
            return Err(MotionError::PortNotConnected);
        }
        let drained: Vec<u8> = self.pending.drain(..).collect();
        Ok(drained)
    }
}

/// Link into the in-process device simulation.
///
/// Every read advances simulated time until the device produces output or
/// the (simulated) timeout elapses, so host and device march in lockstep
/// without real sleeps.
pub struct SimLink {
    device: Arc<Mutex<Device<MemNvm>>>,
    open: bool,
}

impl SimLink {
    /// Wrap a shared simulated device.
    pub fn new(device: Arc<Mutex<Device<MemNvm>>>) -> Self {
        Self {
            device,
            open: false,
        }
    }

    /// The shared device, e.g. for a test to run playback forward.
    pub fn device(&self) -> Arc<Mutex<Device<MemNvm>>> {
        Arc::clone(&self.device)
    }

    fn lock(&self) -> MotionResult<std::sync::MutexGuard<'_, Device<MemNvm>>> {
        self.device
            .lock()
            .map_err(|_| MotionError::LinkLost("simulated device poisoned".to_string()))
    }
}

#[async_trait]
impl Link for SimLink {
    fn name(&self) -> String {
        "sim".to_string()
    }

    async fn open(&mut self) -> MotionResult<()> {
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) -> MotionResult<()> {
        self.open = false;
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> MotionResult<usize> {
        if !self.open {
            return Err(MotionError::PortNotConnected);
        }
        let mut device = self.lock()?;
        device.feed(bytes);
        device.step();
        Ok(bytes.len())
    }

    async fn read(&mut self, timeout: Duration) -> MotionResult<Vec<u8>> {
        if !self.open {
            return Err(MotionError::PortNotConnected);
        }
        let budget = (timeout.as_millis() as u64).max(1);
        let mut device = self.lock()?;
        for _ in 0..budget {
            device.step();
            let out = device.drain_output();
            if !out.is_empty() {
                return Ok(out);
            }
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::bus::SimBus;

    #[test]
    fn test_port_cycler_wraps() {
        let mut cycler = PortCycler::new(vec!["a".into(), "b".into(), "c".into()]);
        let seq: Vec<String> = (0..5).filter_map(|_| cycler.next_port()).collect();
        assert_eq!(seq, vec!["a", "b", "c", "a", "b"]);
        assert!(PortCycler::new(Vec::new()).next_port().is_none());
    }

    #[tokio::test]
    async fn test_mock_link_scripting() {
        let mut link = MockLink::new();
        link.push_reply(b"1ZP+0\r");
        link.open().await.unwrap();

        link.write(b"#1ZP\r").await.unwrap();
        let reply = link.read(Duration::from_millis(10)).await.unwrap();
        assert_eq!(reply, b"1ZP+0\r".to_vec());
        assert_eq!(link.written, vec![b"#1ZP\r".to_vec()]);
    }

    #[tokio::test]
    async fn test_mock_link_write_failure() {
        let mut link = MockLink::new();
        link.fail_writes = true;
        link.open().await.unwrap();
        assert_eq!(link.write(b"#1ZP\r").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sim_link_ping() {
        let device = Arc::new(Mutex::new(Device::new(MemNvm::new(), SimBus::new(1, &[0]))));
        let mut link = SimLink::new(device);
        link.open().await.unwrap();
        link.write(b"#1ZP\r").await.unwrap();
        let reply = link.read(Duration::from_millis(50)).await.unwrap();
        assert_eq!(reply, b"1ZP+0\r".to_vec());
    }
}
