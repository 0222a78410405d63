//! RS-485 joint bus driver.
//!
//! The arm microcontroller talks to every motor controller over one shared
//! half-duplex RS-485 pair using the ASCII register protocol from
//! [`crate::protocol::ascii`]. The physical driver switches bus direction
//! around every transmission with a ≥200 µs settle; the trait below models
//! one complete transaction (command out, reply or timeout back) so the
//! sequencer and dispatcher stay independent of the wire.
//!
//! A missing reply (timeout) is reported separately from a garbled one;
//! the sequencer falls back to its nominal velocity when an encoder read
//! times out but treats repeated malformed traffic the same way.

use thiserror::Error;

use super::tendon::TendonController;
use crate::protocol::ascii::{self, Reply};

/// Bus transaction failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusError {
    /// No reply within the driver's timeout window.
    #[error("no reply from joint controller")]
    Timeout,
    /// A reply arrived but did not parse as a register echo.
    #[error("malformed reply from joint controller")]
    Malformed,
}

/// One request/reply transaction on the joint bus.
pub trait JointBus: Send {
    /// Send `#<id><register><value?>\r` and collect the echo.
    fn transact(&mut self, id: u8, register: &str, value: Option<i32>)
        -> Result<Reply, BusError>;
}

/// Typed register accessors shared by the sequencer and the host-side
/// initialisation path.
pub trait JointBusExt: JointBus {
    /// `ZP` ping; the reply value is the controller state.
    fn ping(&mut self, id: u8) -> Result<i16, BusError> {
        self.transact(id, "ZP", None)?.value.ok_or(BusError::Malformed)
    }

    /// Write the pause register (`P<state>`).
    fn set_state(&mut self, id: u8, state: i16) -> Result<(), BusError> {
        self.transact(id, "P", Some(i32::from(state))).map(|_| ())
    }

    /// Start the on-controller tendon program (`(JA`).
    fn start_program(&mut self, id: u8) -> Result<(), BusError> {
        self.transact(id, "(JA", None).map(|_| ())
    }

    /// Write the destination register (`n`), biased tick-space.
    fn set_destination(&mut self, id: u8, ticks: u16) -> Result<(), BusError> {
        self.transact(id, "n", Some(i32::from(ticks))).map(|_| ())
    }

    /// Write the velocity register (`o`).
    fn set_velocity(&mut self, id: u8, velocity: u16) -> Result<(), BusError> {
        self.transact(id, "o", Some(i32::from(velocity))).map(|_| ())
    }

    /// Write the hold current register (`r`).
    fn set_hold_current(&mut self, id: u8, current: u16) -> Result<(), BusError> {
        self.transact(id, "r", Some(i32::from(current))).map(|_| ())
    }

    /// Write the run current cap register (`i`).
    fn set_run_current(&mut self, id: u8, current: u16) -> Result<(), BusError> {
        self.transact(id, "i", Some(i32::from(current))).map(|_| ())
    }

    /// Read the encoder position (`I`).
    fn read_encoder(&mut self, id: u8) -> Result<i16, BusError> {
        self.transact(id, "I", None)?.value.ok_or(BusError::Malformed)
    }

    /// Read the command (demand) position (`s`).
    fn read_command_position(&mut self, id: u8) -> Result<i16, BusError> {
        self.transact(id, "s", None)?.value.ok_or(BusError::Malformed)
    }
}

impl<T: JointBus + ?Sized> JointBusExt for T {}

/// Software joint bus: a chain of simulated tendon controllers.
///
/// Doubles as the ASCII endpoint for passthrough mode, so the host's legacy
/// byte stream reaches the same controllers the sequencer drives.
pub struct SimBus {
    joints: Vec<TendonController>,
    line: Vec<u8>,
}

impl SimBus {
    /// Create a bus of `count` joints with their Hall magnets at the given
    /// encoder offsets (cycled when `count` exceeds the offsets given).
    pub fn new(count: usize, zero_offsets: &[i64]) -> Self {
        let joints = (0..count)
            .map(|i| {
                let zero = zero_offsets
                    .get(i % zero_offsets.len().max(1))
                    .copied()
                    .unwrap_or(0);
                TendonController::new(zero)
            })
            .collect();
        Self {
            joints,
            line: Vec::new(),
        }
    }

    /// A bus whose joints are already zeroed and in position control, the
    /// state a host-initialised arm is in when playback starts.
    pub fn initialised(count: usize) -> Self {
        let mut bus = Self::new(count, &[0]);
        for joint in &mut bus.joints {
            joint.start_program();
            joint.request_mode(2);
        }
        bus
    }

    /// Number of joints on the bus.
    pub fn len(&self) -> usize {
        self.joints.len()
    }

    /// True when the bus carries no joints.
    pub fn is_empty(&self) -> bool {
        self.joints.is_empty()
    }

    /// Access a controller by 1-based bus address.
    pub fn joint(&self, id: u8) -> Option<&TendonController> {
        (id >= 1).then(|| self.joints.get(id as usize - 1)).flatten()
    }

    /// Mutable access by 1-based bus address.
    pub fn joint_mut(&mut self, id: u8) -> Option<&mut TendonController> {
        (id >= 1).then(|| self.joints.get_mut(id as usize - 1)).flatten()
    }

    /// Advance every controller by one millisecond.
    pub fn step(&mut self) {
        for joint in &mut self.joints {
            joint.step();
        }
    }

    /// Feed one raw passthrough byte. A completed `\r`-terminated command
    /// is executed and its echo returned.
    pub fn ascii_input(&mut self, byte: u8) -> Option<Vec<u8>> {
        if byte != b'\r' {
            // Bound runaway lines from a confused host.
            if self.line.len() < 64 {
                self.line.push(byte);
            }
            return None;
        }
        let line = String::from_utf8_lossy(&self.line).to_string();
        self.line.clear();

        let rest = line.strip_prefix('#')?;
        let split = rest.find(|c: char| !c.is_ascii_digit())?;
        let id: u8 = rest[..split].parse().ok()?;
        let tail = &rest[split..];
        let value_at = tail
            .find(|c: char| c.is_ascii_digit() || c == '+' || c == '-')
            .unwrap_or(tail.len());
        let register = &tail[..value_at];
        let value: Option<i32> = tail[value_at..].parse().ok();

        let reply = self.execute(id, register, value).ok()?;
        let value_text = reply
            .value
            .map(|v| {
                if v >= 0 {
                    format!("+{v}")
                } else {
                    v.to_string()
                }
            })
            .unwrap_or_default();
        Some(format!("{}{}{}\r", reply.id, reply.register, value_text).into_bytes())
    }

    fn execute(&mut self, id: u8, register: &str, value: Option<i32>) -> Result<Reply, BusError> {
        let joint = self.joint_mut(id).ok_or(BusError::Timeout)?;
        let reply_value: Option<i16> = match (register, value) {
            ("ZP", None) => Some(joint.mode().as_i16()),
            ("P", None) => Some(joint.mode().as_i16()),
            ("P", Some(state)) => {
                let state = state.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
                joint.request_mode(state);
                Some(state)
            }
            ("(JA", _) => {
                joint.start_program();
                None
            }
            ("I", None) => Some(joint.encoder()),
            ("s", None) => Some(joint.command_position()),
            ("n", Some(dest)) => {
                joint.set_destination(i64::from(dest));
                Some(dest.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16)
            }
            ("o", Some(vel)) => {
                joint.set_speed(i64::from(vel));
                Some(vel.clamp(0, i32::from(i16::MAX)) as i16)
            }
            ("r", Some(current)) => {
                joint.motor.hold_current = current.clamp(0, i32::from(u16::MAX)) as u16;
                Some(current.clamp(0, i32::from(i16::MAX)) as i16)
            }
            ("i", Some(current)) => {
                joint.motor.run_current = current.clamp(0, i32::from(u16::MAX)) as u16;
                Some(current.clamp(0, i32::from(i16::MAX)) as i16)
            }
            _ => return Err(BusError::Malformed),
        };
        Ok(Reply {
            id,
            register: register.to_string(),
            value: reply_value,
        })
    }
}

impl JointBus for SimBus {
    fn transact(
        &mut self,
        id: u8,
        register: &str,
        value: Option<i32>,
    ) -> Result<Reply, BusError> {
        // Exercise the same grammar real traffic uses.
        let _ = ascii::command(id, register, value);
        self.execute(id, register, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_reports_state() {
        let mut bus = SimBus::new(2, &[0]);
        assert_eq!(bus.ping(1), Ok(0));
        assert_eq!(bus.ping(2), Ok(0));
        assert_eq!(bus.ping(3), Err(BusError::Timeout));
    }

    #[test]
    fn test_destination_and_velocity_reach_controller() {
        let mut bus = SimBus::new(1, &[0]);
        bus.set_destination(1, 17_000).unwrap();
        bus.set_velocity(1, 250).unwrap();
        let joint = bus.joint(1).unwrap();
        assert_eq!(joint.motor.velocity, 250);
    }

    #[test]
    fn test_ascii_passthrough_ping() {
        let mut bus = SimBus::new(1, &[0]);
        let mut reply = None;
        for &b in b"#1ZP\r" {
            reply = bus.ascii_input(b);
        }
        assert_eq!(reply.unwrap(), b"1ZP+0\r".to_vec());
    }

    #[test]
    fn test_ascii_state_write_and_start() {
        let mut bus = SimBus::new(1, &[150]);
        for &b in b"#1(JA\r" {
            bus.ascii_input(b);
        }
        let mut reply = None;
        for &b in b"#1P1\r" {
            reply = bus.ascii_input(b);
        }
        assert_eq!(reply.unwrap(), b"1P+1\r".to_vec());

        for _ in 0..30_000 {
            bus.step();
        }
        assert_eq!(bus.ping(1), Ok(2), "joint should finish zero search");
    }

    #[test]
    fn test_ascii_unknown_address_silent() {
        let mut bus = SimBus::new(1, &[0]);
        let mut reply = None;
        for &b in b"#9ZP\r" {
            reply = bus.ascii_input(b);
        }
        assert!(reply.is_none(), "unknown address must look like a timeout");
    }
}
