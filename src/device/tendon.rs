//! Per-joint tendon controller program.
//!
//! Each joint's motor controller runs this finite state machine. The
//! controller hardware closes an absolute position loop on the motor, but
//! the joint itself hangs on a compliant tendon, so the encoder (on the
//! joint) and the commanded motor position drift apart. The program's job
//! is to keep the motor leading the encoder by just enough to land the
//! joint on target without oscillating.
//!
//! The host requests states through a single pause register:
//!
//! | value | state |
//! |-------|-------|
//! | 0 | uninitialised |
//! | 1 | find centre (Hall-sensor zero search) |
//! | 2 | position control |
//! | 3 | compliance (cable-tension integrator) |
//! | 4 | passive |
//! | other | halted |
//!
//! [`MotorModel`] stands in for the controller hardware and the mechanics:
//! the motor tracks its demand at the commanded velocity and the joint
//! follows it through the tendon. The model keeps the coupling first-order,
//! so a parked joint hunts within a small bounded band around its target
//! where the real tendon's friction would hold it dead still; control
//! arithmetic and all timings are unaffected.

use crate::protocol::POSITION_BIAS;

/// Analog threshold above which the Hall sensor reads "over the magnet".
pub const HALL_THRESHOLD: i32 = 580;

/// log2 of the encoder-to-motor tick ratio.
pub const ENCODER_SHIFT: u32 = 1;

/// Sweep widening per reversal during zero-finding, motor ticks.
const SWEEP_WIDENING: i64 = 200;

/// Initial sweep half-width, motor ticks.
const SWEEP_START: i64 = 200;

/// Controller state as reported through the pause register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    /// Powered up, not yet zeroed.
    Uninitialised,
    /// Hall-sensor zero search in progress.
    Searching,
    /// Closed-loop position control.
    Position,
    /// Cable-tension compliance (back-drivable).
    Compliance,
    /// Motor released, no drive.
    Passive,
    /// Any unknown pause value halts the controller.
    Halted,
}

impl ControlMode {
    /// Numeric form reported in `ZP` / `P` replies.
    pub fn as_i16(self) -> i16 {
        match self {
            ControlMode::Uninitialised => 0,
            ControlMode::Searching => 1,
            ControlMode::Position => 2,
            ControlMode::Compliance => 3,
            ControlMode::Passive => 4,
            ControlMode::Halted => -1,
        }
    }

    /// Map a pause-register write to a state.
    pub fn from_request(value: i16) -> Self {
        match value {
            0 => ControlMode::Uninitialised,
            1 => ControlMode::Searching,
            2 => ControlMode::Position,
            3 => ControlMode::Compliance,
            4 => ControlMode::Passive,
            _ => ControlMode::Halted,
        }
    }
}

/// Simulated motor controller hardware plus joint mechanics.
///
/// Positions are integer ticks: motor ticks for `motor`/`demand`, encoder
/// ticks for `encoder` (twice the motor scale, see [`ENCODER_SHIFT`]).
#[derive(Debug)]
pub struct MotorModel {
    /// Commanded motor position (the hardware position loop's setpoint).
    pub demand: i64,
    /// Actual motor position.
    pub motor: i64,
    /// Encoder position on the joint side of the tendon.
    pub encoder: i64,
    /// Commanded velocity, motor ticks per second.
    pub velocity: u16,
    /// Run current cap.
    pub run_current: u16,
    /// Hold current.
    pub hold_current: u16,
    /// Encoder position of the mechanical zero (Hall magnet centre).
    pub zero_pos: i64,
    /// First-order divisor for the tendon coupling; 1 is a rigid link.
    pub tendon_lag: i64,
    velocity_residue: i64,
}

impl MotorModel {
    /// New model with the Hall magnet at `zero_pos` encoder ticks.
    pub fn new(zero_pos: i64) -> Self {
        Self {
            demand: 0,
            motor: 0,
            encoder: 0,
            velocity: 0,
            run_current: 80,
            hold_current: 20,
            zero_pos,
            tendon_lag: 1,
            velocity_residue: 0,
        }
    }

    /// Advance the hardware model by one millisecond.
    pub fn step(&mut self) {
        if self.motor != self.demand && self.velocity > 0 {
            self.velocity_residue += i64::from(self.velocity);
            let mut steps = self.velocity_residue / 1000;
            self.velocity_residue %= 1000;
            let distance = (self.demand - self.motor).abs();
            steps = steps.min(distance);
            self.motor += steps * (self.demand - self.motor).signum();
        }

        let gap = (self.motor << ENCODER_SHIFT) - self.encoder;
        self.encoder += gap / self.tendon_lag;
    }

    /// Analog Hall reading: triangular response centred on `zero_pos`.
    pub fn hall(&self) -> i32 {
        let distance = (self.encoder - self.zero_pos).abs().min(1023) as i32;
        1023 - distance
    }

    fn reset_origin(&mut self) {
        self.motor = 0;
        self.encoder = 0;
        self.demand = 0;
        self.zero_pos = 0;
        self.velocity_residue = 0;
    }
}

#[derive(Debug)]
enum SearchPhase {
    /// Sweeping outward, reversing and widening until both Hall edges are seen.
    Sweep {
        dir: i64,
        span: i64,
        edge1: Option<i64>,
        edge2: Option<i64>,
        over_magnet: bool,
    },
    /// Driving to the computed middle.
    Centre { middle_motor: i64 },
}

/// The tendon controller program for one joint.
#[derive(Debug)]
pub struct TendonController {
    /// Hardware model this program drives.
    pub motor: MotorModel,
    mode: ControlMode,
    program_running: bool,
    /// Destination register (`n`), biased tick-space.
    dest: i64,
    /// Velocity register (`o`).
    speed: i64,
    holding: bool,
    last_sign: i64,
    cable_tension: i64,
    microstep_offset: u8,
    search: Option<SearchPhase>,
    last_encoder: i64,
    last_motor: i64,
}

impl TendonController {
    /// New controller in the uninitialised state.
    pub fn new(zero_pos: i64) -> Self {
        Self {
            motor: MotorModel::new(zero_pos),
            mode: ControlMode::Uninitialised,
            program_running: false,
            dest: i64::from(POSITION_BIAS),
            speed: 0,
            holding: false,
            last_sign: 1,
            cable_tension: 0,
            microstep_offset: 0,
            search: None,
            last_encoder: 0,
            last_motor: 0,
        }
    }

    /// Current state.
    pub fn mode(&self) -> ControlMode {
        self.mode
    }

    /// Low two bits of the motor position captured at zero, preserved so
    /// later absolute commands keep the microstep phase.
    pub fn microstep_offset(&self) -> u8 {
        self.microstep_offset
    }

    /// Start the on-controller program (`(JA` command).
    pub fn start_program(&mut self) {
        self.program_running = true;
    }

    /// Write the pause register.
    pub fn request_mode(&mut self, value: i16) {
        let mode = ControlMode::from_request(value);
        if mode == ControlMode::Searching && self.mode != ControlMode::Searching {
            // Search runs at reduced current.
            self.motor.run_current /= 2;
            self.search = Some(SearchPhase::Sweep {
                dir: 1,
                span: SWEEP_START,
                edge1: None,
                edge2: None,
                over_magnet: self.motor.hall() > HALL_THRESHOLD,
            });
        }
        self.mode = mode;
    }

    /// Write the destination register (`n`), biased tick-space.
    pub fn set_destination(&mut self, value: i64) {
        self.dest = value;
    }

    /// Read back the destination register, biased tick-space.
    pub fn destination(&self) -> i64 {
        self.dest
    }

    /// Write the velocity register (`o`).
    pub fn set_speed(&mut self, value: i64) {
        self.speed = value.max(0);
        self.motor.velocity = value.clamp(0, i64::from(u16::MAX)) as u16;
    }

    /// Read the command (demand) position register (`s`).
    pub fn command_position(&self) -> i16 {
        self.motor.demand.clamp(i64::from(i16::MIN), i64::from(i16::MAX)) as i16
    }

    /// Read the encoder register (`I`).
    pub fn encoder(&self) -> i16 {
        self.motor.encoder.clamp(i64::from(i16::MIN), i64::from(i16::MAX)) as i16
    }

    /// Advance the program and the hardware model by one millisecond.
    pub fn step(&mut self) {
        if self.program_running {
            match self.mode {
                ControlMode::Searching => self.step_search(),
                ControlMode::Position => self.step_position(),
                ControlMode::Compliance => self.step_compliance(),
                ControlMode::Uninitialised | ControlMode::Passive => {}
                ControlMode::Halted => self.motor.velocity = 0,
            }
        }
        self.motor.step();
        self.last_encoder = self.motor.encoder;
        self.last_motor = self.motor.motor;
    }

    /// Closed-loop position control: overshoot when far, single-step when
    /// close, latch once the joint has landed.
    fn step_position(&mut self) {
        let target = self.dest - i64::from(POSITION_BIAS);
        let delta = (target - self.motor.encoder) >> ENCODER_SHIFT;
        let delta_abs = delta.abs();
        let far_shift = u32::from((self.speed >> 5) < delta_abs);

        if self.holding {
            if delta_abs >= 3 {
                self.holding = false;
            } else {
                return;
            }
        }

        if delta_abs < 2 {
            // Park just past the demand so the tendon stays tensioned.
            self.motor.demand += 4 * self.last_sign;
            self.holding = true;
            return;
        }

        self.last_sign = delta.signum();
        let mut lead = delta << far_shift;
        if lead.abs() < 5 {
            lead = 5 * delta.signum();
        }
        self.motor.demand = self.motor.motor + lead;
    }

    fn step_search(&mut self) {
        let Some(phase) = self.search.as_mut() else {
            self.mode = ControlMode::Uninitialised;
            return;
        };
        match phase {
            SearchPhase::Sweep {
                dir,
                span,
                edge1,
                edge2,
                over_magnet,
            } => {
                let over = self.motor.hall() > HALL_THRESHOLD;
                if over != *over_magnet {
                    *over_magnet = over;
                    let position = self.motor.encoder;
                    match *edge1 {
                        None => *edge1 = Some(position),
                        // Re-crossing the same edge is not the far side.
                        Some(e1) if (position - e1).abs() > 100 && edge2.is_none() => {
                            *edge2 = Some(position);
                        }
                        _ => {}
                    }
                }

                if let (Some(e1), Some(e2)) = (*edge1, *edge2) {
                    // One shift halves to the midpoint, the other converts
                    // encoder scale to motor scale.
                    let middle_motor = (e1 + e2) >> 2;
                    self.search = Some(SearchPhase::Centre { middle_motor });
                    return;
                }

                let target = *dir * *span;
                self.motor.demand = target;
                self.motor.velocity = 400;
                if (self.motor.motor - target).abs() < 2 {
                    *dir = -*dir;
                    *span += SWEEP_WIDENING;
                }
            }
            SearchPhase::Centre { middle_motor } => {
                let middle = *middle_motor;
                let difference = (self.motor.encoder >> ENCODER_SHIFT) - middle;
                if difference.abs() <= 2 {
                    // Close enough that the origin reset absorbs the rest.
                    self.microstep_offset = (self.motor.motor & 3) as u8;
                    self.motor.reset_origin();
                    self.motor.run_current *= 2;
                    self.dest = i64::from(POSITION_BIAS);
                    self.search = None;
                    self.mode = ControlMode::Position;
                } else {
                    self.motor.demand = self.motor.motor - difference;
                    self.motor.velocity = 200;
                }
            }
        }
    }

    /// Cable-tension integrator letting an operator back-drive the joint.
    fn step_compliance(&mut self) {
        let encoder_motion = (self.motor.encoder - self.last_encoder) << 1;
        let motor_motion = self.motor.motor - self.last_motor;
        self.cable_tension += encoder_motion - motor_motion;
        let feed = self.cable_tension >> ENCODER_SHIFT;
        self.motor.demand += feed;
        self.cable_tension -= feed << ENCODER_SHIFT;
    }
}
