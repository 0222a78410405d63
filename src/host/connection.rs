//! Host connection state machine.
//!
//! Walks the link from a closed port to extended-mode playback:
//!
//! ```text
//! PortClosed → PortOpen → RobotConfirmed → (Resetting → Initialising)
//!     → InitialisedStiff → ExtendedMode → Playing
//! ```
//!
//! Ports are probed in ascending order with `#1ZP`; fifteen unanswered
//! probes cycle to the next port. An arm whose axes all report state 2
//! skips initialisation. Any transport-fatal error (zero-byte write, ten
//! consecutive timeouts) drops every derived state and returns to
//! `PortClosed`, after which [`Connection::connect`] starts the port cycle
//! again.
//!
//! The connection owns the transport exclusively; callers go through the
//! message channel in [`crate::host::messages`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{info, warn};

use super::link::{Link, PortCycler};
use super::transport::Transport;
use super::uploader::{self, UploadAction};
use crate::config::Settings;
use crate::error::{MotionError, MotionResult};
use crate::keyframe::player::{KeyframePlayer, PlayerSample, STEP_PERIOD};
use crate::keyframe::timeline::Timeline;
use crate::protocol::wire::{Feedback, Motion, OutputCommand, FLAG_LOOP};
use crate::protocol::{Command, NUM_AXES};
use crate::transform::JointTransform;

/// Probes per port before cycling to the next one.
const PROBE_ATTEMPTS: usize = 15;

/// Poll budget for an axis to reach state 2 during initialisation.
const INIT_POLLS: usize = 120;

/// Global deadline for a compliance transition.
const COMPLIANCE_TIMEOUT: Duration = Duration::from_secs(2);

/// Host-side link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No port open.
    PortClosed,
    /// Port open, robot not yet seen.
    PortOpen,
    /// `#1ZP` answered: an arm is on the bus.
    RobotConfirmed,
    /// Axes being reset to state 0.
    Resetting,
    /// Axes running their zero search.
    Initialising,
    /// All axes in position control at full current.
    InitialisedStiff,
    /// All axes at zero current, back-drivable by hand.
    InitialisedCompliant,
    /// Extended protocol established with the microcontroller.
    ExtendedMode,
    /// A sequence is playing (device- or host-driven).
    Playing,
}

/// Creates a fresh link for a named port.
pub type LinkFactory = Box<dyn Fn(&str) -> Box<dyn Link> + Send>;

/// The host connection: transport owner and state machine.
pub struct Connection {
    settings: Settings,
    factory: LinkFactory,
    cycler: PortCycler,
    transport: Option<Transport>,
    state: LinkState,
    compliant: bool,
    host_playing: bool,
    observed: BTreeMap<String, f64>,
}

impl Connection {
    /// New connection cycling over `ports`.
    pub fn new(settings: Settings, factory: LinkFactory, ports: Vec<String>) -> Self {
        Self {
            settings,
            factory,
            cycler: PortCycler::new(ports),
            transport: None,
            state: LinkState::PortClosed,
            compliant: false,
            host_playing: false,
            observed: BTreeMap::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Whether the arm is in hardware compliance.
    pub fn is_compliant(&self) -> bool {
        self.compliant
    }

    /// Last observed joint angles, radians by joint name.
    pub fn observed(&self) -> &BTreeMap<String, f64> {
        &self.observed
    }

    /// Tear down the link and every derived state.
    pub async fn disconnect(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            let _ = transport.close().await;
        }
        self.state = LinkState::PortClosed;
        self.compliant = false;
        self.host_playing = false;
        self.observed.clear();
        info!("disconnected, port closed");
    }

    /// Fatal-error filter: transport-fatal failures force a disconnect.
    async fn guard<T>(&mut self, result: MotionResult<T>) -> MotionResult<T> {
        if matches!(result, Err(MotionError::LinkLost(_))) {
            self.disconnect().await;
        }
        result
    }

    fn transport(&mut self) -> MotionResult<&mut Transport> {
        self.transport
            .as_mut()
            .ok_or(MotionError::PortNotConnected)
    }

    /// Cycle ports until an arm answers a `#1ZP` probe.
    pub async fn connect(&mut self) -> MotionResult<()> {
        if self.state != LinkState::PortClosed {
            return Ok(());
        }

        for _ in 0..super::link::PORT_CYCLE {
            let Some(port) = self.cycler.next_port() else {
                break;
            };
            let mut transport = Transport::new((self.factory)(&port));
            if transport.open().await.is_err() {
                continue;
            }
            self.state = LinkState::PortOpen;

            let mut confirmed = false;
            for _ in 0..PROBE_ATTEMPTS {
                match transport.ascii_query(1, "ZP", None).await {
                    Ok(Some(reply))
                        if reply.id == 1 && reply.register == "ZP" && reply.value.is_some() =>
                    {
                        confirmed = true;
                        break;
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }

            if confirmed {
                info!("ROBOT connected on {port}");
                self.transport = Some(transport);
                self.state = LinkState::RobotConfirmed;
                if self.all_axes_in_position_control().await? {
                    info!("axes already initialised, skipping zero search");
                    self.state = LinkState::InitialisedStiff;
                }
                return Ok(());
            }

            let _ = transport.close().await;
            self.state = LinkState::PortClosed;
        }

        Err(MotionError::Timeout("robot detection".to_string()))
    }

    async fn all_axes_in_position_control(&mut self) -> MotionResult<bool> {
        let addresses: Vec<u8> = self.settings.joints.iter().map(|j| j.address).collect();
        let transport = self.transport()?;
        for address in addresses {
            match transport.ascii_query(address, "ZP", None).await? {
                Some(reply) if reply.value == Some(2) => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Run the zero-search initialisation on every axis.
    pub async fn initialise(&mut self) -> MotionResult<()> {
        if self.state == LinkState::InitialisedStiff {
            return Ok(());
        }
        if self.state != LinkState::RobotConfirmed {
            return Err(MotionError::InvalidState(format!("{:?}", self.state)));
        }

        let result = self.initialise_inner().await;
        match &result {
            Ok(()) => self.state = LinkState::InitialisedStiff,
            Err(err) => {
                warn!("initialisation failed: {err}");
                if self.state != LinkState::PortClosed {
                    self.state = LinkState::RobotConfirmed;
                }
            }
        }
        self.guard(result).await
    }

    async fn initialise_inner(&mut self) -> MotionResult<()> {
        let addresses: Vec<u8> = self.settings.joints.iter().map(|j| j.address).collect();

        self.state = LinkState::Resetting;
        for &address in &addresses {
            let reply = self.transport()?.ascii_query(address, "P", Some(0)).await?;
            match reply {
                Some(reply) if reply.register == "P" && reply.value == Some(0) => {}
                other => {
                    return Err(MotionError::InitFailed(format!(
                        "axis {address} did not acknowledge reset, got {other:?}"
                    )));
                }
            }
        }

        self.state = LinkState::Initialising;
        for &address in &addresses {
            let transport = self.transport()?;
            transport.ascii_query(address, "(JA", None).await?;
            transport.ascii_query(address, "P", Some(1)).await?;

            let mut reached = false;
            for _ in 0..INIT_POLLS {
                let transport = self.transport()?;
                if let Some(reply) = transport.ascii_query(address, "ZP", None).await? {
                    if reply.value == Some(2) {
                        reached = true;
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            if !reached {
                return Err(MotionError::InitFailed(format!(
                    "axis {address} never reached position control"
                )));
            }
            info!("axis {address} initialised");
        }
        Ok(())
    }

    /// Switch the microcontroller into the framed protocol.
    pub async fn enter_extended(&mut self) -> MotionResult<()> {
        if self.state == LinkState::ExtendedMode {
            return Ok(());
        }
        if !matches!(
            self.state,
            LinkState::InitialisedStiff | LinkState::InitialisedCompliant
        ) {
            return Err(MotionError::InvalidState(format!("{:?}", self.state)));
        }
        let result = async {
            self.transport()?.request(Command::Init, &[]).await?;
            Ok(())
        }
        .await;
        if result.is_ok() {
            self.state = LinkState::ExtendedMode;
            info!("extended mode established");
        }
        self.guard(result).await
    }

    /// Leave the framed protocol, back to passthrough.
    pub async fn leave_extended(&mut self) -> MotionResult<()> {
        if self.state != LinkState::ExtendedMode {
            return Ok(());
        }
        let result = async {
            self.transport()?.request(Command::Exit, &[]).await?;
            Ok(())
        }
        .await;
        if result.is_ok() {
            self.state = if self.compliant {
                LinkState::InitialisedCompliant
            } else {
                LinkState::InitialisedStiff
            };
        }
        self.guard(result).await
    }

    /// Upload a timeline; `Play`/`Loop` actions leave the device playing.
    pub async fn upload(
        &mut self,
        timeline: &Timeline,
        action: UploadAction,
    ) -> MotionResult<()> {
        if self.state != LinkState::ExtendedMode {
            return Err(MotionError::InvalidState(format!("{:?}", self.state)));
        }
        let settings = self.settings.clone();
        let result = match self.transport() {
            Ok(transport) => uploader::upload(transport, &settings, timeline, action).await,
            Err(err) => Err(err),
        };
        if result.is_ok() && matches!(action, UploadAction::Play | UploadAction::Loop) {
            self.state = LinkState::Playing;
        }
        self.guard(result).await
    }

    /// Start remote playback of the committed sequence.
    pub async fn play(&mut self, looped: bool) -> MotionResult<()> {
        if self.state != LinkState::ExtendedMode {
            return Err(MotionError::InvalidState(format!("{:?}", self.state)));
        }
        let flags = if looped { FLAG_LOOP } else { 0 };
        let result = async {
            self.transport()?.request(Command::Play, &[flags]).await?;
            Ok(())
        }
        .await;
        if result.is_ok() {
            self.state = LinkState::Playing;
        }
        self.guard(result).await
    }

    /// Abort playback (device-driven or host-driven).
    pub async fn stop(&mut self) -> MotionResult<()> {
        if self.state != LinkState::Playing {
            return Ok(());
        }
        let result = async {
            self.transport()?.request(Command::Stop, &[]).await?;
            Ok(())
        }
        .await;
        if result.is_ok() {
            self.state = LinkState::ExtendedMode;
            self.host_playing = false;
        }
        self.guard(result).await
    }

    /// Query device feedback, updating observed joint angles. Clears the
    /// `Playing` state once the device reports the sequence finished.
    pub async fn poll_feedback(&mut self) -> MotionResult<Feedback> {
        if !matches!(self.state, LinkState::ExtendedMode | LinkState::Playing) {
            return Err(MotionError::InvalidState(format!("{:?}", self.state)));
        }
        let result = async {
            let packet = self.transport()?.request(Command::Feedback, &[]).await?;
            Feedback::decode(&packet.payload)
        }
        .await;
        let result = self.guard(result).await;

        if let Ok(feedback) = &result {
            self.apply_feedback(feedback);
            if self.state == LinkState::Playing && !self.host_playing && !feedback.is_playing() {
                info!("device playback finished");
                self.state = LinkState::ExtendedMode;
            }
        }
        result
    }

    fn apply_feedback(&mut self, feedback: &Feedback) {
        for joint in &self.settings.joints {
            let slot = joint.address as usize - 1;
            if slot >= usize::from(feedback.num_axes) || slot >= NUM_AXES {
                continue;
            }
            let transform = JointTransform::new(joint);
            let last = self.observed.get(&joint.name).copied().unwrap_or(0.0);
            let angle = transform.feedback_angle(feedback.positions[slot], last);
            self.observed.insert(joint.name.clone(), angle);
        }
    }

    /// Toggle hardware compliance.
    ///
    /// Aborts any pending motion by commanding the currently observed
    /// position first, leaves extended mode, writes the current registers
    /// of every axis under one global deadline, and re-enters extended
    /// mode.
    pub async fn set_compliance(&mut self, on: bool) -> MotionResult<()> {
        if self.state != LinkState::ExtendedMode {
            return Err(MotionError::InvalidState(format!("{:?}", self.state)));
        }
        if self.compliant == on {
            return Ok(());
        }

        // Freeze the arm where it stands before touching currents.
        let feedback = self.poll_feedback().await?;
        let hold = self.hold_motion(&feedback);
        let result = async {
            self.transport()?
                .request(Command::Motion, &hold.encode())
                .await?;
            Ok(())
        }
        .await;
        self.guard(result).await?;

        self.leave_extended().await?;

        let deadline = tokio::time::Instant::now() + COMPLIANCE_TIMEOUT;
        let result = self.write_currents(on, deadline).await;
        let result = self.guard(result).await;
        match result {
            Ok(()) => {
                self.compliant = on;
                self.state = if on {
                    LinkState::InitialisedCompliant
                } else {
                    LinkState::InitialisedStiff
                };
                info!(
                    "arm is now {}",
                    if on { "compliant" } else { "stiff" }
                );
            }
            Err(err) => {
                warn!("compliance transition failed: {err}");
                if self.state != LinkState::PortClosed {
                    self.enter_extended().await?;
                }
                return Err(err);
            }
        }

        self.enter_extended().await
    }

    fn hold_motion(&self, feedback: &Feedback) -> Motion {
        let mut motion = Motion {
            ticks: [crate::protocol::POSITION_BIAS; NUM_AXES],
            velocity: [100; NUM_AXES],
            num_axes: feedback.num_axes,
            output: OutputCommand::Nop,
        };
        for joint in &self.settings.joints {
            let slot = joint.address as usize - 1;
            if slot >= NUM_AXES {
                continue;
            }
            let position = feedback.positions[slot];
            if position != crate::protocol::NO_READING {
                let biased = i32::from(position) + i32::from(crate::protocol::POSITION_BIAS);
                motion.ticks[slot] = biased.clamp(0, 2 * i32::from(crate::protocol::POSITION_BIAS)) as u16;
            }
        }
        motion
    }

    async fn write_currents(
        &mut self,
        compliant: bool,
        deadline: tokio::time::Instant,
    ) -> MotionResult<()> {
        let joints: Vec<(u8, u16, u16)> = self
            .settings
            .joints
            .iter()
            .map(|j| (j.address, j.hold_current, j.max_current))
            .collect();

        for (address, hold_current, max_current) in joints {
            if tokio::time::Instant::now() >= deadline {
                return Err(MotionError::Timeout("compliance transition".to_string()));
            }
            let (hold, run) = if compliant {
                (0, 0)
            } else {
                (hold_current, max_current)
            };
            let transport = self.transport()?;
            transport
                .ascii_query(address, "r", Some(i32::from(hold)))
                .await?;
            transport
                .ascii_query(address, "i", Some(i32::from(run)))
                .await?;
        }
        Ok(())
    }

    /// Drive playback from the host at 50 Hz, adapting velocities to the
    /// feedback that comes back with every motion command. `cancel` is
    /// checked every iteration.
    pub async fn play_realtime(
        &mut self,
        timeline: Timeline,
        interpolating: bool,
        cancel: &AtomicBool,
    ) -> MotionResult<()> {
        if self.state != LinkState::ExtendedMode {
            return Err(MotionError::InvalidState(format!("{:?}", self.state)));
        }
        // Exactly one of host player and device sequencer may run.
        let feedback = self.poll_feedback().await?;
        if feedback.is_playing() {
            return Err(MotionError::InvalidState(
                "device sequencer is playing".to_string(),
            ));
        }

        self.state = LinkState::Playing;
        self.host_playing = true;
        let mut player = KeyframePlayer::new(timeline, interpolating);
        let mut interval = tokio::time::interval(STEP_PERIOD);
        let mut last = tokio::time::Instant::now();

        let result = loop {
            interval.tick().await;
            if cancel.load(Ordering::Relaxed) {
                break Ok(());
            }
            let now = tokio::time::Instant::now();
            let dt = (now - last).as_secs_f64();
            last = now;

            let sample = player.step(dt);
            let motion = self.motion_from_sample(&sample);
            let reply = match self.transport() {
                Ok(transport) => transport.request(Command::Motion, &motion.encode()).await,
                Err(err) => Err(err),
            };
            match reply {
                Ok(packet) => {
                    if let Ok(feedback) = Feedback::decode(&packet.payload) {
                        self.apply_feedback(&feedback);
                        for (name, angle) in self.observed.clone() {
                            player.observe(&name, angle);
                        }
                    }
                }
                Err(err) => break Err(err),
            }
            if sample.finished {
                break Ok(());
            }
        };

        self.host_playing = false;
        if self.state == LinkState::Playing {
            self.state = LinkState::ExtendedMode;
        }
        self.guard(result).await
    }

    /// Build a motion command from a player sample, clamping every angle to
    /// its joint limits and every velocity to the servo range.
    fn motion_from_sample(&self, sample: &PlayerSample) -> Motion {
        let mut motion = Motion {
            ticks: [crate::protocol::POSITION_BIAS; NUM_AXES],
            velocity: [0; NUM_AXES],
            num_axes: self.settings.active_axes() as u8,
            output: sample.output.to_wire(),
        };
        for joint in &self.settings.joints {
            let slot = joint.address as usize - 1;
            let Some(command) = sample.joints.get(&joint.name) else {
                continue;
            };
            let transform = JointTransform::new(joint);
            motion.ticks[slot] = transform.angle_to_tick(command.angle);

            let ratio = i64::from(crate::transform::enc_to_mot_ratio(
                joint.enc_to_rad(),
                joint.mot_to_rad(),
            ));
            let ticks_per_s = (command.velocity.abs() / joint.enc_to_rad()) as i64;
            let device_velocity = (ticks_per_s * ratio / 256).clamp(0, ratio * 7000 / 256);
            motion.velocity[slot] = device_velocity as u16;
        }
        motion
    }
}
