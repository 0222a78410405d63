//! Arm microcontroller core.
//!
//! A portable model of the on-arm firmware: the passthrough byte shoveller,
//! the INIT-pattern mode switch, the extended-protocol dispatcher, the
//! playback sequencer and the RS-485 joint bus, composed around a 1 kHz
//! main loop. The original firmware's blocking inner loops are expressed as
//! cooperative states advanced by [`Device::step`], one millisecond per
//! call, so a host (or a test) can interleave traffic at any point.
//!
//! Single-owner discipline mirrors the hardware: the sequencer owns the
//! in-RAM keyframe buffer, and the dispatcher mutates it only while the
//! sequencer is idle.

pub mod bus;
pub mod dispatcher;
pub mod nvm;
pub mod passthrough;
pub mod ring;
pub mod sequencer;
pub mod tendon;

use log::{debug, info};

use bus::SimBus;
use dispatcher::{handle_packet, DispatchAction};
use nvm::NonVolatile;
use passthrough::{InitMatcher, MatchResult};
use ring::RingBuffer;
use sequencer::{Sequencer, SoloSync};

use crate::protocol::frame::{encode, FrameDecoder};
use crate::protocol::Command;

/// Idle milliseconds in extended mode before falling back to passthrough.
const EXTENDED_IDLE_TIMEOUT_MS: u16 = 255;

/// Transport mode of the microcontroller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    /// Bytes shovelled verbatim between host and RS-485 bus.
    Passthrough,
    /// Framed packets terminated by this controller.
    Extended,
}

/// The simulated arm microcontroller.
pub struct Device<N: NonVolatile> {
    mode: DeviceMode,
    now: u64,
    rx: RingBuffer,
    tx: RingBuffer,
    matcher: InitMatcher,
    decoder: FrameDecoder,
    idle_ms: u16,
    sequencer: Sequencer,
    nvm: N,
    bus: SimBus,
    sync: SoloSync,
    output: bool,
    reboots: u32,
}

impl<N: NonVolatile> Device<N> {
    /// Boot the device: load the persisted sequence and start in
    /// passthrough mode.
    pub fn new(nvm: N, bus: SimBus) -> Self {
        let (config, frames) = nvm.load();
        let config = config.validated();
        info!(
            "device boot: {} axes, {} keyframes",
            config.active_axes, config.num_keyframes
        );
        Self {
            mode: DeviceMode::Passthrough,
            now: 0,
            rx: RingBuffer::new(),
            tx: RingBuffer::new(),
            matcher: InitMatcher::new(),
            decoder: FrameDecoder::new(),
            idle_ms: 0,
            sequencer: Sequencer::new(config, frames),
            nvm,
            bus,
            sync: SoloSync,
            output: false,
            reboots: 0,
        }
    }

    /// Current transport mode.
    pub fn mode(&self) -> DeviceMode {
        self.mode
    }

    /// Millisecond uptime.
    pub fn now(&self) -> u64 {
        self.now
    }

    /// State of the digital output.
    pub fn output(&self) -> bool {
        self.output
    }

    /// Times the reset key has rebooted the device.
    pub fn reboots(&self) -> u32 {
        self.reboots
    }

    /// The playback engine (tests and the simulator peek at it).
    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    /// The joint bus with its simulated controllers.
    pub fn bus(&self) -> &SimBus {
        &self.bus
    }

    /// Mutable joint bus access, e.g. to perturb a simulated joint.
    pub fn bus_mut(&mut self) -> &mut SimBus {
        &mut self.bus
    }

    /// The persisted store.
    pub fn nvm(&self) -> &N {
        &self.nvm
    }

    /// Queue host→device bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.rx.put_all(bytes);
    }

    /// Take device→host bytes.
    pub fn drain_output(&mut self) -> Vec<u8> {
        self.tx.drain()
    }

    /// Hardware start button: plays the committed sequence when idle.
    pub fn press_start(&mut self) {
        if !self.sequencer.is_playing() {
            debug!("start button pressed");
            self.sequencer.start(false, self.now, &mut self.bus);
        }
    }

    /// Advance the device by one millisecond.
    pub fn step(&mut self) {
        self.now += 1;

        let had_packet = self.pump_host_bytes();

        if self.mode == DeviceMode::Extended {
            if had_packet {
                self.idle_ms = 0;
            } else if !self.sequencer.is_playing() {
                self.idle_ms = self.idle_ms.saturating_add(1);
                if self.idle_ms >= EXTENDED_IDLE_TIMEOUT_MS {
                    debug!("extended mode idle timeout, back to passthrough");
                    self.mode = DeviceMode::Passthrough;
                    self.idle_ms = 0;
                }
            }
        }

        self.sequencer
            .step(self.now, &mut self.bus, &mut self.sync, &mut self.output);
        self.bus.step();
    }

    /// Run `ms` milliseconds.
    pub fn run(&mut self, ms: u64) {
        for _ in 0..ms {
            self.step();
        }
    }

    fn pump_host_bytes(&mut self) -> bool {
        let mut had_packet = false;
        while let Some(byte) = self.rx.get() {
            match self.mode {
                DeviceMode::Passthrough => match self.matcher.push(byte) {
                    MatchResult::Pending => {}
                    MatchResult::Forward(bytes) => {
                        for b in bytes {
                            if let Some(reply) = self.bus.ascii_input(b) {
                                self.tx.put_all(&reply);
                            }
                        }
                    }
                    MatchResult::Matched => {
                        info!("INIT detected, entering extended mode");
                        self.mode = DeviceMode::Extended;
                        self.decoder.reset();
                        self.idle_ms = 0;
                        had_packet = true;
                        self.tx.put_all(&encode(Command::Init, &[]));
                    }
                },
                DeviceMode::Extended => {
                    if let Some(packet) = self.decoder.push(byte) {
                        had_packet = true;
                        let (reply, action) = handle_packet(
                            &packet,
                            self.now,
                            &mut self.sequencer,
                            &mut self.nvm,
                            &mut self.bus,
                            &mut self.output,
                        );
                        self.tx.put_all(&reply);
                        match action {
                            DispatchAction::Continue => {}
                            DispatchAction::ExitExtended => {
                                self.mode = DeviceMode::Passthrough;
                            }
                            DispatchAction::Reboot => self.reboot(),
                        }
                    }
                }
            }
        }
        had_packet
    }

    fn reboot(&mut self) {
        info!("rebooting into freshly loaded state");
        let (config, frames) = self.nvm.load();
        self.sequencer = Sequencer::new(config.validated(), frames);
        self.mode = DeviceMode::Passthrough;
        self.decoder.reset();
        self.matcher = InitMatcher::new();
        self.rx.flush();
        self.tx.flush();
        self.output = false;
        self.reboots += 1;
    }
}
