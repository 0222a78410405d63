//! Extended-mode command dispatcher.
//!
//! Parses framed packets from the host and applies them against the
//! sequencer, the RAM keyframe buffer and the non-volatile store. Every
//! accepted packet is answered by exactly one reply carrying the same
//! command code. Destructive commands (`CONFIG` with payload,
//! `SAVE_KEYFRAME`, `COMMIT`) are silently dropped while the sequencer is
//! playing: no reply is sent, and the host's answer matcher reports the
//! upload as failed.

use log::{debug, warn};

use super::bus::{JointBus, JointBusExt};
use super::nvm::NonVolatile;
use super::sequencer::Sequencer;
use crate::protocol::frame::{encode, Packet};
use crate::protocol::wire::{
    DeviceConfig, Feedback, Motion, SaveKeyframe, WireKeyframe, FLAG_LOOP, FLAG_PLAYING,
};
use crate::protocol::{Command, NO_READING, NUM_AXES, RESET_KEY};

/// Follow-up action requested by a handled packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchAction {
    /// Stay in extended mode.
    Continue,
    /// `EXIT` received: drop back to the passthrough loop.
    ExitExtended,
    /// Valid `RESET` key received: jump into the bootloader.
    Reboot,
}

/// Handle one packet. Returns the reply bytes (possibly empty when the
/// packet is ignored) and the follow-up action.
pub fn handle_packet(
    packet: &Packet,
    now: u64,
    sequencer: &mut Sequencer,
    nvm: &mut dyn NonVolatile,
    bus: &mut dyn JointBus,
    output: &mut bool,
) -> (Vec<u8>, DispatchAction) {
    let playing = sequencer.is_playing();
    match packet.command {
        Command::Init => (encode(Command::Init, &[]), DispatchAction::Continue),

        Command::Exit => {
            debug!("leaving extended mode on host request");
            (encode(Command::Exit, &[]), DispatchAction::ExitExtended)
        }

        Command::Config => {
            if packet.payload.is_empty() {
                let config = sequencer.config().encode();
                (encode(Command::Config, &config), DispatchAction::Continue)
            } else if playing {
                warn!("CONFIG ignored while playing");
                (Vec::new(), DispatchAction::Continue)
            } else {
                match DeviceConfig::decode(&packet.payload) {
                    Ok(config) => {
                        sequencer.set_config(config);
                        (encode(Command::Config, &[]), DispatchAction::Continue)
                    }
                    Err(_) => (Vec::new(), DispatchAction::Continue),
                }
            }
        }

        Command::SaveKeyframe => {
            if playing {
                warn!("SAVE_KEYFRAME ignored while playing");
                return (Vec::new(), DispatchAction::Continue);
            }
            match SaveKeyframe::decode(&packet.payload) {
                Ok(save) if sequencer.save_keyframe(save.index as usize, save.keyframe) => (
                    encode(Command::SaveKeyframe, &[save.index]),
                    DispatchAction::Continue,
                ),
                _ => (Vec::new(), DispatchAction::Continue),
            }
        }

        Command::ReadKeyframe => {
            let index = packet.payload.first().copied().unwrap_or(0);
            let frame = sequencer
                .keyframe(index as usize)
                .copied()
                .unwrap_or_else(WireKeyframe::origin);
            (
                encode(Command::ReadKeyframe, &frame.encode()),
                DispatchAction::Continue,
            )
        }

        Command::Commit => {
            if playing {
                warn!("COMMIT ignored while playing");
                return (Vec::new(), DispatchAction::Continue);
            }
            let mut config = sequencer.config().clone();
            config.num_keyframes = sequencer.frames().len() as u16;
            sequencer.set_config(config);
            match nvm.store(sequencer.config(), sequencer.frames()) {
                Ok(()) => (encode(Command::Commit, &[]), DispatchAction::Continue),
                Err(err) => {
                    warn!("commit failed: {err}");
                    (Vec::new(), DispatchAction::Continue)
                }
            }
        }

        Command::Play => {
            let looped = packet
                .payload
                .first()
                .map(|flags| flags & FLAG_LOOP != 0)
                .unwrap_or(false);
            let reply = encode(Command::Play, &[]);
            sequencer.start(looped, now, bus);
            (reply, DispatchAction::Continue)
        }

        Command::Stop => {
            sequencer.stop();
            (encode(Command::Stop, &[]), DispatchAction::Continue)
        }

        Command::Feedback => (
            encode(Command::Feedback, &feedback(sequencer, bus).encode()),
            DispatchAction::Continue,
        ),

        Command::Motion => {
            match Motion::decode(&packet.payload) {
                Ok(motion) => {
                    let axes = (motion.num_axes as usize).min(NUM_AXES);
                    for axis in 0..axes {
                        let id = axis as u8 + 1;
                        let _ = bus.set_destination(id, motion.ticks[axis]);
                        let _ = bus.set_velocity(id, motion.velocity[axis]);
                    }
                    match motion.output {
                        crate::protocol::wire::OutputCommand::Nop => {}
                        crate::protocol::wire::OutputCommand::Set => *output = true,
                        crate::protocol::wire::OutputCommand::Reset => *output = false,
                    }
                    (
                        encode(Command::Motion, &feedback(sequencer, bus).encode()),
                        DispatchAction::Continue,
                    )
                }
                Err(_) => (Vec::new(), DispatchAction::Continue),
            }
        }

        Command::Reset => {
            if packet.payload == RESET_KEY {
                warn!("reset key accepted, entering bootloader");
                (Vec::new(), DispatchAction::Reboot)
            } else {
                (Vec::new(), DispatchAction::Continue)
            }
        }
    }
}

/// Build a feedback record from the sequencer state and live encoders.
pub fn feedback(sequencer: &Sequencer, bus: &mut dyn JointBus) -> Feedback {
    let axes = (sequencer.config().active_axes as usize).min(NUM_AXES);
    let mut positions = [NO_READING; NUM_AXES];
    for (axis, slot) in positions.iter_mut().enumerate().take(axes) {
        if let Ok(encoder) = bus.read_encoder(axis as u8 + 1) {
            *slot = encoder;
        }
    }
    Feedback {
        num_axes: axes as u8,
        flags: if sequencer.is_playing() { FLAG_PLAYING } else { 0 },
        positions,
    }
}
