//! Motion sequencing and transport stack for tendon-driven robolink arms.
//!
//! The crate splits along the serial link it exists to drive:
//!
//! - **Host side** ([`host`], [`keyframe`]): connection state machine,
//!   sequence uploader and the 50 Hz real-time keyframe player, all built
//!   on an exchangeable link so tests run against a simulated arm.
//! - **Device side** ([`device`]): a portable model of the arm
//!   microcontroller: passthrough/extended transport, command dispatcher,
//!   playback sequencer with look-ahead velocity correction, and the
//!   per-joint tendon controller program.
//! - **Shared** ([`protocol`], [`transform`], [`config`]): the framed
//!   binary protocol, the ASCII register grammar, the angle↔tick transform
//!   and the joint configuration model.

pub mod config;
pub mod device;
pub mod error;
pub mod host;
pub mod keyframe;
pub mod protocol;
pub mod transform;

pub use config::{JointConfig, Settings};
pub use error::{MotionError, MotionResult};
pub use keyframe::{Keyframe, OutputAction, Sequence};
