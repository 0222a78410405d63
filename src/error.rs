//! Custom error types for the motion stack.
//!
//! This module defines the primary error type, `MotionError`, used across the
//! host-side components. Using the `thiserror` crate, it provides a
//! centralized and consistent way to handle the different kinds of failures
//! that can occur, from serial I/O and configuration issues to protocol
//! violations reported by the arm microcontroller.
//!
//! Two groups of variants carry the fatal/transient distinction the transport
//! relies on: `LinkLost` means the serial link is gone (zero-byte write or
//! repeated timeouts) and the connection must fall back to `PortClosed`,
//! while `ReplyMismatch` and `BadFrame` are transient and only fail the
//! operation in flight.

use thiserror::Error;

/// Convenience alias for results using the stack's error type.
pub type MotionResult<T> = std::result::Result<T, MotionError>;

/// Errors produced by the motion control and transport stack.
#[derive(Error, Debug)]
pub enum MotionError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port not connected")]
    PortNotConnected,

    #[error("Serial support not enabled. Rebuild with --features serial")]
    SerialFeatureDisabled,

    #[error("Link lost: {0}")]
    LinkLost(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Malformed frame: {0}")]
    BadFrame(String),

    #[error("Unexpected reply: expected {expected}, got {got}")]
    ReplyMismatch { expected: String, got: String },

    #[error("Keyframe line parse error: {0}")]
    KeyframeSyntax(String),

    #[error("Sequence of {0} keyframes exceeds device capacity")]
    SequenceTooLong(usize),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Axis initialisation failed: {0}")]
    InitFailed(String),

    #[error("Operation not allowed in state {0}")]
    InvalidState(String),

    #[error("Unknown joint '{0}' in keyframe")]
    UnknownJoint(String),
}
