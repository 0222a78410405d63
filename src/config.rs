//! Joint and global configuration.
//!
//! Configuration is a grouped key-value file consumed through the `config`
//! crate. The `global` group carries playback-wide settings; each `JointN`
//! group (N counting up from 0 without gaps) describes one joint:
//!
//! ```toml
//! [global]
//! lookahead = 200
//!
//! [Joint0]
//! name = "shoulder"
//! type = "X"
//! address = 1
//! encoder_steps_per_turn = 4640
//! motor_steps_per_turn = 4640
//! lower_limit = -1.2
//! upper_limit = 1.2
//! invert = 0
//! ```
//!
//! Loading validates the whole file before any state is handed out: joint
//! names must match the identifier grammar, bus addresses must be contiguous
//! from 1 with no repeats, and limits must be ordered. A failed validation
//! returns a structured [`MotionError::Configuration`] and mutates nothing.

use std::collections::HashMap;
use std::f64::consts::PI;
use std::path::Path;

use config::{Config, File};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::error::{MotionError, MotionResult};

/// Default look-ahead window in milliseconds.
pub const DEFAULT_LOOKAHEAD: u16 = 200;

/// Joint name grammar shared with the keyframe text format.
pub static JOINT_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^[A-Za-z0-9_()]+$").unwrap()
});

/// Axis kind, used only by visualisation layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum JointKind {
    /// Rotation about the link's X axis.
    X,
    /// Rotation about the link's Z axis.
    Z,
}

/// Immutable description of one joint.
#[derive(Debug, Clone)]
pub struct JointConfig {
    /// Unique identifier, `[A-Za-z0-9_()]+`.
    pub name: String,
    /// Axis kind.
    pub kind: JointKind,
    /// 1-based RS-485 bus address; contiguous across the arm.
    pub address: u8,
    /// Encoder resolution, steps per full turn.
    pub encoder_steps_per_turn: u32,
    /// Motor resolution, steps per full turn.
    pub motor_steps_per_turn: u32,
    /// Lower hardware limit in radians.
    pub lower_limit: f64,
    /// Upper hardware limit in radians.
    pub upper_limit: f64,
    /// Zero offset in radians.
    pub offset: f64,
    /// Link length for visualisation; negative when unknown.
    pub length: f64,
    /// Flip the joint's direction of travel.
    pub invert: bool,
    /// Joystick axis mapped to this joint; -1 when unmapped.
    pub joystick_axis: i32,
    /// Flip the joystick direction.
    pub joystick_invert: bool,
    /// Run current cap sent when leaving compliance.
    pub max_current: u16,
    /// Hold current sent when leaving compliance.
    pub hold_current: u16,
}

impl JointConfig {
    /// Radians per encoder step.
    pub fn enc_to_rad(&self) -> f64 {
        2.0 * PI / f64::from(self.encoder_steps_per_turn)
    }

    /// Radians per motor step.
    pub fn mot_to_rad(&self) -> f64 {
        2.0 * PI / f64::from(self.motor_steps_per_turn)
    }
}

/// The validated configuration of a whole arm.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Look-ahead window for the device velocity loop, milliseconds.
    pub lookahead: u16,
    /// Joints ordered by bus address.
    pub joints: Vec<JointConfig>,
}

#[derive(Debug, Deserialize, Default)]
struct RawGlobal {
    lookahead: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RawJoint {
    name: String,
    #[serde(rename = "type")]
    kind: JointKind,
    address: u8,
    encoder_steps_per_turn: u32,
    motor_steps_per_turn: u32,
    #[serde(default = "default_lower_limit")]
    lower_limit: f64,
    #[serde(default = "default_upper_limit")]
    upper_limit: f64,
    #[serde(default)]
    offset: f64,
    #[serde(default = "default_length")]
    length: f64,
    #[serde(default)]
    invert: u8,
    #[serde(default = "default_joystick_axis")]
    joystick_axis: i32,
    #[serde(default)]
    joystick_invert: u8,
    #[serde(default = "default_max_current")]
    max_current: u16,
    #[serde(default = "default_hold_current")]
    hold_current: u16,
}

fn default_lower_limit() -> f64 {
    -1.0
}

fn default_upper_limit() -> f64 {
    1.0
}

fn default_length() -> f64 {
    -1.0
}

fn default_joystick_axis() -> i32 {
    -1
}

fn default_max_current() -> u16 {
    80
}

fn default_hold_current() -> u16 {
    20
}

impl Settings {
    /// Load and validate a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> MotionResult<Self> {
        let cfg = Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()?;
        let table: HashMap<String, config::Value> = cfg.try_deserialize()?;
        Self::from_table(table)
    }

    fn from_table(table: HashMap<String, config::Value>) -> MotionResult<Self> {
        // The config crate folds keys to lowercase; match groups accordingly.
        let table: HashMap<String, config::Value> = table
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();

        let lookahead = match table.get("global") {
            Some(value) => value
                .clone()
                .try_deserialize::<RawGlobal>()?
                .lookahead
                .unwrap_or(DEFAULT_LOOKAHEAD),
            None => DEFAULT_LOOKAHEAD,
        };

        let mut raw_joints = Vec::new();
        loop {
            let key = format!("joint{}", raw_joints.len());
            match table.get(&key) {
                Some(value) => {
                    let raw: RawJoint = value.clone().try_deserialize()?;
                    raw_joints.push(raw);
                }
                None => break,
            }
        }

        // A JointN group past the first gap means the numbering is broken.
        for key in table.keys() {
            if let Some(n) = key.strip_prefix("joint").and_then(|s| s.parse::<usize>().ok()) {
                if n >= raw_joints.len() {
                    return Err(MotionError::Configuration(format!(
                        "joint groups must be contiguous from Joint0, found {key}"
                    )));
                }
            }
        }

        let joints = raw_joints
            .into_iter()
            .map(|raw| {
                Ok(JointConfig {
                    name: raw.name,
                    kind: raw.kind,
                    address: raw.address,
                    encoder_steps_per_turn: raw.encoder_steps_per_turn,
                    motor_steps_per_turn: raw.motor_steps_per_turn,
                    lower_limit: raw.lower_limit,
                    upper_limit: raw.upper_limit,
                    offset: raw.offset,
                    length: raw.length,
                    invert: raw.invert != 0,
                    joystick_axis: raw.joystick_axis,
                    joystick_invert: raw.joystick_invert != 0,
                    max_current: raw.max_current,
                    hold_current: raw.hold_current,
                })
            })
            .collect::<MotionResult<Vec<_>>>()?;

        let settings = Self { lookahead, joints };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> MotionResult<()> {
        let mut sorted: Vec<&JointConfig> = self.joints.iter().collect();
        sorted.sort_by_key(|j| j.address);

        for (index, joint) in sorted.iter().enumerate() {
            if !JOINT_NAME_RE.is_match(&joint.name) {
                return Err(MotionError::Configuration(format!(
                    "joint name '{}' contains invalid characters",
                    joint.name
                )));
            }
            if joint.address as usize != index + 1 {
                return Err(MotionError::Configuration(format!(
                    "joint addresses must be contiguous from 1, joint '{}' has address {}",
                    joint.name, joint.address
                )));
            }
            if joint.encoder_steps_per_turn == 0 || joint.motor_steps_per_turn == 0 {
                return Err(MotionError::Configuration(format!(
                    "joint '{}' has a zero steps-per-turn resolution",
                    joint.name
                )));
            }
            if joint.lower_limit >= joint.upper_limit {
                return Err(MotionError::Configuration(format!(
                    "joint '{}' limits are not ordered: [{}, {}]",
                    joint.name, joint.lower_limit, joint.upper_limit
                )));
            }
        }

        let mut names: Vec<&str> = self.joints.iter().map(|j| j.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.joints.len() {
            return Err(MotionError::Configuration(
                "joint names must be unique".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of axes participating on the bus (highest address in use).
    pub fn active_axes(&self) -> u16 {
        self.joints.iter().map(|j| u16::from(j.address)).max().unwrap_or(0)
    }

    /// Look up a joint by name.
    pub fn joint(&self, name: &str) -> Option<&JointConfig> {
        self.joints.iter().find(|j| j.name == name)
    }

    /// Joints ordered by bus address.
    pub fn by_address(&self) -> Vec<&JointConfig> {
        let mut sorted: Vec<&JointConfig> = self.joints.iter().collect();
        sorted.sort_by_key(|j| j.address);
        sorted
    }
}
