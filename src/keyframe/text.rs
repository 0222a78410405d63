//! Keyframe text serialisation.
//!
//! One keyframe per line, whitespace-separated tokens. Metadata tokens
//! (`speed:<int>`, `pause:<float>`, `output:<0..2>`) may appear in any order
//! and any subset at the start of the line, followed by any number of
//! `<joint_name>:<float>` tokens:
//!
//! ```text
//! speed:40 pause:0.5 output:1 shoulder:0.125 elbow(1):-0.33
//! ```
//!
//! Serialising a parsed line yields a line that parses back to an equal
//! keyframe; omitted metadata falls back to the constructor defaults.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use super::{Keyframe, OutputAction, Sequence};
use crate::error::{MotionError, MotionResult};

static LINE_RE: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(
        r"^\s*(?:(?:speed:\d{1,3}|pause:\d+(?:\.\d+)?|output:\d)\s+)*(?:[A-Za-z0-9_()]+:[+-]?\d+(?:\.\d+)?(?:[eE][+-]?\d+)?(?:\s+|\s*$))*$",
    )
    .unwrap()
});

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^([A-Za-z0-9_()]+):([+-]?\d+(?:\.\d+)?(?:[eE][+-]?\d+)?)$").unwrap()
});

/// Parse one keyframe line.
pub fn parse_line(line: &str) -> MotionResult<Keyframe> {
    if !LINE_RE.is_match(line) {
        return Err(MotionError::KeyframeSyntax(format!(
            "line does not match the keyframe grammar: '{}'",
            line.trim()
        )));
    }

    let mut speed: u8 = 50;
    let mut pause: f64 = 0.0;
    let mut output = OutputAction::Ignore;
    let mut angles = BTreeMap::new();

    for token in line.split_whitespace() {
        if let Some(rest) = token.strip_prefix("speed:") {
            speed = rest
                .parse::<u16>()
                .ok()
                .map(|v| v.min(u16::from(u8::MAX)) as u8)
                .ok_or_else(|| bad_token(token))?;
        } else if let Some(rest) = token.strip_prefix("pause:") {
            pause = rest.parse().map_err(|_| bad_token(token))?;
        } else if let Some(rest) = token.strip_prefix("output:") {
            let value: u8 = rest.parse().map_err(|_| bad_token(token))?;
            output = OutputAction::from_u8(value).ok_or_else(|| bad_token(token))?;
        } else {
            let caps = TOKEN_RE.captures(token).ok_or_else(|| bad_token(token))?;
            let name = caps[1].to_string();
            let angle: f64 = caps[2].parse().map_err(|_| bad_token(token))?;
            angles.insert(name, angle);
        }
    }

    Ok(Keyframe::new(angles, speed, pause, output))
}

fn bad_token(token: &str) -> MotionError {
    MotionError::KeyframeSyntax(format!("invalid token '{token}'"))
}

/// Serialise one keyframe to its line form.
pub fn format_line(frame: &Keyframe) -> String {
    let mut line = format!(
        "speed:{} pause:{} output:{}",
        frame.speed,
        frame.pause,
        frame.output.as_u8()
    );
    for (name, angle) in &frame.angles {
        line.push_str(&format!(" {name}:{angle}"));
    }
    line
}

impl Sequence {
    /// Parse a sequence from its text form, one keyframe per line.
    /// Blank lines are skipped.
    pub fn parse(text: &str) -> MotionResult<Self> {
        let mut seq = Sequence::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            seq.push(parse_line(line)?)?;
        }
        Ok(seq)
    }

    /// Serialise the sequence to its text form.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for frame in self.frames() {
            out.push_str(&format_line(frame));
            out.push('\n');
        }
        out
    }

    /// Load a sequence from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> MotionResult<Self> {
        Self::parse(&fs::read_to_string(path)?)
    }

    /// Write the sequence to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> MotionResult<()> {
        fs::write(path, self.to_text())?;
        Ok(())
    }
}
