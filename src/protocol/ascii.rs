//! ASCII register protocol spoken on the RS-485 joint bus.
//!
//! Commands have the form `#<id><reg><value?>\r`; the controller answers by
//! echoing `<id><reg><value>\r` with the register's current (or just
//! written) value. The same grammar is used by the host in passthrough mode
//! and by the arm microcontroller when it drives the bus itself.
//!
//! Registers consumed by this stack:
//!
//! | Register | Direction | Meaning |
//! |----------|-----------|---------|
//! | `ZP`     | read      | ping; replies with the controller state |
//! | `P`      | read/write| pause register (controller state request) |
//! | `I`      | read      | encoder position |
//! | `s`      | read      | command (demand) position |
//! | `n`      | write     | destination, biased tick-space |
//! | `o`      | write     | velocity |
//! | `r`      | write     | hold current |
//! | `i`      | write     | run current cap |
//! | `(JA`    | write     | start the on-controller tendon program |

use once_cell::sync::Lazy;
use regex::Regex;

/// Format a bus command for controller `id`.
pub fn command(id: u8, register: &str, value: Option<i32>) -> Vec<u8> {
    match value {
        Some(v) => format!("#{}{}{}\r", id, register, v).into_bytes(),
        None => format!("#{}{}\r", id, register).into_bytes(),
    }
}

/// A parsed controller reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Bus id of the answering controller.
    pub id: u8,
    /// Echoed register name.
    pub register: String,
    /// Register value, when the reply carries one.
    pub value: Option<i16>,
}

static REPLY_RE: Lazy<Regex> = Lazy::new(|| {
    // <id><register><signed value?>  e.g. "1ZP+2", "3I-1204", "2P0"
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^(\d+)([A-Za-z()]+?)([+-]?\d+)?$").unwrap()
});

/// Parse a reply line (terminator already stripped).
///
/// Returns `None` for anything that does not match the echo grammar, which
/// the bus driver treats as a malformed response, distinct from a timeout.
pub fn parse_reply(line: &str) -> Option<Reply> {
    let caps = REPLY_RE.captures(line.trim())?;
    let id = caps.get(1)?.as_str().parse().ok()?;
    let register = caps.get(2)?.as_str().to_string();
    let value = match caps.get(3) {
        Some(m) => Some(m.as_str().parse().ok()?),
        None => None,
    };
    Some(Reply {
        id,
        register,
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_command_bytes() {
        // "#1ZP\r" as sent during robot detection.
        assert_eq!(command(1, "ZP", None), vec![0x23, 0x31, 0x5A, 0x50, 0x0D]);
    }

    #[test]
    fn test_write_command_format() {
        assert_eq!(command(3, "n", Some(16964)), b"#3n16964\r".to_vec());
        assert_eq!(command(2, "o", Some(250)), b"#2o250\r".to_vec());
        assert_eq!(command(1, "P", Some(0)), b"#1P0\r".to_vec());
    }

    #[test]
    fn test_parse_ping_reply() {
        let reply = parse_reply("1ZP+0").unwrap();
        assert_eq!(reply.id, 1);
        assert_eq!(reply.register, "ZP");
        assert_eq!(reply.value, Some(0));
    }

    #[test]
    fn test_parse_negative_encoder_reply() {
        let reply = parse_reply("4I-1204").unwrap();
        assert_eq!(reply.id, 4);
        assert_eq!(reply.register, "I");
        assert_eq!(reply.value, Some(-1204));
    }

    #[test]
    fn test_parse_state_write_echo() {
        let reply = parse_reply("2P1").unwrap();
        assert_eq!(reply.register, "P");
        assert_eq!(reply.value, Some(1));
    }

    #[test]
    fn test_malformed_replies_rejected() {
        assert!(parse_reply("").is_none());
        assert!(parse_reply("#1ZP").is_none());
        assert!(parse_reply("garbage!").is_none());
    }
}
