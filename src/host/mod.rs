//! Host side of the motion stack.
//!
//! [`link`] opens the serial port (or a test double), [`transport`] frames
//! and matches packets over it, [`connection`] walks the initialisation
//! state machine, [`uploader`] pushes sequences into the device, and
//! [`messages`] wraps the whole thing in an actor so UI code never touches
//! the serial handle.

pub mod connection;
pub mod link;
pub mod messages;
pub mod transport;
pub mod uploader;

pub use connection::{Connection, LinkFactory, LinkState};
pub use link::{Link, MockLink, PortCycler, SimLink};
pub use messages::{spawn_connection, ConnectionHandle, HostCommand};
pub use transport::Transport;
pub use uploader::UploadAction;

#[cfg(feature = "serial")]
pub use link::{candidate_ports, SerialLink};
