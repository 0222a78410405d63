//! Message types for the connection actor.
//!
//! The UI (or CLI) never touches the serial link directly: commands travel
//! over an mpsc channel to the task that owns the [`Connection`], and each
//! command carries a oneshot channel for its result. Cancellation of a
//! running playback goes through a shared flag that the playback loops
//! check every iteration, so a `Stop` takes effect without tearing the
//! actor down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::warn;
use tokio::sync::{mpsc, oneshot};

use super::connection::{Connection, LinkState};
use super::uploader::UploadAction;
use crate::error::{MotionError, MotionResult};
use crate::keyframe::timeline::Timeline;
use crate::protocol::wire::Feedback;

/// Commands accepted by the connection actor.
#[derive(Debug)]
pub enum HostCommand {
    /// Open a port and find the robot.
    Connect {
        /// Result channel.
        response: oneshot::Sender<MotionResult<()>>,
    },
    /// Zero-search initialisation of all axes.
    Initialise {
        /// Result channel.
        response: oneshot::Sender<MotionResult<()>>,
    },
    /// Switch to the framed protocol.
    EnterExtended {
        /// Result channel.
        response: oneshot::Sender<MotionResult<()>>,
    },
    /// Upload a timeline and commit or start playback.
    Upload {
        /// Built timeline to transfer.
        timeline: Timeline,
        /// How the transfer terminates.
        action: UploadAction,
        /// Result channel.
        response: oneshot::Sender<MotionResult<()>>,
    },
    /// Start remote playback of the committed sequence.
    Play {
        /// Restart from keyframe 1 after the last segment.
        looped: bool,
        /// Result channel.
        response: oneshot::Sender<MotionResult<()>>,
    },
    /// Drive playback from the host at 50 Hz.
    PlayRealtime {
        /// Built timeline to interpolate.
        timeline: Timeline,
        /// Blend between items instead of snapping.
        interpolating: bool,
        /// Result channel, resolved when playback ends.
        response: oneshot::Sender<MotionResult<()>>,
    },
    /// Abort any playback.
    Stop {
        /// Result channel.
        response: oneshot::Sender<MotionResult<()>>,
    },
    /// Toggle hardware compliance.
    Compliance {
        /// Requested mode.
        on: bool,
        /// Result channel.
        response: oneshot::Sender<MotionResult<()>>,
    },
    /// Query device feedback.
    Feedback {
        /// Result channel.
        response: oneshot::Sender<MotionResult<Feedback>>,
    },
    /// Read the current state.
    State {
        /// Result channel.
        response: oneshot::Sender<LinkState>,
    },
    /// Disconnect and end the actor.
    Shutdown,
}

/// Handle to a running connection actor.
#[derive(Clone)]
pub struct ConnectionHandle {
    tx: mpsc::Sender<HostCommand>,
    cancel: Arc<AtomicBool>,
}

impl ConnectionHandle {
    async fn send<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<MotionResult<T>>) -> HostCommand,
    ) -> MotionResult<T> {
        let (response, rx) = oneshot::channel();
        self.tx
            .send(build(response))
            .await
            .map_err(|_| MotionError::LinkLost("connection actor gone".to_string()))?;
        rx.await
            .map_err(|_| MotionError::LinkLost("connection actor dropped request".to_string()))?
    }

    /// Open a port and find the robot.
    pub async fn connect(&self) -> MotionResult<()> {
        self.send(|response| HostCommand::Connect { response }).await
    }

    /// Initialise all axes.
    pub async fn initialise(&self) -> MotionResult<()> {
        self.send(|response| HostCommand::Initialise { response }).await
    }

    /// Enter extended mode.
    pub async fn enter_extended(&self) -> MotionResult<()> {
        self.send(|response| HostCommand::EnterExtended { response }).await
    }

    /// Upload a timeline.
    pub async fn upload(&self, timeline: Timeline, action: UploadAction) -> MotionResult<()> {
        self.send(|response| HostCommand::Upload {
            timeline,
            action,
            response,
        })
        .await
    }

    /// Start remote playback.
    pub async fn play(&self, looped: bool) -> MotionResult<()> {
        self.send(|response| HostCommand::Play { looped, response }).await
    }

    /// Run host-driven playback; resolves when it finishes or is stopped.
    pub async fn play_realtime(
        &self,
        timeline: Timeline,
        interpolating: bool,
    ) -> MotionResult<()> {
        self.cancel.store(false, Ordering::Relaxed);
        self.send(|response| HostCommand::PlayRealtime {
            timeline,
            interpolating,
            response,
        })
        .await
    }

    /// Abort playback of either kind.
    pub async fn stop(&self) -> MotionResult<()> {
        self.cancel.store(true, Ordering::Relaxed);
        self.send(|response| HostCommand::Stop { response }).await
    }

    /// Query device feedback.
    pub async fn feedback(&self) -> MotionResult<Feedback> {
        self.send(|response| HostCommand::Feedback { response }).await
    }

    /// Current connection state.
    pub async fn state(&self) -> MotionResult<LinkState> {
        let (response, rx) = oneshot::channel();
        self.tx
            .send(HostCommand::State { response })
            .await
            .map_err(|_| MotionError::LinkLost("connection actor gone".to_string()))?;
        rx.await
            .map_err(|_| MotionError::LinkLost("connection actor dropped request".to_string()))
    }

    /// Toggle hardware compliance.
    pub async fn set_compliance(&self, on: bool) -> MotionResult<()> {
        self.send(|response| HostCommand::Compliance { on, response }).await
    }

    /// Disconnect and end the actor.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(HostCommand::Shutdown).await;
    }
}

/// Spawn the connection actor. The returned handle is cheap to clone.
pub fn spawn_connection(connection: Connection) -> ConnectionHandle {
    let (tx, rx) = mpsc::channel(32);
    let cancel = Arc::new(AtomicBool::new(false));
    tokio::spawn(run_actor(connection, rx, Arc::clone(&cancel)));
    ConnectionHandle { tx, cancel }
}

async fn run_actor(
    mut connection: Connection,
    mut rx: mpsc::Receiver<HostCommand>,
    cancel: Arc<AtomicBool>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            HostCommand::Connect { response } => {
                let _ = response.send(connection.connect().await);
            }
            HostCommand::Initialise { response } => {
                let _ = response.send(connection.initialise().await);
            }
            HostCommand::EnterExtended { response } => {
                let _ = response.send(connection.enter_extended().await);
            }
            HostCommand::Upload {
                timeline,
                action,
                response,
            } => {
                let _ = response.send(connection.upload(&timeline, action).await);
            }
            HostCommand::Play { looped, response } => {
                let _ = response.send(connection.play(looped).await);
            }
            HostCommand::PlayRealtime {
                timeline,
                interpolating,
                response,
            } => {
                let result = connection
                    .play_realtime(timeline, interpolating, &cancel)
                    .await;
                let _ = response.send(result);
            }
            HostCommand::Stop { response } => {
                let _ = response.send(connection.stop().await);
            }
            HostCommand::Compliance { on, response } => {
                let _ = response.send(connection.set_compliance(on).await);
            }
            HostCommand::Feedback { response } => {
                let _ = response.send(connection.poll_feedback().await);
            }
            HostCommand::State { response } => {
                let _ = response.send(connection.state());
            }
            HostCommand::Shutdown => {
                connection.disconnect().await;
                break;
            }
        }
    }
    warn!("connection actor stopped");
}
