//! `robolink`, the command-line front end for the motion stack.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use robolink_motion::host::{spawn_connection, Connection, ConnectionHandle, UploadAction};
use robolink_motion::keyframe::timeline::Timeline;
use robolink_motion::{Sequence, Settings};

/// Default joint speed limit for timeline building, radians per second.
const DEFAULT_SPEED_LIMIT: f64 = 0.6;

#[derive(Parser)]
#[command(name = "robolink", about = "Drive a tendon-actuated robolink arm")]
struct Cli {
    /// Joint configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Serial port; cycles through detected ports when omitted.
    #[arg(short, long)]
    port: Option<String>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// List candidate serial ports.
    Ports,
    /// Find the robot and report the connection state.
    Connect,
    /// Connect and run the zero-search initialisation.
    Init,
    /// Upload a sequence file and commit it to the device.
    Upload {
        /// Keyframe sequence file.
        sequence: PathBuf,
        /// Start remote playback instead of committing.
        #[arg(long)]
        play: bool,
        /// Play looped instead of committing.
        #[arg(long = "loop")]
        looped: bool,
        /// Speed limit in radians per second.
        #[arg(long, default_value_t = DEFAULT_SPEED_LIMIT)]
        speed_limit: f64,
    },
    /// Play the committed sequence.
    Play {
        /// Restart from keyframe 1 after the last segment.
        #[arg(long = "loop")]
        looped: bool,
    },
    /// Play a sequence in real time from the host.
    Run {
        /// Keyframe sequence file.
        sequence: PathBuf,
        /// Speed limit in radians per second.
        #[arg(long, default_value_t = DEFAULT_SPEED_LIMIT)]
        speed_limit: f64,
    },
    /// Abort any running playback.
    Stop,
    /// Switch the arm between stiff and hand-guidable.
    Compliance {
        /// `on` for compliant, `off` for stiff.
        mode: String,
    },
    /// Exercise a sequence against the in-process device simulation.
    Simulate {
        /// Keyframe sequence file.
        sequence: PathBuf,
        /// Speed limit in radians per second.
        #[arg(long, default_value_t = DEFAULT_SPEED_LIMIT)]
        speed_limit: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    if let CliCommand::Ports = cli.command {
        return list_ports();
    }

    let settings = Settings::load(&cli.config)
        .with_context(|| format!("loading joint configuration {}", cli.config.display()))?;

    match cli.command {
        CliCommand::Ports => unreachable!("handled above"),
        CliCommand::Connect => {
            let handle = open_session(settings, cli.port).await?;
            handle.connect().await?;
            println!("state: {:?}", handle.state().await?);
            handle.shutdown().await;
        }
        CliCommand::Init => {
            let handle = open_session(settings, cli.port).await?;
            handle.connect().await?;
            handle.initialise().await?;
            println!("state: {:?}", handle.state().await?);
            handle.shutdown().await;
        }
        CliCommand::Upload {
            sequence,
            play,
            looped,
            speed_limit,
        } => {
            let action = match (play, looped) {
                (_, true) => UploadAction::Loop,
                (true, false) => UploadAction::Play,
                (false, false) => UploadAction::Commit,
            };
            let timeline = load_timeline(&sequence, &settings, looped, speed_limit)?;
            let handle = connect_extended(settings, cli.port).await?;
            handle.upload(timeline, action).await?;
            println!("upload complete ({action:?})");
            handle.shutdown().await;
        }
        CliCommand::Play { looped } => {
            let handle = connect_extended(settings, cli.port).await?;
            handle.play(looped).await?;
            println!("playback started");
            handle.shutdown().await;
        }
        CliCommand::Run {
            sequence,
            speed_limit,
        } => {
            let timeline = load_timeline(&sequence, &settings, false, speed_limit)?;
            let handle = connect_extended(settings, cli.port).await?;
            handle.play_realtime(timeline, true).await?;
            println!("playback finished");
            handle.shutdown().await;
        }
        CliCommand::Stop => {
            let handle = connect_extended(settings, cli.port).await?;
            handle.stop().await?;
            println!("stopped");
            handle.shutdown().await;
        }
        CliCommand::Compliance { mode } => {
            let on = match mode.as_str() {
                "on" => true,
                "off" => false,
                other => bail!("compliance mode must be 'on' or 'off', got '{other}'"),
            };
            let handle = connect_extended(settings, cli.port).await?;
            handle.set_compliance(on).await?;
            println!("arm is now {}", if on { "compliant" } else { "stiff" });
            handle.shutdown().await;
        }
        CliCommand::Simulate {
            sequence,
            speed_limit,
        } => {
            simulate(settings, &sequence, speed_limit).await?;
        }
    }
    Ok(())
}

fn list_ports() -> Result<()> {
    #[cfg(feature = "serial")]
    {
        for name in robolink_motion::host::candidate_ports() {
            println!("{name}");
        }
        Ok(())
    }
    #[cfg(not(feature = "serial"))]
    {
        bail!("serial support not built in; rebuild with --features serial")
    }
}

fn load_timeline(
    path: &PathBuf,
    settings: &Settings,
    looped: bool,
    speed_limit: f64,
) -> Result<Timeline> {
    let sequence = Sequence::load(path)
        .with_context(|| format!("loading sequence {}", path.display()))?;
    for frame in sequence.frames() {
        for name in frame.angles.keys() {
            if settings.joint(name).is_none() {
                bail!("sequence names unknown joint '{name}'");
            }
        }
    }
    Ok(Timeline::build(&sequence, looped, speed_limit)?)
}

async fn open_session(settings: Settings, port: Option<String>) -> Result<ConnectionHandle> {
    #[cfg(feature = "serial")]
    {
        let ports = match port {
            Some(port) => vec![port],
            None => robolink_motion::host::candidate_ports(),
        };
        let factory: robolink_motion::host::LinkFactory =
            Box::new(|name| Box::new(robolink_motion::host::SerialLink::new(name)));
        Ok(spawn_connection(Connection::new(settings, factory, ports)))
    }
    #[cfg(not(feature = "serial"))]
    {
        let _ = (settings, port);
        bail!("serial support not built in; rebuild with --features serial")
    }
}

async fn connect_extended(settings: Settings, port: Option<String>) -> Result<ConnectionHandle> {
    let handle = open_session(settings, port).await?;
    handle.connect().await?;
    handle.initialise().await?;
    handle.enter_extended().await?;
    Ok(handle)
}

/// Upload-and-play against the in-process device model, then report where
/// every joint landed.
async fn simulate(settings: Settings, sequence: &PathBuf, speed_limit: f64) -> Result<()> {
    use robolink_motion::device::bus::SimBus;
    use robolink_motion::device::nvm::MemNvm;
    use robolink_motion::device::Device;
    use robolink_motion::host::{LinkFactory, SimLink};
    use std::sync::{Arc, Mutex};

    let timeline = load_timeline(sequence, &settings, false, speed_limit)?;
    let axes = settings.active_axes() as usize;
    let device = Arc::new(Mutex::new(Device::new(
        MemNvm::new(),
        SimBus::initialised(axes),
    )));

    let sim = Arc::clone(&device);
    let factory: LinkFactory = Box::new(move |_| Box::new(SimLink::new(Arc::clone(&sim))));
    let joints = settings.joints.clone();
    let handle = spawn_connection(Connection::new(settings, factory, vec!["sim".into()]));

    handle.connect().await?;
    handle.enter_extended().await?;
    handle.upload(timeline, UploadAction::Play).await?;
    info!("sequence playing in simulation");

    // Run the device to completion; the feedback poll doubles as the
    // extended-mode keep-alive.
    let feedback = loop {
        {
            let mut dev = device
                .lock()
                .map_err(|_| anyhow::anyhow!("simulated device poisoned"))?;
            dev.run(200);
        }
        let feedback = handle.feedback().await?;
        if !feedback.is_playing() {
            break feedback;
        }
    };
    for joint in &joints {
        let transform = robolink_motion::transform::JointTransform::new(joint);
        let raw = feedback.positions[joint.address as usize - 1];
        let angle = transform.feedback_angle(raw, 0.0);
        println!("{}: {:.4} rad", joint.name, angle);
    }
    handle.shutdown().await;
    Ok(())
}
