//! End-to-end sessions between the host stack and the simulated arm.
//!
//! These tests wire a [`Connection`] to the full device model through an
//! in-memory link and walk the documented session scenarios: robot
//! detection, the extended-mode switch, upload-and-commit, aborting a
//! running sequence, and link loss.

use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use robolink_motion::config::{JointConfig, JointKind, Settings};
use robolink_motion::device::bus::SimBus;
use robolink_motion::device::nvm::{MemNvm, NonVolatile};
use robolink_motion::device::{Device, DeviceMode};
use robolink_motion::host::{
    Connection, LinkFactory, LinkState, MockLink, SimLink, Transport, UploadAction,
};
use robolink_motion::keyframe::timeline::Timeline;
use robolink_motion::keyframe::{Keyframe, OutputAction, Sequence};
use robolink_motion::protocol::POSITION_BIAS;

fn one_joint_settings() -> Settings {
    Settings {
        lookahead: 200,
        joints: vec![JointConfig {
            name: "shoulder".into(),
            kind: JointKind::X,
            address: 1,
            encoder_steps_per_turn: 4640,
            motor_steps_per_turn: 4640,
            lower_limit: -1.0,
            upper_limit: 1.0,
            offset: 0.0,
            length: -1.0,
            invert: false,
            joystick_axis: -1,
            joystick_invert: false,
            max_current: 80,
            hold_current: 20,
        }],
    }
}

fn quarter_turn_timeline(looped: bool) -> Timeline {
    let sequence: Sequence = [
        Keyframe::new(
            BTreeMap::from([("shoulder".to_string(), 0.0)]),
            50,
            0.0,
            OutputAction::Ignore,
        ),
        Keyframe::new(
            BTreeMap::from([("shoulder".to_string(), PI / 4.0)]),
            50,
            0.0,
            OutputAction::Ignore,
        ),
    ]
    .into_iter()
    .collect();
    Timeline::build(&sequence, looped, 1.0).unwrap()
}

fn sim_connection(settings: Settings) -> (Connection, Arc<Mutex<Device<MemNvm>>>) {
    let axes = settings.active_axes() as usize;
    let device = Arc::new(Mutex::new(Device::new(
        MemNvm::new(),
        SimBus::initialised(axes.max(1)),
    )));
    let shared = Arc::clone(&device);
    let factory: LinkFactory = Box::new(move |_| Box::new(SimLink::new(Arc::clone(&shared))));
    let connection = Connection::new(settings, factory, vec!["sim0".into()]);
    (connection, device)
}

#[tokio::test]
async fn test_boot_and_connect_byte_stream() {
    // Scenario: the probe must be exactly `#1ZP\r` and a `1ZP+0` answer
    // confirms the robot.
    let mut link = MockLink::new();
    link.push_reply(b"1ZP+0\r");
    let mut transport = Transport::new(Box::new(link));
    transport.open().await.unwrap();

    let reply = transport.ascii_query(1, "ZP", None).await.unwrap().unwrap();
    assert_eq!(reply.value, Some(0));
}

#[tokio::test]
async fn test_connect_against_mock_reaches_robot_confirmed() {
    let factory: LinkFactory = Box::new(|_| {
        let mut link = MockLink::new();
        link.push_reply(b"1ZP+0\r"); // probe
        link.push_reply(b"1ZP+0\r"); // axis state check: not yet initialised
        Box::new(link)
    });
    let mut connection = Connection::new(one_joint_settings(), factory, vec!["COM1".into()]);
    connection.connect().await.unwrap();
    assert_eq!(connection.state(), LinkState::RobotConfirmed);
}

#[tokio::test]
async fn test_extended_roundtrip_against_device() {
    let (mut connection, device) = sim_connection(one_joint_settings());

    connection.connect().await.unwrap();
    // Simulated joints report state 2, so initialisation is skipped.
    assert_eq!(connection.state(), LinkState::InitialisedStiff);

    connection.enter_extended().await.unwrap();
    assert_eq!(connection.state(), LinkState::ExtendedMode);
    assert_eq!(device.lock().unwrap().mode(), DeviceMode::Extended);
}

#[tokio::test]
async fn test_upload_and_commit_persists_exact_ticks() {
    let (mut connection, device) = sim_connection(one_joint_settings());
    connection.connect().await.unwrap();
    connection.enter_extended().await.unwrap();

    let timeline = quarter_turn_timeline(false);
    let expected_duration = (timeline.items[1].relative_time * 1000.0).round() as u16;
    connection
        .upload(&timeline, UploadAction::Commit)
        .await
        .unwrap();
    assert_eq!(connection.state(), LinkState::ExtendedMode);

    let device = device.lock().unwrap();
    let (config, frames) = device.nvm().load();
    assert_eq!(config.num_keyframes, 2);
    assert_eq!(config.active_axes, 1);
    assert_eq!(config.enc_to_mot[0], 256);

    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].duration, 0);
    assert_eq!(frames[0].ticks[0], 16384);
    assert_eq!(frames[1].ticks[0], 16964, "π/4 at 4640 steps = 580 ticks");
    assert_eq!(frames[1].duration, expected_duration);
}

#[tokio::test]
async fn test_abort_during_play() {
    let (mut connection, device) = sim_connection(one_joint_settings());
    connection.connect().await.unwrap();
    connection.enter_extended().await.unwrap();

    connection
        .upload(&quarter_turn_timeline(false), UploadAction::Play)
        .await
        .unwrap();
    assert_eq!(connection.state(), LinkState::Playing);
    assert!(device.lock().unwrap().sequencer().is_playing());

    // Let the sequence run a little, then abort mid-segment.
    device.lock().unwrap().run(200);
    connection.stop().await.unwrap();
    assert_eq!(connection.state(), LinkState::ExtendedMode);

    let feedback = connection.poll_feedback().await.unwrap();
    assert!(!feedback.is_playing());
    assert!(!device.lock().unwrap().sequencer().is_playing());
}

#[tokio::test]
async fn test_device_playback_completion_clears_playing() {
    let (mut connection, device) = sim_connection(one_joint_settings());
    connection.connect().await.unwrap();
    connection.enter_extended().await.unwrap();

    connection
        .upload(&quarter_turn_timeline(false), UploadAction::Play)
        .await
        .unwrap();

    // Drive the simulation until the sequence ends (quarter turn ≈ 1.6 s
    // plus settling), polling feedback the way the transport loop does;
    // the poll doubles as the extended-mode keep-alive.
    let mut finished = false;
    for _ in 0..30 {
        device.lock().unwrap().run(200);
        let feedback = connection.poll_feedback().await.unwrap();
        if !feedback.is_playing() {
            finished = true;
            break;
        }
    }
    assert!(finished, "sequence did not finish in time");
    assert!(!device.lock().unwrap().sequencer().is_playing());
    assert_eq!(connection.state(), LinkState::ExtendedMode);

    // The joint should have tracked the quarter turn: 580 encoder ticks.
    let encoder = i64::from(device.lock().unwrap().bus().joint(1).unwrap().encoder());
    assert!(
        (encoder - 580).abs() < 60,
        "joint ended at {encoder}, expected ≈580"
    );
}

#[tokio::test]
async fn test_loss_of_link_returns_to_port_closed() {
    let factory: LinkFactory = Box::new(|_| {
        let mut link = MockLink::new();
        link.push_reply(b"1ZP+2\r"); // probe
        link.push_reply(b"1ZP+2\r"); // axis check → initialised
        link.push_reply(&robolink_motion::protocol::frame::encode(
            robolink_motion::protocol::Command::Init,
            &[],
        ));
        link.fail_after = Some(3);
        Box::new(link)
    });
    let mut connection = Connection::new(one_joint_settings(), factory, vec!["COM1".into()]);

    connection.connect().await.unwrap();
    assert_eq!(connection.state(), LinkState::InitialisedStiff);
    connection.enter_extended().await.unwrap();

    let err = connection.play(false).await.unwrap_err();
    assert!(matches!(
        err,
        robolink_motion::MotionError::LinkLost(_)
    ));
    assert_eq!(connection.state(), LinkState::PortClosed);
}

#[tokio::test]
async fn test_compliance_transition_writes_currents() {
    let (mut connection, device) = sim_connection(one_joint_settings());
    connection.connect().await.unwrap();
    connection.enter_extended().await.unwrap();

    connection.set_compliance(true).await.unwrap();
    assert!(connection.is_compliant());
    assert_eq!(connection.state(), LinkState::ExtendedMode);
    {
        let device = device.lock().unwrap();
        let joint = device.bus().joint(1).unwrap();
        assert_eq!(joint.motor.run_current, 0);
        assert_eq!(joint.motor.hold_current, 0);
    }

    connection.set_compliance(false).await.unwrap();
    assert!(!connection.is_compliant());
    {
        let device = device.lock().unwrap();
        let joint = device.bus().joint(1).unwrap();
        assert_eq!(joint.motor.run_current, 80);
        assert_eq!(joint.motor.hold_current, 20);
    }
}

#[tokio::test]
async fn test_host_realtime_playback_drives_device() {
    let (mut connection, device) = sim_connection(one_joint_settings());
    connection.connect().await.unwrap();
    connection.enter_extended().await.unwrap();

    // A short hop so the 50 Hz loop finishes quickly.
    let sequence: Sequence = [
        Keyframe::new(
            BTreeMap::from([("shoulder".to_string(), 0.0)]),
            100,
            0.0,
            OutputAction::Ignore,
        ),
        Keyframe::new(
            BTreeMap::from([("shoulder".to_string(), 0.05)]),
            100,
            0.0,
            OutputAction::Ignore,
        ),
    ]
    .into_iter()
    .collect();
    let timeline = Timeline::build(&sequence, false, 1.0).unwrap();

    let cancel = std::sync::atomic::AtomicBool::new(false);
    tokio::time::timeout(
        Duration::from_secs(10),
        connection.play_realtime(timeline, true, &cancel),
    )
    .await
    .expect("playback should finish well within the timeout")
    .unwrap();

    assert_eq!(connection.state(), LinkState::ExtendedMode);

    // The final motion command must target the end pose.
    let expected = POSITION_BIAS + (0.05 / (2.0 * PI / 4640.0)).round() as u16;
    let destination = device.lock().unwrap().bus().joint(1).unwrap().destination();
    assert_eq!(destination, i64::from(expected));
}
