//! File-format round trips over the shipped demo inputs.

use robolink_motion::config::Settings;
use robolink_motion::host::uploader::wire_sequence;
use robolink_motion::keyframe::timeline::Timeline;
use robolink_motion::protocol::POSITION_BIAS;
use robolink_motion::Sequence;

#[test]
fn test_demo_config_loads_and_validates() {
    let settings = Settings::load("demos/config.toml").unwrap();
    assert_eq!(settings.lookahead, 200);
    assert_eq!(settings.joints.len(), 4);
    assert_eq!(settings.active_axes(), 4);

    let shoulder = settings.joint("shoulder").unwrap();
    assert!(shoulder.invert);
    assert_eq!(shoulder.address, 2);

    let wrist = settings.joint("wrist").unwrap();
    assert_eq!(wrist.joystick_axis, 2);
    assert_eq!(wrist.offset, 0.05);
}

#[test]
fn test_demo_sequence_roundtrips_through_a_file() {
    let sequence = Sequence::load("demos/wave.txt").unwrap();
    assert_eq!(sequence.len(), 4);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("copy.txt");
    sequence.save(&path).unwrap();
    let reloaded = Sequence::load(&path).unwrap();
    assert_eq!(sequence, reloaded);
}

#[test]
fn test_demo_sequence_produces_legal_wire_frames() {
    let settings = Settings::load("demos/config.toml").unwrap();
    let sequence = Sequence::load("demos/wave.txt").unwrap();
    let timeline = Timeline::build(&sequence, true, 0.6).unwrap();
    let (config, frames) = wire_sequence(&settings, &timeline).unwrap();

    assert_eq!(config.active_axes, 4);
    assert_eq!(config.num_keyframes as usize, frames.len());

    for (index, frame) in frames.iter().enumerate() {
        if index == 0 {
            assert_eq!(frame.duration, 0, "initial frame is the starting pose");
        } else {
            assert!(frame.duration > 0);
        }
        for &tick in &frame.ticks {
            assert!(tick <= 2 * POSITION_BIAS);
        }
    }
}
