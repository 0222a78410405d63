//! Sequence uploader: timeline → device tick-space.
//!
//! Translates a built playback timeline into wire keyframes, pushes them
//! over the extended protocol and terminates with either a commit to
//! non-volatile memory or an immediate remote playback. Every packet must
//! be acknowledged by a reply with the same command code; the first
//! mismatch or I/O failure aborts the transfer and surfaces one aggregate
//! outcome.

use log::{debug, info};

use super::transport::Transport;
use crate::config::Settings;
use crate::error::{MotionError, MotionResult};
use crate::keyframe::timeline::Timeline;
use crate::protocol::wire::{DeviceConfig, SaveKeyframe, WireKeyframe, FLAG_LOOP};
use crate::protocol::{Command, MAX_KEYFRAMES, NUM_AXES};
use crate::transform::{enc_to_mot_ratio, JointTransform};

/// How an upload terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadAction {
    /// Persist the sequence for autonomous playback.
    Commit,
    /// Play once, without persisting.
    Play,
    /// Play looped, without persisting.
    Loop,
}

/// Convert a timeline into wire form: the device config plus one keyframe
/// per timeline item, the first with duration zero as the starting pose.
pub fn wire_sequence(
    settings: &Settings,
    timeline: &Timeline,
) -> MotionResult<(DeviceConfig, Vec<WireKeyframe>)> {
    if timeline.items.len() > MAX_KEYFRAMES {
        return Err(MotionError::SequenceTooLong(timeline.items.len()));
    }

    let joints = settings.by_address();
    let active_axes = settings.active_axes();
    if active_axes as usize > NUM_AXES {
        return Err(MotionError::Configuration(format!(
            "{active_axes} axes exceed the device's {NUM_AXES} slots"
        )));
    }

    let mut enc_to_mot = [256u16; NUM_AXES];
    for joint in &joints {
        enc_to_mot[joint.address as usize - 1] =
            enc_to_mot_ratio(joint.enc_to_rad(), joint.mot_to_rad());
    }

    let mut frames: Vec<WireKeyframe> = Vec::with_capacity(timeline.items.len());
    for (index, item) in timeline.items.iter().enumerate() {
        // Joints missing from an item keep their previous target.
        let mut frame = frames.last().copied().unwrap_or_else(WireKeyframe::origin);
        frame.duration = if index == 0 {
            0
        } else {
            ((item.relative_time * 1000.0).round() as u64).clamp(1, u64::from(u16::MAX)) as u16
        };
        frame.output = item.output.to_wire();

        for joint in &joints {
            if let Some(state) = item.joints.get(&joint.name) {
                let transform = JointTransform::new(joint);
                frame.ticks[joint.address as usize - 1] = transform.angle_to_tick(state.angle);
            }
        }
        frames.push(frame);
    }

    let config = DeviceConfig {
        num_keyframes: frames.len() as u16,
        active_axes,
        enc_to_mot,
        lookahead: settings.lookahead,
    };
    Ok((config, frames))
}

/// Push a timeline to the device and finish with `action`.
///
/// The caller must already hold the link in extended mode and the device
/// must not be playing, or the device will silently drop the destructive
/// packets and the acknowledgement matching below fails the upload.
pub async fn upload(
    transport: &mut Transport,
    settings: &Settings,
    timeline: &Timeline,
    action: UploadAction,
) -> MotionResult<()> {
    let (config, frames) = wire_sequence(settings, timeline)?;

    info!(
        "uploading {} keyframes on {} axes ({:?})",
        frames.len(),
        config.active_axes,
        action
    );

    transport
        .request(Command::Config, &config.encode())
        .await
        .map_err(|e| MotionError::Upload(format!("CONFIG rejected: {e}")))?;

    for (index, frame) in frames.iter().enumerate() {
        let save = SaveKeyframe {
            index: index as u8,
            keyframe: *frame,
        };
        debug!("keyframe {index}: duration {} ms", frame.duration);
        transport
            .request(Command::SaveKeyframe, &save.encode())
            .await
            .map_err(|e| MotionError::Upload(format!("keyframe {index} rejected: {e}")))?;
    }

    match action {
        UploadAction::Commit => {
            transport
                .request(Command::Commit, &[])
                .await
                .map_err(|e| MotionError::Upload(format!("COMMIT rejected: {e}")))?;
        }
        UploadAction::Play | UploadAction::Loop => {
            let flags = if action == UploadAction::Loop { FLAG_LOOP } else { 0 };
            transport
                .request(Command::Play, &[flags])
                .await
                .map_err(|e| MotionError::Upload(format!("PLAY rejected: {e}")))?;
        }
    }

    info!("upload complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JointConfig, JointKind};
    use crate::keyframe::{Keyframe, OutputAction, Sequence};
    use crate::protocol::POSITION_BIAS;
    use std::collections::BTreeMap;
    use std::f64::consts::PI;

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

    fn two_frame_timeline() -> Timeline {
        let frames: Sequence = [
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
        Timeline::build(&frames, false, 1.0).unwrap()
    }

    #[test]
    fn test_wire_sequence_ticks_and_durations() {
        let settings = one_joint_settings();
        let timeline = two_frame_timeline();
        let (config, frames) = wire_sequence(&settings, &timeline).unwrap();

        assert_eq!(config.num_keyframes, 2);
        assert_eq!(config.active_axes, 1);
        assert_eq!(config.enc_to_mot[0], 256);
        assert_eq!(config.lookahead, 200);

        assert_eq!(frames[0].duration, 0);
        assert_eq!(frames[0].ticks[0], POSITION_BIAS);
        // π/4 at 4640 steps per turn → 580 ticks above bias; the segment
        // runs 0.785 rad at 0.5 rad/s ≈ 1571 ms.
        assert_eq!(frames[1].ticks[0], POSITION_BIAS + 580);
        let expected_ms = (PI / 4.0 / 0.5 * 1000.0).round() as u16;
        assert_eq!(frames[1].duration, expected_ms);
    }

    #[test]
    fn test_wire_sequence_clamps_to_limits() {
        let settings = one_joint_settings();
        let frames: Sequence = [
            Keyframe::new(
                BTreeMap::from([("shoulder".to_string(), 0.0)]),
                50,
                0.0,
                OutputAction::Ignore,
            ),
            Keyframe::new(
                BTreeMap::from([("shoulder".to_string(), 5.0)]),
                50,
                0.0,
                OutputAction::Ignore,
            ),
        ]
        .into_iter()
        .collect();
        let timeline = Timeline::build(&frames, false, 1.0).unwrap();
        let (_, wire) = wire_sequence(&settings, &timeline).unwrap();

        // Clamped to upper_limit = 1.0 rad → round(4640/2π) = 738.
        let expected = POSITION_BIAS + (4640.0 / (2.0 * PI)).round() as u16;
        assert_eq!(wire[1].ticks[0], expected);
    }

    #[tokio::test]
    async fn test_upload_aborts_on_missing_ack() {
        use crate::host::link::MockLink;
        use crate::host::transport::Transport;
        use crate::protocol::frame::encode;

        let mut link = MockLink::new();
        // CONFIG acknowledged, first SAVE_KEYFRAME never answered.
        link.push_reply(&encode(Command::Config, &[]));
        let mut transport = Transport::new(Box::new(link));
        transport.open().await.unwrap();

        let settings = one_joint_settings();
        let timeline = two_frame_timeline();
        let err = upload(&mut transport, &settings, &timeline, UploadAction::Commit)
            .await
            .unwrap_err();
        assert!(matches!(err, MotionError::Upload(_)));
        assert!(err.to_string().contains("keyframe 0"));
    }
}
