//! Non-volatile keyframe and config store.
//!
//! The device persists a linear array of wire-form keyframes followed by a
//! single [`DeviceConfig`] record. Writes are wear-aware: an image identical
//! to what is already stored is not rewritten. On boot the config is
//! validated and an erased or corrupt image is replaced by factory defaults
//! (see [`DeviceConfig::validated`]).
//!
//! The trait seam exists so the device core can run against an in-memory
//! store in tests and a file-backed store in the simulator.

use std::fs;
use std::path::PathBuf;

use crate::error::MotionResult;
use crate::protocol::wire::{DeviceConfig, WireKeyframe};
use crate::protocol::MAX_KEYFRAMES;

/// Persistent storage for the keyframe array and config record.
pub trait NonVolatile: Send {
    /// Read the stored image. An empty or unreadable store yields the
    /// erased image, which boot validation maps to defaults.
    fn load(&self) -> (DeviceConfig, Vec<WireKeyframe>);

    /// Persist a new image, skipping the write when nothing changed.
    fn store(&mut self, config: &DeviceConfig, frames: &[WireKeyframe]) -> MotionResult<()>;
}

/// Volatile stand-in used by tests; starts erased.
#[derive(Debug, Default)]
pub struct MemNvm {
    image: Option<(DeviceConfig, Vec<WireKeyframe>)>,
    /// Number of actual write cycles, observable by wear tests.
    pub writes: usize,
}

impl MemNvm {
    /// Create an erased store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl NonVolatile for MemNvm {
    fn load(&self) -> (DeviceConfig, Vec<WireKeyframe>) {
        match &self.image {
            Some((config, frames)) => (config.clone(), frames.clone()),
            None => (DeviceConfig::erased(), Vec::new()),
        }
    }

    fn store(&mut self, config: &DeviceConfig, frames: &[WireKeyframe]) -> MotionResult<()> {
        let next = Some((config.clone(), frames.to_vec()));
        if self.image != next {
            self.image = next;
            self.writes += 1;
        }
        Ok(())
    }
}

/// File-backed store used by the simulator so committed sequences survive
/// a restart. Layout mirrors the device: keyframe slots, then the config.
#[derive(Debug)]
pub struct FileNvm {
    path: PathBuf,
}

impl FileNvm {
    /// Open a store at `path`; a missing file reads as erased.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn encode(config: &DeviceConfig, frames: &[WireKeyframe]) -> Vec<u8> {
        let mut out = Vec::with_capacity(MAX_KEYFRAMES * WireKeyframe::SIZE + DeviceConfig::SIZE);
        for slot in 0..MAX_KEYFRAMES {
            match frames.get(slot) {
                Some(frame) => out.extend_from_slice(&frame.encode()),
                None => out.extend_from_slice(&[0xFF; WireKeyframe::SIZE]),
            }
        }
        out.extend_from_slice(&config.encode());
        out
    }
}

impl NonVolatile for FileNvm {
    fn load(&self) -> (DeviceConfig, Vec<WireKeyframe>) {
        let Ok(bytes) = fs::read(&self.path) else {
            return (DeviceConfig::erased(), Vec::new());
        };
        let config_offset = MAX_KEYFRAMES * WireKeyframe::SIZE;
        if bytes.len() != config_offset + DeviceConfig::SIZE {
            return (DeviceConfig::erased(), Vec::new());
        }
        let Ok(config) = DeviceConfig::decode(&bytes[config_offset..]) else {
            return (DeviceConfig::erased(), Vec::new());
        };
        let count = (config.num_keyframes as usize).min(MAX_KEYFRAMES);
        let frames = (0..count)
            .filter_map(|slot| {
                let at = slot * WireKeyframe::SIZE;
                WireKeyframe::decode(&bytes[at..at + WireKeyframe::SIZE]).ok()
            })
            .collect();
        (config, frames)
    }

    fn store(&mut self, config: &DeviceConfig, frames: &[WireKeyframe]) -> MotionResult<()> {
        let image = Self::encode(config, frames);
        if fs::read(&self.path).map(|old| old == image).unwrap_or(false) {
            return Ok(());
        }
        fs::write(&self.path, image)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::NUM_AXES;

    fn sample_image() -> (DeviceConfig, Vec<WireKeyframe>) {
        let config = DeviceConfig {
            num_keyframes: 2,
            active_axes: 1,
            enc_to_mot: [256; NUM_AXES],
            lookahead: 200,
        };
        let mut second = WireKeyframe::origin();
        second.duration = 1500;
        second.ticks[0] = 16964;
        (config, vec![WireKeyframe::origin(), second])
    }

    #[test]
    fn test_mem_nvm_roundtrip_and_wear() {
        let (config, frames) = sample_image();
        let mut nvm = MemNvm::new();

        let (boot, boot_frames) = nvm.load();
        assert_eq!(boot.active_axes, 0xFFFF);
        assert!(boot_frames.is_empty());

        nvm.store(&config, &frames).unwrap();
        nvm.store(&config, &frames).unwrap();
        assert_eq!(nvm.writes, 1, "identical image must not rewrite");

        let (loaded, loaded_frames) = nvm.load();
        assert_eq!(loaded, config);
        assert_eq!(loaded_frames, frames);
    }

    #[test]
    fn test_file_nvm_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.bin");
        let (config, frames) = sample_image();

        let mut nvm = FileNvm::new(path.clone());
        let (boot, _) = nvm.load();
        assert_eq!(boot.active_axes, 0xFFFF);

        nvm.store(&config, &frames).unwrap();
        let reopened = FileNvm::new(path);
        let (loaded, loaded_frames) = reopened.load();
        assert_eq!(loaded, config);
        assert_eq!(loaded_frames, frames);
    }
}
