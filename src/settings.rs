//! Pipeline configuration.
//!
//! Settings are resolved once into an immutable [`Settings`] value and handed
//! to `Pipeline::new` or `Pipeline::reconfigure`; nothing reads configuration
//! behind the pipeline's back.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::capture::PixelFormat;
use crate::detect::DetectorParams;
use crate::display::Facing;
use crate::errors::SettingsError;
use crate::pipeline::queue::DEFAULT_CAPACITY;

/// Prefix of environment overrides, e.g. `TAGVIEW__PIPELINE__QUEUE_CAPACITY=2`.
pub const ENV_PREFIX: &str = "TAGVIEW";

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub detector: DetectorParams,
    pub pipeline: PipelineSettings,
    pub capture: CaptureSettings,
    pub display: DisplaySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub queue_capacity: usize,
    /// Log every processed frame at info level.
    pub diagnostics: bool,
    /// Pin the detection thread to this core.
    pub worker_core: Option<usize>,
    /// Capacity of the pipeline event channel.
    pub event_capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Synthetic,
    V4l2,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub source: SourceKind,
    /// Device path, or `auto` to probe for one.
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
    pub facing: Facing,
    /// Clockwise angle the sensor image must be rotated to appear upright
    /// on a device in its natural orientation.
    pub sensor_orientation: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplaySettings {
    pub width: u32,
    pub height: u32,
    /// Device rotation in degrees, snapped to quarter turns.
    pub rotation: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_CAPACITY,
            diagnostics: false,
            worker_core: None,
            event_capacity: 64,
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            source: SourceKind::Synthetic,
            device: "/dev/video0".into(),
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Nv21,
            buffer_count: 4,
            facing: Facing::Back,
            sensor_orientation: 90,
        }
    }
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            width: 480,
            height: 640,
            rotation: 0,
        }
    }
}

impl Settings {
    /// Layer defaults, an optional TOML file and `TAGVIEW__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Settings::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a TOML string on top of the defaults.
    pub fn from_toml(text: &str) -> Result<Self, SettingsError> {
        let settings: Settings = config::Config::builder()
            .add_source(config::Config::try_from(&Settings::default())?)
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        self.detector
            .validate()
            .map_err(|err| SettingsError::Invalid {
                key: "detector",
                reason: err.to_string(),
            })?;

        if self.pipeline.queue_capacity == 0 {
            return Err(SettingsError::Invalid {
                key: "pipeline.queue_capacity",
                reason: "must be at least 1".into(),
            });
        }
        if self.pipeline.event_capacity == 0 {
            return Err(SettingsError::Invalid {
                key: "pipeline.event_capacity",
                reason: "must be at least 1".into(),
            });
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(SettingsError::Invalid {
                key: "capture",
                reason: format!("empty capture size {}x{}", self.capture.width, self.capture.height),
            });
        }
        if self.capture.fps == 0 {
            return Err(SettingsError::Invalid {
                key: "capture.fps",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.pipeline.queue_capacity, 1);
        assert_eq!(settings.detector.tag_family, "tag36h11");
        assert_eq!(settings.detector.max_hamming, 2);
        assert!(!settings.pipeline.diagnostics);
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let settings = Settings::from_toml(
            r#"
            [detector]
            tag_family = "tag25h9"
            decimation = 4.0

            [pipeline]
            queue_capacity = 3
            diagnostics = true

            [capture]
            facing = "front"
            format = "gray8"
            "#,
        )
        .unwrap();

        assert_eq!(settings.detector.tag_family, "tag25h9");
        assert_eq!(settings.detector.decimation, 4.0);
        assert_eq!(settings.detector.blur_sigma, 0.0);
        assert_eq!(settings.pipeline.queue_capacity, 3);
        assert!(settings.pipeline.diagnostics);
        assert_eq!(settings.capture.facing, Facing::Front);
        assert_eq!(settings.capture.format, PixelFormat::Gray8);
        assert_eq!(settings.capture.width, 640);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let err = Settings::from_toml("[pipeline]\nqueue_capacity = 0\n").unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { key: "pipeline.queue_capacity", .. }));

        let err = Settings::from_toml("[detector]\ndecimation = 0.5\n").unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { key: "detector", .. }));
    }

    // The only test that sets `TAGVIEW__*` variables.
    #[test]
    fn test_load_layers_file_then_environment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tagview.toml");
        std::fs::write(
            &path,
            "[pipeline]\nqueue_capacity = 3\ndiagnostics = true\n\n[detector]\ntag_family = \"tag25h9\"\n",
        )
        .unwrap();

        let key = format!("{ENV_PREFIX}__PIPELINE__QUEUE_CAPACITY");
        std::env::set_var(&key, "5");
        let layered = Settings::load(Some(&path));
        std::env::set_var(&key, "0");
        let invalid = Settings::load(Some(&path));
        std::env::remove_var(&key);

        let settings = layered.unwrap();
        // Environment beats the file, the file beats the defaults.
        assert_eq!(settings.pipeline.queue_capacity, 5);
        assert!(settings.pipeline.diagnostics);
        assert_eq!(settings.detector.tag_family, "tag25h9");
        assert_eq!(settings.capture.width, 640);

        assert!(matches!(
            invalid,
            Err(SettingsError::Invalid { key: "pipeline.queue_capacity", .. })
        ));

        // Without overrides the file alone applies.
        assert_eq!(Settings::load(Some(&path)).unwrap().pipeline.queue_capacity, 3);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = Settings::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, SettingsError::Load(_)));
    }
}
