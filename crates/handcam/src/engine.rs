//! The landmark detection engine and its configuration.
//!
//! The engine itself is opaque: it takes an upright image and a timestamp and returns the hands it
//! found. [`HandLandmarker`][crate::landmarker::HandLandmarker] drives it from a worker thread and
//! only ever talks to it through the [`Engine`] and [`EngineFactory`] traits. The configuration in
//! [`LandmarkerOptions`] is passed through without interpretation.

pub mod onnx;

use std::{
    env::{self, VarError},
    fmt,
    path::{Path, PathBuf},
};

use crate::{frame::Timestamp, image::Image, landmark::HandLandmarkerResult};

const ENV_VAR_MODEL: &str = "HANDCAM_MODEL";
const ENV_VAR_DELEGATE: &str = "HANDCAM_DELEGATE";

/// A constructed landmark detection engine.
pub trait Engine: Send {
    /// Runs detection on an upright image.
    ///
    /// `timestamp` is the capture time of the frame. Successive calls receive strictly increasing
    /// timestamps.
    fn detect(
        &mut self,
        image: &Image,
        timestamp: Timestamp,
    ) -> Result<HandLandmarkerResult, EngineError>;
}

/// Constructs [`Engine`]s from [`LandmarkerOptions`].
///
/// Construction is expected to fail when the model asset is missing or the requested [`Delegate`]
/// is not supported.
pub trait EngineFactory: Send + Sync {
    fn create(&self, options: &LandmarkerOptions) -> anyhow::Result<Box<dyn Engine>>;
}

impl<F> EngineFactory for F
where
    F: Fn(&LandmarkerOptions) -> anyhow::Result<Box<dyn Engine>> + Send + Sync,
{
    fn create(&self, options: &LandmarkerOptions) -> anyhow::Result<Box<dyn Engine>> {
        self(options)
    }
}

/// A per-frame detection failure reported by an [`Engine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError {
    message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for EngineError {}

impl From<anyhow::Error> for EngineError {
    fn from(e: anyhow::Error) -> Self {
        Self::new(format!("{e:#}"))
    }
}

/// Hardware backend the engine should run inference on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum Delegate {
    #[default]
    Cpu,
    Gpu,
}

impl Delegate {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "cpu" => Some(Self::Cpu),
            "gpu" => Some(Self::Gpu),
            _ => None,
        }
    }
}

/// Configuration of the hand landmark engine.
#[derive(Debug, Clone)]
pub struct LandmarkerOptions {
    model_asset_path: PathBuf,
    delegate: Delegate,
    num_hands: usize,
    min_hand_detection_confidence: f32,
    min_hand_presence_confidence: f32,
    min_tracking_confidence: f32,
}

impl Default for LandmarkerOptions {
    fn default() -> Self {
        Self {
            model_asset_path: PathBuf::from("hand_landmarker.task"),
            delegate: Delegate::Cpu,
            num_hands: 1,
            min_hand_detection_confidence: 0.5,
            min_hand_presence_confidence: 0.5,
            min_tracking_confidence: 0.5,
        }
    }
}

fn check_confidence(value: f32) {
    assert!(
        (0.0..=1.0).contains(&value),
        "confidence threshold must be between 0.0 and 1.0, got {value}"
    );
}

impl LandmarkerOptions {
    /// Sets the path of the model asset to load.
    #[inline]
    pub fn model_asset_path(self, path: impl Into<PathBuf>) -> Self {
        Self {
            model_asset_path: path.into(),
            ..self
        }
    }

    /// Selects the inference backend.
    ///
    /// If the engine does not support the backend, initialization will fail.
    #[inline]
    pub fn delegate(self, delegate: Delegate) -> Self {
        Self { delegate, ..self }
    }

    /// Sets the maximum number of hands to detect.
    ///
    /// # Panics
    ///
    /// Panics if `num_hands` is zero.
    pub fn num_hands(self, num_hands: usize) -> Self {
        assert!(num_hands > 0, "`num_hands` must be at least 1");
        Self { num_hands, ..self }
    }

    /// Sets the minimum confidence for the palm detection to be considered successful.
    pub fn min_hand_detection_confidence(self, confidence: f32) -> Self {
        check_confidence(confidence);
        Self {
            min_hand_detection_confidence: confidence,
            ..self
        }
    }

    /// Sets the minimum presence score for a hand to be reported.
    pub fn min_hand_presence_confidence(self, confidence: f32) -> Self {
        check_confidence(confidence);
        Self {
            min_hand_presence_confidence: confidence,
            ..self
        }
    }

    /// Sets the minimum confidence for hand tracking to be considered successful.
    ///
    /// Below this, the engine falls back to running palm detection on the next frame.
    pub fn min_tracking_confidence(self, confidence: f32) -> Self {
        check_confidence(confidence);
        Self {
            min_tracking_confidence: confidence,
            ..self
        }
    }

    /// Applies overrides from the `HANDCAM_MODEL` and `HANDCAM_DELEGATE` environment variables.
    ///
    /// Invalid values are logged and ignored.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|var| env::var(var))
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Result<String, VarError>) -> Self {
        match var(ENV_VAR_MODEL) {
            Ok(path) => {
                log::debug!("model override: `{}` is set to '{}'", ENV_VAR_MODEL, path);
                self.model_asset_path = path.into();
            }
            Err(VarError::NotPresent) => {}
            Err(VarError::NotUnicode(s)) => {
                log::warn!(
                    "ignoring invalid value set for `{}`: {}",
                    ENV_VAR_MODEL,
                    s.to_string_lossy()
                );
            }
        }

        match var(ENV_VAR_DELEGATE).as_deref() {
            Ok(name) => match Delegate::from_name(name) {
                Some(delegate) => {
                    log::debug!("delegate override: `{}` is set to '{}'", ENV_VAR_DELEGATE, name);
                    self.delegate = delegate;
                }
                None => log::warn!(
                    "ignoring invalid value set for `{}`: '{}' (expected `cpu` or `gpu`)",
                    ENV_VAR_DELEGATE,
                    name
                ),
            },
            Err(VarError::NotPresent) => {}
            Err(VarError::NotUnicode(s)) => {
                log::warn!(
                    "ignoring invalid value set for `{}`: {}",
                    ENV_VAR_DELEGATE,
                    s.to_string_lossy()
                );
            }
        }

        self
    }

    pub fn get_model_asset_path(&self) -> &Path {
        &self.model_asset_path
    }

    pub fn get_delegate(&self) -> Delegate {
        self.delegate
    }

    pub fn get_num_hands(&self) -> usize {
        self.num_hands
    }

    pub fn get_min_hand_detection_confidence(&self) -> f32 {
        self.min_hand_detection_confidence
    }

    pub fn get_min_hand_presence_confidence(&self) -> f32 {
        self.min_hand_presence_confidence
    }

    pub fn get_min_tracking_confidence(&self) -> f32 {
        self.min_tracking_confidence
    }
}
