//! A CPU [`Engine`] backed by an ONNX hand landmark network, run with `tract`.
//!
//! The network is expected to take a single NCHW RGB input in the `0.0..=1.0` range and to
//! produce screen landmarks (`[1, 63]`, in input pixels), a hand presence flag and a handedness
//! score as its first three outputs. The whole frame is stretched to the input size, so the hand
//! should fill a good part of the image. Only one hand is reported.

use std::path::Path;

use anyhow::{anyhow, bail};
use tract_onnx::prelude::{
    tract_ndarray, tvec, Framework, Graph, InferenceModelExt, SimplePlan, Tensor, TypedFact,
    TypedOp,
};

use crate::{
    frame::Timestamp,
    image::{Image, Resolution},
    landmark::{Hand, HandLandmarkerResult, Handedness, Landmark, NUM_LANDMARKS},
    timer::Timer,
};

use super::{Delegate, Engine, EngineError, EngineFactory, LandmarkerOptions};

type Model = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Creates [`OnnxEngine`]s.
///
/// Only [`Delegate::Cpu`] is supported; requesting the GPU makes initialization fail.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnnxFactory;

impl EngineFactory for OnnxFactory {
    fn create(&self, options: &LandmarkerOptions) -> anyhow::Result<Box<dyn Engine>> {
        if options.get_delegate() != Delegate::Cpu {
            bail!(
                "delegate {:?} is not supported by the ONNX engine",
                options.get_delegate()
            );
        }
        Ok(Box::new(OnnxEngine::load(
            options.get_model_asset_path(),
            options.get_min_hand_presence_confidence(),
        )?))
    }
}

pub struct OnnxEngine {
    model: Model,
    input_res: Resolution,
    min_presence: f32,
    t_infer: Timer,
}

impl OnnxEngine {
    /// Loads and optimizes the network at `path`.
    ///
    /// The path must have an `.onnx` extension.
    pub fn load(path: &Path, min_presence: f32) -> anyhow::Result<Self> {
        match path.extension() {
            Some(ext) if ext == "onnx" => {}
            _ => bail!(
                "model asset '{}' must have an `.onnx` extension",
                path.display()
            ),
        }

        let model = tract_onnx::onnx()
            .model_for_path(path)?
            .into_optimized()?
            .into_runnable()?;

        let fact = model.model().input_fact(0)?;
        let shape = fact
            .shape
            .as_concrete()
            .ok_or_else(|| anyhow!("model input shape {:?} is not fixed", fact.shape))?;
        let input_res = match *shape {
            [1, 3, h, w] => Resolution::new(w.try_into()?, h.try_into()?),
            _ => bail!("invalid model input shape {:?} (expected NCHW RGB)", shape),
        };

        log::info!(
            "loaded hand landmark model '{}' ({} input)",
            path.display(),
            input_res
        );

        Ok(Self {
            model,
            input_res,
            min_presence,
            t_infer: Timer::new("infer"),
        })
    }

    /// Returns the profiling timer for network inference.
    pub fn timer(&self) -> &Timer {
        &self.t_infer
    }

    fn input_tensor(&self, image: &Image) -> Tensor {
        let (w, h) = (
            self.input_res.width() as usize,
            self.input_res.height() as usize,
        );
        let (iw, ih) = (image.width(), image.height());
        tract_ndarray::Array4::from_shape_fn((1, 3, h, w), |(_, c, y, x)| {
            // Nearest neighbor sampling.
            let sx = ((x as f32 + 0.5) / w as f32 * iw as f32) as u32;
            let sy = ((y as f32 + 0.5) / h as f32 * ih as f32) as u32;
            image.get(sx.min(iw - 1), sy.min(ih - 1))[c] as f32 / 255.0
        })
        .into()
    }
}

fn first_value(values: &[f32], what: &str) -> Result<f32, EngineError> {
    values
        .first()
        .copied()
        .ok_or_else(|| EngineError::new(format!("model produced an empty {what} output")))
}

impl Engine for OnnxEngine {
    fn detect(
        &mut self,
        image: &Image,
        _timestamp: Timestamp,
    ) -> Result<HandLandmarkerResult, EngineError> {
        if image.resolution().is_empty() {
            return Err(EngineError::new("cannot run detection on an empty image"));
        }

        let input = self.input_tensor(image);
        let outputs = self
            .t_infer
            .time(|| self.model.run(tvec!(input.into())))?;
        if outputs.len() < 3 {
            return Err(EngineError::new(format!(
                "model produced {} outputs, expected at least 3",
                outputs.len()
            )));
        }

        let screen = outputs[0].as_slice::<f32>()?;
        let presence = first_value(outputs[1].as_slice::<f32>()?, "presence")?;
        let raw_handedness = first_value(outputs[2].as_slice::<f32>()?, "handedness")?;

        if screen.len() != NUM_LANDMARKS * 3 {
            return Err(EngineError::new(format!(
                "model produced {} landmark coordinates, expected {}",
                screen.len(),
                NUM_LANDMARKS * 3
            )));
        }

        if presence < self.min_presence {
            return Ok(HandLandmarkerResult::default());
        }

        let (w, h) = (
            self.input_res.width() as f32,
            self.input_res.height() as f32,
        );
        let mut landmarks = [Landmark::default(); NUM_LANDMARKS];
        for (out, xyz) in landmarks.iter_mut().zip(screen.chunks_exact(3)) {
            *out = Landmark::new(xyz[0] / w, xyz[1] / h, xyz[2] / w);
        }

        let (handedness, score) = if raw_handedness > 0.5 {
            (Handedness::Right, raw_handedness)
        } else {
            (Handedness::Left, 1.0 - raw_handedness)
        };

        Ok(HandLandmarkerResult::new(vec![Hand::new(
            landmarks, handedness, score,
        )]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_gpu_delegate() {
        let options = LandmarkerOptions::default()
            .model_asset_path("hand_landmark_full.onnx")
            .delegate(Delegate::Gpu);
        let err = OnnxFactory.create(&options).err().unwrap();
        assert!(err.to_string().contains("not supported"), "{err}");
    }

    #[test]
    fn rejects_non_onnx_assets() {
        let options = LandmarkerOptions::default();
        let err = OnnxFactory.create(&options).err().unwrap();
        assert!(err.to_string().contains(".onnx"), "{err}");
    }

    #[test]
    fn missing_model_fails() {
        let options = LandmarkerOptions::default().model_asset_path("does/not/exist.onnx");
        assert!(OnnxFactory.create(&options).is_err());
    }
}
