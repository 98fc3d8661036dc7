use std::path::Path;

use image::{imageops::FilterType, DynamicImage};
use ndarray::{s, Array3, Array4, Axis, Ix2, Ix3};
use ort::inputs;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{
    error::{OcrError, Result},
    session::{ExecutionProvider, ModelSession},
    util::{letterbox, normalize_to_chw},
    TextRecognizer,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RecognizerOptions {
    pub height: u32,
    pub width: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    /// Letterbox crops instead of stretching them to the input size.
    pub keep_aspect_ratio: bool,
}

impl Default for RecognizerOptions {
    fn default() -> Self {
        Self {
            height: 32,
            width: 128,
            mean: [0.694, 0.695, 0.693],
            std: [0.299, 0.296, 0.301],
            keep_aspect_ratio: true,
        }
    }
}

pub struct CrnnNet {
    model: ModelSession,
    options: RecognizerOptions,
}

impl CrnnNet {
    #[instrument(level = "debug", skip(execution_providers))]
    pub fn init(
        model_path: &Path,
        num_threads: usize,
        execution_providers: &[ExecutionProvider],
        options: RecognizerOptions,
    ) -> Result<Self> {
        if options.width == 0 || options.height == 0 {
            return Err(OcrError::Config(format!(
                "recognizer input size must be positive, got {}x{}",
                options.width, options.height
            )));
        }
        let model = ModelSession::load(model_path, num_threads, execution_providers)?;
        Ok(Self { model, options })
    }

    pub fn options(&self) -> &RecognizerOptions {
        &self.options
    }

    fn prepare(&self, image: &DynamicImage) -> DynamicImage {
        let RecognizerOptions { width, height, .. } = self.options;
        if self.options.keep_aspect_ratio {
            letterbox(image, width, height)
        } else {
            image.resize_exact(width, height, FilterType::Triangle)
        }
    }
}

impl TextRecognizer for CrnnNet {
    #[instrument(level = "debug", skip(self, images))]
    fn class_scores(&self, images: &[DynamicImage]) -> Result<Array3<f32>> {
        if images.is_empty() {
            return Ok(Array3::zeros((0, 0, 0)));
        }

        let (width, height) = (self.options.width as usize, self.options.height as usize);
        let mut batch = Array4::<f32>::zeros((images.len(), 3, height, width));
        for (i, image) in images.iter().enumerate() {
            let prepared = self.prepare(image);
            let tensor = normalize_to_chw(&prepared, &self.options.mean, &self.options.std);
            batch.slice_mut(s![i, .., .., ..]).assign(&tensor);
        }

        let outputs = self
            .model
            .session
            .run(inputs![self.model.input_name.as_str() => batch]?)?;
        let output_tensor = outputs
            .get(self.model.output_name.as_str())
            .ok_or_else(|| OcrError::MissingOutput(self.model.output_name.clone()))?
            .try_extract_tensor::<f32>()?;

        log::trace!("Recognition output size: {:?}", output_tensor.shape());
        match output_tensor.ndim() {
            // single-step models emit [batch, classes]
            2 => Ok(output_tensor
                .into_dimensionality::<Ix2>()?
                .insert_axis(Axis(1))
                .to_owned()),
            3 => Ok(output_tensor.into_dimensionality::<Ix3>()?.to_owned()),
            _ => Err(OcrError::MissingOutput(format!(
                "expected [batch, sequence, classes] scores, got shape {:?}",
                output_tensor.shape()
            ))),
        }
    }
}
