use std::path::Path;

use image::{imageops::FilterType, DynamicImage};
use ndarray::{Array2, Axis};
use ort::inputs;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{
    error::{OcrError, Result},
    session::{ExecutionProvider, ModelSession},
    util::{normalize_to_chw, sigmoid},
    TextDetector,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DetectorOptions {
    /// Side length of the square the image is resized to before detection.
    pub canvas_size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    /// Set for models that emit raw logits instead of probabilities.
    pub apply_sigmoid: bool,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            canvas_size: 1024,
            mean: [0.798, 0.785, 0.772],
            std: [0.264, 0.2749, 0.287],
            apply_sigmoid: false,
        }
    }
}

/// Differentiable-binarization text detector.
pub struct DbNet {
    model: ModelSession,
    options: DetectorOptions,
}

impl DbNet {
    #[instrument(level = "debug", skip(execution_providers))]
    pub fn init(
        path: &Path,
        num_threads: usize,
        execution_providers: &[ExecutionProvider],
        options: DetectorOptions,
    ) -> Result<Self> {
        if options.canvas_size == 0 {
            return Err(OcrError::Config(
                "detection canvas size must be positive".to_string(),
            ));
        }
        let model = ModelSession::load(path, num_threads, execution_providers)?;
        Ok(Self { model, options })
    }

    pub fn options(&self) -> &DetectorOptions {
        &self.options
    }
}

impl TextDetector for DbNet {
    #[instrument(skip(self, image), level = "debug")]
    fn probability_map(&self, image: &DynamicImage) -> Result<Array2<f32>> {
        let size = self.options.canvas_size;
        let image = image.resize_exact(size, size, FilterType::Triangle);
        let input_values =
            normalize_to_chw(&image, &self.options.mean, &self.options.std).insert_axis(Axis(0));

        let outputs = self
            .model
            .session
            .run(inputs![self.model.input_name.as_str() => input_values]?)?;
        let pred_mat = outputs
            .get(self.model.output_name.as_str())
            .ok_or_else(|| OcrError::MissingOutput(self.model.output_name.clone()))?
            .try_extract_tensor::<f32>()?;

        log::trace!("Detection output size: {:?}", pred_mat.shape());
        let ndim = pred_mat.ndim();
        if ndim < 2 {
            return Err(OcrError::MissingOutput(format!(
                "expected a 2D probability map, got shape {:?}",
                pred_mat.shape()
            )));
        }
        let height = pred_mat.len_of(Axis(ndim - 2));
        let width = pred_mat.len_of(Axis(ndim - 1));

        let mut pred_data = pred_mat.to_shape((height, width))?.to_owned();
        if self.options.apply_sigmoid {
            pred_data.mapv_inplace(sigmoid);
        }
        Ok(pred_data)
    }
}
