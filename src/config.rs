use std::{fs, path::Path, path::PathBuf};

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{
    boxes::ExtractorOptions,
    crnn_net::RecognizerOptions,
    dbnet::DetectorOptions,
    decode::{DecoderConfig, ResultFilter},
    error::{OcrError, Result},
};

const DEFAULT_BATCH_SIZE: usize = 32;

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

/// Everything the pipeline needs apart from the model files themselves.
///
/// Only `decoder.mode` is required when loading from JSON; the rest falls back to the
/// defaults of the bundled models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    pub decoder: DecoderConfig,
    #[serde(default)]
    pub extractor: ExtractorOptions,
    #[serde(default)]
    pub detector: DetectorOptions,
    #[serde(default)]
    pub recognizer: RecognizerOptions,
    #[serde(default)]
    pub result_filter: Option<ResultFilter>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Keys file with one token per line. The latin alphabet is used when unset.
    #[serde(default)]
    pub vocabulary: Option<PathBuf>,
}

impl PipelineConfig {
    pub fn new(decoder: DecoderConfig) -> Self {
        Self {
            decoder,
            extractor: ExtractorOptions::default(),
            detector: DetectorOptions::default(),
            recognizer: RecognizerOptions::default(),
            result_filter: None,
            batch_size: DEFAULT_BATCH_SIZE,
            vocabulary: None,
        }
    }

    #[instrument(level = "debug")]
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(OcrError::Config("batch size must be positive".to_string()));
        }
        self.extractor.validate()
    }
}
