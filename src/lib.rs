use std::path::PathBuf;

use image::DynamicImage;
use ndarray::{Array2, Array3, Axis};
use tracing::instrument;

pub mod boxes;
pub mod config;
pub mod crnn_net;
pub mod dbnet;
pub mod decode;
mod error;
mod result;
mod session;
mod util;

pub use boxes::{BoxExtractor, ComponentFilter, ExtractorOptions};
pub use config::PipelineConfig;
pub use crnn_net::{CrnnNet, RecognizerOptions};
pub use dbnet::{DbNet, DetectorOptions};
pub use decode::{
    DecodeMode, DecoderConfig, DecodingStrategy, ResultFilter, SequenceDecoder, Vocabulary,
};
pub use error::{OcrError, Result};
pub use result::*;
pub use session::ExecutionProvider;

pub use ort as runtime;

use session::DEFAULT_PROVIDERS;
use util::crop_region;

/// Produces a text probability map for an image.
pub trait TextDetector {
    /// `[height, width]` map of per-pixel text probabilities.
    fn probability_map(&self, image: &DynamicImage) -> Result<Array2<f32>>;
}

/// Produces per-position class scores for a batch of text crops.
pub trait TextRecognizer {
    /// `[batch, sequence_length, classes]` scores, one row per input crop.
    fn class_scores(&self, images: &[DynamicImage]) -> Result<Array3<f32>>;
}

impl<T: TextDetector + ?Sized> TextDetector for &T {
    fn probability_map(&self, image: &DynamicImage) -> Result<Array2<f32>> {
        (**self).probability_map(image)
    }
}

impl<T: TextRecognizer + ?Sized> TextRecognizer for &T {
    fn class_scores(&self, images: &[DynamicImage]) -> Result<Array3<f32>> {
        (**self).class_scores(images)
    }
}

pub struct TextSnapBuilder {
    threads: usize,
    det_path: Option<PathBuf>,
    rec_path: Option<PathBuf>,
    keys_path: Option<PathBuf>,
    vocabulary: Option<Vocabulary>,
    decoder: Option<DecoderConfig>,
    extractor: ExtractorOptions,
    detector: DetectorOptions,
    recognizer: RecognizerOptions,
    result_filter: Option<ResultFilter>,
    batch_size: usize,
    execution_providers: Vec<ExecutionProvider>,
}

impl TextSnapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn det_model(mut self, path: impl Into<PathBuf>) -> Self {
        self.det_path = Some(path.into());
        self
    }

    pub fn rec_model(mut self, path: impl Into<PathBuf>) -> Self {
        self.rec_path = Some(path.into());
        self
    }

    /// Reads the vocabulary from a keys file, one token per line.
    pub fn keys(mut self, path: impl Into<PathBuf>) -> Self {
        self.keys_path = Some(path.into());
        self
    }

    pub fn vocabulary(mut self, vocabulary: Vocabulary) -> Self {
        self.vocabulary = Some(vocabulary);
        self
    }

    pub fn decoder(mut self, decoder: DecoderConfig) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn extractor(mut self, extractor: ExtractorOptions) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn result_filter(mut self, filter: Option<ResultFilter>) -> Self {
        self.result_filter = filter;
        self
    }

    /// Takes every setting from `config`. Model paths, threads and providers are kept.
    pub fn config(mut self, config: PipelineConfig) -> Self {
        if let Some(keys_path) = config.vocabulary {
            self.keys_path = Some(keys_path);
        }
        self.decoder = Some(config.decoder);
        self.extractor = config.extractor;
        self.detector = config.detector;
        self.recognizer = config.recognizer;
        self.result_filter = config.result_filter;
        self.batch_size = config.batch_size;
        self
    }

    pub fn with_execution_providers(
        mut self,
        providers: impl IntoIterator<Item = ExecutionProvider>,
    ) -> Self {
        self.execution_providers = providers.into_iter().collect();
        self
    }

    fn load_vocabulary(&mut self) -> Result<Vocabulary> {
        if let Some(vocabulary) = self.vocabulary.take() {
            return Ok(vocabulary);
        }
        match self.keys_path.take() {
            Some(path) => Vocabulary::from_keys_file(path),
            None => Ok(Vocabulary::latin()),
        }
    }

    #[instrument(skip(self), level = "debug")]
    fn init_models(&mut self) -> Result<(DbNet, CrnnNet)> {
        let det_path = self
            .det_path
            .take()
            .unwrap_or_else(|| "models/db_mobilenet_v2/model.onnx".into());
        let rec_path = self
            .rec_path
            .take()
            .unwrap_or_else(|| "models/crnn_mobilenet_v2/model.onnx".into());
        Ok((
            DbNet::init(
                &det_path,
                self.threads,
                &self.execution_providers,
                self.detector.clone(),
            )?,
            CrnnNet::init(
                &rec_path,
                self.threads,
                &self.execution_providers,
                self.recognizer.clone(),
            )?,
        ))
    }

    #[instrument(skip(self))]
    pub fn build(mut self) -> Result<TextSnap> {
        let decoder = self.decoder.take().ok_or_else(|| {
            OcrError::Config("a decoding mode (ctc or direct) must be chosen".to_string())
        })?;
        let mut config = PipelineConfig::new(decoder);
        config.extractor = self.extractor;
        config.detector = self.detector.clone();
        config.recognizer = self.recognizer.clone();
        config.result_filter = self.result_filter;
        config.batch_size = self.batch_size;
        config.validate()?;

        let vocabulary = self.load_vocabulary()?;
        let (detector, recognizer) = self.init_models()?;
        TextSnap::from_parts(detector, recognizer, vocabulary, &config)
    }
}

impl Default for TextSnapBuilder {
    fn default() -> Self {
        Self {
            threads: 4,
            det_path: None,
            rec_path: None,
            keys_path: None,
            vocabulary: None,
            decoder: None,
            extractor: ExtractorOptions::default(),
            detector: DetectorOptions::default(),
            recognizer: RecognizerOptions::default(),
            result_filter: None,
            batch_size: 32,
            execution_providers: DEFAULT_PROVIDERS.to_vec(),
        }
    }
}

/// Detection, region extraction, recognition and decoding for one image at a time.
pub struct TextSnap<D = DbNet, R = CrnnNet> {
    detector: D,
    recognizer: R,
    extractor: BoxExtractor,
    decoder: SequenceDecoder,
    result_filter: Option<ResultFilter>,
    batch_size: usize,
}

impl<D: TextDetector, R: TextRecognizer> TextSnap<D, R> {
    pub fn from_parts(
        detector: D,
        recognizer: R,
        vocabulary: Vocabulary,
        config: &PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            detector,
            recognizer,
            extractor: BoxExtractor::new(config.extractor)?,
            decoder: SequenceDecoder::new(vocabulary, config.decoder.clone())?,
            result_filter: config.result_filter,
            batch_size: config.batch_size,
        })
    }

    pub fn decoder(&self) -> &SequenceDecoder {
        &self.decoder
    }

    /// Returns one result per detected region, in region order.
    #[instrument(skip(self, image))]
    pub fn recognize(&self, image: &DynamicImage) -> Result<Vec<OcrResult>> {
        let map = self.detector.probability_map(image)?;
        let (map_height, map_width) = map.dim();
        let regions = self
            .extractor
            .extract(map.view(), map_width as u32, map_height as u32);
        log::debug!("{} text regions detected", regions.len());

        let crops = regions
            .into_iter()
            .filter_map(|region| crop_region(image, &region).map(|crop| (region, crop)))
            .collect::<Vec<_>>();

        let mut results = Vec::with_capacity(crops.len());
        for chunk in crops.chunks(self.batch_size) {
            let images = chunk
                .iter()
                .map(|(_, crop)| crop.clone())
                .collect::<Vec<_>>();
            let scores = self.recognizer.class_scores(&images)?;
            if scores.len_of(Axis(0)) != images.len() {
                log::warn!(
                    "Recognizer returned {} rows for {} crops",
                    scores.len_of(Axis(0)),
                    images.len()
                );
            }
            let mut texts = self.decoder.decode_batch(scores.view());
            texts.resize_with(images.len(), DecodedText::empty);

            results.extend(
                chunk
                    .iter()
                    .zip(texts)
                    .map(|((bounds, _), text)| OcrResult {
                        bounds: bounds.clone(),
                        text,
                    }),
            );
        }

        if let Some(filter) = &self.result_filter {
            let before = results.len();
            results.retain(|result| filter.accepts(&result.text));
            log::debug!("Result filter dropped {}", before - results.len());
        }
        Ok(results)
    }

    /// Recognized text of the whole image, joined with single spaces.
    pub fn recognize_text(&self, image: &DynamicImage) -> Result<String> {
        let results = self.recognize(image)?;
        Ok(decode::join_texts(
            results.iter().map(|result| result.text.text.as_str()),
        ))
    }
}
