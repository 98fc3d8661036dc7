use thiserror::Error;

/// Errors surfaced by the OCR pipeline.
///
/// Malformed recognition output and empty detections are not errors; they decode to
/// empty results. Only configuration mistakes and runtime/IO failures end up here.
#[derive(Debug, Error)]
pub enum OcrError {
    #[error("ONNX runtime error: {0}")]
    Runtime(#[from] ort::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected tensor shape: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("invalid configuration file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("model produced no output tensor: {0}")]
    MissingOutput(String),
}

pub type Result<T> = std::result::Result<T, OcrError>;
