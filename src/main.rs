use std::{path::PathBuf, time::Instant};

use clap::Parser;
use snaptext::{
    DecodeMode, DecoderConfig, OcrReport, PipelineConfig, ResultFilter, TextSnapBuilder,
};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

/// Reads the text in an image and prints a JSON report.
#[derive(Parser, Debug)]
#[command(name = "snaptext", version, about)]
struct Cli {
    /// Image to recognize.
    image: PathBuf,

    /// Detection model (ONNX).
    #[arg(long, default_value = "models/db_mobilenet_v2/model.onnx")]
    det_model: PathBuf,

    /// Recognition model (ONNX).
    #[arg(long, default_value = "models/crnn_mobilenet_v2/model.onnx")]
    rec_model: PathBuf,

    /// Vocabulary file, one token per line. Defaults to the latin alphabet.
    #[arg(long)]
    keys: Option<PathBuf>,

    /// Pipeline configuration (JSON). Overrides the decoding flags below.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Decoding mode of the recognition model: `ctc` or `direct`.
    #[arg(long)]
    mode: Option<String>,

    /// CTC blank class index.
    #[arg(long)]
    blank_index: Option<usize>,

    /// End-of-sequence token for direct decoding.
    #[arg(long)]
    eos_token: Option<String>,

    /// Use CTC beam search with this many beams.
    #[arg(long)]
    beam_width: Option<usize>,

    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Drop short, low-confidence or non-alphanumeric results.
    #[arg(long)]
    filter: bool,
}

impl Cli {
    fn pipeline_config(&self) -> snaptext::Result<PipelineConfig> {
        if let Some(path) = &self.config {
            return PipelineConfig::from_json_file(path);
        }

        let mode = match &self.mode {
            Some(mode) => mode.parse::<DecodeMode>()?,
            None => {
                return Err(snaptext::OcrError::Config(
                    "pass --mode ctc|direct or a --config file".to_string(),
                ))
            }
        };
        let mut decoder = DecoderConfig::new(mode);
        if let Some(blank_index) = self.blank_index {
            decoder = decoder.with_blank_index(blank_index);
        }
        if let Some(eos_token) = &self.eos_token {
            decoder = decoder.with_eos_token(eos_token.clone());
        }
        if let Some(beam_width) = self.beam_width {
            decoder = decoder.with_beam_search(beam_width);
        }

        let mut config = PipelineConfig::new(decoder);
        if self.filter {
            config.result_filter = Some(ResultFilter::default());
        }
        Ok(config)
    }
}

fn main() -> snaptext::Result<()> {
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = cli.pipeline_config()?;
    if config.vocabulary.is_none() {
        config.vocabulary = cli.keys.clone();
    }

    let image = image::open(&cli.image)?;
    let ocr = TextSnapBuilder::new()
        .det_model(&cli.det_model)
        .rec_model(&cli.rec_model)
        .threads(cli.threads)
        .config(config)
        .build()?;

    let start = Instant::now();
    let results = ocr.recognize(&image)?;
    log::debug!("Recognition took {:?}", start.elapsed());
    log::debug!("{results:#?}");

    let report = OcrReport::new(&results);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
