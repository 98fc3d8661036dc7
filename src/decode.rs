//! Turns per-position class scores from the recognition network into text.
//!
//! Two regimes are supported and must be chosen explicitly:
//! - [`DecodeMode::Ctc`]: a blank class separates emissions and runs of the same class
//!   collapse into one character.
//! - [`DecodeMode::Direct`]: every position emits its argmax token, optionally cut at an
//!   end-of-sequence token. Adjacent repeats are kept.

use std::{collections::HashMap, fmt, path::Path, str::FromStr};

use float_ord::FloatOrd;
use ndarray::{Array1, ArrayView1, ArrayView2, ArrayView3, Axis};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{
    error::{OcrError, Result},
    DecodedText,
};

/// Alphabet of the bundled latin recognizer. Its CTC blank sits right after the last
/// character, at index 126.
pub const LATIN_ALPHABET: &str = "0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~°£€¥¢฿àâéèêëîïôùûüçÀÂÉÈÊËÎÏÔÙÛÜÇ";

const DEFAULT_BEAM_WIDTH: usize = 3;

/// Classes less likely than this are not expanded during beam search.
const BEAM_PRUNE_PROBABILITY: f32 = 1e-4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
    tokens: Vec<String>,
}

impl Vocabulary {
    /// One token per character of `chars`.
    pub fn from_chars(chars: &str) -> Self {
        Self {
            tokens: chars.chars().map(String::from).collect(),
        }
    }

    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }

    /// Reads a keys file with one token per line.
    #[instrument(level = "debug", skip_all)]
    pub fn from_keys_file(path: impl AsRef<Path>) -> Result<Self> {
        let keys = std::fs::read_to_string(path.as_ref())?;
        let vocabulary = Self::from_tokens(keys.lines().map(|line| line.trim_end_matches('\r')));
        log::debug!(
            "Loaded {} tokens from {}",
            vocabulary.len(),
            path.as_ref().display()
        );
        Ok(vocabulary)
    }

    pub fn latin() -> Self {
        Self::from_chars(LATIN_ALPHABET)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Token at `index`, or `""` when the index has no entry.
    pub fn get(&self, index: usize) -> &str {
        self.tokens.get(index).map(String::as_str).unwrap_or("")
    }

    pub fn position(&self, token: &str) -> Option<usize> {
        self.tokens.iter().position(|it| it == token)
    }
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self::latin()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum DecodeMode {
    Ctc,
    Direct,
}

impl FromStr for DecodeMode {
    type Err = OcrError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ctc" => Ok(Self::Ctc),
            "direct" => Ok(Self::Direct),
            other => Err(OcrError::Config(format!(
                "unknown decoding mode `{other}`, expected `ctc` or `direct`"
            ))),
        }
    }
}

impl TryFrom<String> for DecodeMode {
    type Error = OcrError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl fmt::Display for DecodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ctc => f.write_str("ctc"),
            Self::Direct => f.write_str("direct"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum DecodingStrategy {
    #[default]
    Greedy,
    Beam,
}

impl FromStr for DecodingStrategy {
    type Err = OcrError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "greedy" => Ok(Self::Greedy),
            "beam" => Ok(Self::Beam),
            other => Err(OcrError::Config(format!(
                "unknown decoding strategy `{other}`, expected `greedy` or `beam`"
            ))),
        }
    }
}

impl TryFrom<String> for DecodingStrategy {
    type Error = OcrError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

fn default_beam_width() -> usize {
    DEFAULT_BEAM_WIDTH
}

/// Decoder settings. `mode` has no default; everything else does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecoderConfig {
    pub mode: DecodeMode,
    /// CTC blank class. Defaults to `vocabulary.len()`, a blank appended after the
    /// last token.
    #[serde(default)]
    pub blank_index: Option<usize>,
    /// End-of-sequence token for direct decoding.
    #[serde(default)]
    pub eos_token: Option<String>,
    #[serde(default, rename = "decodingStrategy")]
    pub strategy: DecodingStrategy,
    #[serde(default = "default_beam_width")]
    pub beam_width: usize,
}

impl DecoderConfig {
    pub fn new(mode: DecodeMode) -> Self {
        Self {
            mode,
            blank_index: None,
            eos_token: None,
            strategy: DecodingStrategy::Greedy,
            beam_width: DEFAULT_BEAM_WIDTH,
        }
    }

    pub fn ctc() -> Self {
        Self::new(DecodeMode::Ctc)
    }

    pub fn direct() -> Self {
        Self::new(DecodeMode::Direct)
    }

    pub fn with_blank_index(mut self, blank_index: usize) -> Self {
        self.blank_index = Some(blank_index);
        self
    }

    pub fn with_eos_token(mut self, token: impl Into<String>) -> Self {
        self.eos_token = Some(token.into());
        self
    }

    pub fn with_beam_search(mut self, width: usize) -> Self {
        self.strategy = DecodingStrategy::Beam;
        self.beam_width = width;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rules {
    Ctc { blank: usize },
    Direct { eos: Option<usize> },
}

/// What one class index does to the output under the decoding rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Emit,
    Skip,
    Stop,
}

impl Rules {
    /// Returns the step and the new "last emitted" class.
    fn step(&self, last: Option<usize>, class: usize) -> (Step, Option<usize>) {
        match *self {
            Rules::Ctc { blank } if class == blank => (Step::Skip, None),
            Rules::Ctc { .. } if last == Some(class) => (Step::Skip, last),
            Rules::Ctc { .. } => (Step::Emit, Some(class)),
            Rules::Direct { eos } if eos == Some(class) => (Step::Stop, last),
            Rules::Direct { .. } => (Step::Emit, Some(class)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SequenceDecoder {
    vocabulary: Vocabulary,
    rules: Rules,
    strategy: DecodingStrategy,
    beam_width: usize,
}

impl SequenceDecoder {
    pub fn new(vocabulary: Vocabulary, config: DecoderConfig) -> Result<Self> {
        let rules = match config.mode {
            DecodeMode::Ctc => {
                let blank = config.blank_index.unwrap_or(vocabulary.len());
                if blank.checked_add(1).is_none() {
                    return Err(OcrError::Config(format!(
                        "blank index {blank} leaves no room for a class dimension"
                    )));
                }
                Rules::Ctc { blank }
            }
            DecodeMode::Direct => {
                let eos = config
                    .eos_token
                    .as_deref()
                    .map(|token| {
                        vocabulary.position(token).ok_or_else(|| {
                            OcrError::Config(format!(
                                "end-of-sequence token `{token}` is not in the vocabulary"
                            ))
                        })
                    })
                    .transpose()?;
                Rules::Direct { eos }
            }
        };

        if config.strategy == DecodingStrategy::Beam && config.beam_width == 0 {
            return Err(OcrError::Config("beam width must be at least 1".to_string()));
        }
        if config.strategy == DecodingStrategy::Beam && config.mode == DecodeMode::Direct {
            log::debug!("Beam search has no effect on direct decoding, falling back to greedy.");
        }

        Ok(Self {
            vocabulary,
            rules,
            strategy: config.strategy,
            beam_width: config.beam_width,
        })
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    /// Width of the class dimension this decoder expects.
    pub fn num_classes(&self) -> usize {
        match self.rules {
            Rules::Ctc { blank } => self.vocabulary.len().max(blank + 1),
            Rules::Direct { .. } => self.vocabulary.len(),
        }
    }

    /// Applies the decoding rules to an already argmaxed class sequence.
    pub fn collapse_indices(&self, classes: &[usize]) -> String {
        let mut text = String::new();
        let mut last = None;
        for &class in classes {
            let (step, next) = self.rules.step(last, class);
            last = next;
            match step {
                Step::Emit => text.push_str(self.vocabulary.get(class)),
                Step::Skip => {}
                Step::Stop => break,
            }
        }
        text.trim().to_string()
    }

    /// Decodes one crop's `[sequence_length, classes]` scores.
    ///
    /// Empty input and a class dimension that doesn't match [`Self::num_classes`] decode to
    /// an empty result rather than an error, so one bad crop can't sink a batch.
    #[instrument(level = "trace", skip_all)]
    pub fn decode(&self, scores: ArrayView2<f32>) -> DecodedText {
        let (steps, classes) = scores.dim();
        if steps == 0 || classes == 0 {
            return DecodedText::empty();
        }
        if classes != self.num_classes() {
            log::warn!(
                "Recognizer produced {classes} classes but the decoder expects {}, skipping crop",
                self.num_classes()
            );
            return DecodedText::empty();
        }

        match (self.strategy, self.rules) {
            (DecodingStrategy::Beam, Rules::Ctc { blank }) => self.decode_beam(scores, blank),
            _ => self.decode_greedy(scores),
        }
    }

    /// Decodes a single-step `[classes]` score vector.
    pub fn decode_step(&self, scores: ArrayView1<f32>) -> DecodedText {
        self.decode(scores.insert_axis(Axis(0)))
    }

    /// Decodes every crop of a `[batch, sequence_length, classes]` tensor independently.
    #[instrument(level = "debug", skip_all)]
    pub fn decode_batch(&self, scores: ArrayView3<f32>) -> Vec<DecodedText> {
        scores
            .outer_iter()
            .map(|crop_scores| self.decode(crop_scores))
            .collect()
    }

    fn decode_greedy(&self, scores: ArrayView2<f32>) -> DecodedText {
        let mut text = String::new();
        let mut character_scores = Vec::new();
        let mut confidence = 1.0f32;
        let mut last = None;

        for row in scores.outer_iter() {
            let Some(class) = argmax_view(row) else {
                continue;
            };
            let (step, next) = self.rules.step(last, class);
            last = next;
            match step {
                Step::Emit => {
                    let token = self.vocabulary.get(class);
                    if token.is_empty() {
                        continue;
                    }
                    let probability = softmax_view(row)[class];
                    text.push_str(token);
                    character_scores.push(probability);
                    confidence *= probability;
                }
                Step::Skip => {}
                Step::Stop => break,
            }
        }

        finish(text, character_scores, confidence)
    }

    /// CTC prefix beam search. Paths that collapse to the same prefix pool their
    /// probability, so the winner can differ from the greedy path.
    fn decode_beam(&self, scores: ArrayView2<f32>, blank: usize) -> DecodedText {
        let prune = BEAM_PRUNE_PROBABILITY.ln();
        let mut beams = vec![Beam {
            prefix: Vec::new(),
            character_scores: Vec::new(),
            blank: 0.0,
            non_blank: f32::NEG_INFINITY,
        }];

        for row in scores.outer_iter() {
            let log_probs = softmax_view(row).mapv(f32::ln);
            // the best class is always expanded so a flat row can't empty the beam
            let best_class = argmax_view(row);
            let mut next = BeamSet::default();

            for beam in &beams {
                for (class, &log_p) in log_probs.iter().enumerate() {
                    if log_p < prune && Some(class) != best_class {
                        continue;
                    }
                    if class == blank {
                        let entry = next.entry(&beam.prefix, &beam.character_scores);
                        entry.blank = log_add(entry.blank, beam.total() + log_p);
                    } else if beam.prefix.last() == Some(&class) {
                        let entry = next.entry(&beam.prefix, &beam.character_scores);
                        entry.non_blank = log_add(entry.non_blank, beam.non_blank + log_p);

                        let entry = next.extended(beam, class, log_p);
                        entry.non_blank = log_add(entry.non_blank, beam.blank + log_p);
                    } else {
                        let entry = next.extended(beam, class, log_p);
                        entry.non_blank = log_add(entry.non_blank, beam.total() + log_p);
                    }
                }
            }

            beams = next.into_best(self.beam_width);
            if beams.is_empty() {
                return DecodedText::empty();
            }
        }

        let best = &beams[0];
        let text = best
            .prefix
            .iter()
            .map(|class| self.vocabulary.get(*class))
            .collect::<String>();
        finish(text, best.character_scores.clone(), best.total().exp())
    }
}

fn finish(text: String, character_scores: Vec<f32>, confidence: f32) -> DecodedText {
    let text = text.trim();
    if text.is_empty() {
        return DecodedText::empty();
    }
    let confidence = if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    };
    DecodedText {
        text: text.to_string(),
        confidence,
        character_scores,
    }
}

#[derive(Debug, Clone)]
struct Beam {
    prefix: Vec<usize>,
    character_scores: Vec<f32>,
    /// Log probability of the prefix with the last step being blank.
    blank: f32,
    /// Log probability of the prefix with the last step being its final class.
    non_blank: f32,
}

impl Beam {
    fn total(&self) -> f32 {
        log_add(self.blank, self.non_blank)
    }
}

/// Candidate beams for one step, merged by prefix and kept in insertion order.
#[derive(Default)]
struct BeamSet {
    beams: Vec<Beam>,
    index: HashMap<Vec<usize>, usize>,
}

impl BeamSet {
    fn entry(&mut self, prefix: &[usize], character_scores: &[f32]) -> &mut Beam {
        let position = match self.index.get(prefix) {
            Some(position) => *position,
            None => {
                self.beams.push(Beam {
                    prefix: prefix.to_vec(),
                    character_scores: character_scores.to_vec(),
                    blank: f32::NEG_INFINITY,
                    non_blank: f32::NEG_INFINITY,
                });
                self.index.insert(prefix.to_vec(), self.beams.len() - 1);
                self.beams.len() - 1
            }
        };
        &mut self.beams[position]
    }

    fn extended(&mut self, beam: &Beam, class: usize, log_p: f32) -> &mut Beam {
        let mut prefix = beam.prefix.clone();
        prefix.push(class);
        let mut character_scores = beam.character_scores.clone();
        character_scores.push(log_p.exp());
        self.entry(&prefix, &character_scores)
    }

    fn into_best(self, width: usize) -> Vec<Beam> {
        let mut beams = self.beams;
        // stable, so equal scores keep insertion order
        beams.sort_by_key(|beam| std::cmp::Reverse(FloatOrd(beam.total())));
        beams.truncate(width);
        beams
    }
}

fn log_add(a: f32, b: f32) -> f32 {
    if a == f32::NEG_INFINITY {
        return b;
    }
    if b == f32::NEG_INFINITY {
        return a;
    }
    let max = a.max(b);
    max + ((a - max).exp() + (b - max).exp()).ln()
}

fn sanitize(score: f32) -> f32 {
    if score.is_nan() {
        f32::NEG_INFINITY
    } else {
        score
    }
}

/// Index of the highest score. Ties go to the lowest index and NaN never wins.
pub fn argmax(scores: &[f32]) -> Option<usize> {
    argmax_view(ArrayView1::from(scores))
}

fn argmax_view(scores: ArrayView1<f32>) -> Option<usize> {
    scores
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (index, score)| {
            let score = sanitize(*score);
            match best {
                Some((_, best_score)) if FloatOrd(score) <= FloatOrd(best_score) => best,
                _ => Some((index, score)),
            }
        })
        .map(|(index, _)| index)
}

/// Numerically stable softmax: `exp(s_i - max) / Σ exp(s_j - max)`.
pub fn softmax(scores: &[f32]) -> Vec<f32> {
    softmax_view(ArrayView1::from(scores)).to_vec()
}

fn softmax_view(scores: ArrayView1<f32>) -> Array1<f32> {
    if scores.is_empty() {
        return Array1::zeros(0);
    }

    let max = scores
        .iter()
        .copied()
        .map(sanitize)
        .fold(f32::NEG_INFINITY, f32::max);

    if max == f32::INFINITY {
        let count = scores.iter().filter(|s| **s == f32::INFINITY).count() as f32;
        return scores.mapv(|s| if s == f32::INFINITY { 1.0 / count } else { 0.0 });
    }
    if max == f32::NEG_INFINITY {
        let uniform = 1.0 / scores.len() as f32;
        return scores.mapv(|_| uniform);
    }

    let exps = scores.mapv(|s| (sanitize(s) - max).exp());
    let sum = exps.sum();
    exps / sum
}

/// Trims each text, drops the empty ones and joins the rest with single spaces.
pub fn join_texts<'a>(texts: impl IntoIterator<Item = &'a str>) -> String {
    texts
        .into_iter()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Drops decoded results that are unlikely to be real text.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResultFilter {
    pub min_chars: usize,
    pub min_confidence: f32,
    pub require_alphanumeric: bool,
}

impl Default for ResultFilter {
    fn default() -> Self {
        Self {
            min_chars: 2,
            min_confidence: 0.3,
            require_alphanumeric: true,
        }
    }
}

impl ResultFilter {
    pub fn accepts(&self, decoded: &DecodedText) -> bool {
        decoded.text.chars().count() >= self.min_chars
            && decoded.confidence >= self.min_confidence
            && (!self.require_alphanumeric || decoded.text.chars().any(char::is_alphanumeric))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3};

    /// Scores where `classes[t]` wins position `t` by a wide margin.
    fn one_hot(classes: &[usize], width: usize) -> Array2<f32> {
        let mut scores = Array2::<f32>::from_elem((classes.len(), width), -10.0);
        for (t, class) in classes.iter().enumerate() {
            scores[[t, *class]] = 10.0;
        }
        scores
    }

    fn ctc(alphabet: &str) -> SequenceDecoder {
        SequenceDecoder::new(Vocabulary::from_chars(alphabet), DecoderConfig::ctc()).unwrap()
    }

    #[test]
    fn latin_alphabet_has_blank_at_126() {
        let decoder = SequenceDecoder::new(Vocabulary::latin(), DecoderConfig::ctc()).unwrap();
        assert_eq!(decoder.vocabulary().len(), 126);
        assert_eq!(decoder.num_classes(), 127);
    }

    #[test]
    fn blank_separates_repeated_characters() {
        let decoder = SequenceDecoder::new(
            Vocabulary::from_chars("abck"),
            DecoderConfig::ctc().with_blank_index(126),
        )
        .unwrap();
        assert_eq!(decoder.collapse_indices(&[3, 3, 126, 3]), "kk");
        assert_eq!(decoder.collapse_indices(&[3, 3, 3]), "k");
        assert_eq!(decoder.collapse_indices(&[0, 1, 1, 126, 2]), "abc");
    }

    #[test]
    fn all_blank_decodes_to_empty() {
        let decoder = ctc("ab");
        assert_eq!(decoder.collapse_indices(&[2; 12]), "");
        assert_eq!(decoder.collapse_indices(&[]), "");

        let decoded = decoder.decode(one_hot(&[2, 2, 2, 2], 3).view());
        assert_eq!(decoded, DecodedText::empty());
    }

    #[test]
    fn unknown_indices_emit_nothing() {
        let decoder = SequenceDecoder::new(
            Vocabulary::from_chars("ab"),
            DecoderConfig::ctc().with_blank_index(5),
        )
        .unwrap();
        assert_eq!(decoder.collapse_indices(&[0, 4, 1, 999]), "ab");
    }

    #[test]
    fn whitespace_is_trimmed() {
        let decoder = ctc(" hi");
        assert_eq!(decoder.collapse_indices(&[0, 1, 2, 3, 0]), "hi");
    }

    #[test]
    fn direct_mode_stops_at_eos() {
        let vocabulary = Vocabulary::from_tokens(["c", "a", "t", "<eos>", "x", "y", "z"]);
        let decoder =
            SequenceDecoder::new(vocabulary, DecoderConfig::direct().with_eos_token("<eos>"))
                .unwrap();
        assert_eq!(decoder.collapse_indices(&[0, 1, 2, 3, 4, 5, 6]), "cat");

        let decoded = decoder.decode(one_hot(&[0, 1, 2, 3, 4, 5, 6], 7).view());
        assert_eq!(decoded.text, "cat");
        assert_eq!(decoded.character_scores.len(), 3);
        assert!(decoded.confidence > 0.99);
    }

    #[test]
    fn direct_mode_keeps_repeats() {
        let decoder =
            SequenceDecoder::new(Vocabulary::from_chars("tre"), DecoderConfig::direct()).unwrap();
        assert_eq!(decoder.decode(one_hot(&[0, 1, 2, 2], 3).view()).text, "tree");
    }

    #[test]
    fn ctc_decode_from_scores() {
        let decoder = ctc("hel");
        // h h - e l - l l -
        let scores = one_hot(&[0, 0, 3, 1, 2, 3, 2, 2, 3], 4);
        let decoded = decoder.decode(scores.view());
        assert_eq!(decoded.text, "hell");
        assert_eq!(decoded.character_scores.len(), 4);
        assert!(decoded.confidence > 0.99 && decoded.confidence <= 1.0);
    }

    #[test]
    fn argmax_prefers_first_maximum() {
        assert_eq!(argmax(&[0.5, 0.5, 0.2]), Some(0));
        assert_eq!(argmax(&[0.1, 0.7, 0.7, 0.7]), Some(1));
        assert_eq!(argmax(&[f32::NAN, -3.0, -1.0]), Some(2));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn softmax_sums_to_one_and_ignores_shifts() {
        let inputs: [&[f32]; 4] = [
            &[1.0, 2.0, 3.0],
            &[-5.0, 0.0, 5.0, 10.0],
            &[1000.0, 1001.0, 999.0],
            &[-1e6, 1e6, 0.0],
        ];
        for scores in inputs {
            let probabilities = softmax(scores);
            let sum = probabilities.iter().sum::<f32>();
            assert!((sum - 1.0).abs() < 1e-6, "sum was {sum}");

            let shifted = scores.iter().map(|s| s + 42.0).collect::<Vec<_>>();
            for (a, b) in probabilities.iter().zip(softmax(&shifted)) {
                assert!((a - b).abs() < 1e-5);
            }
        }
        assert!(softmax(&[]).is_empty());
    }

    #[test]
    fn confidence_stays_in_range_for_huge_logits() {
        let decoder = ctc("ab");
        let mut scores = Array2::<f32>::zeros((6, 3));
        for t in 0..6 {
            scores[[t, t % 3]] = 1e30;
            scores[[t, (t + 1) % 3]] = -1e30;
        }
        for strategy in [DecoderConfig::ctc(), DecoderConfig::ctc().with_beam_search(3)] {
            let decoder = SequenceDecoder::new(decoder.vocabulary().clone(), strategy).unwrap();
            let decoded = decoder.decode(scores.view());
            assert!((0.0..=1.0).contains(&decoded.confidence));
        }

        let mut infinite = Array2::<f32>::zeros((2, 3));
        infinite[[0, 0]] = f32::INFINITY;
        infinite[[1, 1]] = f32::NAN;
        let decoded = decoder.decode(infinite.view());
        assert!((0.0..=1.0).contains(&decoded.confidence));
    }

    #[test]
    fn malformed_scores_decode_to_empty() {
        let decoder = ctc("ab");
        assert!(decoder.decode(Array2::<f32>::zeros((0, 3)).view()).is_empty());
        assert!(decoder.decode(Array2::<f32>::zeros((4, 0)).view()).is_empty());
        // wrong class dimension
        assert!(decoder.decode(one_hot(&[0, 1], 5).view()).is_empty());
    }

    #[test]
    fn single_step_scores() {
        let decoder = ctc("xyz");
        let scores = ndarray::arr1(&[0.1f32, 3.0, 0.2, 0.4]);
        assert_eq!(decoder.decode_step(scores.view()).text, "y");
    }

    #[test]
    fn batch_crops_decode_independently() {
        let decoder = ctc("ab");
        let mut scores = Array3::<f32>::from_elem((3, 3, 3), -10.0);
        for (crop, classes) in [[0, 2, 0], [1, 1, 1], [2, 2, 2]].iter().enumerate() {
            for (t, class) in classes.iter().enumerate() {
                scores[[crop, t, *class]] = 10.0;
            }
        }
        let decoded = decoder.decode_batch(scores.view());
        let texts = decoded.iter().map(|it| it.text.as_str()).collect::<Vec<_>>();
        assert_eq!(texts, ["aa", "b", ""]);
        assert_eq!(join_texts(texts), "aa b");
    }

    #[test]
    fn beam_search_pools_alignments() {
        // two steps of p(a) = 0.4, p(blank) = 0.6: greedy reads nothing, but the
        // alignments of "a" add up to 0.64
        let scores = ndarray::arr2(&[[0.4f32.ln(), 0.6f32.ln()], [0.4f32.ln(), 0.6f32.ln()]]);

        let greedy = ctc("a");
        assert_eq!(greedy.decode(scores.view()).text, "");

        let beam = SequenceDecoder::new(
            Vocabulary::from_chars("a"),
            DecoderConfig::ctc().with_beam_search(3),
        )
        .unwrap();
        let decoded = beam.decode(scores.view());
        assert_eq!(decoded.text, "a");
        assert!((decoded.confidence - 0.64).abs() < 1e-4);
    }

    #[test]
    fn beam_search_agrees_with_greedy_on_confident_scores() {
        let scores = one_hot(&[0, 0, 3, 1, 2, 3, 2, 2, 3], 4);
        let beam = SequenceDecoder::new(
            Vocabulary::from_chars("hel"),
            DecoderConfig::ctc().with_beam_search(3),
        )
        .unwrap();
        assert_eq!(beam.decode(scores.view()).text, ctc("hel").decode(scores.view()).text);
    }

    #[test]
    fn config_errors_are_loud() {
        assert!(matches!("attention".parse::<DecodeMode>(), Err(OcrError::Config(_))));
        assert_eq!(" CTC ".parse::<DecodeMode>().unwrap(), DecodeMode::Ctc);
        assert!("sampling".parse::<DecodingStrategy>().is_err());

        let zero_width = SequenceDecoder::new(
            Vocabulary::from_chars("ab"),
            DecoderConfig::ctc().with_beam_search(0),
        );
        assert!(matches!(zero_width, Err(OcrError::Config(_))));

        let missing_eos = SequenceDecoder::new(
            Vocabulary::from_chars("ab"),
            DecoderConfig::direct().with_eos_token("</s>"),
        );
        assert!(matches!(missing_eos, Err(OcrError::Config(_))));
    }

    #[test]
    fn config_requires_mode() {
        assert!(serde_json::from_str::<DecoderConfig>(r#"{"blankIndex": 3}"#).is_err());
        assert!(serde_json::from_str::<DecoderConfig>(r#"{"mode": "attention"}"#).is_err());

        let config: DecoderConfig =
            serde_json::from_str(r#"{"mode": "ctc", "blankIndex": 126, "decodingStrategy": "beam"}"#)
                .unwrap();
        assert_eq!(config.blank_index, Some(126));
        assert_eq!(config.strategy, DecodingStrategy::Beam);
        assert_eq!(config.beam_width, 3);
    }

    #[test]
    fn result_filter_rules() {
        let filter = ResultFilter::default();
        let decoded = |text: &str, confidence: f32| DecodedText {
            text: text.to_string(),
            confidence,
            character_scores: vec![],
        };
        assert!(filter.accepts(&decoded("ok", 0.9)));
        assert!(!filter.accepts(&decoded("k", 0.9)));
        assert!(!filter.accepts(&decoded("ok", 0.1)));
        assert!(!filter.accepts(&decoded("!?", 0.9)));
    }

    #[test]
    fn keys_file_has_one_token_per_line() {
        let path =
            std::env::temp_dir().join(format!("snaptext-keys-{}.txt", std::process::id()));
        std::fs::write(&path, "a\r\nb\n<eos>\n").unwrap();
        let vocabulary = Vocabulary::from_keys_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(vocabulary.len(), 3);
        assert_eq!(vocabulary.get(0), "a");
        assert_eq!(vocabulary.position("<eos>"), Some(2));
        assert_eq!(vocabulary.get(3), "");
        assert_eq!(Vocabulary::latin().len(), 126);
    }

    #[test]
    fn beam_survives_a_flat_row_in_a_large_vocabulary() {
        let vocabulary = Vocabulary::from_tokens((0..20_000).map(|i| format!("t{i}")));
        let classes = vocabulary.len() + 1;
        let mut scores = Array2::<f32>::zeros((2, classes));
        scores[[0, 7]] = 30.0;
        // every class of the second row sits below the pruning probability
        scores[[1, 3]] = 0.5;

        let greedy = SequenceDecoder::new(vocabulary.clone(), DecoderConfig::ctc()).unwrap();
        let beam =
            SequenceDecoder::new(vocabulary, DecoderConfig::ctc().with_beam_search(3)).unwrap();
        assert_eq!(greedy.decode(scores.view()).text, "t7t3");
        let decoded = beam.decode(scores.view());
        assert_eq!(decoded.text, "t7t3");
        assert!(decoded.confidence > 0.0);
    }

    #[test]
    fn blank_index_at_the_end_of_usize_is_rejected() {
        let decoder = SequenceDecoder::new(
            Vocabulary::from_chars("ab"),
            DecoderConfig::ctc().with_blank_index(usize::MAX),
        );
        assert!(matches!(decoder, Err(OcrError::Config(_))));
    }

    #[test]
    fn serde_and_from_str_accept_the_same_names() {
        for (mode, strategy) in [("ctc", "beam"), ("CTC", "BEAM"), (" Ctc ", " Beam ")] {
            let json = format!(r#"{{"mode": "{mode}", "decodingStrategy": "{strategy}"}}"#);
            let config: DecoderConfig = serde_json::from_str(&json).unwrap();
            assert_eq!(config.mode, mode.parse::<DecodeMode>().unwrap());
            assert_eq!(config.strategy, strategy.parse::<DecodingStrategy>().unwrap());
            assert_eq!(config.strategy, DecodingStrategy::Beam);
        }
        assert!(serde_json::from_str::<DecoderConfig>(r#"{"mode": "Attention"}"#).is_err());
        assert_eq!(serde_json::to_string(&DecodeMode::Direct).unwrap(), r#""direct""#);
    }

    #[test]
    fn beam_request_falls_back_to_greedy_in_direct_mode() {
        let vocabulary = Vocabulary::from_tokens(["<eos>", "a", "b"]);
        // greedy reads "abba"; a CTC beam would collapse the repeat
        let scores = one_hot(&[1, 2, 2, 1, 0, 1], 3);
        let greedy = SequenceDecoder::new(
            vocabulary.clone(),
            DecoderConfig::direct().with_eos_token("<eos>"),
        )
        .unwrap();
        let beam = SequenceDecoder::new(
            vocabulary,
            DecoderConfig::direct()
                .with_eos_token("<eos>")
                .with_beam_search(4),
        )
        .unwrap();

        let decoded = beam.decode(scores.view());
        assert_eq!(decoded.text, "abba");
        assert_eq!(decoded, greedy.decode(scores.view()));
    }
}
