//! Turns a detection probability map into padded, normalized text regions.
//!
//! The map is binarized at a threshold, split into 8-connected components, the
//! component rectangles are filtered (and optionally merged and sorted), and each
//! survivor is inflated by [`padding_offset`] before being normalized against the
//! detection canvas.

use image::{GrayImage, Luma};
use imageproc::region_labelling::{connected_components, Connectivity};
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{
    error::{OcrError, Result},
    PixelRect, TextRegion,
};

const PADDING_FACTOR: f32 = 1.8;

/// Finds connected foreground regions in a binary mask (non-zero pixels are foreground).
pub trait ComponentFinder {
    /// Tight bounding rectangle of every component, in discovery order.
    fn find_components(&self, mask: &GrayImage) -> Vec<PixelRect>;
}

/// 8-connected labelling backed by imageproc. Components come out in raster order of
/// their first pixel.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelledComponents;

impl ComponentFinder for LabelledComponents {
    #[instrument(level = "trace", skip_all)]
    fn find_components(&self, mask: &GrayImage) -> Vec<PixelRect> {
        let labels = connected_components(mask, Connectivity::Eight, Luma([0u8]));

        // (min_x, min_y, max_x, max_y) per label, label 1 at index 0
        let mut bounds: Vec<(u32, u32, u32, u32)> = Vec::new();
        for (x, y, label) in labels.enumerate_pixels() {
            let label = label[0] as usize;
            if label == 0 {
                continue;
            }
            if bounds.len() < label {
                bounds.resize(label, (u32::MAX, u32::MAX, 0, 0));
            }
            let entry = &mut bounds[label - 1];
            entry.0 = entry.0.min(x);
            entry.1 = entry.1.min(y);
            entry.2 = entry.2.max(x);
            entry.3 = entry.3.max(y);
        }

        bounds
            .into_iter()
            .filter(|(min_x, _, _, _)| *min_x != u32::MAX)
            .map(|(x0, y0, x1, y1)| PixelRect::new(x0, y0, x1 - x0 + 1, y1 - y0 + 1))
            .collect()
    }
}

/// Rejection rules applied to component rectangles.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ComponentFilter {
    /// Components with `width <= min_width` are dropped.
    pub min_width: u32,
    /// Components with `height <= min_height` are dropped.
    pub min_height: u32,
    /// Allowed `width / height` range, inclusive.
    pub aspect_ratio: Option<(f32, f32)>,
    pub min_area: Option<u64>,
    /// Largest accepted area as a fraction of the whole map.
    pub max_area_fraction: Option<f32>,
}

impl Default for ComponentFilter {
    fn default() -> Self {
        Self {
            min_width: 2,
            min_height: 2,
            aspect_ratio: None,
            min_area: None,
            max_area_fraction: None,
        }
    }
}

impl ComponentFilter {
    /// Also rejects extreme aspect ratios, specks and blobs covering most of the canvas.
    pub fn strict() -> Self {
        Self {
            aspect_ratio: Some((0.1, 10.0)),
            min_area: Some(16),
            max_area_fraction: Some(0.3),
            ..Self::default()
        }
    }

    pub fn accepts(&self, rect: &PixelRect, map_width: u32, map_height: u32) -> bool {
        if rect.width <= self.min_width || rect.height <= self.min_height {
            return false;
        }
        if let Some((min_ratio, max_ratio)) = self.aspect_ratio {
            let ratio = rect.aspect_ratio();
            if ratio < min_ratio || ratio > max_ratio {
                return false;
            }
        }
        if let Some(min_area) = self.min_area {
            if rect.area() < min_area {
                return false;
            }
        }
        if let Some(fraction) = self.max_area_fraction {
            let limit = fraction as f64 * map_width as f64 * map_height as f64;
            if rect.area() as f64 > limit {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExtractorOptions {
    /// A pixel is foreground iff its probability is strictly above this.
    pub threshold: f32,
    pub filter: ComponentFilter,
    /// Merge rectangles whose IoU reaches this value. Off when `None`.
    pub merge_iou: Option<f32>,
    /// Sort regions top-to-bottom, then left-to-right, instead of discovery order.
    pub sort_reading_order: bool,
}

impl Default for ExtractorOptions {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            filter: ComponentFilter::default(),
            merge_iou: None,
            sort_reading_order: false,
        }
    }
}

impl ExtractorOptions {
    pub fn validate(&self) -> Result<()> {
        if !(self.threshold > 0.0 && self.threshold < 1.0) {
            return Err(OcrError::Config(format!(
                "binarization threshold must lie in (0, 1), got {}",
                self.threshold
            )));
        }
        if let Some(iou) = self.merge_iou {
            if !(iou > 0.0 && iou <= 1.0) {
                return Err(OcrError::Config(format!(
                    "merge IoU must lie in (0, 1], got {iou}"
                )));
            }
        }
        if let Some((min_ratio, max_ratio)) = self.filter.aspect_ratio {
            if min_ratio > max_ratio {
                return Err(OcrError::Config(format!(
                    "aspect ratio bounds are reversed: {min_ratio} > {max_ratio}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct BoxExtractor<F = LabelledComponents> {
    options: ExtractorOptions,
    finder: F,
}

impl BoxExtractor<LabelledComponents> {
    pub fn new(options: ExtractorOptions) -> Result<Self> {
        Self::with_finder(options, LabelledComponents)
    }
}

impl<F: ComponentFinder> BoxExtractor<F> {
    pub fn with_finder(options: ExtractorOptions, finder: F) -> Result<Self> {
        options.validate()?;
        Ok(Self { options, finder })
    }

    pub fn options(&self) -> &ExtractorOptions {
        &self.options
    }

    /// Extracts regions from `map`, normalizing coordinates against a `width` × `height`
    /// canvas.
    #[instrument(level = "debug", skip(self, map))]
    pub fn extract(&self, map: ArrayView2<f32>, width: u32, height: u32) -> Vec<TextRegion> {
        let (map_height, map_width) = map.dim();
        if map_width == 0 || map_height == 0 || width == 0 || height == 0 {
            log::debug!("Empty probability map or canvas, no regions.");
            return Vec::new();
        }

        let mask = binarize(map, self.options.threshold);
        let components = self.finder.find_components(&mask);
        let found = components.len();

        let mut rects = components
            .into_iter()
            .filter(|rect| {
                self.options
                    .filter
                    .accepts(rect, map_width as u32, map_height as u32)
            })
            .collect::<Vec<_>>();
        log::trace!("{} of {found} components passed the filter", rects.len());

        if let Some(iou) = self.options.merge_iou {
            rects = merge_overlapping(rects, iou);
        }
        if self.options.sort_reading_order {
            rects.sort_by_key(|rect| (rect.y, rect.x));
        }

        rects
            .into_iter()
            .enumerate()
            .map(|(id, rect)| transform_bounding_box(id, rect, width, height))
            .collect()
    }
}

/// One-shot extraction with the default component filter rules and the given minimum
/// dimensions. Fails only on an invalid threshold.
pub fn extract_bounding_boxes(
    map: ArrayView2<f32>,
    width: u32,
    height: u32,
    threshold: f32,
    (min_width, min_height): (u32, u32),
) -> Result<Vec<TextRegion>> {
    let extractor = BoxExtractor::new(ExtractorOptions {
        threshold,
        filter: ComponentFilter {
            min_width,
            min_height,
            ..ComponentFilter::default()
        },
        ..ExtractorOptions::default()
    })?;
    Ok(extractor.extract(map, width, height))
}

pub fn binarize(map: ArrayView2<f32>, threshold: f32) -> GrayImage {
    let (height, width) = map.dim();
    GrayImage::from_fn(width as u32, height as u32, |x, y| {
        if map[[y as usize, x as usize]] > threshold {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

/// Padding applied to every side of `rect`: the area over half the perimeter, scaled
/// by 1.8. Grows linearly with the rectangle at a fixed aspect ratio.
pub fn padding_offset(rect: &PixelRect) -> f32 {
    let (width, height) = (rect.width as f32, rect.height as f32);
    if width + height == 0.0 {
        return 0.0;
    }
    (width * height * PADDING_FACTOR) / (2.0 * (width + height))
}

/// Pads `rect`, clamps each edge into `[0, size - 1]` and normalizes the corners by the
/// canvas size. Corners are ordered TL, TR, BR, BL. An axis of size 0 normalizes to 0.
pub fn transform_bounding_box(id: usize, rect: PixelRect, width: u32, height: u32) -> TextRegion {
    let offset = padding_offset(&rect);
    let normalize = |value: f32, size: u32| {
        if size == 0 {
            return 0.0;
        }
        value.clamp(0.0, (size - 1) as f32) / size as f32
    };

    let left = normalize(rect.x as f32 - offset, width);
    let right = normalize(rect.right().saturating_sub(1) as f32 + offset, width);
    let top = normalize(rect.y as f32 - offset, height);
    let bottom = normalize(rect.bottom().saturating_sub(1) as f32 + offset, height);

    TextRegion {
        id,
        rect,
        coordinates: [[left, top], [right, top], [right, bottom], [left, bottom]],
        color: TextRegion::color_for(id),
    }
}

fn merge_overlapping(mut rects: Vec<PixelRect>, min_iou: f32) -> Vec<PixelRect> {
    let mut merged = true;
    while merged {
        merged = false;
        'search: for i in 0..rects.len() {
            for j in (i + 1)..rects.len() {
                if rects[i].iou(&rects[j]) >= min_iou {
                    rects[i] = rects[i].union(&rects[j]);
                    rects.remove(j);
                    merged = true;
                    break 'search;
                }
            }
        }
    }
    rects
}
