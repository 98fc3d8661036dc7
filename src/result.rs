use std::time::{SystemTime, UNIX_EPOCH};

use geo::{coord, LineString, Polygon, Rect};
use serde::{Deserialize, Serialize};

use crate::decode::join_texts;

/// Display colors handed out to regions in id order.
const PALETTE: [&str; 8] = [
    "#e6194b", "#3cb44b", "#4363d8", "#f58231", "#911eb4", "#42d4f4", "#f032e6", "#9a6324",
];

/// Axis-aligned rectangle in mask-pixel space. `x + width` and `y + height` are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn aspect_ratio(&self) -> f32 {
        if self.height == 0 {
            return f32::INFINITY;
        }
        self.width as f32 / self.height as f32
    }

    /// Intersection-over-union, 0 for disjoint or empty rectangles.
    pub fn iou(&self, other: &PixelRect) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());
        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }

        let intersection = (x2 - x1) as u64 * (y2 - y1) as u64;
        let union = self.area() + other.area() - intersection;
        if union == 0 {
            0.0
        } else {
            intersection as f32 / union as f32
        }
    }

    /// Smallest rectangle covering both.
    pub fn union(&self, other: &PixelRect) -> PixelRect {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        PixelRect {
            x,
            y,
            width: self.right().max(other.right()) - x,
            height: self.bottom().max(other.bottom()) - y,
        }
    }
}

/// A padded text region. `coordinates` holds the TL, TR, BR, BL corners normalized to
/// `[0, 1]` against the detection canvas; `rect` is the unpadded component it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextRegion {
    pub id: usize,
    pub rect: PixelRect,
    pub coordinates: [[f32; 2]; 4],
    pub color: String,
}

impl TextRegion {
    pub(crate) fn color_for(id: usize) -> String {
        PALETTE[id % PALETTE.len()].to_string()
    }

    pub fn top_left(&self) -> [f32; 2] {
        self.coordinates[0]
    }

    pub fn bottom_right(&self) -> [f32; 2] {
        self.coordinates[2]
    }

    /// Scales the normalized quad back to an image of the given size.
    pub fn denormalize(&self, width: u32, height: u32) -> Rect<f32> {
        let [x1, y1] = self.top_left();
        let [x2, y2] = self.bottom_right();
        Rect::new(
            coord! { x: x1 * width as f32, y: y1 * height as f32 },
            coord! { x: x2 * width as f32, y: y2 * height as f32 },
        )
    }

    pub fn to_geo_polygon(&self) -> Polygon<f32> {
        let points = self
            .coordinates
            .iter()
            .map(|[x, y]| coord! { x: *x, y: *y })
            .collect::<Vec<_>>();
        Polygon::new(LineString::new(points), vec![])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecodedText {
    pub text: String,
    pub confidence: f32,
    /// Softmax probability of every position that emitted a character.
    pub character_scores: Vec<f32>,
}

impl DecodedText {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrResult {
    pub bounds: TextRegion,
    pub text: DecodedText,
}

/// Record of one capture, as submitted by the demo front end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrReport {
    /// Milliseconds since the unix epoch.
    pub timestamp: u64,
    pub text: String,
    pub bounding_boxes: Vec<TextRegion>,
}

impl OcrReport {
    pub fn new(results: &[OcrResult]) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default();

        Self {
            timestamp,
            text: join_texts(results.iter().map(|it| it.text.text.as_str())),
            bounding_boxes: results.iter().map(|it| it.bounds.clone()).collect(),
        }
    }
}
