use image::{imageops::FilterType, DynamicImage, GenericImageView, Pixel, RgbImage};
use ndarray::Array3;
use tracing::instrument;

use crate::TextRegion;

/// Converts to a CHW float tensor with `(pixel / 255 - mean) / std` per channel.
#[instrument(level = "trace", skip(image))]
pub(crate) fn normalize_to_chw(
    image: &DynamicImage,
    mean_vals: &[f32; 3],
    std_vals: &[f32; 3],
) -> Array3<f32> {
    let image = image.to_rgb32f();
    Array3::<f32>::from_shape_fn(
        (3, image.height() as usize, image.width() as usize),
        |(ch, y, x)| {
            let pixel = image.get_pixel(x as u32, y as u32).channels()[ch];
            (pixel - mean_vals[ch]) / std_vals[ch]
        },
    )
}

/// Scales `image` to fit inside `width` × `height` and centers it on a black canvas.
pub(crate) fn letterbox(image: &DynamicImage, width: u32, height: u32) -> DynamicImage {
    let (src_width, src_height) = image.dimensions();
    if src_width == 0 || src_height == 0 {
        return DynamicImage::ImageRgb8(RgbImage::new(width, height));
    }

    let scale = (width as f32 / src_width as f32).min(height as f32 / src_height as f32);
    let scaled_width = ((src_width as f32 * scale).round() as u32).clamp(1, width);
    let scaled_height = ((src_height as f32 * scale).round() as u32).clamp(1, height);
    let resized = image
        .resize_exact(scaled_width, scaled_height, FilterType::Triangle)
        .to_rgb8();

    let mut canvas = RgbImage::new(width, height);
    let offset_x = (width - scaled_width) / 2;
    let offset_y = (height - scaled_height) / 2;
    image::imageops::overlay(&mut canvas, &resized, offset_x as i64, offset_y as i64);
    DynamicImage::ImageRgb8(canvas)
}

/// Cuts the area covered by `region` out of `image`. `None` when it covers no pixels.
pub(crate) fn crop_region(image: &DynamicImage, region: &TextRegion) -> Option<DynamicImage> {
    let rect = region.denormalize(image.width(), image.height());
    let x = (rect.min().x.floor().max(0.0) as u32).min(image.width());
    let y = (rect.min().y.floor().max(0.0) as u32).min(image.height());
    let right = (rect.max().x.ceil().max(0.0) as u32).min(image.width());
    let bottom = (rect.max().y.ceil().max(0.0) as u32).min(image.height());
    if right <= x || bottom <= y {
        log::trace!("Region {} covers no pixels, skipping", region.id);
        return None;
    }

    log::trace!("Slicing subimage to {rect:?}");
    Some(image.crop_imm(x, y, right - x, bottom - y))
}

pub(crate) fn sigmoid(value: f32) -> f32 {
    1.0 / (1.0 + (-value).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PixelRect;
    use image::Rgb;

    #[test]
    fn normalization_is_per_channel() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(2, 1, Rgb([255, 0, 51])));
        let tensor = normalize_to_chw(&image, &[0.5, 0.5, 0.2], &[0.5, 0.25, 0.1]);
        assert_eq!(tensor.dim(), (3, 1, 2));
        assert!((tensor[[0, 0, 1]] - 1.0).abs() < 1e-6);
        assert!((tensor[[1, 0, 0]] + 2.0).abs() < 1e-6);
        assert!(tensor[[2, 0, 0]].abs() < 1e-5);
    }

    #[test]
    fn letterbox_keeps_requested_size() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(40, 40, Rgb([200, 200, 200])));
        let boxed = letterbox(&image, 128, 32);
        assert_eq!(boxed.dimensions(), (128, 32));
        let rgb = boxed.to_rgb8();
        // square content is centered, the sides stay black
        assert_eq!(rgb.get_pixel(0, 16), &Rgb([0, 0, 0]));
        assert_eq!(rgb.get_pixel(64, 16), &Rgb([200, 200, 200]));
    }

    #[test]
    fn crop_follows_normalized_region() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(200, 100));
        let region = TextRegion {
            id: 0,
            rect: PixelRect::new(0, 0, 1, 1),
            coordinates: [[0.125, 0.25], [0.5, 0.25], [0.5, 0.75], [0.125, 0.75]],
            color: TextRegion::color_for(0),
        };
        let crop = crop_region(&image, &region).unwrap();
        assert_eq!(crop.dimensions(), (75, 50));

        let empty = TextRegion {
            coordinates: [[0.5, 0.5]; 4],
            ..region
        };
        assert!(crop_region(&image, &empty).is_none());
    }

    #[test]
    fn sigmoid_is_centered() {
        assert_eq!(sigmoid(0.0), 0.5);
        assert!(sigmoid(20.0) > 0.999);
        assert!(sigmoid(-20.0) < 0.001);
    }
}
