//! Face region extraction: crop a detected bounding box with padding.

use image::DynamicImage;

use crate::types::FaceBox;

/// Padding added around a detected box, as a fraction of its width/height.
const PADDING_RATIO: f32 = 0.3;

/// Crop the padded face region out of `image`.
///
/// The box is expanded by `round(0.3 × width)` horizontally and
/// `round(0.3 × height)` vertically on each side, then clamped to the image
/// bounds. This is a total function: degenerate input yields a degenerate
/// (at minimum 1×1) crop rather than an error — callers reject empty boxes
/// upstream at detection time.
pub fn extract_face_region(image: &DynamicImage, face: &FaceBox) -> DynamicImage {
    let (w, h) = (image.width() as i64, image.height() as i64);

    let pad_x = (PADDING_RATIO * face.width() as f32).round() as i64;
    let pad_y = (PADDING_RATIO * face.height() as f32).round() as i64;

    let x0 = (face.x1 as i64 - pad_x).clamp(0, (w - 1).max(0));
    let y0 = (face.y1 as i64 - pad_y).clamp(0, (h - 1).max(0));
    let x1 = (face.x2 as i64 + pad_x).clamp(0, w);
    let y1 = (face.y2 as i64 + pad_y).clamp(0, h);

    let crop_w = (x1 - x0).max(1) as u32;
    let crop_h = (y1 - y0).max(1) as u32;

    image.crop_imm(x0 as u32, y0 as u32, crop_w, crop_h)
}
