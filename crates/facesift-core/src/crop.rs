//! Padded face crops for the recognizer.
//!
//! The detector's box is grown by a fixed fraction of its own width/height
//! on every side, clipped to the image, then resized to the recognizer's
//! input resolution.

use crate::tensor::InputSpec;
use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;

/// Padding added on each side, as a fraction of the box width/height.
pub const FACE_PADDING_RATIO: f32 = 0.2;

/// Integer pixel region inside an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Grow `bbox` by `padding` on every side and clip to `image_width` × `image_height`.
///
/// Returns `None` when the clipped region is empty or the box is not finite.
pub fn padded_region(
    bbox: &BoundingBox,
    image_width: u32,
    image_height: u32,
    padding: f32,
) -> Option<CropRegion> {
    let coords = [bbox.x, bbox.y, bbox.width, bbox.height];
    if coords.iter().any(|v| !v.is_finite()) || bbox.width <= 0.0 || bbox.height <= 0.0 {
        return None;
    }

    let pad_x = bbox.width * padding;
    let pad_y = bbox.height * padding;

    let x0 = (bbox.x - pad_x).floor().max(0.0);
    let y0 = (bbox.y - pad_y).floor().max(0.0);
    let x1 = (bbox.x + bbox.width + pad_x).ceil().min(image_width as f32);
    let y1 = (bbox.y + bbox.height + pad_y).ceil().min(image_height as f32);

    if x1 <= x0 || y1 <= y0 {
        return None;
    }

    Some(CropRegion {
        x: x0 as u32,
        y: y0 as u32,
        width: (x1 - x0) as u32,
        height: (y1 - y0) as u32,
    })
}

/// Crop the padded face region and resize it to the model input size.
pub fn crop_face(image: &RgbImage, bbox: &BoundingBox, padding: f32, spec: &InputSpec) -> Option<RgbImage> {
    let region = padded_region(bbox, image.width(), image.height(), padding)?;
    let cropped = imageops::crop_imm(image, region.x, region.y, region.width, region.height).to_image();
    Some(imageops::resize(&cropped, spec.width, spec.height, FilterType::Triangle))
}
