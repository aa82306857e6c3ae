//! Fixed input contracts for the ONNX models.
//!
//! Each model declares the exact tensor it expects instead of having shapes
//! inferred at call sites. Preprocessing validates the image against the
//! contract before building the NCHW tensor.

use image::RgbImage;
use ndarray::Array4;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TensorError {
    #[error("input image is {actual_width}x{actual_height}, model expects {expected_width}x{expected_height}")]
    SizeMismatch {
        expected_width: u32,
        expected_height: u32,
        actual_width: u32,
        actual_height: u32,
    },
    #[error("normalization std must be positive, got {0}")]
    InvalidStd(f32),
}

/// Channel order of the planar tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLayout {
    RgbPlanar,
    BgrPlanar,
}

/// Per-pixel normalization: `(pixel - mean) / std`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    pub mean: f32,
    pub std: f32,
}

impl Normalization {
    pub fn apply(&self, pixel: u8) -> f32 {
        (pixel as f32 - self.mean) / self.std
    }
}

/// Input tensor contract for one model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputSpec {
    pub width: u32,
    pub height: u32,
    pub layout: ChannelLayout,
    pub normalization: Normalization,
}

impl InputSpec {
    /// Build a `[1, 3, height, width]` tensor from an image of exactly the
    /// contracted size.
    pub fn to_tensor(&self, image: &RgbImage) -> Result<Array4<f32>, TensorError> {
        if image.width() != self.width || image.height() != self.height {
            return Err(TensorError::SizeMismatch {
                expected_width: self.width,
                expected_height: self.height,
                actual_width: image.width(),
                actual_height: image.height(),
            });
        }
        if !(self.normalization.std > 0.0) {
            return Err(TensorError::InvalidStd(self.normalization.std));
        }

        let (w, h) = (self.width as usize, self.height as usize);
        let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
        let order: [usize; 3] = match self.layout {
            ChannelLayout::RgbPlanar => [0, 1, 2],
            ChannelLayout::BgrPlanar => [2, 1, 0],
        };

        for (x, y, pixel) in image.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for (plane, &channel) in order.iter().enumerate() {
                tensor[[0, plane, y, x]] = self.normalization.apply(pixel.0[channel]);
            }
        }

        Ok(tensor)
    }
}
