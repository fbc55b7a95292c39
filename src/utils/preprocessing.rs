//! Shared image preprocessing utilities
//!
//! Converts an image into the square NCHW tensor a segmentation model
//! expects and maps the model's output back onto the image's pixel grid.

use crate::{
    error::{PipelineError, Result},
    types::SegmentationMask,
};
use image::{DynamicImage, ImageBuffer, RgbImage};
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Tensor layout and normalization expected by a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingConfig {
    /// Side length of the square model input
    pub input_size: u32,
    /// Per-channel mean subtracted after scaling to 0-1
    pub normalization_mean: [f32; 3],
    /// Per-channel standard deviation divided after subtracting the mean
    pub normalization_std: [f32; 3],
    /// Fill color of the letterbox padding
    pub padding_color: [u8; 3],
}

impl PreprocessingConfig {
    #[must_use]
    pub fn new(input_size: u32, normalization_mean: [f32; 3], normalization_std: [f32; 3]) -> Self {
        Self {
            input_size,
            normalization_mean,
            normalization_std,
            padding_color: [255, 255, 255],
        }
    }
}

/// Mapping between image pixels and the letterboxed model canvas
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LetterboxTransform {
    /// Scale factor applied to the image
    pub scale: f32,
    /// Horizontal padding before the scaled image
    pub offset_x: u32,
    /// Vertical padding before the scaled image
    pub offset_y: u32,
    /// Scaled image size on the canvas
    pub scaled_width: u32,
    pub scaled_height: u32,
    /// Canvas (tensor) width
    pub canvas_width: u32,
    /// Canvas (tensor) height
    pub canvas_height: u32,
}

impl LetterboxTransform {
    /// Fit `image_dimensions` centered into a `canvas_width x canvas_height` canvas
    ///
    /// # Errors
    /// - `InvalidInput` for zero-sized images or canvases
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn fit(image_dimensions: (u32, u32), canvas_width: u32, canvas_height: u32) -> Result<Self> {
        let (width, height) = image_dimensions;
        if width == 0 || height == 0 || canvas_width == 0 || canvas_height == 0 {
            return Err(PipelineError::invalid_input(format!(
                "Cannot map {width}x{height} image onto {canvas_width}x{canvas_height} canvas"
            )));
        }

        let scale = (canvas_width as f32 / width as f32).min(canvas_height as f32 / height as f32);
        let scaled_width = ((width as f32 * scale).round() as u32).clamp(1, canvas_width);
        let scaled_height = ((height as f32 * scale).round() as u32).clamp(1, canvas_height);

        Ok(Self {
            scale,
            offset_x: (canvas_width - scaled_width) / 2,
            offset_y: (canvas_height - scaled_height) / 2,
            scaled_width,
            scaled_height,
            canvas_width,
            canvas_height,
        })
    }

    /// Canvas coordinate of an image pixel, `None` when it falls outside
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    #[must_use]
    #[inline]
    pub fn to_canvas(&self, x: u32, y: u32) -> Option<(usize, usize)> {
        let canvas_x = (x as f32 * self.scale).round() as u32 + self.offset_x;
        let canvas_y = (y as f32 * self.scale).round() as u32 + self.offset_y;
        (canvas_x < self.canvas_width && canvas_y < self.canvas_height)
            .then_some((canvas_x as usize, canvas_y as usize))
    }
}

/// Shared image preprocessing utilities
pub struct ImagePreprocessor;

impl ImagePreprocessor {
    /// Preprocess an image for model inference
    ///
    /// Converts to RGB, resizes preserving aspect ratio, centers the result
    /// on a padded square canvas and normalizes into a `1x3xSxS` tensor.
    ///
    /// # Errors
    /// - `InvalidInput` for zero-sized images or a zero input size
    pub fn preprocess(image: &DynamicImage, config: &PreprocessingConfig) -> Result<(Array4<f32>, LetterboxTransform)> {
        let rgb_image = image.to_rgb8();
        let transform = LetterboxTransform::fit(rgb_image.dimensions(), config.input_size, config.input_size)?;

        let resized = image::imageops::resize(
            &rgb_image,
            transform.scaled_width,
            transform.scaled_height,
            image::imageops::FilterType::Triangle,
        );

        let padding = config.padding_color;
        let mut canvas = ImageBuffer::from_pixel(config.input_size, config.input_size, image::Rgb(padding));
        image::imageops::replace(
            &mut canvas,
            &resized,
            i64::from(transform.offset_x),
            i64::from(transform.offset_y),
        );

        Ok((Self::canvas_to_tensor(&canvas, config), transform))
    }

    /// Convert canvas to normalized tensor
    fn canvas_to_tensor(canvas: &RgbImage, config: &PreprocessingConfig) -> Array4<f32> {
        let (width, height) = canvas.dimensions();
        let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

        #[allow(clippy::indexing_slicing)]
        // Safe: tensor dimensions pre-allocated to match canvas size
        for (x, y, pixel) in canvas.enumerate_pixels() {
            for channel in 0..3 {
                tensor[[0, channel, y as usize, x as usize]] = (f32::from(pixel[channel]) / 255.0
                    - config.normalization_mean[channel])
                    / config.normalization_std[channel];
            }
        }

        tensor
    }
}

/// Reads mask values out of a model output tensor
///
/// Works row range by row range so callers can interleave extraction with
/// yielding to the runtime.
#[derive(Debug)]
pub struct MaskExtractor<'a> {
    tensor: &'a Array4<f32>,
    transform: LetterboxTransform,
    dimensions: (u32, u32),
}

impl<'a> MaskExtractor<'a> {
    /// Validate the output tensor and compute the inverse mapping
    ///
    /// # Errors
    /// - `InvalidInput` unless the tensor has shape `1x1xHxW`
    pub fn new(tensor: &'a Array4<f32>, dimensions: (u32, u32)) -> Result<Self> {
        let shape = tensor.shape();
        let (batch, channels, height, width) = (shape[0], shape[1], shape[2], shape[3]);
        if batch != 1 || channels != 1 || height == 0 || width == 0 {
            return Err(PipelineError::invalid_input(format!(
                "Unexpected output tensor shape {shape:?}, expected [1, 1, H, W]"
            )));
        }
        let canvas_width = u32::try_from(width)
            .map_err(|_| PipelineError::invalid_input("Output tensor too wide"))?;
        let canvas_height = u32::try_from(height)
            .map_err(|_| PipelineError::invalid_input("Output tensor too tall"))?;

        Ok(Self {
            tensor,
            transform: LetterboxTransform::fit(dimensions, canvas_width, canvas_height)?,
            dimensions,
        })
    }

    /// Image rows to extract
    #[must_use]
    pub fn rows(&self) -> u32 {
        self.dimensions.1
    }

    /// Append mask bytes for `rows` to `out`
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn extract_rows(&self, rows: Range<u32>, out: &mut Vec<u8>) {
        let width = self.dimensions.0;
        for y in rows {
            for x in 0..width {
                let value = self
                    .transform
                    .to_canvas(x, y)
                    .and_then(|(cx, cy)| self.tensor.get([0, 0, cy, cx]).copied())
                    .unwrap_or(0.0);
                out.push((value.clamp(0.0, 1.0) * 255.0) as u8);
            }
        }
    }

    /// Extract the whole mask in one pass
    #[must_use]
    pub fn extract(&self) -> SegmentationMask {
        let (width, height) = self.dimensions;
        let mut data = Vec::with_capacity(width as usize * height as usize);
        self.extract_rows(0..height, &mut data);
        SegmentationMask::new(data, self.dimensions)
    }
}

/// Convert an output tensor to a mask at the original image dimensions
///
/// # Errors
/// - `InvalidInput` for an unexpected tensor shape
pub fn tensor_to_mask(tensor: &Array4<f32>, dimensions: (u32, u32)) -> Result<SegmentationMask> {
    Ok(MaskExtractor::new(tensor, dimensions)?.extract())
}
