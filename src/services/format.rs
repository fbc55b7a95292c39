//! Output format handling service
//!
//! Keeps encoder details out of the compositor and the normalizer. Every
//! encoder writes into a fresh `Vec<u8>`; callers never share buffers.

use crate::{
    config::{NormalizedFormat, OutputFormat},
    error::{PipelineError, Result},
};
use image::{
    codecs::{jpeg::JpegEncoder, png::PngEncoder},
    DynamicImage, ExtendedColorType, ImageEncoder, RgbaImage,
};

/// Service for encoding images into the pipeline's formats
pub struct OutputFormatHandler;

impl OutputFormatHandler {
    /// Encode an RGBA image in the requested output format
    ///
    /// # Arguments
    /// * `rgba_image` - Composited image with its alpha channel
    /// * `format` - Target output format
    ///
    /// # Errors
    /// - `CompositeFailed` when the encoder rejects the image or the format is
    ///   not compiled in
    pub fn encode_rgba(rgba_image: &RgbaImage, format: OutputFormat) -> Result<Vec<u8>> {
        let (width, height) = rgba_image.dimensions();
        let mut buffer = Vec::with_capacity(rgba_image.as_raw().len() / 2);

        match format {
            OutputFormat::Png => {
                PngEncoder::new(&mut buffer)
                    .write_image(rgba_image.as_raw(), width, height, ExtendedColorType::Rgba8)
                    .map_err(|e| PipelineError::composite(format!("PNG encoding failed: {e}")))?;
            },
            OutputFormat::WebP => Self::encode_webp(rgba_image, &mut buffer)?,
        }

        Ok(buffer)
    }

    #[cfg(feature = "webp-support")]
    fn encode_webp(rgba_image: &RgbaImage, buffer: &mut Vec<u8>) -> Result<()> {
        let (width, height) = rgba_image.dimensions();
        image::codecs::webp::WebPEncoder::new_lossless(buffer)
            .encode(rgba_image.as_raw(), width, height, ExtendedColorType::Rgba8)
            .map_err(|e| PipelineError::composite(format!("WebP encoding failed: {e}")))
    }

    #[cfg(not(feature = "webp-support"))]
    fn encode_webp(_rgba_image: &RgbaImage, _buffer: &mut Vec<u8>) -> Result<()> {
        Err(PipelineError::composite(
            "WebP output requires the webp-support feature",
        ))
    }

    /// Encode an image as a normalized rendition
    ///
    /// JPEG drops the alpha channel; PNG keeps it.
    ///
    /// # Errors
    /// - `NormalizationFailed` when the encoder rejects the image
    pub fn encode_normalized(image: &DynamicImage, format: NormalizedFormat, quality: u8) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        match format {
            NormalizedFormat::Jpeg => {
                let rgb = image.to_rgb8();
                JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
                    .encode(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
                    .map_err(|e| PipelineError::normalization(format!("JPEG encoding failed: {e}")))?;
            },
            NormalizedFormat::Png => {
                let rgba = image.to_rgba8();
                PngEncoder::new(&mut buffer)
                    .write_image(rgba.as_raw(), rgba.width(), rgba.height(), ExtendedColorType::Rgba8)
                    .map_err(|e| PipelineError::normalization(format!("PNG encoding failed: {e}")))?;
            },
        }
        Ok(buffer)
    }

    /// Get the file extension for an output format
    ///
    /// # Examples
    /// ```rust
    /// use bgremove_pipeline::{services::OutputFormatHandler, config::OutputFormat};
    ///
    /// assert_eq!(OutputFormatHandler::get_extension(OutputFormat::Png), "png");
    /// assert_eq!(OutputFormatHandler::get_extension(OutputFormat::WebP), "webp");
    /// ```
    #[must_use]
    pub fn get_extension(format: OutputFormat) -> &'static str {
        format.extension()
    }

    /// Check if a format keeps the alpha channel
    #[must_use]
    pub fn supports_transparency(format: OutputFormat) -> bool {
        match format {
            OutputFormat::Png | OutputFormat::WebP => true,
        }
    }

    /// Whether normalized renditions of this format keep transparency
    #[must_use]
    pub fn normalized_supports_transparency(format: NormalizedFormat) -> bool {
        matches!(format, NormalizedFormat::Png)
    }
}
