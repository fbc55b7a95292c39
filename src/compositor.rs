//! Mask compositing
//!
//! Writes the segmentation mask into the alpha channel of a fresh RGBA copy
//! of the image and encodes the result. Work is split into row chunks that
//! yield to the runtime between them, so compositing a large image never
//! monopolizes a worker thread.

use crate::{
    config::{MaskConvention, OutputFormat, ProcessingConstraints},
    error::{PipelineError, Result},
    services::{
        progress::{ProcessingStage, TaskProgress},
        OutputFormatHandler,
    },
    types::{CompositeImage, NormalizedImage, SegmentationMask},
    utils::yielding::YieldingWorkLoop,
};
use image::{DynamicImage, Rgba, RgbaImage};
use std::borrow::Cow;
use std::ops::Range;
use tracing::{debug, instrument};

/// Combines images with their masks
#[derive(Debug, Clone)]
pub struct Compositor {
    chunk_pixels: usize,
    convention: MaskConvention,
    output_format: OutputFormat,
}

impl Compositor {
    #[must_use]
    pub fn new(chunk_pixels: usize, convention: MaskConvention, output_format: OutputFormat) -> Self {
        Self {
            chunk_pixels: chunk_pixels.max(1),
            convention,
            output_format,
        }
    }

    #[must_use]
    pub fn from_constraints(constraints: &ProcessingConstraints) -> Self {
        Self::new(
            constraints.composite_chunk_pixels,
            constraints.mask_convention,
            constraints.output_format,
        )
    }

    #[must_use]
    pub fn convention(&self) -> MaskConvention {
        self.convention
    }

    #[must_use]
    pub fn output_format(&self) -> OutputFormat {
        self.output_format
    }

    /// Composite a normalized image with its mask and encode the result
    ///
    /// Neither input is modified. A mask whose dimensions differ from the
    /// image is resampled first.
    ///
    /// # Errors
    /// - `InvalidInput` when the image cannot be decoded
    /// - `CompositeFailed` for an inconsistent mask or an encoder failure
    /// - `Cancelled` when the task is cancelled between chunks
    #[instrument(skip_all, fields(task = %progress.task_id(), width = image.width, height = image.height))]
    pub async fn composite(
        &self,
        image: &NormalizedImage,
        mask: &SegmentationMask,
        progress: &TaskProgress,
    ) -> Result<CompositeImage> {
        progress.stage(ProcessingStage::Compositing);
        let source = image.decode()?;
        let mask = fit_mask(mask, (source.width(), source.height()))?;
        let source = source.to_rgba8();
        let (width, height) = source.dimensions();
        let mut output = RgbaImage::new(width, height);

        let rows_per_chunk = (self.chunk_pixels / width.max(1) as usize).max(1);
        let chunks = YieldingWorkLoop::new(rows_per_chunk)
            .with_cancellation(progress.cancellation().clone())
            .run(height as usize, |rows| {
                self.composite_rows(&source, &mask, &mut output, rows.start as u32..rows.end as u32);
                progress.report_fraction(ProcessingStage::Compositing, rows.end as f32 / height as f32);
            })
            .await?;

        let bytes = OutputFormatHandler::encode_rgba(&output, self.output_format)?;
        debug!(chunks, encoded_bytes = bytes.len(), "composite encoded");
        Ok(CompositeImage {
            bytes,
            width,
            height,
            format: self.output_format,
        })
    }

    /// Synchronous composite without encoding
    ///
    /// # Errors
    /// - `CompositeFailed` for a mask inconsistent with its dimensions
    pub fn apply_mask(&self, image: &DynamicImage, mask: &SegmentationMask) -> Result<RgbaImage> {
        let mask = fit_mask(mask, (image.width(), image.height()))?;
        let source = image.to_rgba8();
        let (width, height) = source.dimensions();
        let mut output = RgbaImage::new(width, height);
        self.composite_rows(&source, &mask, &mut output, 0..height);
        Ok(output)
    }

    fn composite_rows(&self, source: &RgbaImage, mask: &SegmentationMask, output: &mut RgbaImage, rows: Range<u32>) {
        let width = source.width();
        for y in rows {
            for x in 0..width {
                let pixel = source.get_pixel(x, y);
                let index = y as usize * width as usize + x as usize;
                let mask_value = mask.data.get(index).copied().unwrap_or(0);
                let alpha = combine_alpha(self.convention.alpha(mask_value), pixel[3]);

                let composited = if alpha == 0 {
                    Rgba([0, 0, 0, 0])
                } else {
                    Rgba([pixel[0], pixel[1], pixel[2], alpha])
                };
                output.put_pixel(x, y, composited);
            }
        }
    }
}

/// Mask alpha scaled by the source pixel's own alpha
#[inline]
fn combine_alpha(mask_alpha: u8, source_alpha: u8) -> u8 {
    ((u16::from(mask_alpha) * u16::from(source_alpha) + 127) / 255) as u8
}

fn fit_mask(mask: &SegmentationMask, dimensions: (u32, u32)) -> Result<Cow<'_, SegmentationMask>> {
    let (width, height) = mask.dimensions;
    if mask.data.len() != width as usize * height as usize {
        return Err(PipelineError::composite(format!(
            "Mask has {} samples for {}x{}",
            mask.data.len(),
            width,
            height
        )));
    }
    if mask.dimensions == dimensions {
        Ok(Cow::Borrowed(mask))
    } else {
        debug!(from = ?mask.dimensions, to = ?dimensions, "resampling mask");
        mask.resize(dimensions.0, dimensions.1).map(Cow::Owned)
    }
}
