//! Image I/O operations service
//!
//! File access for the CLI and for local intake, kept apart from the
//! processing code so the pipeline itself only ever sees bytes.

use crate::error::{PipelineError, Result};
use image::DynamicImage;
use std::path::Path;

/// Service for handling image file input/output operations
pub struct ImageIOService;

impl ImageIOService {
    /// Read the raw bytes of an image file
    ///
    /// # Errors
    /// - `Io` when the file is missing or unreadable
    pub async fn read_bytes<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
        let path_ref = path.as_ref();
        tokio::fs::read(path_ref)
            .await
            .map_err(|e| PipelineError::file_io_error("read image file", path_ref, &e))
    }

    /// Decode an image from memory using content-based format detection
    ///
    /// # Errors
    /// - `InvalidInput` when the bytes are not a decodable image
    pub fn load_from_bytes(bytes: &[u8]) -> Result<DynamicImage> {
        image::load_from_memory(bytes)
            .map_err(|e| PipelineError::invalid_input(format!("Failed to decode image ({} bytes): {e}", bytes.len())))
    }

    /// Read only the header of an encoded image to learn its dimensions
    ///
    /// # Errors
    /// - `InvalidInput` when the format is unknown or the header is corrupt
    pub fn probe_dimensions(bytes: &[u8]) -> Result<(u32, u32)> {
        image::ImageReader::new(std::io::Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| PipelineError::invalid_input(format!("Failed to read image header: {e}")))?
            .into_dimensions()
            .map_err(|e| PipelineError::invalid_input(format!("Failed to read image dimensions: {e}")))
    }

    /// Write encoded output, creating parent directories as needed
    ///
    /// # Errors
    /// - `Io` when the directory or the file cannot be written
    pub async fn write_bytes<P: AsRef<Path>>(path: P, bytes: &[u8]) -> Result<()> {
        let path_ref = path.as_ref();

        if let Some(parent) = path_ref.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::file_io_error("create output directory", parent, &e))?;
        }

        tokio::fs::write(path_ref, bytes)
            .await
            .map_err(|e| PipelineError::file_io_error("write output file", path_ref, &e))?;

        log::debug!("Wrote {} bytes to {}", bytes.len(), path_ref.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;
    use tempfile::TempDir;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::new(width, height))
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_probe_dimensions_reads_header() {
        assert_eq!(ImageIOService::probe_dimensions(&png_bytes(7, 3)).unwrap(), (7, 3));
    }

    #[test]
    fn test_load_from_bytes_rejects_garbage() {
        let err = ImageIOService::load_from_bytes(b"definitely not an image").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_write_creates_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("deeper").join("out.png");
        let bytes = png_bytes(2, 2);

        ImageIOService::write_bytes(&path, &bytes).await.unwrap();
        let read_back = ImageIOService::read_bytes(&path).await.unwrap();
        assert_eq!(read_back, bytes);
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let err = ImageIOService::read_bytes("/nonexistent/input.png").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("read image file"));
    }
}
