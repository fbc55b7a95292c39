//! Shared helpers for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bgremove_pipeline::{
    backends::test_utils::MockBackendFactory, FetchedImage, ImageFetcher, IncomingFile, PipelineConfig,
    PipelineConfigBuilder, PipelineError, Result, Session,
};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use reqwest::Url;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

/// Encode a synthetic gradient image
pub fn encoded(width: u32, height: u32, seed: u8, format: ImageFormat) -> Vec<u8> {
    let image = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x as u8).wrapping_add(seed), (y as u8).wrapping_mul(3), seed])
    });
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut bytes), format)
        .unwrap();
    bytes
}

pub fn png_file(name: &str, seed: u8) -> IncomingFile {
    IncomingFile::new(name, "image/png", encoded(64, 48, seed, ImageFormat::Png))
}

pub fn jpeg_file(name: &str, seed: u8) -> IncomingFile {
    IncomingFile::new(name, "image/jpeg", encoded(64, 48, seed, ImageFormat::Jpeg))
}

/// Serves canned responses keyed by URL; unknown URLs fail like a 404
#[derive(Default)]
pub struct StaticFetcher {
    responses: HashMap<String, FetchedImage>,
}

impl StaticFetcher {
    pub fn with(mut self, url: &str, bytes: Vec<u8>, content_type: Option<&str>) -> Self {
        self.responses.insert(
            url.to_string(),
            FetchedImage {
                bytes,
                content_type: content_type.map(str::to_string),
            },
        );
        self
    }
}

#[async_trait]
impl ImageFetcher for StaticFetcher {
    async fn fetch(&self, url: &Url, max_bytes: usize) -> Result<FetchedImage> {
        let response = self
            .responses
            .get(url.as_str())
            .cloned()
            .ok_or_else(|| PipelineError::fetch(format!("HTTP 404 for {url}")))?;
        if response.bytes.len() > max_bytes {
            return Err(PipelineError::TooLarge {
                size: response.bytes.len(),
                limit: max_bytes,
            });
        }
        Ok(response)
    }
}

/// Defaults suited to tests: no backoff between retries
pub fn test_config() -> PipelineConfigBuilder {
    PipelineConfig::builder().retries(1, 1).max_task_retries(2)
}

/// Route `log` output through the test harness; `RUST_LOG=debug` to see it
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn session_with(config: PipelineConfig, factory: MockBackendFactory, fetcher: StaticFetcher) -> Arc<Session> {
    init_logging();
    Arc::new(Session::with_components(config, Arc::new(factory), Arc::new(fetcher)).unwrap())
}

pub fn session(factory: MockBackendFactory) -> Arc<Session> {
    session_with(test_config().build().unwrap(), factory, StaticFetcher::default())
}
