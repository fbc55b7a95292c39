//! Image intake and validation
//!
//! Entry point for every image: local files, members of a multi-file upload
//! and remote URLs. Validation happens before anything is allocated, so a
//! rejected input leaves no task and no reference behind.

use crate::{
    config::UploadConstraints,
    error::{PipelineError, Result},
    lifecycle::{LifecycleManager, RefScope, ResourceOwner},
    services::ImageIOService,
    types::{ImageSource, ImageTask, TaskId},
    utils::mime::{canonical_mime, detect_image_format, is_unspecified, mime_from_extension},
};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Url};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Raw upload as received from the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingFile {
    pub name: String,
    /// Declared MIME type; empty or `application/octet-stream` when unknown
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl IncomingFile {
    #[must_use]
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }

    /// Read a file from disk, typing it by signature and then by extension
    ///
    /// # Errors
    /// - `Io` when the file cannot be read
    pub async fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = ImageIOService::read_bytes(path).await?;
        let mime_type = detect_image_format(&bytes)
            .or_else(|| mime_from_extension(path))
            .unwrap_or("application/octet-stream");
        let name = path
            .file_name()
            .map_or_else(|| "image".to_string(), |n| n.to_string_lossy().into_owned());
        Ok(Self::new(name, mime_type, bytes))
    }
}

/// Body and content type of a fetched image
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Retrieves remote images
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Fetch `url`, giving up once the body exceeds `max_bytes`
    ///
    /// # Errors
    /// - `FetchFailed` for network and HTTP errors
    /// - `TooLarge` when the body exceeds `max_bytes`
    async fn fetch(&self, url: &Url, max_bytes: usize) -> Result<FetchedImage>;
}

/// [`ImageFetcher`] backed by `reqwest`
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Create a fetcher with a request timeout
    ///
    /// # Errors
    /// - `FetchFailed` when the HTTP client cannot be built
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::fetch(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ImageFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url, max_bytes: usize) -> Result<FetchedImage> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| PipelineError::fetch(format!("Failed to fetch {url}: {e}")))?;

        if !response.status().is_success() {
            return Err(PipelineError::fetch(format!(
                "HTTP error {} for {url}",
                response.status()
            )));
        }

        if let Some(length) = response.content_length() {
            if length > max_bytes as u64 {
                return Err(PipelineError::TooLarge {
                    size: usize::try_from(length).unwrap_or(usize::MAX),
                    limit: max_bytes,
                });
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let mut bytes = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| PipelineError::fetch(format!("Failed to read body of {url}: {e}")))?;
            if bytes.len() + chunk.len() > max_bytes {
                return Err(PipelineError::TooLarge {
                    size: bytes.len() + chunk.len(),
                    limit: max_bytes,
                });
            }
            bytes.extend_from_slice(&chunk);
        }

        Ok(FetchedImage { bytes, content_type })
    }
}

/// Validates uploads and turns them into pending tasks
pub struct ImageIntake {
    constraints: UploadConstraints,
    lifecycle: Arc<LifecycleManager>,
    fetcher: Arc<dyn ImageFetcher>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for ImageIntake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageIntake")
            .field("constraints", &self.constraints)
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}

impl ImageIntake {
    #[must_use]
    pub fn new(constraints: UploadConstraints, lifecycle: Arc<LifecycleManager>, fetcher: Arc<dyn ImageFetcher>) -> Self {
        Self {
            constraints,
            lifecycle,
            fetcher,
            next_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn constraints(&self) -> &UploadConstraints {
        &self.constraints
    }

    /// Check an upload against the constraints without accepting it
    ///
    /// # Errors
    /// - `InvalidInput` for an empty buffer
    /// - `InvalidType` for a type outside the allow-list or a declared type
    ///   contradicting the content
    /// - `TooLarge` above the byte limit
    pub fn validate(&self, file: &IncomingFile) -> Result<()> {
        self.resolve_mime(file).map(drop)
    }

    /// Validate and return the effective MIME type
    fn resolve_mime(&self, file: &IncomingFile) -> Result<String> {
        if file.bytes.is_empty() {
            return Err(PipelineError::invalid_input(format!("{} is empty", file.name)));
        }

        let sniffed = detect_image_format(&file.bytes);
        let mime_type = if is_unspecified(&file.mime_type) {
            sniffed
                .map(str::to_string)
                .ok_or_else(|| PipelineError::invalid_type(format!("{}: unrecognized content", file.name)))?
        } else {
            let declared = canonical_mime(&file.mime_type);
            if let Some(actual) = sniffed.filter(|actual| *actual != declared) {
                return Err(PipelineError::invalid_type(format!(
                    "{}: declared {declared} but content is {actual}",
                    file.name
                )));
            }
            declared
        };

        if !self.constraints.allows(&mime_type) {
            return Err(PipelineError::invalid_type(format!(
                "{}: {mime_type} is not allowed",
                file.name
            )));
        }

        if file.bytes.len() > self.constraints.max_bytes {
            return Err(PipelineError::TooLarge {
                size: file.bytes.len(),
                limit: self.constraints.max_bytes,
            });
        }

        Ok(mime_type)
    }

    /// Validate an upload and create a pending task for it
    ///
    /// The task's display URL references the original buffer; it is owned
    /// by the task and released when the task is deleted.
    ///
    /// # Errors
    /// - Any validation error; nothing is allocated in that case
    #[instrument(skip(self, file), fields(name = %file.name, bytes = file.bytes.len()))]
    pub fn accept(&self, file: IncomingFile, source: ImageSource) -> Result<ImageTask> {
        let mime_type = self.resolve_mime(&file)?;
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let original = Arc::new(file.bytes);

        let mut task = ImageTask::new(id, source, file.name, mime_type, Arc::clone(&original));
        task.display_url = Some(
            self.lifecycle
                .allocate(ResourceOwner::Task(id), RefScope::Owner, original)?,
        );
        debug!(task = %id, mime = %task.mime_type, "accepted image");
        Ok(task)
    }

    /// Accept a single user-picked file
    ///
    /// # Errors
    /// - Any validation error
    pub fn accept_local(&self, file: IncomingFile) -> Result<ImageTask> {
        self.accept(file, ImageSource::LocalFile)
    }

    /// Accept the members of a multi-file upload independently
    #[must_use]
    pub fn accept_batch(&self, files: Vec<IncomingFile>) -> Vec<Result<ImageTask>> {
        files
            .into_iter()
            .enumerate()
            .map(|(index, file)| self.accept(file, ImageSource::BatchMember { index }))
            .collect()
    }

    /// Fetch a remote image and accept it
    ///
    /// # Errors
    /// - `InvalidInput` for malformed or non-HTTP(S) URLs
    /// - `FetchFailed` for network errors
    /// - Any validation error of the fetched content
    pub async fn accept_url(&self, url: &str) -> Result<ImageTask> {
        let parsed = Url::parse(url.trim())
            .map_err(|e| PipelineError::invalid_input(format!("Invalid URL '{url}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(PipelineError::invalid_input(format!(
                "Unsupported URL scheme '{}'",
                parsed.scheme()
            )));
        }

        let fetched = self.fetcher.fetch(&parsed, self.constraints.max_bytes).await?;
        let name = parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|segment| !segment.is_empty())
            .unwrap_or("image")
            .to_string();

        let file = IncomingFile::new(name, fetched.content_type.unwrap_or_default(), fetched.bytes);
        self.accept(file, ImageSource::RemoteUrl { url: parsed.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::types::TaskStatus;
    use image::{DynamicImage, ImageFormat, RgbImage};
    use std::io::Cursor;
    use std::sync::Mutex;

    fn encoded(format: ImageFormat) -> Vec<u8> {
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::new(4, 4))
            .write_to(&mut Cursor::new(&mut bytes), format)
            .unwrap();
        bytes
    }

    struct StaticFetcher {
        response: Mutex<Option<Result<FetchedImage>>>,
    }

    impl StaticFetcher {
        fn new(response: Result<FetchedImage>) -> Arc<Self> {
            Arc::new(Self {
                response: Mutex::new(Some(response)),
            })
        }
    }

    #[async_trait]
    impl ImageFetcher for StaticFetcher {
        async fn fetch(&self, _url: &Url, _max_bytes: usize) -> Result<FetchedImage> {
            self.response
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Err(PipelineError::fetch("already fetched")))
        }
    }

    fn intake_with(fetcher: Arc<dyn ImageFetcher>) -> (ImageIntake, Arc<LifecycleManager>) {
        let lifecycle = Arc::new(LifecycleManager::new());
        let intake = ImageIntake::new(UploadConstraints::default(), Arc::clone(&lifecycle), fetcher);
        (intake, lifecycle)
    }

    fn intake() -> (ImageIntake, Arc<LifecycleManager>) {
        intake_with(StaticFetcher::new(Err(PipelineError::fetch("offline"))))
    }

    #[test]
    fn test_accepts_allowed_types() {
        let (intake, lifecycle) = intake();
        for (format, mime) in [(ImageFormat::Png, "image/png"), (ImageFormat::Jpeg, "image/jpeg")] {
            let task = intake
                .accept_local(IncomingFile::new("photo", mime, encoded(format)))
                .unwrap();
            assert_eq!(task.status(), TaskStatus::Pending);
            assert_eq!(task.mime_type, mime);
            let url = task.display_url.as_ref().unwrap();
            assert!(Arc::ptr_eq(&lifecycle.registry().resolve(url).unwrap(), &task.original));
        }
        assert_eq!(lifecycle.registry().live_count(), 2);
    }

    #[test]
    fn test_task_ids_are_unique() {
        let (intake, _) = intake();
        let a = intake.accept_local(IncomingFile::new("a.png", "image/png", encoded(ImageFormat::Png))).unwrap();
        let b = intake.accept_local(IncomingFile::new("b.png", "image/png", encoded(ImageFormat::Png))).unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_jpg_alias_and_sniffed_type() {
        let (intake, _) = intake();
        let alias = intake
            .accept_local(IncomingFile::new("a.jpg", "image/jpg", encoded(ImageFormat::Jpeg)))
            .unwrap();
        assert_eq!(alias.mime_type, "image/jpeg");

        let sniffed = intake
            .accept_local(IncomingFile::new("blob", "application/octet-stream", encoded(ImageFormat::Png)))
            .unwrap();
        assert_eq!(sniffed.mime_type, "image/png");
    }

    #[test]
    fn test_rejections_allocate_nothing() {
        let (intake, lifecycle) = intake();
        let cases = [
            (IncomingFile::new("empty.png", "image/png", Vec::new()), ErrorKind::InvalidInput),
            (IncomingFile::new("doc.pdf", "application/pdf", b"%PDF-1.7 ...".to_vec()), ErrorKind::InvalidType),
            (IncomingFile::new("anim.gif", "image/gif", b"GIF89a......".to_vec()), ErrorKind::InvalidType),
            (IncomingFile::new("lie.png", "image/png", encoded(ImageFormat::Jpeg)), ErrorKind::InvalidType),
            (IncomingFile::new("unknown", "", b"plain text body".to_vec()), ErrorKind::InvalidType),
            (
                IncomingFile::new("huge.png", "image/png", vec![0u8; 10 * 1024 * 1024 + 1]),
                ErrorKind::TooLarge,
            ),
        ];

        for (file, expected) in cases {
            let err = intake.accept_local(file).unwrap_err();
            assert_eq!(err.kind(), expected, "{err}");
        }
        assert_eq!(lifecycle.registry().stats().created, 0);
    }

    #[test]
    fn test_size_limit_is_inclusive() {
        let lifecycle = Arc::new(LifecycleManager::new());
        let mut constraints = UploadConstraints::default();
        let bytes = encoded(ImageFormat::Png);
        constraints.max_bytes = bytes.len();
        let intake = ImageIntake::new(constraints, lifecycle, StaticFetcher::new(Err(PipelineError::fetch("-"))));

        assert!(intake.validate(&IncomingFile::new("x.png", "image/png", bytes.clone())).is_ok());
        let mut bigger = bytes;
        bigger.push(0);
        let err = intake.validate(&IncomingFile::new("x.png", "image/png", bigger)).unwrap_err();
        assert!(matches!(err, PipelineError::TooLarge { .. }));
    }

    #[test]
    fn test_batch_members_are_independent() {
        let (intake, _) = intake();
        let results = intake.accept_batch(vec![
            IncomingFile::new("ok.png", "image/png", encoded(ImageFormat::Png)),
            IncomingFile::new("bad.txt", "text/plain", b"hello".to_vec()),
            IncomingFile::new("ok.jpg", "image/jpeg", encoded(ImageFormat::Jpeg)),
        ]);

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap().source, ImageSource::BatchMember { index: 0 });
        assert_eq!(results[1].as_ref().unwrap_err().kind(), ErrorKind::InvalidType);
        assert_eq!(results[2].as_ref().unwrap().source, ImageSource::BatchMember { index: 2 });
    }

    #[tokio::test]
    async fn test_accept_url_uses_header_and_path() {
        let fetcher = StaticFetcher::new(Ok(FetchedImage {
            bytes: encoded(ImageFormat::Png),
            content_type: Some("image/png".to_string()),
        }));
        let (intake, _) = intake_with(fetcher);

        let task = intake.accept_url("https://example.com/images/cat.png?size=large").await.unwrap();
        assert_eq!(task.name, "cat.png");
        assert_eq!(task.mime_type, "image/png");
        assert!(matches!(task.source, ImageSource::RemoteUrl { ref url } if url.starts_with("https://example.com/")));
    }

    #[tokio::test]
    async fn test_accept_url_rejections() {
        let (intake, _) = intake();
        assert_eq!(intake.accept_url("not a url").await.unwrap_err().kind(), ErrorKind::InvalidInput);
        assert_eq!(
            intake.accept_url("ftp://example.com/a.png").await.unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(
            intake.accept_url("https://example.com/a.png").await.unwrap_err().kind(),
            ErrorKind::FetchFailed
        );
    }

    #[tokio::test]
    async fn test_from_path_types_by_content() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("misnamed.jpg");
        std::fs::write(&path, encoded(ImageFormat::Png)).unwrap();

        let file = IncomingFile::from_path(&path).await.unwrap();
        assert_eq!(file.name, "misnamed.jpg");
        assert_eq!(file.mime_type, "image/png");
    }
}
