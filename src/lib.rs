#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::module_name_repetitions)]

//! # Background Removal Pipeline
//!
//! The image pipeline behind a background-removal tool: validated intake,
//! two-rendition normalization, model-driven segmentation, mask compositing,
//! fingerprint-keyed result caching and bounded-concurrency batch scheduling.
//!
//! Every image becomes an [`ImageTask`] owned by a [`Session`]. A task moves
//! through `Pending → Normalizing → Segmenting → Compositing → Completed`
//! (or `Failed`), reports progress over a channel, and can be cancelled,
//! retried, replaced or deleted. Display references handed out for a task are
//! tracked by the [`LifecycleManager`] and revoked when the task goes away.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bgremove_pipeline::{IncomingFile, PipelineConfig, Session};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let session = Session::new(PipelineConfig::default())?;
//! let bytes = tokio::fs::read("portrait.jpg").await?;
//! let id = session.add_file(IncomingFile::new("portrait.jpg", "image/jpeg", bytes))?;
//!
//! session.prepare(id).await?;
//! session.process(id, None).await?;
//!
//! let download = session.download(id).await?;
//! tokio::fs::write(&download.filename, &download.bytes).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Batches
//!
//! ```rust,no_run
//! use bgremove_pipeline::{BatchScheduler, IncomingFile, PipelineConfig, Session};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(files: Vec<IncomingFile>) -> anyhow::Result<()> {
//! let session = Arc::new(Session::new(PipelineConfig::default())?);
//! let report = BatchScheduler::new(session).run(files, &CancellationToken::new()).await;
//! println!("{}", report.summary());
//! # Ok(())
//! # }
//! ```
//!
//! ### Feature Flags
//!
//! - `tract` (default): Pure Rust inference backend
//! - `onnx`: ONNX Runtime backend with hardware acceleration
//! - `webp-support` (default): WebP output
//! - `cli`: Command-line interface, progress bars and tracing setup
//! - `tracing-json` / `tracing-files`: extra subscriber outputs for the CLI

pub mod backends;
pub mod cache;
#[cfg(feature = "cli")]
pub mod cli;
pub mod compositor;
pub mod config;
pub mod error;
pub mod inference;
pub mod intake;
pub mod lifecycle;
pub mod normalize;
pub mod processor;
pub mod scheduler;
pub mod segmentation;
pub mod services;
pub mod session;
#[cfg(feature = "cli")]
pub mod tracing_config;
pub mod types;
pub mod utils;

// Public API exports
pub use cache::{CacheStats, Fingerprint, ResultCache};
pub use compositor::Compositor;
pub use config::{
    BackendType, BatchConstraints, CacheConstraints, MaskConvention, NormalizationConstraints,
    NormalizationProfile, NormalizedFormat, OutputFormat, PipelineConfig, PipelineConfigBuilder,
    ProcessingConstraints, UploadConstraints,
};
pub use error::{ErrorKind, PipelineError, Result};
pub use inference::{BackendFactory, DefaultBackendFactory, InferenceBackend, ModelInfo};
pub use intake::{FetchedImage, HttpFetcher, ImageFetcher, ImageIntake, IncomingFile};
pub use lifecycle::{LifecycleManager, ObjectUrl, RefScope, ResourceOwner};
pub use normalize::{Normalizer, ProfileKind};
pub use processor::BackgroundRemovalProcessor;
pub use scheduler::{AbortedItem, BatchItemFailure, BatchItemSuccess, BatchReport, BatchScheduler};
pub use segmentation::{EngineStats, EngineStatus, Segmentation, SegmentationEngine};
pub use services::{
    progress_channel, BatchProgressUpdate, ConsoleProgressReporter, ImageIOService, NoOpProgressReporter,
    OutputFormatHandler, ProcessingStage, ProgressReporter, ProgressSink, ProgressStream, ProgressUpdate,
    TaskProgress,
};
pub use session::Session;
pub use types::{
    processed_filename, CompositeImage, Download, ImageSource, ImageTask, NormalizedImage, ProcessedOutput,
    ProcessingTimings, SegmentationMask, TaskError, TaskId, TaskSnapshot, TaskStatus,
};

#[cfg(feature = "cli")]
pub use tracing_config::{init_cli_tracing, spans, TracingConfig, TracingFormat, TracingOutput};
