//! Service layer
//!
//! Encoding, file access and progress reporting shared by the pipeline
//! stages and the CLI.

pub mod format;
pub mod io;
pub mod progress;

pub use format::OutputFormatHandler;
pub use io::ImageIOService;
pub use progress::{
    forward_progress, progress_channel, BatchProgressUpdate, ConsoleProgressReporter,
    NoOpProgressReporter, ProcessingStage, ProgressReporter, ProgressSink, ProgressStream,
    ProgressUpdate, TaskProgress,
};
