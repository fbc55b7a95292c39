//! Cooperative chunked work loop
//!
//! Long CPU loops on the async runtime process a bounded number of units,
//! then yield so other tasks (progress consumers, the UI side of a session)
//! keep getting scheduled.

use crate::error::{PipelineError, Result};
use std::ops::Range;
use tokio_util::sync::CancellationToken;

/// Runs work over `0..total` in chunks, yielding between chunks
#[derive(Debug, Clone)]
pub struct YieldingWorkLoop {
    chunk_size: usize,
    cancel: Option<CancellationToken>,
}

impl YieldingWorkLoop {
    /// Create a loop processing at most `chunk_size` units between yields
    #[must_use]
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            cancel: None,
        }
    }

    /// Stop between chunks once `token` is cancelled
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Run an infallible body; returns the number of chunks processed
    ///
    /// # Errors
    /// - `Cancelled` when the attached token fires between chunks
    pub async fn run<F>(&self, total: usize, mut body: F) -> Result<usize>
    where
        F: FnMut(Range<usize>),
    {
        self.try_run(total, |range| {
            body(range);
            Ok(())
        })
        .await
    }

    /// Run a fallible body, stopping at the first error
    ///
    /// # Errors
    /// - The first error returned by `body`
    /// - `Cancelled` when the attached token fires between chunks
    pub async fn try_run<F>(&self, total: usize, mut body: F) -> Result<usize>
    where
        F: FnMut(Range<usize>) -> Result<()>,
    {
        let mut start = 0;
        let mut chunks = 0;
        while start < total {
            if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                return Err(PipelineError::cancelled("work loop cancelled"));
            }
            let end = (start + self.chunk_size).min(total);
            body(start..end)?;
            chunks += 1;
            start = end;
            if start < total {
                tokio::task::yield_now().await;
            }
        }
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_covers_every_unit_once() {
        let work_loop = YieldingWorkLoop::new(4);
        let mut seen = Vec::new();
        let chunks = work_loop.run(10, |range| seen.extend(range)).await.unwrap();

        assert_eq!(chunks, 3);
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_empty_range() {
        let chunks = YieldingWorkLoop::new(8).run(0, |_| panic!("no work")).await.unwrap();
        assert_eq!(chunks, 0);
    }

    #[tokio::test]
    async fn test_zero_chunk_size_is_clamped() {
        let work_loop = YieldingWorkLoop::new(0);
        assert_eq!(work_loop.chunk_size(), 1);
        assert_eq!(work_loop.run(3, |_| {}).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_try_run_stops_at_error() {
        let mut calls = 0;
        let result = YieldingWorkLoop::new(2)
            .try_run(10, |range| {
                calls += 1;
                if range.start >= 4 {
                    Err(PipelineError::composite("boom"))
                } else {
                    Ok(())
                }
            })
            .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::CompositeFailed);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_cancellation_between_chunks() {
        let token = CancellationToken::new();
        let work_loop = YieldingWorkLoop::new(1).with_cancellation(token.clone());
        let mut processed = 0;
        let result = work_loop
            .run(5, |_| {
                processed += 1;
                if processed == 2 {
                    token.cancel();
                }
            })
            .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);
        assert_eq!(processed, 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_other_tasks_progress_while_looping() {
        let flag = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let observer = {
            let flag = std::sync::Arc::clone(&flag);
            tokio::spawn(async move { flag.store(true, std::sync::atomic::Ordering::SeqCst) })
        };

        let mut saw_flag = false;
        YieldingWorkLoop::new(1)
            .run(4, |range| {
                if range.start == 3 {
                    saw_flag = flag.load(std::sync::atomic::Ordering::SeqCst);
                }
            })
            .await
            .unwrap();

        observer.await.unwrap();
        assert!(saw_flag);
    }
}
