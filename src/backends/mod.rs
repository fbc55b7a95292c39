//! Backend implementations for different inference engines
//!
//! - ONNX Runtime backend (hardware acceleration, `onnx` feature)
//! - Tract backend (pure Rust, `tract` feature)
//! - Mock backends for tests and benchmarks

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "tract")]
pub mod tract;

// Mock backends, public so integration tests and benches can drive the pipeline
#[doc(hidden)]
pub mod test_utils;

#[cfg(feature = "onnx")]
pub use self::onnx::OnnxBackend;

#[cfg(feature = "tract")]
pub use self::tract::TractBackend;
