//! Error conditions and boundary cases seen from outside the crate

mod common;

use bgremove_pipeline::{
    backends::test_utils::{MockBackendFactory, MockBehavior},
    ErrorKind, IncomingFile, PipelineConfig, ResourceOwner, TaskStatus,
};
use common::{encoded, png_file, session, session_with, test_config, StaticFetcher};
use image::ImageFormat;

#[tokio::test]
async fn test_intake_rejections_allocate_nothing() {
    let session = session(MockBackendFactory::new());
    let png = encoded(8, 8, 1, ImageFormat::Png);

    let cases = [
        (IncomingFile::new("empty.png", "image/png", Vec::new()), ErrorKind::InvalidInput),
        (IncomingFile::new("anim.gif", "image/gif", b"GIF89a....".to_vec()), ErrorKind::InvalidType),
        (IncomingFile::new("lying.jpg", "image/jpeg", png.clone()), ErrorKind::InvalidType),
        (IncomingFile::new("mystery", "", b"not an image at all".to_vec()), ErrorKind::InvalidType),
    ];
    for (file, expected) in cases {
        let name = file.name.clone();
        let err = session.add_file(file).unwrap_err();
        assert_eq!(err.kind(), expected, "{name}");
    }

    assert!(session.is_empty());
    assert_eq!(session.lifecycle().registry().live_count(), 0);
}

#[tokio::test]
async fn test_oversized_upload_is_rejected_after_type_check() {
    let config = test_config().max_upload_bytes(64).build().unwrap();
    let session = session_with(config, MockBackendFactory::new(), StaticFetcher::default());

    let err = session.add_file(png_file("big.png", 1)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TooLarge);
    assert!(err.user_message().contains("too large"));

    // A disallowed type is reported as such even when it is also too large
    let err = session
        .add_file(IncomingFile::new("big.gif", "image/gif", vec![b'G'; 1024]))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidType);
}

#[tokio::test]
async fn test_remote_intake_errors() {
    let fetcher = StaticFetcher::default().with(
        "https://example.com/page.html",
        b"<html></html>".to_vec(),
        Some("text/html"),
    );
    let session = session_with(test_config().build().unwrap(), MockBackendFactory::new(), fetcher);

    let err = session.add_url("ftp://example.com/cat.png").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    let err = session.add_url("not a url").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    let err = session.add_url("https://example.com/missing.png").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FetchFailed);
    let err = session.add_url("https://example.com/page.html").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidType);

    assert!(session.is_empty());
}

#[tokio::test]
async fn test_truncated_image_fails_normalization() {
    let session = session(MockBackendFactory::new());
    let mut bytes = encoded(32, 32, 1, ImageFormat::Png);
    bytes.truncate(40);
    let id = session.add_file(IncomingFile::new("cut.png", "image/png", bytes)).unwrap();

    let err = session.process(id, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NormalizationFailed);

    let snapshot = session.snapshot(id).await.unwrap();
    assert_eq!(snapshot.status, TaskStatus::Failed);
    assert_eq!(snapshot.error.unwrap().kind, ErrorKind::NormalizationFailed);
}

#[tokio::test]
async fn test_model_load_failure_is_not_retried() {
    let factory = MockBackendFactory::failing_load();
    let counters = factory.counters();
    let session = session(factory);
    let id = session.add_file(png_file("a.png", 1)).unwrap();

    let err = session.process(id, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ModelLoadFailed);
    assert!(err.is_global());
    assert_eq!(counters.load_attempts(), 1);
}

#[tokio::test]
async fn test_malformed_model_output_fails_the_task() {
    let factory = MockBackendFactory::with_behavior(MockBehavior {
        output_shape_override: Some((1, 3, 4, 4)),
        ..MockBehavior::default()
    });
    let session = session(factory);
    let id = session.add_file(png_file("a.png", 1)).unwrap();

    let err = session.process(id, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert!(!err.is_retryable());
    assert!(!session.snapshot(id).await.unwrap().has_output);
}

#[tokio::test]
async fn test_operations_on_deleted_task() {
    let session = session(MockBackendFactory::new());
    let id = session.add_file(png_file("a.png", 1)).unwrap();
    session.delete(id).unwrap();

    assert_eq!(session.process(id, None).await.unwrap_err().kind(), ErrorKind::UnknownTask);
    assert_eq!(session.retry(id).await.unwrap_err().kind(), ErrorKind::UnknownTask);
    assert_eq!(session.download(id).await.unwrap_err().kind(), ErrorKind::UnknownTask);
    assert_eq!(session.delete(id).unwrap_err().kind(), ErrorKind::UnknownTask);
    assert!(session.lifecycle().is_retired(ResourceOwner::Task(id)));
}

#[test]
fn test_invalid_configurations() {
    assert_eq!(
        PipelineConfig::builder().batch_size(0).build().unwrap_err().kind(),
        ErrorKind::InvalidConfig
    );
    assert_eq!(
        PipelineConfig::builder().max_concurrent(0).build().unwrap_err().kind(),
        ErrorKind::InvalidConfig
    );
    assert_eq!(
        PipelineConfig::builder().allowed_types(Vec::<String>::new()).build().unwrap_err().kind(),
        ErrorKind::InvalidConfig
    );
    assert!(PipelineConfig::from_json_str("{ not json").is_err());
    assert!(PipelineConfig::from_json_str(r#"{"batch": {"batch_size": 0}}"#).is_err());
}
