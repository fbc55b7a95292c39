//! End-to-end workflows through the public session API

mod common;

use bgremove_pipeline::{
    backends::test_utils::{MockBackendFactory, MockBehavior},
    progress_channel, ImageSource, MaskConvention, ProcessingStage, ResourceOwner, TaskStatus,
};
use common::{encoded, jpeg_file, png_file, session, session_with, test_config, StaticFetcher};
use image::ImageFormat;

#[tokio::test]
async fn test_local_file_end_to_end() {
    let session = session(MockBackendFactory::new());
    let id = session.add_file(jpeg_file("portrait.jpg", 7)).unwrap();

    session.prepare(id).await.unwrap();
    let snapshot = session.snapshot(id).await.unwrap();
    assert_eq!(snapshot.status, TaskStatus::Normalizing);
    assert_eq!(snapshot.source, ImageSource::LocalFile);

    let (sink, mut stream) = progress_channel();
    let output = session.process(id, Some(sink)).await.unwrap();
    assert!(!output.from_cache);
    assert_eq!((output.width, output.height), (64, 48));

    let updates = stream.drain_ready();
    assert!(updates.windows(2).all(|pair| pair[0].percentage <= pair[1].percentage));
    let last = updates.last().unwrap();
    assert_eq!(last.stage, ProcessingStage::Completed);
    assert_eq!(last.percentage, 100);

    let download = session.download(id).await.unwrap();
    assert_eq!(download.filename, "portrait_processed.png");
    let decoded = image::load_from_memory(&download.bytes).unwrap();
    assert_eq!(decoded.color(), image::ColorType::Rgba8);

    let timings = session.timings(id).await.unwrap();
    assert!(!timings.cache_hit);
}

#[tokio::test]
async fn test_remote_url_end_to_end() {
    let url = "https://images.example.com/pets/dog.webp?size=large";
    let fetcher = StaticFetcher::default().with(url, encoded(40, 40, 3, ImageFormat::Png), Some("image/png"));
    let session = session_with(test_config().build().unwrap(), MockBackendFactory::new(), fetcher);

    let id = session.add_url(url).await.unwrap();
    let snapshot = session.snapshot(id).await.unwrap();
    assert_eq!(snapshot.name, "dog.webp");
    assert!(matches!(snapshot.source, ImageSource::RemoteUrl { .. }));

    session.process(id, None).await.unwrap();
    assert_eq!(session.download(id).await.unwrap().filename, "dog_processed.png");
}

#[tokio::test]
async fn test_identical_content_is_served_from_cache() {
    let factory = MockBackendFactory::new();
    let counters = factory.counters();
    let session = session(factory);

    let first = session.add_file(png_file("a.png", 9)).unwrap();
    let second = session.add_file(png_file("copy-of-a.png", 9)).unwrap();

    let original = session.process(first, None).await.unwrap();
    let cached = session.process(second, None).await.unwrap();

    assert!(cached.from_cache);
    assert_eq!(cached.fingerprint, original.fingerprint);
    assert_eq!(cached.bytes, original.bytes);
    assert_eq!(counters.inferences(), 1);
    assert!(session.timings(second).await.unwrap().cache_hit);
}

#[tokio::test]
async fn test_cache_can_be_disabled() {
    let factory = MockBackendFactory::new();
    let counters = factory.counters();
    let config = test_config().cache_enabled(false).build().unwrap();
    let session = session_with(config, factory, StaticFetcher::default());

    for name in ["a.png", "b.png"] {
        let id = session.add_file(png_file(name, 1)).unwrap();
        assert!(!session.process(id, None).await.unwrap().from_cache);
    }
    assert_eq!(counters.inferences(), 2);
}

#[tokio::test]
async fn test_output_reference_is_revoked_with_its_task() {
    let session = session(MockBackendFactory::new());
    let id = session.add_file(png_file("a.png", 4)).unwrap();
    let output = session.process(id, None).await.unwrap();

    let url = output.url.clone().unwrap();
    let registry = session.lifecycle().registry();
    assert_eq!(registry.resolve(&url).unwrap().as_slice(), output.bytes.as_slice());

    session.delete(id).unwrap();
    assert!(registry.resolve(&url).is_none());
    assert_eq!(session.lifecycle().live_refs(ResourceOwner::Task(id)), 0);
}

#[tokio::test]
async fn test_background_convention_inverts_the_mask() {
    let uniform = |value| {
        MockBackendFactory::with_behavior(MockBehavior {
            uniform_output: Some(value),
            ..MockBehavior::default()
        })
    };

    let config = test_config().mask_convention(MaskConvention::Background).build().unwrap();
    let session = session_with(config, uniform(1.0), StaticFetcher::default());
    let id = session.add_file(png_file("a.png", 2)).unwrap();
    let output = session.process(id, None).await.unwrap();

    let decoded = image::load_from_memory(&output.bytes).unwrap().to_rgba8();
    assert!(decoded.pixels().all(|pixel| pixel[3] == 0));
}

#[tokio::test]
async fn test_replace_swaps_the_image() {
    let session = session(MockBackendFactory::new());
    let old = session.add_file(png_file("first.png", 1)).unwrap();
    session.process(old, None).await.unwrap();

    let new = session.replace(old, jpeg_file("second.jpg", 2)).unwrap();
    assert!(session.snapshot(old).await.is_err());

    let snapshot = session.snapshot(new).await.unwrap();
    assert_eq!(snapshot.name, "second.jpg");
    assert_eq!(snapshot.status, TaskStatus::Pending);
    assert!(!snapshot.has_output);
}
