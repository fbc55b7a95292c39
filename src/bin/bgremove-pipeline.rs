//! Background removal pipeline CLI
//!
//! Command-line interface over the `bgremove-pipeline` library: intake,
//! normalization, segmentation and compositing of local or remote images.

#[cfg(feature = "cli")]
use bgremove_pipeline::cli;

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::main().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    panic!("CLI feature not enabled. Please rebuild with --features cli");
}
