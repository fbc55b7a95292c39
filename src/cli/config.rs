//! Configuration conversion utilities for CLI arguments

use crate::cli::main_impl::{Cli, CliBackend, CliMaskConvention, CliOutputFormat};
use crate::config::{BackendType, MaskConvention, OutputFormat, PipelineConfig, PipelineConfigBuilder};
use anyhow::{Context, Result};

/// Convert CLI arguments to a [`PipelineConfig`]
pub(crate) struct CliConfigBuilder;

impl CliConfigBuilder {
    /// Load the base configuration and apply command-line overrides
    ///
    /// Flags win over the `--config` file, which wins over
    /// `BGREMOVE_PIPELINE_CONFIG`, which wins over the defaults.
    pub(crate) fn from_cli(cli: &Cli) -> Result<PipelineConfig> {
        let base = PipelineConfig::load(cli.config.as_deref()).context("Failed to load configuration file")?;
        let mut builder = PipelineConfigBuilder::from_config(base);

        if let Some(model) = &cli.model {
            builder = builder.model_path(model);
        }
        if let Some(backend) = cli.backend {
            builder = builder.backend(backend.into());
        }
        if let Some(format) = cli.format {
            builder = builder.output_format(format.into());
        }
        if let Some(convention) = cli.mask_convention {
            builder = builder.mask_convention(convention.into());
        }
        if let Some(batch_size) = cli.batch_size {
            builder = builder.batch_size(batch_size);
        }
        if let Some(max_concurrent) = cli.max_concurrent {
            builder = builder.max_concurrent(max_concurrent);
        }
        if let Some(max_dimension) = cli.max_dimension {
            builder = builder.max_dimension(max_dimension);
        }
        if let Some(threads) = cli.threads {
            builder = builder.intra_threads(threads);
        }
        if cli.no_cache {
            builder = builder.cache_enabled(false);
        }

        builder.build().context("Invalid configuration")
    }

    /// Reject argument combinations clap cannot express
    pub(crate) fn validate_cli(cli: &Cli) -> Result<()> {
        if cli.pattern.is_some() && !cli.input.iter().any(|input| std::path::Path::new(input).is_dir()) {
            anyhow::bail!("--pattern only applies to directory inputs");
        }
        if let Some(model) = &cli.model {
            if !model.exists() {
                anyhow::bail!("Model file does not exist: {}", model.display());
            }
        }
        Ok(())
    }
}

impl From<CliBackend> for BackendType {
    fn from(backend: CliBackend) -> Self {
        match backend {
            CliBackend::Tract => Self::Tract,
            CliBackend::Onnx => Self::Onnx,
        }
    }
}

impl From<CliOutputFormat> for OutputFormat {
    fn from(format: CliOutputFormat) -> Self {
        match format {
            CliOutputFormat::Png => Self::Png,
            CliOutputFormat::Webp => Self::WebP,
        }
    }
}

impl From<CliMaskConvention> for MaskConvention {
    fn from(convention: CliMaskConvention) -> Self {
        match convention {
            CliMaskConvention::Foreground => Self::Foreground,
            CliMaskConvention::Background => Self::Background,
        }
    }
}
