//! Process-wide gateway state
//!
//! Everything a request needs is owned here and constructed once at startup:
//! admission gate, resolver, transformer, reporter, parser, security and cache
//! policies. Handlers hold it behind an `Arc`.

use anyhow::{Context, Result};
use imgate_common::ImageBuffer;
use imgate_storage::{build_storage, ObjectStorage};
use imgate_transform::{ImageTransformer, Transformer, TransformerConfig};
use std::sync::Arc;
use tracing::info;

use crate::admission::AdmissionGate;
use crate::conditional::CachePolicy;
use crate::config::Config;
use crate::fallback::load_fallback_image;
use crate::parser::OptionsParser;
use crate::reporter::{ErrorReporter, TracingErrorReporter};
use crate::resolver::OriginResolver;
use crate::security::SecurityPolicy;

pub struct Gateway {
    pub(crate) config: Config,
    pub(crate) gate: AdmissionGate,
    pub(crate) resolver: OriginResolver,
    pub(crate) transformer: Arc<dyn Transformer>,
    pub(crate) reporter: Arc<dyn ErrorReporter>,
    pub(crate) parser: OptionsParser,
    pub(crate) security: SecurityPolicy,
    pub(crate) cache: CachePolicy,
}

impl Gateway {
    /// Assemble a gateway from already-built collaborators
    pub fn new(
        config: Config,
        primary: Arc<dyn ObjectStorage>,
        derived: Arc<dyn ObjectStorage>,
        transformer: Arc<dyn Transformer>,
        reporter: Arc<dyn ErrorReporter>,
        fallback: Option<ImageBuffer>,
    ) -> Self {
        let resolver = OriginResolver::new(primary, derived, transformer.clone(), config.cache_format)
            .with_fallback(fallback, config.fallback_image_http_code)
            .with_report_downloading_errors(config.report_downloading_errors);

        Self {
            gate: AdmissionGate::new(config.workers, config.requests_queue_size),
            parser: OptionsParser::new(&config),
            security: SecurityPolicy::new(&config.security),
            cache: CachePolicy::new(&config),
            resolver,
            transformer,
            reporter,
            config,
        }
    }

    /// Build stores, transformer and fallback image from configuration
    pub async fn from_config(config: Config) -> Result<Self> {
        let primary = build_storage("primary", &config.storage.primary)
            .context("Failed to configure primary store")?;
        let derived = build_storage("derived", &config.storage.derived)
            .context("Failed to configure derived cache store")?;

        let transformer = Arc::new(ImageTransformer::new(TransformerConfig {
            quality: config.quality,
            ..Default::default()
        }));

        let fallback = load_fallback_image(&config).await?;

        info!(
            workers = config.workers,
            queue_size = config.requests_queue_size,
            cache_format = %config.cache_format,
            fallback = fallback.is_some(),
            "Gateway configured"
        );

        Ok(Self::new(
            config,
            primary,
            derived,
            transformer,
            Arc::new(TracingErrorReporter),
            fallback,
        ))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    pub fn resolver(&self) -> &OriginResolver {
        &self.resolver
    }
}
