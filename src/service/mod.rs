//! Request orchestration: parse, forward chain, inference, packaging.

pub mod announce;
pub mod http;
pub mod packaging;
pub mod parser;
pub mod pipeline;

pub use packaging::{threshold, PackageSummary, Packager};
pub use parser::{RawRequest, RequestParser};
pub use pipeline::{forward_chain, inverse_chain};

use crate::config::AppConfig;
use crate::error::ServiceResult;
use crate::metrics::ServiceMetrics;
use crate::models::{InferenceAdapter, InferenceRuntime};
use crate::transforms::TransformChain;
use crate::types::envelope::{CapabilityManifest, Envelope};
use crate::types::record::{ELAPSED_TIME_FIELD, IMAGE_FIELD, SEGMENTATION_FIELD};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// The three-stage service contract over one shared inference runtime.
///
/// Chains are built once at start-up and never change afterwards; each
/// request gets its own record and nothing else is shared between requests.
pub struct SegmentationService {
    parser: RequestParser,
    forward: TransformChain,
    adapter: InferenceAdapter,
    packager: Packager,
    metrics: Arc<ServiceMetrics>,
}

impl SegmentationService {
    pub fn new(
        parser: RequestParser,
        forward: TransformChain,
        adapter: InferenceAdapter,
        packager: Packager,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        Self {
            parser,
            forward,
            adapter,
            packager,
            metrics,
        }
    }

    /// Wire the standard chains from configuration around `runtime`
    pub fn from_config(
        config: &AppConfig,
        runtime: Arc<dyn InferenceRuntime>,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        let scratch_dir = config.server.scratch_dir();
        let forward = forward_chain(IMAGE_FIELD, &config.geometry, config.intensity);
        let inverse = inverse_chain(SEGMENTATION_FIELD, IMAGE_FIELD);
        info!(
            forward = ?forward.stage_names(),
            inverse = ?inverse.stage_names(),
            scratch_dir = %scratch_dir.display(),
            "Transform chains built"
        );

        Self::new(
            RequestParser::new(scratch_dir.clone(), IMAGE_FIELD),
            forward,
            InferenceAdapter::new(runtime, IMAGE_FIELD, SEGMENTATION_FIELD),
            Packager::new(inverse, SEGMENTATION_FIELD, scratch_dir),
            metrics,
        )
    }

    pub fn manifest(&self) -> CapabilityManifest {
        CapabilityManifest::segmentation()
    }

    pub fn metrics(&self) -> &Arc<ServiceMetrics> {
        &self.metrics
    }

    /// Run one request to completion. Blocking; call from a worker thread.
    pub fn handle(&self, raw: &RawRequest) -> ServiceResult<Envelope> {
        let start = Instant::now();
        match self.run(raw) {
            Ok((envelope, summary)) => {
                self.metrics
                    .record_success(start.elapsed(), summary.foreground_fraction());
                Ok(envelope)
            }
            Err(e) => {
                error!(error = %e, kind = e.kind(), "Request failed");
                self.metrics.record_failure(e.kind());
                Err(e)
            }
        }
    }

    fn run(&self, raw: &RawRequest) -> ServiceResult<(Envelope, PackageSummary)> {
        let record = self.parser.parse(raw)?;
        let uid = record.uid();

        let record = self.forward.apply(record)?;
        let record = self.adapter.infer(record)?;
        if let Some(elapsed) = record.scalar(ELAPSED_TIME_FIELD) {
            self.metrics.record_inference(Duration::from_secs_f64(elapsed));
        }

        let (envelope, summary) = self.packager.package_with_summary(record)?;
        info!(
            uid = ?uid,
            model = %self.adapter.runtime_name(),
            inference_secs = %envelope.elapsed_time(),
            encoded_bytes = summary.encoded_bytes,
            foreground_fraction = summary.foreground_fraction(),
            "Segmentation returned"
        );
        Ok((envelope, summary))
    }
}
