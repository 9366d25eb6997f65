//! Two-phase fetch with on-demand resizing.
//!
//! ```text
//! FETCH_EXACT ──2xx──────────────────────────────▶ Direct
//!      │
//!      └─non-2xx─▶ DECODE_VARIANT ──no variant───▶ PassThrough
//!                        │
//!                        └─▶ FETCH_SOURCE ──non-2xx─▶ SourceMissing
//!                                  │
//!                                  └─2xx─▶ TRANSCODE ──ok──▶ Resized (+ write-back)
//!                                                 └──err─▶ TranscodeFailed
//! ```
//!
//! Every path yields exactly one response. Only transport failures surface as
//! errors.

use crate::origin::{OriginFetcher, OriginRequest, OriginResponse, TransportError};
use crate::transcoder::Transcoder;
use crate::variant_key::VariantKey;
use crate::write_back::{WriteBackHandle, WriteBackJob};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Which terminal state produced the response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The exact object exists at the origin
    Direct,
    /// Not a variant key; the first origin response is returned as-is
    PassThrough,
    /// Variant key decoded but its source is not available
    SourceMissing,
    /// Source resized, write-back scheduled when the key allows it
    Resized,
    /// Source found but could not be resized; source served unmodified
    TranscodeFailed,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Direct => "direct",
            Resolution::PassThrough => "pass_through",
            Resolution::SourceMissing => "source_missing",
            Resolution::Resized => "resized",
            Resolution::TranscodeFailed => "transcode_failed",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response to send back plus how it was obtained
#[derive(Debug)]
pub struct Intercepted {
    pub response: OriginResponse,
    pub resolution: Resolution,
}

impl Intercepted {
    fn new(response: OriginResponse, resolution: Resolution) -> Self {
        Self {
            response,
            resolution,
        }
    }
}

/// Sits between the public listener and the origin
pub struct Interceptor {
    origin: Arc<dyn OriginFetcher>,
    transcoder: Transcoder,
    write_back: Option<WriteBackHandle>,
}

impl Interceptor {
    /// `write_back` of `None` serves variants without persisting them
    pub fn new(
        origin: Arc<dyn OriginFetcher>,
        transcoder: Transcoder,
        write_back: Option<WriteBackHandle>,
    ) -> Self {
        Self {
            origin,
            transcoder,
            write_back,
        }
    }

    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    pub async fn handle(&self, request: OriginRequest) -> Result<Intercepted, TransportError> {
        let exact = self.origin.fetch(request.clone()).await?;
        if exact.is_success() {
            debug!("Requested object already available");
            return Ok(self.finish(exact, Resolution::Direct));
        }

        let Some(variant) = VariantKey::decode(&request.url) else {
            debug!(status = %exact.status, "No width suffix, passing origin response through");
            return Ok(self.finish(exact, Resolution::PassThrough));
        };

        let (source_url, width) = variant.into_parts();

        // A suffix in the query decodes to the source's own path; persisting
        // under it would overwrite the source with the variant
        let write_back_key = if source_url.path() == request.url.path() {
            warn!(source = %source_url, "Variant shares the source path, write-back skipped");
            metrics::counter!("resize_proxy.write_back.skipped").increment(1);
            None
        } else {
            Some(request.url.path().to_string())
        };

        debug!(source = %source_url, width, "Fetching source image");
        let source = self.origin.fetch(request.for_source(source_url)).await?;
        if !source.is_success() {
            debug!(status = %source.status, "Source image not available");
            return Ok(self.finish(source, Resolution::SourceMissing));
        }

        match self.transcoder.resize_async(source.body.clone(), width).await {
            Ok(resized) => {
                let content_type = source
                    .content_type()
                    .map(str::to_owned)
                    .unwrap_or_else(|| resized.mime_type().to_string());

                let mut response = source;
                response.replace_body(resized.data.clone());

                info!(
                    width = resized.spec.width,
                    height = resized.spec.height,
                    size_bytes = resized.data.len(),
                    "Serving resized variant"
                );
                metrics::counter!("resize_proxy.variants.generated").increment(1);

                if let Some(key) = write_back_key {
                    self.schedule_write_back(WriteBackJob {
                        key,
                        data: resized.data,
                        content_type,
                    });
                }

                Ok(self.finish(response, Resolution::Resized))
            }
            Err(e) => {
                // A wrong variant must never be persisted, so no write-back here
                warn!(error = %e, width, "Resize failed, serving source image");
                metrics::counter!("resize_proxy.transcode.failures").increment(1);
                Ok(self.finish(source, Resolution::TranscodeFailed))
            }
        }
    }

    fn schedule_write_back(&self, job: WriteBackJob) {
        match &self.write_back {
            Some(handle) => {
                debug!(key = %job.key, "Scheduling write-back");
                handle.schedule(job);
            }
            None => debug!(key = %job.key, "Write-back disabled"),
        }
    }

    fn finish(&self, response: OriginResponse, resolution: Resolution) -> Intercepted {
        metrics::counter!("resize_proxy.requests", "resolution" => resolution.as_str())
            .increment(1);
        Intercepted::new(response, resolution)
    }
}
