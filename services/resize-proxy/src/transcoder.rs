//! Image resizing.
//!
//! Decodes source bytes, computes the target height from the requested width
//! and re-encodes in the source's own format. Decoding and encoding are CPU
//! bound, so async callers go through [`Transcoder::resize_async`] which runs
//! on the blocking pool.

use bytes::Bytes;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use std::str::FromStr;
use std::time::Instant;
use thiserror::Error;
use tracing::debug;

/// Errors that can occur while producing a resized variant.
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("Unrecognised image format: {0}")]
    UnknownFormat(#[source] image::ImageError),

    #[error("Failed to decode {format:?} image: {source}")]
    Decode {
        format: ImageFormat,
        #[source]
        source: image::ImageError,
    },

    #[error("Source image has no pixels ({width}x{height})")]
    EmptySource { width: u32, height: u32 },

    #[error("Failed to encode {format:?} image: {source}")]
    Encode {
        format: ImageFormat,
        #[source]
        source: image::ImageError,
    },

    #[error("Resize task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}

/// Sampling filter used when scaling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResizeFilter {
    Nearest,
    #[default]
    Triangle,
    CatmullRom,
    Gaussian,
    Lanczos3,
}

impl FromStr for ResizeFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nearest" => Ok(Self::Nearest),
            "triangle" => Ok(Self::Triangle),
            "catmull_rom" | "catmullrom" => Ok(Self::CatmullRom),
            "gaussian" => Ok(Self::Gaussian),
            "lanczos3" => Ok(Self::Lanczos3),
            other => Err(format!("unknown resize filter '{other}'")),
        }
    }
}

impl From<ResizeFilter> for FilterType {
    fn from(filter: ResizeFilter) -> Self {
        match filter {
            ResizeFilter::Nearest => FilterType::Nearest,
            ResizeFilter::Triangle => FilterType::Triangle,
            ResizeFilter::CatmullRom => FilterType::CatmullRom,
            ResizeFilter::Gaussian => FilterType::Gaussian,
            ResizeFilter::Lanczos3 => FilterType::Lanczos3,
        }
    }
}

/// Output dimensions for one resize
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeSpec {
    pub width: u32,
    pub height: u32,
}

impl ResizeSpec {
    /// Compute the output size for a source of `source_width` x `source_height`.
    ///
    /// The ratio is the shorter source side over the longer one, and the height
    /// is `floor(target_width * ratio)` evaluated exactly in integer space. A
    /// zero height is raised to 1.
    pub fn for_source(
        source_width: u32,
        source_height: u32,
        target_width: u32,
    ) -> Result<Self, TranscodeError> {
        if source_width == 0 || source_height == 0 {
            return Err(TranscodeError::EmptySource {
                width: source_width,
                height: source_height,
            });
        }

        let (shorter, longer) = if source_width > source_height {
            (source_height, source_width)
        } else {
            (source_width, source_height)
        };

        let height = u64::from(target_width) * u64::from(shorter) / u64::from(longer);

        Ok(Self {
            width: target_width,
            // shorter <= longer, so height <= target_width
            height: (height as u32).max(1),
        })
    }
}

/// A resized variant ready to be served and written back
#[derive(Debug, Clone)]
pub struct Resized {
    pub data: Bytes,
    pub format: ImageFormat,
    pub source_width: u32,
    pub source_height: u32,
    pub spec: ResizeSpec,
}

impl Resized {
    /// MIME type of the encoded output
    pub fn mime_type(&self) -> &'static str {
        self.format.to_mime_type()
    }
}

/// Resizes encoded images, keeping their encoding
#[derive(Debug, Clone, Copy, Default)]
pub struct Transcoder {
    filter: ResizeFilter,
}

impl Transcoder {
    pub fn new(filter: ResizeFilter) -> Self {
        Self { filter }
    }

    /// Resize `source` to `target_width` (blocking version)
    ///
    /// **Note:** This decodes and encodes on the calling thread. Use
    /// `resize_async` from async code.
    pub fn resize(&self, source: &[u8], target_width: u32) -> Result<Resized, TranscodeError> {
        let format = image::guess_format(source).map_err(TranscodeError::UnknownFormat)?;

        let image = image::load_from_memory_with_format(source, format)
            .map_err(|source| TranscodeError::Decode { format, source })?;

        let (source_width, source_height) = (image.width(), image.height());
        let spec = ResizeSpec::for_source(source_width, source_height, target_width)?;

        debug!(
            ?format,
            source_width,
            source_height,
            width = spec.width,
            height = spec.height,
            "Resizing image"
        );

        let resized = image.resize_exact(spec.width, spec.height, self.filter.into());
        let data = encode(&resized, format)?;

        Ok(Resized {
            data,
            format,
            source_width,
            source_height,
            spec,
        })
    }

    /// Resize on tokio's blocking pool
    pub async fn resize_async(
        &self,
        source: Bytes,
        target_width: u32,
    ) -> Result<Resized, TranscodeError> {
        let transcoder = *self;
        let started = Instant::now();

        let result =
            tokio::task::spawn_blocking(move || transcoder.resize(&source, target_width)).await?;

        metrics::histogram!("resize_proxy.transcode.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        result
    }
}

fn encode(image: &DynamicImage, format: ImageFormat) -> Result<Bytes, TranscodeError> {
    let mut buf = Cursor::new(Vec::new());

    image
        .write_to(&mut buf, format)
        .map_err(|source| TranscodeError::Encode { format, source })?;

    Ok(Bytes::from(buf.into_inner()))
}
