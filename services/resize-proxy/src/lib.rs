//! Resize Proxy
//!
//! Transparent HTTP proxy in front of an S3-compatible image store. Requests
//! for `<image>_<width>` that the store does not hold are answered by resizing
//! `<image>` on the fly, and the result is written back so the next request is
//! a direct hit.
//!
//! ## Features
//!
//! - **Pass-through**: objects that exist are served exactly as the origin
//!   returned them
//! - **Lazy variants**: missing `_<width>` variants are derived from their
//!   source, keeping the source's encoding
//! - **Bounded write-back**: generated variants are persisted by a fixed-size
//!   worker pool that drains on shutdown
//!
//! ## Architecture
//!
//! ```text
//!   Client                     Origin (S3/MinIO)
//! ┌──────────┐               ┌──────────────────┐
//! │ GET      │               │ images/          │
//! │ cat_200  │               │   cat.jpg        │
//! └────┬─────┘               │   cat.jpg_200    │◀──────────┐
//!      │                     └──────────────────┘           │
//!      ▼                              ▲                     │
//! ┌──────────────┐   fetch exact,     │                     │
//! │ Interceptor  │───then source──────┘                     │
//! └──────┬───────┘                                          │
//!        │                                                  │
//!        ▼                                                  │
//! ┌──────────────┐           ┌──────────────┐               │
//! │ Transcoder   │──────────▶│ Write-back   │───────────────┘
//! └──────────────┘           │ Queue        │
//!                            └──────────────┘
//! ```

pub mod config;
pub mod interceptor;
pub mod origin;
pub mod server;
pub mod transcoder;
pub mod variant_key;
pub mod write_back;

pub use config::Config;
pub use interceptor::{Intercepted, Interceptor, Resolution};
pub use origin::{HttpOrigin, OriginFetcher, OriginRequest, OriginResponse, TransportError};
pub use server::AppState;
pub use transcoder::{ResizeFilter, ResizeSpec, Resized, TranscodeError, Transcoder};
pub use variant_key::{VariantKey, DELIMITER};
pub use write_back::{
    ObjectStore, S3Store, WriteBackError, WriteBackHandle, WriteBackJob, WriteBackQueue,
};
