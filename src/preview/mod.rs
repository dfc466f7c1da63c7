//! Page preview rendering infrastructure

use std::time::Duration;

mod backend;
mod cache;
mod loader;
#[cfg(feature = "pdf")]
mod mupdf_backend;
mod pool;
mod request;
mod service;
mod source;
mod state;
mod types;
mod worker;

pub use backend::{
    Backend, DATA_URI_PREFIX, DocumentHandle, PageHandle, decode_data_uri, encode_jpeg_data_uri,
};
pub use cache::{CacheStats, CachedPreview, PreviewCache};
pub use loader::{LoaderConfig, LoaderInput, ProgressiveLoader};
#[cfg(feature = "pdf")]
pub use mupdf_backend::MupdfBackend;
pub use pool::{DocumentPool, PoolStats};
pub use request::{
    DocumentInfo, DocumentTicket, GroupProgress, OpenError, PreviewTicket, RenderFault,
    RenderOptions, RequestError,
};
pub use service::{PreviewScheduler, SchedulerConfig};
pub use source::{DocumentSource, FileSource, MemorySource, SourceError};
pub use state::{LoadedPage, LoaderPhase, LoaderView, PageRange};
pub use types::*;
pub use worker::ProgressListener;

/// Default number of documents kept open
pub const DEFAULT_POOL_CAPACITY: usize = pool::DEFAULT_POOL_CAPACITY;

/// Default aggregate budget of the preview cache (1 GiB)
pub const DEFAULT_CACHE_BYTE_BUDGET: usize = 1024 * 1024 * 1024;

/// Default entry cap of the preview cache
pub const DEFAULT_CACHE_ENTRY_CAP: usize = 20;

/// Default number of requests rendered per batch
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Debounce while every queued request is an early page
pub const DEFAULT_SHORT_DELAY: Duration = Duration::from_millis(10);

/// Debounce once later pages are queued
pub const DEFAULT_LONG_DELAY: Duration = Duration::from_millis(50);

/// Default scale applied to a page's natural size
pub const DEFAULT_RENDER_SCALE: f32 = 0.5;

pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Larger preview dimension is clamped to this many pixels
pub const DEFAULT_MAX_DIMENSION: u32 = 1024;

/// Pages added on each side of the visible range by the progressive loader
pub const DEFAULT_RANGE_BUFFER: usize = 5;

/// Renders a progressive loader sweep keeps in flight
pub const DEFAULT_SWEEP_CONCURRENCY: usize = 4;
