//! Request, response and error types shared by the scheduler and its callers

use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use super::source::{DocumentSource, SourceError};
use super::types::{DocumentId, PageKey, Preview, Priority};

/// Errors from the render pipeline for a single page or document
#[derive(Debug, thiserror::Error)]
pub enum RenderFault {
    #[cfg(feature = "pdf")]
    #[error("PDF engine: {0}")]
    Pdf(#[from] mupdf::error::Error),

    #[error("source: {0}")]
    Source(#[from] SourceError),

    #[error("page {page} out of range (document has {page_count})")]
    PageOutOfRange { page: u32, page_count: u32 },

    #[error("encode: {0}")]
    Encode(#[from] image::ImageError),

    #[error("{detail}")]
    Generic { detail: String },
}

impl RenderFault {
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic { detail: msg.into() }
    }
}

/// Caller errors rejected before anything is queued
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("document id is empty")]
    MissingDocumentId,

    #[error("source {name:?} is empty")]
    EmptySource { name: String },

    #[error("page numbers are 1-based, got 0")]
    InvalidPage,

    #[error("key names page {key_page} but page {page} was requested")]
    PageMismatch { key_page: u32, page: u32 },

    #[error("no pages requested")]
    NoPages,

    #[error("scheduler has shut down")]
    ShutDown,
}

/// A queued render, created on first request for a key that is neither
/// cached nor in flight.
pub(crate) struct PendingRequest {
    pub key: PageKey,
    pub source: Arc<dyn DocumentSource>,
    pub page: u32,
    pub priority: Priority,
    /// Arrival order, breaks ties between equal page numbers
    pub seq: u64,
}

/// Per-document progress, reported after each document group of a batch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupProgress {
    pub document: DocumentId,
    pub completed: usize,
    pub total: usize,
}

/// A document could not be opened for a caller that wanted to hold it
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to open {document}: {detail}")]
pub struct OpenError {
    pub document: DocumentId,
    pub detail: String,
}

/// Page count reply for an opened document
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocumentInfo {
    pub document: DocumentId,
    pub page_count: u32,
}

/// Messages processed by the scheduler's actor thread
pub(crate) enum Command {
    Enqueue(PendingRequest),
    Retain {
        document: DocumentId,
        source: Arc<dyn DocumentSource>,
        reply: Sender<Result<DocumentInfo, OpenError>>,
    },
    Release(DocumentId),
    ClearForDocument(DocumentId),
    DestroyAll,
    PoolStats(Sender<super::pool::PoolStats>),
    Shutdown,
}

/// Handle to the eventual result of one preview request.
///
/// Every ticket resolves exactly once: `Some(preview)` on success, `None`
/// when rendering failed or the scheduler shut down first.
#[derive(Debug)]
pub struct PreviewTicket {
    key: PageKey,
    rx: Receiver<Option<Preview>>,
}

impl PreviewTicket {
    pub(crate) fn new(key: PageKey, rx: Receiver<Option<Preview>>) -> Self {
        Self { key, rx }
    }

    pub(crate) fn ready(key: PageKey, preview: Preview) -> Self {
        let (tx, rx) = flume::bounded(1);
        let _ = tx.send(Some(preview));
        Self { key, rx }
    }

    #[must_use]
    pub fn key(&self) -> &PageKey {
        &self.key
    }

    /// Block until the preview is available
    #[must_use]
    pub fn wait(self) -> Option<Preview> {
        self.rx.recv().ok().flatten()
    }

    /// Block for at most `timeout`; `Err(self)` if still pending
    pub fn wait_timeout(self, timeout: Duration) -> Result<Option<Preview>, Self> {
        match self.rx.recv_timeout(timeout) {
            Ok(preview) => Ok(preview),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
            Err(RecvTimeoutError::Timeout) => Err(self),
        }
    }

    /// Non-blocking poll
    pub fn try_get(&self) -> Option<Option<Preview>> {
        match self.rx.try_recv() {
            Ok(preview) => Some(preview),
            Err(TryRecvError::Disconnected) => Some(None),
            Err(TryRecvError::Empty) => None,
        }
    }
}

/// Handle to the result of [`super::PreviewScheduler::open_document`]
#[derive(Debug)]
pub struct DocumentTicket {
    pub(crate) document: DocumentId,
    pub(crate) rx: Receiver<Result<DocumentInfo, OpenError>>,
}

impl DocumentTicket {
    #[must_use]
    pub fn document(&self) -> &DocumentId {
        &self.document
    }

    fn shut_down(&self) -> OpenError {
        OpenError {
            document: self.document.clone(),
            detail: "scheduler has shut down".to_string(),
        }
    }

    /// Block until the document is open
    pub fn wait(self) -> Result<DocumentInfo, OpenError> {
        self.rx.recv().unwrap_or_else(|_| Err(self.shut_down()))
    }

    /// Non-blocking poll
    pub fn try_get(&self) -> Option<Result<DocumentInfo, OpenError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Disconnected) => Some(Err(self.shut_down())),
            Err(TryRecvError::Empty) => None,
        }
    }
}

/// How pages are rasterized and encoded
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderOptions {
    /// Scale factor applied to the page's natural size
    pub scale: f32,
    /// JPEG quality, 1..=100
    pub quality: u8,
    /// Upper bound on the larger preview dimension, in pixels
    pub max_dimension: u32,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            scale: super::DEFAULT_RENDER_SCALE,
            quality: super::DEFAULT_JPEG_QUALITY,
            max_dimension: super::DEFAULT_MAX_DIMENSION,
        }
    }
}
