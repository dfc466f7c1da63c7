//! Render worker - the scheduler's single consumer thread
//!
//! Owns the request queue and the document pool. Requests are debounced,
//! sorted by page number, cut into batches, grouped by document and rendered
//! one page at a time. The bytes materialized for a document are reused for the
//! rest of the drain and dropped once the queue empties.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, TryRecvError};
use log::{debug, error, info, warn};

use super::backend::{Backend, DocumentHandle, PageHandle, encode_jpeg_data_uri};
use super::pool::DocumentPool;
use super::request::{
    Command, DocumentInfo, GroupProgress, OpenError, PendingRequest, RenderFault, RenderOptions,
};
use super::service::{SchedulerConfig, Shared};
use super::source::{DocumentSource, SourceError};
use super::types::{DocumentId, PageKey, PageSize, Preview, Priority, Surface};

/// Callback invoked after each document group of a batch
pub type ProgressListener = Arc<dyn Fn(&GroupProgress) + Send + Sync>;

/// Rasterization parameters for one page
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct RasterSpec {
    pub scale: f32,
    pub width: u32,
    pub height: u32,
}

impl RasterSpec {
    pub fn compute(page: PageSize, options: &RenderOptions) -> Self {
        let mut scale = options.scale.max(0.01);
        let (mut width, mut height) = page.viewport(scale);

        let max_dim = width.max(height);
        if options.max_dimension > 0 && max_dim > options.max_dimension {
            scale *= options.max_dimension as f32 / max_dim as f32;
            (width, height) = page.viewport(scale);
            // Rounding can still overshoot by a pixel
            width = width.min(options.max_dimension);
            height = height.min(options.max_dimension);
        }

        Self {
            scale,
            width,
            height,
        }
    }
}

/// Which pipeline stage failed
#[derive(Debug)]
pub(crate) enum PageFailure {
    /// The document itself could not be opened; siblings will fail too
    Open(RenderFault),
    /// Only this page failed
    Page(RenderFault),
}

/// Decode, rasterize and encode one page.
///
/// Acquires the pooled handle for the duration of the page and releases it
/// afterwards, success or not.
pub(crate) fn render_page<B: Backend>(
    pool: &mut DocumentPool<B>,
    document: &DocumentId,
    bytes: &[u8],
    page: u32,
    options: &RenderOptions,
) -> Result<String, PageFailure> {
    let result = {
        let handle = pool.acquire(document, bytes).map_err(PageFailure::Open)?;
        rasterize_page(handle, page, options)
    };
    pool.release(document);
    result.map_err(PageFailure::Page)
}

fn rasterize_page<D: DocumentHandle>(
    document: &D,
    page: u32,
    options: &RenderOptions,
) -> Result<String, RenderFault> {
    let page_count = document.page_count()?;
    if page == 0 || page > page_count {
        return Err(RenderFault::PageOutOfRange { page, page_count });
    }

    let surface = {
        let handle = document.load_page(page)?;
        let spec = RasterSpec::compute(handle.size()?, options);
        let mut surface = Surface::blank(spec.width, spec.height);
        handle.rasterize(&mut surface, spec.scale)?;
        surface
    };

    encode_jpeg_data_uri(&surface, options.quality)
}

pub(crate) fn lock_shared(shared: &Mutex<Shared>) -> std::sync::MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct RenderWorker<B: Backend> {
    pool: DocumentPool<B>,
    shared: Arc<Mutex<Shared>>,
    commands: Receiver<Command>,
    config: SchedulerConfig,
    progress: Option<ProgressListener>,
    queue: Vec<PendingRequest>,
    /// Bytes materialized during the current drain
    bytes: HashMap<DocumentId, Result<Arc<[u8]>, SourceError>>,
    flush_at: Option<Instant>,
    running: bool,
}

impl<B: Backend> RenderWorker<B> {
    pub fn new(
        backend: B,
        shared: Arc<Mutex<Shared>>,
        commands: Receiver<Command>,
        config: SchedulerConfig,
        progress: Option<ProgressListener>,
    ) -> Self {
        Self {
            pool: DocumentPool::new(backend, config.pool_capacity),
            shared,
            commands,
            config,
            progress,
            queue: Vec::new(),
            bytes: HashMap::new(),
            flush_at: None,
            running: true,
        }
    }

    /// Run until shutdown or until every sender is gone.
    ///
    /// Outstanding requests are settled on the way out, also when the loop
    /// itself panicked.
    pub fn run(mut self) {
        info!("Render worker started");

        if panic::catch_unwind(AssertUnwindSafe(|| self.serve())).is_err() {
            error!("Render worker panicked, settling outstanding requests");
        }

        self.abandon_pending();
        self.pool.destroy_all();
        info!("Render worker stopped");
    }

    fn serve(&mut self) {
        while self.running {
            let command = match self.flush_at {
                None => match self.commands.recv() {
                    Ok(command) => command,
                    Err(_) => break,
                },
                Some(deadline) => match self.commands.recv_deadline(deadline) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => {
                        self.flush_at = None;
                        self.drain();
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                },
            };
            self.handle(command);
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Enqueue(request) => {
                self.queue.push(request);
                let delay = self.debounce_delay();
                self.flush_at = Some(Instant::now() + delay);
            }

            Command::Retain {
                document,
                source,
                reply,
            } => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    self.retain(&document, source.as_ref())
                }));
                let result = outcome.unwrap_or_else(|_| {
                    warn!("Opening {document} panicked");
                    Err(OpenError {
                        document: document.clone(),
                        detail: "document engine panicked while opening".to_string(),
                    })
                });
                let _ = reply.send(result);
            }

            Command::Release(document) => {
                self.pool.release(&document);
            }

            Command::ClearForDocument(document) => {
                self.pool.destroy_for_document(&document);
                self.bytes.remove(&document);

                let (dropped, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.queue)
                    .into_iter()
                    .partition(|r| r.key.document == document);
                self.queue = kept;
                for request in dropped {
                    self.resolve(request.key, None);
                }
                debug!("Cleared document {document}");
            }

            Command::DestroyAll => {
                self.pool.destroy_all();
                self.bytes.clear();
            }

            Command::PoolStats(reply) => {
                let _ = reply.send(self.pool.stats());
            }

            Command::Shutdown => {
                self.running = false;
            }
        }
    }

    /// Short tier while everything queued is likely visible, long tier otherwise
    fn debounce_delay(&self) -> Duration {
        if self.queue.iter().all(|r| r.priority == Priority::High) {
            self.config.short_delay
        } else {
            self.config.long_delay
        }
    }

    fn retain(
        &mut self,
        document: &DocumentId,
        source: &dyn DocumentSource,
    ) -> Result<DocumentInfo, OpenError> {
        let open_error = |detail: String| OpenError {
            document: document.clone(),
            detail,
        };

        let bytes = match self.bytes.get(document) {
            Some(Ok(bytes)) => Arc::clone(bytes),
            _ => source.materialize().map_err(|e| open_error(e.to_string()))?,
        };
        let page_count = {
            let handle = self
                .pool
                .acquire(document, &bytes)
                .map_err(|e| open_error(e.to_string()))?;
            handle.page_count()
        };

        match page_count {
            Ok(page_count) => Ok(DocumentInfo {
                document: document.clone(),
                page_count,
            }),
            Err(e) => {
                self.pool.release(document);
                Err(open_error(e.to_string()))
            }
        }
    }

    fn materialize(
        &mut self,
        document: &DocumentId,
        source: &dyn DocumentSource,
    ) -> Result<Arc<[u8]>, SourceError> {
        self.bytes
            .entry(document.clone())
            .or_insert_with(|| source.materialize())
            .clone()
    }

    fn drain(&mut self) {
        while self.running && !self.queue.is_empty() {
            self.queue.sort_by_key(|r| (r.page, r.seq));
            let take = self.config.batch_size.max(1).min(self.queue.len());
            let batch: Vec<_> = self.queue.drain(..take).collect();

            debug!(
                "Rendering batch of {} ({} still queued)",
                batch.len(),
                self.queue.len()
            );

            for (document, group) in group_by_document(batch) {
                self.render_group(&document, group);
            }

            self.absorb_commands();
        }
        self.bytes.clear();
    }

    /// Yield point between batches: take in whatever arrived meanwhile so that
    /// newly requested low pages compete in the next sort.
    fn absorb_commands(&mut self) {
        loop {
            match self.commands.try_recv() {
                Ok(command) => self.handle(command),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.running = false;
                    break;
                }
            }
        }
        // The drain loop serves anything just enqueued
        self.flush_at = None;
    }

    fn render_group(&mut self, document: &DocumentId, group: Vec<PendingRequest>) {
        let total = group.len();
        let Some(source) = group.first().map(|r| Arc::clone(&r.source)) else {
            return;
        };

        let bytes = match self.materialize(document, source.as_ref()) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("Failed to read {document}: {e}");
                None
            }
        };

        let mut open_failed = bytes.is_none();
        let mut completed = 0;

        for request in group {
            let preview = match &bytes {
                Some(bytes) if !open_failed => {
                    let pool = &mut self.pool;
                    let options = &self.config.render;
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                        render_page(pool, document, bytes, request.page, options)
                    }));

                    match outcome {
                        Ok(Ok(encoded)) => Some(encoded),
                        Ok(Err(PageFailure::Open(e))) => {
                            warn!("Failed to open {document}: {e}");
                            open_failed = true;
                            None
                        }
                        Ok(Err(PageFailure::Page(e))) => {
                            warn!("Failed to render {}: {e}", request.key);
                            None
                        }
                        Err(_) => {
                            warn!("Render of {} panicked", request.key);
                            // The reference taken by acquire was never returned
                            self.pool.release(document);
                            None
                        }
                    }
                }
                _ => None,
            };

            completed += 1;
            self.resolve(request.key, preview);
        }

        if let Some(progress) = &self.progress {
            let report = GroupProgress {
                document: document.clone(),
                completed,
                total,
            };
            if panic::catch_unwind(AssertUnwindSafe(|| progress(&report))).is_err() {
                warn!("Progress listener panicked for {document}");
            }
        }
    }

    /// Store a success in the cache and settle every waiter for the key
    fn resolve(&self, key: PageKey, encoded: Option<String>) {
        let preview: Option<Preview> = encoded.map(Preview::from);
        let waiters = {
            let mut shared = lock_shared(&self.shared);
            if let Some(preview) = &preview {
                shared.cache.put(key.clone(), preview.clone());
            }
            shared.in_flight.remove(&key).unwrap_or_default()
        };

        for waiter in waiters {
            let _ = waiter.send(preview.clone());
        }
    }

    /// Settle everything still outstanding with `None`
    fn abandon_pending(&mut self) {
        let waiters = {
            let mut shared = lock_shared(&self.shared);
            shared.closed = true;
            std::mem::take(&mut shared.in_flight)
        };

        let count = waiters.len();
        for waiter in waiters.into_values().flatten() {
            let _ = waiter.send(None);
        }
        self.queue.clear();

        // Late retain requests still expect an answer
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Retain {
                document, reply, ..
            } = command
            {
                let _ = reply.send(Err(OpenError {
                    document,
                    detail: "scheduler has shut down".to_string(),
                }));
            }
        }

        if count > 0 {
            debug!("Abandoned {count} pending previews on shutdown");
        }
    }
}

/// Partition a sorted batch by document, keeping the sort order inside each
/// group and ordering groups by their first (lowest) page.
fn group_by_document(batch: Vec<PendingRequest>) -> Vec<(DocumentId, Vec<PendingRequest>)> {
    let mut groups: Vec<(DocumentId, Vec<PendingRequest>)> = Vec::new();
    for request in batch {
        match groups
            .iter_mut()
            .find(|(document, _)| *document == request.key.document)
        {
            Some((_, group)) => group.push(request),
            None => groups.push((request.key.document.clone(), vec![request])),
        }
    }
    groups
}
