//! Preview scheduler - the service callers talk to
//!
//! Caller side of the render worker: answers cache hits immediately, joins
//! duplicate requests onto the render already in flight and hands everything
//! else to the worker thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use flume::Sender;
use log::{debug, info};

use super::cache::{CacheStats, PreviewCache};
use super::pool::PoolStats;
use super::request::{
    Command, DocumentTicket, PendingRequest, PreviewTicket, RenderOptions, RequestError,
};
use super::source::DocumentSource;
use super::types::{DocumentId, PageKey, Preview, Priority, Variant};
use super::worker::{ProgressListener, RenderWorker, lock_shared};
use super::{
    Backend, DEFAULT_BATCH_SIZE, DEFAULT_CACHE_BYTE_BUDGET, DEFAULT_CACHE_ENTRY_CAP,
    DEFAULT_LONG_DELAY, DEFAULT_POOL_CAPACITY, DEFAULT_SHORT_DELAY,
};

/// Scheduler configuration
#[derive(Clone, Debug, PartialEq)]
pub struct SchedulerConfig {
    /// Documents kept open in the handle pool
    pub pool_capacity: usize,
    /// Aggregate estimated size of cached previews
    pub cache_byte_budget: usize,
    /// Maximum number of cached previews
    pub cache_entry_cap: usize,
    /// Requests rendered per batch between yields
    pub batch_size: usize,
    /// Debounce while only early pages are queued
    pub short_delay: Duration,
    /// Debounce once later pages are queued
    pub long_delay: Duration,
    pub render: RenderOptions,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_capacity: DEFAULT_POOL_CAPACITY,
            cache_byte_budget: DEFAULT_CACHE_BYTE_BUDGET,
            cache_entry_cap: DEFAULT_CACHE_ENTRY_CAP,
            batch_size: DEFAULT_BATCH_SIZE,
            short_delay: DEFAULT_SHORT_DELAY,
            long_delay: DEFAULT_LONG_DELAY,
            render: RenderOptions::default(),
        }
    }
}

/// State shared between callers and the worker thread.
///
/// The cache and the in-flight table live under one lock: a caller checks
/// both atomically, and the worker stores a result and retires its in-flight
/// entry atomically, so a key is never rendered twice concurrently.
pub(crate) struct Shared {
    pub cache: PreviewCache,
    pub in_flight: HashMap<PageKey, Vec<Sender<Option<Preview>>>>,
    /// Set once the worker has stopped accepting requests
    pub closed: bool,
}

/// Deduplicating, batching preview scheduler.
///
/// Create one per process with [`init`](Self::init) and share it behind an
/// `Arc`. Dropping it shuts the worker down.
pub struct PreviewScheduler {
    shared: Arc<Mutex<Shared>>,
    commands: Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
    next_seq: AtomicU64,
    batch_size: usize,
}

impl PreviewScheduler {
    /// Start the scheduler with its worker thread
    #[must_use]
    pub fn init<B: Backend>(backend: B, config: SchedulerConfig) -> Self {
        Self::init_with_progress(backend, config, None)
    }

    /// Start the scheduler, reporting per-document progress to `progress`
    #[must_use]
    pub fn init_with_progress<B: Backend>(
        backend: B,
        config: SchedulerConfig,
        progress: Option<ProgressListener>,
    ) -> Self {
        let shared = Arc::new(Mutex::new(Shared {
            cache: PreviewCache::new(config.cache_byte_budget, config.cache_entry_cap),
            in_flight: HashMap::new(),
            closed: false,
        }));

        let (commands, rx) = flume::unbounded();
        let batch_size = config.batch_size.max(1);

        info!(
            "Starting preview scheduler (pool {}, cache {} bytes / {} entries, batch {})",
            config.pool_capacity, config.cache_byte_budget, config.cache_entry_cap, batch_size
        );

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::spawn(move || {
            RenderWorker::new(backend, worker_shared, rx, config, progress).run();
        });

        Self {
            shared,
            commands,
            worker: Mutex::new(Some(worker)),
            next_seq: AtomicU64::new(0),
            batch_size,
        }
    }

    /// Request a preview of `page` (1-based) of `source`, cached under `key`.
    ///
    /// Cache hits resolve immediately. A request for a key already in flight
    /// shares that render. Caller errors are rejected before queueing.
    pub fn request_preview(
        &self,
        key: PageKey,
        source: Arc<dyn DocumentSource>,
        page: u32,
    ) -> Result<PreviewTicket, RequestError> {
        if key.document.is_empty() {
            return Err(RequestError::MissingDocumentId);
        }
        if page == 0 || key.page == 0 {
            return Err(RequestError::InvalidPage);
        }
        if key.variant == Variant::Page && key.page != page {
            return Err(RequestError::PageMismatch {
                key_page: key.page,
                page,
            });
        }
        if source.size() == 0 {
            return Err(RequestError::EmptySource {
                name: source.name().to_string(),
            });
        }

        let mut shared = lock_shared(&self.shared);
        if shared.closed {
            return Err(RequestError::ShutDown);
        }

        if let Some(preview) = shared.cache.get(&key) {
            return Ok(PreviewTicket::ready(key, preview));
        }

        let (tx, rx) = flume::bounded(1);
        if let Some(waiters) = shared.in_flight.get_mut(&key) {
            debug!("Joining in-flight render of {key}");
            waiters.push(tx);
            return Ok(PreviewTicket::new(key, rx));
        }

        let request = PendingRequest {
            key: key.clone(),
            source,
            page,
            priority: Priority::for_page(page, self.batch_size),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        if self.commands.send(Command::Enqueue(request)).is_err() {
            return Err(RequestError::ShutDown);
        }
        shared.in_flight.insert(key.clone(), vec![tx]);

        Ok(PreviewTicket::new(key, rx))
    }

    /// Request previews for several pages of one document, in page order.
    pub fn request_previews(
        &self,
        document: &DocumentId,
        source: Arc<dyn DocumentSource>,
        pages: &[u32],
    ) -> Result<Vec<PreviewTicket>, RequestError> {
        if pages.is_empty() {
            return Err(RequestError::NoPages);
        }

        let mut pages = pages.to_vec();
        pages.sort_unstable();
        pages.dedup();

        pages
            .into_iter()
            .map(|page| {
                self.request_preview(
                    PageKey::page(document.clone(), page),
                    Arc::clone(&source),
                    page,
                )
            })
            .collect()
    }

    /// Open `source` in the pool and keep a reference to it until
    /// [`release_document`](Self::release_document).
    pub fn open_document(
        &self,
        document: DocumentId,
        source: Arc<dyn DocumentSource>,
    ) -> DocumentTicket {
        let (reply, rx) = flume::bounded(1);
        let _ = self.commands.send(Command::Retain {
            document: document.clone(),
            source,
            reply,
        });
        DocumentTicket { document, rx }
    }

    /// Drop a reference taken by [`open_document`](Self::open_document).
    /// The handle stays pooled until evicted.
    pub fn release_document(&self, document: &DocumentId) {
        let _ = self.commands.send(Command::Release(document.clone()));
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        lock_shared(&self.shared).cache.stats()
    }

    /// Peek into the cache without touching recency
    #[must_use]
    pub fn is_cached(&self, key: &PageKey) -> bool {
        lock_shared(&self.shared).cache.contains(key)
    }

    pub fn clear_cache(&self) {
        lock_shared(&self.shared).cache.clear();
    }

    /// Close every pooled document
    pub fn destroy_all(&self) {
        let _ = self.commands.send(Command::DestroyAll);
    }

    /// Forget one document: its previews, its pooled handle and any of its
    /// requests still queued (those resolve to `None`).
    pub fn clear_for_document(&self, document: &DocumentId) {
        let removed = lock_shared(&self.shared).cache.remove_document(document);
        debug!("Dropped {removed} cached previews of {document}");
        let _ = self.commands.send(Command::ClearForDocument(document.clone()));
    }

    /// Pool statistics, answered by the worker between batches
    #[must_use]
    pub fn pool_stats(&self) -> Option<PoolStats> {
        let (reply, rx) = flume::bounded(1);
        self.commands.send(Command::PoolStats(reply)).ok()?;
        rx.recv().ok()
    }

    /// Stop the worker. Outstanding tickets resolve to `None`.
    pub fn shutdown(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            let _ = self.commands.send(Command::Shutdown);
            let _ = worker.join();
        }
    }
}

impl Drop for PreviewScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
