//! Reference-counted pool of opened documents
//!
//! Opening a document is the most expensive step of the pipeline, so opened
//! handles are kept around and reused across requests. Handles are evicted
//! lazily: only when a new document must be opened and the pool is full, and
//! only if nobody holds a reference.
//!
//! When every pooled handle is referenced the new document is opened anyway
//! and the pool temporarily holds more than `capacity` handles. Failing the
//! request instead would turn legitimate concurrent access into errors.

use std::collections::HashMap;
use std::time::Instant;

use log::{debug, info};
use serde::Serialize;

use super::backend::{Backend, DocumentHandle};
use super::request::RenderFault;
use super::types::DocumentId;

/// Default number of concurrently pooled handles
pub const DEFAULT_POOL_CAPACITY: usize = 10;

struct PooledHandle<D> {
    document: D,
    last_used: Instant,
    /// Monotonic touch counter, orders handles touched within the same instant
    touched: u64,
    ref_count: usize,
}

/// Pool statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Handles currently open
    pub open: usize,
    /// Handles with a non-zero reference count
    pub referenced: usize,
    pub capacity: usize,
    /// Documents opened since creation
    pub opened_total: usize,
    /// Handles evicted to make room
    pub evicted_total: usize,
}

pub struct DocumentPool<B: Backend> {
    backend: B,
    handles: HashMap<DocumentId, PooledHandle<B::Document>>,
    capacity: usize,
    clock: u64,
    opened_total: usize,
    evicted_total: usize,
}

impl<B: Backend> DocumentPool<B> {
    #[must_use]
    pub fn new(backend: B, capacity: usize) -> Self {
        Self {
            backend,
            handles: HashMap::new(),
            capacity: capacity.max(1),
            clock: 0,
            opened_total: 0,
            evicted_total: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Get a handle for `id`, opening it from `bytes` if not pooled.
    ///
    /// Increments the reference count; pair every successful call with
    /// [`release`](Self::release). On open failure nothing is pooled.
    pub fn acquire(&mut self, id: &DocumentId, bytes: &[u8]) -> Result<&B::Document, RenderFault> {
        let touched = self.tick();

        if !self.handles.contains_key(id) {
            self.evict_one_if_needed();
            let document = self.backend.open(bytes)?;
            self.opened_total += 1;
            debug!("Opened document {id} ({} pooled)", self.handles.len() + 1);
            self.handles.insert(
                id.clone(),
                PooledHandle {
                    document,
                    last_used: Instant::now(),
                    touched,
                    ref_count: 0,
                },
            );
        }

        let handle = self
            .handles
            .get_mut(id)
            .ok_or_else(|| RenderFault::generic(format!("document {id} vanished from pool")))?;
        handle.ref_count += 1;
        handle.last_used = Instant::now();
        handle.touched = touched;
        Ok(&handle.document)
    }

    /// Borrow an already-pooled handle without touching its reference count
    #[must_use]
    pub fn get(&self, id: &DocumentId) -> Option<&B::Document> {
        self.handles.get(id).map(|h| &h.document)
    }

    /// Page count of a pooled document
    pub fn page_count(&self, id: &DocumentId) -> Option<Result<u32, RenderFault>> {
        self.get(id).map(DocumentHandle::page_count)
    }

    /// Drop one reference. Never closes the document.
    pub fn release(&mut self, id: &DocumentId) {
        if let Some(handle) = self.handles.get_mut(id) {
            handle.ref_count = handle.ref_count.saturating_sub(1);
        }
    }

    /// Evict the least recently used unreferenced handle if the pool is full.
    ///
    /// Returns the evicted id. When every handle is referenced nothing is
    /// evicted and the caller proceeds over capacity.
    pub fn evict_one_if_needed(&mut self) -> Option<DocumentId> {
        if self.handles.len() < self.capacity {
            return None;
        }

        let victim = self
            .handles
            .iter()
            .filter(|(_, h)| h.ref_count == 0)
            .min_by_key(|(_, h)| (h.last_used, h.touched))
            .map(|(id, _)| id.clone());

        match victim {
            Some(id) => {
                self.handles.remove(&id);
                self.evicted_total += 1;
                debug!("Evicted pooled document {id}");
                Some(id)
            }
            None => {
                info!(
                    "All {} pooled documents are referenced, exceeding capacity {}",
                    self.handles.len(),
                    self.capacity
                );
                None
            }
        }
    }

    /// Close one document regardless of its reference count
    pub fn destroy_for_document(&mut self, id: &DocumentId) -> bool {
        self.handles.remove(id).is_some()
    }

    /// Close every document regardless of reference counts
    pub fn destroy_all(&mut self) {
        self.handles.clear();
    }

    #[must_use]
    pub fn contains(&self, id: &DocumentId) -> bool {
        self.handles.contains_key(id)
    }

    #[must_use]
    pub fn ref_count(&self, id: &DocumentId) -> Option<usize> {
        self.handles.get(id).map(|h| h.ref_count)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            open: self.handles.len(),
            referenced: self.handles.values().filter(|h| h.ref_count > 0).count(),
            capacity: self.capacity,
            opened_total: self.opened_total,
            evicted_total: self.evicted_total,
        }
    }
}
