//! Byte-budgeted LRU cache for encoded previews

use std::time::Instant;

use log::{debug, warn};
use lru::LruCache;
use serde::Serialize;

use super::types::{DocumentId, PageKey, Preview};

/// Estimated bytes per character of an encoded preview.
///
/// Over-estimates to cover string and encoding overhead.
const BYTES_PER_CHAR: usize = 2;

/// A cached encoded preview
#[derive(Clone, Debug)]
pub struct CachedPreview {
    pub encoded: Preview,
    pub last_used: Instant,
    pub size_bytes: usize,
}

/// Cache introspection snapshot
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub count: usize,
    pub size_bytes: usize,
    pub byte_budget: usize,
    pub entry_cap: usize,
}

/// LRU cache bounded both by estimated bytes and by entry count.
///
/// After every call `size_bytes <= byte_budget` and `count <= entry_cap`.
/// The least recently used entry is evicted first.
pub struct PreviewCache {
    entries: LruCache<PageKey, CachedPreview>,
    size_bytes: usize,
    byte_budget: usize,
    entry_cap: usize,
}

impl PreviewCache {
    #[must_use]
    pub fn new(byte_budget: usize, entry_cap: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            size_bytes: 0,
            byte_budget,
            entry_cap: entry_cap.max(1),
        }
    }

    #[must_use]
    pub fn estimate_size(encoded: &str) -> usize {
        encoded.chars().count() * BYTES_PER_CHAR
    }

    /// Look up a preview, refreshing its recency
    pub fn get(&mut self, key: &PageKey) -> Option<Preview> {
        let entry = self.entries.get_mut(key)?;
        entry.last_used = Instant::now();
        Some(entry.encoded.clone())
    }

    /// Check if a key is cached without promoting it
    #[must_use]
    pub fn contains(&self, key: &PageKey) -> bool {
        self.entries.contains(key)
    }

    /// Insert a preview. Re-inserting a present key only refreshes recency.
    ///
    /// Returns `false` when the preview alone exceeds the byte budget and was
    /// not stored.
    pub fn put(&mut self, key: PageKey, encoded: Preview) -> bool {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.last_used = Instant::now();
            return true;
        }

        let size = Self::estimate_size(&encoded);
        if size > self.byte_budget {
            warn!(
                "Preview {key} ({size} bytes) exceeds cache budget of {} bytes, not caching",
                self.byte_budget
            );
            return false;
        }

        while self.size_bytes + size > self.byte_budget || self.entries.len() >= self.entry_cap {
            if !self.evict_lru() {
                break;
            }
        }

        self.size_bytes += size;
        self.entries.put(
            key,
            CachedPreview {
                encoded,
                last_used: Instant::now(),
                size_bytes: size,
            },
        );
        true
    }

    fn evict_lru(&mut self) -> bool {
        match self.entries.pop_lru() {
            Some((key, evicted)) => {
                self.size_bytes -= evicted.size_bytes;
                debug!("Evicted preview {key} ({} bytes)", evicted.size_bytes);
                true
            }
            None => false,
        }
    }

    /// Drop every preview of one document
    pub fn remove_document(&mut self, document: &DocumentId) -> usize {
        let keys: Vec<_> = self
            .entries
            .iter()
            .filter(|(k, _)| &k.document == document)
            .map(|(k, _)| k.clone())
            .collect();

        for key in &keys {
            if let Some(removed) = self.entries.pop(key) {
                self.size_bytes -= removed.size_bytes;
            }
        }
        keys.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.size_bytes = 0;
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            count: self.entries.len(),
            size_bytes: self.size_bytes,
            byte_budget: self.byte_budget,
            entry_cap: self.entry_cap,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
