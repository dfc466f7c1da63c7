//! Scripted in-memory backend for exercising the scheduler without a real
//! document engine.
//!
//! A scripted document is plain ASCII: `name=report;pages=12;fail=3,7;delay_ms=5`.
//! Anything without a `pages=` entry fails to open, and `panic=open` makes the
//! engine panic while opening.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use crate::preview::{
    Backend, DocumentHandle, MemorySource, PageHandle, PageSize, RenderFault, Surface,
};

/// US Letter in points
pub const PAGE_SIZE: PageSize = PageSize {
    width: 612.0,
    height: 792.0,
};

#[derive(Default)]
struct Journal {
    open_calls: AtomicUsize,
    render_calls: AtomicUsize,
    renders: Mutex<Vec<(String, u32)>>,
    held: Mutex<bool>,
    resumed: Condvar,
}

/// Backend whose documents are described by a tiny text script.
///
/// Clones share one journal, so a test can keep a clone and inspect what the
/// scheduler's worker thread did.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    journal: Arc<Journal>,
}

impl ScriptedBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful and failed `open` calls
    #[must_use]
    pub fn open_calls(&self) -> usize {
        self.journal.open_calls.load(Ordering::SeqCst)
    }

    /// Number of rasterizations started
    #[must_use]
    pub fn render_calls(&self) -> usize {
        self.journal.render_calls.load(Ordering::SeqCst)
    }

    /// `(document name, page)` in the order rasterization started
    #[must_use]
    pub fn renders(&self) -> Vec<(String, u32)> {
        self.journal
            .renders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Pages rendered for one document, in order
    #[must_use]
    pub fn rendered_pages(&self, name: &str) -> Vec<u32> {
        self.renders()
            .into_iter()
            .filter(|(n, _)| n == name)
            .map(|(_, p)| p)
            .collect()
    }

    /// Block every rasterization until [`resume`](Self::resume) is called
    pub fn hold(&self) {
        *self
            .journal
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = true;
    }

    pub fn resume(&self) {
        *self
            .journal
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = false;
        self.journal.resumed.notify_all();
    }

    fn wait_while_held(&self) {
        let mut held = self
            .journal
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while *held {
            held = self
                .journal
                .resumed
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

pub struct ScriptedDocument {
    name: String,
    pages: u32,
    failing: Vec<u32>,
    delay: Duration,
    backend: ScriptedBackend,
}

impl Backend for ScriptedBackend {
    type Document = ScriptedDocument;

    fn open(&self, bytes: &[u8]) -> Result<ScriptedDocument, RenderFault> {
        self.journal.open_calls.fetch_add(1, Ordering::SeqCst);

        let script = std::str::from_utf8(bytes)
            .map_err(|_| RenderFault::generic("corrupt document: not a script"))?;

        let mut name = String::from("untitled");
        let mut pages = None;
        let mut failing = Vec::new();
        let mut delay = Duration::ZERO;

        for entry in script.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let Some((key, value)) = entry.split_once('=') else {
                continue;
            };
            match key {
                "name" => name = value.to_string(),
                "pages" => pages = value.parse::<u32>().ok(),
                "fail" => failing = value.split(',').filter_map(|p| p.parse().ok()).collect(),
                "delay_ms" => delay = Duration::from_millis(value.parse().unwrap_or(0)),
                "panic" if value == "open" => panic!("scripted engine crashed opening {name}"),
                _ => {}
            }
        }

        let pages = pages.ok_or_else(|| RenderFault::generic("corrupt document: no pages"))?;
        Ok(ScriptedDocument {
            name,
            pages,
            failing,
            delay,
            backend: self.clone(),
        })
    }
}

pub struct ScriptedPage<'a> {
    document: &'a ScriptedDocument,
    page: u32,
}

impl DocumentHandle for ScriptedDocument {
    type Page<'a> = ScriptedPage<'a>;

    fn page_count(&self) -> Result<u32, RenderFault> {
        Ok(self.pages)
    }

    fn load_page(&self, page: u32) -> Result<ScriptedPage<'_>, RenderFault> {
        if page == 0 || page > self.pages {
            return Err(RenderFault::PageOutOfRange {
                page,
                page_count: self.pages,
            });
        }
        Ok(ScriptedPage {
            document: self,
            page,
        })
    }
}

impl PageHandle for ScriptedPage<'_> {
    fn size(&self) -> Result<PageSize, RenderFault> {
        Ok(PAGE_SIZE)
    }

    fn rasterize(&self, surface: &mut Surface, _scale: f32) -> Result<(), RenderFault> {
        let doc = self.document;
        let journal = &doc.backend.journal;
        journal.render_calls.fetch_add(1, Ordering::SeqCst);
        journal
            .renders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((doc.name.clone(), self.page));

        doc.backend.wait_while_held();
        if !doc.delay.is_zero() {
            std::thread::sleep(doc.delay);
        }
        if doc.failing.contains(&self.page) {
            return Err(RenderFault::generic(format!(
                "scripted failure on page {}",
                self.page
            )));
        }

        let shade = (self.page % 200) as u8;
        for px in surface.pixels.chunks_exact_mut(3) {
            px[0] = shade;
            px[1] = 0x80;
            px[2] = 0xFF - shade;
        }
        Ok(())
    }
}

/// Script text for a document
#[must_use]
pub fn script(name: &str, pages: u32, failing: &[u32], delay_ms: u64) -> String {
    let fail = failing
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",");
    format!("name={name};pages={pages};fail={fail};delay_ms={delay_ms}")
}

/// In-memory source for a scripted document with a reproducible id
#[must_use]
pub fn scripted_source(name: &str, pages: u32) -> Arc<MemorySource> {
    scripted_source_with(name, pages, &[], 0)
}

#[must_use]
pub fn scripted_source_with(
    name: &str,
    pages: u32,
    failing: &[u32],
    delay_ms: u64,
) -> Arc<MemorySource> {
    let bytes = script(name, pages, failing, delay_ms).into_bytes();
    Arc::new(MemorySource::with_modified(name, bytes, 0))
}
