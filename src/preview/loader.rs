//! Progressive range loader for one pane of a comparison view
//!
//! Opens a document through the scheduler, loads its first pages, then keeps
//! a buffered window around the visible range loaded. Range changes cancel
//! the previous sweep; its late results are dropped when applied.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use flume::{Receiver, Sender};
use log::{debug, warn};

use super::request::{DocumentInfo, OpenError, PreviewTicket};
use super::service::PreviewScheduler;
use super::source::DocumentSource;
use super::state::{Command, Effect, LoaderState, LoaderView, PageRange};
use super::types::{DocumentId, PageKey, Preview};
use super::{DEFAULT_BATCH_SIZE, DEFAULT_RANGE_BUFFER, DEFAULT_SWEEP_CONCURRENCY};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Pages loaded unconditionally once the document opens
    pub batch_size: usize,
    /// Pages added on each side of the visible range
    pub buffer: usize,
    /// Requests a sweep keeps in flight
    pub max_concurrent: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            buffer: DEFAULT_RANGE_BUFFER,
            max_concurrent: DEFAULT_SWEEP_CONCURRENCY,
        }
    }
}

/// What the pane is showing
#[derive(Clone, Debug, Default)]
pub struct LoaderInput {
    pub file: Option<Arc<dyn DocumentSource>>,
    pub enabled: bool,
    /// Overrides the id derived from the file's metadata
    pub cache_key: Option<String>,
}

impl LoaderInput {
    #[must_use]
    pub fn new(file: Arc<dyn DocumentSource>) -> Self {
        Self {
            file: Some(file),
            enabled: true,
            cache_key: None,
        }
    }

    #[must_use]
    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    fn document_id(&self) -> Option<DocumentId> {
        let file = self.file.as_ref()?;
        match &self.cache_key {
            Some(key) if !key.is_empty() => Some(DocumentId::new(key.as_str())),
            _ => Some(file.document_id()),
        }
    }
}

#[derive(Clone, Default)]
struct CancelToken(Arc<Mutex<bool>>);

impl CancelToken {
    fn cancel(&self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }

    fn is_cancelled(&self) -> bool {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` unless cancelled. Cancellation waits for a running `f`.
    fn unless_cancelled<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let cancelled = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if *cancelled { None } else { Some(f()) }
    }
}

/// Completions reported by background threads
enum LoaderEvent {
    Opened {
        epoch: u64,
        result: Result<DocumentInfo, OpenError>,
    },
    Page {
        epoch: u64,
        sweep: Option<u64>,
        index: usize,
        preview: Option<Preview>,
    },
}

/// Drives [`LoaderState`] against a shared [`PreviewScheduler`].
///
/// Background threads only issue requests and report completions; all state
/// changes happen on the owner's thread in [`poll`](Self::poll).
pub struct ProgressiveLoader {
    scheduler: Arc<PreviewScheduler>,
    config: LoaderConfig,
    state: LoaderState,
    source: Option<Arc<dyn DocumentSource>>,
    events_tx: Sender<LoaderEvent>,
    events_rx: Receiver<LoaderEvent>,
    /// Cancelled when the document changes
    document_token: CancelToken,
    /// Cancelled when the visible range changes
    sweep_token: CancelToken,
}

impl ProgressiveLoader {
    #[must_use]
    pub fn new(scheduler: Arc<PreviewScheduler>, config: LoaderConfig) -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        let state = LoaderState::new(config.batch_size, config.buffer);
        Self {
            scheduler,
            config,
            state,
            source: None,
            events_tx,
            events_rx,
            document_token: CancelToken::default(),
            sweep_token: CancelToken::default(),
        }
    }

    /// Switch to a different document or toggle loading
    pub fn set_input(&mut self, input: LoaderInput) {
        let document = input.document_id();
        self.source = input.file;
        let effects = self.state.apply(Command::SetInput {
            document,
            enabled: input.enabled,
        });
        self.execute(effects);
    }

    /// Load the buffered window around `range` (0-based page indices)
    pub fn set_visible_range(&mut self, range: PageRange) {
        let effects = self.state.apply(Command::SetVisibleRange(Some(range)));
        self.execute(effects);
    }

    /// Apply completions that have arrived; returns how many were applied
    pub fn poll(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
            applied += 1;
        }
        applied
    }

    /// Block until nothing is loading or `timeout` passes.
    /// Returns `false` on timeout.
    pub fn settle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.poll();
            if !self.state.view().loading {
                return true;
            }
            match self.events_rx.recv_deadline(deadline) {
                Ok(event) => self.handle_event(event),
                Err(_) => return false,
            }
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> LoaderView {
        self.state.view()
    }

    /// Stop all work and give back the document reference
    pub fn teardown(&mut self) {
        let effects = self.state.apply(Command::Teardown);
        self.execute(effects);
        self.source = None;
        // An open that finished before the cancellation is already queued here
        self.poll();
    }

    fn handle_event(&mut self, event: LoaderEvent) {
        let command = match event {
            LoaderEvent::Opened { epoch, result } => match result {
                Ok(info) => Command::Opened {
                    epoch,
                    document: info.document,
                    page_count: info.page_count,
                },
                Err(err) => {
                    warn!("Could not open {}: {}", err.document, err.detail);
                    Command::OpenFailed { epoch }
                }
            },
            LoaderEvent::Page {
                epoch,
                sweep,
                index,
                preview,
            } => Command::PageSettled {
                epoch,
                sweep,
                index,
                preview,
            },
        };
        let effects = self.state.apply(command);
        self.execute(effects);
    }

    fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::CancelSweep => {
                    self.sweep_token.cancel();
                    self.sweep_token = CancelToken::default();
                }
                Effect::CancelAll => {
                    self.sweep_token.cancel();
                    self.document_token.cancel();
                    self.sweep_token = CancelToken::default();
                    self.document_token = CancelToken::default();
                }
                Effect::ReleaseDocument(document) => {
                    debug!("Releasing {document}");
                    self.scheduler.release_document(&document);
                }
                Effect::OpenDocument { epoch } => self.open(epoch),
                Effect::LoadPages {
                    epoch,
                    sweep,
                    indices,
                } => self.load(epoch, sweep, indices),
            }
        }
    }

    fn open(&mut self, epoch: u64) {
        let (Some(document), Some(source)) = (self.state.document().cloned(), self.source.clone())
        else {
            return;
        };

        let ticket = self.scheduler.open_document(document, source);
        let events = self.events_tx.clone();
        let token = self.document_token.clone();
        let scheduler = Arc::clone(&self.scheduler);
        std::thread::spawn(move || {
            let result = ticket.wait();
            let opened = result.as_ref().ok().map(|info| info.document.clone());
            let delivered = token
                .unless_cancelled(|| events.send(LoaderEvent::Opened { epoch, result }).is_ok())
                .unwrap_or(false);
            if let (false, Some(document)) = (delivered, opened) {
                debug!("Open of {document} finished after its loader moved on");
                scheduler.release_document(&document);
            }
        });
    }

    fn load(&mut self, epoch: u64, sweep: Option<u64>, indices: Vec<usize>) {
        let (Some(document), Some(source)) = (self.state.document().cloned(), self.source.clone())
        else {
            return;
        };
        let token = match sweep {
            Some(_) => self.sweep_token.clone(),
            None => self.document_token.clone(),
        };

        debug!(
            "Loading {} pages of {document} (sweep {sweep:?})",
            indices.len()
        );

        let sweep_job = Sweep {
            scheduler: Arc::clone(&self.scheduler),
            document,
            source,
            epoch,
            sweep,
            token,
            events: self.events_tx.clone(),
            max_concurrent: self.config.max_concurrent.max(1),
        };
        std::thread::spawn(move || sweep_job.run(indices));
    }
}

impl Drop for ProgressiveLoader {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// One batch of page requests running on its own thread
struct Sweep {
    scheduler: Arc<PreviewScheduler>,
    document: DocumentId,
    source: Arc<dyn DocumentSource>,
    epoch: u64,
    sweep: Option<u64>,
    token: CancelToken,
    events: Sender<LoaderEvent>,
    max_concurrent: usize,
}

impl Sweep {
    fn run(self, indices: Vec<usize>) {
        let mut pending = indices.into_iter();
        let mut in_flight: VecDeque<(usize, Option<PreviewTicket>)> = VecDeque::new();

        loop {
            while in_flight.len() < self.max_concurrent && !self.token.is_cancelled() {
                let Some(index) = pending.next() else {
                    break;
                };
                in_flight.push_back((index, self.request(index)));
            }

            let Some((index, ticket)) = in_flight.pop_front() else {
                break;
            };
            let preview = ticket.and_then(PreviewTicket::wait);
            if self
                .events
                .send(LoaderEvent::Page {
                    epoch: self.epoch,
                    sweep: self.sweep,
                    index,
                    preview,
                })
                .is_err()
            {
                // Loader is gone
                return;
            }
        }
    }

    fn request(&self, index: usize) -> Option<PreviewTicket> {
        let page = index as u32 + 1;
        let key = PageKey::page(self.document.clone(), page);
        match self
            .scheduler
            .request_preview(key, Arc::clone(&self.source), page)
        {
            Ok(ticket) => Some(ticket),
            Err(err) => {
                warn!("Preview request for page {page} of {} rejected: {err}", self.document);
                None
            }
        }
    }
}
