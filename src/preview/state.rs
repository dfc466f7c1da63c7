//! Progressive loader state management
//!
//! Pure state machine: commands in, effects out. The loader executes the
//! effects (opening documents, starting sweeps) and feeds completions back in
//! as commands.

use std::collections::BTreeSet;

use super::types::{DocumentId, Preview};

/// Visible page indices, 0-based and inclusive
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRange {
    pub start: usize,
    pub end: usize,
}

impl PageRange {
    #[must_use]
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            start: start.min(end),
            end: start.max(end),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoaderPhase {
    /// No document, or disabled
    Idle,
    /// Waiting for the document to open
    Initializing,
    /// Open, nothing loading
    Ready,
    /// Open, pages in flight
    Loading,
}

/// A page whose preview has been published
#[derive(Clone, Debug, PartialEq)]
pub struct LoadedPage {
    /// 0-based page index
    pub index: usize,
    /// 1-based page number
    pub page_number: u32,
    pub preview: Preview,
}

/// What the presentation layer sees
#[derive(Clone, Debug, PartialEq)]
pub struct LoaderView {
    /// Published previews, ordered by page index
    pub pages: Vec<LoadedPage>,
    pub loading: bool,
    pub total_pages: usize,
    pub loaded_pages: BTreeSet<usize>,
    pub loading_pages: BTreeSet<usize>,
    pub phase: LoaderPhase,
}

#[derive(Debug)]
pub(crate) enum Command {
    SetInput {
        document: Option<DocumentId>,
        enabled: bool,
    },
    Opened {
        epoch: u64,
        document: DocumentId,
        page_count: u32,
    },
    OpenFailed {
        epoch: u64,
    },
    SetVisibleRange(Option<PageRange>),
    /// A requested page finished, successfully or not
    PageSettled {
        epoch: u64,
        /// `None` for the unconditional initial load
        sweep: Option<u64>,
        index: usize,
        preview: Option<Preview>,
    },
    Teardown,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Effect {
    /// Stop scheduling pages of the current range sweep
    CancelSweep,
    /// Stop scheduling anything for the current document
    CancelAll,
    ReleaseDocument(DocumentId),
    OpenDocument {
        epoch: u64,
    },
    LoadPages {
        epoch: u64,
        sweep: Option<u64>,
        indices: Vec<usize>,
    },
}

pub(crate) struct LoaderState {
    document: Option<DocumentId>,
    enabled: bool,
    /// Bumped whenever the document changes; stale completions are dropped
    epoch: u64,
    /// Generation of the current range sweep
    sweep: u64,
    /// The open succeeded and a pool reference is held
    opened: bool,
    open_failed: bool,
    total_pages: usize,
    loaded: BTreeSet<usize>,
    loading: BTreeSet<usize>,
    /// Pages the current sweep marked as loading
    sweep_pages: BTreeSet<usize>,
    pages: Vec<LoadedPage>,
    visible: Option<PageRange>,
    initial_pages: usize,
    buffer: usize,
}

impl LoaderState {
    pub fn new(initial_pages: usize, buffer: usize) -> Self {
        Self {
            document: None,
            enabled: false,
            epoch: 0,
            sweep: 0,
            opened: false,
            open_failed: false,
            total_pages: 0,
            loaded: BTreeSet::new(),
            loading: BTreeSet::new(),
            sweep_pages: BTreeSet::new(),
            pages: Vec::new(),
            visible: None,
            initial_pages,
            buffer,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn document(&self) -> Option<&DocumentId> {
        self.document.as_ref()
    }

    pub fn phase(&self) -> LoaderPhase {
        if !self.enabled || self.document.is_none() || self.open_failed {
            LoaderPhase::Idle
        } else if !self.opened {
            LoaderPhase::Initializing
        } else if self.loading.is_empty() {
            LoaderPhase::Ready
        } else {
            LoaderPhase::Loading
        }
    }

    pub fn view(&self) -> LoaderView {
        let phase = self.phase();
        LoaderView {
            pages: self.pages.clone(),
            loading: matches!(phase, LoaderPhase::Initializing | LoaderPhase::Loading),
            total_pages: self.total_pages,
            loaded_pages: self.loaded.clone(),
            loading_pages: self.loading.clone(),
            phase,
        }
    }

    #[must_use]
    pub fn apply(&mut self, cmd: Command) -> Vec<Effect> {
        match cmd {
            Command::SetInput { document, enabled } => {
                if self.document == document && self.enabled == enabled {
                    return vec![];
                }
                let mut effects = self.reset();
                self.document = document;
                self.enabled = enabled;
                if enabled && self.document.is_some() {
                    effects.push(Effect::OpenDocument { epoch: self.epoch });
                }
                effects
            }

            Command::Opened {
                epoch,
                document,
                page_count,
            } => {
                if epoch != self.epoch {
                    // The input changed while opening; give the reference back
                    return vec![Effect::ReleaseDocument(document)];
                }
                self.opened = true;
                self.total_pages = page_count as usize;

                let initial: Vec<usize> = (0..self.initial_pages.min(self.total_pages)).collect();
                self.loading.extend(initial.iter().copied());

                let mut effects = Vec::new();
                if !initial.is_empty() {
                    effects.push(Effect::LoadPages {
                        epoch,
                        sweep: None,
                        indices: initial,
                    });
                }
                if self.visible.is_some() {
                    effects.extend(self.start_sweep());
                }
                effects
            }

            Command::OpenFailed { epoch } => {
                if epoch == self.epoch {
                    self.open_failed = true;
                }
                vec![]
            }

            Command::SetVisibleRange(range) => {
                if self.visible == range {
                    return vec![];
                }
                self.visible = range;
                if self.opened {
                    self.start_sweep()
                } else {
                    vec![]
                }
            }

            Command::PageSettled {
                epoch,
                sweep,
                index,
                preview,
            } => {
                self.settle(epoch, sweep, index, preview);
                vec![]
            }

            Command::Teardown => {
                let effects = self.reset();
                self.document = None;
                self.enabled = false;
                self.visible = None;
                effects
            }
        }
    }

    /// Forget the current document. Keeps the visible range.
    fn reset(&mut self) -> Vec<Effect> {
        let mut effects = vec![Effect::CancelAll];
        if self.opened {
            if let Some(document) = self.document.clone() {
                effects.push(Effect::ReleaseDocument(document));
            }
        }

        self.epoch += 1;
        self.opened = false;
        self.open_failed = false;
        self.total_pages = 0;
        self.loaded.clear();
        self.loading.clear();
        self.sweep_pages.clear();
        self.pages.clear();
        effects
    }

    /// Target window around the visible range, clamped to the document
    pub fn window(&self) -> Option<PageRange> {
        let range = self.visible?;
        if self.total_pages == 0 {
            return None;
        }
        let start = range.start.saturating_sub(self.buffer);
        let end = range
            .end
            .saturating_add(self.buffer)
            .min(self.total_pages - 1);
        (start <= end).then_some(PageRange { start, end })
    }

    /// Supersede the current sweep with one for the current visible range
    fn start_sweep(&mut self) -> Vec<Effect> {
        let mut effects = vec![Effect::CancelSweep];

        // Pages of the cancelled sweep are no longer loading: their results
        // will be dropped, and the new sweep may ask for them again.
        for index in std::mem::take(&mut self.sweep_pages) {
            self.loading.remove(&index);
        }
        self.sweep += 1;

        let Some(window) = self.window() else {
            return effects;
        };

        let indices: Vec<usize> = (window.start..=window.end)
            .filter(|i| !self.loaded.contains(i) && !self.loading.contains(i))
            .collect();
        if indices.is_empty() {
            return effects;
        }

        self.loading.extend(indices.iter().copied());
        self.sweep_pages.extend(indices.iter().copied());
        effects.push(Effect::LoadPages {
            epoch: self.epoch,
            sweep: Some(self.sweep),
            indices,
        });
        effects
    }

    fn settle(&mut self, epoch: u64, sweep: Option<u64>, index: usize, preview: Option<Preview>) {
        if epoch != self.epoch {
            return;
        }
        match sweep {
            Some(generation) if generation != self.sweep => return,
            Some(_) => {
                self.sweep_pages.remove(&index);
            }
            None => {}
        }
        if !self.loading.remove(&index) {
            return;
        }

        let Some(preview) = preview else {
            return;
        };
        self.loaded.insert(index);
        if let Err(pos) = self.pages.binary_search_by_key(&index, |p| p.index) {
            self.pages.insert(
                pos,
                LoadedPage {
                    index,
                    page_number: index as u32 + 1,
                    preview,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> DocumentId {
        DocumentId::new("left.pdf")
    }

    fn preview(index: usize) -> Option<Preview> {
        Some(format!("data:image/jpeg;base64,{index}").into())
    }

    fn opened(total: u32) -> LoaderState {
        let mut state = LoaderState::new(10, 5);
        let effects = state.apply(Command::SetInput {
            document: Some(doc()),
            enabled: true,
        });
        assert!(effects.contains(&Effect::OpenDocument { epoch: 1 }));
        assert_eq!(state.phase(), LoaderPhase::Initializing);

        let _ = state.apply(Command::Opened {
            epoch: 1,
            document: doc(),
            page_count: total,
        });
        state
    }

    fn settle_all(state: &mut LoaderState, sweep: Option<u64>, indices: impl IntoIterator<Item = usize>) {
        for index in indices {
            let _ = state.apply(Command::PageSettled {
                epoch: state.epoch(),
                sweep,
                index,
                preview: preview(index),
            });
        }
    }

    fn load_pages(effects: &[Effect]) -> Vec<(Option<u64>, Vec<usize>)> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::LoadPages { sweep, indices, .. } => Some((*sweep, indices.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn opening_loads_first_batch_unconditionally() {
        let mut state = LoaderState::new(10, 5);
        let _ = state.apply(Command::SetInput {
            document: Some(doc()),
            enabled: true,
        });
        let effects = state.apply(Command::Opened {
            epoch: 1,
            document: doc(),
            page_count: 100,
        });

        assert_eq!(load_pages(&effects), vec![(None, (0..10).collect())]);
        assert_eq!(state.phase(), LoaderPhase::Loading);
        assert!(state.view().loading);
    }

    #[test]
    fn short_document_loads_every_page() {
        let mut state = opened(3);
        assert_eq!(state.view().loading_pages, (0..3).collect());
        settle_all(&mut state, None, 0..3);
        assert_eq!(state.phase(), LoaderPhase::Ready);
        assert_eq!(state.view().pages.len(), 3);
    }

    #[test]
    fn window_is_buffered_and_clamped() {
        let mut state = opened(100);
        let _ = state.apply(Command::SetVisibleRange(Some(PageRange::new(2, 4))));
        assert_eq!(state.window(), Some(PageRange { start: 0, end: 9 }));

        let _ = state.apply(Command::SetVisibleRange(Some(PageRange::new(96, 99))));
        assert_eq!(state.window(), Some(PageRange { start: 91, end: 99 }));

        let _ = state.apply(Command::SetVisibleRange(Some(PageRange::new(150, 160))));
        assert_eq!(state.window(), None);
    }

    #[test]
    fn visible_range_before_open_is_applied_on_open() {
        let mut state = LoaderState::new(10, 5);
        let _ = state.apply(Command::SetInput {
            document: Some(doc()),
            enabled: true,
        });
        assert!(
            state
                .apply(Command::SetVisibleRange(Some(PageRange::new(40, 42))))
                .is_empty()
        );

        let effects = state.apply(Command::Opened {
            epoch: 1,
            document: doc(),
            page_count: 100,
        });
        assert_eq!(
            load_pages(&effects),
            vec![(None, (0..10).collect()), (Some(1), (35..=47).collect())]
        );
    }

    #[test]
    fn sweep_skips_loaded_and_loading_pages() {
        let mut state = opened(100);
        // Initial 0..10 still loading
        let effects = state.apply(Command::SetVisibleRange(Some(PageRange::new(6, 8))));
        assert_eq!(load_pages(&effects), vec![(Some(1), (10..=13).collect())]);

        settle_all(&mut state, None, 0..10);
        settle_all(&mut state, Some(1), 10..=13);

        let effects = state.apply(Command::SetVisibleRange(Some(PageRange::new(8, 12))));
        assert_eq!(load_pages(&effects), vec![(Some(2), (14..=17).collect())]);
    }

    #[test]
    fn loaded_and_loading_never_overlap() {
        let mut state = opened(100);
        for (start, end) in [(0, 3), (20, 25), (22, 30), (0, 1), (90, 99)] {
            let effects = state.apply(Command::SetVisibleRange(Some(PageRange::new(start, end))));
            for (sweep, indices) in load_pages(&effects) {
                settle_all(&mut state, sweep, indices.into_iter().step_by(2));
            }
            let view = state.view();
            assert!(view.loaded_pages.is_disjoint(&view.loading_pages));
        }
    }

    #[test]
    fn stale_sweep_results_are_dropped() {
        let mut state = opened(100);
        settle_all(&mut state, None, 0..10);

        let first = state.apply(Command::SetVisibleRange(Some(PageRange::new(0, 10))));
        assert_eq!(load_pages(&first), vec![(Some(1), (10..=15).collect())]);

        let second = state.apply(Command::SetVisibleRange(Some(PageRange::new(50, 60))));
        assert!(second.contains(&Effect::CancelSweep));
        assert_eq!(load_pages(&second), vec![(Some(2), (45..=65).collect())]);

        // Late arrivals from the first sweep
        settle_all(&mut state, Some(1), 10..=15);
        let view = state.view();
        assert!((10..=15).all(|i| !view.loaded_pages.contains(&i)));
        assert!(view.pages.iter().all(|p| !(10..=15).contains(&p.index)));
        assert!((10..=15).all(|i| !view.loading_pages.contains(&i)));
    }

    #[test]
    fn failed_pages_stay_absent() {
        let mut state = opened(5);
        let _ = state.apply(Command::PageSettled {
            epoch: 1,
            sweep: None,
            index: 2,
            preview: None,
        });
        settle_all(&mut state, None, [0, 1, 3, 4]);

        let view = state.view();
        assert_eq!(view.phase, LoaderPhase::Ready);
        assert_eq!(
            view.pages.iter().map(|p| p.index).collect::<Vec<_>>(),
            vec![0, 1, 3, 4]
        );
        assert!(!view.loaded_pages.contains(&2));
    }

    #[test]
    fn pages_are_published_in_order() {
        let mut state = opened(10);
        settle_all(&mut state, None, [7, 2, 9, 0, 5]);
        let numbers: Vec<_> = state.view().pages.iter().map(|p| p.page_number).collect();
        assert_eq!(numbers, vec![1, 3, 6, 8, 10]);
    }

    #[test]
    fn document_swap_resets_and_releases() {
        let mut state = opened(100);
        settle_all(&mut state, None, 0..10);

        let effects = state.apply(Command::SetInput {
            document: Some(DocumentId::new("right.pdf")),
            enabled: true,
        });
        assert_eq!(
            effects,
            vec![
                Effect::CancelAll,
                Effect::ReleaseDocument(doc()),
                Effect::OpenDocument { epoch: 2 },
            ]
        );
        let view = state.view();
        assert!(view.pages.is_empty());
        assert!(view.loaded_pages.is_empty());
        assert_eq!(view.total_pages, 0);

        // Late result for the old document
        let _ = state.apply(Command::PageSettled {
            epoch: 1,
            sweep: None,
            index: 3,
            preview: preview(3),
        });
        assert!(state.view().pages.is_empty());
    }

    #[test]
    fn stale_open_gives_reference_back() {
        let mut state = LoaderState::new(10, 5);
        let _ = state.apply(Command::SetInput {
            document: Some(doc()),
            enabled: true,
        });
        let _ = state.apply(Command::SetInput {
            document: Some(doc()),
            enabled: false,
        });
        assert_eq!(state.phase(), LoaderPhase::Idle);

        let effects = state.apply(Command::Opened {
            epoch: 1,
            document: doc(),
            page_count: 10,
        });
        assert_eq!(effects, vec![Effect::ReleaseDocument(doc())]);
        assert_eq!(state.phase(), LoaderPhase::Idle);
    }

    #[test]
    fn same_input_is_a_no_op() {
        let mut state = opened(10);
        let effects = state.apply(Command::SetInput {
            document: Some(doc()),
            enabled: true,
        });
        assert!(effects.is_empty());
        assert_eq!(state.epoch(), 1);
    }

    #[test]
    fn open_failure_goes_idle() {
        let mut state = LoaderState::new(10, 5);
        let _ = state.apply(Command::SetInput {
            document: Some(doc()),
            enabled: true,
        });
        let _ = state.apply(Command::OpenFailed { epoch: 1 });
        let view = state.view();
        assert_eq!(view.phase, LoaderPhase::Idle);
        assert!(!view.loading);
    }
}
