use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use folio::preview::{
    DocumentId, GroupProgress, PageKey, PreviewScheduler, ProgressListener, SchedulerConfig,
    decode_data_uri,
};
use folio::test_utils::{ScriptedBackend, scripted_source, scripted_source_with};

const WAIT: Duration = Duration::from_secs(10);

fn config() -> SchedulerConfig {
    SchedulerConfig {
        short_delay: Duration::from_millis(20),
        long_delay: Duration::from_millis(50),
        ..SchedulerConfig::default()
    }
}

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn duplicate_requests_render_once() {
    let backend = ScriptedBackend::new();
    let scheduler = PreviewScheduler::init(backend.clone(), config());
    let source = scripted_source("report", 10);
    let key = PageKey::page(source_id(&source), 3);

    let first = scheduler
        .request_preview(key.clone(), source.clone(), 3)
        .unwrap();
    let second = scheduler.request_preview(key, source, 3).unwrap();

    let a = first.wait().expect("first preview");
    let b = second.wait().expect("second preview");
    assert_eq!(a, b);
    assert_eq!(backend.render_calls(), 1);
}

#[test]
fn cached_preview_is_served_without_rendering() {
    let backend = ScriptedBackend::new();
    let scheduler = PreviewScheduler::init(backend.clone(), config());
    let source = scripted_source("report", 10);
    let key = PageKey::page(source_id(&source), 1);

    let rendered = scheduler
        .request_preview(key.clone(), source.clone(), 1)
        .unwrap()
        .wait()
        .unwrap();
    assert!(decode_data_uri(&rendered).is_some());

    let again = scheduler.request_preview(key.clone(), source, 1).unwrap();
    assert_eq!(again.try_get(), Some(Some(rendered)));
    assert_eq!(backend.render_calls(), 1);
    assert!(scheduler.is_cached(&key));
    assert_eq!(scheduler.cache_stats().count, 1);
}

#[test]
fn queued_requests_render_in_page_order() {
    let backend = ScriptedBackend::new();
    let scheduler = PreviewScheduler::init(
        backend.clone(),
        SchedulerConfig {
            long_delay: Duration::from_millis(200),
            ..config()
        },
    );
    let source = scripted_source("report", 60);
    let document = source_id(&source);

    let tickets: Vec<_> = [50, 1, 25]
        .into_iter()
        .map(|page| {
            scheduler
                .request_preview(PageKey::page(document.clone(), page), source.clone(), page)
                .unwrap()
        })
        .collect();
    for ticket in tickets {
        assert!(ticket.wait().is_some());
    }

    assert_eq!(backend.rendered_pages("report"), vec![1, 25, 50]);
}

#[test]
fn request_previews_dedups_and_sorts() {
    let backend = ScriptedBackend::new();
    let scheduler = PreviewScheduler::init(backend.clone(), config());
    let source = scripted_source("report", 10);

    let tickets = scheduler
        .request_previews(&source_id(&source), source, &[4, 2, 4, 3])
        .unwrap();
    let pages: Vec<u32> = tickets.iter().map(|t| t.key().page).collect();
    assert_eq!(pages, vec![2, 3, 4]);
    assert!(tickets.into_iter().all(|t| t.wait().is_some()));
    assert_eq!(backend.render_calls(), 3);
}

#[test]
fn failing_page_does_not_affect_its_neighbours() {
    let backend = ScriptedBackend::new();
    let scheduler = PreviewScheduler::init(backend.clone(), config());
    let source = scripted_source_with("flaky", 3, &[2], 0);
    let document = source_id(&source);

    let results: Vec<_> = scheduler
        .request_previews(&document, source.clone(), &[1, 2, 3])
        .unwrap()
        .into_iter()
        .map(|t| t.wait().is_some())
        .collect();
    assert_eq!(results, vec![true, false, true]);

    // Failures are not cached; a retry renders again
    assert!(!scheduler.is_cached(&PageKey::page(document.clone(), 2)));
    let retry = scheduler
        .request_preview(PageKey::page(document, 2), source, 2)
        .unwrap();
    assert!(retry.wait().is_none());
    assert_eq!(backend.rendered_pages("flaky"), vec![1, 2, 3, 2]);
}

#[test]
fn page_past_the_end_resolves_to_none() {
    let scheduler = PreviewScheduler::init(ScriptedBackend::new(), config());
    let source = scripted_source("short", 2);
    let ticket = scheduler
        .request_preview(PageKey::page(source_id(&source), 5), source, 5)
        .unwrap();
    assert!(ticket.wait().is_none());
}

#[test]
fn unopenable_document_resolves_every_request_to_none() {
    let backend = ScriptedBackend::new();
    let scheduler = PreviewScheduler::init(backend.clone(), config());
    let corrupt: Arc<folio::preview::MemorySource> = Arc::new(
        folio::preview::MemorySource::with_modified("corrupt", b"%PDF-garbage".to_vec(), 0),
    );
    let document = DocumentId::new("corrupt");

    let tickets = scheduler
        .request_previews(&document, corrupt, &[1, 2, 3])
        .unwrap();
    assert!(tickets.into_iter().all(|t| t.wait().is_none()));
    // One failed open short-circuits the rest of the group
    assert_eq!(backend.open_calls(), 1);
    assert_eq!(backend.render_calls(), 0);
}

#[test]
fn pool_stays_bounded_across_many_documents() {
    let backend = ScriptedBackend::new();
    let scheduler = PreviewScheduler::init(backend.clone(), config());

    for i in 0..15 {
        let source = scripted_source(&format!("doc{i}"), 2);
        let ticket = scheduler
            .request_preview(PageKey::page(source_id(&source), 1), source, 1)
            .unwrap();
        assert!(ticket.wait().is_some());
    }

    let stats = scheduler.pool_stats().unwrap();
    assert!(stats.open <= 10, "{stats:?}");
    assert_eq!(stats.opened_total, 15);
    assert_eq!(stats.evicted_total, 5);
    assert_eq!(backend.open_calls(), 15);
}

#[test]
fn progress_is_reported_per_document() {
    let seen: Arc<Mutex<Vec<GroupProgress>>> = Arc::default();
    let sink = Arc::clone(&seen);
    let listener: ProgressListener = Arc::new(move |p: &GroupProgress| {
        sink.lock().unwrap().push(p.clone());
    });

    let scheduler =
        PreviewScheduler::init_with_progress(ScriptedBackend::new(), config(), Some(listener));
    let left = scripted_source("left", 5);
    let right = scripted_source("right", 5);

    let mut tickets = scheduler
        .request_previews(&source_id(&left), left.clone(), &[1, 2, 3])
        .unwrap();
    tickets.extend(
        scheduler
            .request_previews(&source_id(&right), right.clone(), &[1, 2])
            .unwrap(),
    );
    for ticket in tickets {
        let _ = ticket.wait();
    }
    // Round trip through the worker so the callback has run
    scheduler.pool_stats().unwrap();

    let seen = seen.lock().unwrap();
    let total_for = |doc: &DocumentId| -> usize {
        seen.iter()
            .filter(|p| &p.document == doc)
            .map(|p| p.completed)
            .sum()
    };
    assert_eq!(total_for(&source_id(&left)), 3);
    assert_eq!(total_for(&source_id(&right)), 2);
    assert!(seen.iter().all(|p| p.completed == p.total));
}

#[test]
fn shutdown_settles_queued_requests() {
    let backend = ScriptedBackend::new();
    let scheduler = PreviewScheduler::init(
        backend.clone(),
        SchedulerConfig {
            batch_size: 1,
            ..config()
        },
    );
    let source = scripted_source("report", 5);

    backend.hold();
    let tickets = scheduler
        .request_previews(&source_id(&source), source, &[1, 2, 3])
        .unwrap();
    wait_for("first render", || backend.render_calls() == 1);

    let resumer = {
        let backend = backend.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            backend.resume();
        })
    };
    scheduler.shutdown();
    resumer.join().unwrap();

    let results: Vec<_> = tickets.into_iter().map(|t| t.wait().is_some()).collect();
    assert_eq!(results, vec![true, false, false]);
    assert_eq!(backend.render_calls(), 1);
}

#[test]
fn clear_for_document_drops_its_queued_requests() {
    let backend = ScriptedBackend::new();
    let scheduler = PreviewScheduler::init(
        backend.clone(),
        SchedulerConfig {
            batch_size: 1,
            ..config()
        },
    );
    let source = scripted_source("report", 5);
    let document = source_id(&source);

    backend.hold();
    let mut tickets = scheduler
        .request_previews(&document, source, &[1, 2])
        .unwrap();
    wait_for("first render", || backend.render_calls() == 1);

    scheduler.clear_for_document(&document);
    backend.resume();

    let second = tickets.pop().unwrap();
    assert!(second.wait().is_none());
    assert!(tickets.pop().unwrap().wait().is_some());
    assert_eq!(backend.rendered_pages("report"), vec![1]);
    assert_eq!(scheduler.pool_stats().unwrap().open, 0);
}

#[test]
fn panicking_listener_does_not_strand_requests() {
    let listener: ProgressListener = Arc::new(|p: &GroupProgress| {
        panic!("listener failed on {}", p.document);
    });
    let scheduler =
        PreviewScheduler::init_with_progress(ScriptedBackend::new(), config(), Some(listener));
    let a = scripted_source("a", 3);
    let b = scripted_source("b", 3);

    let first = scheduler
        .request_preview(PageKey::page(source_id(&a), 1), a, 1)
        .unwrap();
    let second = scheduler
        .request_preview(PageKey::page(source_id(&b), 2), b.clone(), 2)
        .unwrap();
    assert!(first.wait_timeout(WAIT).unwrap().is_some());
    assert!(second.wait_timeout(WAIT).unwrap().is_some());

    // The worker is still serving
    let again = scheduler
        .request_preview(PageKey::page(source_id(&b), 3), b, 3)
        .unwrap();
    assert!(again.wait_timeout(WAIT).unwrap().is_some());
}

#[test]
fn engine_panic_while_opening_is_an_open_error() {
    let backend = ScriptedBackend::new();
    let scheduler = PreviewScheduler::init(backend.clone(), config());
    let crashing = Arc::new(folio::preview::MemorySource::with_modified(
        "crashing",
        b"name=crashing;pages=3;panic=open".to_vec(),
        0,
    ));

    let err = scheduler
        .open_document(DocumentId::new("crashing"), crashing)
        .wait()
        .unwrap_err();
    assert_eq!(err.document, DocumentId::new("crashing"));

    let healthy = scripted_source("healthy", 2);
    let ticket = scheduler
        .request_preview(PageKey::page(source_id(&healthy), 1), healthy, 1)
        .unwrap();
    assert!(ticket.wait_timeout(WAIT).unwrap().is_some());
    assert_eq!(scheduler.pool_stats().unwrap().referenced, 0);
}

#[test]
fn low_pages_flush_on_the_short_delay() {
    let scheduler = PreviewScheduler::init(
        ScriptedBackend::new(),
        SchedulerConfig {
            short_delay: Duration::from_millis(10),
            long_delay: Duration::from_secs(1),
            ..SchedulerConfig::default()
        },
    );
    let source = scripted_source("report", 30);
    let document = source_id(&source);

    let started = Instant::now();
    let tickets = scheduler
        .request_previews(&document, source.clone(), &[1, 2, 3])
        .unwrap();
    for ticket in tickets {
        assert!(ticket.wait_timeout(Duration::from_millis(800)).unwrap().is_some());
    }
    assert!(started.elapsed() < Duration::from_millis(800));

    // One page past the first batch puts the whole queue on the long delay
    let started = Instant::now();
    let mut tickets = scheduler
        .request_previews(&document, source, &[4, 20])
        .unwrap();
    let high = tickets.remove(0);
    let high = match high.wait_timeout(Duration::from_millis(300)) {
        Ok(preview) => panic!("flushed early with {preview:?}"),
        Err(ticket) => ticket,
    };
    assert!(high.wait_timeout(WAIT).unwrap().is_some());
    assert!(tickets.remove(0).wait_timeout(WAIT).unwrap().is_some());
    assert!(started.elapsed() >= Duration::from_millis(900));
}

#[test]
fn low_page_overtakes_queued_high_pages_between_batches() {
    let backend = ScriptedBackend::new();
    let scheduler = PreviewScheduler::init(
        backend.clone(),
        SchedulerConfig {
            batch_size: 1,
            ..config()
        },
    );
    let source = scripted_source("report", 40);
    let document = source_id(&source);

    backend.hold();
    let mut tickets = scheduler
        .request_previews(&document, source.clone(), &[30, 31, 32])
        .unwrap();
    wait_for("first render", || backend.render_calls() == 1);

    tickets.push(
        scheduler
            .request_preview(PageKey::page(document, 2), source, 2)
            .unwrap(),
    );
    backend.resume();

    assert!(tickets.into_iter().all(|t| t.wait_timeout(WAIT).unwrap().is_some()));
    assert_eq!(backend.rendered_pages("report"), vec![30, 2, 31, 32]);
}

fn source_id(source: &folio::preview::MemorySource) -> DocumentId {
    use folio::preview::DocumentSource;
    source.document_id()
}
