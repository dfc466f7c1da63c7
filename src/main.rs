use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use log::{error, info, warn};
use serde::Serialize;
use simplelog::{Config, LevelFilter, WriteLogger};

use folio::preview::{
    DocumentSource, FileSource, GroupProgress, LoaderInput, MupdfBackend, PageKey, PageRange,
    Preview, PreviewScheduler, ProgressListener, ProgressiveLoader, decode_data_uri,
};
use folio::settings::Settings;

/// How long a single document may take to render before giving up
const DOCUMENT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Parser, Debug)]
#[command(name = "folio")]
#[command(about = "Render cached page previews of PDF documents")]
#[command(version)]
struct Cli {
    /// Documents to preview
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Pages to render, 1-based and inclusive (e.g. `1-10` or `3`)
    #[arg(long, default_value = "1-10")]
    pages: String,

    /// Drive the progressive loader around a visible range of 0-based
    /// indices instead (e.g. `40:42`)
    #[arg(long, conflicts_with = "thumbnail")]
    window: Option<String>,

    /// Render only the first page as a whole-file thumbnail
    #[arg(long)]
    thumbnail: bool,

    /// Directory to write JPEG files to
    #[arg(long)]
    out: Option<PathBuf>,

    /// Settings file (defaults to the user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log file
    #[arg(long, default_value = "folio.log")]
    log: PathBuf,
}

#[derive(Serialize)]
struct DocumentReport {
    file: PathBuf,
    document: String,
    rendered: Vec<u32>,
    failed: Vec<u32>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    WriteLogger::init(
        LevelFilter::Debug,
        Config::default(),
        File::create(&cli.log).with_context(|| format!("creating log file {:?}", cli.log))?,
    )?;

    info!("Starting folio");

    let settings = Settings::load(cli.config.as_deref());
    if let Some(out) = &cli.out {
        fs::create_dir_all(out).with_context(|| format!("creating {out:?}"))?;
    }

    let progress: ProgressListener = Arc::new(|p: &GroupProgress| {
        info!("{}: {}/{} pages", p.document, p.completed, p.total);
    });
    let scheduler = Arc::new(PreviewScheduler::init_with_progress(
        MupdfBackend,
        settings.scheduler_config(),
        Some(progress),
    ));

    let mut reports = Vec::new();
    for path in &cli.files {
        let source: Arc<dyn DocumentSource> = Arc::new(
            FileSource::open(path).with_context(|| format!("opening {path:?}"))?,
        );

        let rendered = if let Some(window) = &cli.window {
            let range = parse_window(window)?;
            load_window(&scheduler, &settings, Arc::clone(&source), range)?
        } else if cli.thumbnail {
            render_thumbnail(&scheduler, Arc::clone(&source))?
        } else {
            let pages = parse_pages(&cli.pages)?;
            render_pages(&scheduler, Arc::clone(&source), &pages)?
        };

        let mut report = DocumentReport {
            file: path.clone(),
            document: source.document_id().to_string(),
            rendered: Vec::new(),
            failed: Vec::new(),
        };
        for (page, preview) in rendered {
            match preview {
                Some(preview) => {
                    if let Some(out) = &cli.out {
                        write_jpeg(out, path, page, &preview)?;
                    }
                    report.rendered.push(page);
                }
                None => report.failed.push(page),
            }
        }
        if !report.failed.is_empty() {
            warn!("{path:?}: pages {:?} failed", report.failed);
        }
        reports.push(report);
    }

    let summary = serde_json::json!({
        "documents": reports,
        "cache": scheduler.cache_stats(),
        "pool": scheduler.pool_stats(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    scheduler.shutdown();
    info!("Shutting down folio");
    Ok(())
}

fn render_pages(
    scheduler: &PreviewScheduler,
    source: Arc<dyn DocumentSource>,
    pages: &[u32],
) -> Result<Vec<(u32, Option<Preview>)>> {
    let document = source.document_id();
    let tickets = scheduler.request_previews(&document, source, pages)?;
    Ok(tickets
        .into_iter()
        .map(|ticket| {
            let page = ticket.key().page;
            let preview = ticket.wait_timeout(DOCUMENT_TIMEOUT).unwrap_or_else(|_| {
                error!("Timed out waiting for page {page} of {document}");
                None
            });
            (page, preview)
        })
        .collect())
}

fn render_thumbnail(
    scheduler: &PreviewScheduler,
    source: Arc<dyn DocumentSource>,
) -> Result<Vec<(u32, Option<Preview>)>> {
    let key = PageKey::file(source.document_id());
    let ticket = scheduler.request_preview(key, source, 1)?;
    Ok(vec![(1, ticket.wait_timeout(DOCUMENT_TIMEOUT).unwrap_or(None))])
}

fn load_window(
    scheduler: &Arc<PreviewScheduler>,
    settings: &Settings,
    source: Arc<dyn DocumentSource>,
    range: PageRange,
) -> Result<Vec<(u32, Option<Preview>)>> {
    let mut loader = ProgressiveLoader::new(Arc::clone(scheduler), settings.loader_config());
    loader.set_input(LoaderInput::new(source));
    if !loader.settle(DOCUMENT_TIMEOUT) {
        bail!("timed out opening document");
    }
    loader.set_visible_range(range);
    if !loader.settle(DOCUMENT_TIMEOUT) {
        warn!("Timed out waiting for pages around {range:?}");
    }

    let view = loader.snapshot();
    info!(
        "Loaded {} of {} pages ({:?})",
        view.loaded_pages.len(),
        view.total_pages,
        view.phase
    );
    Ok(view
        .pages
        .into_iter()
        .map(|page| (page.page_number, Some(page.preview)))
        .collect())
}

fn write_jpeg(out: &Path, file: &Path, page: u32, preview: &str) -> Result<()> {
    let bytes = decode_data_uri(preview).ok_or_else(|| anyhow!("malformed preview data"))?;
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let target = out.join(format!("{stem}-p{page:04}.jpg"));
    fs::write(&target, bytes).with_context(|| format!("writing {target:?}"))?;
    Ok(())
}

/// `N` or `A-B`, 1-based
fn parse_pages(arg: &str) -> Result<Vec<u32>> {
    let (start, end) = match arg.split_once('-') {
        Some((a, b)) => (a.trim().parse::<u32>()?, b.trim().parse::<u32>()?),
        None => {
            let page = arg.trim().parse::<u32>()?;
            (page, page)
        }
    };
    if start == 0 || end < start {
        bail!("invalid page range {arg:?}");
    }
    Ok((start..=end).collect())
}

/// `START:END`, 0-based indices
fn parse_window(arg: &str) -> Result<PageRange> {
    let (start, end) = arg
        .split_once(':')
        .ok_or_else(|| anyhow!("expected START:END, got {arg:?}"))?;
    Ok(PageRange::new(start.trim().parse()?, end.trim().parse()?))
}
