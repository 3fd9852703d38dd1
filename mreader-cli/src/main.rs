use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use clap::Parser;
use directories::ProjectDirs;
use mreader_core::{
    Chapter, FetchError, FilePreferenceStore, FitMode, ImageFetcher, ItemGeometry, LayoutMode,
    PreferenceStore, ReaderEvent, SeriesMeta, ViewportMetrics, ViewportProvider,
};
use mreader_view::{Reader, ReaderConfig};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::debug;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "mreader",
    version,
    about = "lazy-loading manga chapter reader, headless demo"
)]
struct Args {
    /// Chapter to open (0-based position in the manifest)
    #[arg(short = 'c', long = "chapter", default_value_t = 0)]
    chapter: usize,

    /// Image index to jump to after opening (0-based)
    #[arg(short = 'p', long = "page")]
    page: Option<usize>,

    /// Open in paged mode instead of the stored preference
    #[arg(long)]
    paged: bool,

    /// Number of forward navigation steps to walk after opening
    #[arg(long, default_value_t = 3)]
    steps: usize,

    /// Path to a series manifest (JSON: series metadata plus chapters)
    manifest: PathBuf,
}

/// On-disk description of a series. Image entries are paths relative to the
/// manifest's directory.
#[derive(Debug, Deserialize)]
struct Manifest {
    series: SeriesMeta,
    chapters: Vec<Chapter>,
}

fn load_manifest(path: &Path) -> Result<Manifest> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest {:?}", path))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to decode manifest {:?}", path))
}

/// Serves image bytes straight from the filesystem, resolving each source
/// reference against the manifest directory.
struct FsImageFetcher {
    root: PathBuf,
}

impl FsImageFetcher {
    fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait::async_trait]
impl ImageFetcher for FsImageFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        let path = self.root.join(url);
        match fs::read(&path) {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) => Err(FetchError::failed(url, err)),
        }
    }
}

/// A display surface without a display: fixed-height slots stacked
/// vertically, with enough scroll state for the visibility and position
/// machinery to behave as it would against a real renderer.
struct HeadlessViewport {
    slot_height: f32,
    window_height: f32,
    count: Mutex<usize>,
    scroll_top: Mutex<f32>,
    bytes_received: Mutex<usize>,
}

impl HeadlessViewport {
    fn new() -> Self {
        Self {
            slot_height: 1600.0,
            window_height: 900.0,
            count: Mutex::new(0),
            scroll_top: Mutex::new(0.0),
            bytes_received: Mutex::new(0),
        }
    }

    fn scroll_by(&self, delta: f32) {
        let mut top = self.scroll_top.lock();
        *top = (*top + delta).max(0.0);
    }

    fn bytes_received(&self) -> usize {
        *self.bytes_received.lock()
    }
}

impl ViewportProvider for HeadlessViewport {
    fn item_count(&self) -> usize {
        *self.count.lock()
    }

    fn metrics(&self) -> Option<ViewportMetrics> {
        Some(ViewportMetrics {
            scroll_top: *self.scroll_top.lock(),
            height: self.window_height,
        })
    }

    fn item_geometry(&self, index: usize) -> Option<ItemGeometry> {
        if index >= *self.count.lock() {
            return None;
        }
        Some(ItemGeometry {
            top: index as f32 * self.slot_height,
            height: self.slot_height,
        })
    }

    fn scroll_item_into_view(&self, index: usize) {
        *self.scroll_top.lock() = index as f32 * self.slot_height;
    }

    fn swap_placeholder(&self, index: usize, data: Bytes) {
        *self.bytes_received.lock() += data.len();
        debug!(index, bytes = data.len(), "placeholder filled");
    }

    fn apply_fit(&self, index: usize, fit: FitMode) {
        debug!(index, ?fit, "fit applied");
    }

    fn clear_fit(&self, index: usize) {
        debug!(index, "fit cleared");
    }

    fn rebuild(&self, mode: LayoutMode, item_count: usize) {
        *self.count.lock() = item_count;
        debug!(?mode, item_count, "placeholders rebuilt");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "mreader", "mreader")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;

    let manifest = load_manifest(&args.manifest)?;
    let chapter = manifest.chapters.get(args.chapter).ok_or_else(|| {
        anyhow!(
            "chapter {} not in manifest ({} chapters)",
            args.chapter,
            manifest.chapters.len()
        )
    })?;
    let image_root = args
        .manifest
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let prefs_dir = project_dirs.data_local_dir().join("prefs");
    let store: Arc<dyn PreferenceStore> = Arc::new(FilePreferenceStore::new(prefs_dir)?);
    let fetcher: Arc<dyn ImageFetcher> = Arc::new(FsImageFetcher::new(image_root));
    let viewport = Arc::new(HeadlessViewport::new());

    let mut reader = Reader::new(
        manifest.series.clone(),
        store,
        fetcher,
        Arc::clone(&viewport) as Arc<dyn ViewportProvider>,
        ReaderConfig::default(),
    )?;
    if args.paged {
        reader.set_mode(LayoutMode::Paged).await;
    }

    reader.open_chapter(args.chapter, chapter).await;
    if let Some(page) = args.page {
        reader.seek(page).await;
    }
    print_position(&reader, chapter);

    for _ in 0..args.steps {
        reader.next().await;
        if reader.prefs().mode == LayoutMode::Scroll {
            // a little drift past the snap point, as a real reader scrolls
            viewport.scroll_by(200.0);
            reader.on_scroll();
        }
        print_position(&reader, chapter);
    }

    // give the sweeper a moment, then report how far the chapter got
    tokio::time::sleep(Duration::from_millis(500)).await;
    let events = reader.events();
    let (loaded, failed) = {
        let events = events.lock();
        let loaded = events
            .iter()
            .filter(|e| matches!(e, ReaderEvent::ItemLoaded(_)))
            .count();
        let failed = events
            .iter()
            .filter(|e| matches!(e, ReaderEvent::ItemFailed(_)))
            .count();
        (loaded, failed)
    };
    println!(
        "loaded {}/{} images ({} failed, {} bytes)",
        loaded,
        reader.item_count(),
        failed,
        viewport.bytes_received()
    );

    reader.close_chapter();
    Ok(())
}

fn print_position(reader: &Reader, chapter: &Chapter) {
    let (index, count) = reader.position();
    let title = chapter.title.as_deref().unwrap_or("<untitled>");
    let mode = match reader.prefs().mode {
        LayoutMode::Scroll => "scroll",
        LayoutMode::Paged => "paged",
    };
    println!("{} — image {}/{} — {}", title, index + 1, count, mode);
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "mreader.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}
