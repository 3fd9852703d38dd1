use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub type ChapterId = Uuid;

static CHAPTER_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("3f8a1d6b-4c2e-5f90-b7a3-218d64c0aa57").expect("valid namespace UUID")
});

/// Stable identity for one chapter of a series. The same slug/key pair always
/// maps to the same id, so fit overrides and seen-markers survive re-renders.
pub fn chapter_id_for(slug: &str, key: &str) -> ChapterId {
    let rendered = format!("{}:{}", slug, key);
    Uuid::new_v5(&CHAPTER_NAMESPACE, rendered.as_bytes())
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SeriesMeta {
    pub slug: String,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Chapter {
    pub number: Option<String>,
    pub title: Option<String>,
    pub images: Vec<String>,
}

impl Chapter {
    /// Chapter key used for identity and the seen-map: the declared number,
    /// or the 1-based position when no number is present.
    pub fn key(&self, position: usize) -> String {
        self.number
            .clone()
            .unwrap_or_else(|| (position + 1).to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayoutMode {
    Scroll,
    Paged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageDirection {
    Rtl,
    Ltr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapZone {
    Left,
    Right,
}

impl PageDirection {
    /// Whether tapping the given zone advances forward. Right-to-left reading
    /// inverts the zones: the left edge is "next".
    pub fn tap_advances(self, zone: TapZone) -> bool {
        matches!(
            (self, zone),
            (PageDirection::Rtl, TapZone::Left) | (PageDirection::Ltr, TapZone::Right)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitMode {
    Width,
    Height,
    Auto,
}

impl FitMode {
    /// Toggle cycle used by the per-image fit button.
    pub fn next_override(self) -> FitMode {
        match self {
            FitMode::Width => FitMode::Height,
            FitMode::Height => FitMode::Auto,
            FitMode::Auto => FitMode::Width,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prefs {
    pub mode: LayoutMode,
    pub dir: PageDirection,
    pub fit: FitMode,
    pub compact: bool,
}

impl Default for Prefs {
    fn default() -> Self {
        Self {
            mode: LayoutMode::Scroll,
            dir: PageDirection::Rtl,
            fit: FitMode::Width,
            compact: false,
        }
    }
}

/// Everything persisted per series: the reader preferences plus the
/// seen-chapter map keyed by chapter key.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoredPrefs {
    pub prefs: Prefs,
    #[serde(default)]
    pub seen: HashMap<String, bool>,
}

pub trait PreferenceStore: Send + Sync {
    fn load(&self, slug: &str) -> Result<Option<StoredPrefs>>;
    fn save(&self, slug: &str, stored: &StoredPrefs) -> Result<()>;
}

pub struct FilePreferenceStore {
    root: PathBuf,
}

impl FilePreferenceStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create preference directory at {:?}", root))?;
        Ok(Self { root })
    }

    fn prefs_path(&self, slug: &str) -> PathBuf {
        let sanitized: String = slug
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
            .collect();
        self.root.join(format!("{}.json", sanitized))
    }
}

impl PreferenceStore for FilePreferenceStore {
    fn load(&self, slug: &str) -> Result<Option<StoredPrefs>> {
        let path = self.prefs_path(slug);
        if !path.exists() {
            return Ok(None);
        }
        let mut file =
            File::open(&path).with_context(|| format!("failed to open prefs file {:?}", path))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        let stored = serde_json::from_str(&buf)
            .with_context(|| format!("failed to decode prefs file {:?}", path))?;
        Ok(Some(stored))
    }

    fn save(&self, slug: &str, stored: &StoredPrefs) -> Result<()> {
        let path = self.prefs_path(slug);
        let tmp = path.with_extension("json.tmp");
        let payload = serde_json::to_string_pretty(stored)?;
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to open temp prefs file {:?}", tmp))?;
        file.write_all(payload.as_bytes())?;
        file.flush()?;
        fs::rename(tmp, path)?;
        Ok(())
    }
}

pub struct MemoryPreferenceStore {
    inner: Mutex<HashMap<String, StoredPrefs>>,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryPreferenceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn load(&self, slug: &str) -> Result<Option<StoredPrefs>> {
        Ok(self.inner.lock().get(slug).cloned())
    }

    fn save(&self, slug: &str, stored: &StoredPrefs) -> Result<()> {
        self.inner.lock().insert(slug.to_owned(), stored.clone());
        Ok(())
    }
}

/// Load lifecycle of one image. Transitions are monotonic; `Failed` is
/// terminal and never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Pending,
    Enqueued,
    Loading,
    Loaded,
    Failed,
}

impl LoadState {
    pub fn is_settled(self) -> bool {
        matches!(self, LoadState::Loaded | LoadState::Failed)
    }

    /// Whether the item may still enter the load queue.
    pub fn accepts_enqueue(self) -> bool {
        matches!(self, LoadState::Pending)
    }
}

#[derive(Debug, Clone)]
pub struct ImageItem {
    pub index: usize,
    pub source_url: String,
    pub state: LoadState,
}

impl ImageItem {
    pub fn new(index: usize, source_url: String) -> Self {
        Self {
            index,
            source_url,
            state: LoadState::Pending,
        }
    }
}

/// The engine's exclusive view of one open chapter. Replaced wholesale on
/// chapter open, destroyed on chapter close; never shared mutably.
#[derive(Debug, Clone)]
pub struct ReadingSession {
    pub chapter_index: usize,
    pub chapter_id: ChapterId,
    pub chapter_key: String,
    pub image_refs: Vec<String>,
    pub page: usize,
}

impl ReadingSession {
    pub fn new(series: &SeriesMeta, chapter_index: usize, chapter: &Chapter) -> Self {
        let key = chapter.key(chapter_index);
        Self {
            chapter_index,
            chapter_id: chapter_id_for(&series.slug, &key),
            chapter_key: key,
            image_refs: chapter.images.clone(),
            page: 0,
        }
    }

    pub fn item_count(&self) -> usize {
        self.image_refs.len()
    }

    pub fn clamp_index(&self, index: usize) -> usize {
        index.min(self.item_count().saturating_sub(1))
    }

    /// Step forward one page. Boundary is a no-op, never wraps.
    pub fn next_page(&mut self) -> bool {
        let next = (self.page + 1).min(self.item_count().saturating_sub(1));
        if next != self.page {
            self.page = next;
            true
        } else {
            false
        }
    }

    /// Step backward one page. Boundary is a no-op.
    pub fn prev_page(&mut self) -> bool {
        let next = self.page.saturating_sub(1);
        if next != self.page {
            self.page = next;
            true
        } else {
            false
        }
    }

    pub fn goto_page(&mut self, index: usize) -> usize {
        self.page = self.clamp_index(index);
        self.page
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportMetrics {
    pub scroll_top: f32,
    pub height: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ItemGeometry {
    pub top: f32,
    pub height: f32,
}

impl ItemGeometry {
    pub fn midpoint(&self) -> f32 {
        self.top + self.height / 2.0
    }
}

/// Capability surface the rendering layer hands to the engine. The engine
/// never reaches for a global document; everything it knows about placeholder
/// elements goes through this trait, addressed by item index.
pub trait ViewportProvider: Send + Sync {
    fn item_count(&self) -> usize;

    /// None while no scrollable container is mounted; all geometry-dependent
    /// operations degrade to no-ops in that case.
    fn metrics(&self) -> Option<ViewportMetrics>;

    fn item_geometry(&self, index: usize) -> Option<ItemGeometry>;

    /// Align the item's top edge with the viewport top.
    fn scroll_item_into_view(&self, index: usize);

    /// Commit point of a successful load: replace the placeholder with the
    /// fetched payload.
    fn swap_placeholder(&self, index: usize, data: Bytes);

    fn apply_fit(&self, index: usize, fit: FitMode);

    fn clear_fit(&self, index: usize);

    /// Tear down and re-render all placeholders for the given layout mode.
    fn rebuild(&self, mode: LayoutMode, item_count: usize);

    /// Hosts that cannot observe item visibility get the degraded fallback:
    /// every item is enqueued unconditionally.
    fn supports_visibility_observation(&self) -> bool {
        true
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch of {url} failed")]
    Failed {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl FetchError {
    pub fn failed(
        url: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        FetchError::Failed {
            url: url.into(),
            source: source.into(),
        }
    }
}

/// One attempt per URL; a failure is recorded, never retried.
#[async_trait::async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError>;
}

/// Resolves which item counts as "being read right now".
///
/// Scroll mode compares each item's vertical midpoint against the viewport
/// center and picks the closest, ties going to the lowest index. Paged mode
/// is just the stored page pointer. An empty list or unmounted viewport
/// resolves to 0.
pub fn resolve_current_index(
    session: &ReadingSession,
    mode: LayoutMode,
    viewport: &dyn ViewportProvider,
) -> usize {
    match mode {
        LayoutMode::Paged => session.page,
        LayoutMode::Scroll => {
            let Some(metrics) = viewport.metrics() else {
                return 0;
            };
            let count = viewport.item_count();
            if count == 0 {
                return 0;
            }
            let center = metrics.scroll_top + metrics.height / 2.0;
            let mut best_index = 0;
            let mut best_dist = f32::INFINITY;
            for index in 0..count {
                let Some(geometry) = viewport.item_geometry(index) else {
                    continue;
                };
                let dist = (geometry.midpoint() - center).abs();
                if dist < best_dist {
                    best_dist = dist;
                    best_index = index;
                }
            }
            best_index
        }
    }
}

/// Session-scoped per-image fit overrides, keyed by chapter identity so a
/// chapter change implicitly starts from all-Auto. Never persisted.
#[derive(Debug, Default)]
pub struct FitOverrideStore {
    inner: HashMap<ChapterId, HashMap<usize, FitMode>>,
}

impl FitOverrideStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, chapter: ChapterId, index: usize) -> FitMode {
        self.inner
            .get(&chapter)
            .and_then(|map| map.get(&index))
            .copied()
            .unwrap_or(FitMode::Auto)
    }

    pub fn set(&mut self, chapter: ChapterId, index: usize, fit: FitMode) {
        let map = self.inner.entry(chapter).or_default();
        if fit == FitMode::Auto {
            map.remove(&index);
        } else {
            map.insert(index, fit);
        }
    }

    pub fn toggle(&mut self, chapter: ChapterId, index: usize) -> FitMode {
        let next = self.get(chapter, index).next_override();
        self.set(chapter, index, next);
        tracing::debug!(%chapter, index, ?next, "fit override toggled");
        next
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    ChapterOpened(ChapterId),
    ChapterClosed(ChapterId),
    ItemLoaded(usize),
    ItemFailed(usize),
    CurrentChanged(usize),
    NeighborsSettled,
    ModeChanged(LayoutMode),
}

pub type EventSink = Arc<Mutex<Vec<ReaderEvent>>>;
