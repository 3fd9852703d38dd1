use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use mreader_core::{
    resolve_current_index, Chapter, EventSink, FitMode, FitOverrideStore, ImageFetcher,
    LayoutMode, PageDirection, PreferenceStore, Prefs, ReaderEvent, ReadingSession, SeriesMeta,
    StoredPrefs, TapZone, ViewportProvider,
};
use mreader_fetch::{
    shared_queue, BackgroundSweeper, ConcurrencyLimitedLoader, ItemTable, LoaderConfig,
    ObserverConfig, SweepConfig, ViewportObserver,
};
use parking_lot::Mutex;
use tracing::{instrument, warn};

#[derive(Debug, Clone, Copy)]
pub struct ReaderConfig {
    pub loader: LoaderConfig,
    pub observer: ObserverConfig,
    pub sweep: SweepConfig,
    /// How many neighbors on each side of the opening page are force-loaded
    /// before the chapter counts as ready.
    pub preload_radius: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            loader: LoaderConfig::default(),
            observer: ObserverConfig::default(),
            sweep: SweepConfig::default(),
            preload_radius: 2,
        }
    }
}

struct OpenChapter {
    session: ReadingSession,
    loader: Arc<ConcurrencyLimitedLoader>,
    observer: Arc<ViewportObserver>,
}

/// The engine facade. Owns the reading session and all load machinery for
/// the open chapter, reacts to host scroll/tap/settings signals, and keeps
/// the visible reading position consistent across layout changes.
///
/// All entry points run serially on one event loop; the session and the fit
/// overrides are never touched from anywhere else.
pub struct Reader {
    series: SeriesMeta,
    prefs: Prefs,
    seen: HashMap<String, bool>,
    prefs_store: Arc<dyn PreferenceStore>,
    fetcher: Arc<dyn ImageFetcher>,
    viewport: Arc<dyn ViewportProvider>,
    events: EventSink,
    generation: Arc<AtomicU64>,
    config: ReaderConfig,
    open: Option<OpenChapter>,
    overrides: FitOverrideStore,
    seeking: bool,
    last_applied: Option<usize>,
}

impl Reader {
    pub fn new(
        series: SeriesMeta,
        prefs_store: Arc<dyn PreferenceStore>,
        fetcher: Arc<dyn ImageFetcher>,
        viewport: Arc<dyn ViewportProvider>,
        config: ReaderConfig,
    ) -> Result<Self> {
        let stored = prefs_store.load(&series.slug)?.unwrap_or_default();
        Ok(Self {
            series,
            prefs: stored.prefs,
            seen: stored.seen,
            prefs_store,
            fetcher,
            viewport,
            events: Arc::new(Mutex::new(Vec::new())),
            generation: Arc::new(AtomicU64::new(0)),
            config,
            open: None,
            overrides: FitOverrideStore::new(),
            seeking: false,
            last_applied: None,
        })
    }

    pub fn events(&self) -> EventSink {
        Arc::clone(&self.events)
    }

    pub fn prefs(&self) -> &Prefs {
        &self.prefs
    }

    pub fn seeking(&self) -> bool {
        self.seeking
    }

    pub fn is_seen(&self, chapter_key: &str) -> bool {
        self.seen.get(chapter_key).copied().unwrap_or(false)
    }

    pub fn item_count(&self) -> usize {
        self.open
            .as_ref()
            .map(|open| open.session.item_count())
            .unwrap_or(0)
    }

    /// Which item is being read right now, under the active layout mode.
    pub fn current_index(&self) -> usize {
        self.current_index_for(self.prefs.mode)
    }

    /// Current index and total count, for position indicators.
    pub fn position(&self) -> (usize, usize) {
        (self.current_index(), self.item_count())
    }

    fn current_index_for(&self, mode: LayoutMode) -> usize {
        match &self.open {
            Some(open) => resolve_current_index(&open.session, mode, self.viewport.as_ref()),
            None => 0,
        }
    }

    /// Opens a chapter, replacing any previous session wholesale. Resolves
    /// once the opening page and its neighbors have settled, which is the
    /// point where a chapter-open spinner can be dismissed.
    #[instrument(skip(self, chapter))]
    pub async fn open_chapter(&mut self, chapter_index: usize, chapter: &Chapter) {
        if self.open.is_some() {
            self.close_chapter();
        }
        self.generation.fetch_add(1, Ordering::SeqCst);

        let session = ReadingSession::new(&self.series, chapter_index, chapter);
        let chapter_id = session.chapter_id;
        let count = session.item_count();
        let page = session.page;
        self.seen.insert(session.chapter_key.clone(), true);
        self.persist();

        let items = ItemTable::from_refs(&session.image_refs);
        let queue = shared_queue();
        let loader = Arc::new(ConcurrencyLimitedLoader::new(
            items.clone(),
            Arc::clone(&queue),
            Arc::clone(&self.fetcher),
            Arc::clone(&self.viewport),
            Arc::clone(&self.events),
            Arc::clone(&self.generation),
            self.config.loader,
        ));
        let observer = Arc::new(ViewportObserver::new(
            items,
            queue,
            Arc::clone(&self.viewport),
            self.config.observer,
        ));
        self.open = Some(OpenChapter {
            session,
            loader: Arc::clone(&loader),
            observer: Arc::clone(&observer),
        });
        self.last_applied = None;

        self.viewport.rebuild(self.prefs.mode, count);
        self.events.lock().push(ReaderEvent::ChapterOpened(chapter_id));

        match self.prefs.mode {
            LayoutMode::Scroll => {
                if observer.scan() {
                    spawn_drain(&loader);
                }
                loader
                    .ensure_loaded_around(page, self.config.preload_radius)
                    .await;
                self.viewport.scroll_item_into_view(page);
                self.events.lock().push(ReaderEvent::NeighborsSettled);
                self.apply_current_fit(page);
                self.push_current(page);
                spawn_sweep(&loader, self.config.sweep);
            }
            LayoutMode::Paged => {
                loader
                    .ensure_loaded_around(page, self.config.preload_radius)
                    .await;
                self.events.lock().push(ReaderEvent::NeighborsSettled);
                self.apply_current_fit(page);
                self.push_current(page);
            }
        }
    }

    /// Destroys the session. In-flight loads are not cancelled; their
    /// completions resolve against a bumped generation and get discarded.
    pub fn close_chapter(&mut self) {
        let Some(open) = self.open.take() else {
            return;
        };
        self.generation.fetch_add(1, Ordering::SeqCst);
        open.loader.queue().lock().clear();
        self.last_applied = None;
        self.seeking = false;
        self.events
            .lock()
            .push(ReaderEvent::ChapterClosed(open.session.chapter_id));
        self.persist();
    }

    /// Scroll-event entry point. Re-scans visibility, schedules a coalesced
    /// drain pass when anything new entered the queue, and re-applies the
    /// fit override when the current item changed.
    pub fn on_scroll(&mut self) {
        if self.prefs.mode != LayoutMode::Scroll {
            return;
        }
        let drain = {
            let Some(open) = &self.open else {
                return;
            };
            open.observer.scan().then(|| Arc::clone(&open.loader))
        };
        if let Some(loader) = drain {
            spawn_drain(&loader);
        }
        let index = self.current_index();
        if self.last_applied != Some(index) {
            self.apply_current_fit(index);
            self.push_current(index);
        }
    }

    /// Steps forward. Paged mode clamps at the last page; scroll mode seeks
    /// to the item after the current one.
    pub async fn next(&mut self) {
        match self.prefs.mode {
            LayoutMode::Paged => {
                let moved = match &mut self.open {
                    Some(open) => open.session.next_page(),
                    None => false,
                };
                if moved {
                    self.render_page().await;
                }
            }
            LayoutMode::Scroll => {
                let target = self.current_index() + 1;
                self.seek(target).await;
            }
        }
    }

    /// Steps backward; no-op at index 0.
    pub async fn prev(&mut self) {
        match self.prefs.mode {
            LayoutMode::Paged => {
                let moved = match &mut self.open {
                    Some(open) => open.session.prev_page(),
                    None => false,
                };
                if moved {
                    self.render_page().await;
                }
            }
            LayoutMode::Scroll => {
                let target = self.current_index().saturating_sub(1);
                self.seek(target).await;
            }
        }
    }

    /// Tap-zone navigation; right-to-left reading swaps the zones.
    pub async fn tap(&mut self, zone: TapZone) {
        if self.prefs.dir.tap_advances(zone) {
            self.next().await;
        } else {
            self.prev().await;
        }
    }

    /// Jumps straight to an index. In scroll mode the target and its
    /// immediate neighbors are guaranteed settled (loaded or failed) before
    /// the scroll happens, so the jump never lands on a blank placeholder.
    #[instrument(skip(self))]
    pub async fn seek(&mut self, index: usize) {
        let Some(target) = self
            .open
            .as_ref()
            .map(|open| open.session.clamp_index(index))
        else {
            return;
        };
        match self.prefs.mode {
            LayoutMode::Paged => {
                if let Some(open) = &mut self.open {
                    open.session.goto_page(target);
                }
                self.render_page().await;
            }
            LayoutMode::Scroll => {
                let Some(loader) = self.open.as_ref().map(|open| Arc::clone(&open.loader)) else {
                    return;
                };
                self.seeking = true;
                loader.ensure_loaded_around(target, 1).await;
                self.viewport.scroll_item_into_view(target);
                self.seeking = false;
                self.apply_current_fit(target);
                self.push_current(target);
            }
        }
    }

    /// Switches layout mode, preserving the semantic reading position: the
    /// index current under the outgoing mode is restored (clamped) after the
    /// incoming mode's rebuild.
    #[instrument(skip(self))]
    pub async fn set_mode(&mut self, mode: LayoutMode) {
        if self.prefs.mode == mode {
            return;
        }
        let outgoing = self.prefs.mode;
        let captured = self.current_index_for(outgoing);
        self.prefs.mode = mode;
        self.persist();

        let (loader, observer, target) = {
            let Some(open) = self.open.as_mut() else {
                self.events.lock().push(ReaderEvent::ModeChanged(mode));
                return;
            };
            // teardown: the outgoing queue is dropped; claimed-but-unstarted
            // items become eligible for the incoming mode's queue again
            open.loader.queue().lock().clear();
            open.loader.items().reset_enqueued();
            let target = open.session.clamp_index(captured);
            open.session.page = target;
            (
                Arc::clone(&open.loader),
                Arc::clone(&open.observer),
                target,
            )
        };
        self.last_applied = None;
        self.viewport.rebuild(mode, self.item_count());

        match mode {
            LayoutMode::Paged => {
                self.render_page().await;
            }
            LayoutMode::Scroll => {
                self.viewport.scroll_item_into_view(target);
                loader.ensure_loaded_around(target, 1).await;
                if observer.scan() {
                    spawn_drain(&loader);
                }
                self.apply_current_fit(target);
                self.push_current(target);
                spawn_sweep(&loader, self.config.sweep);
            }
        }
        self.events.lock().push(ReaderEvent::ModeChanged(mode));
    }

    pub fn set_fit(&mut self, fit: FitMode) {
        self.prefs.fit = fit;
        self.persist();
    }

    pub fn set_direction(&mut self, dir: PageDirection) {
        self.prefs.dir = dir;
        self.persist();
    }

    pub fn set_compact(&mut self, compact: bool) {
        self.prefs.compact = compact;
        self.persist();
    }

    /// Cycles the current item's fit override (Width -> Height -> Auto) and
    /// re-applies its display geometry immediately.
    pub fn toggle_fit_override(&mut self) -> Option<FitMode> {
        let chapter_id = self.open.as_ref()?.session.chapter_id;
        let index = self.current_index();
        let next = self.overrides.toggle(chapter_id, index);
        self.viewport.clear_fit(index);
        if next != FitMode::Auto {
            self.viewport.apply_fit(index, next);
        }
        self.last_applied = Some(index);
        Some(next)
    }

    /// Applies the override for the new current item, clearing the previous
    /// one first so two items never carry conflicting manual sizing.
    /// Re-applying the same index is a no-op.
    fn apply_current_fit(&mut self, index: usize) {
        let Some(open) = &self.open else {
            return;
        };
        if self.last_applied == Some(index) {
            return;
        }
        if let Some(previous) = self.last_applied {
            self.viewport.clear_fit(previous);
        }
        match self.overrides.get(open.session.chapter_id, index) {
            FitMode::Auto => self.viewport.clear_fit(index),
            fit => self.viewport.apply_fit(index, fit),
        }
        self.last_applied = Some(index);
    }

    /// Paged-mode render: the visible page loads to settlement, neighbors
    /// prefetch off the hot path.
    async fn render_page(&mut self) {
        let Some((loader, page, count)) = self.open.as_ref().map(|open| {
            (
                Arc::clone(&open.loader),
                open.session.page,
                open.session.item_count(),
            )
        }) else {
            return;
        };
        if count == 0 {
            return;
        }
        loader.force_load(page).await;
        {
            let loader = Arc::clone(&loader);
            tokio::spawn(async move {
                loader.ensure_loaded_around(page, 1).await;
            });
        }
        self.apply_current_fit(page);
        self.push_current(page);
    }

    fn push_current(&self, index: usize) {
        // drag-style seeks suppress redundant indicator updates
        if self.seeking {
            return;
        }
        self.events.lock().push(ReaderEvent::CurrentChanged(index));
    }

    /// Preference persistence is best-effort; a store failure is logged and
    /// never blocks the reader.
    fn persist(&self) {
        let stored = StoredPrefs {
            prefs: self.prefs.clone(),
            seen: self.seen.clone(),
        };
        if let Err(err) = self.prefs_store.save(&self.series.slug, &stored) {
            warn!(?err, slug = %self.series.slug, "failed to persist preferences");
        }
    }
}

fn spawn_drain(loader: &Arc<ConcurrencyLimitedLoader>) {
    let loader = Arc::clone(loader);
    tokio::spawn(async move {
        loader.schedule_drain().await;
    });
}

fn spawn_sweep(loader: &Arc<ConcurrencyLimitedLoader>, config: SweepConfig) {
    let sweeper = BackgroundSweeper::new(Arc::clone(loader), config);
    tokio::spawn(async move {
        sweeper.run().await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use bytes::Bytes;
    use mreader_core::{
        FetchError, ItemGeometry, MemoryPreferenceStore, ViewportMetrics,
    };

    struct FakeFetcher {
        delay: Duration,
        fail: Vec<usize>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeFetcher {
        fn new() -> Self {
            Self {
                delay: Duration::from_millis(1),
                fail: Vec::new(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn failing_for(mut self, indices: Vec<usize>) -> Self {
            self.fail = indices;
            self
        }
    }

    #[async_trait::async_trait]
    impl ImageFetcher for FakeFetcher {
        async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
            self.calls.lock().push(url.to_owned());
            tokio::time::sleep(self.delay).await;
            let index: usize = url
                .rsplit('/')
                .next()
                .and_then(|name| name.trim_end_matches(".jpg").parse().ok())
                .unwrap_or(0);
            if self.fail.contains(&index) {
                return Err(FetchError::failed(
                    url,
                    std::io::Error::new(std::io::ErrorKind::Other, "unreachable"),
                ));
            }
            Ok(Bytes::from_static(b"image-bytes"))
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum FitCall {
        Applied(usize, FitMode),
        Cleared(usize),
    }

    /// Records every call the engine makes against the display surface, and
    /// models scroll position so `scroll_item_into_view` is observable
    /// through `metrics`.
    struct RecordingViewport {
        item_height: f32,
        viewport_height: f32,
        count: Mutex<usize>,
        scroll_top: Mutex<f32>,
        fit_calls: Mutex<Vec<FitCall>>,
        rebuilds: Mutex<Vec<(LayoutMode, usize)>>,
        scrolled_to: Mutex<Vec<usize>>,
        swapped: Mutex<Vec<usize>>,
    }

    impl RecordingViewport {
        fn new() -> Self {
            Self {
                item_height: 100.0,
                viewport_height: 100.0,
                count: Mutex::new(0),
                scroll_top: Mutex::new(0.0),
                fit_calls: Mutex::new(Vec::new()),
                rebuilds: Mutex::new(Vec::new()),
                scrolled_to: Mutex::new(Vec::new()),
                swapped: Mutex::new(Vec::new()),
            }
        }

        fn scroll_to(&self, offset: f32) {
            *self.scroll_top.lock() = offset;
        }

        fn fit_calls(&self) -> Vec<FitCall> {
            self.fit_calls.lock().clone()
        }

        fn take_fit_calls(&self) -> Vec<FitCall> {
            std::mem::take(&mut self.fit_calls.lock())
        }

        fn scrolled_to(&self) -> Vec<usize> {
            self.scrolled_to.lock().clone()
        }

        fn rebuilds(&self) -> Vec<(LayoutMode, usize)> {
            self.rebuilds.lock().clone()
        }
    }

    impl ViewportProvider for RecordingViewport {
        fn item_count(&self) -> usize {
            *self.count.lock()
        }

        fn metrics(&self) -> Option<ViewportMetrics> {
            Some(ViewportMetrics {
                scroll_top: *self.scroll_top.lock(),
                height: self.viewport_height,
            })
        }

        fn item_geometry(&self, index: usize) -> Option<ItemGeometry> {
            if index >= *self.count.lock() {
                return None;
            }
            Some(ItemGeometry {
                top: index as f32 * self.item_height,
                height: self.item_height,
            })
        }

        fn scroll_item_into_view(&self, index: usize) {
            *self.scroll_top.lock() = index as f32 * self.item_height;
            self.scrolled_to.lock().push(index);
        }

        fn swap_placeholder(&self, index: usize, _data: Bytes) {
            self.swapped.lock().push(index);
        }

        fn apply_fit(&self, index: usize, fit: FitMode) {
            self.fit_calls.lock().push(FitCall::Applied(index, fit));
        }

        fn clear_fit(&self, index: usize) {
            self.fit_calls.lock().push(FitCall::Cleared(index));
        }

        fn rebuild(&self, mode: LayoutMode, item_count: usize) {
            *self.count.lock() = item_count;
            self.rebuilds.lock().push((mode, item_count));
        }
    }

    fn chapter(number: &str, count: usize) -> Chapter {
        Chapter {
            number: Some(number.to_owned()),
            title: None,
            images: (0..count).map(|i| format!("img/{i}.jpg")).collect(),
        }
    }

    fn quick_config() -> ReaderConfig {
        ReaderConfig {
            loader: LoaderConfig {
                concurrency: 4,
                repoll: Duration::from_millis(5),
                debounce: Duration::from_millis(1),
            },
            observer: ObserverConfig::default(),
            sweep: SweepConfig {
                batch_size: 3,
                batch_delay: Duration::from_millis(1),
                budget: Duration::from_secs(10),
                idle_delay: Duration::from_millis(1),
            },
            preload_radius: 2,
        }
    }

    fn reader_with(
        store: Arc<dyn PreferenceStore>,
        fetcher: Arc<dyn ImageFetcher>,
        viewport: Arc<RecordingViewport>,
    ) -> Reader {
        let series = SeriesMeta {
            slug: "demo".into(),
            title: Some("Demo".into()),
        };
        Reader::new(series, store, fetcher, viewport, quick_config()).unwrap()
    }

    fn current_changes(events: &EventSink) -> Vec<usize> {
        events
            .lock()
            .iter()
            .filter_map(|event| match event {
                ReaderEvent::CurrentChanged(index) => Some(*index),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn open_chapter_preloads_the_opening_neighborhood() {
        let viewport = Arc::new(RecordingViewport::new());
        let fetcher = Arc::new(FakeFetcher::new());
        let mut reader = reader_with(
            Arc::new(MemoryPreferenceStore::new()),
            Arc::clone(&fetcher) as Arc<dyn ImageFetcher>,
            Arc::clone(&viewport),
        );
        let events = reader.events();

        reader.open_chapter(0, &chapter("1", 8)).await;

        // page 0 and both neighbors are settled before open resolves
        let snapshot = events.lock().clone();
        assert!(matches!(snapshot[0], ReaderEvent::ChapterOpened(_)));
        assert!(snapshot.contains(&ReaderEvent::NeighborsSettled));
        for index in 0..=2 {
            assert!(snapshot.contains(&ReaderEvent::ItemLoaded(index)));
        }
        assert_eq!(current_changes(&events), vec![0]);
        assert_eq!(viewport.rebuilds(), vec![(LayoutMode::Scroll, 8)]);
        assert_eq!(reader.position(), (0, 8));
    }

    #[tokio::test]
    async fn mode_switch_round_trip_preserves_reading_position() {
        let viewport = Arc::new(RecordingViewport::new());
        let fetcher = Arc::new(FakeFetcher::new());
        let mut reader = reader_with(
            Arc::new(MemoryPreferenceStore::new()),
            fetcher as Arc<dyn ImageFetcher>,
            Arc::clone(&viewport),
        );
        let events = reader.events();

        reader.open_chapter(0, &chapter("1", 10)).await;

        // reader is partway down the chapter: center 550 -> item 5
        viewport.scroll_to(500.0);
        assert_eq!(reader.current_index(), 5);

        reader.set_mode(LayoutMode::Paged).await;
        assert_eq!(reader.prefs().mode, LayoutMode::Paged);
        assert_eq!(reader.current_index(), 5);

        reader.set_mode(LayoutMode::Scroll).await;
        assert_eq!(reader.prefs().mode, LayoutMode::Scroll);
        // the page index carried back: the viewport was scrolled to item 5
        assert_eq!(viewport.scrolled_to().last(), Some(&5));
        assert_eq!(reader.current_index(), 5);

        let modes: Vec<_> = events
            .lock()
            .iter()
            .filter_map(|event| match event {
                ReaderEvent::ModeChanged(mode) => Some(*mode),
                _ => None,
            })
            .collect();
        assert_eq!(modes, vec![LayoutMode::Paged, LayoutMode::Scroll]);
        assert_eq!(
            viewport.rebuilds(),
            vec![
                (LayoutMode::Scroll, 10),
                (LayoutMode::Paged, 10),
                (LayoutMode::Scroll, 10)
            ]
        );
    }

    #[tokio::test]
    async fn mode_preference_survives_a_new_reader() {
        let store = Arc::new(MemoryPreferenceStore::new());
        let viewport = Arc::new(RecordingViewport::new());
        let fetcher = Arc::new(FakeFetcher::new());

        let mut reader = reader_with(
            Arc::clone(&store) as Arc<dyn PreferenceStore>,
            Arc::clone(&fetcher) as Arc<dyn ImageFetcher>,
            Arc::clone(&viewport),
        );
        reader.set_mode(LayoutMode::Paged).await;
        reader.set_direction(PageDirection::Ltr);
        drop(reader);

        let reader = reader_with(
            store as Arc<dyn PreferenceStore>,
            fetcher as Arc<dyn ImageFetcher>,
            viewport,
        );
        assert_eq!(reader.prefs().mode, LayoutMode::Paged);
        assert_eq!(reader.prefs().dir, PageDirection::Ltr);
    }

    #[tokio::test]
    async fn seek_settles_neighborhood_before_scrolling() {
        let viewport = Arc::new(RecordingViewport::new());
        let fetcher = Arc::new(FakeFetcher::new().failing_for(vec![6]));
        let mut reader = reader_with(
            Arc::new(MemoryPreferenceStore::new()),
            Arc::clone(&fetcher) as Arc<dyn ImageFetcher>,
            Arc::clone(&viewport),
        );
        let events = reader.events();

        reader.open_chapter(0, &chapter("1", 10)).await;
        reader.seek(6).await;

        // 5, 6, 7 all settled; the failing target still counts as settled
        let snapshot = events.lock().clone();
        assert!(snapshot.contains(&ReaderEvent::ItemLoaded(5)));
        assert!(snapshot.contains(&ReaderEvent::ItemFailed(6)));
        assert!(snapshot.contains(&ReaderEvent::ItemLoaded(7)));
        assert_eq!(viewport.scrolled_to().last(), Some(&6));
        assert!(!reader.seeking());
        // exactly one position update for the jump, none mid-flight
        assert_eq!(current_changes(&events), vec![0, 6]);
    }

    #[tokio::test]
    async fn seek_clamps_to_the_last_item() {
        let viewport = Arc::new(RecordingViewport::new());
        let fetcher = Arc::new(FakeFetcher::new());
        let mut reader = reader_with(
            Arc::new(MemoryPreferenceStore::new()),
            fetcher as Arc<dyn ImageFetcher>,
            Arc::clone(&viewport),
        );

        reader.open_chapter(0, &chapter("1", 4)).await;
        reader.seek(99).await;

        assert_eq!(viewport.scrolled_to().last(), Some(&3));
        assert_eq!(reader.current_index(), 3);
    }

    #[tokio::test]
    async fn paged_navigation_clamps_at_both_boundaries() {
        let store = Arc::new(MemoryPreferenceStore::new());
        let mut seeded = StoredPrefs::default();
        seeded.prefs.mode = LayoutMode::Paged;
        store.save("demo", &seeded).unwrap();

        let viewport = Arc::new(RecordingViewport::new());
        let fetcher = Arc::new(FakeFetcher::new());
        let mut reader = reader_with(
            store as Arc<dyn PreferenceStore>,
            fetcher as Arc<dyn ImageFetcher>,
            viewport,
        );
        let events = reader.events();

        reader.open_chapter(0, &chapter("1", 5)).await;
        assert_eq!(reader.current_index(), 0);

        reader.prev().await;
        assert_eq!(reader.current_index(), 0);

        for _ in 0..7 {
            reader.next().await;
        }
        assert_eq!(reader.current_index(), 4);
        assert_eq!(current_changes(&events), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn tap_zones_follow_reading_direction() {
        let store = Arc::new(MemoryPreferenceStore::new());
        let mut seeded = StoredPrefs::default();
        seeded.prefs.mode = LayoutMode::Paged;
        store.save("demo", &seeded).unwrap();

        let viewport = Arc::new(RecordingViewport::new());
        let fetcher = Arc::new(FakeFetcher::new());
        let mut reader = reader_with(
            store as Arc<dyn PreferenceStore>,
            fetcher as Arc<dyn ImageFetcher>,
            viewport,
        );

        reader.open_chapter(0, &chapter("1", 5)).await;

        // right-to-left: left edge advances
        reader.tap(TapZone::Left).await;
        assert_eq!(reader.current_index(), 1);
        reader.tap(TapZone::Right).await;
        assert_eq!(reader.current_index(), 0);

        reader.set_direction(PageDirection::Ltr);
        reader.tap(TapZone::Right).await;
        assert_eq!(reader.current_index(), 1);
    }

    #[tokio::test]
    async fn fit_override_reapplies_when_the_item_becomes_current_again() {
        let viewport = Arc::new(RecordingViewport::new());
        let fetcher = Arc::new(FakeFetcher::new());
        let mut reader = reader_with(
            Arc::new(MemoryPreferenceStore::new()),
            fetcher as Arc<dyn ImageFetcher>,
            Arc::clone(&viewport),
        );

        reader.open_chapter(0, &chapter("1", 10)).await;
        assert_eq!(reader.toggle_fit_override(), Some(FitMode::Width));
        assert!(viewport
            .fit_calls()
            .contains(&FitCall::Applied(0, FitMode::Width)));

        // scrolling away clears item 0; item 3 has no override
        viewport.scroll_to(300.0);
        reader.on_scroll();
        let calls = viewport.take_fit_calls();
        assert!(calls.contains(&FitCall::Cleared(0)));
        assert_eq!(calls.last(), Some(&FitCall::Cleared(3)));

        // coming back restores the remembered override
        reader.seek(0).await;
        assert_eq!(
            viewport.fit_calls().last(),
            Some(&FitCall::Applied(0, FitMode::Width))
        );
    }

    #[tokio::test]
    async fn fit_override_cycle_reaches_auto_and_wraps() {
        let viewport = Arc::new(RecordingViewport::new());
        let fetcher = Arc::new(FakeFetcher::new());
        let mut reader = reader_with(
            Arc::new(MemoryPreferenceStore::new()),
            fetcher as Arc<dyn ImageFetcher>,
            viewport,
        );

        reader.open_chapter(0, &chapter("1", 3)).await;
        assert_eq!(reader.toggle_fit_override(), Some(FitMode::Width));
        assert_eq!(reader.toggle_fit_override(), Some(FitMode::Height));
        assert_eq!(reader.toggle_fit_override(), Some(FitMode::Auto));
        assert_eq!(reader.toggle_fit_override(), Some(FitMode::Width));
    }

    #[tokio::test]
    async fn fit_overrides_are_scoped_to_one_chapter() {
        let viewport = Arc::new(RecordingViewport::new());
        let fetcher = Arc::new(FakeFetcher::new());
        let mut reader = reader_with(
            Arc::new(MemoryPreferenceStore::new()),
            fetcher as Arc<dyn ImageFetcher>,
            Arc::clone(&viewport),
        );

        reader.open_chapter(0, &chapter("1", 5)).await;
        reader.toggle_fit_override();

        viewport.take_fit_calls();
        reader.open_chapter(1, &chapter("2", 5)).await;
        // a different chapter starts from all-Auto
        assert!(!viewport
            .fit_calls()
            .iter()
            .any(|call| matches!(call, FitCall::Applied(..))));

        // reopening the first chapter finds its override intact
        viewport.take_fit_calls();
        reader.open_chapter(0, &chapter("1", 5)).await;
        assert!(viewport
            .fit_calls()
            .contains(&FitCall::Applied(0, FitMode::Width)));
    }

    #[tokio::test]
    async fn opened_chapters_are_marked_seen_and_persisted() {
        let store = Arc::new(MemoryPreferenceStore::new());
        let viewport = Arc::new(RecordingViewport::new());
        let fetcher = Arc::new(FakeFetcher::new());

        let mut reader = reader_with(
            Arc::clone(&store) as Arc<dyn PreferenceStore>,
            Arc::clone(&fetcher) as Arc<dyn ImageFetcher>,
            Arc::clone(&viewport),
        );
        assert!(!reader.is_seen("3"));
        reader.open_chapter(2, &chapter("3", 4)).await;
        assert!(reader.is_seen("3"));
        reader.close_chapter();
        drop(reader);

        let reader = reader_with(
            store as Arc<dyn PreferenceStore>,
            fetcher as Arc<dyn ImageFetcher>,
            viewport,
        );
        assert!(reader.is_seen("3"));
    }

    #[tokio::test]
    async fn closing_a_chapter_resets_the_session() {
        let viewport = Arc::new(RecordingViewport::new());
        let fetcher = Arc::new(FakeFetcher::new());
        let mut reader = reader_with(
            Arc::new(MemoryPreferenceStore::new()),
            fetcher as Arc<dyn ImageFetcher>,
            viewport,
        );
        let events = reader.events();

        reader.open_chapter(0, &chapter("1", 6)).await;
        reader.close_chapter();

        assert_eq!(reader.item_count(), 0);
        assert_eq!(reader.current_index(), 0);
        assert!(events
            .lock()
            .iter()
            .any(|event| matches!(event, ReaderEvent::ChapterClosed(_))));

        // closing twice is harmless
        reader.close_chapter();
    }
}
