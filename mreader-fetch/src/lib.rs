use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mreader_core::{
    EventSink, ImageFetcher, ImageItem, LoadState, ReaderEvent, ViewportProvider,
};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Shared table of per-image load state for the open chapter. State moves
/// strictly forward (Pending -> Enqueued -> Loading -> Loaded/Failed); a
/// rejected transition means another path already claimed the item, which is
/// how enqueue deduplication and the no-double-load guarantee fall out.
#[derive(Clone)]
pub struct ItemTable {
    inner: Arc<Mutex<Vec<ImageItem>>>,
}

impl ItemTable {
    pub fn from_refs(refs: &[String]) -> Self {
        let items = refs
            .iter()
            .enumerate()
            .map(|(index, url)| ImageItem::new(index, url.clone()))
            .collect();
        Self {
            inner: Arc::new(Mutex::new(items)),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn state(&self, index: usize) -> Option<LoadState> {
        self.inner.lock().get(index).map(|item| item.state)
    }

    pub fn url(&self, index: usize) -> Option<String> {
        self.inner.lock().get(index).map(|item| item.source_url.clone())
    }

    pub fn states(&self) -> Vec<LoadState> {
        self.inner.lock().iter().map(|item| item.state).collect()
    }

    fn advance(&self, index: usize, to: LoadState) -> bool {
        let mut items = self.inner.lock();
        let Some(item) = items.get_mut(index) else {
            return false;
        };
        if rank(to) <= rank(item.state) {
            return false;
        }
        item.state = to;
        true
    }

    /// Claims the item for the queue. False when it is already enqueued,
    /// loading, or settled.
    pub fn mark_enqueued(&self, index: usize) -> bool {
        let mut items = self.inner.lock();
        let Some(item) = items.get_mut(index) else {
            return false;
        };
        if !item.state.accepts_enqueue() {
            return false;
        }
        item.state = LoadState::Enqueued;
        true
    }

    /// Claims the item for an actual fetch, from either the queue or a
    /// force-load. False when a fetch already started or finished.
    pub fn mark_loading(&self, index: usize) -> bool {
        self.advance(index, LoadState::Loading)
    }

    pub fn mark_loaded(&self, index: usize) -> bool {
        self.advance(index, LoadState::Loaded)
    }

    pub fn mark_failed(&self, index: usize) -> bool {
        self.advance(index, LoadState::Failed)
    }

    /// Returns queue-claimed items to Pending. Used when a layout rebuild
    /// drops the queue on the floor; without this, claimed-but-unstarted
    /// items could never re-enter a queue.
    pub fn reset_enqueued(&self) {
        for item in self.inner.lock().iter_mut() {
            if item.state == LoadState::Enqueued {
                item.state = LoadState::Pending;
            }
        }
    }
}

fn rank(state: LoadState) -> u8 {
    match state {
        LoadState::Pending => 0,
        LoadState::Enqueued => 1,
        LoadState::Loading => 2,
        LoadState::Loaded | LoadState::Failed => 3,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSide {
    Front,
    Back,
}

/// Ordered, deduplicated worklist of pending loads. Front insertion is the
/// whole priority story: the only ordering signal available is scroll
/// direction, so items the user is approaching jump the line and everything
/// else appends. Deliberately not a distance-ranked heap.
#[derive(Default)]
pub struct LoadQueue {
    entries: VecDeque<usize>,
}

impl LoadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, items: &ItemTable, index: usize, side: QueueSide) -> bool {
        if !items.mark_enqueued(index) {
            return false;
        }
        match side {
            QueueSide::Front => self.entries.push_front(index),
            QueueSide::Back => self.entries.push_back(index),
        }
        true
    }

    pub fn pop(&mut self) -> Option<usize> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

pub type SharedQueue = Arc<Mutex<LoadQueue>>;

pub fn shared_queue() -> SharedQueue {
    Arc::new(Mutex::new(LoadQueue::new()))
}

#[derive(Debug, Clone, Copy)]
pub struct LoaderConfig {
    /// Maximum simultaneous in-flight queued loads.
    pub concurrency: usize,
    /// Re-poll interval while the queue is empty but loads are in flight.
    pub repoll: Duration,
    /// Coalescing window before a scheduled drain pass actually starts.
    pub debounce: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            repoll: Duration::from_millis(100),
            debounce: Duration::from_millis(16),
        }
    }
}

enum LoadOutcome {
    Settled,
}

/// Drains the shared queue with a fixed concurrency bound. Queued loads go
/// through `drain`; correctness-critical loads (current item, neighbors, seek
/// targets) go through `force_load`, which starts immediately and ignores the
/// bound.
pub struct ConcurrencyLimitedLoader {
    items: ItemTable,
    queue: SharedQueue,
    fetcher: Arc<dyn ImageFetcher>,
    viewport: Arc<dyn ViewportProvider>,
    events: EventSink,
    generation: Arc<AtomicU64>,
    session_generation: u64,
    config: LoaderConfig,
    busy: AtomicBool,
    drain_scheduled: AtomicBool,
}

impl ConcurrencyLimitedLoader {
    pub fn new(
        items: ItemTable,
        queue: SharedQueue,
        fetcher: Arc<dyn ImageFetcher>,
        viewport: Arc<dyn ViewportProvider>,
        events: EventSink,
        generation: Arc<AtomicU64>,
        config: LoaderConfig,
    ) -> Self {
        let session_generation = generation.load(Ordering::SeqCst);
        Self {
            items,
            queue,
            fetcher,
            viewport,
            events,
            generation,
            session_generation,
            config,
            busy: AtomicBool::new(false),
            drain_scheduled: AtomicBool::new(false),
        }
    }

    pub fn items(&self) -> &ItemTable {
        &self.items
    }

    pub fn queue(&self) -> &SharedQueue {
        &self.queue
    }

    fn stale(&self) -> bool {
        self.generation.load(Ordering::SeqCst) != self.session_generation
    }

    /// Schedules a drain pass behind the coalescing window. Repeated calls
    /// within the window collapse into a single pass, so a scroll gesture
    /// that crosses many items triggers one scheduling run.
    pub async fn schedule_drain(self: &Arc<Self>) {
        if self.drain_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(self.config.debounce).await;
        self.drain_scheduled.store(false, Ordering::SeqCst);
        self.drain().await;
    }

    /// Runs until the queue is empty and nothing is in flight. While loads
    /// are in flight with an empty queue it re-polls instead of terminating,
    /// because the observer may append concurrently.
    pub async fn drain(self: &Arc<Self>) {
        if self.busy.swap(true, Ordering::SeqCst) {
            return;
        }

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<LoadOutcome>();
        let mut active = 0usize;

        loop {
            while active < self.config.concurrency {
                let next = self.queue.lock().pop();
                let Some(index) = next else {
                    break;
                };
                // a force-load may have claimed the entry while it waited
                if !self.items.mark_loading(index) {
                    continue;
                }
                active += 1;
                self.spawn_load(index, tx.clone());
            }

            if active == 0 {
                if self.queue.lock().is_empty() {
                    break;
                }
                continue;
            }

            tokio::select! {
                outcome = rx.recv() => {
                    if outcome.is_some() {
                        active -= 1;
                    }
                }
                _ = tokio::time::sleep(self.config.repoll) => {}
            }
        }

        self.busy.store(false, Ordering::SeqCst);
    }

    fn spawn_load(
        self: &Arc<Self>,
        index: usize,
        tx: tokio::sync::mpsc::UnboundedSender<LoadOutcome>,
    ) {
        let loader = Arc::clone(self);
        tokio::spawn(async move {
            loader.run_load(index).await;
            let _ = tx.send(LoadOutcome::Settled);
        });
    }

    /// One fetch-then-swap attempt. Completions for a chapter that has since
    /// been closed are discarded without touching the viewport.
    async fn run_load(&self, index: usize) {
        let Some(url) = self.items.url(index) else {
            return;
        };
        match self.fetcher.fetch(&url).await {
            Ok(data) => {
                if self.stale() {
                    debug!(index, "discarding load for closed chapter");
                    return;
                }
                self.viewport.swap_placeholder(index, data);
                self.items.mark_loaded(index);
                self.events.lock().push(ReaderEvent::ItemLoaded(index));
            }
            Err(err) => {
                warn!(?err, index, url = %url, "image load failed");
                if self.stale() {
                    return;
                }
                self.items.mark_failed(index);
                self.events.lock().push(ReaderEvent::ItemFailed(index));
            }
        }
    }

    /// Loads one item immediately, outside the queue and the bound, and
    /// returns once the attempt has settled either way. An item another path
    /// is already fetching is awaited rather than fetched twice.
    pub async fn force_load(&self, index: usize) {
        let Some(state) = self.items.state(index) else {
            return;
        };
        if state.is_settled() {
            return;
        }
        if self.items.mark_loading(index) {
            self.run_load(index).await;
            return;
        }
        // already loading elsewhere; wait for that attempt to settle
        loop {
            match self.items.state(index) {
                Some(state) if !state.is_settled() => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                _ => return,
            }
        }
    }

    /// Force-loads the item and its existing immediate neighbors, resolving
    /// only after each has loaded or failed.
    pub async fn ensure_loaded_around(&self, index: usize, radius: usize) {
        let count = self.items.len();
        if count == 0 {
            return;
        }
        let start = index.saturating_sub(radius);
        let end = (index + radius).min(count - 1);
        for target in start..=end {
            self.force_load(target).await;
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ObserverConfig {
    /// Extra visibility margin on each side, as a multiple of viewport
    /// height. 2.0 means items within two screens are considered relevant.
    pub margin_factor: f32,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self { margin_factor: 2.0 }
    }
}

/// Watches which items sit inside the expanded visible region and feeds the
/// newly relevant ones into the queue, front or back depending on scroll
/// direction. Independent of the loader; a scan only fills the queue, the
/// caller schedules the drain.
pub struct ViewportObserver {
    items: ItemTable,
    queue: SharedQueue,
    viewport: Arc<dyn ViewportProvider>,
    last_scroll_top: Mutex<Option<f32>>,
    config: ObserverConfig,
}

impl ViewportObserver {
    pub fn new(
        items: ItemTable,
        queue: SharedQueue,
        viewport: Arc<dyn ViewportProvider>,
        config: ObserverConfig,
    ) -> Self {
        Self {
            items,
            queue,
            viewport,
            last_scroll_top: Mutex::new(None),
            config,
        }
    }

    /// Re-evaluates visibility after a scroll or render. Returns true when at
    /// least one new item entered the queue and a drain pass is worth
    /// scheduling.
    pub fn scan(&self) -> bool {
        if !self.viewport.supports_visibility_observation() {
            return self.enqueue_everything();
        }

        let Some(metrics) = self.viewport.metrics() else {
            return false;
        };

        let side = self.side_for(metrics.scroll_top);
        let margin = self.config.margin_factor * metrics.height;
        let window_top = metrics.scroll_top - margin;
        let window_bottom = metrics.scroll_top + metrics.height + margin;

        let mut queued = false;
        let count = self.viewport.item_count();
        for index in 0..count {
            let Some(geometry) = self.viewport.item_geometry(index) else {
                continue;
            };
            let item_bottom = geometry.top + geometry.height;
            if item_bottom < window_top || geometry.top > window_bottom {
                continue;
            }
            if self.queue.lock().enqueue(&self.items, index, side) {
                queued = true;
            }
        }
        queued
    }

    /// Degraded-but-correct fallback for hosts without visibility
    /// observation: everything is loaded unconditionally.
    fn enqueue_everything(&self) -> bool {
        let mut queued = false;
        let mut queue = self.queue.lock();
        for index in 0..self.items.len() {
            if queue.enqueue(&self.items, index, QueueSide::Back) {
                queued = true;
            }
        }
        queued
    }

    /// Upward scrolls insert at the front: the items above are the ones the
    /// user is approaching.
    fn side_for(&self, scroll_top: f32) -> QueueSide {
        let mut last = self.last_scroll_top.lock();
        let side = match *last {
            Some(previous) if scroll_top < previous => QueueSide::Front,
            _ => QueueSide::Back,
        };
        *last = Some(scroll_top);
        side
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SweepConfig {
    pub batch_size: usize,
    pub batch_delay: Duration,
    /// Wall-clock budget after which batches defer to idle pacing.
    pub budget: Duration,
    pub idle_delay: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            batch_size: 3,
            batch_delay: Duration::from_millis(100),
            budget: Duration::from_secs(10),
            idle_delay: Duration::from_millis(250),
        }
    }
}

/// Opportunistically loads everything the observer path has not touched yet,
/// in small paced batches so the chapter eventually becomes fully available
/// without saturating the network.
pub struct BackgroundSweeper {
    loader: Arc<ConcurrencyLimitedLoader>,
    config: SweepConfig,
}

impl BackgroundSweeper {
    pub fn new(loader: Arc<ConcurrencyLimitedLoader>, config: SweepConfig) -> Self {
        Self { loader, config }
    }

    /// Runs to completion or until the chapter closes. Items already
    /// enqueued, loading, or settled are skipped.
    pub async fn run(&self) {
        let start = Instant::now();
        let count = self.loader.items.len();
        let mut cursor = 0usize;

        loop {
            if self.loader.stale() {
                return;
            }

            let mut batch = Vec::with_capacity(self.config.batch_size);
            while cursor < count && batch.len() < self.config.batch_size {
                if self.loader.items.state(cursor) == Some(LoadState::Pending) {
                    batch.push(cursor);
                }
                cursor += 1;
            }
            if batch.is_empty() {
                if cursor >= count {
                    debug!(count, "background sweep complete");
                    return;
                }
                continue;
            }

            for index in batch {
                self.loader.force_load(index).await;
            }

            if start.elapsed() > self.config.budget {
                tokio::task::yield_now().await;
                tokio::time::sleep(self.config.idle_delay).await;
            } else {
                tokio::time::sleep(self.config.batch_delay).await;
            }
        }
    }
}
