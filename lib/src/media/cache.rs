//! Three-slot lookahead cache over a [MediaList](super::MediaList).
//!
//! The slots hold the entries before, at and after the browsing cursor.
//! The slot the caller needs right now is loaded inline; its neighbours
//! are loaded by a single background task. At most one background task
//! exists per cache. Any operation that moves the window first cancels
//! that task and waits for it to exit, so a slot is never written by a
//! load that belongs to an older window.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, warn};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::decode::{CacheLoadError, MediaDecoder};
use super::{MediaEntry, MediaKind};
use crate::frame::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPosition {
    Previous = 0,
    Current = 1,
    Next = 2,
}

/// Load order for the background task: the slot the user is waiting on
/// first, then the direction they are most likely to go.
const LOAD_ORDER: [SlotPosition; 3] = [
    SlotPosition::Current,
    SlotPosition::Next,
    SlotPosition::Previous,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Forward,
    Back,
}

#[derive(Debug, Clone)]
pub enum CachedMedia {
    /// Decoded and scaled for the display.
    Image(Arc<Frame>),
    /// Videos are decoded on demand by the player, never prefetched.
    Video(PathBuf),
}

#[derive(Debug, Clone)]
pub enum SlotState {
    Empty,
    Loading { index: usize },
    Ready { index: usize, media: CachedMedia },
}

impl SlotState {
    /// The list index this slot holds or is loading.
    pub fn index(&self) -> Option<usize> {
        match self {
            SlotState::Empty => None,
            SlotState::Loading { index } | SlotState::Ready { index, .. } => Some(*index),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, SlotState::Ready { .. })
    }
}

struct Slots {
    cells: [SlotState; 3],
    /// Bumped on every shift or clear. Background writes carry the
    /// generation they were planned under and are dropped on mismatch.
    generation: u64,
}

struct Shared {
    slots: Mutex<Slots>,
    changed: Notify,
    active_loads: AtomicUsize,
    peak_loads: AtomicUsize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct BackgroundLoad {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct PredictiveMediaCache {
    shared: Arc<Shared>,
    decoder: Arc<dyn MediaDecoder>,
    entries: Arc<[MediaEntry]>,
    cursor: usize,
    background: Option<BackgroundLoad>,
}

impl PredictiveMediaCache {
    pub fn new(decoder: Arc<dyn MediaDecoder>) -> Self {
        Self {
            shared: Arc::new(Shared {
                slots: Mutex::new(Slots {
                    cells: [SlotState::Empty, SlotState::Empty, SlotState::Empty],
                    generation: 0,
                }),
                changed: Notify::new(),
                active_loads: AtomicUsize::new(0),
                peak_loads: AtomicUsize::new(0),
            }),
            decoder,
            entries: Arc::from(Vec::new()),
            cursor: 0,
            background: None,
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn current_entry(&self) -> Option<&MediaEntry> {
        self.entries.get(self.cursor)
    }

    pub fn slot(&self, position: SlotPosition) -> SlotState {
        self.shared.lock().cells[position as usize].clone()
    }

    pub fn is_current_ready(&self) -> bool {
        self.shared.lock().cells[SlotPosition::Current as usize].is_ready()
    }

    /// Replaces the list and moves the cursor, dropping everything cached.
    /// Loads the current entry before returning and its neighbours in the
    /// background.
    pub async fn refresh(
        &mut self,
        entries: Arc<[MediaEntry]>,
        cursor: usize,
    ) -> Result<(), CacheLoadError> {
        self.cancel_and_join().await;
        self.entries = entries;
        self.cursor = cursor.min(self.entries.len().saturating_sub(1));
        self.clear_slots();
        if self.entries.is_empty() {
            return Ok(());
        }
        let loaded = self.load_current_inline().await;
        self.spawn_background();
        loaded.map(|_| ())
    }

    /// Moves the cursor to `index`, invalidating the cache.
    pub async fn jump_to(&mut self, index: usize) -> Result<(), CacheLoadError> {
        let entries = self.entries.clone();
        self.refresh(entries, index).await
    }

    /// Clears all slots and stops background loading. The list is kept.
    pub async fn invalidate(&mut self) {
        self.cancel_and_join().await;
        self.clear_slots();
    }

    /// Moves the cursor one entry, shifting the window. Returns `false`
    /// without doing anything at either end of the list.
    pub async fn advance(&mut self, step: Step) -> bool {
        let target = match step {
            Step::Forward => self.cursor.checked_add(1),
            Step::Back => self.cursor.checked_sub(1),
        };
        let Some(target) = target.filter(|t| *t < self.entries.len()) else {
            return false;
        };

        self.cancel_and_join().await;
        {
            let mut slots = self.shared.lock();
            debug_assert!(
                !slots
                    .cells
                    .iter()
                    .any(|s| matches!(s, SlotState::Loading { .. })),
                "cache window shifted while a load was still writing"
            );
            slots.generation += 1;
            match step {
                Step::Forward => {
                    slots.cells.rotate_left(1);
                    slots.cells[SlotPosition::Next as usize] = SlotState::Empty;
                }
                Step::Back => {
                    slots.cells.rotate_right(1);
                    slots.cells[SlotPosition::Previous as usize] = SlotState::Empty;
                }
            }
        }
        self.cursor = target;
        self.spawn_background();
        true
    }

    /// The media at the cursor. Waits if its slot is loading, loads it
    /// inline if the slot is empty. `Ok(None)` means the list is empty.
    pub async fn current_media(&mut self) -> Result<Option<CachedMedia>, CacheLoadError> {
        if self.entries.is_empty() {
            return Ok(None);
        }
        loop {
            let notified = self.shared.changed.notified();
            let state = self.shared.lock().cells[SlotPosition::Current as usize].clone();
            match state {
                SlotState::Ready { media, .. } => return Ok(Some(media)),
                SlotState::Loading { .. } => notified.await,
                SlotState::Empty => break,
            }
        }
        self.load_current_inline().await.map(Some)
    }

    /// Waits for the background task to finish on its own.
    pub async fn settle(&mut self) {
        if let Some(load) = &mut self.background {
            if let Err(e) = (&mut load.handle).await {
                warn!("background media load failed: {e}");
            }
            self.background = None;
        }
    }

    async fn cancel_and_join(&mut self) {
        if let Some(load) = &mut self.background {
            load.token.cancel();
            if let Err(e) = (&mut load.handle).await {
                warn!("background media load failed: {e}");
            }
            self.background = None;
        }
        let mut slots = self.shared.lock();
        for cell in slots.cells.iter_mut() {
            if matches!(cell, SlotState::Loading { .. }) {
                *cell = SlotState::Empty;
            }
        }
        drop(slots);
        self.shared.changed.notify_waiters();
    }

    fn clear_slots(&mut self) {
        let mut slots = self.shared.lock();
        slots.generation += 1;
        slots.cells = [SlotState::Empty, SlotState::Empty, SlotState::Empty];
    }

    fn index_for(&self, position: SlotPosition) -> Option<usize> {
        let index = match position {
            SlotPosition::Previous => self.cursor.checked_sub(1)?,
            SlotPosition::Current => self.cursor,
            SlotPosition::Next => self.cursor + 1,
        };
        (index < self.entries.len()).then_some(index)
    }

    async fn load_current_inline(&mut self) -> Result<CachedMedia, CacheLoadError> {
        let index = self.cursor;
        let entry = self.entries[index].clone();
        let media = match load_entry(self.decoder.clone(), entry).await {
            Ok(media) => media,
            Err(e) => {
                warn!("failed to load media {index}: {e}");
                return Err(e);
            }
        };
        let mut slots = self.shared.lock();
        let current = &mut slots.cells[SlotPosition::Current as usize];
        if matches!(current, SlotState::Empty) {
            *current = SlotState::Ready {
                index,
                media: media.clone(),
            };
        }
        drop(slots);
        self.shared.changed.notify_waiters();
        Ok(media)
    }

    fn spawn_background(&mut self) {
        debug_assert!(self.background.is_none(), "background load already running");
        let mut plan = Vec::new();
        let generation = {
            let mut slots = self.shared.lock();
            for position in LOAD_ORDER {
                let Some(index) = self.index_for(position) else {
                    continue;
                };
                let cell = &mut slots.cells[position as usize];
                if matches!(cell, SlotState::Empty) {
                    *cell = SlotState::Loading { index };
                    plan.push((position, index));
                }
            }
            slots.generation
        };
        if plan.is_empty() {
            return;
        }
        debug!("background load of {plan:?}");
        let token = CancellationToken::new();
        let handle = tokio::spawn(load_slots(
            self.shared.clone(),
            self.decoder.clone(),
            self.entries.clone(),
            plan,
            generation,
            token.clone(),
        ));
        self.background = Some(BackgroundLoad { token, handle });
    }

    #[cfg(test)]
    fn peak_concurrent_loads(&self) -> usize {
        self.shared.peak_loads.load(Ordering::SeqCst)
    }
}

impl Drop for PredictiveMediaCache {
    fn drop(&mut self) {
        if let Some(load) = &self.background {
            load.token.cancel();
        }
    }
}

async fn load_entry(
    decoder: Arc<dyn MediaDecoder>,
    entry: MediaEntry,
) -> Result<CachedMedia, CacheLoadError> {
    match entry.kind {
        MediaKind::Video => Ok(CachedMedia::Video(entry.path)),
        MediaKind::Image => {
            let frame = tokio::task::spawn_blocking(move || decoder.decode_image(&entry.path))
                .await
                .map_err(|e| CacheLoadError::Task(e.to_string()))??;
            Ok(CachedMedia::Image(Arc::new(frame)))
        }
    }
}

async fn load_slots(
    shared: Arc<Shared>,
    decoder: Arc<dyn MediaDecoder>,
    entries: Arc<[MediaEntry]>,
    plan: Vec<(SlotPosition, usize)>,
    generation: u64,
    token: CancellationToken,
) {
    let active = shared.active_loads.fetch_add(1, Ordering::SeqCst) + 1;
    shared.peak_loads.fetch_max(active, Ordering::SeqCst);

    for (position, index) in plan {
        if token.is_cancelled() {
            break;
        }
        let result = load_entry(decoder.clone(), entries[index].clone()).await;

        let mut slots = shared.lock();
        if slots.generation != generation {
            debug!("dropping stale load of {index}");
            break;
        }
        let cell = &mut slots.cells[position as usize];
        if matches!(cell, SlotState::Loading { index: i } if *i == index) {
            *cell = match result {
                Ok(media) => SlotState::Ready { index, media },
                Err(e) => {
                    warn!("failed to preload media {index}: {e}");
                    SlotState::Empty
                }
            };
        }
        drop(slots);
        shared.changed.notify_waiters();
    }

    shared.active_loads.fetch_sub(1, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Dimensions;
    use crate::media::tests::entry;
    use embedded_graphics::pixelcolor::Rgb888;
    use embedded_graphics::prelude::RgbColor;
    use proptest::prelude::*;
    use std::path::Path;
    use std::time::Duration;

    /// Decodes `N.png` into a 1x1 frame whose red channel is N. Paths
    /// starting with `bad` fail.
    struct TagDecoder {
        delay: Duration,
        calls: AtomicUsize,
    }

    impl TagDecoder {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl MediaDecoder for TagDecoder {
        fn decode_image(&self, path: &Path) -> Result<Frame, CacheLoadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
            if stem.starts_with("bad") {
                return Err(CacheLoadError::Io(std::io::Error::other("corrupt")));
            }
            let tag: u8 = stem.parse().unwrap_or(0);
            Ok(Frame::filled(Dimensions::new(1, 1), Rgb888::new(tag, 0, 0)))
        }
    }

    fn numbered(count: usize) -> Arc<[MediaEntry]> {
        (0..count)
            .map(|i| entry(&format!("{i}.png"), i as u64))
            .collect::<Vec<_>>()
            .into()
    }

    fn tag_of(media: &CachedMedia) -> Option<u8> {
        match media {
            CachedMedia::Image(frame) => frame.pixel(0, 0).map(|c| c.r()),
            CachedMedia::Video(_) => None,
        }
    }

    fn assert_window(cache: &PredictiveMediaCache) {
        let cursor = cache.cursor();
        let len = cache.len();
        let expect = |offset: isize| {
            let i = cursor as isize + offset;
            (i >= 0 && (i as usize) < len).then_some(i as usize)
        };
        assert_eq!(cache.slot(SlotPosition::Previous).index(), expect(-1));
        assert_eq!(cache.slot(SlotPosition::Current).index(), expect(0));
        assert_eq!(cache.slot(SlotPosition::Next).index(), expect(1));
        for position in [SlotPosition::Previous, SlotPosition::Current, SlotPosition::Next] {
            let slot = cache.slot(position);
            if let SlotState::Ready { index, media } = slot {
                assert_eq!(tag_of(&media), Some(index as u8));
            } else {
                assert!(matches!(slot, SlotState::Empty));
            }
        }
    }

    #[tokio::test]
    async fn test_refresh_loads_current_then_neighbour() {
        let mut cache = PredictiveMediaCache::new(TagDecoder::new(Duration::ZERO));
        cache.refresh(numbered(3), 0).await.unwrap();
        assert!(cache.is_current_ready());

        cache.settle().await;
        assert_window(&cache);
        assert!(cache.slot(SlotPosition::Next).is_ready());
    }

    #[tokio::test]
    async fn test_refresh_clamps_cursor_and_handles_empty() {
        let mut cache = PredictiveMediaCache::new(TagDecoder::new(Duration::ZERO));
        cache.refresh(numbered(2), 7).await.unwrap();
        assert_eq!(cache.cursor(), 1);

        cache.refresh(numbered(0), 0).await.unwrap();
        assert!(cache.is_empty());
        assert!(cache.current_media().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_advance_stops_at_ends() {
        let mut cache = PredictiveMediaCache::new(TagDecoder::new(Duration::ZERO));
        cache.refresh(numbered(2), 0).await.unwrap();
        assert!(!cache.advance(Step::Back).await);
        assert!(cache.advance(Step::Forward).await);
        assert!(!cache.advance(Step::Forward).await);
        assert_eq!(cache.cursor(), 1);
    }

    #[tokio::test]
    async fn test_shift_reuses_ready_neighbour() {
        let decoder = TagDecoder::new(Duration::ZERO);
        let mut cache = PredictiveMediaCache::new(decoder.clone());
        cache.refresh(numbered(5), 0).await.unwrap();
        cache.settle().await;
        let before = decoder.calls.load(Ordering::SeqCst);

        cache.advance(Step::Forward).await;
        let media = cache.current_media().await.unwrap().unwrap();
        assert_eq!(tag_of(&media), Some(1));
        cache.settle().await;
        // only the new forward neighbour was decoded
        assert_eq!(decoder.calls.load(Ordering::SeqCst), before + 1);
        assert_window(&cache);
    }

    #[tokio::test]
    async fn test_current_waits_for_background_load() {
        let mut cache = PredictiveMediaCache::new(TagDecoder::new(Duration::from_millis(30)));
        cache.refresh(numbered(4), 0).await.unwrap();
        // next is still loading in the background
        cache.advance(Step::Forward).await;
        let media = cache.current_media().await.unwrap().unwrap();
        assert_eq!(tag_of(&media), Some(1));
    }

    #[tokio::test]
    async fn test_failed_load_leaves_slot_empty_and_retries() {
        let entries: Arc<[MediaEntry]> = vec![entry("0.png", 0), entry("bad.png", 1)].into();
        let decoder = TagDecoder::new(Duration::ZERO);
        let mut cache = PredictiveMediaCache::new(decoder.clone());
        cache.refresh(entries, 0).await.unwrap();
        cache.settle().await;
        assert!(matches!(cache.slot(SlotPosition::Next), SlotState::Empty));

        cache.advance(Step::Forward).await;
        cache.settle().await;
        let calls = decoder.calls.load(Ordering::SeqCst);
        assert!(cache.current_media().await.is_err());
        assert!(decoder.calls.load(Ordering::SeqCst) > calls);
    }

    #[tokio::test]
    async fn test_video_is_not_decoded() {
        let entries: Arc<[MediaEntry]> = vec![entry("clip.mp4", 0)].into();
        let decoder = TagDecoder::new(Duration::ZERO);
        let mut cache = PredictiveMediaCache::new(decoder.clone());
        cache.refresh(entries, 0).await.unwrap();
        match cache.current_media().await.unwrap() {
            Some(CachedMedia::Video(path)) => assert_eq!(path, PathBuf::from("clip.mp4")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(decoder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_jump_and_invalidate() {
        let mut cache = PredictiveMediaCache::new(TagDecoder::new(Duration::ZERO));
        cache.refresh(numbered(6), 0).await.unwrap();
        cache.jump_to(4).await.unwrap();
        cache.settle().await;
        assert_eq!(cache.cursor(), 4);
        assert_window(&cache);

        cache.invalidate().await;
        assert!(matches!(cache.slot(SlotPosition::Current), SlotState::Empty));
        assert_eq!(cache.len(), 6);
    }

    fn steps() -> impl Strategy<Value = Vec<Step>> {
        prop::collection::vec(prop_oneof![Just(Step::Forward), Just(Step::Back)], 1..40)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_window_invariant_after_settle(len in 1usize..12, start in 0usize..12, steps in steps()) {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let mut cache = PredictiveMediaCache::new(TagDecoder::new(Duration::from_micros(300)));
                cache.refresh(numbered(len), start).await.unwrap();
                for step in steps {
                    cache.advance(step).await;
                }
                cache.settle().await;
                assert_window(&cache);
                assert!(cache.peak_concurrent_loads() <= 1);
            });
        }

        #[test]
        fn prop_rapid_navigation_never_overlaps_loads(steps in steps()) {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let mut cache = PredictiveMediaCache::new(TagDecoder::new(Duration::from_millis(2)));
                cache.refresh(numbered(20), 10).await.unwrap();
                for step in steps {
                    cache.advance(step).await;
                    if let Ok(Some(media)) = cache.current_media().await {
                        assert_eq!(tag_of(&media), Some(cache.cursor() as u8));
                    }
                }
                assert!(cache.peak_concurrent_loads() <= 1);
            });
        }
    }
}
