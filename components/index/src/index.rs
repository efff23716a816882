//! The index: zones, their threads, the chapter writer and the volume, and
//! the open, save, load and rebuild paths that tie them together.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use crossbeam_channel::unbounded;
use dedupe_types::{
    record::RecordName,
    request::{IndexRegion, Request, RequestType, Response},
};
use parking_lot::Mutex;
use serde::Serialize;
use snafu::ensure;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::{
    chapter_writer::{ChapterWindow, ChapterWriter},
    config::IndexConfig,
    err::{
        CorruptDataSnafu, DisconnectedSnafu, IndexNotSavedCleanlySnafu, InvalidConfigSnafu, Result,
        SuspendedSnafu,
    },
    geometry::Geometry,
    layout::{IndexLayout, IndexState},
    open_chapter::{load_open_chapters, save_open_chapters, OpenChapterZone},
    sparse_cache::SparseCacheStats,
    storage::{BlockStore, BufferedReader, BufferedWriter},
    volume::{Volume, VolumeConfig},
    volume_index::{VolumeIndex, VolumeIndexConfig},
    worker::{
        InFlight, Queue, ReadMessage, ReaderWorkerStarter, TriageMessage, TriageWorkerStarter, Worker,
        ZoneMessage, ZoneRequest, ZoneWorkerStarter,
    },
    zone::IndexZone,
};

/// How [`Index::open`] treats what is already in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Format a new, empty index.
    Create,
    /// Load the saved index, rebuilding from the volume if it cannot be
    /// trusted.
    Load,
    /// Load the saved index or fail.
    NoRebuild,
    /// Ignore the saved index and rebuild from the volume.
    Rebuild,
}

/// Lets another thread interrupt a rebuild between chapters.
#[derive(Debug, Clone, Default)]
pub struct SuspendToken(Arc<AtomicBool>);

impl SuspendToken {
    pub fn suspend(&self) { self.0.store(true, Ordering::Release) }

    pub fn resume(&self) { self.0.store(false, Ordering::Release) }

    pub fn is_suspended(&self) -> bool { self.0.load(Ordering::Acquire) }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RebuildStats {
    pub chapters_replayed: u64,
    pub records_replayed:  u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub entries_indexed:        u64,
    pub entries_discarded:      u64,
    pub collisions:             u64,
    pub overflows:              u64,
    pub early_flushes:          u64,
    pub chapters_written:       u64,
    /// Chapters a zone closed because another zone filled it first.
    pub forced_closes:          u64,
    pub oldest_chapter:         u64,
    pub newest_chapter:         u64,
    pub requests:               u64,
    pub posts_found_open:       u64,
    pub posts_found_dense:      u64,
    pub posts_found_sparse:     u64,
    pub posts_not_found:        u64,
    pub updates_found:          u64,
    pub updates_not_found:      u64,
    pub queries_found:          u64,
    pub queries_not_found:      u64,
    pub deletions_found:        u64,
    pub deletions_not_found:    u64,
    pub sparse_cache:           SparseCacheStats,
}

#[derive(Default)]
pub(crate) struct RequestCounters {
    requests:            AtomicU64,
    posts_found_open:    AtomicU64,
    posts_found_dense:   AtomicU64,
    posts_found_sparse:  AtomicU64,
    posts_not_found:     AtomicU64,
    updates_found:       AtomicU64,
    updates_not_found:   AtomicU64,
    queries_found:       AtomicU64,
    queries_not_found:   AtomicU64,
    deletions_found:     AtomicU64,
    deletions_not_found: AtomicU64,
    overflows:           AtomicU64,
    forced_closes:       AtomicU64,
}

fn bump(counter: &AtomicU64) { counter.fetch_add(1, Ordering::Relaxed); }

fn read(counter: &AtomicU64) -> u64 { counter.load(Ordering::Relaxed) }

impl RequestCounters {
    pub(crate) fn record(&self, response: &Response) {
        bump(&self.requests);
        let counter = match (response.request_type, response.found) {
            (RequestType::Post, false) => &self.posts_not_found,
            (RequestType::Post, true) => match response.location {
                IndexRegion::InOpenChapter => &self.posts_found_open,
                IndexRegion::InSparse => &self.posts_found_sparse,
                _ => &self.posts_found_dense,
            },
            (RequestType::Update, true) => &self.updates_found,
            (RequestType::Update, false) => &self.updates_not_found,
            (RequestType::Query | RequestType::QueryNoUpdate, true) => &self.queries_found,
            (RequestType::Query | RequestType::QueryNoUpdate, false) => &self.queries_not_found,
            (RequestType::Delete, true) => &self.deletions_found,
            (RequestType::Delete, false) => &self.deletions_not_found,
        };
        bump(counter);
    }

    pub(crate) fn overflow(&self) { bump(&self.overflows) }

    pub(crate) fn forced_close(&self) { bump(&self.forced_closes) }
}

/// Everything the zone, triage and reader threads share.
pub(crate) struct IndexInner {
    pub(crate) geometry:      Geometry,
    pub(crate) zone_count:    usize,
    pub(crate) volume:        Arc<Volume>,
    pub(crate) volume_index:  VolumeIndex,
    pub(crate) writer:        ChapterWriter,
    pub(crate) window:        Arc<ChapterWindow>,
    pub(crate) zones:         Vec<Mutex<IndexZone>>,
    /// Each zone's window, readable without the zone lock.
    pub(crate) zone_windows:  Vec<ChapterWindow>,
    pub(crate) queues:        Vec<Queue<ZoneMessage>>,
    pub(crate) readers:       Queue<ReadMessage>,
    pub(crate) triage_queue:  Option<Queue<TriageMessage>>,
    pub(crate) in_flight:     Arc<InFlight>,
    pub(crate) counters:      RequestCounters,
    layout:                   IndexLayout,
    need_to_save:             AtomicBool,
    last_save:                AtomicU64,
}

impl IndexInner {
    /// Note a change since the last save. The first change after a save
    /// marks the saved state stale on disk.
    pub(crate) fn mark_dirty(&self) {
        if !self.need_to_save.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.write_state(false) {
                warn!("failed to mark the saved index stale: {e}");
            }
        }
    }

    fn write_state(&self, clean: bool) -> Result<()> {
        IndexState {
            newest_chapter: self.window.newest(),
            oldest_chapter: self.window.oldest(),
            last_save: self.last_save.load(Ordering::Acquire),
            zone_count: self.zone_count as u32,
            clean,
        }
        .write(&self.layout.state)
    }

    /// Point every zone and the volume index at the window `[oldest, newest]`
    /// with empty open chapters.
    fn set_window(&self, oldest: u64, newest: u64) {
        self.window.set(oldest, newest);
        for (zone, window) in self.zones.iter().zip(&self.zone_windows) {
            zone.lock().reset(oldest, newest);
            window.set(oldest, newest);
        }
        self.volume_index.set_open_chapter(newest);
    }

    fn start(&self, mode: OpenMode, suspend: &SuspendToken) -> Result<Option<RebuildStats>> {
        if mode == OpenMode::Create {
            info!(
                "creating index of {} chapters with {} zones",
                self.geometry.chapters_per_volume, self.zone_count
            );
            self.volume.format()?;
            self.volume_index.reset();
            self.set_window(0, 0);
            self.write_state(false)?;
            return Ok(None);
        }

        self.volume.check_header()?;
        if mode == OpenMode::Rebuild {
            return self.rebuild(suspend).map(Some);
        }
        match self.load() {
            Ok(()) => Ok(None),
            Err(e) if mode == OpenMode::Load && e.is_recoverable_by_rebuild() => {
                warn!("cannot load the saved index, rebuilding from the volume: {e}");
                self.rebuild(suspend).map(Some)
            }
            Err(e) => Err(e),
        }
    }

    fn load(&self) -> Result<()> {
        let state = IndexState::read(&self.layout.state)?;
        ensure!(state.clean, IndexNotSavedCleanlySnafu);

        self.volume
            .load_page_map(&mut BufferedReader::new(self.layout.page_map.clone()))?;
        let last_update = self.volume.page_map_last_update();
        ensure!(
            state.newest_chapter == 0 || last_update + 1 == state.newest_chapter,
            CorruptDataSnafu {
                reason: format!(
                    "index page map was last updated for chapter {last_update}, not {}",
                    state.newest_chapter.saturating_sub(1)
                ),
            }
        );
        self.volume_index
            .load(&mut BufferedReader::new(self.layout.volume_index.clone()))?;
        self.set_window(state.oldest_chapter, state.newest_chapter);

        let loaded = {
            let mut zones: Vec<_> = self.zones.iter().map(|zone| zone.lock()).collect();
            let mut opens: Vec<&mut OpenChapterZone> = zones.iter_mut().map(|zone| &mut zone.open).collect();
            load_open_chapters(
                &mut opens,
                |name| self.volume_index.get_zone(name),
                &mut BufferedReader::new(self.layout.open_chapter.clone()),
            )?
        };
        self.last_save.store(state.last_save, Ordering::Release);

        // a loaded index is stale on disk until it is saved again
        self.write_state(false)?;
        info!(
            "loaded index with chapters [{}, {}), {loaded} open chapter records, saved by {} zones",
            state.oldest_chapter, state.newest_chapter, state.zone_count
        );
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let zones: Vec<_> = self.zones.iter().map(|zone| zone.lock()).collect();
        let newest = self.window.newest();
        self.write_state(false)?;

        self.volume
            .save_page_map(&mut BufferedWriter::new(self.layout.page_map.clone()))?;
        let opens: Vec<&OpenChapterZone> = zones.iter().map(|zone| &zone.open).collect();
        save_open_chapters(&opens, &mut BufferedWriter::new(self.layout.open_chapter.clone()))?;
        self.volume_index
            .save(&mut BufferedWriter::new(self.layout.volume_index.clone()))?;

        self.last_save.store(newest, Ordering::Release);
        self.write_state(true)?;
        self.need_to_save.store(false, Ordering::Release);
        info!("saved index at chapter {newest}");
        Ok(())
    }

    fn rebuild(&self, suspend: &SuspendToken) -> Result<RebuildStats> {
        info!("replaying volume to rebuild the index");
        self.volume_index.reset();
        self.volume.invalidate_caches();
        self.volume.set_lookup_for_rebuild(true);
        let replayed = self.replay_volume(suspend);
        self.volume.set_lookup_for_rebuild(false);

        let (oldest, newest, stats) = replayed?;
        self.set_window(oldest, newest);
        self.write_state(false)?;
        info!(
            "rebuilt index with chapters [{oldest}, {newest}): {} records from {} chapters",
            stats.records_replayed, stats.chapters_replayed
        );
        Ok(stats)
    }

    fn replay_volume(&self, suspend: &SuspendToken) -> Result<(u64, u64, RebuildStats)> {
        let mut stats = RebuildStats::default();
        let boundaries = self.volume.find_volume_chapter_boundaries()?;
        if boundaries.is_empty {
            info!("replay found an empty volume");
            return Ok((0, 0, stats));
        }
        ensure!(
            boundaries.lowest <= boundaries.highest,
            CorruptDataSnafu {
                reason: format!(
                    "volume chapters run from {} down to {}",
                    boundaries.lowest, boundaries.highest
                ),
            }
        );

        let newest = boundaries.highest + 1;
        let mut oldest = boundaries.lowest;
        // the open chapter takes over the oldest chapter's slot
        if newest == oldest + self.geometry.chapters_per_volume as u64 {
            oldest += 1;
        }

        let old_update = self.volume.page_map_last_update();
        for chapter in oldest..newest {
            ensure!(!suspend.is_suspended(), SuspendedSnafu);
            let will_be_sparse = self.geometry.is_chapter_sparse(oldest, newest, chapter);
            stats.records_replayed += self.replay_chapter(chapter, will_be_sparse)?;
            stats.chapters_replayed += 1;
        }
        self.volume_index.set_open_chapter(newest);

        let new_update = self.volume.page_map_last_update();
        if new_update != old_update {
            info!("replay changed index page map update from {old_update} to {new_update}");
        }
        Ok((oldest, newest, stats))
    }

    fn replay_chapter(&self, chapter: u64, will_be_sparse: bool) -> Result<u64> {
        self.volume_index.set_open_chapter(chapter);
        self.volume.rebuild_page_map(chapter)?;
        let mut replayed = 0;
        for record in self.volume.read_chapter_records(chapter)? {
            if self.replay_record(&record.name, chapter, will_be_sparse)? {
                replayed += 1;
            }
        }
        debug!("replayed {replayed} records of chapter {chapter}");
        Ok(replayed)
    }

    /// Index one name read back from `chapter`. Returns whether the name
    /// was considered at all.
    fn replay_record(&self, name: &RecordName, chapter: u64, will_be_sparse: bool) -> Result<bool> {
        // only hooks are indexed for chapters that end up sparse
        if will_be_sparse && !self.volume_index.is_sample(name) {
            return Ok(false);
        }

        let mut record = self.volume_index.get_record(name)?;
        let update = if !record.is_found {
            false
        } else if record.is_collision {
            if record.virtual_chapter == chapter {
                return Ok(true);
            }
            true
        } else if record.virtual_chapter == chapter {
            // may be a different name in the same chapter; assume it is
            false
        } else {
            self.volume
                .search_page_cache_for_rebuild(name, record.virtual_chapter)?
        };

        let result = if update {
            self.volume_index.set_record_chapter(&mut record, chapter)
        } else {
            self.volume_index.put_record(&mut record, chapter)
        };
        match result {
            // the rebuilt index loses these
            Err(e) if e.is_duplicate_name() || e.is_overflow() => Ok(true),
            result => result.map(|()| true),
        }
    }

    /// Route a request through triage: raise a sparse cache barrier in
    /// every zone first if the name is a hook last seen in a sparse chapter.
    pub(crate) fn triage(&self, request: ZoneRequest) {
        let zone = request.zone;
        if let Some(chapter) = self.volume_index.lookup_name(&request.request.name) {
            let window = &self.zone_windows[zone];
            if self
                .geometry
                .is_chapter_sparse(window.oldest(), window.newest(), chapter)
            {
                for queue in &self.queues {
                    let barrier = ZoneMessage::SparseCacheBarrier(chapter, self.in_flight.enter());
                    if let Err(e) = queue.submit(barrier) {
                        warn!("cannot raise a sparse cache barrier: {e}");
                    }
                }
            }
        }
        if let Err(e) = self.queues[zone].submit(ZoneMessage::Request(Box::new(request))) {
            warn!("triage cannot reach zone {zone}: {e}");
        }
    }

    /// Tell every other zone that `chapter` has closed.
    pub(crate) fn announce_chapter_closed(&self, from: usize, chapter: u64) {
        for (zone, queue) in self.queues.iter().enumerate() {
            if zone == from {
                continue;
            }
            let message = ZoneMessage::AnnounceChapterClosed(chapter, self.in_flight.enter());
            if let Err(e) = queue.submit(message) {
                warn!("cannot announce chapter {chapter} closed to zone {zone}: {e}");
            }
        }
    }
}

/// A deduplication index over one block store.
pub struct Index {
    inner:         Arc<IndexInner>,
    zone_workers:  Vec<Worker>,
    triage:        Option<Worker>,
    readers:       Vec<Worker>,
    rebuild_stats: Option<RebuildStats>,
    stopped:       AtomicBool,
}

impl Index {
    /// Bytes of store an index with `config` needs.
    pub fn required_store_bytes(config: &IndexConfig) -> Result<u64> {
        config.validate()?;
        let geometry = config.make_geometry()?;
        let volume_index = VolumeIndex::new(&geometry, volume_index_config(config))?;
        Ok(IndexLayout::required_bytes(&geometry, volume_index.save_bytes()))
    }

    pub fn open(config: IndexConfig, store: Arc<dyn BlockStore>, mode: OpenMode) -> Result<Self> {
        Self::open_with_suspend(config, store, mode, &SuspendToken::default())
    }

    /// [`Index::open`] with a rebuild that `suspend` can interrupt.
    pub fn open_with_suspend(
        config: IndexConfig,
        store: Arc<dyn BlockStore>,
        mode: OpenMode,
        suspend: &SuspendToken,
    ) -> Result<Self> {
        config.validate()?;
        let geometry = config.make_geometry()?;
        let zone_count = config.zone_count;
        check_zone_count(&geometry, zone_count)?;
        let volume_index = VolumeIndex::new(&geometry, volume_index_config(&config))?;
        let layout = IndexLayout::new(store, &geometry, volume_index.save_bytes())?;
        let volume = Arc::new(Volume::new(&geometry, layout.volume.clone(), &VolumeConfig {
            nonce: config.nonce,
            cache_pages: config.page_cache_pages,
            cache_chapters: config.cache_chapters,
            zone_count,
        }));
        let window = Arc::new(ChapterWindow::default());
        let writer = ChapterWriter::start(volume.clone(), zone_count, window.clone())?;

        let mut zone_receivers = Vec::with_capacity(zone_count);
        let mut queues = Vec::with_capacity(zone_count);
        for zone in 0..zone_count {
            let (sender, receiver) = unbounded();
            let (priority_sender, priority_receiver) = unbounded();
            queues.push(Queue::new(zone, sender, Some(priority_sender)));
            zone_receivers.push((receiver, priority_receiver));
        }
        let (reader_sender, reader_receiver) = unbounded();
        let triage = (zone_count > 1 && geometry.is_sparse()).then(unbounded);

        let inner = Arc::new(IndexInner {
            zones: (0..zone_count)
                .map(|zone| Mutex::new(IndexZone::new(zone, &geometry, zone_count)))
                .collect(),
            zone_windows: (0..zone_count).map(|_| ChapterWindow::default()).collect(),
            geometry,
            zone_count,
            volume,
            volume_index,
            writer,
            window,
            queues,
            readers: Queue::new(0, reader_sender, None),
            triage_queue: triage
                .as_ref()
                .map(|(sender, _)| Queue::new(0, sender.clone(), None)),
            in_flight: Arc::new(InFlight::default()),
            counters: RequestCounters::default(),
            layout,
            need_to_save: AtomicBool::new(true),
            last_save: AtomicU64::new(0),
        });
        let rebuild_stats = inner.start(mode, suspend)?;

        let mut zone_workers = Vec::with_capacity(zone_count);
        for (id, (receiver, priority)) in zone_receivers.into_iter().enumerate() {
            let starter = ZoneWorkerStarter {
                id,
                inner: inner.clone(),
                receiver,
                priority,
            };
            zone_workers.push(starter.start()?);
        }
        let readers = (0..config.read_threads)
            .map(|id| {
                ReaderWorkerStarter {
                    id,
                    inner: inner.clone(),
                    receiver: reader_receiver.clone(),
                }
                .start()
            })
            .collect::<Result<Vec<_>>>()?;
        let triage = triage
            .map(|(_, receiver)| {
                TriageWorkerStarter {
                    inner: inner.clone(),
                    receiver,
                }
                .start()
            })
            .transpose()?;

        info!(
            "opened index with {zone_count} zones, chapters [{}, {})",
            inner.window.oldest(),
            inner.window.newest()
        );
        Ok(Self {
            inner,
            zone_workers,
            triage,
            readers,
            rebuild_stats,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn geometry(&self) -> &Geometry { &self.inner.geometry }

    pub fn zone_count(&self) -> usize { self.inner.zone_count }

    /// What the rebuild at open replayed, if the index was rebuilt.
    pub fn rebuild_stats(&self) -> Option<RebuildStats> { self.rebuild_stats }

    /// Queue `request`; its response arrives on the returned channel.
    pub fn submit(&self, request: Request) -> Result<oneshot::Receiver<Result<Response>>> {
        let inner = &self.inner;
        let (reply, receiver) = oneshot::channel();
        let zone = inner.volume_index.get_zone(&request.name);
        let request = Box::new(ZoneRequest::new(request, zone, reply, inner.in_flight.enter()));
        match &inner.triage_queue {
            Some(triage) => triage.submit(TriageMessage::Request(request))?,
            None => inner.queues[zone].submit(ZoneMessage::Request(request))?,
        }
        Ok(receiver)
    }

    pub async fn process(&self, request: Request) -> Result<Response> {
        let receiver = self.submit(request)?;
        match receiver.await {
            Ok(result) => result,
            Err(_) => DisconnectedSnafu.fail(),
        }
    }

    /// [`Index::process`] for callers outside an async runtime.
    pub fn process_blocking(&self, request: Request) -> Result<Response> {
        let receiver = self.submit(request)?;
        match receiver.blocking_recv() {
            Ok(result) => result,
            Err(_) => DisconnectedSnafu.fail(),
        }
    }

    /// Wait until every submitted request has completed.
    pub fn flush(&self) { self.inner.in_flight.wait_for_idle() }

    /// Persist the index so the next open can load it. Does nothing if
    /// nothing changed since the last save.
    pub fn save(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.need_to_save.load(Ordering::Acquire) {
            debug!("index unchanged since its last save");
            return Ok(());
        }
        self.flush();
        inner.writer.wait_for_idle()?;
        inner.save()
    }

    pub fn stats(&self) -> IndexStats {
        let inner = &self.inner;
        let (dense, sparse) = inner.volume_index.stats();
        let counters = &inner.counters;
        IndexStats {
            entries_indexed:     dense.record_count + sparse.record_count,
            entries_discarded:   dense.discard_count + sparse.discard_count,
            collisions:          dense.collision_count + sparse.collision_count,
            overflows:           dense.overflow_count + sparse.overflow_count + read(&counters.overflows),
            early_flushes:       dense.early_flushes + sparse.early_flushes,
            chapters_written:    inner.writer.chapters_written(),
            forced_closes:       read(&counters.forced_closes),
            oldest_chapter:      inner.window.oldest(),
            newest_chapter:      inner.window.newest(),
            requests:            read(&counters.requests),
            posts_found_open:    read(&counters.posts_found_open),
            posts_found_dense:   read(&counters.posts_found_dense),
            posts_found_sparse:  read(&counters.posts_found_sparse),
            posts_not_found:     read(&counters.posts_not_found),
            updates_found:       read(&counters.updates_found),
            updates_not_found:   read(&counters.updates_not_found),
            queries_found:       read(&counters.queries_found),
            queries_not_found:   read(&counters.queries_not_found),
            deletions_found:     read(&counters.deletions_found),
            deletions_not_found: read(&counters.deletions_not_found),
            sparse_cache:        inner.volume.sparse_cache_stats(),
        }
    }

    /// Stop every worker thread once in-flight requests have finished.
    fn stop_workers(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.flush();
        let inner = &self.inner;
        if let (Some(queue), Some(worker)) = (&inner.triage_queue, &self.triage) {
            queue.stop([TriageMessage::Stop]);
            worker.join()?;
        }
        for (queue, worker) in inner.queues.iter().zip(&self.zone_workers) {
            queue.stop([ZoneMessage::Stop]);
            worker.join()?;
        }
        inner
            .readers
            .stop(self.readers.iter().map(|_| ReadMessage::Stop));
        for reader in &self.readers {
            reader.join()?;
        }
        Ok(())
    }

    /// Finish outstanding work, save, and stop.
    pub fn close(self) -> Result<()> {
        self.stop_workers()?;
        self.inner.writer.wait_for_idle()?;
        if self.inner.need_to_save.load(Ordering::Acquire) {
            self.inner.save()?;
        }
        self.inner.writer.stop()?;
        info!("closed index");
        Ok(())
    }
}

impl Drop for Index {
    fn drop(&mut self) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        warn!("index dropped without close, its saved state stays stale");
        if let Err(e) = self.stop_workers() {
            warn!("failed to stop index workers: {e}");
        }
    }
}

fn volume_index_config(config: &IndexConfig) -> VolumeIndexConfig {
    VolumeIndexConfig {
        zone_count:  config.zone_count,
        mean_delta:  config.volume_index_mean_delta,
        sample_rate: config.effective_sample_rate(),
        nonce:       config.nonce,
    }
}

/// Every zone needs room for records in each chapter.
fn check_zone_count(geometry: &Geometry, zone_count: usize) -> Result<()> {
    ensure!(
        geometry.records_per_chapter as usize >= zone_count * 2,
        InvalidConfigSnafu {
            reason: format!(
                "{zone_count} zones cannot share chapters of {} records",
                geometry.records_per_chapter
            ),
        }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use dedupe_types::record::RecordData;

    use super::*;
    use crate::{config::GeometryConfig, storage::MemoryStore};

    fn config(zone_count: usize) -> IndexConfig {
        IndexConfig::default()
            .with_zone_count(zone_count)
            .with_geometry(GeometryConfig {
                bytes_per_page:             256,
                record_pages_per_chapter:   4,
                chapters_per_volume:        8,
                sparse_chapters_per_volume: 0,
            })
    }

    fn store(config: &IndexConfig) -> Arc<dyn BlockStore> {
        // slack for reloading with another zone count
        Arc::new(MemoryStore::new(Index::required_store_bytes(config).unwrap() + (64 << 10)))
    }

    fn name(i: u64) -> RecordName {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&i.wrapping_mul(0x9e37_79b9_7f4a_7c15).to_be_bytes());
        bytes[8..].copy_from_slice(&i.wrapping_mul(0xc2b2_ae3d_27d4_eb4f).to_be_bytes());
        RecordName::new(bytes)
    }

    #[test]
    fn post_post_delete_query() {
        let config = config(1);
        let index = Index::open(config.clone(), store(&config), OpenMode::Create).unwrap();
        let a = name(1);

        let first = index.process_blocking(Request::post(a, RecordData::from_u64(1))).unwrap();
        assert!(!first.found);
        assert_eq!(first.location, IndexRegion::Unavailable);

        let second = index.process_blocking(Request::post(a, RecordData::from_u64(2))).unwrap();
        assert!(second.found);
        assert_eq!(second.location, IndexRegion::InOpenChapter);
        assert_eq!(second.old_metadata, Some(RecordData::from_u64(1)));

        assert!(index.process_blocking(Request::delete(a)).unwrap().found);
        assert!(!index.process_blocking(Request::query(a)).unwrap().found);

        let stats = index.stats();
        assert_eq!((stats.posts_not_found, stats.posts_found_open), (1, 1));
        assert_eq!((stats.deletions_found, stats.queries_not_found), (1, 1));
        index.close().unwrap();
    }

    #[test]
    fn update_and_query_no_update() {
        let config = config(1);
        let index = Index::open(config.clone(), store(&config), OpenMode::Create).unwrap();
        let a = name(7);

        assert!(!index.process_blocking(Request::query(a)).unwrap().found);
        assert!(!index.process_blocking(Request::query_no_update(a)).unwrap().found);
        assert!(!index.process_blocking(Request::update(a, RecordData::from_u64(3))).unwrap().found);
        let updated = index.process_blocking(Request::update(a, RecordData::from_u64(4))).unwrap();
        assert_eq!(updated.old_metadata, Some(RecordData::from_u64(3)));
        let queried = index.process_blocking(Request::query_no_update(a)).unwrap();
        assert_eq!(queried.old_metadata, Some(RecordData::from_u64(4)));
        index.close().unwrap();
    }

    #[tokio::test]
    async fn records_survive_chapter_closes() {
        let config = config(1);
        let index = Index::open(config.clone(), store(&config), OpenMode::Create).unwrap();
        for i in 0..100 {
            index
                .process(Request::post(name(i), RecordData::from_u64(i)))
                .await
                .unwrap();
        }
        for i in 0..100 {
            let response = index
                .process(Request::query_no_update(name(i)))
                .await
                .unwrap();
            assert!(response.found, "record {i} lost");
            assert_eq!(response.old_metadata, Some(RecordData::from_u64(i)));
        }
        assert_eq!(index.stats().queries_found, 100);
        index.close().unwrap();
    }

    #[test]
    fn save_and_load_with_more_zones() {
        let config = config(1);
        let store = store(&config);
        let index = Index::open(config.clone(), store.clone(), OpenMode::Create).unwrap();
        for i in 0..50 {
            index.process_blocking(Request::post(name(i), RecordData::from_u64(i))).unwrap();
        }
        index.close().unwrap();

        let config = config.with_zone_count(2);
        let index = Index::open(config, store.clone(), OpenMode::NoRebuild).unwrap();
        assert!(index.rebuild_stats().is_none());
        for i in 0..50 {
            let response = index.process_blocking(Request::query_no_update(name(i))).unwrap();
            assert_eq!(response.old_metadata, Some(RecordData::from_u64(i)));
        }
        drop(index);

        // dropped without a save, so only a rebuild can open it
        let err = Index::open(self::config(2), store, OpenMode::NoRebuild).err().unwrap();
        assert!(err.is_not_saved_cleanly());
    }

    #[test]
    fn dirty_index_is_rebuilt() {
        let config = config(1);
        let store = store(&config);
        let index = Index::open(config.clone(), store.clone(), OpenMode::Create).unwrap();
        for i in 0..100 {
            index.process_blocking(Request::post(name(i), RecordData::from_u64(i))).unwrap();
        }
        drop(index);

        let index = Index::open(config, store, OpenMode::Load).unwrap();
        let stats = index.rebuild_stats().unwrap();
        assert_eq!(stats.chapters_replayed, 3);
        // the last open chapter was never written
        for i in 0..96 {
            assert!(index.process_blocking(Request::query_no_update(name(i))).unwrap().found);
        }
        assert_eq!(index.stats().newest_chapter, 3);
        index.close().unwrap();
    }

    #[test]
    fn closing_zones_meet_sparse_barriers() {
        let config = IndexConfig::default()
            .with_zone_count(2)
            .with_sparse(true)
            .with_geometry(GeometryConfig {
                bytes_per_page:             256,
                record_pages_per_chapter:   4,
                chapters_per_volume:        10,
                sparse_chapters_per_volume: 5,
            });
        let index = Arc::new(Index::open(config.clone(), store(&config), OpenMode::Create).unwrap());

        // queue everything up front so zones close chapters with barriers
        // already waiting behind them
        let (done, finished) = crossbeam_channel::bounded(1);
        let worker = {
            let index = index.clone();
            std::thread::spawn(move || {
                let mut replies = Vec::new();
                for i in 0..10000 {
                    replies.push(index.submit(Request::post(name(i), RecordData::from_u64(i))).unwrap());
                    if i >= 100 {
                        let old = i - 100;
                        replies.push(index.submit(Request::post(name(old), RecordData::from_u64(old))).unwrap());
                    }
                }
                let completed = replies
                    .into_iter()
                    .map(|reply| reply.blocking_recv())
                    .filter(|reply| matches!(reply, Ok(Ok(_))))
                    .count();
                done.send(completed).unwrap();
            })
        };
        let completed = finished
            .recv_timeout(std::time::Duration::from_secs(120))
            .expect("zones stopped making progress");
        worker.join().unwrap();
        assert_eq!(completed, 10000 + 9900);

        let stats = index.stats();
        assert_eq!(stats.requests, 10000 + 9900);
        assert!(stats.chapters_written > 100);
        assert!(stats.posts_found_sparse > 0);
        Arc::into_inner(index).unwrap().close().unwrap();
    }

    #[test]
    fn suspended_rebuild_stops() {
        let config = config(1);
        let store = store(&config);
        let index = Index::open(config.clone(), store.clone(), OpenMode::Create).unwrap();
        for i in 0..40 {
            index.process_blocking(Request::post(name(i), RecordData::from_u64(i))).unwrap();
        }
        index.close().unwrap();

        let suspend = SuspendToken::default();
        suspend.suspend();
        let err = Index::open_with_suspend(config, store, OpenMode::Rebuild, &suspend)
            .err()
            .unwrap();
        assert!(err.is_suspended());
    }
}
