//! The single thread that turns closed open chapters into on-disk chapters.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use parking_lot::{Condvar, Mutex};
use snafu::ResultExt;
use tracing::{debug, error, info};

use crate::{
    chapter_index::OpenChapterIndex,
    err::{BadStateSnafu, ChapterWriteSnafu, Error, IoSnafu, Result},
    geometry::Geometry,
    open_chapter::{collate_records, OpenChapterZone},
    volume::Volume,
};

/// The live chapter window of the whole index. Only the chapter writer
/// moves it once the index is running.
#[derive(Debug, Default)]
pub struct ChapterWindow {
    newest: AtomicU64,
    oldest: AtomicU64,
}

impl ChapterWindow {
    pub fn newest(&self) -> u64 { self.newest.load(Ordering::Acquire) }

    pub fn oldest(&self) -> u64 { self.oldest.load(Ordering::Acquire) }

    pub fn set(&self, oldest: u64, newest: u64) {
        self.oldest.store(oldest, Ordering::Release);
        self.newest.store(newest, Ordering::Release);
    }

    /// Open the next chapter, expiring whatever it displaces.
    fn advance(&self, geometry: &Geometry) {
        let newest = self.newest.fetch_add(1, Ordering::AcqRel) + 1;
        self.oldest
            .fetch_add(geometry.chapters_to_expire(newest), Ordering::AcqRel);
    }
}

struct WriterState {
    /// The chapter each zone handed over, for the chapter being closed.
    chapters:         Vec<Option<Arc<OpenChapterZone>>>,
    zones_to_write:   usize,
    chapter_number:   u64,
    chapters_written: u64,
    /// The first failed write; every later wait reports it.
    failure:          Option<(u64, Arc<Error>)>,
    stop:             bool,
}

impl WriterState {
    fn result(&self) -> Result<()> {
        match &self.failure {
            Some((chapter, e)) => Err(e.clone()).context(ChapterWriteSnafu { chapter: *chapter }),
            None => Ok(()),
        }
    }
}

struct Shared {
    geometry:   Geometry,
    zone_count: usize,
    volume:     Arc<Volume>,
    window:     Arc<ChapterWindow>,
    state:      Mutex<WriterState>,
    cond:       Condvar,
}

pub struct ChapterWriter {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ChapterWriter {
    pub fn start(volume: Arc<Volume>, zone_count: usize, window: Arc<ChapterWindow>) -> Result<Self> {
        let geometry = volume.geometry().clone();
        let shared = Arc::new(Shared {
            geometry,
            zone_count,
            volume,
            window,
            state: Mutex::new(WriterState {
                chapters:         vec![None; zone_count],
                zones_to_write:   0,
                chapter_number:   0,
                chapters_written: 0,
                failure:          None,
                stop:             false,
            }),
            cond: Condvar::new(),
        });

        let writer = shared.clone();
        let handle = std::thread::Builder::new()
            .name("dedupe-chapter-writer".to_string())
            .spawn(move || writer.run())
            .context(IoSnafu {
                what: "spawning the chapter writer",
            })?;
        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Hand zone `zone`'s closed chapter to the writer. Returns how many
    /// zones have now closed the chapter; the last one wakes the writer.
    pub fn start_closing_chapter(&self, zone: usize, chapter_number: u64, chapter: Arc<OpenChapterZone>) -> usize {
        let finished = {
            let mut state = self.shared.state.lock();
            state.zones_to_write += 1;
            state.chapters[zone] = Some(chapter);
            state.chapter_number = chapter_number;
            state.zones_to_write
        };
        if finished == self.shared.zone_count {
            self.shared.cond.notify_all();
        }
        finished
    }

    /// Wait until every chapter before `current` is on disk.
    pub fn finish_previous_chapter(&self, current: u64) -> Result<()> {
        let mut state = self.shared.state.lock();
        while self.shared.window.newest() < current {
            self.shared.cond.wait(&mut state);
        }
        let result = state.result();
        if let Err(e) = &result {
            error!("writing of the previous open chapter failed: {e}");
        }
        result
    }

    /// Wait up to `timeout` for every chapter before `current` to be on
    /// disk. Returns whether they are.
    pub fn previous_chapter_written(&self, current: u64, timeout: Duration) -> bool {
        let mut state = self.shared.state.lock();
        if self.shared.window.newest() < current {
            self.shared.cond.wait_for(&mut state, timeout);
        }
        self.shared.window.newest() >= current
    }

    /// Wait until no chapter is being collected or written.
    pub fn wait_for_idle(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        while state.zones_to_write > 0 {
            self.shared.cond.wait(&mut state);
        }
        state.result()
    }

    pub fn chapters_written(&self) -> u64 { self.shared.state.lock().chapters_written }

    /// Stop the writer once any fully closed chapter is written.
    pub fn stop(&self) -> Result<()> {
        let Some(handle) = self.handle.lock().take() else {
            return Ok(());
        };
        info!("stopping the chapter writer");
        {
            let mut state = self.shared.state.lock();
            state.stop = true;
        }
        self.shared.cond.notify_all();
        if handle.join().is_err() {
            return BadStateSnafu {
                reason: "chapter writer panicked",
            }
            .fail();
        }
        self.shared.state.lock().result()
    }
}

impl Drop for ChapterWriter {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("chapter writer stopped with an error: {e}");
        }
    }
}

impl Shared {
    fn run(&self) {
        info!("start chapter writer for {} zones", self.zone_count);
        let mut chapter_index = OpenChapterIndex::new(&self.geometry, self.volume.nonce());
        loop {
            let (chapters, chapter_number) = {
                let mut state = self.state.lock();
                while state.zones_to_write < self.zone_count && !state.stop {
                    self.cond.wait(&mut state);
                }
                if state.zones_to_write < self.zone_count {
                    break;
                }
                let chapters: Option<Vec<_>> = state.chapters.iter().cloned().collect();
                (chapters, state.chapter_number)
            };

            let result = match chapters {
                Some(chapters) => self.write(&chapters, &mut chapter_index, chapter_number),
                None => BadStateSnafu {
                    reason: "a zone closed no chapter",
                }
                .fail(),
            };

            let mut state = self.state.lock();
            self.window.advance(&self.geometry);
            state.chapters.iter_mut().for_each(|c| *c = None);
            match result {
                Ok(()) => state.chapters_written += 1,
                Err(e) => {
                    error!("failed to write chapter {chapter_number}: {e}");
                    state.failure.get_or_insert((chapter_number, Arc::new(e)));
                }
            }
            state.zones_to_write = 0;
            self.cond.notify_all();
        }
        info!("chapter writer exits");
    }

    fn write(
        &self,
        chapters: &[Arc<OpenChapterZone>],
        chapter_index: &mut OpenChapterIndex,
        chapter_number: u64,
    ) -> Result<()> {
        chapter_index.empty(chapter_number);
        let zones: Vec<&OpenChapterZone> = chapters.iter().map(Arc::as_ref).collect();
        let (records, _) = collate_records(&zones, chapter_index, &self.geometry)?;
        self.volume.write_chapter(chapter_index, &records)?;
        debug!(
            "closed chapter {chapter_number} with {} indexed records",
            chapter_index.record_count()
        );
        Ok(())
    }
}
