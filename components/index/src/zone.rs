//! One zone of the index: its slice of the open chapter and the request
//! handling that runs on the zone's thread.

use std::{mem, sync::Arc};

use dedupe_types::{
    record::{RecordData, RecordName},
    request::{IndexRegion, RequestType},
};
use tracing::debug;

use crate::{
    err::Result,
    geometry::Geometry,
    index::IndexInner,
    open_chapter::OpenChapterZone,
    volume::CacheSearch,
    worker::{ReadTarget, ZoneRequest},
};

/// How far a request got on the zone thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Complete,
    /// The request needs a page from disk; a volume reader takes it from
    /// here and requeues it.
    Read(ReadTarget),
}

enum Lookup {
    Found(RecordData),
    NotFound,
    Read(ReadTarget),
}

pub(crate) struct IndexZone {
    pub(crate) id:     usize,
    pub(crate) oldest: u64,
    pub(crate) newest: u64,
    pub(crate) open:   OpenChapterZone,
    /// The chapter last handed to the chapter writer.
    writing:           Option<Arc<OpenChapterZone>>,
}

impl IndexZone {
    pub(crate) fn new(id: usize, geometry: &Geometry, zone_count: usize) -> Self {
        Self {
            id,
            oldest: 0,
            newest: 0,
            open: OpenChapterZone::new(geometry, zone_count),
            writing: None,
        }
    }

    /// Start over with an empty open chapter at `newest`.
    pub(crate) fn reset(&mut self, oldest: u64, newest: u64) {
        self.oldest = oldest;
        self.newest = newest;
        self.open.reset();
        self.writing = None;
    }

    fn is_chapter_sparse(&self, geometry: &Geometry, virtual_chapter: u64) -> bool {
        geometry.is_chapter_sparse(self.oldest, self.newest, virtual_chapter)
    }

    fn publish_window(&self, inner: &IndexInner) { inner.zone_windows[self.id].set(self.oldest, self.newest) }

    fn set_chapter_location(&self, inner: &IndexInner, request: &mut ZoneRequest, virtual_chapter: u64) {
        request.virtual_chapter = Some(virtual_chapter);
        request.location = if virtual_chapter == self.newest {
            IndexRegion::InOpenChapter
        } else if self.is_chapter_sparse(&inner.geometry, virtual_chapter) {
            IndexRegion::InSparse
        } else {
            IndexRegion::InDense
        };
    }

    /// Take in what a volume reader found. A hint for a chapter that left
    /// the window while the read was queued is dropped and the request
    /// resolves from scratch.
    fn apply_hint(&self, request: &mut ZoneRequest) -> Result<()> {
        let Some(hint) = request.hint.take() else {
            return Ok(());
        };
        if hint.virtual_chapter < self.oldest || hint.virtual_chapter > self.newest {
            debug!(
                "zone {} drops a read of chapter {} outside [{}, {}]",
                self.id, hint.virtual_chapter, self.oldest, self.newest
            );
            request.location = IndexRegion::Unknown;
            return Ok(());
        }
        request.virtual_chapter = Some(hint.virtual_chapter);
        match hint.result? {
            Some(data) => {
                request.location = IndexRegion::RecordPageLookup;
                request.old_metadata = Some(data);
            }
            None => request.location = IndexRegion::Unavailable,
        }
        Ok(())
    }

    /// Handle one request, unless it has to wait for a volume read.
    pub(crate) fn dispatch(&mut self, inner: &IndexInner, request: &mut ZoneRequest) -> Result<Outcome> {
        self.apply_hint(request)?;
        if !request.requeued && inner.zone_count == 1 && inner.geometry.is_sparse() {
            if let Some(chapter) = self.triage(inner, &request.request.name) {
                self.update_sparse_cache(inner, chapter)?;
            }
        }
        match request.request.request_type {
            RequestType::Delete => self.remove(inner, request),
            _ => self.search(inner, request),
        }
    }

    /// The sparse chapter a hook was last seen in, if any.
    fn triage(&self, inner: &IndexInner, name: &RecordName) -> Option<u64> {
        let chapter = inner.volume_index.lookup_name(name)?;
        self.is_chapter_sparse(&inner.geometry, chapter).then_some(chapter)
    }

    pub(crate) fn update_sparse_cache(&self, inner: &IndexInner, virtual_chapter: u64) -> Result<()> {
        inner
            .volume
            .update_sparse_cache(self.id, self.oldest, inner.window.oldest(), virtual_chapter)
    }

    fn search_sparse_cache(
        &self,
        inner: &IndexInner,
        request: &mut ZoneRequest,
        virtual_chapter: Option<u64>,
    ) -> Result<Lookup> {
        let name = request.request.name;
        let Some((chapter, record_page)) =
            inner
                .volume
                .search_sparse_cache(self.id, self.oldest, &name, virtual_chapter)?
        else {
            return Ok(Lookup::NotFound);
        };
        request.virtual_chapter = Some(chapter);
        Ok(
            match inner
                .volume
                .search_cached_record_page(&name, chapter, record_page)
            {
                CacheSearch::Found(data) => Lookup::Found(data),
                CacheSearch::NotFound => Lookup::NotFound,
                CacheSearch::Miss => Lookup::Read(ReadTarget::RecordPage(chapter, record_page)),
            },
        )
    }

    fn get_record(&self, inner: &IndexInner, request: &mut ZoneRequest, virtual_chapter: u64) -> Result<Lookup> {
        match request.location {
            IndexRegion::RecordPageLookup => {
                return Ok(request
                    .old_metadata
                    .map_or(Lookup::NotFound, Lookup::Found))
            }
            IndexRegion::Unavailable => return Ok(Lookup::NotFound),
            _ => {}
        }

        let name = request.request.name;
        if virtual_chapter == self.newest {
            return Ok(self.open.search(&name).map_or(Lookup::NotFound, Lookup::Found));
        }
        if let Some(writing) = &self.writing {
            if self.newest > 0 && virtual_chapter == self.newest - 1 && writing.size() > 0 {
                return Ok(writing.search(&name).map_or(Lookup::NotFound, Lookup::Found));
            }
        }
        if virtual_chapter < self.oldest || virtual_chapter > self.newest {
            return Ok(Lookup::NotFound);
        }

        if self.is_chapter_sparse(&inner.geometry, virtual_chapter)
            && inner.volume.sparse_cache_contains(virtual_chapter, self.id)
        {
            return self.search_sparse_cache(inner, request, Some(virtual_chapter));
        }
        // an uncached sparse chapter still has its index pages on the volume
        Ok(match inner.volume.search_cached(&name, virtual_chapter)? {
            CacheSearch::Found(data) => Lookup::Found(data),
            CacheSearch::NotFound => Lookup::NotFound,
            CacheSearch::Miss => Lookup::Read(ReadTarget::Chapter(virtual_chapter)),
        })
    }

    fn search(&mut self, inner: &IndexInner, request: &mut ZoneRequest) -> Result<Outcome> {
        let name = request.request.name;
        let request_type = request.request.request_type;
        let mut record = inner.volume_index.get_record(&name)?;

        let mut found = false;
        if record.is_found {
            if request.requeued && request.virtual_chapter != Some(record.virtual_chapter) {
                request.location = IndexRegion::Unknown;
            }
            request.virtual_chapter = Some(record.virtual_chapter);
            match self.get_record(inner, request, record.virtual_chapter)? {
                Lookup::Found(data) => {
                    found = true;
                    request.old_metadata = Some(data);
                }
                Lookup::NotFound => {}
                Lookup::Read(target) => return Ok(Outcome::Read(target)),
            }
        }
        if found {
            self.set_chapter_location(inner, request, record.virtual_chapter);
        }

        // A collision entry whose record is gone overflowed some chapter
        // index; the name is known but its metadata is not.
        let overflow_record = record.is_found && record.is_collision && !found;
        let chapter = self.newest;
        if found || overflow_record {
            if request_type == RequestType::QueryNoUpdate || (request_type == RequestType::Query && overflow_record) {
                return Ok(Outcome::Complete);
            }
            if record.virtual_chapter != chapter {
                inner.volume_index.set_record_chapter(&mut record, chapter)?;
            } else if request_type != RequestType::Update {
                return Ok(Outcome::Complete);
            }
        } else {
            match request.location {
                IndexRegion::RecordPageLookup => found = true,
                IndexRegion::Unavailable => {}
                _ if inner.geometry.is_sparse() && !inner.volume_index.is_sample(&name) => {
                    match self.search_sparse_cache(inner, request, None)? {
                        Lookup::Found(data) => {
                            found = true;
                            request.old_metadata = Some(data);
                        }
                        Lookup::NotFound => {}
                        Lookup::Read(target) => return Ok(Outcome::Read(target)),
                    }
                }
                _ => {}
            }
            if found {
                request.location = IndexRegion::InSparse;
            }

            if request_type == RequestType::QueryNoUpdate || (request_type == RequestType::Query && !found) {
                return Ok(Outcome::Complete);
            }
            match inner.volume_index.put_record(&mut record, chapter) {
                // still goes in the open chapter, just unindexed
                Err(e) if e.is_overflow() => inner.counters.overflow(),
                result => result?,
            }
        }

        let metadata = match request.old_metadata {
            Some(old) if found && request_type != RequestType::Update => old,
            _ => request.request.new_metadata,
        };
        self.put_record(&name, &metadata);
        Ok(Outcome::Complete)
    }

    fn remove(&mut self, inner: &IndexInner, request: &mut ZoneRequest) -> Result<Outcome> {
        let name = request.request.name;
        let mut record = inner.volume_index.get_record(&name)?;
        if !record.is_found {
            return Ok(Outcome::Complete);
        }

        if !record.is_collision {
            // a plain entry only hints at the name; confirm it in the chapter
            if request.requeued && request.virtual_chapter != Some(record.virtual_chapter) {
                request.location = IndexRegion::Unknown;
            }
            request.virtual_chapter = Some(record.virtual_chapter);
            match self.get_record(inner, request, record.virtual_chapter)? {
                Lookup::Found(data) => request.old_metadata = Some(data),
                Lookup::NotFound => return Ok(Outcome::Complete),
                Lookup::Read(target) => return Ok(Outcome::Read(target)),
            }
        }

        self.set_chapter_location(inner, request, record.virtual_chapter);
        inner.volume_index.remove_record(&mut record)?;
        if request.location == IndexRegion::InOpenChapter {
            self.open.remove(&name);
        }
        Ok(Outcome::Complete)
    }

    /// A put that fills the open chapter leaves it for the zone thread to
    /// close before the next request.
    fn put_record(&mut self, name: &RecordName, metadata: &RecordData) {
        if self.open.put(name, metadata) == 0 {
            debug!("zone {} filled chapter {}", self.id, self.newest);
        }
    }

    pub(crate) fn is_open_chapter_full(&self) -> bool { self.open.is_full() }

    /// Close this zone's share of the open chapter and open the next one.
    /// The chapter before it must already be on its way to the volume.
    pub(crate) fn open_next_chapter(&mut self, inner: &IndexInner) -> Result<()> {
        debug!(
            "closing chapter {} of zone {} after {} entries ({} short)",
            self.newest,
            self.id,
            self.open.size(),
            self.open.capacity() - self.open.size()
        );
        inner.writer.finish_previous_chapter(self.newest)?;

        let closed = self.newest;
        self.newest += 1;
        inner.volume_index.set_zone_open_chapter(self.id, self.newest);

        let mut next = self
            .writing
            .take()
            .and_then(|writing| Arc::try_unwrap(writing).ok())
            .unwrap_or_else(|| OpenChapterZone::new(&inner.geometry, inner.zone_count));
        next.reset();
        let writing = Arc::new(mem::replace(&mut self.open, next));
        self.writing = Some(writing.clone());

        let finished = inner.writer.start_closing_chapter(self.id, closed, writing);
        if finished == 1 && inner.zone_count > 1 {
            inner.announce_chapter_closed(self.id, closed);
        }

        let expiring = self.oldest;
        let expired = inner.geometry.chapters_to_expire(self.newest);
        self.oldest += expired;
        self.publish_window(inner);

        if finished == inner.zone_count {
            for chapter in expiring..expiring + expired {
                inner.volume.forget_chapter(chapter);
            }
        }
        Ok(())
    }
}
