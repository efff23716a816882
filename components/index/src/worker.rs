//! The threads behind an index: one per zone, an optional triage thread
//! that raises sparse cache barriers, and the volume readers that load
//! pages for requests that missed the page cache.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use crossbeam_channel::{select, Receiver, Sender};
use dedupe_types::{
    record::RecordData,
    request::{IndexRegion, Request, Response},
};
use parking_lot::{Condvar, Mutex};
use snafu::{ensure, ResultExt};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::{
    err::{BadStateSnafu, IoSnafu, Result, WorkerStoppedSnafu},
    index::IndexInner,
    zone::Outcome,
};

/// How long a closing zone waits on the chapter writer between looks for
/// sparse cache barriers in its queues.
const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Requests submitted but not yet completed, so callers can wait for the
/// index to go quiet.
#[derive(Default)]
pub(crate) struct InFlight {
    count: Mutex<u64>,
    idle:  Condvar,
}

impl InFlight {
    pub(crate) fn enter(self: &Arc<Self>) -> InFlightGuard {
        *self.count.lock() += 1;
        InFlightGuard(self.clone())
    }

    pub(crate) fn wait_for_idle(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.idle.wait(&mut count);
        }
    }
}

/// Counts one request or control message as in flight until dropped.
pub(crate) struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut count = self.0.count.lock();
        *count -= 1;
        if *count == 0 {
            self.0.idle.notify_all();
        }
    }
}

/// The page a volume reader has to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadTarget {
    /// Search a chapter through its index page.
    Chapter(u64),
    /// Search one record page of a chapter found in the sparse cache.
    RecordPage(u64, u32),
}

impl ReadTarget {
    fn virtual_chapter(&self) -> u64 {
        match self {
            ReadTarget::Chapter(chapter) | ReadTarget::RecordPage(chapter, _) => *chapter,
        }
    }
}

/// What a volume reader found, carried back to the zone with the request.
pub(crate) struct ReadHint {
    pub(crate) virtual_chapter: u64,
    pub(crate) result:          Result<Option<RecordData>>,
}

/// A request on its way through the zone queues.
pub(crate) struct ZoneRequest {
    pub(crate) request:         Request,
    pub(crate) zone:            usize,
    pub(crate) requeued:        bool,
    pub(crate) location:        IndexRegion,
    pub(crate) virtual_chapter: Option<u64>,
    pub(crate) old_metadata:    Option<RecordData>,
    pub(crate) hint:            Option<ReadHint>,
    reply:                      oneshot::Sender<Result<Response>>,
    _in_flight:                 InFlightGuard,
}

impl ZoneRequest {
    pub(crate) fn new(
        request: Request,
        zone: usize,
        reply: oneshot::Sender<Result<Response>>,
        in_flight: InFlightGuard,
    ) -> Self {
        Self {
            request,
            zone,
            requeued: false,
            location: IndexRegion::Unknown,
            virtual_chapter: None,
            old_metadata: None,
            hint: None,
            reply,
            _in_flight: in_flight,
        }
    }

    fn response(&mut self) -> Response {
        let found = matches!(
            self.location,
            IndexRegion::InOpenChapter | IndexRegion::InDense | IndexRegion::InSparse
        );
        if !found {
            self.location = IndexRegion::Unavailable;
        }
        Response {
            request_type:    self.request.request_type,
            name:            self.request.name,
            found,
            old_metadata:    if found { self.old_metadata } else { None },
            location:        self.location,
            virtual_chapter: if found { self.virtual_chapter } else { None },
        }
    }

    /// Deliver the outcome to whoever submitted the request.
    pub(crate) fn complete(mut self, inner: &IndexInner, result: Result<()>) {
        let result = result.map(|()| {
            let response = self.response();
            inner.counters.record(&response);
            response
        });
        if self.reply.send(result).is_err() {
            debug!("request for {} completed after its caller left", self.request.name);
        }
    }
}

pub(crate) enum ZoneMessage {
    Request(Box<ZoneRequest>),
    /// Bring a sparse chapter into the cache before anyone searches it.
    SparseCacheBarrier(u64, InFlightGuard),
    /// Another zone closed this chapter.
    AnnounceChapterClosed(u64, InFlightGuard),
    /// Notify a worker to stop.
    Stop,
}

pub(crate) enum TriageMessage {
    Request(Box<ZoneRequest>),
    Stop,
}

pub(crate) enum ReadMessage {
    Read(Box<ZoneRequest>, ReadTarget),
    Stop,
}

/// The sending side of one worker's queues.
pub(crate) struct Queue<T> {
    id:       usize,
    sender:   Sender<T>,
    /// Requeued requests go ahead of new ones.
    priority: Option<Sender<T>>,
    running:  Arc<AtomicBool>,
}

impl<T> Queue<T> {
    pub(crate) fn new(id: usize, sender: Sender<T>, priority: Option<Sender<T>>) -> Self {
        Self {
            id,
            sender,
            priority,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Submits a message to the worker.
    pub(crate) fn submit(&self, message: T) -> Result<()> { self.send(&self.sender, message) }

    pub(crate) fn requeue(&self, message: T) -> Result<()> {
        self.send(self.priority.as_ref().unwrap_or(&self.sender), message)
    }

    fn send(&self, sender: &Sender<T>, message: T) -> Result<()> {
        ensure!(self.is_running(), WorkerStoppedSnafu { id: self.id });
        if sender.send(message).is_err() {
            warn!(
                "Worker {} is already exited but the running flag is still true",
                self.id
            );
            // Manually set the running flag to false to avoid printing more warning logs.
            self.set_running(false);
            return WorkerStoppedSnafu { id: self.id }.fail();
        }
        Ok(())
    }

    /// Refuse further messages and send the workers their stop messages.
    pub(crate) fn stop(&self, stops: impl IntoIterator<Item = T>) {
        self.set_running(false);
        for stop in stops {
            if self.sender.send(stop).is_err() {
                warn!("Worker {} is already exited before stop", self.id);
                break;
            }
        }
    }

    /// Returns true if the worker is still running.
    fn is_running(&self) -> bool { self.running.load(Ordering::Relaxed) }

    /// Sets whether the worker is still running.
    fn set_running(&self, value: bool) { self.running.store(value, Ordering::Relaxed) }
}

/// A running worker thread.
pub(crate) struct Worker {
    name:   String,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    fn spawn(name: String, run: impl FnOnce() + Send + 'static) -> Result<Self> {
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(run)
            .context(IoSnafu {
                what: format!("spawning {name}"),
            })?;
        Ok(Self {
            name,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Wait for the worker to exit; `stop` must already have been sent.
    pub(crate) fn join(&self) -> Result<()> {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            info!("Stop worker {}", self.name);
            ensure!(
                handle.join().is_ok(),
                BadStateSnafu {
                    reason: format!("worker {} panicked", self.name),
                }
            );
        }
        Ok(())
    }
}

/// Zone worker start config.
pub(crate) struct ZoneWorkerStarter {
    pub(crate) id:       usize,
    pub(crate) inner:    Arc<IndexInner>,
    pub(crate) receiver: Receiver<ZoneMessage>,
    pub(crate) priority: Receiver<ZoneMessage>,
}

impl ZoneWorkerStarter {
    pub(crate) fn start(self) -> Result<Worker> {
        let name = format!("dedupe-zone-{}", self.id);
        let mut worker_loop = ZoneLoop {
            id:       self.id,
            inner:    self.inner,
            receiver: self.receiver,
            priority: self.priority,
            deferred: VecDeque::new(),
        };
        Worker::spawn(name, move || worker_loop.run())
    }
}

struct ZoneLoop {
    id:       usize,
    inner:    Arc<IndexInner>,
    receiver: Receiver<ZoneMessage>,
    priority: Receiver<ZoneMessage>,
    /// Messages taken off the queues while closing a chapter, in order.
    deferred: VecDeque<ZoneMessage>,
}

impl ZoneLoop {
    fn next(&mut self) -> Option<ZoneMessage> {
        if let Some(message) = self.deferred.pop_front() {
            return Some(message);
        }
        if let Ok(message) = self.priority.try_recv() {
            return Some(message);
        }
        select! {
            recv(self.priority) -> message => message.ok(),
            recv(self.receiver) -> message => message.ok(),
        }
    }

    fn run(&mut self) {
        info!("Start zone worker {}", self.id);
        while let Some(message) = self.next() {
            match message {
                ZoneMessage::Request(request) => self.handle_request(request),
                ZoneMessage::SparseCacheBarrier(chapter, _in_flight) => self.update_sparse_cache(chapter),
                ZoneMessage::AnnounceChapterClosed(chapter, _in_flight) => {
                    if let Err(e) = self.handle_chapter_closed(chapter) {
                        warn!("zone {} failed to close chapter {chapter}: {e}", self.id);
                    }
                }
                ZoneMessage::Stop => break,
            }
        }
        info!("Exit zone worker {}", self.id);
    }

    fn handle_request(&mut self, mut request: Box<ZoneRequest>) {
        let (outcome, full) = {
            let mut zone = self.inner.zones[self.id].lock();
            self.inner.mark_dirty();
            let outcome = zone.dispatch(&self.inner, &mut request);
            (outcome, zone.is_open_chapter_full())
        };
        let outcome = match outcome {
            Ok(outcome) if full => self.close_open_chapter().map(|()| outcome),
            outcome => outcome,
        };
        match outcome {
            Ok(Outcome::Complete) => request.complete(&self.inner, Ok(())),
            Ok(Outcome::Read(target)) => {
                if let Err(e) = self.inner.readers.submit(ReadMessage::Read(request, target)) {
                    warn!("zone {} cannot reach the volume readers: {e}", self.id);
                }
            }
            Err(e) => request.complete(&self.inner, Err(e)),
        }
    }

    fn update_sparse_cache(&self, chapter: u64) {
        let zone = self.inner.zones[self.id].lock();
        if let Err(e) = zone.update_sparse_cache(&self.inner, chapter) {
            warn!("zone {} failed to cache sparse chapter {chapter}: {e}", self.id);
        }
    }

    /// Another zone closed `chapter`; catch up if still on it.
    fn handle_chapter_closed(&mut self, chapter: u64) -> Result<()> {
        if self.inner.zones[self.id].lock().newest != chapter {
            return Ok(());
        }
        self.inner.counters.forced_close();
        self.close_open_chapter()
    }

    /// Close this zone's share of the open chapter. The previous chapter
    /// may still need a peer that is parked at a sparse cache barrier, so
    /// while waiting for it the zone keeps meeting barriers and sets every
    /// other message aside.
    fn close_open_chapter(&mut self) -> Result<()> {
        let newest = self.inner.zones[self.id].lock().newest;
        while !self
            .inner
            .writer
            .previous_chapter_written(newest, CLOSE_POLL_INTERVAL)
        {
            self.meet_pending_barriers();
        }
        self.inner.zones[self.id].lock().open_next_chapter(&self.inner)
    }

    fn meet_pending_barriers(&mut self) {
        let pending: Vec<ZoneMessage> = self
            .priority
            .try_iter()
            .chain(self.receiver.try_iter())
            .collect();
        for message in pending {
            match message {
                ZoneMessage::SparseCacheBarrier(chapter, _in_flight) => {
                    debug!("zone {} meets the barrier for chapter {chapter} while closing", self.id);
                    self.update_sparse_cache(chapter);
                }
                message => self.deferred.push_back(message),
            }
        }
    }
}

/// Triage worker start config.
pub(crate) struct TriageWorkerStarter {
    pub(crate) inner:    Arc<IndexInner>,
    pub(crate) receiver: Receiver<TriageMessage>,
}

impl TriageWorkerStarter {
    pub(crate) fn start(self) -> Result<Worker> {
        let inner = self.inner;
        let receiver = self.receiver;
        Worker::spawn("dedupe-triage".to_string(), move || {
            info!("Start triage worker");
            while let Ok(TriageMessage::Request(request)) = receiver.recv() {
                inner.triage(*request);
            }
            info!("Exit triage worker");
        })
    }
}

/// Volume reader start config.
pub(crate) struct ReaderWorkerStarter {
    pub(crate) id:       usize,
    pub(crate) inner:    Arc<IndexInner>,
    pub(crate) receiver: Receiver<ReadMessage>,
}

impl ReaderWorkerStarter {
    pub(crate) fn start(self) -> Result<Worker> {
        let (id, inner, receiver) = (self.id, self.inner, self.receiver);
        Worker::spawn(format!("dedupe-reader-{id}"), move || {
            info!("Start volume reader {id}");
            while let Ok(ReadMessage::Read(mut request, target)) = receiver.recv() {
                let name = request.request.name;
                let result = match target {
                    ReadTarget::Chapter(chapter) => inner.volume.search_page_cache(&name, chapter),
                    ReadTarget::RecordPage(chapter, page) => inner.volume.search_record_page(&name, chapter, page),
                };
                request.hint = Some(ReadHint {
                    virtual_chapter: target.virtual_chapter(),
                    result,
                });
                request.requeued = true;
                let zone = request.zone;
                if let Err(e) = inner.queues[zone].requeue(ZoneMessage::Request(request)) {
                    warn!("volume reader {id} cannot requeue to zone {zone}: {e}");
                }
            }
            info!("Exit volume reader {id}");
        })
    }
}
