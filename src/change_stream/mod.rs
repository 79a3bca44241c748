//! Contains the functionality for change streams.
//!
//! A [`ChangeStream`] delivers the ongoing changes of its watched
//! collection, database, or whole deployment as an ordered sequence of
//! [`ChangeStreamEvent`]s.
//!
//! Change streams are resumable. Transient failures such as network errors
//! and primary stepdowns are classified, absorbed, and recovered from by
//! rebuilding the underlying cursor at the most recently cached resume
//! token. The consumer observes an uninterrupted sequence of events; only
//! terminal failures surface.
//!
//! A stream is consumed in exactly one of two ways, fixed by the first call:
//! pull-style with [`ChangeStream::next`] / [`ChangeStream::try_next`] /
//! [`ChangeStream::has_next`], or push-style through the
//! [`Stream`](futures_core::Stream) returned by [`ChangeStream::stream`].
//! Mixing the two fails with [`ErrorKind::ModeConflict`].

pub(crate) mod cursor;
pub mod event;
pub(crate) mod options;

use std::{
    fmt,
    future::poll_fn,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use bson::Document;
use derive_where::derive_where;
use futures_core::Stream;
use tracing::{debug, warn};

use crate::{
    change_stream::{
        cursor::ChangeStreamCursor,
        event::{ChangeStreamEvent, ResumeToken},
        options::ChangeStreamOptions,
    },
    error::{Error, ErrorKind, Result},
    event::{BatchInfo, EventHandler, StreamEvent},
    namespace::Namespace,
    operation::AggregateTarget,
    sdam::{wait_for_connected, Topology},
    BoxFuture,
};

/// How often the resume wait loop polls the topology for connectivity.
const RESUME_HEARTBEAT: Duration = Duration::from_millis(500);

/// How long one resume attempt may wait for the topology before giving up.
const DEFAULT_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// What a watched change stream covers.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum ChangeStreamTarget {
    /// Changes to one collection.
    Collection(Namespace),

    /// Changes to every collection of one database.
    Database(String),

    /// Changes across the whole deployment.
    Cluster,
}

impl ChangeStreamTarget {
    pub(crate) fn aggregate_target(&self) -> AggregateTarget {
        match self {
            Self::Collection(ns) => AggregateTarget::Collection(ns.clone()),
            Self::Database(db) => AggregateTarget::Database(db.clone()),
            Self::Cluster => AggregateTarget::Database("admin".to_string()),
        }
    }

    pub(crate) fn namespace(&self) -> Namespace {
        match self {
            Self::Collection(ns) => ns.clone(),
            Self::Database(db) => Namespace::new(db.clone(), "$cmd.aggregate"),
            Self::Cluster => Namespace::new("admin", "$cmd.aggregate"),
        }
    }
}

/// The consumption mode a stream is locked into after its first use.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum IterationMode {
    Unset,
    Iterator,
    Emitter,
}

impl fmt::Display for IterationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unset => "unset",
            Self::Iterator => "iterator",
            Self::Emitter => "emitter",
        };
        f.write_str(name)
    }
}

/// What one engine step produced.
enum Advance {
    /// A change event was consumed and is ready for delivery.
    Event(ChangeStreamEvent),

    /// A change is buffered but was deliberately not consumed (peeking).
    Buffered,

    /// A getMore round trip completed without data.
    Empty,

    /// The server ended the stream.
    Ended,
}

/// A resumable stream of change events.
///
/// Obtained from [`ChangeStream::new`] with a target scope; nothing is sent
/// to the server until the stream is first consumed.
#[derive_where(Debug)]
pub struct ChangeStream {
    #[derive_where(skip)]
    topology: Arc<dyn Topology>,
    target: ChangeStreamTarget,
    pipeline: Vec<Document>,
    options: Option<ChangeStreamOptions>,

    /// The owned cursor. Absent only while a resume is in flight or after
    /// the stream closed.
    cursor: Option<ChangeStreamCursor>,

    /// The in-flight cursor reconstruction, when a resume is underway.
    /// Polled to completion before any further cursor progress; at most one
    /// exists at a time, and every concluded resume leaves this slot empty.
    #[derive_where(skip)]
    pending_resume: Option<BoxFuture<'static, Result<ChangeStreamCursor>>>,

    mode: IterationMode,
    closed: bool,
    close_emitted: bool,
    init_emitted: bool,

    /// Batches already reported through lifecycle events.
    batches_seen: u64,

    /// The token most recently reported via `ResumeTokenChanged`; also the
    /// fallback for [`ChangeStream::resume_token`] while mid-resume.
    last_token: Option<ResumeToken>,

    events: Option<EventHandler<StreamEvent>>,
}

impl ChangeStream {
    /// Open a change stream over the given target.
    ///
    /// The `pipeline` stages are appended after the `$changeStream` stage.
    /// The initial aggregation is issued lazily, on first consumption.
    pub fn new(
        topology: Arc<dyn Topology>,
        target: ChangeStreamTarget,
        pipeline: Vec<Document>,
        options: Option<ChangeStreamOptions>,
    ) -> Result<Self> {
        if let Some(options) = options.as_ref() {
            let anchors = [
                options.resume_after.is_some(),
                options.start_after.is_some(),
                options.start_at_operation_time.is_some(),
            ];
            if anchors.iter().filter(|set| **set).count() > 1 {
                return Err(Error::invalid_argument(
                    "resumeAfter, startAfter, and startAtOperationTime are mutually exclusive",
                ));
            }
        }

        let cursor =
            ChangeStreamCursor::new(topology.clone(), &target, &pipeline, options.clone())?;
        Ok(Self {
            topology,
            target,
            pipeline,
            options,
            cursor: Some(cursor),
            pending_resume: None,
            mode: IterationMode::Unset,
            closed: false,
            close_emitted: false,
            init_emitted: false,
            batches_seen: 0,
            last_token: None,
            events: None,
        })
    }

    /// Register an observer for lifecycle events. Does not affect the
    /// stream's consumption mode.
    pub fn on_event(&mut self, handler: impl Into<EventHandler<StreamEvent>>) {
        self.events = Some(handler.into());
    }

    /// The cached token that resumes the stream just past the most recently
    /// delivered event.
    pub fn resume_token(&self) -> Option<ResumeToken> {
        self.cursor
            .as_ref()
            .and_then(|c| c.resume_token().cloned())
            .or_else(|| self.last_token.clone())
    }

    /// Whether the stream or its cursor has closed.
    pub fn is_closed(&self) -> bool {
        self.closed
            || self
                .cursor
                .as_ref()
                .map_or(false, ChangeStreamCursor::is_closed)
    }

    /// Wait for and return the next change event.
    ///
    /// Returns `Ok(None)` when the server ends the stream (for example after
    /// an invalidate). Locks the stream into iterator mode.
    pub async fn next(&mut self) -> Result<Option<ChangeStreamEvent>> {
        self.set_mode(IterationMode::Iterator, "next")?;
        loop {
            match poll_fn(|cx| self.poll_advance(cx, true, true)).await? {
                Advance::Event(event) => return Ok(Some(event)),
                Advance::Buffered | Advance::Empty => continue,
                Advance::Ended => return Ok(None),
            }
        }
    }

    /// Return the next change event if one arrives in the next round trip.
    ///
    /// Makes at most one request: an empty batch yields `Ok(None)` rather
    /// than another getMore. Use this when persisting resume tokens, so the
    /// most recent post-batch token is observed promptly. Locks the stream
    /// into iterator mode.
    pub async fn try_next(&mut self) -> Result<Option<ChangeStreamEvent>> {
        self.set_mode(IterationMode::Iterator, "try_next")?;
        match poll_fn(|cx| self.poll_advance(cx, false, true)).await? {
            Advance::Event(event) => Ok(Some(event)),
            Advance::Buffered | Advance::Empty | Advance::Ended => Ok(None),
        }
    }

    /// Wait until a change event is available, leaving it buffered.
    ///
    /// Returns `false` once the server has ended the stream. Locks the
    /// stream into iterator mode.
    pub async fn has_next(&mut self) -> Result<bool> {
        self.set_mode(IterationMode::Iterator, "has_next")?;
        loop {
            match poll_fn(|cx| self.poll_advance(cx, true, false)).await? {
                Advance::Event(_) | Advance::Buffered => return Ok(true),
                Advance::Empty => continue,
                Advance::Ended => return Ok(false),
            }
        }
    }

    /// Consume the stream push-style.
    ///
    /// Locks the stream into emitter mode: any later pull-style call fails
    /// with [`ErrorKind::ModeConflict`]. The returned stream yields every
    /// event as it arrives and ends when the stream closes; a terminal error
    /// is yielded as its final item.
    pub fn stream(&mut self) -> Result<ChangeStreamEvents<'_>> {
        self.set_mode(IterationMode::Emitter, "stream")?;
        Ok(ChangeStreamEvents {
            stream: self,
            terminated: false,
        })
    }

    /// Close the stream and its cursor.
    ///
    /// Idempotent, and safe to call at any point: a concurrent resume is
    /// abandoned and later consumption fails with
    /// [`ErrorKind::ChangeStreamClosed`].
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pending_resume = None;
        if let Some(mut cursor) = self.cursor.take() {
            cursor.close().await;
        }
        self.emit_close_once();
    }

    // ===== engine core =====

    fn set_mode(&mut self, requested: IterationMode, operation: &str) -> Result<()> {
        if self.mode == IterationMode::Unset {
            self.mode = requested;
            return Ok(());
        }
        if self.mode == requested {
            return Ok(());
        }
        Err(ErrorKind::ModeConflict {
            message: format!(
                "cannot call {} on a change stream already consumed in {} mode",
                operation, self.mode
            ),
        }
        .into())
    }

    /// One engine step: finish any in-flight resume, advance the cursor,
    /// classify failures, and apply the delivery bookkeeping.
    ///
    /// The resumable-error handling is a loop rather than recursion so a
    /// burst of consecutive resumable failures cannot grow the stack.
    fn poll_advance(
        &mut self,
        cx: &mut Context<'_>,
        blocking: bool,
        consume: bool,
    ) -> Poll<Result<Advance>> {
        loop {
            if self.closed {
                return Poll::Ready(Err(ErrorKind::ChangeStreamClosed.into()));
            }

            if let Some(pending) = self.pending_resume.as_mut() {
                match pending.as_mut().poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok(cursor)) => {
                        self.pending_resume = None;
                        self.batches_seen = 0;
                        self.cursor = Some(cursor);
                        debug!("change stream resumed");
                        continue;
                    }
                    Poll::Ready(Err(e)) => {
                        self.pending_resume = None;
                        warn!(error = %e, "change stream resume failed");
                        self.terminate(&e);
                        return Poll::Ready(Err(e));
                    }
                }
            }

            let cursor = match self.cursor.as_mut() {
                Some(cursor) => cursor,
                None => {
                    let e = Error::internal("change stream lost its cursor");
                    self.terminate(&e);
                    return Poll::Ready(Err(e));
                }
            };

            let poll = cursor.poll_fill(cx, blocking);
            // Batch integration can happen on any poll, including pending
            // ones; lifecycle observers hear about it immediately.
            self.emit_batch_events();

            match poll {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => {
                    if e.is_resumable() && self.cursor.is_some() {
                        debug!(error = %e, "resumable change stream error, rebuilding cursor");
                        self.start_resume();
                        continue;
                    }
                    self.terminate(&e);
                    return Poll::Ready(Err(e));
                }
                Poll::Ready(Ok(crate::cursor::FillOutcome::Available)) => {
                    if !consume {
                        return Poll::Ready(Ok(Advance::Buffered));
                    }
                    return self.deliver_next();
                }
                Poll::Ready(Ok(crate::cursor::FillOutcome::Empty)) => {
                    return Poll::Ready(Ok(Advance::Empty));
                }
                Poll::Ready(Ok(crate::cursor::FillOutcome::Exhausted)) => {
                    self.finish_end();
                    return Poll::Ready(Ok(Advance::Ended));
                }
            }
        }
    }

    /// Consume one buffered change and run the delivery steps: cache the
    /// token, clear the operation-time anchor, notify observers (token
    /// change strictly before the change itself), and parse the event.
    fn deliver_next(&mut self) -> Poll<Result<Advance>> {
        let cursor = match self.cursor.as_mut() {
            Some(cursor) => cursor,
            None => {
                let e = Error::internal("change stream lost its cursor");
                self.terminate(&e);
                return Poll::Ready(Err(e));
            }
        };
        let doc = match cursor.take_next() {
            Ok(Some(doc)) => doc,
            // The buffer emptied between fill and pop; go around again.
            Ok(None) => return Poll::Ready(Ok(Advance::Empty)),
            Err(e) => {
                self.terminate(&e);
                return Poll::Ready(Err(e));
            }
        };

        // A later reconstruction must not pair the stale operation time
        // with the token cached just now.
        if let Some(options) = self.options.as_mut() {
            options.start_at_operation_time = None;
        }

        self.emit_token_changed();
        match bson::from_document::<ChangeStreamEvent>(doc.clone()) {
            Ok(event) => {
                self.emit(StreamEvent::Change(doc));
                Poll::Ready(Ok(Advance::Event(event)))
            }
            Err(e) => {
                let e: Error = ErrorKind::from(e).into();
                self.terminate(&e);
                Poll::Ready(Err(e))
            }
        }
    }

    /// Detach the failed cursor and begin reconstructing one at the cached
    /// resume position.
    fn start_resume(&mut self) {
        let mut old = match self.cursor.take() {
            Some(cursor) => cursor,
            None => return,
        };
        let data = old.resume_data();
        let topology = self.topology.clone();
        let target = self.target.clone();
        let pipeline = self.pipeline.clone();
        let heartbeat = data.resume_heartbeat().unwrap_or(RESUME_HEARTBEAT);
        let timeout = data.selection_timeout().unwrap_or(DEFAULT_SELECTION_TIMEOUT);
        // Pull-style consumers get a probed cursor: the replacement proves
        // it can run its aggregation before it is adopted. Push-style
        // consumers adopt immediately and let the next poll drive it.
        let probe = self.mode == IterationMode::Iterator;

        self.pending_resume = Some(Box::pin(async move {
            // The old server-side cursor is dead weight now; tearing it
            // down is best-effort and must not delay the resume.
            old.close().await;

            wait_for_connected(&topology, heartbeat, timeout).await?;

            let criteria = data.selection_criteria();
            let server = topology.select_server(criteria.as_ref()).await?;
            let wire_version = server.description().max_wire_version;

            let options = data.resume_options(wire_version);
            let mut cursor =
                ChangeStreamCursor::new(topology, &target, &pipeline, options)?;
            if probe {
                cursor.initialize().await?;
            }
            Ok(cursor)
        }));
    }

    /// Close after a terminal error. The cursor is dropped, which issues a
    /// background kill for a still-live server cursor.
    fn terminate(&mut self, error: &Error) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pending_resume = None;
        self.cursor = None;
        if self.mode == IterationMode::Emitter {
            self.emit(StreamEvent::Error(error.clone()));
        }
        self.emit_close_once();
    }

    /// Close after the server ended the stream.
    fn finish_end(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.cursor = None;
        self.emit(StreamEvent::End);
        self.emit_close_once();
    }

    fn emit(&self, event: StreamEvent) {
        if let Some(handler) = self.events.as_ref() {
            handler.handle(event);
        }
    }

    fn emit_close_once(&mut self) {
        if !self.close_emitted {
            self.close_emitted = true;
            self.emit(StreamEvent::Close);
        }
    }

    fn emit_batch_events(&mut self) {
        if let Some(cursor) = self.cursor.as_ref() {
            let received = cursor.batches_received();
            if received > self.batches_seen {
                self.batches_seen = received;
                let info = BatchInfo {
                    cursor_id: cursor.id(),
                    batch_len: cursor.buffered_len(),
                };
                self.emit(StreamEvent::Response(info.clone()));
                if self.init_emitted {
                    self.emit(StreamEvent::More(info));
                } else {
                    self.init_emitted = true;
                    self.emit(StreamEvent::Init(info));
                }
            }
        }
        self.emit_token_changed();
    }

    fn emit_token_changed(&mut self) {
        let current = self
            .cursor
            .as_ref()
            .and_then(|c| c.resume_token().cloned());
        if let Some(token) = current {
            if self.last_token.as_ref() != Some(&token) {
                self.last_token = Some(token.clone());
                self.emit(StreamEvent::ResumeTokenChanged(token));
            }
        }
    }
}

/// The push-style surface of a [`ChangeStream`], created by
/// [`ChangeStream::stream`].
///
/// Yields each change event as it arrives. A terminal error appears as the
/// final item; a stream whose server side ends (or that is closed) simply
/// finishes.
#[derive(Debug)]
pub struct ChangeStreamEvents<'a> {
    stream: &'a mut ChangeStream,
    terminated: bool,
}

impl Stream for ChangeStreamEvents<'_> {
    type Item = Result<ChangeStreamEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.terminated {
            return Poll::Ready(None);
        }
        loop {
            match this.stream.poll_advance(cx, true, true) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(Advance::Event(event))) => {
                    return Poll::Ready(Some(Ok(event)));
                }
                Poll::Ready(Ok(Advance::Buffered | Advance::Empty)) => continue,
                Poll::Ready(Ok(Advance::Ended)) => {
                    this.terminated = true;
                    return Poll::Ready(None);
                }
                Poll::Ready(Err(e)) => {
                    this.terminated = true;
                    if matches!(*e.kind, ErrorKind::ChangeStreamClosed) {
                        return Poll::Ready(None);
                    }
                    return Poll::Ready(Some(Err(e)));
                }
            }
        }
    }
}
