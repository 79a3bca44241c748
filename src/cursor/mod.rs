//! Cursors over server result sets.
//!
//! A [`Cursor`] streams the result of a cursor-opening command. The first
//! consumer request runs the command; the resulting batch is buffered and
//! handed out document by document, with `getMore` round trips issued as the
//! buffer drains, until the server reports the cursor exhausted (`id == 0`).
//!
//! Both consumption styles are supported: pull ([`Cursor::next`],
//! [`Cursor::try_next`], [`Cursor::has_next`], [`Cursor::to_vec`],
//! [`Cursor::for_each`]) and push ([`Cursor::stream`], a backpressured
//! [`Stream`](futures_core::Stream) that never has more than one getMore in
//! flight).

mod common;

use std::{
    collections::VecDeque,
    future::poll_fn,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use bson::{Document, Timestamp};
use derive_where::derive_where;
use futures_core::Stream;
use tracing::debug;

use crate::{
    change_stream::event::ResumeToken,
    error::{Error, ErrorKind, Result},
    namespace::Namespace,
    operation::{GetMore, GetMoreResult, KillCursors, Operation, RunCursorCommand},
    options::{CursorFlags, CursorOptions},
    sdam::{ServerHandle, Topology},
    selection_criteria::ReadPreference,
    session::{ClientSession, ClusterTime},
    concern::ReadConcern,
};

pub use common::DocumentTransform;
pub(crate) use common::{CursorInformation, CursorSpecification, FillOutcome};
use common::{spawn_kill_cursor, ExecutionState, GetMoreOutcome, InitOutcome, PinnedConnection};

/// The batch size requested on getMores when the caller did not set one.
const DEFAULT_BATCH_SIZE: u32 = 1000;

/// A cursor over the documents of a server result set.
///
/// Nothing is sent to the server until the first consumer request; the
/// cursor owns its initial command and re-runs it after [`Cursor::rewind`].
/// Dropping a live cursor issues a best-effort `killCursors` in the
/// background.
#[derive_where(Debug)]
pub struct Cursor {
    #[derive_where(skip)]
    topology: Arc<dyn Topology>,
    #[derive_where(skip)]
    operation: Arc<dyn Operation<O = CursorSpecification> + Send + Sync>,
    options: CursorOptions,
    state: CursorState,
    #[derive_where(skip)]
    exec: ExecutionState,
}

#[derive_where(Debug)]
struct CursorState {
    ns: Namespace,
    id: i64,
    buffer: VecDeque<Document>,
    #[derive_where(skip)]
    server: Option<Arc<ServerHandle>>,
    session: Option<ClientSession>,
    initialized: bool,
    closed: bool,
    killed: bool,
    exhausted: bool,
    pinned: PinnedConnection,
    post_batch_resume_token: Option<ResumeToken>,
    operation_time: Option<Timestamp>,
    batches: u64,
    #[derive_where(skip)]
    transform: Option<DocumentTransform>,
}

impl Cursor {
    pub(crate) fn new(
        topology: Arc<dyn Topology>,
        operation: Arc<dyn Operation<O = CursorSpecification> + Send + Sync>,
        ns: Namespace,
        options: CursorOptions,
    ) -> Self {
        Self {
            topology,
            operation,
            options,
            state: CursorState {
                ns,
                id: 0,
                buffer: VecDeque::new(),
                server: None,
                session: None,
                initialized: false,
                closed: false,
                killed: false,
                exhausted: false,
                pinned: PinnedConnection::Unpinned,
                post_batch_resume_token: None,
                operation_time: None,
                batches: 0,
                transform: None,
            },
            exec: ExecutionState::Idle,
        }
    }

    /// Open a cursor over an arbitrary cursor-returning command, e.g.
    /// `listCollections` or a raw `aggregate`.
    ///
    /// The command is not sent until the cursor is first iterated.
    pub fn from_command(
        topology: Arc<dyn Topology>,
        db: impl Into<String>,
        command: Document,
        options: CursorOptions,
    ) -> Result<Self> {
        let db = db.into();
        let operation = RunCursorCommand::new(db.clone(), command, options.clone())?;
        let ns = Namespace::new(db, format!("$cmd.{}", operation.name()));
        Ok(Self::new(topology, Arc::new(operation), ns, options))
    }

    /// The server-side id of this cursor. Zero before initialization and
    /// after exhaustion.
    pub fn id(&self) -> i64 {
        self.state.id
    }

    /// The namespace the cursor reads from.
    pub fn namespace(&self) -> &Namespace {
        &self.state.ns
    }

    /// Whether the cursor has been closed, explicitly or by exhaustion.
    pub fn is_closed(&self) -> bool {
        self.state.closed
    }

    /// Whether the server has reported this cursor exhausted and its buffer
    /// has drained.
    pub fn is_exhausted(&self) -> bool {
        self.state.exhausted
    }

    /// Whether a `killCursors` has been issued for this cursor.
    pub fn is_killed(&self) -> bool {
        self.state.killed
    }

    /// Remove and return any documents still buffered locally.
    ///
    /// This is the only way to drain a cursor after [`Cursor::close`];
    /// ordinary iteration on a closed cursor reports end-of-stream.
    pub fn take_buffered(&mut self) -> Vec<Document> {
        self.state.buffer.drain(..).collect()
    }

    pub(crate) fn buffer_is_empty(&self) -> bool {
        self.state.buffer.is_empty()
    }

    pub(crate) fn buffered_count(&self) -> usize {
        self.state.buffer.len()
    }

    pub(crate) fn post_batch_resume_token(&self) -> Option<&ResumeToken> {
        self.state.post_batch_resume_token.as_ref()
    }

    pub(crate) fn operation_time(&self) -> Option<Timestamp> {
        self.state.operation_time
    }

    pub(crate) fn batches_received(&self) -> u64 {
        self.state.batches
    }

    pub(crate) fn wire_version(&self) -> Option<i32> {
        self.state
            .server
            .as_ref()
            .map(|s| s.description().max_wire_version)
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.state.initialized
    }

    // ===== option mutators =====
    //
    // All of these configure the command the cursor has not yet sent, so
    // they reject once initialization has happened.

    fn assert_mutable(&self, operation: &str) -> Result<()> {
        if self.state.initialized {
            return Err(Error::cursor_in_use(operation));
        }
        Ok(())
    }

    /// Set a wire-level flag on the cursor.
    pub fn add_cursor_flag(&mut self, flag: CursorFlags) -> Result<()> {
        self.assert_mutable("add_cursor_flag")?;
        self.options.flags |= flag;
        Ok(())
    }

    /// Set the number of documents returned per batch.
    pub fn set_batch_size(&mut self, batch_size: u32) -> Result<()> {
        self.assert_mutable("set_batch_size")?;
        if self.options.is_tailable() {
            return Err(ErrorKind::TailableCursor {
                message: "tailable cursors do not support batch size changes".to_string(),
            }
            .into());
        }
        self.options.batch_size = Some(batch_size);
        Ok(())
    }

    /// Set the server-side time bound of the initial command.
    pub fn set_max_time(&mut self, max_time: Duration) -> Result<()> {
        self.assert_mutable("set_max_time")?;
        self.options.max_time = Some(max_time);
        Ok(())
    }

    /// Set the read preference used to select a server.
    pub fn set_read_preference(&mut self, read_preference: ReadPreference) -> Result<()> {
        self.assert_mutable("set_read_preference")?;
        self.options.selection_criteria = Some(read_preference.into());
        Ok(())
    }

    /// Set the read concern of the initial command.
    pub fn set_read_concern(&mut self, read_concern: ReadConcern) -> Result<()> {
        self.assert_mutable("set_read_concern")?;
        self.options.read_concern = Some(read_concern);
        Ok(())
    }

    /// Apply a transform to every yielded document.
    ///
    /// Transforms compose: a second call wraps the first, outermost last.
    pub fn map(
        &mut self,
        f: impl Fn(Document) -> Result<Document> + Send + Sync + 'static,
    ) -> Result<()> {
        self.assert_mutable("map")?;
        self.state.transform = Some(match self.state.transform.take() {
            Some(inner) => Arc::new(move |doc| f(inner(doc)?)),
            None => Arc::new(f),
        });
        Ok(())
    }

    // ===== iteration =====

    /// Advance the cursor, waiting for data if the server cursor is live
    /// but its current batch is empty.
    ///
    /// Returns `Ok(None)` when the cursor reaches its natural end or has
    /// been closed; calling `next` again after a natural end fails with
    /// [`ErrorKind::CursorExhausted`].
    pub async fn next(&mut self) -> Result<Option<Document>> {
        if self.state.exhausted {
            return Err(ErrorKind::CursorExhausted.into());
        }
        loop {
            match poll_fn(|cx| self.poll_fill(cx, true)).await? {
                FillOutcome::Available => return self.pop_document().transpose(),
                FillOutcome::Empty => continue,
                FillOutcome::Exhausted => return Ok(None),
            }
        }
    }

    /// Advance the cursor without waiting: an empty batch from a live
    /// cursor yields `Ok(None)` instead of another getMore.
    pub async fn try_next(&mut self) -> Result<Option<Document>> {
        match poll_fn(|cx| self.poll_fill(cx, false)).await? {
            FillOutcome::Available => self.pop_document().transpose(),
            FillOutcome::Empty | FillOutcome::Exhausted => Ok(None),
        }
    }

    /// Whether another document is available, fetching batches as needed.
    /// The peeked document stays buffered for the next [`Cursor::next`].
    pub async fn has_next(&mut self) -> Result<bool> {
        if self.state.exhausted {
            return Ok(false);
        }
        loop {
            match poll_fn(|cx| self.poll_fill(cx, true)).await? {
                FillOutcome::Available => return Ok(true),
                FillOutcome::Empty => continue,
                FillOutcome::Exhausted => return Ok(false),
            }
        }
    }

    /// Drain the cursor to completion.
    pub async fn to_vec(&mut self) -> Result<Vec<Document>> {
        if self.options.is_tailable() {
            return Err(ErrorKind::TailableCursor {
                message: "a tailable cursor cannot be collected".to_string(),
            }
            .into());
        }
        let mut docs = Vec::new();
        while let Some(doc) = self.next().await? {
            docs.push(doc);
        }
        Ok(docs)
    }

    /// Call `f` for each remaining document; `f` returning `false` stops
    /// iteration early.
    pub async fn for_each(&mut self, mut f: impl FnMut(Document) -> bool) -> Result<()> {
        while let Some(doc) = self.next().await? {
            if !f(doc) {
                break;
            }
        }
        Ok(())
    }

    /// Consume the cursor through a push-style [`Stream`].
    pub fn stream(&mut self) -> DocumentStream<'_> {
        self.stream_with(StreamOptions::default())
    }

    /// Like [`Cursor::stream`], with a per-stream transform layered on top
    /// of any cursor-level transform.
    pub fn stream_with(&mut self, options: StreamOptions) -> DocumentStream<'_> {
        DocumentStream {
            cursor: self,
            transform: options.transform,
            done: false,
        }
    }

    // ===== lifecycle =====

    /// Run the initial command if it has not run yet.
    pub(crate) async fn initialize(&mut self) -> Result<()> {
        poll_fn(|cx| self.poll_initialize(cx)).await
    }

    /// Close the cursor, killing the server-side cursor when one is live.
    ///
    /// Idempotent. Kill failures are logged and swallowed: the server reaps
    /// orphaned cursors on its own schedule.
    pub async fn close(&mut self) {
        if self.state.closed {
            return;
        }
        // Cancel any in-flight round trip.
        self.exec = ExecutionState::Idle;
        self.state.closed = true;

        if self.state.id != 0 && !self.state.pinned.is_invalid() {
            if let Some(server) = self.state.server.clone() {
                self.state.killed = true;
                let op = KillCursors::new(self.state.ns.clone(), self.state.id);
                if let Err(error) = server.execute(&op, self.state.session.as_ref()).await {
                    debug!(%error, "ignoring killCursors failure during cursor close");
                }
            }
        }
        self.state.id = 0;
        self.end_session();
    }

    /// Reset the cursor to its pre-initialized state so its command can run
    /// again. Ends the owned implicit session.
    pub fn rewind(&mut self) {
        self.exec = ExecutionState::Idle;
        if self.state.id != 0 && !self.state.pinned.is_invalid() {
            if let Some(server) = self.state.server.clone() {
                spawn_kill_cursor(server, self.state.ns.clone(), self.state.id);
            }
        }
        self.end_session();
        self.state.id = 0;
        self.state.buffer.clear();
        self.state.server = None;
        self.state.initialized = false;
        self.state.closed = false;
        self.state.killed = false;
        self.state.exhausted = false;
        self.state.pinned = PinnedConnection::Unpinned;
        self.state.post_batch_resume_token = None;
        self.state.operation_time = None;
        self.state.batches = 0;
    }

    // ===== poll core =====

    /// Drive the cursor until at least one document is buffered, a
    /// non-blocking call observes an empty batch, or the cursor ends.
    pub(crate) fn poll_fill(
        &mut self,
        cx: &mut Context<'_>,
        blocking: bool,
    ) -> Poll<Result<FillOutcome>> {
        loop {
            // An in-flight round trip always has priority: the buffer is
            // empty whenever one is running.
            match &mut self.exec {
                ExecutionState::Initializing(future) => match future.as_mut().poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(outcome) => {
                        self.exec = ExecutionState::Idle;
                        if let Err(e) = self.finish_initialize(outcome) {
                            return Poll::Ready(Err(e));
                        }
                        continue;
                    }
                },
                ExecutionState::GettingMore(future) => match future.as_mut().poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(outcome) => {
                        self.exec = ExecutionState::Idle;
                        match self.finish_get_more(outcome) {
                            Err(e) => return Poll::Ready(Err(e)),
                            Ok(()) => {
                                if self.state.buffer.is_empty() && self.state.id != 0 && !blocking
                                {
                                    return Poll::Ready(Ok(FillOutcome::Empty));
                                }
                                continue;
                            }
                        }
                    }
                },
                ExecutionState::Idle => {}
            }

            if self.state.closed {
                return Poll::Ready(Ok(FillOutcome::Exhausted));
            }
            if !self.state.buffer.is_empty() {
                return Poll::Ready(Ok(FillOutcome::Available));
            }
            if !self.state.initialized {
                self.start_initialize();
                continue;
            }
            if self.state.id == 0 || self.state.pinned.is_invalid() {
                self.mark_exhausted();
                return Poll::Ready(Ok(FillOutcome::Exhausted));
            }
            if self.state.server.is_none() {
                self.mark_exhausted();
                return Poll::Ready(Ok(FillOutcome::Exhausted));
            }
            self.start_get_more();
        }
    }

    fn poll_initialize(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        loop {
            if self.state.initialized || self.state.closed {
                return Poll::Ready(Ok(()));
            }
            match &mut self.exec {
                ExecutionState::Initializing(future) => match future.as_mut().poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(outcome) => {
                        self.exec = ExecutionState::Idle;
                        return Poll::Ready(self.finish_initialize(outcome));
                    }
                },
                _ => {
                    self.start_initialize();
                }
            }
        }
    }

    /// Pop one buffered document, applying the cursor transform.
    pub(crate) fn pop_document(&mut self) -> Option<Result<Document>> {
        let doc = self.state.buffer.pop_front()?;
        Some(match &self.state.transform {
            Some(transform) => transform(doc),
            None => Ok(doc),
        })
    }

    fn start_initialize(&mut self) {
        let topology = self.topology.clone();
        let operation = self.operation.clone();
        let fallback_criteria = self.options.selection_criteria.clone();

        self.exec = ExecutionState::Initializing(Box::pin(async move {
            let mut session = None;
            // When session support is already known, a session can be
            // started up front; otherwise selecting a server establishes it.
            if !topology.should_check_session_support() && topology.has_session_support() {
                session = Some(topology.start_session(true));
            }

            let criteria = operation
                .selection_criteria()
                .or(fallback_criteria.as_ref());
            let server = match topology.select_server(criteria).await {
                Ok(server) => server,
                Err(e) => {
                    return InitOutcome {
                        result: Err(e),
                        session,
                    }
                }
            };

            if session.is_none() && topology.has_session_support() {
                session = Some(topology.start_session(true));
            }

            let result = server
                .execute(operation.as_ref(), session.as_ref())
                .await
                .map(|spec| (server, spec));
            InitOutcome { result, session }
        }));
    }

    fn finish_initialize(&mut self, outcome: InitOutcome) -> Result<()> {
        // Initialization happened, successfully or not.
        self.state.initialized = true;
        self.state.session = outcome.session;

        match outcome.result {
            Ok((server, spec)) => {
                if self.topology.load_balanced() {
                    self.state.pinned = PinnedConnection::new(true);
                }
                self.state.ns = spec.info.ns.clone();
                self.state.id = spec.info.id;
                self.state.buffer = spec.initial_buffer;
                self.state.post_batch_resume_token = spec.post_batch_resume_token;
                self.state.operation_time = spec.operation_time;
                self.state.batches += 1;
                if let Some(cluster_time) = spec.cluster_time {
                    self.advance_cluster_time(&cluster_time);
                }
                self.state.server = Some(server);
                Ok(())
            }
            Err(e) => {
                self.cleanup_after_error(&e);
                Err(e)
            }
        }
    }

    fn start_get_more(&mut self) {
        let server = match self.state.server.clone() {
            Some(server) => server,
            None => return,
        };
        let info = CursorInformation {
            ns: self.state.ns.clone(),
            id: self.state.id,
            batch_size: Some(self.options.batch_size.unwrap_or(DEFAULT_BATCH_SIZE)),
            max_time: self.options.max_await_time,
            comment: self.options.comment.clone(),
            await_data: self.options.is_await_data(),
        };
        let session = self.state.session.take();

        self.exec = ExecutionState::GettingMore(Box::pin(async move {
            let get_more = GetMore::new(info);
            let result = server.execute(&get_more, session.as_ref()).await;
            GetMoreOutcome { result, session }
        }));
    }

    fn finish_get_more(&mut self, outcome: GetMoreOutcome) -> Result<()> {
        self.state.session = outcome.session;
        match outcome.result {
            Ok(result) => {
                self.integrate_batch(result);
                Ok(())
            }
            Err(e) => {
                self.cleanup_after_error(&e);
                Err(e)
            }
        }
    }

    fn integrate_batch(&mut self, result: GetMoreResult) {
        self.state.id = result.id;
        self.state.ns = result.ns;
        self.state.buffer = result.batch;
        if result.post_batch_resume_token.is_some() {
            self.state.post_batch_resume_token = result.post_batch_resume_token;
        }
        self.state.batches += 1;
        if let Some(cluster_time) = result.cluster_time {
            self.advance_cluster_time(&cluster_time);
        }
    }

    fn advance_cluster_time(&mut self, cluster_time: &ClusterTime) {
        self.topology.advance_cluster_time(cluster_time);
        if let Some(session) = self.state.session.as_mut() {
            session.advance_cluster_time(cluster_time);
        }
    }

    /// Tear the cursor down after a failed round trip.
    fn cleanup_after_error(&mut self, error: &Error) {
        if error.is_network_error() {
            // In load-balanced mode the pinned connection is now suspect;
            // killCursors must not be attempted through it.
            self.state.pinned.invalidate();
        }
        self.state.closed = true;
        self.state.exhausted = true;

        if self.state.id != 0 && !self.state.pinned.is_invalid() {
            if let Some(server) = self.state.server.clone() {
                self.state.killed = true;
                spawn_kill_cursor(server, self.state.ns.clone(), self.state.id);
            }
        }
        self.state.id = 0;
        self.end_session();
    }

    /// Mark the cursor's natural end: drained with `id == 0`.
    fn mark_exhausted(&mut self) {
        self.state.closed = true;
        self.state.exhausted = true;
        self.state.pinned = PinnedConnection::Unpinned;
        self.end_session();
    }

    fn end_session(&mut self) {
        // Implicit sessions are owned by the cursor and end here, exactly
        // once. Explicit sessions are never the cursor's to end.
        if self
            .state
            .session
            .as_ref()
            .map_or(false, ClientSession::is_implicit)
        {
            self.state.session = None;
        }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if self.state.closed || self.state.id == 0 || self.state.pinned.is_invalid() {
            return;
        }
        if let Some(server) = self.state.server.clone() {
            spawn_kill_cursor(server, self.state.ns.clone(), self.state.id);
        }
    }
}

/// Options for [`Cursor::stream_with`].
#[derive(Clone, Default)]
#[derive_where(Debug)]
#[non_exhaustive]
pub struct StreamOptions {
    /// A transform applied to each document this stream yields, on top of
    /// any transform set on the cursor itself.
    #[derive_where(skip)]
    pub transform: Option<DocumentTransform>,
}

impl StreamOptions {
    /// Build options carrying the given transform.
    pub fn with_transform(
        f: impl Fn(Document) -> Result<Document> + Send + Sync + 'static,
    ) -> Self {
        Self {
            transform: Some(Arc::new(f)),
        }
    }
}

/// A push-style adapter over a borrowed [`Cursor`].
///
/// Demand-driven: each `poll_next` advances the cursor by at most one
/// getMore, so there is no read-ahead beyond the one in-flight round trip.
/// A server-side interruption (the race between a kill and an in-flight
/// getMore) ends the stream silently; a local shutdown closes the cursor
/// and ends the stream; any other error is yielded and terminates it.
pub struct DocumentStream<'a> {
    cursor: &'a mut Cursor,
    transform: Option<DocumentTransform>,
    done: bool,
}

impl Stream for DocumentStream<'_> {
    type Item = Result<Document>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        loop {
            match this.cursor.poll_fill(cx, true) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(FillOutcome::Available)) => {
                    let doc = match this.cursor.pop_document() {
                        Some(Ok(doc)) => doc,
                        Some(Err(e)) => {
                            this.done = true;
                            return Poll::Ready(Some(Err(e)));
                        }
                        None => continue,
                    };
                    let doc = match this.transform.as_ref() {
                        Some(transform) => match transform(doc) {
                            Ok(doc) => doc,
                            Err(e) => {
                                this.done = true;
                                return Poll::Ready(Some(Err(e)));
                            }
                        },
                        None => doc,
                    };
                    return Poll::Ready(Some(Ok(doc)));
                }
                Poll::Ready(Ok(FillOutcome::Empty)) => continue,
                Poll::Ready(Ok(FillOutcome::Exhausted)) => {
                    this.done = true;
                    return Poll::Ready(None);
                }
                Poll::Ready(Err(e)) => {
                    this.done = true;
                    if e.is_shutdown() {
                        debug!("ending document stream: client shut down");
                        return Poll::Ready(None);
                    }
                    if e.is_interruption() {
                        debug!(error = %e, "suppressing interruption of an in-flight getMore");
                        return Poll::Ready(None);
                    }
                    return Poll::Ready(Some(Err(e)));
                }
            }
        }
    }
}
