use std::{collections::VecDeque, sync::Arc, time::Duration};

use bson::{Bson, Document, Timestamp};

use crate::{
    change_stream::event::ResumeToken,
    error::Result,
    namespace::Namespace,
    operation::{self, GetMoreResult, KillCursors},
    sdam::ServerHandle,
    session::{ClientSession, ClusterTime},
    BoxFuture,
};

/// A transform applied to every document a cursor yields.
pub type DocumentTransform = Arc<dyn Fn(Document) -> Result<Document> + Send + Sync>;

/// Specification used to create a new cursor, produced by handling the
/// response of a cursor-opening command.
#[derive(Clone, Debug)]
pub(crate) struct CursorSpecification {
    pub(crate) info: CursorInformation,
    pub(crate) initial_buffer: VecDeque<Document>,
    pub(crate) post_batch_resume_token: Option<ResumeToken>,
    pub(crate) operation_time: Option<Timestamp>,
    pub(crate) cluster_time: Option<ClusterTime>,
}

impl CursorSpecification {
    pub(crate) fn new(
        info: operation::CursorInfo,
        batch_size: impl Into<Option<u32>>,
        max_time: impl Into<Option<Duration>>,
        comment: impl Into<Option<Bson>>,
        await_data: bool,
        operation_time: Option<Timestamp>,
        cluster_time: Option<ClusterTime>,
    ) -> Self {
        Self {
            info: CursorInformation {
                ns: info.ns,
                id: info.id,
                batch_size: batch_size.into(),
                max_time: max_time.into(),
                comment: comment.into(),
                await_data,
            },
            initial_buffer: info.first_batch.into(),
            post_batch_resume_token: info.post_batch_resume_token.map(ResumeToken::from_document),
            operation_time,
            cluster_time,
        }
    }
}

/// Static information about a cursor, enough to build its getMores.
#[derive(Clone, Debug)]
pub(crate) struct CursorInformation {
    pub(crate) ns: Namespace,
    pub(crate) id: i64,
    pub(crate) batch_size: Option<u32>,
    pub(crate) max_time: Option<Duration>,
    pub(crate) comment: Option<Bson>,
    pub(crate) await_data: bool,
}

/// The connection-pinning state of a cursor in load-balanced mode.
///
/// Load balancers route each connection independently, so a cursor must keep
/// using the connection that created it. A network error makes that
/// connection suspect: the pin is invalidated and cleanup must not attempt a
/// `killCursors` through it.
#[derive(Debug)]
pub(crate) enum PinnedConnection {
    Valid,
    Invalid,
    Unpinned,
}

impl PinnedConnection {
    pub(crate) fn new(load_balanced: bool) -> Self {
        if load_balanced {
            Self::Valid
        } else {
            Self::Unpinned
        }
    }

    pub(crate) fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid)
    }

    pub(crate) fn invalidate(&mut self) {
        if matches!(self, Self::Valid) {
            *self = Self::Invalid;
        }
    }
}

/// What a buffer-fill attempt produced.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum FillOutcome {
    /// At least one document is buffered.
    Available,

    /// A getMore returned an empty batch while the server cursor is still
    /// live. Surfaced only to non-blocking callers.
    Empty,

    /// The cursor is done: closed, killed, or drained with `id == 0`.
    Exhausted,
}

/// The in-flight operation of a cursor, if any.
///
/// Futures are `'static`: they own their server handle and carry the
/// cursor's implicit session in and out, so the cursor itself stays movable
/// while a round trip is running.
pub(super) enum ExecutionState {
    Idle,
    Initializing(BoxFuture<'static, InitOutcome>),
    GettingMore(BoxFuture<'static, GetMoreOutcome>),
}

impl std::fmt::Debug for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Initializing(_) => "Initializing",
            Self::GettingMore(_) => "GettingMore",
        };
        f.debug_tuple(name).finish()
    }
}

pub(super) struct InitOutcome {
    pub(super) result: Result<(Arc<ServerHandle>, CursorSpecification)>,
    pub(super) session: Option<ClientSession>,
}

pub(super) struct GetMoreOutcome {
    pub(super) result: Result<GetMoreResult>,
    pub(super) session: Option<ClientSession>,
}

/// Fire-and-forget `killCursors`, for teardown paths that cannot await one.
///
/// Outside a runtime the kill is skipped; the server reaps the cursor after
/// its idle timeout.
pub(crate) fn spawn_kill_cursor(server: Arc<ServerHandle>, ns: Namespace, cursor_id: i64) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            let op = KillCursors::new(ns, cursor_id);
            if let Err(error) = server.execute(&op, None).await {
                tracing::debug!(%error, "ignoring killCursors failure during cursor teardown");
            }
        });
    }
}
