use std::{
    sync::Arc,
    task::{Context, Poll},
};

use bson::{Document, Timestamp};

use crate::{
    change_stream::{
        event::ResumeToken,
        options::ChangeStreamOptions,
        ChangeStreamTarget,
    },
    cursor::{Cursor, FillOutcome},
    error::{ErrorKind, Result},
    operation::ChangeStreamAggregate,
    options::{CursorFlags, CursorOptions},
    sdam::{Topology, START_AT_OPERATION_TIME_MIN_WIRE_VERSION},
};

/// The cursor side of a change stream: a tailable await-data cursor over a
/// `$changeStream` aggregation that additionally tracks the resume position.
///
/// The cursor never retries anything itself. Every error is surfaced to the
/// owning [`ChangeStream`](crate::ChangeStream), which decides whether to
/// rebuild a cursor from [`ChangeStreamCursor::resume_data`].
#[derive(Debug)]
pub(crate) struct ChangeStreamCursor {
    cursor: Cursor,

    /// The options snapshot this cursor was built from.
    options: Option<ChangeStreamOptions>,

    /// The most recently cached resume position.
    resume_token: Option<ResumeToken>,

    /// The fallback restart anchor used when no resume token is known yet.
    start_at_operation_time: Option<Timestamp>,

    /// Whether at least one change document has been delivered.
    has_received: bool,

    /// Batches integrated by the inner cursor that this wrapper has already
    /// applied the token rules to.
    batches_noted: u64,

    /// Whether the initial response has been inspected for an
    /// `operationTime` restart anchor.
    operation_time_noted: bool,
}

impl ChangeStreamCursor {
    pub(crate) fn new(
        topology: Arc<dyn Topology>,
        target: &ChangeStreamTarget,
        pipeline: &[Document],
        options: Option<ChangeStreamOptions>,
    ) -> Result<Self> {
        let operation = ChangeStreamAggregate::new(target, pipeline, &options)?;
        let cursor = Cursor::new(
            topology,
            Arc::new(operation),
            target.namespace(),
            cursor_options(&options),
        );

        // The stream position starts at the caller-supplied token, when any.
        let resume_token = options.as_ref().and_then(|o| {
            o.start_after
                .clone()
                .or_else(|| o.resume_after.clone())
        });

        Ok(Self {
            cursor,
            resume_token,
            start_at_operation_time: options.as_ref().and_then(|o| o.start_at_operation_time),
            has_received: false,
            batches_noted: 0,
            operation_time_noted: false,
            options,
        })
    }

    pub(crate) fn resume_token(&self) -> Option<&ResumeToken> {
        self.resume_token.as_ref()
    }

    pub(crate) fn id(&self) -> i64 {
        self.cursor.id()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.cursor.is_closed()
    }

    pub(crate) fn batches_received(&self) -> u64 {
        self.cursor.batches_received()
    }

    pub(crate) fn buffered_len(&self) -> usize {
        self.cursor.buffered_count()
    }

    /// Run the initial aggregation now. Used to probe a freshly rebuilt
    /// cursor during an iterator-mode resume.
    pub(crate) async fn initialize(&mut self) -> Result<()> {
        let result = self.cursor.initialize().await;
        self.note_progress();
        result
    }

    pub(crate) async fn close(&mut self) {
        self.cursor.close().await;
    }

    /// Fill the inner cursor's buffer, then apply the batch-level resume
    /// token rules for everything that arrived.
    pub(crate) fn poll_fill(
        &mut self,
        cx: &mut Context<'_>,
        blocking: bool,
    ) -> Poll<Result<FillOutcome>> {
        let poll = self.cursor.poll_fill(cx, blocking);
        // Batches can be integrated even when the poll comes back pending or
        // failed; the token cache must observe them regardless.
        self.note_progress();
        poll
    }

    /// Pop one buffered change and apply the per-document token rule.
    ///
    /// A change without an `_id` is a protocol violation: resuming would be
    /// impossible, so the error is fatal to the stream.
    pub(crate) fn take_next(&mut self) -> Result<Option<Document>> {
        let doc = match self.cursor.pop_document() {
            Some(doc) => doc?,
            None => return Ok(None),
        };

        let doc_token = match doc.get("_id") {
            Some(id) => ResumeToken::from_bson(id.clone()),
            None => return Err(ErrorKind::MissingResumeToken.into()),
        };
        // The post-batch token supersedes the document token once the batch
        // is drained: it marks the position just past the batch, which is
        // strictly newer.
        let is_last = self.cursor.buffer_is_empty();
        self.resume_token = match self.cursor.post_batch_resume_token() {
            Some(batch_token) if is_last => Some(batch_token.clone()),
            _ => Some(doc_token),
        };
        self.has_received = true;

        Ok(Some(doc))
    }

    /// The snapshot needed to rebuild this cursor at its current position.
    pub(crate) fn resume_data(&self) -> ResumeData {
        ResumeData {
            options: self.options.clone(),
            resume_token: self.resume_token.clone(),
            start_at_operation_time: self.start_at_operation_time,
            has_received: self.has_received,
        }
    }

    fn note_progress(&mut self) {
        let received = self.cursor.batches_received();
        if received == self.batches_noted {
            return;
        }
        self.batches_noted = received;
        self.note_operation_time();

        // An empty batch advances the stream position to the post-batch
        // token: there is nothing older left to deliver.
        if self.cursor.buffer_is_empty() {
            if let Some(batch_token) = self.cursor.post_batch_resume_token() {
                self.resume_token = Some(batch_token.clone());
            }
        }
    }

    /// Record the initial response's `operationTime` as a restart anchor
    /// when the caller did not pin a starting position and the server is
    /// recent enough to accept one.
    fn note_operation_time(&mut self) {
        if self.operation_time_noted || !self.cursor.is_initialized() {
            return;
        }
        self.operation_time_noted = true;

        if self.options.as_ref().map_or(false, ChangeStreamOptions::has_start_point) {
            return;
        }
        let supported = self
            .cursor
            .wire_version()
            .map_or(false, |v| v >= START_AT_OPERATION_TIME_MIN_WIRE_VERSION);
        if supported {
            if let Some(operation_time) = self.cursor.operation_time() {
                self.start_at_operation_time = Some(operation_time);
            }
        }
    }
}

/// Everything needed to reconstruct a change stream cursor at the position
/// its predecessor reached.
#[derive(Clone, Debug)]
pub(crate) struct ResumeData {
    options: Option<ChangeStreamOptions>,
    resume_token: Option<ResumeToken>,
    start_at_operation_time: Option<Timestamp>,
    has_received: bool,
}

impl ResumeData {
    /// Produce the options for the replacement cursor, targeting a server
    /// with the given wire version.
    ///
    /// Exactly one restart anchor survives: the cached token when one is
    /// known (as `startAfter` if the stream began with `startAfter` and has
    /// not yet delivered anything, otherwise as `resumeAfter`), else the
    /// operation time when the target server supports it, else nothing.
    pub(crate) fn resume_options(&self, wire_version: i32) -> Option<ChangeStreamOptions> {
        let mut options = self.options.clone().unwrap_or_default();
        let started_with_start_after = options.start_after.is_some();
        options.resume_after = None;
        options.start_after = None;
        options.start_at_operation_time = None;

        if let Some(token) = self.resume_token.clone() {
            if started_with_start_after && !self.has_received {
                options.start_after = Some(token);
            } else {
                options.resume_after = Some(token);
            }
        } else if let Some(operation_time) = self.start_at_operation_time {
            if wire_version >= START_AT_OPERATION_TIME_MIN_WIRE_VERSION {
                options.start_at_operation_time = Some(operation_time);
            }
        }

        Some(options)
    }

    pub(crate) fn selection_criteria(&self) -> Option<crate::selection_criteria::SelectionCriteria> {
        self.options
            .as_ref()
            .and_then(|o| o.selection_criteria.clone())
    }

    pub(crate) fn resume_heartbeat(&self) -> Option<std::time::Duration> {
        self.options.as_ref().and_then(|o| o.resume_heartbeat)
    }

    pub(crate) fn selection_timeout(&self) -> Option<std::time::Duration> {
        self.options.as_ref().and_then(|o| o.selection_timeout)
    }
}

fn cursor_options(options: &Option<ChangeStreamOptions>) -> CursorOptions {
    let mut cursor_options = CursorOptions {
        flags: CursorFlags::TAILABLE | CursorFlags::AWAIT_DATA,
        ..CursorOptions::default()
    };
    if let Some(options) = options.as_ref() {
        cursor_options.batch_size = options.batch_size;
        cursor_options.max_await_time = options.max_await_time;
        cursor_options.comment = options.comment.clone();
        cursor_options.read_concern = options.read_concern.clone();
        cursor_options.selection_criteria = options.selection_criteria.clone();
    }
    cursor_options
}
