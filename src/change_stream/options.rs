//! Contains options for change streams.

use std::time::Duration;

use bson::{Bson, Timestamp};
use serde::Serialize;
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::{
    change_stream::event::ResumeToken,
    collation::Collation,
    concern::ReadConcern,
    options::AggregateOptions,
    selection_criteria::SelectionCriteria,
};

/// The valid options for opening a change stream.
///
/// Serializing this struct produces exactly the recognized subset of the
/// `$changeStream` stage; everything else is marked non-wire and travels at
/// the command level or configures the engine itself.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Serialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ChangeStreamOptions {
    /// Configures how the [`full_document`](crate::change_stream::event::ChangeStreamEvent::full_document)
    /// field of update events is populated. By default the field is empty
    /// for updates.
    pub full_document: Option<FullDocumentType>,

    /// Start the stream just after the event carrying this token. Cannot be
    /// combined with `start_after` or `start_at_operation_time`.
    pub resume_after: Option<ResumeToken>,

    /// Start the stream just after the event carrying this token, allowing
    /// the watched collection to have been dropped and recreated in the
    /// meantime. Requires server 4.2+. Cannot be combined with
    /// `resume_after` or `start_at_operation_time`.
    pub start_after: Option<ResumeToken>,

    /// Only deliver changes that occurred at or after this cluster
    /// timestamp. Cannot be combined with `resume_after` or `start_after`.
    pub start_at_operation_time: Option<Timestamp>,

    /// The number of documents the server returns per batch.
    #[serde(skip_serializing)]
    pub batch_size: Option<u32>,

    /// How long the server lets a getMore await new events before returning
    /// an empty batch.
    #[serde(skip_serializing)]
    pub max_await_time: Option<Duration>,

    /// A collation for the user pipeline stages.
    #[serde(skip_serializing)]
    pub collation: Option<Collation>,

    /// The read concern of the initial aggregation.
    #[serde(skip_serializing)]
    pub read_concern: Option<ReadConcern>,

    /// The criteria used to select a server for the stream's commands.
    #[serde(skip_serializing)]
    pub selection_criteria: Option<SelectionCriteria>,

    /// An arbitrary value attached to the stream's commands, for
    /// correlation in server logs and profiler output.
    #[serde(skip_serializing)]
    pub comment: Option<Bson>,

    /// How often the engine polls the topology for connectivity while
    /// waiting to resume. Defaults to 500 ms.
    #[serde(skip_serializing)]
    pub resume_heartbeat: Option<Duration>,

    /// How long one resume attempt may wait for the topology to reconnect
    /// before the stream fails. Defaults to 30 s.
    #[serde(skip_serializing)]
    pub selection_timeout: Option<Duration>,
}

impl ChangeStreamOptions {
    pub(crate) fn aggregate_options(&self) -> AggregateOptions {
        AggregateOptions::builder()
            .batch_size(self.batch_size)
            .collation(self.collation.clone())
            .max_await_time(self.max_await_time)
            .read_concern(self.read_concern.clone())
            .selection_criteria(self.selection_criteria.clone())
            .comment(self.comment.clone())
            .build()
    }

    /// Whether the caller pinned an explicit starting position.
    pub(crate) fn has_start_point(&self) -> bool {
        self.resume_after.is_some()
            || self.start_after.is_some()
            || self.start_at_operation_time.is_some()
    }
}

/// Describes the modes for populating the
/// [`full_document`](crate::change_stream::event::ChangeStreamEvent::full_document)
/// field of update events.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum FullDocumentType {
    /// Populate with a copy of the entire updated document, looked up at
    /// some point after the update.
    UpdateLookup,

    /// Populate for replace and update events when the post-image is
    /// available.
    WhenAvailable,

    /// Like `WhenAvailable`, but the server errors when the post-image is
    /// missing.
    Required,
}
