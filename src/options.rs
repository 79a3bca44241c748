//! Contains the types needed to specify options to cursor and change-stream
//! operations.
//!
//! Options structs follow the builder pattern:
//!
//! ```
//! use mongowatch::options::ChangeStreamOptions;
//!
//! let options = ChangeStreamOptions::builder()
//!     .batch_size(100_u32)
//!     .build();
//! ```

use std::time::Duration;

use bitflags::bitflags;
use bson::Bson;
use typed_builder::TypedBuilder;

pub use crate::{
    change_stream::options::{ChangeStreamOptions, FullDocumentType},
    collation::Collation,
    concern::{ReadConcern, ReadConcernLevel},
    sdam::ServerAddress,
    selection_criteria::{ReadPreference, SelectionCriteria, TagSet},
};

bitflags! {
    /// Wire-level flags controlling cursor behavior on the server.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct CursorFlags: u32 {
        /// The cursor does not close once its current data is exhausted;
        /// later getMores may return newly appended data.
        const TAILABLE = 0b0000_0001;

        /// For tailable cursors, the server blocks a getMore for up to
        /// `max_await_time` rather than returning an empty batch
        /// immediately.
        const AWAIT_DATA = 0b0000_0010;

        /// The server does not time the cursor out after a period of
        /// inactivity.
        const NO_CURSOR_TIMEOUT = 0b0000_0100;

        /// Return partial results rather than erroring when some shards are
        /// down.
        const PARTIAL = 0b0000_1000;
    }
}

/// Options governing a single server cursor.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct CursorOptions {
    /// The number of documents the server returns per batch.
    pub batch_size: Option<u32>,

    /// The server-side time bound on the initial command.
    pub max_time: Option<Duration>,

    /// For tailable await-data cursors, how long the server lets a getMore
    /// wait for new results before returning an empty batch.
    pub max_await_time: Option<Duration>,

    /// Flags to set on the cursor.
    pub flags: CursorFlags,

    /// An arbitrary value attached to the commands this cursor runs, for
    /// correlation in server logs and profiler output.
    pub comment: Option<Bson>,

    /// The read concern of the initial command.
    pub read_concern: Option<ReadConcern>,

    /// The criteria used to select a server for this cursor's commands.
    pub selection_criteria: Option<SelectionCriteria>,
}

impl CursorOptions {
    pub(crate) fn is_tailable(&self) -> bool {
        self.flags.contains(CursorFlags::TAILABLE)
    }

    pub(crate) fn is_await_data(&self) -> bool {
        self.flags.contains(CursorFlags::AWAIT_DATA)
    }
}

/// Options for an `aggregate` command that opens a cursor.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct AggregateOptions {
    /// The number of documents the server returns per batch.
    pub batch_size: Option<u32>,

    /// A collation to apply to string comparisons in the pipeline.
    pub collation: Option<Collation>,

    /// The server-side time bound on the aggregation.
    pub max_time: Option<Duration>,

    /// For change-stream aggregations, how long a getMore may await new
    /// events.
    pub max_await_time: Option<Duration>,

    /// The read concern of the aggregation.
    pub read_concern: Option<ReadConcern>,

    /// The criteria used to select a server for the aggregation.
    pub selection_criteria: Option<SelectionCriteria>,

    /// An arbitrary value attached to the command.
    pub comment: Option<Bson>,
}
