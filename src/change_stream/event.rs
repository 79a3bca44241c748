//! Contains the types of documents a change stream delivers.

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};

use crate::namespace::Namespace;

/// An opaque token marking a position in a change stream.
///
/// Passing the token of a previously seen event back through the
/// `resume_after` or `start_after` options continues the stream from just
/// past that event. Tokens are server-generated; nothing about their
/// contents is part of this crate's contract.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ResumeToken(pub(crate) Bson);

impl ResumeToken {
    pub(crate) fn from_document(doc: Document) -> Self {
        Self(Bson::Document(doc))
    }

    pub(crate) fn from_bson(bson: Bson) -> Self {
        Self(bson)
    }

    /// The raw BSON value of this token.
    pub fn as_bson(&self) -> &Bson {
        &self.0
    }
}

/// A single change to a watched namespace.
///
/// See the server's [change events documentation](https://www.mongodb.com/docs/manual/reference/change-events/)
/// for the exact shape of each operation type.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ChangeStreamEvent {
    /// The resume token for the position just past this event. Absence is a
    /// protocol violation and closes the stream.
    #[serde(rename = "_id")]
    pub id: ResumeToken,

    /// The kind of write this event describes.
    pub operation_type: OperationType,

    /// Where the event occurred. Absent for some deployment-level events.
    pub ns: Option<ChangeStreamEventSource>,

    /// The new name of the `ns` collection. Only present for
    /// [`OperationType::Rename`].
    pub to: Option<Namespace>,

    /// For unsharded collections, a single `_id` field identifying the
    /// changed document; for sharded collections, the shard key components
    /// followed by the `_id` when it is not part of the key.
    pub document_key: Option<Document>,

    /// Which fields changed. Only present for [`OperationType::Update`].
    pub update_description: Option<UpdateDescription>,

    /// The inserted or replacing document, always present for inserts and
    /// replaces. For updates, present only when the stream was opened with
    /// `full_document: UpdateLookup` and the document still existed at
    /// lookup time.
    pub full_document: Option<Document>,
}

/// Describes which fields have been updated or removed from a document.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct UpdateDescription {
    /// Names of changed fields mapped to their new values.
    pub updated_fields: Document,

    /// Names of fields removed from the document.
    pub removed_fields: Vec<String>,
}

/// The operation type represented in a given change notification.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum OperationType {
    /// See [insert-event](https://www.mongodb.com/docs/manual/reference/change-events/#insert-event).
    Insert,

    /// See [update-event](https://www.mongodb.com/docs/manual/reference/change-events/#update-event).
    Update,

    /// See [replace-event](https://www.mongodb.com/docs/manual/reference/change-events/#replace-event).
    Replace,

    /// See [delete-event](https://www.mongodb.com/docs/manual/reference/change-events/#delete-event).
    Delete,

    /// See [drop-event](https://www.mongodb.com/docs/manual/reference/change-events/#drop-event).
    Drop,

    /// See [rename-event](https://www.mongodb.com/docs/manual/reference/change-events/#rename-event).
    Rename,

    /// See [dropdatabase-event](https://www.mongodb.com/docs/manual/reference/change-events/#dropdatabase-event).
    DropDatabase,

    /// See [invalidate-event](https://www.mongodb.com/docs/manual/reference/change-events/#invalidate-event).
    Invalidate,
}

/// Identifies the collection or database where an event occurred.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
#[non_exhaustive]
pub enum ChangeStreamEventSource {
    /// The event happened in a specific collection.
    Namespace(Namespace),

    /// The event happened at database scope, e.g. a `dropDatabase`.
    #[non_exhaustive]
    Database {
        /// The name of the database.
        db: String,
    },
}
