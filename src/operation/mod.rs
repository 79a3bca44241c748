//! Construction and response handling for the commands the engine issues.

mod aggregate;
mod get_more;
mod kill_cursors;
mod run_cursor_command;

use std::time::Duration;

use bson::{Bson, Document, Timestamp};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    error::{CommandError, Error, ErrorKind, Result},
    namespace::Namespace,
    sdam::ServerDescription,
    selection_criteria::SelectionCriteria,
    session::ClusterTime,
};

pub(crate) use aggregate::{AggregateTarget, ChangeStreamAggregate};
pub(crate) use get_more::{GetMore, GetMoreResult};
pub(crate) use kill_cursors::KillCursors;
pub(crate) use run_cursor_command::RunCursorCommand;

/// A command about to be sent to a server.
///
/// The transport is responsible for framing (`$db`, compression, checksums);
/// this type only carries the logical command.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Command {
    /// The name of the command, e.g. `"getMore"`.
    pub name: String,

    /// The database the command executes against.
    pub target_db: String,

    /// The body of the command.
    pub body: Document,
}

impl Command {
    pub(crate) fn new(
        name: impl Into<String>,
        target_db: impl Into<String>,
        body: Document,
    ) -> Self {
        Self {
            name: name.into(),
            target_db: target_db.into(),
            body,
        }
    }
}

/// A raw reply document together with the accessors operations need.
#[derive(Clone, Debug)]
pub(crate) struct CommandResponse {
    raw: Document,
}

impl CommandResponse {
    pub(crate) fn new(raw: Document) -> Self {
        Self { raw }
    }

    /// Returns an error when the reply reports command failure.
    pub(crate) fn validate(&self) -> Result<()> {
        match self.raw.get("ok").and_then(|ok| ok.as_f64_lossy()) {
            Some(ok) if ok == 1.0 => Ok(()),
            Some(_) => {
                let command_error: CommandError =
                    bson::from_document(self.raw.clone()).map_err(|e| {
                        Error::invalid_response(format!("malformed command failure: {}", e))
                    })?;
                let labels = match self.raw.get_array("errorLabels") {
                    Ok(labels) => labels
                        .iter()
                        .filter_map(|label| label.as_str().map(String::from))
                        .collect(),
                    Err(_) => Vec::new(),
                };
                Err(Error::new(ErrorKind::Command(command_error), Some(labels)))
            }
            None => Err(Error::invalid_response("reply is missing the `ok` field")),
        }
    }

    /// Deserialize the whole reply into the given type.
    pub(crate) fn body<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(bson::from_document(self.raw.clone())?)
    }

    pub(crate) fn raw(&self) -> &Document {
        &self.raw
    }

    /// The `$clusterTime` of the reply, if present.
    pub(crate) fn cluster_time(&self) -> Option<ClusterTime> {
        self.raw
            .get_document("$clusterTime")
            .ok()
            .and_then(|doc| bson::from_document(doc.clone()).ok())
    }

    /// The `operationTime` of the reply, if present.
    pub(crate) fn operation_time(&self) -> Option<Timestamp> {
        match self.raw.get("operationTime") {
            Some(Bson::Timestamp(ts)) => Some(*ts),
            _ => None,
        }
    }
}

/// A fully specified operation executable against a server.
pub(crate) trait Operation: Send + Sync {
    /// The output type of this operation.
    type O;

    /// The name of the command this operation sends, e.g. `"aggregate"`.
    fn name(&self) -> &str;

    /// Construct the command for the given server.
    fn build(&self, description: &ServerDescription) -> Result<Command>;

    /// Interpret the server's reply.
    fn handle_response(
        &self,
        response: CommandResponse,
        description: &ServerDescription,
    ) -> Result<Self::O>;

    /// The criteria used to select a server for this operation, if it has
    /// its own.
    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        None
    }
}

/// The `cursor` subdocument common to replies that open a cursor.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CursorInfo {
    pub(crate) id: i64,

    pub(crate) ns: Namespace,

    #[serde(default)]
    pub(crate) first_batch: Vec<Document>,

    pub(crate) post_batch_resume_token: Option<Document>,
}

/// Serialize the given options into the command body, skipping fields the
/// options type marks non-wire.
pub(crate) fn append_options<T: Serialize>(body: &mut Document, options: &T) -> Result<()> {
    let doc = bson::to_document(options)?;
    body.extend(doc);
    Ok(())
}

pub(crate) fn duration_to_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

trait BsonOkExt {
    fn as_f64_lossy(&self) -> Option<f64>;
}

impl BsonOkExt for Bson {
    // `ok` arrives as a double from mongod but as an int from some proxies.
    fn as_f64_lossy(&self) -> Option<f64> {
        match self {
            Bson::Double(v) => Some(*v),
            Bson::Int32(v) => Some(f64::from(*v)),
            Bson::Int64(v) => Some(*v as f64),
            _ => None,
        }
    }
}
