mod change_stream;

use bson::{doc, Bson, Document};
use serde::Deserialize;

use crate::{
    cursor::CursorSpecification,
    error::Result,
    namespace::Namespace,
    operation::{duration_to_millis, Command, CommandResponse, CursorInfo, Operation},
    options::AggregateOptions,
    sdam::ServerDescription,
    selection_criteria::SelectionCriteria,
};

pub(crate) use change_stream::ChangeStreamAggregate;

/// The target of an `aggregate` command: a collection, or a whole database
/// (`aggregate: 1`).
#[derive(Clone, Debug)]
pub(crate) enum AggregateTarget {
    Database(String),
    Collection(Namespace),
}

impl AggregateTarget {
    pub(crate) fn db_name(&self) -> &str {
        match self {
            Self::Database(db) => db.as_str(),
            Self::Collection(ns) => ns.db.as_str(),
        }
    }

    fn aggregate_value(&self) -> Bson {
        match self {
            Self::Database(_) => Bson::Int32(1),
            Self::Collection(ns) => Bson::String(ns.coll.clone()),
        }
    }

    fn default_namespace(&self) -> Namespace {
        match self {
            Self::Database(db) => Namespace::new(db.clone(), "$cmd.aggregate"),
            Self::Collection(ns) => ns.clone(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Aggregate {
    target: AggregateTarget,
    pipeline: Vec<Document>,
    options: Option<AggregateOptions>,
}

impl Aggregate {
    pub(crate) fn new(
        target: AggregateTarget,
        pipeline: impl IntoIterator<Item = Document>,
        options: Option<AggregateOptions>,
    ) -> Self {
        Self {
            target,
            pipeline: pipeline.into_iter().collect(),
            options,
        }
    }
}

impl Operation for Aggregate {
    type O = CursorSpecification;

    fn name(&self) -> &str {
        "aggregate"
    }

    fn build(&self, _description: &ServerDescription) -> Result<Command> {
        let mut cursor = Document::new();
        if let Some(batch_size) = self.options.as_ref().and_then(|o| o.batch_size) {
            cursor.insert("batchSize", i64::from(batch_size));
        }

        let mut body = doc! {
            "aggregate": self.target.aggregate_value(),
            "pipeline": self.pipeline.iter().cloned().map(Bson::Document).collect::<Vec<_>>(),
            "cursor": cursor,
        };

        if let Some(options) = self.options.as_ref() {
            if let Some(max_time) = options.max_time {
                body.insert("maxTimeMS", duration_to_millis(max_time));
            }
            if let Some(ref collation) = options.collation {
                body.insert("collation", bson::to_bson(collation)?);
            }
            if let Some(ref read_concern) = options.read_concern {
                body.insert("readConcern", bson::to_bson(read_concern)?);
            }
            if let Some(ref comment) = options.comment {
                body.insert("comment", comment.clone());
            }
        }

        Ok(Command::new(self.name(), self.target.db_name(), body))
    }

    fn handle_response(
        &self,
        response: CommandResponse,
        _description: &ServerDescription,
    ) -> Result<Self::O> {
        let options = self.options.as_ref();
        handle_cursor_response(
            response,
            self.target.default_namespace(),
            options.and_then(|o| o.batch_size),
            options.and_then(|o| o.max_await_time),
            options.and_then(|o| o.comment.clone()),
            options.map_or(false, |o| o.max_await_time.is_some()),
        )
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.options
            .as_ref()
            .and_then(|o| o.selection_criteria.as_ref())
    }
}

#[derive(Debug, Deserialize)]
struct CursorResponseBody {
    cursor: Option<CursorInfo>,
}

/// Turn a cursor-opening reply into a [`CursorSpecification`].
///
/// A reply with no `cursor` subdocument (e.g. an explain) is represented as
/// an already-exhausted cursor whose buffer holds the whole reply.
pub(super) fn handle_cursor_response(
    response: CommandResponse,
    default_namespace: Namespace,
    batch_size: Option<u32>,
    max_time: Option<std::time::Duration>,
    comment: Option<Bson>,
    await_data: bool,
) -> Result<CursorSpecification> {
    let operation_time = response.operation_time();
    let cluster_time = response.cluster_time();
    let body: CursorResponseBody = response.body()?;

    let info = match body.cursor {
        Some(info) => info,
        None => CursorInfo {
            id: 0,
            ns: default_namespace,
            first_batch: vec![response.raw().clone()],
            post_batch_resume_token: None,
        },
    };

    Ok(CursorSpecification::new(
        info,
        batch_size,
        max_time,
        comment,
        await_data,
        operation_time,
        cluster_time,
    ))
}
