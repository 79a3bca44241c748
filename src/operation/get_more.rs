use std::collections::VecDeque;

use bson::{doc, Document};
use serde::Deserialize;

use crate::{
    change_stream::event::ResumeToken,
    cursor::CursorInformation,
    error::Result,
    namespace::Namespace,
    operation::{duration_to_millis, Command, CommandResponse, Operation},
    sdam::{ServerDescription, GET_MORE_COMMENT_MIN_WIRE_VERSION},
    session::ClusterTime,
};

#[derive(Debug)]
pub(crate) struct GetMore {
    info: CursorInformation,
}

impl GetMore {
    pub(crate) fn new(info: CursorInformation) -> Self {
        Self { info }
    }
}

impl Operation for GetMore {
    type O = GetMoreResult;

    fn name(&self) -> &str {
        "getMore"
    }

    fn build(&self, description: &ServerDescription) -> Result<Command> {
        let mut body = doc! {
            "getMore": self.info.id,
            "collection": self.info.ns.coll.clone(),
        };

        if let Some(batch_size) = self.info.batch_size {
            if batch_size != 0 {
                body.insert("batchSize", i64::from(batch_size));
            }
        }

        // maxTimeMS is only valid on a getMore against an awaitData cursor.
        if self.info.await_data {
            if let Some(max_time) = self.info.max_time {
                body.insert("maxTimeMS", duration_to_millis(max_time));
            }
        }

        if description.max_wire_version >= GET_MORE_COMMENT_MIN_WIRE_VERSION {
            if let Some(ref comment) = self.info.comment {
                body.insert("comment", comment.clone());
            }
        }

        Ok(Command::new(self.name(), self.info.ns.db.clone(), body))
    }

    fn handle_response(
        &self,
        response: CommandResponse,
        _description: &ServerDescription,
    ) -> Result<Self::O> {
        let cluster_time = response.cluster_time();
        let body: GetMoreResponseBody = response.body()?;

        Ok(GetMoreResult {
            exhausted: body.cursor.id == 0,
            id: body.cursor.id,
            ns: body.cursor.ns,
            batch: body.cursor.next_batch.into(),
            post_batch_resume_token: body
                .cursor
                .post_batch_resume_token
                .map(ResumeToken::from_document),
            cluster_time,
        })
    }
}

/// The result of one `getMore` round trip.
#[derive(Debug)]
pub(crate) struct GetMoreResult {
    pub(crate) id: i64,
    pub(crate) ns: Namespace,
    pub(crate) batch: VecDeque<Document>,
    pub(crate) post_batch_resume_token: Option<ResumeToken>,
    pub(crate) exhausted: bool,
    pub(crate) cluster_time: Option<ClusterTime>,
}

#[derive(Debug, Deserialize)]
struct GetMoreResponseBody {
    cursor: NextBatchBody,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NextBatchBody {
    id: i64,
    ns: Namespace,
    #[serde(default)]
    next_batch: Vec<Document>,
    post_batch_resume_token: Option<Document>,
}
