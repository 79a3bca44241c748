use bson::Document;

use crate::{
    cursor::CursorSpecification,
    error::{Error, Result},
    namespace::Namespace,
    operation::{aggregate, Command, CommandResponse, Operation},
    options::CursorOptions,
    sdam::ServerDescription,
    selection_criteria::SelectionCriteria,
};

/// Runs an arbitrary caller-supplied command that opens a cursor, e.g.
/// `listCollections` or a raw `aggregate`.
#[derive(Debug)]
pub(crate) struct RunCursorCommand {
    db: String,
    body: Document,
    options: CursorOptions,
}

impl RunCursorCommand {
    pub(crate) fn new(db: impl Into<String>, body: Document, options: CursorOptions) -> Result<Self> {
        if body.is_empty() {
            return Err(Error::invalid_argument(
                "cursor commands must have at least one element",
            ));
        }
        Ok(Self {
            db: db.into(),
            body,
            options,
        })
    }
}

impl Operation for RunCursorCommand {
    type O = CursorSpecification;

    fn name(&self) -> &str {
        // By convention the first element of a command document names it.
        self.body
            .keys()
            .next()
            .map(String::as_str)
            .unwrap_or_default()
    }

    fn build(&self, _description: &ServerDescription) -> Result<Command> {
        Ok(Command::new(self.name(), self.db.clone(), self.body.clone()))
    }

    fn handle_response(
        &self,
        response: CommandResponse,
        _description: &ServerDescription,
    ) -> Result<Self::O> {
        aggregate::handle_cursor_response(
            response,
            Namespace::new(self.db.clone(), format!("$cmd.{}", self.name())),
            self.options.batch_size,
            self.options.max_await_time,
            self.options.comment.clone(),
            self.options.is_await_data(),
        )
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.options.selection_criteria.as_ref()
    }
}
