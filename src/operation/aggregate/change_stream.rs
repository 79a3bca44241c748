use bson::{doc, Document};

use crate::{
    change_stream::{options::ChangeStreamOptions, ChangeStreamTarget},
    cursor::CursorSpecification,
    error::Result,
    operation::{append_options, Command, CommandResponse, Operation},
    sdam::ServerDescription,
    selection_criteria::SelectionCriteria,
};

use super::Aggregate;

/// An `aggregate` whose pipeline begins with a `$changeStream` stage.
///
/// The stage document is the serialized subset of the change stream options
/// recognized by the server; everything else (batch size, read concern,
/// collation, comment) travels at the command level through the wrapped
/// [`Aggregate`].
#[derive(Debug)]
pub(crate) struct ChangeStreamAggregate(Aggregate);

impl ChangeStreamAggregate {
    pub(crate) fn new(
        target: &ChangeStreamTarget,
        pipeline: &[Document],
        options: &Option<ChangeStreamOptions>,
    ) -> Result<Self> {
        let mut stage = Document::new();
        if let Some(options) = options.as_ref() {
            append_options(&mut stage, options)?;
        }
        if matches!(target, ChangeStreamTarget::Cluster) {
            stage.insert("allChangesForCluster", true);
        }

        let mut agg_pipeline = vec![doc! { "$changeStream": stage }];
        agg_pipeline.extend(pipeline.iter().cloned());
        Ok(Self(Aggregate::new(
            target.aggregate_target(),
            agg_pipeline,
            options.as_ref().map(|o| o.aggregate_options()),
        )))
    }
}

impl Operation for ChangeStreamAggregate {
    type O = CursorSpecification;

    fn name(&self) -> &str {
        self.0.name()
    }

    fn build(&self, description: &ServerDescription) -> Result<Command> {
        self.0.build(description)
    }

    fn handle_response(
        &self,
        response: CommandResponse,
        description: &ServerDescription,
    ) -> Result<Self::O> {
        self.0.handle_response(response, description)
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.0.selection_criteria()
    }
}
