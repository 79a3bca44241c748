use bson::doc;

use crate::{
    error::Result,
    namespace::Namespace,
    operation::{Command, CommandResponse, Operation},
    sdam::ServerDescription,
};

/// Best-effort teardown of a server-side cursor. Callers ignore failures.
#[derive(Debug)]
pub(crate) struct KillCursors {
    ns: Namespace,
    cursor_id: i64,
}

impl KillCursors {
    pub(crate) fn new(ns: Namespace, cursor_id: i64) -> Self {
        Self { ns, cursor_id }
    }
}

impl Operation for KillCursors {
    type O = ();

    fn name(&self) -> &str {
        "killCursors"
    }

    fn build(&self, _description: &ServerDescription) -> Result<Command> {
        let body = doc! {
            "killCursors": self.ns.coll.clone(),
            "cursors": [self.cursor_id],
        };
        Ok(Command::new(self.name(), self.ns.db.clone(), body))
    }

    fn handle_response(
        &self,
        _response: CommandResponse,
        _description: &ServerDescription,
    ) -> Result<Self::O> {
        Ok(())
    }
}
