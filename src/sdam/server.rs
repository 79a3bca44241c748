use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use bson::Document;

use crate::{
    error::Result,
    operation::{Command, CommandResponse, Operation},
    sdam::ServerDescription,
    session::ClientSession,
    BoxFuture,
};

/// Performs a single command round trip against one server.
///
/// This is the seam between the engine and the embedding driver's connection
/// layer. An implementation checks a connection out of its pool, writes the
/// command, reads the reply document, and returns the connection on every
/// exit path. Errors should be surfaced as [`ErrorKind::Io`] for transport
/// failures; replies with `ok: 0` are returned as plain documents and
/// classified here.
///
/// [`ErrorKind::Io`]: crate::error::ErrorKind::Io
pub trait Transport: Send + Sync + 'static {
    /// Execute one command round trip, returning the raw reply document.
    fn send_command<'a>(&'a self, command: Command) -> BoxFuture<'a, Result<Document>>;
}

/// A handle to a single selected server.
///
/// Wraps the transport with the bookkeeping every operation needs: an
/// in-flight operation count (used by selection layers for fairness and by
/// observability), session propagation, conversion of `ok: 0` replies into
/// command errors, and stamping the server's wire version onto outgoing
/// errors so resumability can be decided downstream.
#[derive(Debug)]
pub struct ServerHandle {
    description: ServerDescription,
    transport: Arc<dyn Transport>,
    operation_count: AtomicU32,
}

impl std::fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish()
    }
}

impl ServerHandle {
    /// Create a handle from a server description and its transport.
    pub fn new(description: ServerDescription, transport: Arc<dyn Transport>) -> Self {
        Self {
            description,
            transport,
            operation_count: AtomicU32::new(0),
        }
    }

    /// The description of the underlying server.
    pub fn description(&self) -> &ServerDescription {
        &self.description
    }

    /// The number of operations currently executing against this server.
    pub fn operation_count(&self) -> u32 {
        self.operation_count.load(Ordering::SeqCst)
    }

    /// Run one operation against this server.
    ///
    /// The operation count is held for the duration of the round trip. Every
    /// error leaving this method carries the server's maximum wire version.
    pub(crate) async fn execute<Op: Operation + ?Sized>(
        &self,
        op: &Op,
        session: Option<&ClientSession>,
    ) -> Result<Op::O> {
        let wire_version = self.description.max_wire_version;
        let result = async {
            let mut command = op.build(&self.description)?;
            if let Some(session) = session {
                command.body.insert("lsid", session.id().clone());
            }

            self.operation_count.fetch_add(1, Ordering::SeqCst);
            let reply = self.transport.send_command(command).await;
            self.operation_count.fetch_sub(1, Ordering::SeqCst);

            let response = CommandResponse::new(reply?);
            response.validate()?;
            op.handle_response(response, &self.description)
        }
        .await;

        result.map_err(|e| e.with_wire_version(wire_version))
    }
}
