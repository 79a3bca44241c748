//! Read-only topology surface and per-server command execution.
//!
//! Discovery and monitoring live in the embedding driver; this module only
//! defines what the cursor and change-stream engines need to observe:
//! whether the deployment is reachable, how to pick a server, and how to run
//! one command against it.

mod description;
mod server;
mod topology;

pub use description::{ServerAddress, ServerDescription, ServerType};
pub use server::{ServerHandle, Transport};
pub use topology::Topology;

pub(crate) use description::{
    GET_MORE_COMMENT_MIN_WIRE_VERSION, START_AT_OPERATION_TIME_MIN_WIRE_VERSION,
};
pub(crate) use topology::wait_for_connected;
