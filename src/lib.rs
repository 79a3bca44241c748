//! `mongowatch` is the cursor and change-stream core of a driver for
//! MongoDB-compatible deployments. It owns the hard parts of watching a
//! collection, database, or whole cluster for changes: the cursor lifecycle
//! (initialize, getMore loop, drain, kill), the resume protocol that keeps a
//! change stream logically continuous across network and primary failures,
//! the resume-token cache, and the close/cancellation semantics under
//! concurrent use.
//!
//! The crate deliberately stops at the RPC boundary. Wire framing,
//! authentication, TLS, connection pooling, and topology monitoring are
//! supplied by the embedding driver through two traits:
//!
//! - [`Transport`](sdam::Transport) performs a single command round trip
//!   against one server;
//! - [`Topology`](sdam::Topology) answers connectivity and server-selection
//!   questions and hands out sessions.
//!
//! With those implemented, a change stream is one constructor away:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use mongowatch::{ChangeStream, Namespace};
//! # use mongowatch::change_stream::ChangeStreamTarget;
//! # async fn example(topology: Arc<dyn mongowatch::sdam::Topology>) -> mongowatch::error::Result<()> {
//! let target = ChangeStreamTarget::Collection(Namespace::new("inventory", "parts"));
//! let mut stream = ChangeStream::new(topology, target, Vec::new(), None)?;
//! while let Some(event) = stream.next().await? {
//!     println!("{:?} on {:?}", event.operation_type, event.ns);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Transient failures during iteration never reach the consumer: the engine
//! classifies them, waits for the topology to report a connection, and
//! rebuilds its cursor from the most recently cached resume token. Only
//! terminal errors (authentication, compatibility, a rotated-away oplog
//! position) are surfaced.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(clippy::cast_possible_truncation)]
#![warn(clippy::cast_possible_wrap)]

pub mod change_stream;
mod collation;
mod concern;
pub mod cursor;
pub mod error;
pub mod event;
mod namespace;
mod operation;
pub mod options;
pub mod sdam;
mod selection_criteria;
mod session;
#[cfg(test)]
mod test;

pub use crate::{
    change_stream::ChangeStream,
    cursor::Cursor,
    namespace::Namespace,
    session::{ClientSession, ClusterTime},
};

/// A boxed future.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
