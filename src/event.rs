//! Event delivery for observing change-stream lifecycle activity.

use std::sync::Arc;

use bson::Document;

use crate::{change_stream::event::ResumeToken, error::Error, BoxFuture};

/// A destination for events. Allows implicit conversion via [`From`] for
/// concrete types for convenience:
///
/// ```rust
/// # use mongowatch::event::{EventHandler, StreamEvent};
/// let (tx, mut rx) = tokio::sync::mpsc::channel::<StreamEvent>(100);
/// let handler: EventHandler<StreamEvent> = tx.into();
/// ```
///
/// or explicit construction for `Fn` traits:
///
/// ```rust
/// # use mongowatch::event::{EventHandler, StreamEvent};
/// let handler = EventHandler::callback(|ev: StreamEvent| println!("{:?}", ev));
/// ```
#[derive(Clone)]
#[non_exhaustive]
pub enum EventHandler<T> {
    /// A callback.
    Callback(Arc<dyn Fn(T) + Sync + Send>),
    /// An async callback.
    AsyncCallback(Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Sync + Send>),
    /// A `tokio` channel sender.
    TokioMpsc(tokio::sync::mpsc::Sender<T>),
}

impl<T> std::fmt::Debug for EventHandler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EventHandler").finish()
    }
}

impl<T> From<tokio::sync::mpsc::Sender<T>> for EventHandler<T> {
    fn from(value: tokio::sync::mpsc::Sender<T>) -> Self {
        Self::TokioMpsc(value)
    }
}

impl<T: Send + Sync + 'static> EventHandler<T> {
    /// Construct a new event handler with a callback.
    pub fn callback(f: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self::Callback(Arc::new(f))
    }

    /// Construct a new event handler with an async callback.
    pub fn async_callback(f: impl Fn(T) -> BoxFuture<'static, ()> + Send + Sync + 'static) -> Self {
        Self::AsyncCallback(Arc::new(f))
    }

    pub(crate) fn handle(&self, event: T) {
        match self {
            Self::Callback(cb) => (cb)(event),
            Self::AsyncCallback(cb) => {
                let fut = (cb)(event);
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(fut);
                }
            }
            Self::TokioMpsc(sender) => {
                // Delivery is best-effort; a full observer queue must not
                // stall the stream.
                let _ = sender.try_send(event);
            }
        }
    }
}

/// A summary of one server batch response.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct BatchInfo {
    /// The server cursor id the batch belongs to. Zero once the server has
    /// closed the cursor.
    pub cursor_id: i64,

    /// The number of documents in the batch.
    pub batch_len: usize,
}

/// Lifecycle events emitted by a [`ChangeStream`](crate::ChangeStream).
///
/// Ordering guarantees: [`StreamEvent::ResumeTokenChanged`] precedes the
/// [`StreamEvent::Change`] carrying the same position; on natural shutdown
/// the last `Change` is followed by `End` and then `Close`; `Close` is
/// emitted at most once per stream.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum StreamEvent {
    /// The first server response for a cursor arrived.
    Init(BatchInfo),

    /// A subsequent batch response arrived.
    More(BatchInfo),

    /// Any server response arrived (emitted alongside `Init`/`More`).
    Response(BatchInfo),

    /// A change document was delivered to the consumer.
    Change(Document),

    /// The cached resume token advanced.
    ResumeTokenChanged(ResumeToken),

    /// The server ended the stream (e.g. an invalidate drained the cursor).
    End,

    /// The stream closed; no further events follow.
    Close,

    /// A terminal error was surfaced to the consumer.
    Error(Error),
}
