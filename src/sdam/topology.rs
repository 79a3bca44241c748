use std::{sync::Arc, time::Duration};

use tokio::time::Instant;

use crate::{
    error::{ErrorKind, Result},
    sdam::ServerHandle,
    selection_criteria::SelectionCriteria,
    session::{ClientSession, ClusterTime},
    BoxFuture,
};

/// Read-only facade over the embedding driver's discovery and monitoring
/// layer.
///
/// The engine only ever asks a topology five kinds of question: are we
/// connected, give me a server, do sessions work here, start a session, and
/// what is the current cluster time. How those answers are produced (by
/// heartbeats, SRV polling, or load-balancer handshakes) is entirely the
/// implementation's business.
pub trait Topology: Send + Sync + 'static {
    /// Whether the topology currently has a usable connection to the
    /// deployment. Polled during the resume wait loop.
    fn is_connected(&self) -> bool;

    /// Select a server suitable for the given criteria.
    ///
    /// Selection failures (timeouts, no suitable server) surface unchanged
    /// as [`ErrorKind::ServerSelection`] errors.
    fn select_server<'a>(
        &'a self,
        criteria: Option<&'a SelectionCriteria>,
    ) -> BoxFuture<'a, Result<Arc<ServerHandle>>>;

    /// Whether the deployment is known to support sessions.
    fn has_session_support(&self) -> bool;

    /// Whether session support is still unknown and must be established by
    /// selecting a server before a session may be started.
    fn should_check_session_support(&self) -> bool;

    /// Start a new session. Implicit sessions are owned (and ended) by the
    /// cursor that requested them; explicit sessions belong to the caller.
    fn start_session(&self, implicit: bool) -> ClientSession;

    /// Whether the deployment is behind a load balancer. Changes cursor
    /// cleanup behavior: see [`crate::cursor::Cursor`].
    fn load_balanced(&self) -> bool;

    /// The highest cluster time observed so far, if any.
    fn cluster_time(&self) -> Option<ClusterTime>;

    /// Advance the topology's cluster time. Called with the cluster time of
    /// every integrated command response; implementations must keep the
    /// maximum.
    fn advance_cluster_time(&self, to: &ClusterTime);
}

/// Poll `topology.is_connected()` on a fixed heartbeat until it reports a
/// connection or the timeout elapses.
///
/// This is the wait loop a resuming change stream parks in while the
/// monitoring layer re-establishes contact with the deployment. A timeout
/// produces a `ServerSelection` error, which is never resumable.
pub(crate) async fn wait_for_connected(
    topology: &Arc<dyn Topology>,
    heartbeat: Duration,
    timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while !topology.is_connected() {
        let now = Instant::now();
        if now >= deadline {
            return Err(ErrorKind::ServerSelection {
                message: format!(
                    "timed out after {:?} waiting for the topology to reconnect",
                    timeout
                ),
            }
            .into());
        }
        tokio::time::sleep(heartbeat.min(deadline - now)).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::mock::MockTopology;

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_when_disconnected() {
        let topology: Arc<dyn Topology> = MockTopology::disconnected();
        let result = wait_for_connected(
            &topology,
            Duration::from_millis(500),
            Duration::from_secs(30),
        )
        .await;
        let err = result.unwrap_err();
        assert!(matches!(*err.kind, ErrorKind::ServerSelection { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_returns_once_connected() {
        let mock = MockTopology::disconnected();
        let topology: Arc<dyn Topology> = mock.clone();

        let waiter = tokio::spawn({
            let topology = topology.clone();
            async move {
                wait_for_connected(
                    &topology,
                    Duration::from_millis(500),
                    Duration::from_secs(30),
                )
                .await
            }
        });

        tokio::time::sleep(Duration::from_millis(1600)).await;
        mock.set_connected(true);
        tokio::time::sleep(Duration::from_millis(600)).await;

        waiter.await.unwrap().unwrap();
    }
}
