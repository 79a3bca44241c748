//! Client sessions and cluster-time tracking.

use std::cmp::Ordering;

use bson::{doc, oid::ObjectId, Document, Timestamp};
use serde::{Deserialize, Serialize};

/// The latest cluster time seen by a session or topology.
///
/// Returned on every command response; greater values supersede smaller
/// ones. Ordering is by timestamp only; the signature authenticates the
/// value but does not participate in comparisons.
#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ClusterTime {
    /// The logical timestamp of this cluster time.
    pub cluster_time: Timestamp,

    /// A server-generated signature over the timestamp.
    pub signature: Document,
}

impl PartialOrd for ClusterTime {
    fn partial_cmp(&self, other: &ClusterTime) -> Option<Ordering> {
        let lhs = (self.cluster_time.time, self.cluster_time.increment);
        let rhs = (other.cluster_time.time, other.cluster_time.increment);
        Some(lhs.cmp(&rhs))
    }
}

/// A logical session with the deployment.
///
/// Sessions created with `implicit == true` are owned by the cursor that
/// acquired them and are ended exactly once, during that cursor's cleanup.
/// Explicit sessions belong to the caller and are never ended by the engine.
#[derive(Clone, Debug)]
pub struct ClientSession {
    id: Document,
    implicit: bool,
    cluster_time: Option<ClusterTime>,
}

impl ClientSession {
    /// Start a new session with a fresh logical session id.
    pub fn new(implicit: bool) -> Self {
        Self {
            id: doc! { "id": ObjectId::new() },
            implicit,
            cluster_time: None,
        }
    }

    /// The logical session id (`lsid`) attached to commands run with this
    /// session.
    pub fn id(&self) -> &Document {
        &self.id
    }

    /// Whether this session was created by the engine rather than the
    /// caller.
    pub fn is_implicit(&self) -> bool {
        self.implicit
    }

    /// The highest cluster time seen by this session, if any.
    pub fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    /// Set the cluster time of this session to the given value if it is
    /// greater than the current one.
    pub fn advance_cluster_time(&mut self, to: &ClusterTime) {
        if self.cluster_time().map_or(true, |current| current < to) {
            self.cluster_time = Some(to.clone());
        }
    }
}
