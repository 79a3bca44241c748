use std::{collections::HashMap, sync::Arc};

use derive_where::derive_where;
use serde::{Deserialize, Serialize};

use crate::sdam::ServerDescription;

/// Describes which servers are suitable for a given operation.
#[derive(Clone)]
#[derive_where(Debug)]
pub enum SelectionCriteria {
    /// A read preference that describes the suitable servers based on the
    /// server type and server tags.
    ///
    /// See the documentation [here](https://www.mongodb.com/docs/manual/core/read-preference/) for more details.
    ReadPreference(ReadPreference),

    /// A predicate used to filter servers that are considered suitable. A
    /// `server` will be considered suitable by a `predicate` if
    /// `predicate(server)` returns true.
    Predicate(#[derive_where(skip)] Predicate),
}

impl PartialEq for SelectionCriteria {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::ReadPreference(r1), Self::ReadPreference(r2)) => r1 == r2,
            (Self::Predicate(p1), Self::Predicate(p2)) => Arc::ptr_eq(p1, p2),
            _ => false,
        }
    }
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(read_pref: ReadPreference) -> Self {
        Self::ReadPreference(read_pref)
    }
}

/// A predicate used to filter servers that are considered suitable.
pub type Predicate = Arc<dyn Send + Sync + Fn(&ServerDescription) -> bool>;

/// Specifies how operations should be routed to members of a replica set.
///
/// If applicable, `tag_sets` can be used to target specific nodes.
///
/// See the [MongoDB docs](https://www.mongodb.com/docs/manual/core/read-preference) for more details.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "mode")]
#[non_exhaustive]
pub enum ReadPreference {
    /// Only route this operation to the primary.
    Primary,

    /// Only route this operation to a secondary.
    #[non_exhaustive]
    Secondary {
        /// Tag sets constraining eligible servers.
        #[serde(skip_serializing_if = "Option::is_none")]
        tag_sets: Option<Vec<TagSet>>,
    },

    /// Route this operation to the primary if it's available, but fall back
    /// to the secondaries if not.
    #[non_exhaustive]
    PrimaryPreferred {
        /// Tag sets constraining eligible servers.
        #[serde(skip_serializing_if = "Option::is_none")]
        tag_sets: Option<Vec<TagSet>>,
    },

    /// Route this operation to a secondary if one is available, but fall
    /// back to the primary if not.
    #[non_exhaustive]
    SecondaryPreferred {
        /// Tag sets constraining eligible servers.
        #[serde(skip_serializing_if = "Option::is_none")]
        tag_sets: Option<Vec<TagSet>>,
    },

    /// Route this operation to the node with the least network latency
    /// regardless of whether it's the primary or a secondary.
    #[non_exhaustive]
    Nearest {
        /// Tag sets constraining eligible servers.
        #[serde(skip_serializing_if = "Option::is_none")]
        tag_sets: Option<Vec<TagSet>>,
    },
}

/// A single tag set, mapping tag names to values.
pub type TagSet = HashMap<String, String>;
