use std::fmt;

use serde::{Deserialize, Serialize};

/// The minimum wire version at which the server accepts
/// `startAtOperationTime` in a `$changeStream` stage (server 4.0).
pub(crate) const START_AT_OPERATION_TIME_MIN_WIRE_VERSION: i32 = 7;

/// The minimum wire version at which `getMore` accepts a `comment` field.
pub(crate) const GET_MORE_COMMENT_MIN_WIRE_VERSION: i32 = 9;

/// The hostname and port of a server.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ServerAddress {
    /// A TCP/IP host and port combination.
    #[non_exhaustive]
    Tcp {
        /// The hostname.
        host: String,

        /// The port. The default port 27017 is used when `None`.
        port: Option<u16>,
    },
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::Tcp {
            host: "localhost".into(),
            port: None,
        }
    }
}

impl ServerAddress {
    /// The port of this address, using the default when unspecified.
    pub fn port(&self) -> u16 {
        match self {
            Self::Tcp { port, .. } => port.unwrap_or(27017),
        }
    }

    /// The hostname of this address.
    pub fn host(&self) -> &str {
        match self {
            Self::Tcp { host, .. } => host.as_str(),
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "{}:{}", host, port.unwrap_or(27017)),
        }
    }
}

/// The type of a server as reported by the most recent handshake.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ServerType {
    /// A single, standalone server.
    Standalone,

    /// A router to a sharded cluster.
    Mongos,

    /// The primary of a replica set.
    RsPrimary,

    /// A secondary of a replica set.
    RsSecondary,

    /// A non-data-bearing replica set member.
    RsArbiter,

    /// A replica set member in some other state.
    RsOther,

    /// A load balancer fronting the deployment.
    LoadBalancer,

    /// A server whose type is not yet known.
    Unknown,
}

/// A read-only description of a server, as supplied by the monitoring layer.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ServerDescription {
    /// The address of this server.
    pub address: ServerAddress,

    /// The type of this server.
    pub server_type: ServerType,

    /// The maximum wire version the server supports.
    pub max_wire_version: i32,
}

impl ServerDescription {
    /// Create a description from its parts.
    pub fn new(address: ServerAddress, server_type: ServerType, max_wire_version: i32) -> Self {
        Self {
            address,
            server_type,
            max_wire_version,
        }
    }
}
