//! Control channel of a Cassandra-compatible cluster client.
//!
//! A session keeps exactly one *control connection*: a dedicated,
//! long-lived connection used to read cluster metadata (topology and
//! schema) and to receive server-pushed cluster events. This crate
//! implements that subsystem:
//!
//! * connection establishment with protocol-version negotiation and
//!   failover across candidate hosts,
//! * the initial and incremental metadata refresh protocol over the
//!   `system`/`system_schema` tables, version-branched by the server
//!   release the connected host reports,
//! * translation of topology/status/schema events into targeted refreshes,
//! * reconnect scheduling after connection loss.
//!
//! The wire protocol and the session state (host map, load-balancing
//! policy, token map, schema metadata store) are collaborators behind the
//! [`transport`] and [`session`] trait seams; the control channel never
//! carries user traffic.
//!
//! The entry point is [`ControlConnection`](cluster::ControlConnection):
//! `connect()` establishes the channel and performs the initial load,
//! `run()` then drives it until `close()`.

pub mod cluster;
pub mod errors;
pub mod frame;
pub mod observability;
pub mod protocol;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_utils;

pub use cluster::{CassandraVersion, ControlConnection, ControlState, Host, QueryPlan};
pub use errors::ControlConnectionError;
pub use protocol::ProtocolVersion;
pub use session::{ControlConnectionConfig, MetadataStore, Session};
