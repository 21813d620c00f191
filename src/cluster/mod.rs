//! The control channel and the cluster view it maintains.

pub mod control_connection;
pub(crate) mod dispatcher;
pub mod host;
pub mod query_plan;
mod refresh;

pub use control_connection::{ControlConnection, ControlState};
pub use host::{CassandraVersion, Host};
pub use query_plan::QueryPlan;
