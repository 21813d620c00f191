//! Seam towards the session: host map, load-balancing policy, token map,
//! schema metadata store, and lifecycle notifications.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;

use crate::cluster::host::{CassandraVersion, Host};
use crate::cluster::query_plan::QueryPlan;
use crate::errors::ControlConnectionError;
use crate::frame::response::ResultSet;
use crate::protocol::ProtocolVersion;

/// Control-channel settings sourced from the session configuration.
#[derive(Clone, Debug)]
pub struct ControlConnectionConfig {
    /// Protocol version proposed on the first connect attempt; negotiation
    /// walks down from here.
    pub protocol_version: ProtocolVersion,
    /// Whether schema metadata is kept synchronized. When disabled, only
    /// keyspace data is refreshed (the token map still needs it) and only
    /// if `token_aware_routing` is set.
    pub use_schema: bool,
    /// Whether token-aware routing is enabled; adds `partitioner` and
    /// `tokens` to the host queries and feeds the session's token map.
    pub token_aware_routing: bool,
    /// Per-request timeout enforced on every control query.
    pub request_timeout: Duration,
}

impl Default for ControlConnectionConfig {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::default(),
            use_schema: true,
            token_aware_routing: true,
            request_timeout: Duration::from_secs(12),
        }
    }
}

/// The session as seen by the control channel.
///
/// Implementations own the host map, the load-balancing policy, the token
/// map, and the schema metadata store. All methods are synchronous and are
/// called from the control channel's worker task; implementations that
/// share state with other threads must synchronize internally.
pub trait Session: Send + Sync + 'static {
    /// Snapshot of the current host map, used to build the startup query
    /// plan. Taken before any other task can observe the session, so no
    /// locking is required for the initial snapshot.
    fn hosts_snapshot(&self) -> Vec<Arc<Host>>;

    fn get_host(&self, address: SocketAddr) -> Option<Arc<Host>>;

    /// Inserts a new host into the host map and returns it. The host
    /// starts in the `was_just_added` state.
    fn add_host(&self, address: SocketAddr) -> Arc<Host>;

    /// The generation counter hosts are stamped with during a hosts
    /// refresh.
    fn current_host_mark(&self) -> u64;

    /// Removes hosts whose mark did not advance to the current one (they
    /// are no longer reported by the cluster) and advances the generation.
    fn purge_hosts(&self, is_initial_connection: bool);

    /// A fresh query plan from the load-balancing policy, considering all
    /// hosts known at this point.
    fn new_query_plan(&self) -> Box<dyn QueryPlan>;

    /// The session's random source, if it has one; used to pick the
    /// startup plan offset.
    fn rng(&self) -> Option<Box<dyn RngCore + Send>>;

    /// A host discovered after the initial load has had its node info
    /// applied.
    fn on_add(&self, host: &Arc<Host>);
    fn on_remove(&self, host: &Arc<Host>);
    /// Notification only; the control channel flips the host's liveness
    /// flag itself before calling these.
    fn on_up(&self, host: &Arc<Host>);
    fn on_down(&self, host: &Arc<Host>);

    /// Rack or datacenter of a known host changed: the policy is told to
    /// logically remove the host before the change and re-add it after, so
    /// its topology partitioning stays consistent.
    fn load_balancing_add(&self, host: &Arc<Host>);
    fn load_balancing_remove(&self, host: &Arc<Host>);

    /// The initial hosts (and, if enabled, schema) load completed.
    fn on_control_connection_ready(&self);

    /// A fatal error occurred while establishing the initial connection.
    fn on_control_connection_error(&self, error: ControlConnectionError);

    fn metadata(&self) -> &dyn MetadataStore;

    /// Initializes the token map with the cluster's partitioner. Returns
    /// `false` if it was already initialized.
    fn token_map_init(&self, partitioner: &str) -> bool;
    /// A full hosts refresh is starting; token ownership will be restated.
    fn token_map_hosts_cleared(&self);
    fn token_map_host_add(&self, host: &Arc<Host>, tokens: &[String]);
    fn token_map_host_update(&self, host: &Arc<Host>, tokens: &[String]);
    fn token_map_host_remove(&self, host: &Arc<Host>);
    fn token_map_keyspaces_add(&self, version: CassandraVersion, keyspaces: &ResultSet);
    fn token_map_keyspaces_update(&self, version: CassandraVersion, keyspaces: &ResultSet);
}

/// The session's schema metadata store.
///
/// The store is double-buffered: a full schema refresh clears and rebuilds
/// the back buffer, then atomically publishes it, so readers never observe
/// a partial rebuild. Targeted updates go to the front buffer directly and
/// must be idempotent in the last-writer-wins sense, keyed by
/// (keyspace, name).
pub trait MetadataStore: Send + Sync {
    fn clear_and_update_back(&self, version: CassandraVersion);
    fn update_keyspaces(&self, version: CassandraVersion, result: &ResultSet);
    fn update_tables(&self, version: CassandraVersion, result: &ResultSet);
    fn update_views(&self, version: CassandraVersion, result: &ResultSet);
    fn update_columns(&self, version: CassandraVersion, result: &ResultSet);
    fn update_indexes(&self, version: CassandraVersion, result: &ResultSet);
    fn update_user_types(&self, version: CassandraVersion, result: &ResultSet);
    fn update_functions(&self, version: CassandraVersion, result: &ResultSet);
    fn update_aggregates(&self, version: CassandraVersion, result: &ResultSet);
    fn drop_keyspace(&self, keyspace: &str);
    fn drop_table_or_view(&self, keyspace: &str, name: &str);
    fn drop_user_type(&self, keyspace: &str, name: &str);
    /// `full_name` is the signature-qualified name produced by
    /// [`full_function_name`].
    fn drop_function(&self, keyspace: &str, full_name: &str);
    fn drop_aggregate(&self, keyspace: &str, full_name: &str);
    fn swap_to_back_and_update_front(&self);
}

/// Signature-qualified function name, e.g. `avg(int,int)`. Functions and
/// aggregates are keyed by it because CQL allows overloads.
pub fn full_function_name(name: &str, arg_types: &[String]) -> String {
    format!("{}({})", name, arg_types.join(","))
}
