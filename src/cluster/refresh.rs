//! Metadata refresh: composes the version-appropriate system-table query
//! bundles, applies their results to the session, and resolves peer rows
//! into contact addresses.
//!
//! The `SELECT *` forms and the `WHERE key='local'` form are deliberate:
//! servers vary in which non-listed columns they return.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use crate::cluster::control_connection::{ControlConnection, ControlState};
use crate::cluster::dispatcher::{self, BundleResults, QueryBundle};
use crate::cluster::host::{CassandraVersion, Host};
use crate::errors::RefreshError;
use crate::frame::response::{CqlValue, ResultSet, Row};
use crate::session::{Session, full_function_name};
use crate::transport::{Connector, ControlTransport, Statement};

const SELECT_LOCAL: &str =
    "SELECT data_center, rack, release_version FROM system.local WHERE key='local'";
const SELECT_LOCAL_TOKENS: &str =
    "SELECT data_center, rack, release_version, partitioner, tokens FROM system.local WHERE key='local'";
const SELECT_PEERS: &str =
    "SELECT peer, data_center, rack, release_version, rpc_address FROM system.peers";
const SELECT_PEERS_TOKENS: &str =
    "SELECT peer, data_center, rack, release_version, rpc_address, tokens FROM system.peers";

const SELECT_KEYSPACES_20: &str = "SELECT * FROM system.schema_keyspaces";
const SELECT_COLUMN_FAMILIES_20: &str = "SELECT * FROM system.schema_columnfamilies";
const SELECT_COLUMNS_20: &str = "SELECT * FROM system.schema_columns";
const SELECT_USERTYPES_21: &str = "SELECT * FROM system.schema_usertypes";
const SELECT_FUNCTIONS_22: &str = "SELECT * FROM system.schema_functions";
const SELECT_AGGREGATES_22: &str = "SELECT * FROM system.schema_aggregates";

const SELECT_KEYSPACES_30: &str = "SELECT * FROM system_schema.keyspaces";
const SELECT_TABLES_30: &str = "SELECT * FROM system_schema.tables";
const SELECT_VIEWS_30: &str = "SELECT * FROM system_schema.views";
const SELECT_COLUMNS_30: &str = "SELECT * FROM system_schema.columns";
const SELECT_INDEXES_30: &str = "SELECT * FROM system_schema.indexes";
const SELECT_USERTYPES_30: &str = "SELECT * FROM system_schema.types";
const SELECT_FUNCTIONS_30: &str = "SELECT * FROM system_schema.functions";
const SELECT_AGGREGATES_30: &str = "SELECT * FROM system_schema.aggregates";

const VERSION_3_0: CassandraVersion = CassandraVersion::new(3, 0, 0);
const VERSION_2_2: CassandraVersion = CassandraVersion::new(2, 2, 0);
const VERSION_2_1: CassandraVersion = CassandraVersion::new(2, 1, 0);

/// How a node-info row is applied to the token map: `Add` restates a
/// host's tokens during a full hosts refresh, `UpdateAndRebuild` replaces
/// them (and rebuilds affected replica sets) after a targeted refresh.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum UpdateHostKind {
    Add,
    UpdateAndRebuild,
}

/// Resolves a `system.peers` row into the address to contact the peer on,
/// or `None` if the row is unusable. The port is inherited from the
/// control connection's address in every case.
pub(super) fn determine_address_for_peer_host(
    connected_address: SocketAddr,
    peer_value: Option<&CqlValue>,
    rpc_value: Option<&CqlValue>,
) -> Option<SocketAddr> {
    let port = connected_address.port();
    let peer_address = match peer_value {
        Some(CqlValue::Inet(ip)) => SocketAddr::new(*ip, port),
        _ => {
            warn!("Invalid address format for peer address");
            return None;
        }
    };

    match rpc_value {
        Some(CqlValue::Inet(rpc_ip)) => {
            let rpc_address = SocketAddr::new(*rpc_ip, port);
            if rpc_address == connected_address || peer_address == connected_address {
                // Known problem on some server versions: a peers row
                // describing the queried node itself.
                debug!(
                    host = %connected_address,
                    "system.peers contains a row with rpc_address for the connected host itself; \
                     ignoring this entry"
                );
                return None;
            }
            if rpc_ip.is_unspecified() {
                warn!(
                    listen_address = %peer_address,
                    "Found host with 'bind any' for rpc_address; using listen_address to contact \
                     it instead. If this is incorrect you should configure a specific interface \
                     for rpc_address on the server"
                );
                Some(peer_address)
            } else {
                Some(rpc_address)
            }
        }
        Some(CqlValue::Null) | None => {
            warn!(
                host = %peer_address,
                connected = %connected_address,
                "No rpc_address for host in system.peers; ignoring this entry"
            );
            None
        }
        Some(_) => {
            warn!("Invalid address format for rpc address");
            None
        }
    }
}

impl<C: Connector, S: Session> ControlConnection<C, S> {
    fn live_transport(&self) -> Option<Arc<C::Transport>> {
        self.connection.as_ref().map(|c| c.transport.clone())
    }

    /// Runs one control query; any failure defuncts the connection.
    pub(super) async fn run_control_query(
        &self,
        statement: Statement,
    ) -> Result<ResultSet, RefreshError> {
        let Some(transport) = self.live_transport() else {
            return Err(RefreshError::NoConnection);
        };
        match dispatcher::run_query(&*transport, self.config.request_timeout, statement).await {
            Ok(result) => Ok(result),
            Err(error) => {
                warn!(%error, "Control connection query failed; defuncting the connection");
                self.metrics.record_defunct();
                transport.defunct();
                Err(error.into())
            }
        }
    }

    /// Runs a chained bundle; any sub-failure defuncts the connection.
    pub(super) async fn run_control_bundle(
        &self,
        bundle: QueryBundle,
    ) -> Result<BundleResults, RefreshError> {
        let Some(transport) = self.live_transport() else {
            return Err(RefreshError::NoConnection);
        };
        match dispatcher::run_bundle(&*transport, self.config.request_timeout, bundle).await {
            Ok(results) => Ok(results),
            Err(error) => {
                warn!(%error, "Control connection query failed; defuncting the connection");
                self.metrics.record_defunct();
                transport.defunct();
                Err(error.into())
            }
        }
    }

    /// Full hosts refresh: `system.local` + `system.peers`, host map
    /// upserts, stale-host purge, then the schema refresh when enabled.
    /// This runs after every (re)connect, before the channel is considered
    /// usable.
    ///
    /// Needs to happen before any schema query: the connected host's
    /// server version determines which schema tables exist.
    pub(super) async fn refresh_hosts(&mut self) -> Result<(), RefreshError> {
        let Some(transport) = self.live_transport() else {
            return Err(RefreshError::NoConnection);
        };
        let connected_address = transport.connect_address();
        let token_aware = self.config.token_aware_routing;
        self.metrics.record_hosts_refresh();

        let bundle = QueryBundle::new(
            "local",
            Statement::new(if token_aware {
                SELECT_LOCAL_TOKENS
            } else {
                SELECT_LOCAL
            }),
        )
        .chain(
            "peers",
            Statement::new(if token_aware {
                SELECT_PEERS_TOKENS
            } else {
                SELECT_PEERS
            }),
        );
        let results = self.run_control_bundle(bundle).await?;

        let is_initial_connection = self.state() == ControlState::New;

        if token_aware {
            self.session.token_map_hosts_cleared();
        }

        // An empty `system.local` means the node is mid-bootstrap or
        // misconfigured; the connection cannot serve as a control
        // connection because at least the node's own row is required.
        let Some(host) = self.session.get_host(connected_address) else {
            warn!(
                host = %connected_address,
                "Host from local system table not found in the session host map"
            );
            transport.defunct();
            return Err(RefreshError::UnknownLocalHost);
        };
        host.set_mark(self.session.current_host_mark());

        match results.result("local").and_then(ResultSet::first_row) {
            Some(local_row) => {
                self.update_node_info(&host, local_row, UpdateHostKind::Add);
                self.cassandra_version = host.server_version().unwrap_or_default();
            }
            None => {
                warn!(
                    host = %connected_address,
                    "No row found in the host's local system table"
                );
                transport.defunct();
                return Err(RefreshError::EmptyLocal);
            }
        }

        if let Some(peers) = results.result("peers") {
            for row in peers.rows() {
                let Some(address) = determine_address_for_peer_host(
                    connected_address,
                    row.get("peer"),
                    row.get("rpc_address"),
                ) else {
                    continue;
                };

                let (peer_host, is_new) = match self.session.get_host(address) {
                    Some(known) => (known, false),
                    None => (self.session.add_host(address), true),
                };
                peer_host.set_mark(self.session.current_host_mark());
                self.update_node_info(&peer_host, row, UpdateHostKind::Add);
                if is_new && !is_initial_connection {
                    self.session.on_add(&peer_host);
                }
            }
        }

        self.session.purge_hosts(is_initial_connection);

        if self.config.use_schema || token_aware {
            self.refresh_schema().await?;
        } else if is_initial_connection {
            self.become_ready();
        }
        Ok(())
    }

    /// Full schema refresh, version-branched. Only `keyspaces` is
    /// mandatory; other sub-results are applied iff present. The metadata
    /// store's back buffer is rebuilt and then atomically published, so
    /// readers never observe a partial rebuild.
    pub(super) async fn refresh_schema(&mut self) -> Result<(), RefreshError> {
        let use_schema = self.config.use_schema;
        let token_aware = self.config.token_aware_routing;
        if !use_schema && !token_aware {
            return Ok(());
        }
        self.metrics.record_schema_refresh();

        let version = self.cassandra_version;
        let bundle = if version >= VERSION_3_0 {
            let mut bundle =
                QueryBundle::new("keyspaces", Statement::new(SELECT_KEYSPACES_30));
            if use_schema {
                bundle = bundle
                    .chain("tables", Statement::new(SELECT_TABLES_30))
                    .chain("views", Statement::new(SELECT_VIEWS_30))
                    .chain("columns", Statement::new(SELECT_COLUMNS_30))
                    .chain("indexes", Statement::new(SELECT_INDEXES_30))
                    .chain("user_types", Statement::new(SELECT_USERTYPES_30))
                    .chain("functions", Statement::new(SELECT_FUNCTIONS_30))
                    .chain("aggregates", Statement::new(SELECT_AGGREGATES_30));
            }
            bundle
        } else {
            let mut bundle =
                QueryBundle::new("keyspaces", Statement::new(SELECT_KEYSPACES_20));
            if use_schema {
                bundle = bundle
                    .chain("tables", Statement::new(SELECT_COLUMN_FAMILIES_20))
                    .chain("columns", Statement::new(SELECT_COLUMNS_20));
                if version >= VERSION_2_1 {
                    bundle = bundle.chain("user_types", Statement::new(SELECT_USERTYPES_21));
                }
                if version >= VERSION_2_2 {
                    bundle = bundle
                        .chain("functions", Statement::new(SELECT_FUNCTIONS_22))
                        .chain("aggregates", Statement::new(SELECT_AGGREGATES_22));
                }
            }
            bundle
        };

        let results = self.run_control_bundle(bundle).await?;

        if token_aware {
            if let Some(keyspaces) = results.result("keyspaces") {
                self.session.token_map_keyspaces_add(version, keyspaces);
            }
        }

        if use_schema {
            let metadata = self.session.metadata();
            metadata.clear_and_update_back(version);
            if let Some(result) = results.result("keyspaces") {
                metadata.update_keyspaces(version, result);
            }
            if let Some(result) = results.result("tables") {
                metadata.update_tables(version, result);
            }
            if let Some(result) = results.result("views") {
                metadata.update_views(version, result);
            }
            if let Some(result) = results.result("columns") {
                metadata.update_columns(version, result);
            }
            if let Some(result) = results.result("indexes") {
                metadata.update_indexes(version, result);
            }
            if let Some(result) = results.result("user_types") {
                metadata.update_user_types(version, result);
            }
            if let Some(result) = results.result("functions") {
                metadata.update_functions(version, result);
            }
            if let Some(result) = results.result("aggregates") {
                metadata.update_aggregates(version, result);
            }
            metadata.swap_to_back_and_update_front();
        }

        self.become_ready();
        Ok(())
    }

    /// Targeted keyspace refresh after a schema event.
    pub(super) async fn refresh_keyspace(&mut self, keyspace: &str) {
        let base = if self.cassandra_version >= VERSION_3_0 {
            SELECT_KEYSPACES_30
        } else {
            SELECT_KEYSPACES_20
        };
        let query = format!("{base} WHERE keyspace_name='{keyspace}'");
        debug!(query = %query, "Refreshing keyspace");

        let Ok(result) = self.run_control_query(Statement::new(query)).await else {
            return;
        };
        if result.is_empty() {
            error!(%keyspace, "No row found for keyspace in system schema table");
            return;
        }

        if self.config.token_aware_routing {
            self.session
                .token_map_keyspaces_update(self.cassandra_version, &result);
        }
        if self.config.use_schema {
            self.session
                .metadata()
                .update_keyspaces(self.cassandra_version, &result);
        }
    }

    /// Targeted table (or materialized view) refresh. The event does not
    /// say which of the two the name denotes, so both are queried on newer
    /// servers; an empty `tables` sub-result with a non-empty `views` one
    /// means it was a view.
    pub(super) async fn refresh_table_or_view(&mut self, keyspace: &str, name: &str) {
        let version = self.cassandra_version;
        let bundle = if version >= VERSION_3_0 {
            QueryBundle::new(
                "tables",
                Statement::new(format!(
                    "{SELECT_TABLES_30} WHERE keyspace_name='{keyspace}' AND table_name='{name}'"
                )),
            )
            .chain(
                "columns",
                Statement::new(format!(
                    "{SELECT_COLUMNS_30} WHERE keyspace_name='{keyspace}' AND table_name='{name}'"
                )),
            )
            .chain(
                "views",
                Statement::new(format!(
                    "{SELECT_VIEWS_30} WHERE keyspace_name='{keyspace}' AND view_name='{name}'"
                )),
            )
            .chain(
                "indexes",
                Statement::new(format!(
                    "{SELECT_INDEXES_30} WHERE keyspace_name='{keyspace}' AND table_name='{name}'"
                )),
            )
        } else {
            QueryBundle::new(
                "tables",
                Statement::new(format!(
                    "{SELECT_COLUMN_FAMILIES_20} WHERE keyspace_name='{keyspace}' \
                     AND columnfamily_name='{name}'"
                )),
            )
            .chain(
                "columns",
                Statement::new(format!(
                    "{SELECT_COLUMNS_20} WHERE keyspace_name='{keyspace}' \
                     AND columnfamily_name='{name}'"
                )),
            )
        };
        debug!(%keyspace, table = %name, "Refreshing table or view");

        let Ok(results) = self.run_control_bundle(bundle).await else {
            return;
        };

        let metadata = self.session.metadata();
        match results.result("tables").filter(|r| !r.is_empty()) {
            Some(tables) => metadata.update_tables(version, tables),
            None => match results.result("views").filter(|r| !r.is_empty()) {
                Some(views) => metadata.update_views(version, views),
                None => {
                    error!(
                        %keyspace,
                        table = %name,
                        "No row found for table (or view) in system schema tables"
                    );
                    return;
                }
            },
        }

        if let Some(columns) = results.result("columns") {
            metadata.update_columns(version, columns);
        }
        if let Some(indexes) = results.result("indexes") {
            metadata.update_indexes(version, indexes);
        }
    }

    /// Targeted user-defined-type refresh.
    pub(super) async fn refresh_type(&mut self, keyspace: &str, type_name: &str) {
        let base = if self.cassandra_version >= VERSION_3_0 {
            SELECT_USERTYPES_30
        } else {
            SELECT_USERTYPES_21
        };
        let query = format!("{base} WHERE keyspace_name='{keyspace}' AND type_name='{type_name}'");
        debug!(query = %query, "Refreshing type");

        let Ok(result) = self.run_control_query(Statement::new(query)).await else {
            return;
        };
        if result.is_empty() {
            error!(
                %keyspace,
                type_name = %type_name,
                "No row found for keyspace and type in system schema"
            );
            return;
        }
        self.session
            .metadata()
            .update_user_types(self.cassandra_version, &result);
    }

    /// Targeted function or aggregate refresh. Functions are keyed by
    /// signature, so the lookup binds the argument type list; the column
    /// holding it is `argument_types` on 3.0+ and `signature` on 2.2.
    pub(super) async fn refresh_function(
        &mut self,
        keyspace: &str,
        function: &str,
        arg_types: &[String],
        is_aggregate: bool,
    ) {
        let query = if self.cassandra_version >= VERSION_3_0 {
            if is_aggregate {
                format!(
                    "{SELECT_AGGREGATES_30} WHERE keyspace_name=? AND aggregate_name=? \
                     AND argument_types=?"
                )
            } else {
                format!(
                    "{SELECT_FUNCTIONS_30} WHERE keyspace_name=? AND function_name=? \
                     AND argument_types=?"
                )
            }
        } else if is_aggregate {
            format!("{SELECT_AGGREGATES_22} WHERE keyspace_name=? AND aggregate_name=? AND signature=?")
        } else {
            format!("{SELECT_FUNCTIONS_22} WHERE keyspace_name=? AND function_name=? AND signature=?")
        };
        debug!(
            %keyspace,
            function = %full_function_name(function, arg_types),
            aggregate = is_aggregate,
            "Refreshing function"
        );

        let statement = Statement::with_values(
            query,
            vec![
                CqlValue::Text(keyspace.to_owned()),
                CqlValue::Text(function.to_owned()),
                CqlValue::TextList(arg_types.to_vec()),
            ],
        );
        let Ok(result) = self.run_control_query(statement).await else {
            return;
        };
        if result.is_empty() {
            error!(
                %keyspace,
                function = %full_function_name(function, arg_types),
                aggregate = is_aggregate,
                "No row found for function in system schema"
            );
            return;
        }
        if is_aggregate {
            self.session
                .metadata()
                .update_aggregates(self.cassandra_version, &result);
        } else {
            self.session
                .metadata()
                .update_functions(self.cassandra_version, &result);
        }
    }

    /// Refreshes a single host's node info after a status/topology event
    /// or rediscovery. The connected host is read from `system.local`;
    /// peers are looked up by their listen address when known, otherwise
    /// by scanning `system.peers`.
    pub(super) async fn refresh_node_info(
        &mut self,
        host: Arc<Host>,
        is_new_node: bool,
        query_tokens: bool,
    ) {
        let Some(transport) = self.live_transport() else {
            return;
        };
        let connected_address = transport.connect_address();
        let is_connected_host = host.address() == connected_address;
        let token_query =
            self.config.token_aware_routing && (host.was_just_added() || query_tokens);

        let mut scan_all_peers = false;
        let query = if is_connected_host {
            (if token_query {
                SELECT_LOCAL_TOKENS
            } else {
                SELECT_LOCAL
            })
            .to_owned()
        } else if let Some(listen_address) = host.listen_address() {
            format!(
                "{} WHERE peer = '{}'",
                if token_query {
                    SELECT_PEERS_TOKENS
                } else {
                    SELECT_PEERS
                },
                listen_address
            )
        } else {
            scan_all_peers = true;
            (if token_query {
                SELECT_PEERS_TOKENS
            } else {
                SELECT_PEERS
            })
            .to_owned()
        };
        debug!(query = %query, "Refreshing node info");

        let Ok(result) = self.run_control_query(Statement::new(query)).await else {
            return;
        };
        if result.is_empty() {
            error!(
                host = %host.address(),
                queried = %connected_address,
                "No row found for host in the local/peers system tables; the host will be ignored"
            );
            return;
        }

        if scan_all_peers {
            for row in result.rows() {
                let address = determine_address_for_peer_host(
                    connected_address,
                    row.get("peer"),
                    row.get("rpc_address"),
                );
                if address == Some(host.address()) {
                    self.update_node_info(&host, row, UpdateHostKind::UpdateAndRebuild);
                    if is_new_node {
                        self.session.on_add(&host);
                    }
                    break;
                }
            }
        } else if let Some(row) = result.first_row() {
            self.update_node_info(&host, row, UpdateHostKind::UpdateAndRebuild);
            if is_new_node {
                self.session.on_add(&host);
            }
        }
    }

    /// Applies one local/peers row to a host: rack/DC, server version,
    /// listen address, and (when token-aware) partitioner and tokens.
    pub(super) fn update_node_info(&self, host: &Arc<Host>, row: &Row, kind: UpdateHostKind) {
        let was_just_added = host.was_just_added();
        let rack = row.get_str("rack");
        let datacenter = row.get_str("data_center");

        // Not present in the system.local query.
        match row.get("peer") {
            Some(CqlValue::Inet(listen_address)) => {
                host.set_listen_address(listen_address.to_string());
            }
            Some(CqlValue::Null) | None => {}
            Some(_) => warn!("Invalid address format for listen address"),
        }

        let rack_changed = rack.is_some_and(|r| host.rack().as_deref() != Some(r));
        let datacenter_changed =
            datacenter.is_some_and(|dc| host.datacenter().as_deref() != Some(dc));
        if rack_changed || datacenter_changed {
            // The load-balancing policy partitions hosts by rack/DC; it
            // must see a remove under the old location and an add under
            // the new one. Brand-new hosts are unknown to it, so no
            // notifications for those.
            if !was_just_added {
                self.session.load_balancing_remove(host);
            }
            host.set_rack_and_datacenter(rack, datacenter);
            if !was_just_added {
                self.session.load_balancing_add(host);
            }
        }

        if let Some(release_version) = row.get_str("release_version") {
            match CassandraVersion::from_str(release_version) {
                Ok(version) => host.set_server_version(version),
                Err(_) => warn!(
                    host = %host.address(),
                    release_version,
                    "Invalid release version string"
                ),
            }
        }

        if self.config.token_aware_routing {
            let is_connected_host = self
                .connection
                .as_ref()
                .is_some_and(|c| c.transport.connect_address() == host.address());
            if is_connected_host {
                if let Some(partitioner) = row.get_str("partitioner") {
                    if !self.session.token_map_init(partitioner) {
                        trace!("Token map has already been initialized");
                    }
                }
            }
            if let Some(tokens) = row.get_string_list("tokens") {
                match kind {
                    UpdateHostKind::Add => self.session.token_map_host_add(host, tokens),
                    UpdateHostKind::UpdateAndRebuild => {
                        self.session.token_map_host_update(host, tokens)
                    }
                }
            }
        }

        host.set_just_added(false);
    }
}
