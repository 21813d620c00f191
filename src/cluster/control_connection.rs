//! The control connection state machine: connect, protocol negotiation,
//! initial metadata load, event processing, and reconnect scheduling.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::cluster::host::{CassandraVersion, Host};
use crate::cluster::query_plan::{QueryPlan, StartupQueryPlan};
use crate::errors::{BrokenConnection, ConnectError, ControlConnectionError};
use crate::frame::events::{
    Event, EventType, SchemaChangeEvent, SchemaChangeType, StatusChangeEvent, TopologyChangeEvent,
};
use crate::observability::metrics::Metrics;
use crate::protocol::ProtocolVersion;
use crate::session::{ControlConnectionConfig, Session, full_function_name};
use crate::transport::{Connector, ControlTransport, EstablishedConnection};

/// Delay before a reconnect attempt while `Ready` without a live
/// connection.
pub(crate) const RECONNECT_WAIT: Duration = Duration::from_millis(1000);

/// Lifecycle state of the control channel.
///
/// `Ready` is reached only after a successful hosts refresh (plus schema
/// refresh when enabled); `Closed` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlState {
    New,
    Ready,
    Closed,
}

/// The live connection together with its notification channels.
pub(super) struct LiveConnection<T> {
    pub(super) transport: Arc<T>,
    pub(super) events: mpsc::Receiver<Event>,
    pub(super) closed: oneshot::Receiver<BrokenConnection>,
}

/// The dedicated connection used to read cluster metadata and receive
/// server-pushed cluster events, owned and driven by a single task.
///
/// [`connect`](Self::connect) establishes the initial connection and
/// performs the initial metadata load; [`run`](Self::run) then processes
/// events and connection loss until [`close`](Self::close) (or the close
/// signal) fires. The control channel never carries user traffic.
pub struct ControlConnection<C: Connector, S: Session> {
    pub(super) session: Arc<S>,
    pub(super) connector: C,
    pub(super) config: ControlConnectionConfig,
    pub(super) state: ControlState,
    pub(super) connection: Option<LiveConnection<C::Transport>>,
    pub(super) current_host: Option<Arc<Host>>,
    pub(super) query_plan: Option<Box<dyn QueryPlan>>,
    pub(super) protocol_version: ProtocolVersion,
    /// Server version of the connected host, cached on the hosts refresh;
    /// selects the schema introspection queries.
    pub(super) cassandra_version: CassandraVersion,
    pub(super) event_types: Vec<EventType>,
    pub(super) metrics: Arc<Metrics>,
}

enum Wakeup {
    Event(Event),
    ConnectionLost(String),
    ReconnectNow,
    CloseRequested,
}

impl<C: Connector, S: Session> ControlConnection<C, S> {
    pub fn new(session: Arc<S>, connector: C, config: ControlConnectionConfig) -> Self {
        let mut event_types = vec![EventType::TopologyChange, EventType::StatusChange];
        if config.use_schema || config.token_aware_routing {
            event_types.push(EventType::SchemaChange);
        }
        let protocol_version = config.protocol_version;
        Self {
            session,
            connector,
            config,
            state: ControlState::New,
            connection: None,
            current_host: None,
            query_plan: None,
            protocol_version,
            cassandra_version: CassandraVersion::default(),
            event_types,
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    /// The host the control connection was last established to.
    pub fn connected_host(&self) -> Option<Arc<Host>> {
        self.current_host.clone()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Establishes the initial control connection, negotiating the
    /// protocol version down as needed, and performs the initial metadata
    /// load. On success the channel is `Ready`. Fatal errors are also
    /// reported through [`Session::on_control_connection_error`].
    pub async fn connect(&mut self) -> Result<(), ControlConnectionError> {
        self.protocol_version = self.config.protocol_version;

        // Snapshot of the host map; happens before any other task can
        // observe the session, so the session exposes it lock-free.
        let hosts = self.session.hosts_snapshot();
        let mut rng = self.session.rng();
        self.query_plan = Some(Box::new(StartupQueryPlan::new(hosts, rng.as_deref_mut())));

        loop {
            let Some(host) = self.next_host() else {
                return Err(self.fatal(ControlConnectionError::NoHostsAvailable));
            };
            if self.try_host(&host).await? {
                return Ok(());
            }
        }
    }

    /// Attempts one host, retrying it at lower protocol versions on
    /// invalid-protocol rejections. `Ok(true)` means the channel is
    /// `Ready`; `Ok(false)` means the next host should be tried; `Err` is
    /// fatal.
    async fn try_host(&mut self, host: &Arc<Host>) -> Result<bool, ControlConnectionError> {
        loop {
            self.metrics.record_connect_attempt();
            let attempt = self
                .connector
                .connect(host.address(), self.protocol_version, &self.event_types)
                .await;
            match attempt {
                Ok(established) => {
                    debug!(host = %host.address(), "Connection ready on host");
                    self.install_connection(established, host.clone());
                    // Refresh metadata even on a reconnect: events could
                    // have been missed while not connected.
                    match self.refresh_hosts().await {
                        Ok(()) => return Ok(true),
                        Err(error) => {
                            warn!(
                                host = %host.address(),
                                %error,
                                "Initial metadata refresh failed"
                            );
                            self.drop_connection();
                            return Ok(false);
                        }
                    }
                }
                Err(ConnectError::InvalidProtocol(_)) => {
                    let Some(lower) = self.protocol_version.downgrade() else {
                        error!(
                            host = %host.address(),
                            "Host does not support any valid protocol version"
                        );
                        return Err(self.fatal(ControlConnectionError::NoSupportedProtocol));
                    };
                    warn!(
                        host = %host.address(),
                        rejected = %self.protocol_version,
                        trying = %lower,
                        "Host does not support protocol version; trying a lower one"
                    );
                    self.protocol_version = lower;
                    self.metrics.record_protocol_downgrade();
                    // Retry the same host with the new version.
                }
                Err(ConnectError::Authentication(message)) => {
                    return Err(self.fatal(ControlConnectionError::Authentication(message)));
                }
                Err(ConnectError::Tls(message)) => {
                    return Err(self.fatal(ControlConnectionError::Tls(message)));
                }
                Err(error) => {
                    error!(
                        host = %host.address(),
                        %error,
                        "Unable to establish a control connection to host"
                    );
                    return Ok(false);
                }
            }
        }
    }

    fn fatal(&self, error: ControlConnectionError) -> ControlConnectionError {
        self.session.on_control_connection_error(error.clone());
        error
    }

    /// Processes server events and connection loss until the close signal
    /// fires or [`close`](Self::close) was called.
    pub async fn run(&mut self, mut close_signal: oneshot::Receiver<()>) {
        loop {
            if self.state == ControlState::Closed {
                return;
            }

            let wakeup = if let Some(connection) = self.connection.as_mut() {
                tokio::select! {
                    event = connection.events.recv() => match event {
                        Some(event) => Wakeup::Event(event),
                        None => Wakeup::ConnectionLost("event channel closed".to_owned()),
                    },
                    broken = &mut connection.closed => Wakeup::ConnectionLost(match broken {
                        Ok(broken) => broken.to_string(),
                        Err(_) => "connection closed".to_owned(),
                    }),
                    _ = &mut close_signal => Wakeup::CloseRequested,
                }
            } else {
                // Ready without a live connection: the reconnect timer is
                // the only thing running (invariant: timer active iff
                // Ready and disconnected).
                tokio::select! {
                    _ = tokio::time::sleep(RECONNECT_WAIT) => Wakeup::ReconnectNow,
                    _ = &mut close_signal => Wakeup::CloseRequested,
                }
            };

            match wakeup {
                Wakeup::Event(event) => {
                    debug!(?event, "Received server event");
                    self.handle_event(event).await;
                }
                Wakeup::ConnectionLost(reason) => self.handle_connection_loss(&reason),
                Wakeup::ReconnectNow => {
                    // A fresh plan, so hosts discovered through events
                    // since the loss are considered.
                    self.query_plan = Some(self.session.new_query_plan());
                    self.reconnect().await;
                }
                Wakeup::CloseRequested => {
                    self.close();
                    return;
                }
            }
        }
    }

    /// Closes the control channel. Terminal: the channel never leaves
    /// `Closed`.
    pub fn close(&mut self) {
        self.state = ControlState::Closed;
        if let Some(connection) = self.connection.take() {
            connection.transport.defunct();
        }
    }

    fn handle_connection_loss(&mut self, reason: &str) {
        if let Some(connection) = self.connection.take() {
            if self.state != ControlState::Closed {
                warn!(
                    host = %connection.transport.connect_address(),
                    reason,
                    "Lost control connection to host"
                );
            }
        }
    }

    /// Walks the current query plan once, trying to re-establish the
    /// connection. Plan exhaustion is not fatal here: the run loop waits
    /// and retries with a fresh plan.
    async fn reconnect(&mut self) {
        while let Some(host) = self.next_host() {
            self.metrics.record_connect_attempt();
            let attempt = self
                .connector
                .connect(host.address(), self.protocol_version, &self.event_types)
                .await;
            match attempt {
                Ok(established) => {
                    self.install_connection(established, host.clone());
                    match self.refresh_hosts().await {
                        Ok(()) => {
                            debug!(host = %host.address(), "Control connection re-established");
                            return;
                        }
                        Err(error) => {
                            warn!(
                                host = %host.address(),
                                %error,
                                "Metadata refresh failed after reconnect"
                            );
                            self.drop_connection();
                        }
                    }
                }
                Err(error) => {
                    warn!(
                        host = %host.address(),
                        %error,
                        "Unable to reconnect control connection to host"
                    );
                }
            }
        }
        debug!("Query plan exhausted while reconnecting; will retry");
    }

    fn next_host(&mut self) -> Option<Arc<Host>> {
        self.query_plan.as_mut()?.next()
    }

    fn install_connection(
        &mut self,
        established: EstablishedConnection<C::Transport>,
        host: Arc<Host>,
    ) {
        self.connection = Some(LiveConnection {
            transport: established.transport,
            events: established.events,
            closed: established.closed,
        });
        self.current_host = Some(host);
    }

    pub(super) fn drop_connection(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.transport.defunct();
        }
    }

    /// Transitions `New` → `Ready` after the initial metadata load and
    /// rebuilds the query plan from everything the refresh discovered.
    pub(super) fn become_ready(&mut self) {
        if self.state != ControlState::New {
            return;
        }
        self.state = ControlState::Ready;
        info!("Control connection ready");
        self.session.on_control_connection_ready();
        self.query_plan = Some(self.session.new_query_plan());
    }

    /// Dispatches a server-pushed event. Events are only processed while
    /// `Ready`: a host added from an UP/NEW_NODE event before the initial
    /// load would race it, and schema events would race the initial schema
    /// fetch.
    pub(super) async fn handle_event(&mut self, event: Event) {
        if self.state != ControlState::Ready {
            return;
        }
        self.metrics.record_server_event();

        match event {
            Event::TopologyChange(change) => self.handle_topology_event(change).await,
            Event::StatusChange(change) => self.handle_status_event(change).await,
            Event::SchemaChange(change) => self.handle_schema_event(change).await,
        }
    }

    async fn handle_topology_event(&mut self, change: TopologyChangeEvent) {
        match change {
            TopologyChangeEvent::NewNode(address) => {
                info!(%address, "New node added");
                if self.session.get_host(address).is_none() {
                    let host = self.session.add_host(address);
                    self.refresh_node_info(host, true, true).await;
                }
            }
            TopologyChangeEvent::RemovedNode(address) => {
                info!(%address, "Node removed");
                match self.session.get_host(address) {
                    Some(host) => {
                        self.session.on_remove(&host);
                        self.session.token_map_host_remove(&host);
                    }
                    None => debug!(%address, "Tried to remove host that doesn't exist"),
                }
            }
            TopologyChangeEvent::MovedNode(address) => {
                info!(%address, "Node moved");
                match self.session.get_host(address) {
                    Some(host) => self.refresh_node_info(host, false, true).await,
                    None => debug!(%address, "Move event for host that doesn't exist"),
                }
            }
        }
    }

    async fn handle_status_event(&mut self, change: StatusChangeEvent) {
        match change {
            StatusChangeEvent::Up(address) => {
                info!(%address, "Node is up");
                match self.session.get_host(address) {
                    Some(host) => {
                        if host.is_up() {
                            return;
                        }
                        // Mark the host up before refreshing its info:
                        // pool components may be blocked waiting for the
                        // up transition.
                        host.set_up();
                        self.session.on_up(&host);
                        self.refresh_node_info(host, false, false).await;
                    }
                    None => {
                        let host = self.session.add_host(address);
                        self.refresh_node_info(host, true, false).await;
                    }
                }
            }
            StatusChangeEvent::Down(address) => {
                info!(%address, "Node is down");
                match self.session.get_host(address) {
                    Some(host) => {
                        if !host.is_up() {
                            return;
                        }
                        host.set_down();
                        self.session.on_down(&host);
                    }
                    None => debug!(%address, "Tried to down host that doesn't exist"),
                }
            }
        }
    }

    async fn handle_schema_event(&mut self, change: SchemaChangeEvent) {
        // Without schema metadata, only keyspace events matter: the token
        // map still needs keyspace replication data.
        if !self.config.use_schema
            && !matches!(change, SchemaChangeEvent::KeyspaceChange { .. })
        {
            return;
        }
        debug!(?change, "Schema change");

        use SchemaChangeType::{Created, Dropped, Updated};
        match change {
            SchemaChangeEvent::KeyspaceChange {
                change_type: Created | Updated,
                keyspace_name,
            } => self.refresh_keyspace(&keyspace_name).await,
            SchemaChangeEvent::KeyspaceChange {
                change_type: Dropped,
                keyspace_name,
            } => self.session.metadata().drop_keyspace(&keyspace_name),

            SchemaChangeEvent::TableChange {
                change_type: Created | Updated,
                keyspace_name,
                object_name,
            } => self.refresh_table_or_view(&keyspace_name, &object_name).await,
            SchemaChangeEvent::TableChange {
                change_type: Dropped,
                keyspace_name,
                object_name,
            } => self
                .session
                .metadata()
                .drop_table_or_view(&keyspace_name, &object_name),

            SchemaChangeEvent::TypeChange {
                change_type: Created | Updated,
                keyspace_name,
                type_name,
            } => self.refresh_type(&keyspace_name, &type_name).await,
            SchemaChangeEvent::TypeChange {
                change_type: Dropped,
                keyspace_name,
                type_name,
            } => self.session.metadata().drop_user_type(&keyspace_name, &type_name),

            SchemaChangeEvent::FunctionChange {
                change_type: Created | Updated,
                keyspace_name,
                function_name,
                arguments,
            } => {
                self.refresh_function(&keyspace_name, &function_name, &arguments, false)
                    .await
            }
            SchemaChangeEvent::FunctionChange {
                change_type: Dropped,
                keyspace_name,
                function_name,
                arguments,
            } => self.session.metadata().drop_function(
                &keyspace_name,
                &full_function_name(&function_name, &arguments),
            ),

            SchemaChangeEvent::AggregateChange {
                change_type: Created | Updated,
                keyspace_name,
                aggregate_name,
                arguments,
            } => {
                self.refresh_function(&keyspace_name, &aggregate_name, &arguments, true)
                    .await
            }
            SchemaChangeEvent::AggregateChange {
                change_type: Dropped,
                keyspace_name,
                aggregate_name,
                arguments,
            } => self.session.metadata().drop_aggregate(
                &keyspace_name,
                &full_function_name(&aggregate_name, &arguments),
            ),

            SchemaChangeEvent::KeyspaceChange {
                change_type: SchemaChangeType::Invalid,
                ..
            }
            | SchemaChangeEvent::TableChange {
                change_type: SchemaChangeType::Invalid,
                ..
            }
            | SchemaChangeEvent::TypeChange {
                change_type: SchemaChangeType::Invalid,
                ..
            }
            | SchemaChangeEvent::FunctionChange {
                change_type: SchemaChangeType::Invalid,
                ..
            }
            | SchemaChangeEvent::AggregateChange {
                change_type: SchemaChangeType::Invalid,
                ..
            } => warn!(?change, "Ignoring schema change of unknown type"),
        }
    }
}
