//! Shared helpers for unit tests: scripted transports/connectors and a
//! recording session.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::RngCore;
use tokio::sync::{mpsc, oneshot};

use crate::cluster::host::{CassandraVersion, Host};
use crate::cluster::query_plan::{QueryPlan, StartupQueryPlan};
use crate::errors::{BrokenConnection, ConnectError, ControlConnectionError, RequestError};
use crate::frame::events::{Event, EventType};
use crate::frame::response::{CqlValue, ResultSet, Row};
use crate::protocol::ProtocolVersion;
use crate::session::{MetadataStore, Session};
use crate::transport::{Connector, ControlTransport, EstablishedConnection, Statement};

pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(tracing_subscriber::fmt::TestWriter::new())
        .try_init();
}

// ===== Row and result-set builders =====

pub(crate) fn local_row(datacenter: &str, rack: &str, release_version: &str) -> Row {
    Row::new()
        .with_column("data_center", CqlValue::Text(datacenter.to_owned()))
        .with_column("rack", CqlValue::Text(rack.to_owned()))
        .with_column("release_version", CqlValue::Text(release_version.to_owned()))
}

pub(crate) fn local_row_with_tokens(
    datacenter: &str,
    rack: &str,
    release_version: &str,
    partitioner: &str,
    tokens: &[&str],
) -> Row {
    local_row(datacenter, rack, release_version)
        .with_column("partitioner", CqlValue::Text(partitioner.to_owned()))
        .with_column(
            "tokens",
            CqlValue::TextList(tokens.iter().map(|t| (*t).to_owned()).collect()),
        )
}

pub(crate) fn peer_row(
    peer: &str,
    rpc_address: Option<&str>,
    datacenter: &str,
    rack: &str,
    release_version: &str,
) -> Row {
    Row::new()
        .with_column("peer", CqlValue::Inet(peer.parse().unwrap()))
        .with_column(
            "rpc_address",
            match rpc_address {
                Some(ip) => CqlValue::Inet(ip.parse().unwrap()),
                None => CqlValue::Null,
            },
        )
        .with_column("data_center", CqlValue::Text(datacenter.to_owned()))
        .with_column("rack", CqlValue::Text(rack.to_owned()))
        .with_column("release_version", CqlValue::Text(release_version.to_owned()))
}

pub(crate) fn keyspace_row(name: &str, replication: &str) -> Row {
    Row::new()
        .with_column("keyspace_name", CqlValue::Text(name.to_owned()))
        .with_column("replication", CqlValue::Text(replication.to_owned()))
}

/// Routes system-table queries to canned local/peers result sets; every
/// other (schema) query gets an empty result.
pub(crate) fn system_tables_handler(
    local: ResultSet,
    peers: ResultSet,
) -> impl Fn(&Statement) -> Result<ResultSet, RequestError> + Send + Sync + 'static {
    move |statement: &Statement| {
        if statement.cql.contains("FROM system.local") {
            Ok(local.clone())
        } else if statement.cql.contains("FROM system.peers") {
            Ok(peers.clone())
        } else {
            Ok(ResultSet::empty())
        }
    }
}

// ===== Transport =====

type QueryHandler = Box<dyn Fn(&Statement) -> Result<ResultSet, RequestError> + Send + Sync>;

/// A scripted control transport. Queries are answered by the handler and
/// recorded; `defunct()` fires the closed channel like a real connection.
pub(crate) struct MockTransport {
    address: SocketAddr,
    handler: Option<QueryHandler>,
    queries: Mutex<Vec<Statement>>,
    defunct: AtomicBool,
    event_sender: Mutex<Option<mpsc::Sender<Event>>>,
    closed_sender: Mutex<Option<oneshot::Sender<BrokenConnection>>>,
}

impl MockTransport {
    pub(crate) fn new(
        address: SocketAddr,
        handler: impl Fn(&Statement) -> Result<ResultSet, RequestError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            address,
            handler: Some(Box::new(handler)),
            queries: Mutex::new(Vec::new()),
            defunct: AtomicBool::new(false),
            event_sender: Mutex::new(None),
            closed_sender: Mutex::new(None),
        })
    }

    /// A transport that never answers; for timeout tests.
    pub(crate) fn stalled(address: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            address,
            handler: None,
            queries: Mutex::new(Vec::new()),
            defunct: AtomicBool::new(false),
            event_sender: Mutex::new(None),
            closed_sender: Mutex::new(None),
        })
    }

    /// Wires up fresh event/closed channels, as a connector would.
    pub(crate) fn establish(self: &Arc<Self>) -> EstablishedConnection<MockTransport> {
        let (event_sender, events) = mpsc::channel(32);
        let (closed_sender, closed) = oneshot::channel();
        *self.event_sender.lock().unwrap() = Some(event_sender);
        *self.closed_sender.lock().unwrap() = Some(closed_sender);
        EstablishedConnection {
            transport: self.clone(),
            events,
            closed,
        }
    }

    pub(crate) fn push_event(&self, event: Event) {
        self.event_sender
            .lock()
            .unwrap()
            .as_ref()
            .expect("transport not established")
            .try_send(event)
            .unwrap();
    }

    pub(crate) fn break_connection(&self, reason: &str) {
        if let Some(sender) = self.closed_sender.lock().unwrap().take() {
            let _ = sender.send(BrokenConnection::new(reason));
        }
    }

    pub(crate) fn queries(&self) -> Vec<Statement> {
        self.queries.lock().unwrap().clone()
    }

    pub(crate) fn queries_containing(&self, needle: &str) -> Vec<Statement> {
        self.queries()
            .into_iter()
            .filter(|statement| statement.cql.contains(needle))
            .collect()
    }
}

#[async_trait]
impl ControlTransport for MockTransport {
    fn connect_address(&self) -> SocketAddr {
        self.address
    }

    async fn query(&self, statement: Statement) -> Result<ResultSet, RequestError> {
        self.queries.lock().unwrap().push(statement.clone());
        if self.is_defunct() {
            return Err(RequestError::BrokenConnection("defunct".to_owned()));
        }
        match &self.handler {
            Some(handler) => handler(&statement),
            None => std::future::pending().await,
        }
    }

    fn defunct(&self) {
        if !self.defunct.swap(true, Ordering::SeqCst) {
            self.break_connection("defunct");
        }
    }

    fn is_defunct(&self) -> bool {
        self.defunct.load(Ordering::SeqCst)
    }
}

// ===== Connector =====

pub(crate) enum ConnectOutcome {
    Success(Arc<MockTransport>),
    Failure(ConnectError),
}

/// Replays a scripted sequence of connect outcomes (regardless of address)
/// and records every attempt. An exhausted script fails with a connect
/// timeout.
pub(crate) struct MockConnector {
    script: Mutex<VecDeque<ConnectOutcome>>,
    attempts: Mutex<Vec<(SocketAddr, ProtocolVersion)>>,
}

impl MockConnector {
    pub(crate) fn new(outcomes: Vec<ConnectOutcome>) -> Self {
        Self {
            script: Mutex::new(outcomes.into()),
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn attempts(&self) -> Vec<(SocketAddr, ProtocolVersion)> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for Arc<MockConnector> {
    type Transport = MockTransport;

    async fn connect(
        &self,
        address: SocketAddr,
        version: ProtocolVersion,
        _event_types: &[EventType],
    ) -> Result<EstablishedConnection<MockTransport>, ConnectError> {
        self.attempts.lock().unwrap().push((address, version));
        match self.script.lock().unwrap().pop_front() {
            Some(ConnectOutcome::Success(transport)) => Ok(transport.establish()),
            Some(ConnectOutcome::Failure(error)) => Err(error),
            None => Err(ConnectError::Timeout),
        }
    }
}

// ===== Session =====

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum SessionCall {
    OnAdd(SocketAddr),
    OnRemove(SocketAddr),
    OnUp(SocketAddr),
    OnDown(SocketAddr),
    LoadBalancingAdd(SocketAddr),
    LoadBalancingRemove(SocketAddr),
    PurgeHosts { is_initial: bool },
    NewQueryPlan,
    Ready,
    Error(ControlConnectionError),
    TokenMapInit(String),
    TokenMapHostsCleared,
    TokenMapHostAdd(SocketAddr, usize),
    TokenMapHostUpdate(SocketAddr, usize),
    TokenMapHostRemove(SocketAddr),
    TokenMapKeyspacesAdd(usize),
    TokenMapKeyspacesUpdate(usize),
}

/// A session that records every notification and owns a plain host map
/// plus a [`RecordingMetadata`] store.
pub(crate) struct MockSession {
    hosts: Mutex<HashMap<SocketAddr, Arc<Host>>>,
    mark: AtomicU64,
    calls: Mutex<Vec<SessionCall>>,
    pub(crate) metadata: RecordingMetadata,
}

impl MockSession {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            hosts: Mutex::new(HashMap::new()),
            mark: AtomicU64::new(1),
            calls: Mutex::new(Vec::new()),
            metadata: RecordingMetadata::default(),
        })
    }

    pub(crate) fn with_contact_points(addresses: &[SocketAddr]) -> Arc<Self> {
        let session = Self::new();
        for address in addresses {
            session.add_contact_point(*address);
        }
        session
    }

    pub(crate) fn add_contact_point(&self, address: SocketAddr) -> Arc<Host> {
        let host = Arc::new(Host::new(address));
        self.hosts.lock().unwrap().insert(address, host.clone());
        host
    }

    pub(crate) fn host_addresses(&self) -> Vec<SocketAddr> {
        let mut addresses: Vec<_> = self.hosts.lock().unwrap().keys().copied().collect();
        addresses.sort();
        addresses
    }

    pub(crate) fn calls(&self) -> Vec<SessionCall> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn call_count(&self, call: &SessionCall) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    fn record(&self, call: SessionCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn sorted_hosts(&self) -> Vec<Arc<Host>> {
        let mut hosts: Vec<_> = self.hosts.lock().unwrap().values().cloned().collect();
        hosts.sort_by_key(|host| host.address());
        hosts
    }
}

impl Session for MockSession {
    fn hosts_snapshot(&self) -> Vec<Arc<Host>> {
        self.sorted_hosts()
    }

    fn get_host(&self, address: SocketAddr) -> Option<Arc<Host>> {
        self.hosts.lock().unwrap().get(&address).cloned()
    }

    fn add_host(&self, address: SocketAddr) -> Arc<Host> {
        self.add_contact_point(address)
    }

    fn current_host_mark(&self) -> u64 {
        self.mark.load(Ordering::SeqCst)
    }

    fn purge_hosts(&self, is_initial_connection: bool) {
        self.record(SessionCall::PurgeHosts {
            is_initial: is_initial_connection,
        });
        let current = self.current_host_mark();
        self.hosts
            .lock()
            .unwrap()
            .retain(|_, host| host.mark() == current);
        self.mark.fetch_add(1, Ordering::SeqCst);
    }

    fn new_query_plan(&self) -> Box<dyn QueryPlan> {
        self.record(SessionCall::NewQueryPlan);
        Box::new(StartupQueryPlan::new(
            self.sorted_hosts(),
            None::<&mut dyn RngCore>,
        ))
    }

    fn rng(&self) -> Option<Box<dyn RngCore + Send>> {
        None
    }

    fn on_add(&self, host: &Arc<Host>) {
        self.record(SessionCall::OnAdd(host.address()));
    }

    fn on_remove(&self, host: &Arc<Host>) {
        self.record(SessionCall::OnRemove(host.address()));
        self.hosts.lock().unwrap().remove(&host.address());
    }

    fn on_up(&self, host: &Arc<Host>) {
        self.record(SessionCall::OnUp(host.address()));
    }

    fn on_down(&self, host: &Arc<Host>) {
        self.record(SessionCall::OnDown(host.address()));
    }

    fn load_balancing_add(&self, host: &Arc<Host>) {
        self.record(SessionCall::LoadBalancingAdd(host.address()));
    }

    fn load_balancing_remove(&self, host: &Arc<Host>) {
        self.record(SessionCall::LoadBalancingRemove(host.address()));
    }

    fn on_control_connection_ready(&self) {
        self.record(SessionCall::Ready);
    }

    fn on_control_connection_error(&self, error: ControlConnectionError) {
        self.record(SessionCall::Error(error));
    }

    fn metadata(&self) -> &dyn MetadataStore {
        &self.metadata
    }

    fn token_map_init(&self, partitioner: &str) -> bool {
        let call = SessionCall::TokenMapInit(partitioner.to_owned());
        let first = self
            .calls()
            .iter()
            .all(|c| !matches!(c, SessionCall::TokenMapInit(_)));
        self.record(call);
        first
    }

    fn token_map_hosts_cleared(&self) {
        self.record(SessionCall::TokenMapHostsCleared);
    }

    fn token_map_host_add(&self, host: &Arc<Host>, tokens: &[String]) {
        self.record(SessionCall::TokenMapHostAdd(host.address(), tokens.len()));
    }

    fn token_map_host_update(&self, host: &Arc<Host>, tokens: &[String]) {
        self.record(SessionCall::TokenMapHostUpdate(host.address(), tokens.len()));
    }

    fn token_map_host_remove(&self, host: &Arc<Host>) {
        self.record(SessionCall::TokenMapHostRemove(host.address()));
    }

    fn token_map_keyspaces_add(&self, _version: CassandraVersion, keyspaces: &ResultSet) {
        self.record(SessionCall::TokenMapKeyspacesAdd(keyspaces.row_count()));
    }

    fn token_map_keyspaces_update(&self, _version: CassandraVersion, keyspaces: &ResultSet) {
        self.record(SessionCall::TokenMapKeyspacesUpdate(keyspaces.row_count()));
    }
}

// ===== Metadata store =====

#[derive(Default)]
struct MetadataBuffers {
    front: HashMap<String, String>,
    back: HashMap<String, String>,
    updating_back: bool,
}

/// Records every store operation in order, and keeps a tiny double-buffered
/// keyspace map (name → replication) so atomicity and idempotence are
/// observable.
#[derive(Default)]
pub(crate) struct RecordingMetadata {
    ops: Mutex<Vec<String>>,
    buffers: Mutex<MetadataBuffers>,
}

impl RecordingMetadata {
    pub(crate) fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub(crate) fn op_count(&self, op: &str) -> usize {
        self.ops().iter().filter(|o| *o == op).count()
    }

    pub(crate) fn front_keyspaces(&self) -> HashMap<String, String> {
        self.buffers.lock().unwrap().front.clone()
    }

    fn record(&self, op: impl Into<String>) {
        self.ops.lock().unwrap().push(op.into());
    }
}

impl MetadataStore for RecordingMetadata {
    fn clear_and_update_back(&self, _version: CassandraVersion) {
        self.record("clear_and_update_back");
        let mut buffers = self.buffers.lock().unwrap();
        buffers.back.clear();
        buffers.updating_back = true;
    }

    fn update_keyspaces(&self, _version: CassandraVersion, result: &ResultSet) {
        self.record(format!("update_keyspaces:{}", result.row_count()));
        let mut buffers = self.buffers.lock().unwrap();
        for row in result.rows() {
            let (Some(name), Some(replication)) =
                (row.get_str("keyspace_name"), row.get_str("replication"))
            else {
                continue;
            };
            let (name, replication) = (name.to_owned(), replication.to_owned());
            if buffers.updating_back {
                buffers.back.insert(name, replication);
            } else {
                buffers.front.insert(name, replication);
            }
        }
    }

    fn update_tables(&self, _version: CassandraVersion, result: &ResultSet) {
        self.record(format!("update_tables:{}", result.row_count()));
    }

    fn update_views(&self, _version: CassandraVersion, result: &ResultSet) {
        self.record(format!("update_views:{}", result.row_count()));
    }

    fn update_columns(&self, _version: CassandraVersion, result: &ResultSet) {
        self.record(format!("update_columns:{}", result.row_count()));
    }

    fn update_indexes(&self, _version: CassandraVersion, result: &ResultSet) {
        self.record(format!("update_indexes:{}", result.row_count()));
    }

    fn update_user_types(&self, _version: CassandraVersion, result: &ResultSet) {
        self.record(format!("update_user_types:{}", result.row_count()));
    }

    fn update_functions(&self, _version: CassandraVersion, result: &ResultSet) {
        self.record(format!("update_functions:{}", result.row_count()));
    }

    fn update_aggregates(&self, _version: CassandraVersion, result: &ResultSet) {
        self.record(format!("update_aggregates:{}", result.row_count()));
    }

    fn drop_keyspace(&self, keyspace: &str) {
        self.record(format!("drop_keyspace:{keyspace}"));
        self.buffers.lock().unwrap().front.remove(keyspace);
    }

    fn drop_table_or_view(&self, keyspace: &str, name: &str) {
        self.record(format!("drop_table_or_view:{keyspace}.{name}"));
    }

    fn drop_user_type(&self, keyspace: &str, name: &str) {
        self.record(format!("drop_user_type:{keyspace}.{name}"));
    }

    fn drop_function(&self, keyspace: &str, full_name: &str) {
        self.record(format!("drop_function:{keyspace}.{full_name}"));
    }

    fn drop_aggregate(&self, keyspace: &str, full_name: &str) {
        self.record(format!("drop_aggregate:{keyspace}.{full_name}"));
    }

    fn swap_to_back_and_update_front(&self) {
        self.record("swap_to_back_and_update_front");
        let mut buffers = self.buffers.lock().unwrap();
        let back = std::mem::take(&mut buffers.back);
        buffers.front = back;
        buffers.updating_back = false;
    }
}
