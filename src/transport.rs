//! Seam towards the wire-level connection.
//!
//! The control channel never touches sockets or the frame codec itself; it
//! drives a [`Connector`] to open connections and a [`ControlTransport`] to
//! issue queries on them. An established connection additionally carries
//! two channels: decoded server events, and a one-shot close notification
//! fired when the connection breaks (including after [`defunct`]).
//!
//! [`defunct`]: ControlTransport::defunct

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::errors::{BrokenConnection, ConnectError, RequestError};
use crate::frame::events::{Event, EventType};
use crate::frame::response::{CqlValue, ResultSet};
use crate::protocol::ProtocolVersion;

/// A CQL statement issued on the control connection: the query text plus
/// optional bound values (only the targeted function/aggregate refresh
/// binds values).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Statement {
    pub cql: String,
    pub values: Vec<CqlValue>,
}

impl Statement {
    pub fn new(cql: impl Into<String>) -> Self {
        Self {
            cql: cql.into(),
            values: Vec::new(),
        }
    }

    pub fn with_values(cql: impl Into<String>, values: Vec<CqlValue>) -> Self {
        Self {
            cql: cql.into(),
            values,
        }
    }
}

/// A live connection usable for control queries.
///
/// The control channel owns at most one of these at a time and holds it in
/// an `Arc`; outstanding requests keep the transport alive but observe
/// [`defunct`](ControlTransport::defunct) through failed queries.
#[async_trait]
pub trait ControlTransport: Send + Sync + 'static {
    /// The address this connection was opened to. Peer-row self detection
    /// and the port inherited by resolved peer addresses both derive from
    /// it.
    fn connect_address(&self) -> SocketAddr;

    /// Executes a statement and returns its decoded rows.
    async fn query(&self, statement: Statement) -> Result<ResultSet, RequestError>;

    /// Marks the connection unusable and closes it. The closed channel of
    /// the corresponding [`EstablishedConnection`] fires as a result.
    fn defunct(&self);

    fn is_defunct(&self) -> bool;
}

/// A freshly opened control connection together with its notification
/// channels.
pub struct EstablishedConnection<T> {
    pub transport: Arc<T>,
    /// Server events the connection was registered for.
    pub events: mpsc::Receiver<Event>,
    /// Fires once when the connection breaks or is defuncted. A dropped
    /// sender is treated the same as an explicit notification.
    pub closed: oneshot::Receiver<BrokenConnection>,
}

/// Opens control connections: TCP/TLS handshake, protocol startup at the
/// requested version, authentication, and event registration.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Transport: ControlTransport;

    async fn connect(
        &self,
        address: SocketAddr,
        version: ProtocolVersion,
        event_types: &[EventType],
    ) -> Result<EstablishedConnection<Self::Transport>, ConnectError>;
}
