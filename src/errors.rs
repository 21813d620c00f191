use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::ProtocolVersion;

/// Fatal control-connection failures.
///
/// These are the only errors that escape to the session, and they can only
/// be raised while the initial connection is being established. Every other
/// failure is recovered from internally by defuncting the connection and
/// reconnecting.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ControlConnectionError {
    /// The query plan was exhausted before any host accepted a connection.
    #[error("No hosts available for the control connection")]
    NoHostsAvailable,

    /// Protocol negotiation walked below the lowest supported version.
    #[error("Not even protocol version 1 is supported")]
    NoSupportedProtocol,

    /// The server rejected the configured credentials.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// The TLS handshake with the server failed.
    #[error("TLS error: {0}")]
    Tls(String),
}

/// Failure to open a connection to a single host.
///
/// Returned by [`Connector::connect`](crate::transport::Connector::connect).
/// [`Io`](ConnectError::Io) and [`Timeout`](ConnectError::Timeout) are
/// transient: the state machine moves on to the next host in the plan.
/// The remaining variants receive special treatment (see
/// `ControlConnection::connect`).
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectError {
    /// The server rejected the proposed protocol version.
    #[error("Server rejected protocol version {0}")]
    InvalidProtocol(ProtocolVersion),

    /// The server rejected the configured credentials.
    #[error("Bad credentials: {0}")]
    Authentication(String),

    /// The TLS handshake failed.
    #[error("TLS handshake failed: {0}")]
    Tls(String),

    /// Transport-level failure (connection refused, reset, ...).
    #[error("IO error: {0}")]
    Io(#[from] Arc<std::io::Error>),

    /// The connect attempt did not complete in time.
    #[error("Connect timeout")]
    Timeout,
}

/// Failure of a single query issued on the control connection.
///
/// Any of these defuncts the connection; the resulting close notification
/// drives the reconnect cycle.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestError {
    /// The server responded with an error message.
    #[error("Database returned an error: {0}")]
    Db(String),

    /// The response could not be decoded as a result set.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// The per-request timeout elapsed before a response arrived.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The connection broke while the request was in flight.
    #[error("Connection broken: {0}")]
    BrokenConnection(String),

    /// No more request slots are available on the connection.
    #[error("Unable to allocate a stream id")]
    UnableToAllocStreamId,
}

/// Reason a live control connection stopped being usable, delivered through
/// the closed-notification channel of an established connection.
#[derive(Error, Debug, Clone)]
#[error("{reason}")]
pub struct BrokenConnection {
    pub reason: String,
}

impl BrokenConnection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Internal failure of a metadata refresh.
///
/// Every variant leaves the connection defunct; callers either give up on
/// the current host (initial connect) or wait for the close notification
/// (steady state).
#[derive(Error, Debug)]
pub(crate) enum RefreshError {
    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("no live control connection")]
    NoConnection,

    #[error("no row found in the host's local system table")]
    EmptyLocal,

    #[error("connected host missing from the session host map")]
    UnknownLocalHost,
}
