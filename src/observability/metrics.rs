use std::sync::atomic::{AtomicU64, Ordering};

const ORDER_TYPE: Ordering = Ordering::Relaxed;

/// Counters describing the control channel's activity.
#[derive(Debug, Default)]
pub struct Metrics {
    connect_attempts: AtomicU64,
    protocol_downgrades: AtomicU64,
    hosts_refreshes: AtomicU64,
    schema_refreshes: AtomicU64,
    server_events: AtomicU64,
    defunct_connections: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    pub(crate) fn record_connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, ORDER_TYPE);
    }

    pub(crate) fn record_protocol_downgrade(&self) {
        self.protocol_downgrades.fetch_add(1, ORDER_TYPE);
    }

    pub(crate) fn record_hosts_refresh(&self) {
        self.hosts_refreshes.fetch_add(1, ORDER_TYPE);
    }

    pub(crate) fn record_schema_refresh(&self) {
        self.schema_refreshes.fetch_add(1, ORDER_TYPE);
    }

    pub(crate) fn record_server_event(&self) {
        self.server_events.fetch_add(1, ORDER_TYPE);
    }

    pub(crate) fn record_defunct(&self) {
        self.defunct_connections.fetch_add(1, ORDER_TYPE);
    }

    /// Number of connection attempts, including protocol-downgrade retries.
    pub fn get_connect_attempts(&self) -> u64 {
        self.connect_attempts.load(ORDER_TYPE)
    }

    pub fn get_protocol_downgrades(&self) -> u64 {
        self.protocol_downgrades.load(ORDER_TYPE)
    }

    pub fn get_hosts_refreshes(&self) -> u64 {
        self.hosts_refreshes.load(ORDER_TYPE)
    }

    pub fn get_schema_refreshes(&self) -> u64 {
        self.schema_refreshes.load(ORDER_TYPE)
    }

    pub fn get_server_events(&self) -> u64 {
        self.server_events.load(ORDER_TYPE)
    }

    pub fn get_defunct_connections(&self) -> u64 {
        self.defunct_connections.load(ORDER_TYPE)
    }
}
