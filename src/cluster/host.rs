use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use thiserror::Error;

/// Version of the server a host is running, as reported in the
/// `release_version` column of `system.local`/`system.peers`.
///
/// Trailing labels (`4.0.0-SNAPSHOT`) are ignored when parsing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CassandraVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl CassandraVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid release version string: {0:?}")]
pub struct CassandraVersionParseError(pub String);

impl FromStr for CassandraVersion {
    type Err = CassandraVersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        fn leading_number(part: &str) -> Option<u32> {
            let digits: &str = part
                .split_once(|c: char| !c.is_ascii_digit())
                .map(|(digits, _)| digits)
                .unwrap_or(part);
            digits.parse().ok()
        }

        let mut parts = s.split('.');
        let major = parts.next().and_then(leading_number);
        let minor = parts.next().and_then(leading_number);
        let patch = parts.next().map(leading_number);

        match (major, minor, patch) {
            (Some(major), Some(minor), None) => Ok(Self::new(major, minor, 0)),
            (Some(major), Some(minor), Some(Some(patch))) => Ok(Self::new(major, minor, patch)),
            _ => Err(CassandraVersionParseError(s.to_owned())),
        }
    }
}

impl fmt::Display for CassandraVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// A cluster node as seen by the control channel, keyed by its contact
/// address.
///
/// Hosts are shared between the control channel and the session's host map,
/// so all attributes are interior-mutable. The freshness mark is a
/// generation counter: a full hosts refresh stamps every host still
/// reported by the cluster with the session's current mark, and the session
/// purges hosts whose mark did not advance.
#[derive(Debug)]
pub struct Host {
    address: SocketAddr,
    info: Mutex<HostInfo>,
    is_up: AtomicBool,
    mark: AtomicU64,
    was_just_added: AtomicBool,
}

#[derive(Debug, Default)]
struct HostInfo {
    datacenter: Option<String>,
    rack: Option<String>,
    server_version: Option<CassandraVersion>,
    listen_address: Option<String>,
}

impl Host {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            info: Mutex::new(HostInfo::default()),
            is_up: AtomicBool::new(true),
            mark: AtomicU64::new(0),
            was_just_added: AtomicBool::new(true),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn datacenter(&self) -> Option<String> {
        self.info.lock().unwrap().datacenter.clone()
    }

    pub fn rack(&self) -> Option<String> {
        self.info.lock().unwrap().rack.clone()
    }

    /// Overwrites rack and datacenter with the provided values; `None`
    /// leaves the current value in place (rows on old servers may omit
    /// either column).
    pub fn set_rack_and_datacenter(&self, rack: Option<&str>, datacenter: Option<&str>) {
        let mut info = self.info.lock().unwrap();
        if let Some(rack) = rack {
            info.rack = Some(rack.to_owned());
        }
        if let Some(datacenter) = datacenter {
            info.datacenter = Some(datacenter.to_owned());
        }
    }

    pub fn server_version(&self) -> Option<CassandraVersion> {
        self.info.lock().unwrap().server_version
    }

    pub fn set_server_version(&self, version: CassandraVersion) {
        self.info.lock().unwrap().server_version = Some(version);
    }

    /// The host's internal (listen) address as reported in the `peer`
    /// column, used to look the host up in `system.peers`.
    pub fn listen_address(&self) -> Option<String> {
        self.info.lock().unwrap().listen_address.clone()
    }

    pub fn set_listen_address(&self, address: String) {
        self.info.lock().unwrap().listen_address = Some(address);
    }

    pub fn is_up(&self) -> bool {
        self.is_up.load(Ordering::Relaxed)
    }

    pub fn set_up(&self) {
        self.is_up.store(true, Ordering::Relaxed);
    }

    pub fn set_down(&self) {
        self.is_up.store(false, Ordering::Relaxed);
    }

    pub fn mark(&self) -> u64 {
        self.mark.load(Ordering::Relaxed)
    }

    pub fn set_mark(&self, mark: u64) {
        self.mark.store(mark, Ordering::Relaxed);
    }

    /// True until the host's node info has been applied for the first time.
    /// Brand-new hosts always have their tokens queried, and rack/DC
    /// changes on them do not generate load-balancer notifications.
    pub fn was_just_added(&self) -> bool {
        self.was_just_added.load(Ordering::Relaxed)
    }

    pub fn set_just_added(&self, just_added: bool) {
        self.was_just_added.store(just_added, Ordering::Relaxed);
    }
}
