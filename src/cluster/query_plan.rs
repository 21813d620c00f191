use std::sync::Arc;

use rand::RngCore;

use crate::cluster::host::Host;

/// A finite, non-restartable sequence of candidate hosts for connect
/// attempts. Each host appears at most once; exhaustion means no hosts are
/// available.
///
/// After the control channel reaches `Ready`, plans come from the session's
/// load-balancing policy via `Session::new_query_plan`.
pub trait QueryPlan: Send + Sync {
    fn next(&mut self) -> Option<Arc<Host>>;
}

/// The plan used before the load-balancing policy has been initialized:
/// a snapshot of the host map, walked from a random offset.
pub(crate) struct StartupQueryPlan {
    hosts: Vec<Arc<Host>>,
    index: usize,
    count: usize,
}

impl StartupQueryPlan {
    /// `rng` is the session's random source, if it has one; without it the
    /// walk starts at index 0.
    pub(crate) fn new<R: RngCore + ?Sized>(hosts: Vec<Arc<Host>>, rng: Option<&mut R>) -> Self {
        let index = match rng {
            Some(rng) if !hosts.is_empty() => (rng.next_u64() % hosts.len() as u64) as usize,
            _ => 0,
        };
        Self {
            hosts,
            index,
            count: 0,
        }
    }
}

impl QueryPlan for StartupQueryPlan {
    fn next(&mut self) -> Option<Arc<Host>> {
        if self.count >= self.hosts.len() {
            return None;
        }
        let index = (self.index + self.count) % self.hosts.len();
        self.count += 1;
        Some(self.hosts[index].clone())
    }
}
