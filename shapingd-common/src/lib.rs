#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;

/// One logical traffic stream: the (application, uid, gid) triple a storage
/// node attributes I/O to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StreamIdentity {
    pub app: String,
    pub uid: u32,
    pub gid: u32,
}

impl StreamIdentity {
    pub fn new(app: impl Into<String>, uid: u32, gid: u32) -> Self {
        Self {
            app: app.into(),
            uid,
            gid,
        }
    }
}

/// Throttling policy attached to a uid, a gid or an application name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TrafficShapingPolicy {
    pub limit_write_bytes_per_sec: u64,
    pub limit_read_bytes_per_sec: u64,
    pub reservation_write_bytes_per_sec: u64,
    pub reservation_read_bytes_per_sec: u64,
    pub is_enabled: bool,
}

impl TrafficShapingPolicy {
    /// All four limits and reservations are zero.
    pub fn is_empty(&self) -> bool {
        self.limit_write_bytes_per_sec == 0
            && self.limit_read_bytes_per_sec == 0
            && self.reservation_write_bytes_per_sec == 0
            && self.reservation_read_bytes_per_sec == 0
    }

    pub fn is_active(&self) -> bool {
        self.is_enabled && !self.is_empty()
    }
}

/// Monotonic counters for one stream as seen by one reporting node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ReportEntry {
    pub app_name: String,
    pub uid: u32,
    pub gid: u32,
    pub generation_id: u64,
    pub total_bytes_read: u64,
    pub total_bytes_written: u64,
    pub total_read_ops: u64,
    pub total_write_ops: u64,
}

impl ReportEntry {
    pub fn stream(&self) -> StreamIdentity {
        StreamIdentity::new(self.app_name.clone(), self.uid, self.gid)
    }
}

/// Periodic I/O report sent by a storage node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NodeReport {
    pub node_id: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub entries: Vec<ReportEntry>,
}

/// Injected I/O delays (microseconds) pushed to storage nodes.
///
/// Sparse: only throttled entities appear. Rebuilt from scratch on every
/// controller tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DelayConfig {
    pub app_read_delay_us: BTreeMap<String, u64>,
    pub app_write_delay_us: BTreeMap<String, u64>,
    pub uid_read_delay_us: BTreeMap<u32, u64>,
    pub uid_write_delay_us: BTreeMap<u32, u64>,
    pub gid_read_delay_us: BTreeMap<u32, u64>,
    pub gid_write_delay_us: BTreeMap<u32, u64>,
}

impl DelayConfig {
    pub fn is_empty(&self) -> bool {
        self.app_read_delay_us.is_empty()
            && self.app_write_delay_us.is_empty()
            && self.uid_read_delay_us.is_empty()
            && self.uid_write_delay_us.is_empty()
            && self.gid_read_delay_us.is_empty()
            && self.gid_write_delay_us.is_empty()
    }

    /// Number of throttled (entity, direction) pairs.
    pub fn len(&self) -> usize {
        self.app_read_delay_us.len()
            + self.app_write_delay_us.len()
            + self.uid_read_delay_us.len()
            + self.uid_write_delay_us.len()
            + self.gid_read_delay_us.len()
            + self.gid_write_delay_us.len()
    }
}
