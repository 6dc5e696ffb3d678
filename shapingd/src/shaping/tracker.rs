use shapingd_common::{ReportEntry, StreamIdentity};
use std::collections::HashMap;

/// Last counters a node reported for one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamState {
    pub last_bytes_read: u64,
    pub last_bytes_written: u64,
    pub last_iops_read: u64,
    pub last_iops_write: u64,
    pub generation_id: u64,
    pub last_update_ms: u64,
}

/// Traffic observed for one stream since the previous report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamDelta {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub read_ops: u64,
    pub write_ops: u64,
}

impl StreamDelta {
    pub fn is_zero(&self) -> bool {
        self.bytes_read == 0 && self.bytes_written == 0 && self.read_ops == 0 && self.write_ops == 0
    }
}

// A counter that went backwards without a generation change yields nothing.
fn counter_delta(now: u64, last: u64) -> u64 {
    if now >= last {
        now - last
    } else {
        0
    }
}

/// Converts the monotonic counters each node reports into per-report deltas.
#[derive(Debug, Default)]
pub struct PerNodeDeltaTracker {
    nodes: HashMap<String, HashMap<StreamIdentity, StreamState>>,
}

impl PerNodeDeltaTracker {
    /// Record one report entry from `node_id` and return the traffic it adds.
    ///
    /// A changed generation id means the node restarted its counters, so the
    /// whole reported total counts as new traffic.
    pub fn apply(&mut self, node_id: &str, entry: &ReportEntry, now_ms: u64) -> StreamDelta {
        let state = self
            .nodes
            .entry(node_id.to_string())
            .or_default()
            .entry(entry.stream())
            .or_default();

        let delta = if state.generation_id != entry.generation_id {
            state.generation_id = entry.generation_id;
            StreamDelta {
                bytes_read: entry.total_bytes_read,
                bytes_written: entry.total_bytes_written,
                read_ops: entry.total_read_ops,
                write_ops: entry.total_write_ops,
            }
        } else {
            StreamDelta {
                bytes_read: counter_delta(entry.total_bytes_read, state.last_bytes_read),
                bytes_written: counter_delta(entry.total_bytes_written, state.last_bytes_written),
                read_ops: counter_delta(entry.total_read_ops, state.last_iops_read),
                write_ops: counter_delta(entry.total_write_ops, state.last_iops_write),
            }
        };

        state.last_bytes_read = entry.total_bytes_read;
        state.last_bytes_written = entry.total_bytes_written;
        state.last_iops_read = entry.total_read_ops;
        state.last_iops_write = entry.total_write_ops;
        state.last_update_ms = now_ms;

        delta
    }

    #[cfg(test)]
    pub fn state(&self, node_id: &str, stream: &StreamIdentity) -> Option<StreamState> {
        self.nodes.get(node_id)?.get(stream).copied()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[cfg(test)]
    pub fn stream_count(&self) -> usize {
        self.nodes.values().map(|m| m.len()).sum()
    }

    /// Every (node, stream) pair's stream identity; repeats once per node.
    pub fn streams(&self) -> impl Iterator<Item = &StreamIdentity> {
        self.nodes.values().flat_map(|m| m.keys())
    }

    /// Drop streams not updated within `max_idle_ms`, then nodes left empty.
    /// Returns `(removed_nodes, removed_streams)`.
    pub fn remove_idle(&mut self, now_ms: u64, max_idle_ms: u64) -> (u64, u64) {
        let mut removed_nodes = 0;
        let mut removed_streams = 0;

        self.nodes.retain(|_, streams| {
            let before = streams.len();
            streams.retain(|_, state| now_ms.saturating_sub(state.last_update_ms) <= max_idle_ms);
            removed_streams += (before - streams.len()) as u64;

            if streams.is_empty() {
                removed_nodes += 1;
                false
            } else {
                true
            }
        });

        (removed_nodes, removed_streams)
    }
}
