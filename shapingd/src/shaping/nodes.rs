use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Config key under which the delay configuration is pushed to nodes.
pub const IO_LIMITS_CONFIG_KEY: &str = "traffic_shaping.io_limits";

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub name: String,
    pub status: String,
}

impl NodeEntry {
    pub fn is_online(&self) -> bool {
        self.status == STATUS_ONLINE
    }
}

/// Storage nodes the engine pushes delay configurations to.
pub trait NodeDirectory: Send + Sync {
    fn nodes(&self) -> Vec<NodeEntry>;

    /// Store an opaque config blob on `node` under `key`.
    fn set_config(&self, node: &str, key: &str, value: &[u8]) -> Result<(), anyhow::Error>;
}

#[derive(Debug, Default)]
struct NodeRecord {
    status: String,
    config: BTreeMap<String, Vec<u8>>,
}

/// In-process node directory. Nodes register and fetch their config over
/// the HTTP API.
#[derive(Debug, Default)]
pub struct StaticNodeDirectory {
    nodes: RwLock<BTreeMap<String, NodeRecord>>,
}

impl StaticNodeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `names` as online nodes.
    pub fn with_online_nodes<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let directory = Self::new();
        for name in names {
            let name: String = name.into();
            directory.set_status(&name, STATUS_ONLINE);
        }
        directory
    }

    /// Create or update a node. Existing config blobs are kept.
    pub fn set_status(&self, name: &str, status: &str) {
        let mut nodes = self.nodes.write();
        let record = nodes.entry(name.to_string()).or_default();
        if record.status != status {
            log::info!("Node {} is now {}", name, status);
            record.status = status.to_string();
        }
    }

    pub fn remove(&self, name: &str) -> bool {
        self.nodes.write().remove(name).is_some()
    }

    pub fn config(&self, node: &str, key: &str) -> Option<Vec<u8>> {
        self.nodes.read().get(node)?.config.get(key).cloned()
    }
}

impl NodeDirectory for StaticNodeDirectory {
    fn nodes(&self) -> Vec<NodeEntry> {
        self.nodes
            .read()
            .iter()
            .map(|(name, record)| NodeEntry {
                name: name.clone(),
                status: record.status.clone(),
            })
            .collect()
    }

    fn set_config(&self, node: &str, key: &str, value: &[u8]) -> Result<(), anyhow::Error> {
        let mut nodes = self.nodes.write();
        let record = nodes
            .get_mut(node)
            .ok_or_else(|| anyhow::anyhow!("Unknown node '{}'", node))?;
        record.config.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_push() {
        let directory = StaticNodeDirectory::with_online_nodes(["fst1", "fst2"]);
        directory.set_status("fst2", STATUS_OFFLINE);

        let nodes = directory.nodes();
        assert_eq!(nodes.len(), 2);
        assert!(nodes[0].is_online());
        assert!(!nodes[1].is_online());

        directory.set_config("fst1", IO_LIMITS_CONFIG_KEY, b"{}").unwrap();
        assert_eq!(
            directory.config("fst1", IO_LIMITS_CONFIG_KEY),
            Some(b"{}".to_vec())
        );
        assert_eq!(directory.config("fst2", IO_LIMITS_CONFIG_KEY), None);
        assert!(directory.set_config("fst9", IO_LIMITS_CONFIG_KEY, b"{}").is_err());
    }

    #[test]
    fn test_status_change_keeps_config() {
        let directory = StaticNodeDirectory::with_online_nodes(["fst1"]);
        directory.set_config("fst1", "k", b"v").unwrap();
        directory.set_status("fst1", STATUS_OFFLINE);
        assert_eq!(directory.config("fst1", "k"), Some(b"v".to_vec()));
        assert!(directory.remove("fst1"));
        assert!(directory.nodes().is_empty());
    }
}
