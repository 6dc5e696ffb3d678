use crate::utils::format_utils::format_rate;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use shapingd_common::TrafficShapingPolicy;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// What a policy is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PolicyTarget {
    Uid(u32),
    Gid(u32),
    App(String),
}

impl PolicyTarget {
    /// Parse a `(kind, key)` pair such as `("uid", "1000")` or `("app", "cms")`.
    pub fn parse(kind: &str, key: &str) -> Result<Self, anyhow::Error> {
        match kind {
            "uid" => key
                .parse::<u32>()
                .map(PolicyTarget::Uid)
                .map_err(|_| anyhow::anyhow!("Invalid uid '{}'", key)),
            "gid" => key
                .parse::<u32>()
                .map(PolicyTarget::Gid)
                .map_err(|_| anyhow::anyhow!("Invalid gid '{}'", key)),
            "app" => {
                if key.is_empty() {
                    Err(anyhow::anyhow!("Application name cannot be empty"))
                } else {
                    Ok(PolicyTarget::App(key.to_string()))
                }
            }
            other => Err(anyhow::anyhow!(
                "Unknown policy target '{}', expected uid, gid or app",
                other
            )),
        }
    }
}

impl fmt::Display for PolicyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyTarget::Uid(uid) => write!(f, "uid={}", uid),
            PolicyTarget::Gid(gid) => write!(f, "gid={}", gid),
            PolicyTarget::App(app) => write!(f, "app={}", app),
        }
    }
}

/// Full copy of every policy, as served over HTTP and written to disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyTable {
    pub uid: BTreeMap<u32, TrafficShapingPolicy>,
    pub gid: BTreeMap<u32, TrafficShapingPolicy>,
    pub app: BTreeMap<String, TrafficShapingPolicy>,
}

impl PolicyTable {
    pub fn len(&self) -> usize {
        self.uid.len() + self.gid.len() + self.app.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
struct Policies {
    uid: HashMap<u32, TrafficShapingPolicy>,
    gid: HashMap<u32, TrafficShapingPolicy>,
    app: HashMap<String, TrafficShapingPolicy>,
}

/// Throttling policies keyed by uid, gid and application name.
///
/// Getters return copies so callers never hold the lock.
#[derive(Debug, Default)]
pub struct PolicyStore {
    inner: RwLock<Policies>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, target: &PolicyTarget, policy: TrafficShapingPolicy) {
        {
            let mut inner = self.inner.write();
            match target {
                PolicyTarget::Uid(uid) => {
                    inner.uid.insert(*uid, policy);
                }
                PolicyTarget::Gid(gid) => {
                    inner.gid.insert(*gid, policy);
                }
                PolicyTarget::App(app) => {
                    inner.app.insert(app.clone(), policy);
                }
            }
        }
        log::info!(
            "Set traffic shaping policy {}: read limit {}, write limit {}, read reservation {}, write reservation {}, enabled {}",
            target,
            format_rate(policy.limit_read_bytes_per_sec),
            format_rate(policy.limit_write_bytes_per_sec),
            format_rate(policy.reservation_read_bytes_per_sec),
            format_rate(policy.reservation_write_bytes_per_sec),
            policy.is_enabled
        );
    }

    pub fn get(&self, target: &PolicyTarget) -> Option<TrafficShapingPolicy> {
        let inner = self.inner.read();
        match target {
            PolicyTarget::Uid(uid) => inner.uid.get(uid).copied(),
            PolicyTarget::Gid(gid) => inner.gid.get(gid).copied(),
            PolicyTarget::App(app) => inner.app.get(app).copied(),
        }
    }

    /// Returns the removed policy, if there was one.
    pub fn remove(&self, target: &PolicyTarget) -> Option<TrafficShapingPolicy> {
        let removed = {
            let mut inner = self.inner.write();
            match target {
                PolicyTarget::Uid(uid) => inner.uid.remove(uid),
                PolicyTarget::Gid(gid) => inner.gid.remove(gid),
                PolicyTarget::App(app) => inner.app.remove(app),
            }
        };
        if removed.is_some() {
            log::info!("Removed traffic shaping policy {}", target);
        }
        removed
    }

    pub fn uid_policies(&self) -> HashMap<u32, TrafficShapingPolicy> {
        self.inner.read().uid.clone()
    }

    pub fn gid_policies(&self) -> HashMap<u32, TrafficShapingPolicy> {
        self.inner.read().gid.clone()
    }

    pub fn app_policies(&self) -> HashMap<String, TrafficShapingPolicy> {
        self.inner.read().app.clone()
    }

    pub fn snapshot(&self) -> PolicyTable {
        let inner = self.inner.read();
        PolicyTable {
            uid: inner.uid.iter().map(|(k, v)| (*k, *v)).collect(),
            gid: inner.gid.iter().map(|(k, v)| (*k, *v)).collect(),
            app: inner.app.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        }
    }

    /// Replace every policy with the contents of `table`.
    pub fn replace(&self, table: PolicyTable) {
        let mut inner = self.inner.write();
        inner.uid = table.uid.into_iter().collect();
        inner.gid = table.gid.into_iter().collect();
        inner.app = table.app.into_iter().collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(read: u64, write: u64) -> TrafficShapingPolicy {
        TrafficShapingPolicy {
            limit_read_bytes_per_sec: read,
            limit_write_bytes_per_sec: write,
            is_enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_app_policy_round_trip() {
        let store = PolicyStore::new();
        let target = PolicyTarget::App("app1".to_string());
        let p = policy(1_000, 2_000);

        store.set(&target, p);
        assert_eq!(store.get(&target), Some(p));

        assert_eq!(store.remove(&target), Some(p));
        assert_eq!(store.get(&target), None);
        assert_eq!(store.remove(&target), None);
    }

    #[test]
    fn test_targets_are_separate_namespaces() {
        let store = PolicyStore::new();
        store.set(&PolicyTarget::Uid(42), policy(1, 0));
        store.set(&PolicyTarget::Gid(42), policy(2, 0));

        assert_eq!(
            store.get(&PolicyTarget::Uid(42)).map(|p| p.limit_read_bytes_per_sec),
            Some(1)
        );
        assert_eq!(
            store.get(&PolicyTarget::Gid(42)).map(|p| p.limit_read_bytes_per_sec),
            Some(2)
        );
        assert_eq!(store.get(&PolicyTarget::App("42".to_string())), None);

        store.remove(&PolicyTarget::Uid(42));
        assert!(store.uid_policies().is_empty());
        assert_eq!(store.gid_policies().len(), 1);
    }

    #[test]
    fn test_set_overwrites() {
        let store = PolicyStore::new();
        store.set(&PolicyTarget::App("cms".to_string()), policy(1, 1));
        store.set(&PolicyTarget::App("cms".to_string()), policy(5, 5));
        assert_eq!(store.app_policies().len(), 1);
        assert_eq!(store.get(&PolicyTarget::App("cms".to_string())), Some(policy(5, 5)));
    }

    #[test]
    fn test_snapshot_and_replace() {
        let store = PolicyStore::new();
        store.set(&PolicyTarget::Uid(1), policy(10, 0));
        store.set(&PolicyTarget::App("cms".to_string()), policy(0, 20));

        let table = store.snapshot();
        assert_eq!(table.len(), 2);

        let other = PolicyStore::new();
        other.set(&PolicyTarget::Gid(7), policy(1, 1));
        other.replace(table.clone());
        assert_eq!(other.snapshot(), table);
        assert_eq!(other.get(&PolicyTarget::Gid(7)), None);
    }

    #[test]
    fn test_parse_target() {
        assert_eq!(PolicyTarget::parse("uid", "1000").unwrap(), PolicyTarget::Uid(1000));
        assert_eq!(PolicyTarget::parse("gid", "0").unwrap(), PolicyTarget::Gid(0));
        assert_eq!(
            PolicyTarget::parse("app", "cms").unwrap(),
            PolicyTarget::App("cms".to_string())
        );
        assert!(PolicyTarget::parse("uid", "-1").is_err());
        assert!(PolicyTarget::parse("app", "").is_err());
        assert!(PolicyTarget::parse("host", "x").is_err());
    }
}
