use crate::shaping::aggregator::GroupedRates;
use crate::shaping::policy::PolicyTable;
use shapingd_common::{DelayConfig, TrafficShapingPolicy};
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Upper bound of any injected delay (1 s).
pub const MAX_DELAY_US: u64 = 1_000_000;
/// Largest change of a delay in one controller tick.
pub const MAX_STEP_US: i64 = (MAX_DELAY_US / 20) as i64;

// A zero delay cannot grow multiplicatively; start from here instead.
const SEED_DELAY_US: u64 = 100;
// Below this, once under the limit, the delay is dropped entirely.
const SNAP_THRESHOLD_US: u64 = 10;

const GAIN_OVER_LIMIT: f64 = 0.15;
const GAIN_UNDER_LIMIT: f64 = 0.05;

/// One damped proportional step from `current_us` given `ratio = rate / limit`.
pub fn next_delay(current_us: u64, ratio: f64) -> u64 {
    let mut delay = if current_us == 0 && ratio > 1.0 {
        SEED_DELAY_US
    } else {
        let kp = if ratio > 1.0 {
            GAIN_OVER_LIMIT
        } else {
            GAIN_UNDER_LIMIT
        };
        let damped_ratio = 1.0 + (ratio - 1.0) * kp;

        let current = current_us.min(MAX_DELAY_US) as i64;
        let target = (current as f64 * damped_ratio) as i64;
        let step = (target - current).clamp(-MAX_STEP_US, MAX_STEP_US);
        (current + step).max(0) as u64
    };

    delay = delay.min(MAX_DELAY_US);
    if delay < SNAP_THRESHOLD_US && ratio < 1.0 {
        delay = 0;
    }
    delay
}

#[derive(Debug, Default)]
struct Delays<K> {
    read: HashMap<K, u64>,
    write: HashMap<K, u64>,
}

/// Converts measured rates and policy limits into per-entity I/O delays.
///
/// Delays persist between ticks so each tick moves them by at most
/// [`MAX_STEP_US`]. An entity whose policy disappears or becomes inactive
/// loses its delay state and restarts from zero.
#[derive(Debug, Default)]
pub struct LimitController {
    app: Delays<String>,
    uid: Delays<u32>,
    gid: Delays<u32>,
}

impl LimitController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one controller tick and return the full delay configuration.
    pub fn compute(&mut self, rates: &GroupedRates, policies: &PolicyTable) -> DelayConfig {
        let mut config = DelayConfig::default();

        control(
            &policies.app,
            &rates.app,
            &mut self.app,
            &mut config.app_read_delay_us,
            &mut config.app_write_delay_us,
        );
        control(
            &policies.uid,
            &rates.uid,
            &mut self.uid,
            &mut config.uid_read_delay_us,
            &mut config.uid_write_delay_us,
        );
        control(
            &policies.gid,
            &rates.gid,
            &mut self.gid,
            &mut config.gid_read_delay_us,
            &mut config.gid_write_delay_us,
        );

        config
    }

    #[cfg(test)]
    pub fn app_write_delay(&self, app: &str) -> u64 {
        self.app.write.get(app).copied().unwrap_or(0)
    }

    #[cfg(test)]
    pub fn app_read_delay(&self, app: &str) -> u64 {
        self.app.read.get(app).copied().unwrap_or(0)
    }
}

fn control<K>(
    policies: &BTreeMap<K, TrafficShapingPolicy>,
    rates: &HashMap<K, (f64, f64)>,
    state: &mut Delays<K>,
    read_out: &mut BTreeMap<K, u64>,
    write_out: &mut BTreeMap<K, u64>,
) where
    K: Clone + Eq + Hash + Ord + std::fmt::Debug,
{
    let mut next = Delays {
        read: HashMap::new(),
        write: HashMap::new(),
    };

    for (key, policy) in policies {
        if !policy.is_active() {
            continue;
        }
        let (read_rate, write_rate) = rates.get(key).copied().unwrap_or((0.0, 0.0));

        if policy.limit_write_bytes_per_sec > 0 {
            let ratio = write_rate / policy.limit_write_bytes_per_sec as f64;
            let previous = state.write.get(key).copied().unwrap_or(0);
            let delay = next_delay(previous, ratio);
            if delay != previous {
                log::debug!("Write delay for {:?}: {} -> {} us (ratio {:.3})", key, previous, delay, ratio);
            }
            if delay > 0 {
                next.write.insert(key.clone(), delay);
                write_out.insert(key.clone(), delay);
            }
        }

        if policy.limit_read_bytes_per_sec > 0 {
            let ratio = read_rate / policy.limit_read_bytes_per_sec as f64;
            let previous = state.read.get(key).copied().unwrap_or(0);
            let delay = next_delay(previous, ratio);
            if delay != previous {
                log::debug!("Read delay for {:?}: {} -> {} us (ratio {:.3})", key, previous, delay, ratio);
            }
            if delay > 0 {
                next.read.insert(key.clone(), delay);
                read_out.insert(key.clone(), delay);
            }
        }
    }

    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit(read: u64, write: u64) -> TrafficShapingPolicy {
        TrafficShapingPolicy {
            limit_read_bytes_per_sec: read,
            limit_write_bytes_per_sec: write,
            is_enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_seed_from_zero_when_over_limit() {
        assert_eq!(next_delay(0, 2.0), 100);
        assert_eq!(next_delay(0, 1.0), 0);
        assert_eq!(next_delay(0, 0.5), 0);
    }

    #[test]
    fn test_asymmetric_gain() {
        // ratio 2: damped 1.15
        assert_eq!(next_delay(1_000, 2.0), 1_150);
        // ratio 0: damped 0.95
        assert_eq!(next_delay(1_000, 0.0), 950);
        assert_eq!(next_delay(1_000, 1.0), 1_000);
    }

    #[test]
    fn test_step_is_capped() {
        assert_eq!(next_delay(500_000, 100.0), 550_000);
        assert_eq!(next_delay(990_000, 100.0), MAX_DELAY_US);
        // ratio 0 on a large delay is still bounded by one step
        assert_eq!(next_delay(MAX_DELAY_US, 0.0), 950_000);
    }

    #[test]
    fn test_snap_to_zero_under_limit() {
        assert_eq!(next_delay(10, 0.0), 0);
        assert_eq!(next_delay(9, 0.99), 0);
        // over the limit small delays are kept
        assert_eq!(next_delay(9, 1.05), 9);
    }

    #[test]
    fn test_bound_holds_for_any_input() {
        let delays = [0u64, 1, 9, 10, 99, 100, 1_000, 49_999, 50_000, 500_000, 999_999, MAX_DELAY_US];
        let ratios = [0.0, 0.01, 0.5, 0.99, 1.0, 1.01, 2.0, 10.0, 1e3, 1e9];

        for &current in &delays {
            for &ratio in &ratios {
                let next = next_delay(current, ratio);
                assert!(next <= MAX_DELAY_US, "{} {} -> {}", current, ratio, next);
                let diff = (next as i64 - current as i64).abs();
                assert!(diff <= MAX_STEP_US, "{} {} -> {}", current, ratio, next);
            }
        }
    }

    #[test]
    fn test_compute_emits_only_throttled_apps() {
        let mut controller = LimitController::new();
        let mut policies = PolicyTable::default();
        policies.app.insert("cms".to_string(), limit(0, 1_000));
        policies.app.insert("idle".to_string(), limit(1_000, 1_000));
        policies.app.insert("off".to_string(), TrafficShapingPolicy {
            is_enabled: false,
            ..limit(1, 1)
        });

        let mut rates = GroupedRates::default();
        rates.app.insert("cms".to_string(), (50_000.0, 4_000.0));
        rates.app.insert("off".to_string(), (50_000.0, 50_000.0));

        let config = controller.compute(&rates, &policies);
        assert_eq!(config.app_write_delay_us.get("cms"), Some(&100));
        // no read limit configured for cms
        assert!(config.app_read_delay_us.is_empty());
        assert_eq!(config.len(), 1);

        let config = controller.compute(&rates, &policies);
        // ratio 4: damped 1.45
        assert_eq!(config.app_write_delay_us.get("cms"), Some(&145));
        assert_eq!(controller.app_write_delay("cms"), 145);
    }

    #[test]
    fn test_compute_uid_and_gid() {
        let mut controller = LimitController::new();
        let mut policies = PolicyTable::default();
        policies.uid.insert(1000, limit(1_000, 0));
        policies.gid.insert(10, limit(0, 1_000));

        let mut rates = GroupedRates::default();
        rates.uid.insert(1000, (3_000.0, 0.0));
        rates.gid.insert(10, (0.0, 3_000.0));

        let config = controller.compute(&rates, &policies);
        assert_eq!(config.uid_read_delay_us.get(&1000), Some(&100));
        assert_eq!(config.gid_write_delay_us.get(&10), Some(&100));
        assert!(config.uid_write_delay_us.is_empty());
        assert!(config.gid_read_delay_us.is_empty());
    }

    #[test]
    fn test_removed_policy_resets_delay() {
        let mut controller = LimitController::new();
        let mut policies = PolicyTable::default();
        policies.app.insert("cms".to_string(), limit(1_000, 0));
        let mut rates = GroupedRates::default();
        rates.app.insert("cms".to_string(), (10_000.0, 0.0));

        controller.compute(&rates, &policies);
        controller.compute(&rates, &policies);
        assert!(controller.app_read_delay("cms") > 100);

        let config = controller.compute(&rates, &PolicyTable::default());
        assert!(config.is_empty());
        assert_eq!(controller.app_read_delay("cms"), 0);

        let config = controller.compute(&rates, &policies);
        assert_eq!(config.app_read_delay_us.get("cms"), Some(&100));
    }

    #[test]
    fn test_delay_decays_back_to_zero() {
        let mut controller = LimitController::new();
        let mut policies = PolicyTable::default();
        policies.app.insert("cms".to_string(), limit(1_000, 0));

        let mut rates = GroupedRates::default();
        rates.app.insert("cms".to_string(), (2_000.0, 0.0));
        for _ in 0..20 {
            controller.compute(&rates, &policies);
        }
        assert!(controller.app_read_delay("cms") > 100);

        rates.app.insert("cms".to_string(), (0.0, 0.0));
        let mut last = controller.app_read_delay("cms");
        for _ in 0..200 {
            controller.compute(&rates, &policies);
            let now = controller.app_read_delay("cms");
            assert!(now <= last);
            last = now;
        }
        assert_eq!(last, 0);
    }
}
