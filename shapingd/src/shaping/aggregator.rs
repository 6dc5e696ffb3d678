use crate::shaping::tracker::{PerNodeDeltaTracker, StreamDelta};
use crate::shaping::window::SlidingWindowRing;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use shapingd_common::{NodeReport, StreamIdentity};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

// Ticks shorter than this carry no usable rate information.
const MIN_TICK_SECS: f64 = 0.000_001;

/// Estimator settings shared by every stream.
#[derive(Debug, Clone)]
pub struct EstimatorConfig {
    pub ema_windows_secs: Vec<f64>,
    pub sma_windows_secs: Vec<f64>,
    /// Nominal estimator period; one SMA bucket per tick.
    pub tick_secs: f64,
    /// EMA window the limit controller reads.
    pub control_window_secs: f64,
    /// Snap the fastest EMA to zero when a tick saw no traffic at all.
    pub snap_fast_ema: bool,
}

impl EstimatorConfig {
    fn control_index(&self) -> usize {
        nearest_index(&self.ema_windows_secs, self.control_window_secs)
    }

    fn fastest_ema_index(&self) -> Option<usize> {
        self.ema_windows_secs
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
    }

    fn sma_history_secs(&self) -> f64 {
        self.sma_windows_secs.iter().copied().fold(0.0, f64::max)
    }
}

fn nearest_index(windows: &[f64], target: f64) -> usize {
    windows
        .iter()
        .enumerate()
        .min_by(|a, b| (a.1 - target).abs().total_cmp(&(b.1 - target).abs()))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Smoothing factor for an EMA over `window_secs` after `dt_secs` elapsed.
pub fn ema_alpha(window_secs: f64, dt_secs: f64) -> f64 {
    if dt_secs <= 0.0 || window_secs <= 0.0 {
        return 1.0;
    }
    ((2.0 * dt_secs) / (window_secs + dt_secs)).min(1.0)
}

fn ema(current: f64, previous: f64, alpha: f64) -> f64 {
    alpha * current + (1.0 - alpha) * previous
}

/// Rates for one averaging window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowRate {
    pub window_secs: f64,
    pub read_bps: f64,
    pub write_bps: f64,
    pub read_iops: f64,
    pub write_iops: f64,
}

impl WindowRate {
    fn for_window(window_secs: f64) -> Self {
        Self {
            window_secs,
            ..Self::default()
        }
    }
}

/// Read-only copy of one stream's estimator state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateSnapshot {
    pub ema: Vec<WindowRate>,
    pub sma: Vec<WindowRate>,
    /// Reporting nodes currently holding counters for this stream.
    pub active_stream_count: u64,
    pub last_activity_ms: u64,
}

/// Counts removed by one garbage collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcStats {
    pub removed_nodes: u64,
    pub removed_node_streams: u64,
    pub removed_global_streams: u64,
}

/// Per-entity (read, write) byte rates seen by the controller.
#[derive(Debug, Clone, Default)]
pub struct GroupedRates {
    pub app: HashMap<String, (f64, f64)>,
    pub uid: HashMap<u32, (f64, f64)>,
    pub gid: HashMap<u32, (f64, f64)>,
}

/// Global estimator state for one stream, merged across all nodes.
#[derive(Debug)]
struct MultiWindowRate {
    bytes_read_acc: AtomicU64,
    bytes_written_acc: AtomicU64,
    read_ops_acc: AtomicU64,
    write_ops_acc: AtomicU64,

    ema: Vec<WindowRate>,
    sma: Vec<WindowRate>,

    bytes_read_window: SlidingWindowRing,
    bytes_written_window: SlidingWindowRing,
    read_ops_window: SlidingWindowRing,
    write_ops_window: SlidingWindowRing,

    last_activity_ms: u64,
}

impl MultiWindowRate {
    fn new(config: &EstimatorConfig) -> Self {
        let history = config.sma_history_secs();
        let ring = SlidingWindowRing::new(history, config.tick_secs);
        Self {
            bytes_read_acc: AtomicU64::new(0),
            bytes_written_acc: AtomicU64::new(0),
            read_ops_acc: AtomicU64::new(0),
            write_ops_acc: AtomicU64::new(0),
            ema: config.ema_windows_secs.iter().map(|w| WindowRate::for_window(*w)).collect(),
            sma: config.sma_windows_secs.iter().map(|w| WindowRate::for_window(*w)).collect(),
            bytes_read_window: ring.clone(),
            bytes_written_window: ring.clone(),
            read_ops_window: ring.clone(),
            write_ops_window: ring,
            last_activity_ms: 0,
        }
    }

    fn accumulate(&self, delta: &StreamDelta) {
        self.bytes_read_acc.fetch_add(delta.bytes_read, Ordering::Relaxed);
        self.bytes_written_acc.fetch_add(delta.bytes_written, Ordering::Relaxed);
        self.read_ops_acc.fetch_add(delta.read_ops, Ordering::Relaxed);
        self.write_ops_acc.fetch_add(delta.write_ops, Ordering::Relaxed);
    }

    fn tick(&mut self, dt_secs: f64, alphas: &[f64], snap_index: Option<usize>) {
        // Drain with swap so a concurrent add lands in exactly one tick.
        let bytes_read = self.bytes_read_acc.swap(0, Ordering::AcqRel);
        let bytes_written = self.bytes_written_acc.swap(0, Ordering::AcqRel);
        let read_ops = self.read_ops_acc.swap(0, Ordering::AcqRel);
        let write_ops = self.write_ops_acc.swap(0, Ordering::AcqRel);

        let read_bps = bytes_read as f64 / dt_secs;
        let write_bps = bytes_written as f64 / dt_secs;
        let read_iops = read_ops as f64 / dt_secs;
        let write_iops = write_ops as f64 / dt_secs;
        let idle = bytes_read == 0 && bytes_written == 0 && read_ops == 0 && write_ops == 0;

        for (i, (rate, alpha)) in self.ema.iter_mut().zip(alphas).enumerate() {
            if idle && snap_index == Some(i) {
                *rate = WindowRate::for_window(rate.window_secs);
                continue;
            }
            rate.read_bps = ema(read_bps, rate.read_bps, *alpha);
            rate.write_bps = ema(write_bps, rate.write_bps, *alpha);
            rate.read_iops = ema(read_iops, rate.read_iops, *alpha);
            rate.write_iops = ema(write_iops, rate.write_iops, *alpha);
        }

        // SMA rings take raw per-tick counts, not rates.
        self.bytes_read_window.add(bytes_read);
        self.bytes_written_window.add(bytes_written);
        self.read_ops_window.add(read_ops);
        self.write_ops_window.add(write_ops);

        self.bytes_read_window.tick();
        self.bytes_written_window.tick();
        self.read_ops_window.tick();
        self.write_ops_window.tick();

        for rate in self.sma.iter_mut() {
            let window = rate.window_secs;
            rate.read_bps = self.bytes_read_window.rate(window);
            rate.write_bps = self.bytes_written_window.rate(window);
            rate.read_iops = self.read_ops_window.rate(window);
            rate.write_iops = self.write_ops_window.rate(window);
        }
    }
}

#[derive(Debug, Default)]
struct AggregatorState {
    tracker: PerNodeDeltaTracker,
    streams: HashMap<StreamIdentity, MultiWindowRate>,
}

/// Merges per-node deltas into one estimator per stream.
///
/// One read/write lock guards the map structure. Ingestion and both ticks
/// take it exclusively; snapshot readers share it and always get copies.
#[derive(Debug)]
pub struct GlobalRateAggregator {
    config: EstimatorConfig,
    control_index: usize,
    snap_index: Option<usize>,
    state: RwLock<AggregatorState>,
}

impl GlobalRateAggregator {
    pub fn new(config: EstimatorConfig) -> Self {
        let control_index = config.control_index();
        let snap_index = if config.snap_fast_ema {
            config.fastest_ema_index()
        } else {
            None
        };
        Self {
            config,
            control_index,
            snap_index,
            state: RwLock::new(AggregatorState::default()),
        }
    }

    /// Apply one node report. Returns how many entries carried new traffic.
    pub fn process_report(&self, report: &NodeReport, now_ms: u64) -> usize {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let mut active = 0;

        for entry in &report.entries {
            let delta = state.tracker.apply(&report.node_id, entry, now_ms);
            if delta.is_zero() {
                continue;
            }

            let global = state
                .streams
                .entry(entry.stream())
                .or_insert_with(|| MultiWindowRate::new(&self.config));
            global.accumulate(&delta);
            global.last_activity_ms = now_ms;
            active += 1;
        }

        if active > 0 {
            log::debug!(
                "Report from {}: {} of {} entries carried traffic",
                report.node_id,
                active,
                report.entries.len()
            );
        }
        active
    }

    /// Drain every accumulator and advance the EMA and SMA estimators by
    /// `dt_secs`, the measured time since the previous tick. Returns false
    /// when the interval is too short to use.
    pub fn update_time_windows(&self, dt_secs: f64) -> bool {
        if dt_secs <= MIN_TICK_SECS {
            return false;
        }

        let alphas: Vec<f64> = self
            .config
            .ema_windows_secs
            .iter()
            .map(|w| ema_alpha(*w, dt_secs))
            .collect();

        let mut state = self.state.write();
        for stats in state.streams.values_mut() {
            stats.tick(dt_secs, &alphas, self.snap_index);
        }
        true
    }

    pub fn global_stats(&self) -> HashMap<StreamIdentity, RateSnapshot> {
        let state = self.state.read();

        let mut node_counts: HashMap<&StreamIdentity, u64> = HashMap::new();
        for stream in state.tracker.streams() {
            *node_counts.entry(stream).or_insert(0) += 1;
        }

        state
            .streams
            .iter()
            .map(|(key, stats)| {
                (
                    key.clone(),
                    RateSnapshot {
                        ema: stats.ema.clone(),
                        sma: stats.sma.clone(),
                        active_stream_count: node_counts.get(key).copied().unwrap_or(0),
                        last_activity_ms: stats.last_activity_ms,
                    },
                )
            })
            .collect()
    }

    /// Control-window read/write byte rates summed per app, uid and gid.
    pub fn grouped_rates(&self) -> GroupedRates {
        let state = self.state.read();
        let mut rates = GroupedRates::default();

        for (key, stats) in state.streams.iter() {
            let Some(rate) = stats.ema.get(self.control_index) else {
                continue;
            };
            add_rate(rates.app.entry(key.app.clone()).or_default(), rate);
            add_rate(rates.uid.entry(key.uid).or_default(), rate);
            add_rate(rates.gid.entry(key.gid).or_default(), rate);
        }
        rates
    }

    /// Remove per-node counters and global streams idle for longer than
    /// `max_idle_secs`.
    pub fn garbage_collect(&self, max_idle_secs: u64, now_ms: u64) -> GcStats {
        let max_idle_ms = max_idle_secs.saturating_mul(1000);
        let mut state = self.state.write();

        let (removed_nodes, removed_node_streams) = state.tracker.remove_idle(now_ms, max_idle_ms);

        let before = state.streams.len();
        state
            .streams
            .retain(|_, stats| now_ms.saturating_sub(stats.last_activity_ms) <= max_idle_ms);
        let removed_global_streams = (before - state.streams.len()) as u64;

        GcStats {
            removed_nodes,
            removed_node_streams,
            removed_global_streams,
        }
    }

    pub fn stream_count(&self) -> usize {
        self.state.read().streams.len()
    }

    pub fn node_count(&self) -> usize {
        self.state.read().tracker.node_count()
    }
}

fn add_rate(total: &mut (f64, f64), rate: &WindowRate) {
    total.0 += rate.read_bps;
    total.1 += rate.write_bps;
}

#[cfg(test)]
mod tests {
    use super::*;
    use shapingd_common::ReportEntry;

    fn config() -> EstimatorConfig {
        EstimatorConfig {
            ema_windows_secs: vec![1.0, 5.0],
            sma_windows_secs: vec![1.0, 5.0],
            tick_secs: 1.0,
            control_window_secs: 5.0,
            snap_fast_ema: false,
        }
    }

    fn report(node: &str, app: &str, uid: u32, gid: u32, read: u64, written: u64) -> NodeReport {
        NodeReport {
            node_id: node.to_string(),
            entries: vec![ReportEntry {
                app_name: app.to_string(),
                uid,
                gid,
                generation_id: 1,
                total_bytes_read: read,
                total_bytes_written: written,
                total_read_ops: 0,
                total_write_ops: 0,
            }],
        }
    }

    #[test]
    fn test_ema_alpha() {
        assert_eq!(ema_alpha(1.0, 1.0), 1.0);
        assert!((ema_alpha(5.0, 1.0) - 2.0 / 6.0).abs() < 1e-12);
        assert_eq!(ema_alpha(5.0, 0.0), 1.0);
        assert_eq!(ema_alpha(0.0, 1.0), 1.0);
        assert_eq!(ema_alpha(1.0, 10.0), 1.0);
    }

    #[test]
    fn test_first_report_then_one_tick() {
        let aggregator = GlobalRateAggregator::new(config());
        let key = StreamIdentity::new("cms", 100, 10);

        assert_eq!(aggregator.process_report(&report("fst1", "cms", 100, 10, 1_000_000, 0), 0), 1);
        assert!(aggregator.update_time_windows(1.0));

        let stats = aggregator.global_stats();
        let snap = &stats[&key];
        assert_eq!(snap.ema[0].window_secs, 1.0);
        assert_eq!(snap.ema[0].read_bps, 1_000_000.0);
        assert!((snap.ema[1].read_bps - 1_000_000.0 / 3.0).abs() < 1e-6);
        assert_eq!(snap.sma[0].read_bps, 1_000_000.0);
        assert_eq!(snap.sma[1].read_bps, 1_000_000.0);
        assert_eq!(snap.active_stream_count, 1);
        assert_eq!(snap.last_activity_ms, 0);
    }

    #[test]
    fn test_accumulators_drain_once_per_tick() {
        let aggregator = GlobalRateAggregator::new(config());
        let key = StreamIdentity::new("cms", 100, 10);

        aggregator.process_report(&report("fst1", "cms", 100, 10, 500, 0), 0);
        aggregator.update_time_windows(1.0);
        aggregator.update_time_windows(1.0);

        let snap = &aggregator.global_stats()[&key];
        // Second tick saw nothing; the 1s EMA with alpha=1 drops to zero.
        assert_eq!(snap.ema[0].read_bps, 0.0);
        assert!((snap.sma[1].read_bps - 250.0).abs() < 1e-9);
    }

    #[test]
    fn test_ema_converges_to_constant_rate() {
        let aggregator = GlobalRateAggregator::new(config());
        let key = StreamIdentity::new("cms", 1, 1);
        let mut total = 0;

        for tick in 0..200u64 {
            total += 2_000;
            aggregator.process_report(&report("fst1", "cms", 1, 1, total, 0), tick * 1000);
            aggregator.update_time_windows(1.0);
        }

        let snap = &aggregator.global_stats()[&key];
        assert!((snap.ema[1].read_bps - 2_000.0).abs() < 1e-3);
        assert!((snap.sma[1].read_bps - 2_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_short_interval_is_skipped() {
        let aggregator = GlobalRateAggregator::new(config());
        let key = StreamIdentity::new("cms", 100, 10);
        aggregator.process_report(&report("fst1", "cms", 100, 10, 100, 0), 0);

        assert!(!aggregator.update_time_windows(0.0));
        assert!(!aggregator.update_time_windows(-1.0));
        assert_eq!(aggregator.global_stats()[&key].ema[0].read_bps, 0.0);

        // The skipped ticks did not drain the accumulator.
        assert!(aggregator.update_time_windows(1.0));
        assert_eq!(aggregator.global_stats()[&key].ema[0].read_bps, 100.0);
    }

    #[test]
    fn test_zero_delta_report_creates_no_global_stream() {
        let aggregator = GlobalRateAggregator::new(config());
        aggregator.process_report(&report("fst1", "cms", 100, 10, 0, 0), 0);
        assert_eq!(aggregator.stream_count(), 0);
        assert_eq!(aggregator.node_count(), 1);
    }

    #[test]
    fn test_snap_fast_ema() {
        let mut cfg = config();
        cfg.snap_fast_ema = true;
        cfg.ema_windows_secs = vec![5.0, 1.0];
        let aggregator = GlobalRateAggregator::new(cfg);
        let key = StreamIdentity::new("cms", 100, 10);

        aggregator.process_report(&report("fst1", "cms", 100, 10, 600, 0), 0);
        aggregator.update_time_windows(0.5);
        aggregator.update_time_windows(0.5);

        let snap = &aggregator.global_stats()[&key];
        assert_eq!(snap.ema[1].read_bps, 0.0);
        assert!(snap.ema[0].read_bps > 0.0);
    }

    #[test]
    fn test_grouped_rates_sum_streams() {
        let aggregator = GlobalRateAggregator::new(config());
        aggregator.process_report(&report("fst1", "cms", 1, 10, 600, 60), 0);
        aggregator.process_report(&report("fst2", "cms", 2, 10, 600, 0), 0);
        aggregator.process_report(&report("fst1", "atlas", 1, 20, 0, 300), 0);
        aggregator.update_time_windows(5.0);

        let rates = aggregator.grouped_rates();
        assert!((rates.app["cms"].0 - 1_200.0 / 5.0).abs() < 1e-9);
        assert!((rates.app["cms"].1 - 60.0 / 5.0).abs() < 1e-9);
        assert!((rates.uid[&1].1 - 360.0 / 5.0).abs() < 1e-9);
        assert!((rates.gid[&10].0 - 240.0).abs() < 1e-9);
        assert_eq!(rates.gid[&20].0, 0.0);
    }

    #[test]
    fn test_concurrent_ingest_and_ticks_count_every_byte_once() {
        let aggregator = GlobalRateAggregator::new(EstimatorConfig {
            sma_windows_secs: vec![10_000.0],
            ..config()
        });
        let key = StreamIdentity::new("cms", 100, 10);

        // Create the stream first so every tick below lands in its ring.
        aggregator.process_report(&report("seed", "cms", 100, 10, 1, 0), 0);

        const WRITERS: u64 = 4;
        const REPORTS: u64 = 500;
        const TICKS: u64 = 300;

        std::thread::scope(|scope| {
            for w in 0..WRITERS {
                let aggregator = &aggregator;
                scope.spawn(move || {
                    let node = format!("fst{}", w);
                    for k in 1..=REPORTS {
                        aggregator.process_report(&report(&node, "cms", 100, 10, k * 1_000, k * 10), k);
                    }
                });
            }
            let aggregator = &aggregator;
            scope.spawn(move || {
                for _ in 0..TICKS {
                    assert!(aggregator.update_time_windows(1.0));
                    std::thread::yield_now();
                }
            });
        });
        assert!(aggregator.update_time_windows(1.0));

        // One-second buckets: rate times completed ticks is the bucket total.
        let ticks = (TICKS + 1) as f64;
        let snap = &aggregator.global_stats()[&key];
        let read_total = (snap.sma[0].read_bps * ticks).round() as u64;
        let write_total = (snap.sma[0].write_bps * ticks).round() as u64;
        assert_eq!(read_total, 1 + WRITERS * REPORTS * 1_000);
        assert_eq!(write_total, WRITERS * REPORTS * 10);
        assert_eq!(snap.active_stream_count, WRITERS + 1);
    }

    #[test]
    fn test_garbage_collect_is_idempotent() {
        let aggregator = GlobalRateAggregator::new(config());
        aggregator.process_report(&report("fst1", "cms", 100, 10, 100, 0), 0);
        aggregator.process_report(&report("fst2", "alice", 1, 1, 100, 0), 890_000);

        let first = aggregator.garbage_collect(900, 1_000_000);
        assert_eq!(
            first,
            GcStats {
                removed_nodes: 1,
                removed_node_streams: 1,
                removed_global_streams: 1,
            }
        );
        assert_eq!(aggregator.garbage_collect(900, 1_000_000), GcStats::default());
        assert_eq!(aggregator.stream_count(), 1);
    }
}
