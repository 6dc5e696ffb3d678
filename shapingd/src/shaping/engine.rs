use crate::shaping::aggregator::{GcStats, GlobalRateAggregator, RateSnapshot};
use crate::shaping::controller::LimitController;
use crate::shaping::nodes::{NodeDirectory, IO_LIMITS_CONFIG_KEY};
use crate::shaping::policy::{PolicyStore, PolicyTarget};
use crate::shaping::queue::{QueueStats, ReportQueue};
use crate::shaping::window::SlidingWindowRing;
use crate::shaping::ShapingConfig;
use crate::storage;
use crate::utils::time_utils::now_ms;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use shapingd_common::{DelayConfig, NodeReport, StreamIdentity, TrafficShapingPolicy};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

// Loop work time is kept for this long.
const TIMING_HISTORY_SECS: f64 = 5.0;
// Warn when one iteration uses more than this share of its period.
const SLOW_TICK_FRACTION: f64 = 0.1;

/// Work-time statistics of one background loop over the last few seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LoopTiming {
    pub period_ms: u64,
    pub ticks: u64,
    pub max_us: u64,
    pub min_us: u64,
    pub mean_us: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStats {
    pub running: bool,
    pub streams: usize,
    pub nodes: usize,
    pub queue: QueueStats,
    pub estimator: LoopTiming,
    pub policy: LoopTiming,
    pub last_gc: Option<GcStats>,
}

struct LoopMonitor {
    period: Duration,
    ticks: AtomicU64,
    work_us: Mutex<SlidingWindowRing>,
}

impl LoopMonitor {
    fn new(period: Duration) -> Self {
        Self {
            period,
            ticks: AtomicU64::new(0),
            work_us: Mutex::new(SlidingWindowRing::new(
                TIMING_HISTORY_SECS,
                period.as_secs_f64(),
            )),
        }
    }

    /// Record one iteration; returns true when it ran slow.
    fn record(&self, work: Duration) -> bool {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        {
            let mut ring = self.work_us.lock();
            ring.add(work.as_micros() as u64);
            ring.tick();
        }
        work.as_secs_f64() > self.period.as_secs_f64() * SLOW_TICK_FRACTION
    }

    fn timing(&self) -> LoopTiming {
        let ring = self.work_us.lock();
        LoopTiming {
            period_ms: self.period.as_millis() as u64,
            ticks: self.ticks.load(Ordering::Relaxed),
            max_us: ring.max(),
            min_us: ring.min(),
            mean_us: ring.mean(),
        }
    }
}

struct EngineShared {
    config: ShapingConfig,
    aggregator: GlobalRateAggregator,
    policies: PolicyStore,
    controller: Mutex<LimitController>,
    queue: ReportQueue<NodeReport>,
    nodes: Arc<dyn NodeDirectory>,
    policy_file: Option<PathBuf>,
    // Serializes snapshot, write and rename of the policy file.
    persist_lock: Mutex<()>,

    running: AtomicBool,
    shutdown: Notify,

    estimator_monitor: LoopMonitor,
    policy_monitor: LoopMonitor,
    last_delays: RwLock<DelayConfig>,
    last_gc: Mutex<Option<GcStats>>,
}

/// Traffic shaping engine: ingests node reports, estimates per-stream rates
/// and pushes I/O delays for streams that exceed their policy limits.
///
/// Two background tasks run between [`start`](Self::start) and
/// [`stop`](Self::stop): the estimator loop (drain queue, tick estimators,
/// periodic GC) and the slower policy loop (run the limit controller and push
/// its output to online nodes).
pub struct ShapingEngine {
    shared: Arc<EngineShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ShapingEngine {
    pub fn new(config: ShapingConfig, nodes: Arc<dyn NodeDirectory>) -> Self {
        Self::build(config, nodes, None)
    }

    /// Like [`new`](Self::new), but policies are loaded from and saved to
    /// `policy_file`.
    pub fn with_policy_file(
        config: ShapingConfig,
        nodes: Arc<dyn NodeDirectory>,
        policy_file: PathBuf,
    ) -> Result<Self, anyhow::Error> {
        let table = storage::policy::load_policies(&policy_file)?;
        let engine = Self::build(config, nodes, Some(policy_file));
        if !table.is_empty() {
            log::info!("Loaded {} traffic shaping policies from saved file", table.len());
        }
        engine.shared.policies.replace(table);
        Ok(engine)
    }

    fn build(config: ShapingConfig, nodes: Arc<dyn NodeDirectory>, policy_file: Option<PathBuf>) -> Self {
        let shared = EngineShared {
            aggregator: GlobalRateAggregator::new(config.estimator_config()),
            policies: PolicyStore::new(),
            controller: Mutex::new(LimitController::new()),
            queue: ReportQueue::new(config.queue_soft_limit, config.queue_hard_limit),
            nodes,
            policy_file,
            persist_lock: Mutex::new(()),
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
            estimator_monitor: LoopMonitor::new(config.estimator_period),
            policy_monitor: LoopMonitor::new(config.policy_period),
            last_delays: RwLock::new(DelayConfig::default()),
            last_gc: Mutex::new(None),
            config,
        };

        Self {
            shared: Arc::new(shared),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn both background loops. Calling it while running does nothing.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(estimator_loop(Arc::clone(&self.shared))));
        tasks.push(tokio::spawn(policy_loop(Arc::clone(&self.shared))));

        log::info!(
            "Traffic shaping engine started (estimator every {} ms, policy every {} ms)",
            self.shared.config.estimator_period.as_millis(),
            self.shared.config.policy_period.as_millis()
        );
    }

    /// Signal both loops to exit and wait for them.
    pub async fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.shutdown.notify_waiters();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        if tasks.is_empty() {
            return;
        }
        for task in tasks {
            if let Err(e) = task.await {
                log::error!("Traffic shaping task error: {}", e);
            }
        }
        log::info!("Traffic shaping engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Decode a JSON node report and queue it. Malformed input is logged,
    /// dropped and reported back as an error.
    pub fn process_serialized_report(&self, bytes: &[u8]) -> Result<(), anyhow::Error> {
        match serde_json::from_slice::<NodeReport>(bytes) {
            Ok(report) => {
                self.submit_report(report);
                Ok(())
            }
            Err(e) => {
                log::warn!("Dropping malformed traffic report ({} bytes): {}", bytes.len(), e);
                Err(anyhow::anyhow!("Malformed traffic report: {}", e))
            }
        }
    }

    pub fn submit_report(&self, report: NodeReport) {
        self.shared.queue.push(report);
    }

    /// Run one estimator iteration immediately with the given elapsed time.
    #[cfg(test)]
    pub fn run_estimator_tick(&self, dt_secs: f64) {
        self.shared.estimator_tick(dt_secs, now_ms());
    }

    /// Run one controller iteration immediately and return its output.
    #[cfg(test)]
    pub fn run_policy_tick(&self) -> DelayConfig {
        self.shared.policy_tick()
    }

    fn set_policy(&self, target: PolicyTarget, policy: TrafficShapingPolicy) {
        self.shared.policies.set(&target, policy);
        self.shared.persist_policies();
    }

    fn remove_policy(&self, target: PolicyTarget) -> Option<TrafficShapingPolicy> {
        let removed = self.shared.policies.remove(&target);
        if removed.is_some() {
            self.shared.persist_policies();
        }
        removed
    }

    pub fn set_uid_policy(&self, uid: u32, policy: TrafficShapingPolicy) {
        self.set_policy(PolicyTarget::Uid(uid), policy);
    }

    pub fn set_gid_policy(&self, gid: u32, policy: TrafficShapingPolicy) {
        self.set_policy(PolicyTarget::Gid(gid), policy);
    }

    pub fn set_app_policy(&self, app: &str, policy: TrafficShapingPolicy) {
        self.set_policy(PolicyTarget::App(app.to_string()), policy);
    }

    pub fn uid_policy(&self, uid: u32) -> Option<TrafficShapingPolicy> {
        self.shared.policies.get(&PolicyTarget::Uid(uid))
    }

    pub fn gid_policy(&self, gid: u32) -> Option<TrafficShapingPolicy> {
        self.shared.policies.get(&PolicyTarget::Gid(gid))
    }

    pub fn app_policy(&self, app: &str) -> Option<TrafficShapingPolicy> {
        self.shared.policies.get(&PolicyTarget::App(app.to_string()))
    }

    pub fn remove_uid_policy(&self, uid: u32) -> Option<TrafficShapingPolicy> {
        self.remove_policy(PolicyTarget::Uid(uid))
    }

    pub fn remove_gid_policy(&self, gid: u32) -> Option<TrafficShapingPolicy> {
        self.remove_policy(PolicyTarget::Gid(gid))
    }

    pub fn remove_app_policy(&self, app: &str) -> Option<TrafficShapingPolicy> {
        self.remove_policy(PolicyTarget::App(app.to_string()))
    }

    pub fn uid_policies(&self) -> HashMap<u32, TrafficShapingPolicy> {
        self.shared.policies.uid_policies()
    }

    pub fn gid_policies(&self) -> HashMap<u32, TrafficShapingPolicy> {
        self.shared.policies.gid_policies()
    }

    pub fn app_policies(&self) -> HashMap<String, TrafficShapingPolicy> {
        self.shared.policies.app_policies()
    }

    pub fn global_stats(&self) -> HashMap<StreamIdentity, RateSnapshot> {
        self.shared.aggregator.global_stats()
    }

    pub fn garbage_collect(&self, max_idle_secs: u64) -> GcStats {
        self.shared.garbage_collect(max_idle_secs, now_ms())
    }

    /// Delay configuration produced by the latest controller tick.
    pub fn last_delays(&self) -> DelayConfig {
        self.shared.last_delays.read().clone()
    }

    pub fn config(&self) -> &ShapingConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> EngineStats {
        let shared = &self.shared;
        EngineStats {
            running: self.is_running(),
            streams: shared.aggregator.stream_count(),
            nodes: shared.aggregator.node_count(),
            queue: shared.queue.stats(),
            estimator: shared.estimator_monitor.timing(),
            policy: shared.policy_monitor.timing(),
            last_gc: *shared.last_gc.lock(),
        }
    }
}

impl Drop for ShapingEngine {
    fn drop(&mut self) {
        // Loops see the flag on their next wake-up and exit on their own.
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.shutdown.notify_waiters();
    }
}

impl EngineShared {
    fn estimator_tick(&self, dt_secs: f64, now_ms: u64) {
        // Swap the queue out so ingestion is never blocked by processing.
        let reports = self.queue.drain();
        let mut active = 0;
        for report in &reports {
            active += self.aggregator.process_report(report, now_ms);
        }
        let updated = self.aggregator.update_time_windows(dt_secs);
        log::debug!(
            "Estimator tick: {} report(s), {} active entries, dt {:.3}s{}",
            reports.len(),
            active,
            dt_secs,
            if updated { "" } else { " (skipped)" }
        );
    }

    fn policy_tick(&self) -> DelayConfig {
        let rates = self.aggregator.grouped_rates();
        let policies = self.policies.snapshot();
        let delays = self.controller.lock().compute(&rates, &policies);

        match serde_json::to_vec(&delays) {
            Ok(blob) => self.push_delays(&blob),
            Err(e) => log::warn!("Failed to serialize delay configuration: {}", e),
        }

        *self.last_delays.write() = delays.clone();
        delays
    }

    fn push_delays(&self, blob: &[u8]) {
        for node in self.nodes.nodes() {
            if !node.is_online() {
                continue;
            }
            if let Err(e) = self.nodes.set_config(&node.name, IO_LIMITS_CONFIG_KEY, blob) {
                log::warn!("Failed to push delay configuration to {}: {}", node.name, e);
            }
        }
    }

    fn garbage_collect(&self, max_idle_secs: u64, now_ms: u64) -> GcStats {
        let stats = self.aggregator.garbage_collect(max_idle_secs, now_ms);
        if stats != GcStats::default() {
            log::info!(
                "Traffic shaping GC removed {} node(s), {} node stream(s), {} global stream(s)",
                stats.removed_nodes,
                stats.removed_node_streams,
                stats.removed_global_streams
            );
        }
        *self.last_gc.lock() = Some(stats);
        stats
    }

    fn persist_policies(&self) {
        let Some(path) = &self.policy_file else {
            return;
        };
        // The snapshot is taken under the lock so the last write always
        // carries every change made before it.
        let _guard = self.persist_lock.lock();
        if let Err(e) = storage::policy::save_policies(path, &self.policies.snapshot()) {
            log::warn!("Failed to save traffic shaping policies to {}: {}", path.display(), e);
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

async fn estimator_loop(shared: Arc<EngineShared>) {
    let period = shared.config.estimator_period;
    let mut next_tick = Instant::now() + period;
    let mut last_tick = Instant::now();
    let mut ticks: u64 = 0;

    while shared.is_running() {
        tokio::select! {
            _ = sleep_until(next_tick) => {}
            _ = shared.shutdown.notified() => {}
        }
        if !shared.is_running() {
            break;
        }

        let started = Instant::now();
        let dt = started.duration_since(last_tick).as_secs_f64();
        last_tick = started;

        shared.estimator_tick(dt, now_ms());

        ticks += 1;
        if ticks % shared.config.gc_every_ticks.max(1) == 0 {
            shared.garbage_collect(shared.config.max_idle_secs, now_ms());
        }

        let work = started.elapsed();
        if shared.estimator_monitor.record(work) {
            log::warn!(
                "Estimator tick took {} us, more than 10% of its {} ms period",
                work.as_micros(),
                period.as_millis()
            );
        }

        next_tick += period;
    }
    log::debug!("Estimator loop exited");
}

async fn policy_loop(shared: Arc<EngineShared>) {
    let period = shared.config.policy_period;
    let mut next_tick = Instant::now() + period;

    while shared.is_running() {
        tokio::select! {
            _ = sleep_until(next_tick) => {}
            _ = shared.shutdown.notified() => {}
        }
        if !shared.is_running() {
            break;
        }

        let started = Instant::now();
        let delays = shared.policy_tick();

        let work = started.elapsed();
        if shared.policy_monitor.record(work) {
            log::warn!(
                "Policy tick took {} us, more than 10% of its {} ms period",
                work.as_micros(),
                period.as_millis()
            );
        }
        log::debug!("Policy tick: {} throttled entries", delays.len());

        next_tick += period;
        // Do not try to catch up on missed ticks.
        let now = Instant::now();
        if next_tick < now {
            next_tick = now;
        }
    }
    log::debug!("Policy loop exited");
}
