pub mod aggregator;
pub mod controller;
pub mod engine;
pub mod nodes;
pub mod policy;
pub mod queue;
pub mod tracker;
pub mod window;

use crate::shaping::aggregator::EstimatorConfig;
use std::time::Duration;

/// Runtime settings of a [`engine::ShapingEngine`].
#[derive(Debug, Clone)]
pub struct ShapingConfig {
    pub estimator_period: Duration,
    pub policy_period: Duration,
    /// Estimator ticks between garbage collection runs.
    pub gc_every_ticks: u64,
    pub max_idle_secs: u64,
    pub ema_windows_secs: Vec<f64>,
    pub sma_windows_secs: Vec<f64>,
    pub control_window_secs: f64,
    pub snap_fast_ema: bool,
    pub queue_soft_limit: usize,
    pub queue_hard_limit: usize,
}

impl Default for ShapingConfig {
    fn default() -> Self {
        Self {
            estimator_period: Duration::from_millis(100),
            policy_period: Duration::from_millis(500),
            gc_every_ticks: 50,
            max_idle_secs: 900,
            ema_windows_secs: vec![1.0, 5.0, 60.0],
            sma_windows_secs: vec![1.0, 5.0, 60.0, 300.0],
            control_window_secs: 5.0,
            snap_fast_ema: false,
            queue_soft_limit: 100,
            queue_hard_limit: 1000,
        }
    }
}

impl ShapingConfig {
    pub fn estimator_config(&self) -> EstimatorConfig {
        EstimatorConfig {
            ema_windows_secs: self.ema_windows_secs.clone(),
            sma_windows_secs: self.sma_windows_secs.clone(),
            tick_secs: self.estimator_period.as_secs_f64(),
            control_window_secs: self.control_window_secs,
            snap_fast_ema: self.snap_fast_ema,
        }
    }
}
