use crate::api::shaping::ShapingApiState;
use crate::shaping::engine::ShapingEngine;
use crate::shaping::nodes::StaticNodeDirectory;
use crate::shaping::ShapingConfig;
use crate::storage::policy::policy_file_path;
use crate::system::log_startup_info;
use crate::web;
use clap::{Args, Parser};
use log::info;
use log::LevelFilter;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

/// Common arguments shared by all commands
#[derive(Debug, Args, Clone)]
pub struct CommonArgs {
    #[clap(long, default_value = "8787", help = "Web server listening port")]
    pub port: u16,

    #[clap(
        long,
        default_value = "shapingd-data",
        help = "Data directory (traffic shaping policies will be stored here)"
    )]
    pub data_dir: String,

    #[clap(long, default_value = "info", help = "Log level (error, warn, info, debug, trace)")]
    pub log_level: LevelFilter,

    #[clap(
        long,
        default_value = "false",
        help = "Enable web request logging (per-HTTP-request line)"
    )]
    pub web_log: bool,
}

/// Traffic shaping engine arguments
#[derive(Debug, Args, Clone)]
pub struct ShapingArgs {
    #[clap(long, default_value = "100", help = "Rate estimator tick period (milliseconds)")]
    pub estimator_period_ms: u64,

    #[clap(
        long,
        default_value = "500",
        help = "Limit controller tick period (milliseconds), how often delays are pushed to nodes"
    )]
    pub policy_period_ms: u64,

    #[clap(long, default_value = "50", help = "Estimator ticks between garbage collection runs")]
    pub gc_every_ticks: u64,

    #[clap(
        long,
        default_value = "900",
        help = "Streams idle for longer than this (seconds) are garbage collected"
    )]
    pub max_idle_seconds: u64,

    #[clap(
        long,
        value_delimiter = ',',
        default_value = "1,5,60",
        help = "Exponential moving average windows (seconds, comma separated)"
    )]
    pub ema_windows: Vec<f64>,

    #[clap(
        long,
        value_delimiter = ',',
        default_value = "1,5,60,300",
        help = "Simple moving average windows (seconds, comma separated)"
    )]
    pub sma_windows: Vec<f64>,

    #[clap(
        long,
        default_value = "5",
        help = "EMA window (seconds) the limit controller reads; must be one of --ema-windows"
    )]
    pub control_window: f64,

    #[clap(long, default_value = "100", help = "Warn when more reports than this are queued")]
    pub queue_soft_limit: usize,

    #[clap(
        long,
        default_value = "1000",
        help = "Drop the oldest reports when more than this are queued"
    )]
    pub queue_hard_limit: usize,

    #[clap(
        long,
        default_value = "false",
        help = "Snap the fastest EMA to zero on a tick without traffic (natural decay by default)"
    )]
    pub snap_fast_ema: bool,

    #[clap(long = "node", help = "Storage node registered as online at startup (repeatable)")]
    pub nodes: Vec<String>,

    #[clap(
        long,
        default_value = "true",
        action = clap::ArgAction::Set,
        help = "Load and save traffic shaping policies in the data directory"
    )]
    pub persist_policies: bool,
}

#[derive(Debug, Parser, Clone)]
#[clap(name = "shapingd")]
#[clap(version = env!("CARGO_PKG_VERSION"))]
#[clap(about = "Storage I/O traffic shaping: rate estimation and delay control for storage nodes")]
pub struct Options {
    #[clap(flatten)]
    pub common: CommonArgs,

    #[clap(flatten)]
    pub shaping: ShapingArgs,
}

impl Options {
    /// Get port from common args
    pub fn port(&self) -> u16 {
        self.common.port
    }

    /// Get data_dir from common args
    pub fn data_dir(&self) -> &str {
        &self.common.data_dir
    }

    pub fn log_level(&self) -> LevelFilter {
        self.common.log_level
    }

    /// Get web_log from common args
    pub fn web_log(&self) -> bool {
        self.common.web_log
    }

    pub fn nodes(&self) -> &[String] {
        &self.shaping.nodes
    }

    pub fn persist_policies(&self) -> bool {
        self.shaping.persist_policies
    }

    pub fn shaping_config(&self) -> ShapingConfig {
        let args = &self.shaping;
        ShapingConfig {
            estimator_period: Duration::from_millis(args.estimator_period_ms),
            policy_period: Duration::from_millis(args.policy_period_ms),
            gc_every_ticks: args.gc_every_ticks,
            max_idle_secs: args.max_idle_seconds,
            ema_windows_secs: args.ema_windows.clone(),
            sma_windows_secs: args.sma_windows.clone(),
            control_window_secs: args.control_window,
            snap_fast_ema: args.snap_fast_ema,
            queue_soft_limit: args.queue_soft_limit,
            queue_hard_limit: args.queue_hard_limit,
        }
    }
}

fn validate_windows(name: &str, windows: &[f64]) -> Result<(), anyhow::Error> {
    if windows.is_empty() {
        return Err(anyhow::anyhow!("{} must contain at least one window", name));
    }
    if let Some(bad) = windows.iter().find(|w| !(w.is_finite() && **w > 0.0)) {
        return Err(anyhow::anyhow!(
            "{} must contain only positive windows, got {}",
            name,
            bad
        ));
    }
    Ok(())
}

// Validate arguments
fn validate_arguments(opt: &Options) -> Result<(), anyhow::Error> {
    if opt.port() == 0 {
        return Err(anyhow::anyhow!("Port number cannot be 0"));
    }

    let args = &opt.shaping;
    if args.estimator_period_ms == 0 {
        return Err(anyhow::anyhow!("estimator_period_ms must be greater than 0"));
    }
    if args.policy_period_ms == 0 {
        return Err(anyhow::anyhow!("policy_period_ms must be greater than 0"));
    }
    if args.gc_every_ticks == 0 {
        return Err(anyhow::anyhow!("gc_every_ticks must be greater than 0"));
    }
    if args.max_idle_seconds == 0 {
        return Err(anyhow::anyhow!("max_idle_seconds must be greater than 0"));
    }

    validate_windows("ema_windows", &args.ema_windows)?;
    validate_windows("sma_windows", &args.sma_windows)?;

    if !args
        .ema_windows
        .iter()
        .any(|w| (w - args.control_window).abs() < f64::EPSILON)
    {
        return Err(anyhow::anyhow!(
            "control_window {} is not one of the EMA windows {:?}",
            args.control_window,
            args.ema_windows
        ));
    }

    if args.queue_hard_limit == 0 {
        return Err(anyhow::anyhow!("queue_hard_limit must be greater than 0"));
    }
    if args.queue_hard_limit < args.queue_soft_limit {
        return Err(anyhow::anyhow!(
            "queue_hard_limit ({}) cannot be lower than queue_soft_limit ({})",
            args.queue_hard_limit,
            args.queue_soft_limit
        ));
    }

    Ok(())
}

fn create_engine(
    options: &Options,
    nodes: Arc<StaticNodeDirectory>,
) -> Result<ShapingEngine, anyhow::Error> {
    let config = options.shaping_config();
    if options.persist_policies() {
        let path = policy_file_path(options.data_dir());
        ShapingEngine::with_policy_file(config, nodes, path)
    } else {
        Ok(ShapingEngine::new(config, nodes))
    }
}

// Run service: start the shaping engine and the web server
async fn run_service(options: &Options) -> Result<(), anyhow::Error> {
    // Use Notify for graceful shutdown
    let shutdown_notify = Arc::new(tokio::sync::Notify::new());
    let shutdown_notify_clone = shutdown_notify.clone();

    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, gracefully shutting down...");
            shutdown_notify_clone.notify_waiters();
        }
    });

    let nodes = Arc::new(StaticNodeDirectory::with_online_nodes(
        options.nodes().iter().cloned(),
    ));
    let engine = Arc::new(create_engine(options, nodes.clone())?);
    engine.start();

    let state = ShapingApiState {
        engine: Arc::clone(&engine),
        nodes,
    };
    let options_for_web = options.clone();
    let shutdown_notify_for_web = shutdown_notify.clone();
    let web_task = tokio::spawn(async move {
        if let Err(e) = web::start_server(options_for_web, state, shutdown_notify_for_web).await {
            log::error!("Web server error: {}", e);
        }
    });

    // Wait for shutdown signal
    shutdown_notify.notified().await;
    info!("Stopping traffic shaping engine...");

    engine.stop().await;
    if let Err(e) = web_task.await {
        log::error!("Web server task error: {}", e);
    }

    info!("All tasks stopped, program exiting");

    Ok(())
}

pub async fn run(options: Options) -> Result<(), anyhow::Error> {
    // Validate arguments
    validate_arguments(&options)?;

    // Set up logging
    env_logger::Builder::new()
        .filter(None, options.log_level())
        .target(env_logger::Target::Stdout)
        .init();

    // Startup diagnostics
    log_startup_info(&options);

    run_service(&options).await?;

    Ok(())
}
