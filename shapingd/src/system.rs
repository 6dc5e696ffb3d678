use crate::command::Options;
use crate::utils::format_utils::format_bytes;
use log::{info, warn};
use std::env;
use std::fs;
use std::path::Path;

// ---- 启动诊断信息 ----
fn read_first_line(path: &str) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.lines().next().map(|l| l.trim().to_string()))
}

fn kernel_version() -> Option<String> {
    if let Ok(out) = std::process::Command::new("uname").args(["-sr"]).output() {
        if let Ok(s) = String::from_utf8(out.stdout) {
            return Some(s.trim().to_string());
        }
    }
    read_first_line("/proc/version")
}

fn hostname() -> Option<String> {
    if let Some(h) = read_first_line("/proc/sys/kernel/hostname") {
        return Some(h);
    }
    read_first_line("/etc/hostname")
}

fn mem_total_bytes() -> Option<u64> {
    // 解析MemTotal: kB
    let content = fs::read_to_string("/proc/meminfo").ok()?;
    content.lines().find_map(|line| {
        let rest = line.strip_prefix("MemTotal:")?;
        let kb: u64 = rest.split_whitespace().find_map(|t| t.parse().ok())?;
        Some(kb * 1024)
    })
}

fn cpu_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn current_user_ids() -> (u32, u32) {
    unsafe {
        let uid = libc::geteuid();
        let gid = libc::getegid();
        (uid as u32, gid as u32)
    }
}

fn format_windows(windows: &[f64]) -> String {
    windows
        .iter()
        .map(|w| format!("{}s", w))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn log_startup_info(options: &Options) {
    let app_version = env!("CARGO_PKG_VERSION");
    let (uid, gid) = current_user_ids();
    let cwd = env::current_dir()
        .ok()
        .and_then(|p| p.to_str().map(|s| s.to_string()))
        .unwrap_or_default();

    let kver = kernel_version().unwrap_or_else(|| "unknown".to_string());
    let host = hostname().unwrap_or_else(|| "unknown".to_string());
    let mem = mem_total_bytes()
        .map(format_bytes)
        .unwrap_or_else(|| "unknown".to_string());

    info!("shapingd v{} started", app_version);
    info!("Host: {} (uid={}, gid={})", host, uid, gid);
    info!("OS: {} / {}", env::consts::OS, env::consts::ARCH);
    info!("Kernel: {}", kver);
    info!("CPU cores: {}", cpu_cores());
    info!("Memory: {}", mem);
    info!("Working directory: {}", cwd);
    info!("Listening port: {}", options.port());
    info!("Data directory: {}", options.data_dir());
    info!("Log level: {}", options.log_level());

    let config = options.shaping_config();
    info!(
        "Estimator: every {} ms, EMA windows [{}], SMA windows [{}], controller reads {}s EMA",
        config.estimator_period.as_millis(),
        format_windows(&config.ema_windows_secs),
        format_windows(&config.sma_windows_secs),
        config.control_window_secs
    );
    info!("Limit controller: every {} ms", config.policy_period.as_millis());
    info!(
        "Garbage collection: every {} ticks, max idle {}s",
        config.gc_every_ticks, config.max_idle_secs
    );
    info!(
        "Report queue: soft limit {}, hard limit {}",
        config.queue_soft_limit, config.queue_hard_limit
    );
    if config.snap_fast_ema {
        info!("Fastest EMA snaps to zero on idle ticks");
    }

    if options.nodes().is_empty() {
        info!("No storage nodes pre-registered; nodes can register over HTTP");
    } else {
        info!("Pre-registered storage nodes: {}", options.nodes().join(", "));
    }

    if options.persist_policies() && !Path::new(options.data_dir()).exists() {
        warn!(
            "Data directory does not exist and will be created during runtime: {}",
            options.data_dir()
        );
    }
}
