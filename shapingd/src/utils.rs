pub mod format_utils {
    // Convert bytes to human-readable format
    pub fn format_bytes(bytes: u64) -> String {
        const KB: u64 = 1024;
        const MB: u64 = KB * 1024;
        const GB: u64 = MB * 1024;

        if bytes >= GB {
            format!("{:.2} GB", bytes as f64 / GB as f64)
        } else if bytes >= MB {
            format!("{:.2} MB", bytes as f64 / MB as f64)
        } else if bytes >= KB {
            format!("{:.2} KB", bytes as f64 / KB as f64)
        } else {
            format!("{} B", bytes)
        }
    }

    // Limit-style rate: zero means no limit
    pub fn format_rate(bytes_per_sec: u64) -> String {
        if bytes_per_sec == 0 {
            return "unlimited".to_string();
        }
        format!("{}/s", format_bytes(bytes_per_sec))
    }
}

pub mod time_utils {
    use std::time::{SystemTime, UNIX_EPOCH};

    /// Wall-clock milliseconds since the unix epoch.
    pub fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::format_utils::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn test_format_rate() {
        assert_eq!(format_rate(0), "unlimited");
        assert_eq!(format_rate(1024), "1.00 KB/s");
    }

    #[test]
    fn test_now_ms_is_recent() {
        // 2020-01-01
        assert!(super::time_utils::now_ms() > 1_577_836_800_000);
    }
}
