//! Process-level CPU/memory readings for the health sampler

#[cfg(target_os = "linux")]
use std::time::Duration;

/// Sample system CPU and memory usage as percentages
#[cfg(target_os = "linux")]
pub async fn sample_system() -> (f64, f64) {
    let (idle1, total1) = read_cpu_stat();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let (idle2, total2) = read_cpu_stat();

    let delta_total = total2.saturating_sub(total1);
    let delta_idle = idle2.saturating_sub(idle1);

    let cpu = if delta_total > 0 {
        (delta_total.saturating_sub(delta_idle) as f64 / delta_total as f64 * 100.0).min(100.0)
    } else {
        0.0
    };

    (cpu, read_memory_usage())
}

#[cfg(not(target_os = "linux"))]
pub async fn sample_system() -> (f64, f64) {
    (0.0, 0.0)
}

/// Aggregate (idle, total) jiffies from the `cpu` line of /proc/stat
#[cfg(target_os = "linux")]
fn read_cpu_stat() -> (u64, u64) {
    let data = match std::fs::read_to_string("/proc/stat") {
        Ok(data) => data,
        Err(_) => return (0, 0),
    };

    for line in data.lines() {
        if let Some(rest) = line.strip_prefix("cpu ") {
            let mut total = 0u64;
            let mut idle = 0u64;
            for (i, field) in rest.split_whitespace().enumerate() {
                let value: u64 = field.parse().unwrap_or(0);
                total += value;
                if i == 3 {
                    idle = value;
                }
            }
            return (idle, total);
        }
    }

    (0, 0)
}

/// Used-memory percentage from /proc/meminfo
#[cfg(target_os = "linux")]
fn read_memory_usage() -> f64 {
    let data = match std::fs::read_to_string("/proc/meminfo") {
        Ok(data) => data,
        Err(_) => return 0.0,
    };

    let mut total = 0u64;
    let mut available = 0u64;
    for line in data.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("MemTotal:") => total = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0),
            Some("MemAvailable:") => {
                available = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0)
            }
            _ => {}
        }
    }

    if total > 0 {
        (total.saturating_sub(available)) as f64 / total as f64 * 100.0
    } else {
        0.0
    }
}
