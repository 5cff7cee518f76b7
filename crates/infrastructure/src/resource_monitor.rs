use std::time::Instant;
use tracing::{debug, warn};

/// 进程资源采样结果
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceSample {
    /// CPU使用率（百分比，多核时可能超过100）
    pub cpu_percent: f64,
    /// 常驻内存（MB）
    pub memory_mb: f64,
}

/// 进程资源采样器
///
/// 内存取自 `/proc/self/status` 的 VmRSS，CPU使用率由两次采样之间
/// `/proc/self/stat` 中 utime+stime 的增量计算。非Linux平台返回0。
#[derive(Debug)]
pub struct ResourceSampler {
    last_cpu_ticks: Option<u64>,
    last_sampled_at: Instant,
    memory_warning_threshold_mb: f64,
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler {
    /// 假定的内核时钟频率 (USER_HZ)
    const CLOCK_TICKS_PER_SECOND: f64 = 100.0;

    pub fn new() -> Self {
        Self {
            last_cpu_ticks: Self::read_cpu_ticks(),
            last_sampled_at: Instant::now(),
            memory_warning_threshold_mb: 1024.0,
        }
    }

    pub fn with_memory_warning_threshold(mut self, threshold_mb: f64) -> Self {
        self.memory_warning_threshold_mb = threshold_mb;
        self
    }

    /// 采集一次当前进程的资源使用情况
    pub fn sample(&mut self) -> ResourceSample {
        let now = Instant::now();
        let ticks = Self::read_cpu_ticks();

        let cpu_percent = match (self.last_cpu_ticks, ticks) {
            (Some(prev), Some(curr)) => {
                let elapsed = now.duration_since(self.last_sampled_at).as_secs_f64();
                cpu_percent_between(prev, curr, elapsed, Self::CLOCK_TICKS_PER_SECOND)
            }
            _ => 0.0,
        };

        self.last_cpu_ticks = ticks;
        self.last_sampled_at = now;

        let sample = ResourceSample {
            cpu_percent,
            memory_mb: Self::read_memory_mb().unwrap_or(0.0),
        };

        if sample.memory_mb >= self.memory_warning_threshold_mb {
            warn!(
                "High memory usage detected: {:.1}MB (threshold: {:.1}MB)",
                sample.memory_mb, self.memory_warning_threshold_mb
            );
        }

        debug!("Resource sample collected: {:?}", sample);
        sample
    }

    #[cfg(target_os = "linux")]
    fn read_memory_mb() -> Option<f64> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        parse_vm_rss_kb(&status).map(|kb| kb as f64 / 1024.0)
    }

    #[cfg(not(target_os = "linux"))]
    fn read_memory_mb() -> Option<f64> {
        None
    }

    #[cfg(target_os = "linux")]
    fn read_cpu_ticks() -> Option<u64> {
        let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
        parse_cpu_ticks(&stat)
    }

    #[cfg(not(target_os = "linux"))]
    fn read_cpu_ticks() -> Option<u64> {
        None
    }
}

fn cpu_percent_between(prev_ticks: u64, curr_ticks: u64, elapsed_secs: f64, hz: f64) -> f64 {
    if elapsed_secs <= 0.0 {
        return 0.0;
    }
    let used = curr_ticks.saturating_sub(prev_ticks) as f64 / hz;
    (used / elapsed_secs * 100.0).max(0.0)
}

fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse().ok())
}

/// 进程名可能包含空格，从最后一个 ')' 之后开始解析字段
fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // rest 从第3个字段(state)开始，utime/stime 分别是第14、15个字段
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\tjobqueue\nVmPeak:\t  20000 kB\nVmRSS:\t   10240 kB\nThreads:\t4\n";
        assert_eq!(parse_vm_rss_kb(status), Some(10240));
        assert_eq!(parse_vm_rss_kb("Name:\tx\n"), None);
    }

    #[test]
    fn test_parse_cpu_ticks_with_spaces_in_name() {
        let stat = "1234 (job queue) S 1 1234 1234 0 -1 4194560 100 0 0 0 250 50 0 0 20 0 4 0 100 0 0";
        assert_eq!(parse_cpu_ticks(stat), Some(300));
        assert_eq!(parse_cpu_ticks("garbage"), None);
    }

    #[test]
    fn test_cpu_percent_between() {
        assert_eq!(cpu_percent_between(100, 200, 2.0, 100.0), 50.0);
        assert_eq!(cpu_percent_between(200, 100, 1.0, 100.0), 0.0);
        assert_eq!(cpu_percent_between(100, 200, 0.0, 100.0), 0.0);
    }

    #[test]
    fn test_sample_is_non_negative() {
        let mut sampler = ResourceSampler::new();
        let sample = sampler.sample();
        assert!(sample.cpu_percent >= 0.0);
        assert!(sample.memory_mb >= 0.0);
    }
}
