//! 下载测速与进度上报节流

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 滑动窗口内保留的采样数上限，防止小 chunk 高频写入把窗口撑大
const MAX_SAMPLES: usize = 64;

/// 单次进度上报
#[derive(Debug, Clone, Copy)]
pub struct ProgressUpdate {
    /// 已下载字节数
    pub downloaded: u64,
    /// 总字节数（0 表示未知）
    pub total: u64,
    /// 即时速度 (bytes/s)
    pub speed: u64,
    /// 预计剩余时间（秒）
    pub eta_secs: Option<u64>,
}

/// 滑动窗口测速器
///
/// 窗口跨度与进度上报间隔一致，速度对瞬时抖动不敏感又能及时响应
#[derive(Debug)]
pub struct SpeedCalculator {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedCalculator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    /// 记录一批新到的字节
    pub fn record(&mut self, bytes: u64) {
        let now = Instant::now();
        self.samples.push_back((now, bytes));
        while self.samples.len() > MAX_SAMPLES {
            self.samples.pop_front();
        }
        while let Some((t, _)) = self.samples.front() {
            if now.duration_since(*t) > self.window && self.samples.len() > 1 {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// 当前窗口内的平均速度 (bytes/s)
    pub fn speed(&self) -> u64 {
        let Some((oldest, _)) = self.samples.front() else {
            return 0;
        };
        let elapsed = oldest.elapsed().as_secs_f64();
        if elapsed < 0.05 {
            return 0;
        }
        let bytes: u64 = self.samples.iter().map(|(_, b)| *b).sum();
        (bytes as f64 / elapsed) as u64
    }

    /// 预计剩余时间：速度与总大小都已知时才有值
    pub fn eta(&self, downloaded: u64, total: u64) -> Option<u64> {
        let speed = self.speed();
        if speed == 0 || total == 0 || downloaded >= total {
            return None;
        }
        Some((total - downloaded) / speed)
    }
}

/// 进度上报节流器：两次回调之间至少间隔 min_interval
#[derive(Debug)]
pub struct ProgressGate {
    min_interval: Duration,
    last: Option<Instant>,
}

impl ProgressGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    /// 距上次放行是否已超过最小间隔。放行时自动记录时间
    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_over_window() {
        let mut calc = SpeedCalculator::new(Duration::from_secs(2));
        calc.record(10_000);
        std::thread::sleep(Duration::from_millis(120));
        calc.record(10_000);

        let speed = calc.speed();
        // 约 20KB / 0.12s，留出调度误差
        assert!(speed > 50_000, "speed = {}", speed);
    }

    #[test]
    fn test_speed_empty_is_zero() {
        let calc = SpeedCalculator::new(Duration::from_secs(1));
        assert_eq!(calc.speed(), 0);
    }

    #[test]
    fn test_eta_requires_speed_and_total() {
        let mut calc = SpeedCalculator::new(Duration::from_secs(2));
        assert_eq!(calc.eta(0, 1000), None);

        calc.record(50_000);
        std::thread::sleep(Duration::from_millis(120));
        calc.record(50_000);
        // 总大小未知
        assert_eq!(calc.eta(100, 0), None);
        // 已经下完
        assert_eq!(calc.eta(1000, 1000), None);
        assert!(calc.eta(0, 100_000_000).is_some());
    }

    #[test]
    fn test_progress_gate_throttles() {
        let mut gate = ProgressGate::new(Duration::from_millis(80));
        assert!(gate.ready());
        assert!(!gate.ready());
        std::thread::sleep(Duration::from_millis(100));
        assert!(gate.ready());
        assert!(!gate.ready());
    }
}
