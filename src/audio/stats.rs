//! 流统计模块
//!
//! 在音频回调中收集统计信息，采用降频采样策略减少开销。
//! 桥接线程记录交付、生产失败、被拒绝的填充

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::stream_buffer::StreamBuffer;
use super::timing::{now_ns, ns_to_ms};

/// 统计采样间隔：每 N 次 callback 才采样一次
const SAMPLE_INTERVAL: u64 = 16;

/// 采样环缓冲大小
const HISTORY_SIZE: usize = 256;

/// 流统计收集器
///
/// 所有操作都是 lock-free 的，适合在音频回调中使用
pub struct StreamStats {
    callback_count: AtomicU64,
    last_sampled_ns: AtomicU64,

    interval_buffer: Box<[AtomicU64; HISTORY_SIZE]>,
    interval_write_idx: AtomicUsize,

    // 已缓冲样本数（也降频采样）
    water_level_buffer: Box<[AtomicUsize; HISTORY_SIZE]>,
    water_level_write_idx: AtomicUsize,

    underrun_callbacks: AtomicU64,
    silent_samples: AtomicU64,
    samples_played: AtomicU64,

    blocks_delivered: AtomicU64,
    producer_failures: AtomicU64,
    rejected_fills: AtomicU64,
}

impl StreamStats {
    pub fn new() -> Self {
        Self {
            callback_count: AtomicU64::new(0),
            last_sampled_ns: AtomicU64::new(0),
            interval_buffer: Box::new(std::array::from_fn(|_| AtomicU64::new(0))),
            interval_write_idx: AtomicUsize::new(0),
            water_level_buffer: Box::new(std::array::from_fn(|_| AtomicUsize::new(0))),
            water_level_write_idx: AtomicUsize::new(0),
            underrun_callbacks: AtomicU64::new(0),
            silent_samples: AtomicU64::new(0),
            samples_played: AtomicU64::new(0),
            blocks_delivered: AtomicU64::new(0),
            producer_failures: AtomicU64::new(0),
            rejected_fills: AtomicU64::new(0),
        }
    }

    /// 在 render callback 开头调用
    ///
    /// 只在采样点才读时钟和水位
    #[inline]
    pub fn on_callback(&self, buffer: &StreamBuffer) {
        let count = self.callback_count.fetch_add(1, Ordering::Relaxed);
        if count % SAMPLE_INTERVAL != 0 {
            return;
        }

        let now = now_ns();
        let last = self.last_sampled_ns.swap(now, Ordering::Relaxed);
        if last > 0 {
            let idx = self.interval_write_idx.fetch_add(1, Ordering::Relaxed) % HISTORY_SIZE;
            self.interval_buffer[idx].store(now.saturating_sub(last), Ordering::Relaxed);
        }

        let idx = self.water_level_write_idx.fetch_add(1, Ordering::Relaxed) % HISTORY_SIZE;
        self.water_level_buffer[idx].store(buffer.buffered_samples(), Ordering::Relaxed);
    }

    /// 一次 callback 中有 `silent` 个位置因 underrun 输出了静音
    #[inline]
    pub fn record_underrun(&self, silent: usize) {
        self.underrun_callbacks.fetch_add(1, Ordering::Relaxed);
        self.silent_samples.fetch_add(silent as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_samples_played(&self, samples: u64) {
        self.samples_played.fetch_add(samples, Ordering::Relaxed);
    }

    pub fn record_block_delivered(&self) {
        self.blocks_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_producer_failure(&self) {
        self.producer_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_fill(&self) {
        self.rejected_fills.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn callback_count(&self) -> u64 {
        self.callback_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn underrun_count(&self) -> u64 {
        self.underrun_callbacks.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn silent_samples(&self) -> u64 {
        self.silent_samples.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn samples_played(&self) -> u64 {
        self.samples_played.load(Ordering::Relaxed)
    }

    pub fn blocks_delivered(&self) -> u64 {
        self.blocks_delivered.load(Ordering::Relaxed)
    }

    pub fn producer_failures(&self) -> u64 {
        self.producer_failures.load(Ordering::Relaxed)
    }

    pub fn rejected_fills(&self) -> u64 {
        self.rejected_fills.load(Ordering::Relaxed)
    }

    /// 生成报告
    ///
    /// `frames_per_callback` 为 0 时不计算期望间隔
    pub fn report(&self, frames_per_callback: u32, sample_rate: u32) -> StatsReport {
        let expected_interval_ns = if sample_rate > 0 {
            frames_per_callback as u64 * 1_000_000_000 / sample_rate as u64
        } else {
            0
        };

        let intervals: Vec<u64> = self
            .interval_buffer
            .iter()
            .map(|v| v.load(Ordering::Relaxed))
            .filter(|&v| v > 0)
            .collect();

        let levels: Vec<usize> = self
            .water_level_buffer
            .iter()
            .take(self.water_level_write_idx.load(Ordering::Relaxed).min(HISTORY_SIZE))
            .map(|v| v.load(Ordering::Relaxed))
            .collect();

        let interval_stats = match (intervals.iter().min(), intervals.iter().max()) {
            (Some(&min_ns), Some(&max_ns)) => IntervalStats {
                min_ns,
                max_ns,
                avg_ns: intervals.iter().sum::<u64>() / intervals.len() as u64,
            },
            _ => IntervalStats::default(),
        };

        let water_stats = match (levels.iter().min(), levels.iter().max()) {
            (Some(&min), Some(&max)) => WaterLevelStats { min, max },
            _ => WaterLevelStats::default(),
        };

        StatsReport {
            callback_count: self.callback_count(),
            sample_interval: SAMPLE_INTERVAL,
            expected_sampled_interval_ns: expected_interval_ns * SAMPLE_INTERVAL,
            interval_stats,
            water_stats,
            underrun_count: self.underrun_count(),
            silent_samples: self.silent_samples(),
            samples_played: self.samples_played(),
            blocks_delivered: self.blocks_delivered(),
            producer_failures: self.producer_failures(),
            rejected_fills: self.rejected_fills(),
        }
    }
}

impl Default for StreamStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 统计报告
#[derive(Debug, Clone)]
pub struct StatsReport {
    pub callback_count: u64,
    pub sample_interval: u64,
    pub expected_sampled_interval_ns: u64,
    pub interval_stats: IntervalStats,
    pub water_stats: WaterLevelStats,
    pub underrun_count: u64,
    pub silent_samples: u64,
    pub samples_played: u64,
    pub blocks_delivered: u64,
    pub producer_failures: u64,
    pub rejected_fills: u64,
}

#[derive(Debug, Clone, Default)]
pub struct IntervalStats {
    pub min_ns: u64,
    pub max_ns: u64,
    pub avg_ns: u64,
}

#[derive(Debug, Clone, Default)]
pub struct WaterLevelStats {
    pub min: usize,
    pub max: usize,
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Stream Statistics")?;
        writeln!(f, "=================")?;
        writeln!(f, "Total callbacks: {}", self.callback_count)?;
        writeln!(
            f,
            "Stats sample interval: every {} callbacks",
            self.sample_interval
        )?;
        writeln!(f)?;

        writeln!(f, "Callback Timing (per {} callbacks):", self.sample_interval)?;
        writeln!(
            f,
            "  Expected: {:.2} ms",
            ns_to_ms(self.expected_sampled_interval_ns)
        )?;
        writeln!(f, "  Measured:")?;
        writeln!(f, "    Min: {:.2} ms", ns_to_ms(self.interval_stats.min_ns))?;
        writeln!(f, "    Max: {:.2} ms", ns_to_ms(self.interval_stats.max_ns))?;
        writeln!(f, "    Avg: {:.2} ms", ns_to_ms(self.interval_stats.avg_ns))?;

        let jitter_ns = self
            .interval_stats
            .max_ns
            .saturating_sub(self.interval_stats.min_ns);
        let jitter_pct = if self.expected_sampled_interval_ns > 0 {
            jitter_ns as f64 / self.expected_sampled_interval_ns as f64 * 100.0
        } else {
            0.0
        };
        writeln!(
            f,
            "  Jitter: {:.2} ms ({:.1}%)",
            ns_to_ms(jitter_ns),
            jitter_pct
        )?;
        writeln!(f)?;

        writeln!(f, "Buffered Samples:")?;
        writeln!(f, "  Min: {}", self.water_stats.min)?;
        writeln!(f, "  Max: {}", self.water_stats.max)?;
        writeln!(f)?;

        writeln!(
            f,
            "Underruns: {} callbacks, {} silent samples",
            self.underrun_count, self.silent_samples
        )?;
        writeln!(f, "Samples played: {}", self.samples_played)?;
        writeln!(f, "Blocks delivered: {}", self.blocks_delivered)?;
        writeln!(f, "Producer failures: {}", self.producer_failures)?;
        writeln!(f, "Rejected fills: {}", self.rejected_fills)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::block::SampleBlock;

    #[test]
    fn test_counters() {
        let stats = StreamStats::new();
        stats.record_underrun(3);
        stats.record_underrun(2);
        stats.add_samples_played(100);
        stats.record_block_delivered();
        stats.record_producer_failure();
        stats.record_rejected_fill();

        assert_eq!(stats.underrun_count(), 2);
        assert_eq!(stats.silent_samples(), 5);
        assert_eq!(stats.samples_played(), 100);
        assert_eq!(stats.blocks_delivered(), 1);
        assert_eq!(stats.producer_failures(), 1);
        assert_eq!(stats.rejected_fills(), 1);
    }

    #[test]
    fn test_water_level_sampled() {
        let stats = StreamStats::new();
        let buffer = StreamBuffer::default();
        buffer.fill(0, SampleBlock::silence(64)).unwrap();

        for _ in 0..SAMPLE_INTERVAL * 2 {
            stats.on_callback(&buffer);
        }

        let report = stats.report(512, 48_000);
        assert_eq!(report.callback_count, SAMPLE_INTERVAL * 2);
        assert_eq!(report.water_stats.max, 64);
        assert_eq!(report.water_stats.min, 64);
        assert_eq!(report.expected_sampled_interval_ns, 512 * 1_000_000_000 / 48_000 * SAMPLE_INTERVAL);
    }

    #[test]
    fn test_report_display() {
        let stats = StreamStats::new();
        stats.record_producer_failure();
        let text = stats.report(256, 44_100).to_string();
        assert!(text.contains("Producer failures: 1"));
        assert!(text.contains("Underruns: 0 callbacks"));
    }
}
