//! 播放统计模块
//!
//! 在消费者（设备）步进中收集统计信息，采用降频采样策略减少开销。
//! 所有计数只作参考，不参与任何控制逻辑。

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

/// 统计采样间隔：每 N 次步进才采样一次
const SAMPLE_INTERVAL: u64 = 16;

/// 采样缓冲区大小
const SAMPLE_BUFFER_SIZE: usize = 256;

/// 播放统计收集器
///
/// 所有操作都是 lock-free 的，适合在消费者线程中使用
pub struct PlaybackStats {
    epoch: Instant,
    step_count: AtomicU64,
    last_sampled_ns: AtomicU64,

    // 步进间隔（纳秒）
    interval_buffer: Box<[AtomicU64; SAMPLE_BUFFER_SIZE]>,
    interval_write_idx: AtomicUsize,

    // 缓冲区水位（字节，也降频采样）
    water_level_buffer: Box<[AtomicUsize; SAMPLE_BUFFER_SIZE]>,
    water_level_write_idx: AtomicUsize,

    underrun_count: AtomicU64,
    short_write_count: AtomicU64,

    // 交给设备的字节数
    bytes_played: AtomicU64,
}

impl PlaybackStats {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            step_count: AtomicU64::new(0),
            last_sampled_ns: AtomicU64::new(0),
            interval_buffer: Box::new(std::array::from_fn(|_| AtomicU64::new(0))),
            interval_write_idx: AtomicUsize::new(0),
            water_level_buffer: Box::new(std::array::from_fn(|_| AtomicUsize::new(0))),
            water_level_write_idx: AtomicUsize::new(0),
            underrun_count: AtomicU64::new(0),
            short_write_count: AtomicU64::new(0),
            bytes_played: AtomicU64::new(0),
        }
    }

    /// 每次设备步进调用
    ///
    /// 只在采样点才读时钟 + 水位
    #[inline]
    pub fn on_step(&self, water_level: usize) {
        let count = self.step_count.fetch_add(1, Ordering::Relaxed);

        if count % SAMPLE_INTERVAL == 0 {
            // +1 保证 0 只表示"尚未采样"
            let now = self.epoch.elapsed().as_nanos() as u64 + 1;
            let last = self.last_sampled_ns.swap(now, Ordering::Relaxed);

            if last > 0 {
                let interval = now.saturating_sub(last);
                let idx =
                    self.interval_write_idx.fetch_add(1, Ordering::Relaxed) % SAMPLE_BUFFER_SIZE;
                self.interval_buffer[idx].store(interval, Ordering::Relaxed);
            }

            let idx =
                self.water_level_write_idx.fetch_add(1, Ordering::Relaxed) % SAMPLE_BUFFER_SIZE;
            self.water_level_buffer[idx].store(water_level, Ordering::Relaxed);
        }
    }

    /// 记录 underrun（设备已停止发声且没有数据可交付）
    #[inline]
    pub fn record_underrun(&self) {
        self.underrun_count.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录设备短写（接受的字节少于交付的字节）
    #[inline]
    pub fn record_short_write(&self) {
        self.short_write_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_bytes_played(&self, bytes: usize) {
        self.bytes_played.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn underrun_count(&self) -> u64 {
        self.underrun_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn short_write_count(&self) -> u64 {
        self.short_write_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn step_count(&self) -> u64 {
        self.step_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bytes_played(&self) -> u64 {
        self.bytes_played.load(Ordering::Relaxed)
    }

    /// 生成报告
    ///
    /// `expected_step`: 设备线程的期望步进周期（手动步进时为 None）
    pub fn report(&self, expected_step: Option<std::time::Duration>) -> StatsReport {
        let intervals_ns: Vec<u64> = self
            .interval_buffer
            .iter()
            .map(|v| v.load(Ordering::Relaxed))
            .filter(|&v| v > 0)
            .collect();

        let water_levels: Vec<usize> = self
            .water_level_buffer
            .iter()
            .map(|v| v.load(Ordering::Relaxed))
            .take(self.water_level_write_idx.load(Ordering::Relaxed))
            .collect();

        let interval_stats = match (intervals_ns.iter().min(), intervals_ns.iter().max()) {
            (Some(&min_ns), Some(&max_ns)) => IntervalStats {
                min_ns,
                max_ns,
                avg_ns: intervals_ns.iter().sum::<u64>() / intervals_ns.len() as u64,
            },
            _ => IntervalStats::default(),
        };

        let water_stats = match (water_levels.iter().min(), water_levels.iter().max()) {
            (Some(&min), Some(&max)) => WaterLevelStats { min, max },
            _ => WaterLevelStats::default(),
        };

        StatsReport {
            step_count: self.step_count(),
            sample_interval: SAMPLE_INTERVAL,
            expected_sampled_interval_ns: expected_step
                .map(|d| d.as_nanos() as u64 * SAMPLE_INTERVAL)
                .unwrap_or(0),
            interval_stats,
            water_stats,
            underrun_count: self.underrun_count(),
            short_write_count: self.short_write_count(),
            bytes_played: self.bytes_played(),
        }
    }

    /// 重置统计
    pub fn reset(&self) {
        self.step_count.store(0, Ordering::Relaxed);
        self.last_sampled_ns.store(0, Ordering::Relaxed);
        self.interval_write_idx.store(0, Ordering::Relaxed);
        self.water_level_write_idx.store(0, Ordering::Relaxed);
        self.underrun_count.store(0, Ordering::Relaxed);
        self.short_write_count.store(0, Ordering::Relaxed);
        self.bytes_played.store(0, Ordering::Relaxed);

        for i in 0..SAMPLE_BUFFER_SIZE {
            self.interval_buffer[i].store(0, Ordering::Relaxed);
            self.water_level_buffer[i].store(0, Ordering::Relaxed);
        }
    }
}

impl Default for PlaybackStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 统计报告
#[derive(Debug)]
pub struct StatsReport {
    pub step_count: u64,
    pub sample_interval: u64,
    pub expected_sampled_interval_ns: u64,
    pub interval_stats: IntervalStats,
    pub water_stats: WaterLevelStats,
    pub underrun_count: u64,
    pub short_write_count: u64,
    pub bytes_played: u64,
}

#[derive(Debug, Default)]
pub struct IntervalStats {
    pub min_ns: u64,
    pub max_ns: u64,
    pub avg_ns: u64,
}

#[derive(Debug, Default)]
pub struct WaterLevelStats {
    pub min: usize,
    pub max: usize,
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Playback Statistics")?;
        writeln!(f, "===================")?;
        writeln!(f, "Total device steps: {}", self.step_count)?;
        writeln!(f, "Stats sample interval: every {} steps", self.sample_interval)?;
        writeln!(f)?;

        writeln!(f, "Step Timing (per {} steps):", self.sample_interval)?;
        if self.expected_sampled_interval_ns > 0 {
            writeln!(
                f,
                "  Expected: {:.2} ms",
                self.expected_sampled_interval_ns as f64 / 1_000_000.0
            )?;
        }
        writeln!(f, "  Measured:")?;
        writeln!(f, "    Min: {:.2} ms", self.interval_stats.min_ns as f64 / 1_000_000.0)?;
        writeln!(f, "    Max: {:.2} ms", self.interval_stats.max_ns as f64 / 1_000_000.0)?;
        writeln!(f, "    Avg: {:.2} ms", self.interval_stats.avg_ns as f64 / 1_000_000.0)?;

        let jitter_ns = self
            .interval_stats
            .max_ns
            .saturating_sub(self.interval_stats.min_ns);
        writeln!(f, "  Jitter: {:.2} ms", jitter_ns as f64 / 1_000_000.0)?;
        writeln!(f)?;

        writeln!(f, "Ring Buffer Water Level:")?;
        writeln!(f, "  Min: {} bytes", self.water_stats.min)?;
        writeln!(f, "  Max: {} bytes", self.water_stats.max)?;
        writeln!(f)?;

        writeln!(f, "Underruns: {}", self.underrun_count)?;
        writeln!(f, "Short writes: {}", self.short_write_count)?;
        writeln!(f, "Bytes played: {}", self.bytes_played)?;

        Ok(())
    }
}
