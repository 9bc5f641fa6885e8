//! 播放时钟记账
//!
//! 把流经管线的字节数换算成毫秒位置：
//! - written_time: 解码器进度（按源格式字节计）
//! - output_time: 听众当前听到的位置（按交给设备的字节计，减去仍驻留在设备里的字节）
//!
//! 先减去设备驻留字节，再加 flush 偏移。
//! flush 之间 output_time 单调不减（高水位保护，设备驻留估计抖动时也不会倒退）。
//!
//! 变速（rebase）时，已交付但仍驻留在设备里的字节按旧字节率记为 carried，
//! 设备驻留字节总是最新交付的那部分：先从新字节率的计数里扣，不够再扣 carried。

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crossbeam_utils::atomic::AtomicCell;

/// 时钟记账器
///
/// 所有字段都是原子量：生产者记写入，消费者记消费，UI 线程只读
pub struct ClockAccountant {
    bytes_written: AtomicU64,
    bytes_consumed: AtomicU64,
    time_offset_ms: AtomicI64,
    /// 源格式每秒字节数
    input_bps: u32,
    /// 设备侧每秒（曲目时间）字节数 = 设备字节率 / 用户变速
    output_bps: AtomicCell<f64>,
    /// 上次 rebase 时仍驻留在设备里的字节
    carried_bytes: AtomicU64,
    /// carried 字节的等效每秒字节数
    carried_bps: AtomicCell<f64>,
    high_water_ms: AtomicI64,
}

impl ClockAccountant {
    pub fn new(input_bps: u32, output_bps: f64) -> Self {
        debug_assert!(input_bps > 0 && output_bps > 0.0);
        Self {
            bytes_written: AtomicU64::new(0),
            bytes_consumed: AtomicU64::new(0),
            time_offset_ms: AtomicI64::new(0),
            input_bps,
            output_bps: AtomicCell::new(output_bps),
            carried_bytes: AtomicU64::new(0),
            carried_bps: AtomicCell::new(output_bps),
            high_water_ms: AtomicI64::new(0),
        }
    }

    /// 生产者：记入源格式字节
    #[inline]
    pub fn record_write(&self, n: usize) {
        self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// 消费者：记入交给设备的字节（交付时记，不等设备确认）
    #[inline]
    pub fn record_consumed(&self, n: usize) {
        self.bytes_consumed.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn bytes_consumed(&self) -> u64 {
        self.bytes_consumed.load(Ordering::Relaxed)
    }

    pub fn time_offset_ms(&self) -> i64 {
        self.time_offset_ms.load(Ordering::Acquire)
    }

    /// 解码器进度（毫秒，含 flush 偏移）
    pub fn written_time_ms(&self) -> i64 {
        let written = self.bytes_written.load(Ordering::Relaxed);
        self.time_offset_ms() + (written * 1000 / self.input_bps as u64) as i64
    }

    /// 听众当前位置（毫秒）
    ///
    /// `device_resident_bytes`: 已交给设备但尚未发声的字节数
    pub fn output_time_ms(&self, device_resident_bytes: usize) -> i64 {
        let consumed = self.bytes_consumed.load(Ordering::Relaxed);
        let split = self.split_resident(consumed, device_resident_bytes);
        let now = self.time_offset_ms() + split.audible_ms as i64;

        let previous = self.high_water_ms.fetch_max(now, Ordering::AcqRel);
        previous.max(now)
    }

    /// 按"驻留字节是最新交付的"把 consumed + carried 拆成已发声 / 仍驻留两部分
    fn split_resident(&self, consumed: u64, device_resident_bytes: usize) -> ResidentSplit {
        let carried = self.carried_bytes.load(Ordering::Relaxed);
        let output_bps = self.output_bps.load();
        let carried_bps = self.carried_bps.load();

        let resident = device_resident_bytes as u64;
        let new_resident = resident.min(consumed);
        let old_resident = (resident - new_resident).min(carried);

        ResidentSplit {
            audible_ms: (consumed - new_resident) as f64 * 1000.0 / output_bps
                + (carried - old_resident) as f64 * 1000.0 / carried_bps,
            resident_bytes: new_resident + old_resident,
            resident_ms: new_resident as f64 * 1000.0 / output_bps
                + old_resident as f64 * 1000.0 / carried_bps,
        }
    }

    /// Seek：偏移设为目标时间，计数清零
    ///
    /// 必须和 RingBuffer::reset 在同一把锁内调用
    pub fn on_flush(&self, target_ms: i64) {
        self.bytes_written.store(0, Ordering::Relaxed);
        self.bytes_consumed.store(0, Ordering::Relaxed);
        self.carried_bytes.store(0, Ordering::Relaxed);
        self.time_offset_ms.store(target_ms, Ordering::Release);
        self.high_water_ms.store(target_ms, Ordering::Release);
    }

    /// 设备侧字节率变化（变速）前，把已发声的时间折入偏移
    ///
    /// 仍驻留在设备里的字节按交付时的字节率转为 carried，发声后照常计入；
    /// 之后 `bytes_consumed` 从零开始按新字节率计算
    pub fn rebase(&self, new_output_bps: f64, device_resident_bytes: usize) {
        let consumed = self.bytes_consumed.swap(0, Ordering::Relaxed);
        let split = self.split_resident(consumed, device_resident_bytes);
        let elapsed = split.audible_ms as i64;

        self.time_offset_ms.fetch_add(elapsed, Ordering::AcqRel);
        let carried_bps = if split.resident_ms > 0.0 {
            split.resident_bytes as f64 * 1000.0 / split.resident_ms
        } else {
            new_output_bps
        };
        self.carried_bps.store(carried_bps);
        self.carried_bytes.store(split.resident_bytes, Ordering::Relaxed);
        self.output_bps.store(new_output_bps);
        log::debug!(
            "Clock rebased: +{}ms ({} bytes carried), output rate {:.1} B/s",
            elapsed,
            split.resident_bytes,
            new_output_bps
        );
    }
}

struct ResidentSplit {
    audible_ms: f64,
    resident_bytes: u64,
    resident_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    // 44.1kHz 16-bit 立体声
    const BPS: u32 = 176_400;

    #[test]
    fn test_written_time() {
        let clock = ClockAccountant::new(BPS, BPS as f64);
        clock.record_write(BPS as usize / 2);
        assert_eq!(clock.written_time_ms(), 500);
        clock.record_write(BPS as usize / 2);
        assert_eq!(clock.written_time_ms(), 1000);
    }

    #[test]
    fn test_output_time_subtracts_resident() {
        let clock = ClockAccountant::new(BPS, BPS as f64);
        clock.record_consumed(BPS as usize);
        // 100ms 还在设备里
        assert_eq!(clock.output_time_ms(17_640), 900);
        assert_eq!(clock.output_time_ms(0), 1000);
    }

    #[test]
    fn test_resident_larger_than_consumed_saturates() {
        let clock = ClockAccountant::new(BPS, BPS as f64);
        clock.record_consumed(100);
        assert_eq!(clock.output_time_ms(10_000), 0);
    }

    #[test]
    fn test_flush_sets_offset() {
        let clock = ClockAccountant::new(BPS, BPS as f64);
        clock.record_write(BPS as usize * 3);
        clock.record_consumed(BPS as usize * 2);
        assert_eq!(clock.output_time_ms(0), 2000);

        // 向后 seek：高水位跟着重置
        clock.on_flush(500);
        assert_eq!(clock.output_time_ms(0), 500);
        assert_eq!(clock.written_time_ms(), 500);
        assert_eq!(clock.bytes_written(), 0);
        assert_eq!(clock.bytes_consumed(), 0);

        clock.record_consumed(BPS as usize);
        assert_eq!(clock.output_time_ms(0), 1500);
    }

    #[test]
    fn test_monotonic_between_flushes() {
        let mut rng = rand::thread_rng();
        let clock = ClockAccountant::new(BPS, BPS as f64);
        let mut last = clock.output_time_ms(0);

        for _ in 0..10_000 {
            match rng.gen_range(0..3) {
                0 => clock.record_write(rng.gen_range(0..8192)),
                1 => clock.record_consumed(rng.gen_range(0..4096)),
                _ => {}
            }
            // 设备驻留估计任意抖动
            let resident = rng.gen_range(0..32_768);
            let now = clock.output_time_ms(resident);
            assert!(now >= last, "output time went backwards: {} -> {}", last, now);
            last = now;
        }
    }

    #[test]
    fn test_rebase_keeps_position() {
        let clock = ClockAccountant::new(BPS, BPS as f64);
        clock.record_consumed(BPS as usize);
        assert_eq!(clock.output_time_ms(0), 1000);

        // 2 倍速：设备每秒字节只覆盖一半曲目时间的字节
        clock.rebase(BPS as f64 / 2.0, 0);
        assert_eq!(clock.time_offset_ms(), 1000);
        assert_eq!(clock.output_time_ms(0), 1000);

        clock.record_consumed(BPS as usize / 2);
        assert_eq!(clock.output_time_ms(0), 2000);
    }

    #[test]
    fn test_rebase_carries_device_resident_bytes() {
        let clock = ClockAccountant::new(BPS, BPS as f64);
        clock.record_consumed(BPS as usize);
        // 100ms 还在设备里
        clock.rebase(BPS as f64, 17_640);
        assert_eq!(clock.time_offset_ms(), 900);
        assert_eq!(clock.output_time_ms(17_640), 900);

        // 设备把剩下的 100ms 放完
        assert_eq!(clock.output_time_ms(0), 1000);

        clock.record_consumed(BPS as usize);
        assert_eq!(clock.output_time_ms(17_640), 1900);
        assert_eq!(clock.output_time_ms(0), 2000);
    }

    #[test]
    fn test_rebase_resident_bytes_keep_old_rate() {
        let clock = ClockAccountant::new(BPS, BPS as f64);
        clock.record_consumed(BPS as usize);
        clock.rebase(BPS as f64 / 2.0, 17_640);
        assert_eq!(clock.output_time_ms(17_640), 900);
        assert_eq!(clock.output_time_ms(0), 1000);

        // 新速率下交付 100ms 曲目时间（8820 字节），全部还在设备里
        clock.record_consumed(8_820);
        assert_eq!(clock.output_time_ms(8_820), 1000);
        assert_eq!(clock.output_time_ms(0), 1100);

        // seek 丢弃 carried
        clock.on_flush(0);
        clock.record_consumed(8_820);
        assert_eq!(clock.output_time_ms(0), 100);
    }

    #[test]
    fn test_rebase_twice_with_resident() {
        let clock = ClockAccountant::new(BPS, BPS as f64);
        clock.record_consumed(BPS as usize);
        clock.rebase(BPS as f64 / 2.0, 17_640);
        // 设备还没放任何东西又变速：carried 合并
        clock.rebase(BPS as f64, 17_640);
        assert_eq!(clock.output_time_ms(17_640), 900);
        assert_eq!(clock.output_time_ms(0), 1000);
    }
}
