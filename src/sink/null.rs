//! 虚拟设备
//!
//! 不发声，但按墙钟速度消耗数据：
//! 内部模拟一块固定时长的硬件缓冲区，写入的数据以 bytes_per_second 的速度"播放"掉。
//! 用于没有声卡的环境、性能测试和 CLI 的 `--output null`。

use std::time::{Duration, Instant};

use super::{AudioSink, SinkError};
use crate::audio::StreamSpec;

/// 虚拟设备
pub struct NullSink {
    /// 模拟硬件缓冲区时长
    hardware_buffer: Duration,
    /// 固定设备采样率（None = 跟随源）
    fixed_rate: Option<u32>,
    spec: Option<StreamSpec>,
    capacity: usize,
    /// mark 时刻驻留在"硬件"里的字节
    queued_at_mark: usize,
    mark: Instant,
    paused: bool,
    bytes_rendered: u64,
}

impl NullSink {
    pub fn new(hardware_buffer: Duration) -> Self {
        Self {
            hardware_buffer,
            fixed_rate: None,
            spec: None,
            capacity: 0,
            queued_at_mark: 0,
            mark: Instant::now(),
            paused: false,
            bytes_rendered: 0,
        }
    }

    /// 模拟只支持单一采样率的设备
    pub fn with_fixed_rate(mut self, rate: u32) -> Self {
        self.fixed_rate = Some(rate);
        self
    }

    /// 从开始到现在已"播放"的字节（含 mark 之后的部分）
    pub fn bytes_rendered(&self) -> u64 {
        self.bytes_rendered + (self.queued_at_mark - self.queued_now()) as u64
    }

    /// 按墙钟扣除已播放的字节
    fn queued_now(&self) -> usize {
        let Some(spec) = self.spec else {
            return 0;
        };
        if self.paused {
            return self.queued_at_mark;
        }
        let elapsed = self.mark.elapsed().as_secs_f64();
        let played = (elapsed * spec.bytes_per_second() as f64) as usize;
        self.queued_at_mark.saturating_sub(played)
    }

    /// 把 mark 推进到现在
    fn settle(&mut self) {
        let queued = self.queued_now();
        self.bytes_rendered += (self.queued_at_mark - queued) as u64;
        self.queued_at_mark = queued;
        self.mark = Instant::now();
    }
}

impl Default for NullSink {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl AudioSink for NullSink {
    fn name(&self) -> &str {
        "null"
    }

    fn native_format(&self, requested: &StreamSpec) -> StreamSpec {
        StreamSpec {
            format: requested.format,
            rate: self.fixed_rate.unwrap_or(requested.rate),
        }
    }

    fn open(&mut self, spec: &StreamSpec) -> Result<(), SinkError> {
        let frame = spec.format.bytes_per_frame();
        // 至少一帧
        self.capacity = spec
            .ms_to_bytes(self.hardware_buffer.as_millis() as u64)
            .max(frame);
        self.spec = Some(*spec);
        self.queued_at_mark = 0;
        self.bytes_rendered = 0;
        self.mark = Instant::now();
        self.paused = false;
        log::debug!(
            "Null sink opened: {}, hardware buffer {} bytes",
            spec,
            self.capacity
        );
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> usize {
        if self.spec.is_none() {
            return 0;
        }
        self.settle();
        let accepted = data.len().min(self.capacity - self.queued_at_mark);
        self.queued_at_mark += accepted;
        accepted
    }

    fn free_bytes(&self) -> usize {
        self.capacity - self.queued_now()
    }

    fn resident_bytes(&self) -> usize {
        self.queued_now()
    }

    fn is_rendering(&self) -> bool {
        !self.paused && self.queued_now() > 0
    }

    fn pause(&mut self, paused: bool) {
        if self.paused != paused {
            self.settle();
            self.paused = paused;
        }
    }

    fn discard(&mut self) {
        self.settle();
        self.queued_at_mark = 0;
    }

    fn close(&mut self) {
        if self.spec.take().is_some() {
            log::debug!("Null sink closed after {} bytes", self.bytes_rendered);
        }
        self.queued_at_mark = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{ChannelLayout, SampleFormat};

    fn spec() -> StreamSpec {
        StreamSpec::new(SampleFormat::s16_native(ChannelLayout::Stereo), 44100).unwrap()
    }

    #[test]
    fn test_capacity_limits_writes() {
        let mut sink = NullSink::new(Duration::from_millis(100));
        sink.open(&spec()).unwrap();
        sink.pause(true);

        // 100ms = 17640 字节
        let data = vec![0u8; 20_000];
        assert_eq!(sink.write(&data), 17_640);
        assert_eq!(sink.free_bytes(), 0);
        assert_eq!(sink.resident_bytes(), 17_640);
        assert!(!sink.is_rendering());
    }

    #[test]
    fn test_drains_over_time() {
        let mut sink = NullSink::new(Duration::from_millis(100));
        sink.open(&spec()).unwrap();
        sink.write(&vec![0u8; 8820]);
        assert!(sink.is_rendering());

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(sink.resident_bytes(), 0);
        assert!(!sink.is_rendering());
        assert_eq!(sink.bytes_rendered(), 8820);
    }

    #[test]
    fn test_discard_and_close() {
        let mut sink = NullSink::default();
        sink.open(&spec()).unwrap();
        sink.pause(true);
        sink.write(&[0u8; 400]);
        sink.discard();
        assert_eq!(sink.resident_bytes(), 0);

        sink.close();
        assert_eq!(sink.write(&[0u8; 4]), 0);
    }

    #[test]
    fn test_fixed_rate_negotiation() {
        let sink = NullSink::default().with_fixed_rate(48000);
        let native = sink.native_format(&spec());
        assert_eq!(native.rate, 48000);
        assert_eq!(native.format, spec().format);
    }
}
