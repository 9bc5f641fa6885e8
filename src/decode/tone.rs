//! 正弦波发生器
//!
//! 直接按目标 SampleFormat 编码，用来在不同位深/符号/字节序下驱动输出管线

use std::f64::consts::TAU;

use super::{DecodeError, PcmSource};
use crate::audio::{SampleWidth, StreamSpec};

/// 每次 read 生成的帧数
const CHUNK_FRAMES: u64 = 1024;

/// 正弦波源
pub struct ToneSource {
    spec: StreamSpec,
    frequency: f64,
    amplitude: f64,
    /// 当前帧位置
    position: u64,
    /// 总帧数（None 表示无限）
    total_frames: Option<u64>,
}

impl ToneSource {
    /// `amplitude` 取 0.0..=1.0
    pub fn new(spec: StreamSpec, frequency: f64, amplitude: f64) -> Self {
        Self {
            spec,
            frequency,
            amplitude: amplitude.clamp(0.0, 1.0),
            position: 0,
            total_frames: None,
        }
    }

    /// 限制时长
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.total_frames = Some(duration_ms * self.spec.rate as u64 / 1000);
        self
    }

    pub fn position_frames(&self) -> u64 {
        self.position
    }

    /// 第 `frame` 帧的样本值（-1.0..=1.0）
    fn value_at(&self, frame: u64) -> f64 {
        let t = frame as f64 / self.spec.rate as f64;
        (TAU * self.frequency * t).sin() * self.amplitude
    }

    fn encode(&self, value: f64, out: &mut Vec<u8>) {
        let format = &self.spec.format;
        match format.width {
            SampleWidth::Bits8 => {
                let sample = (value * 127.0).round() as i8 as u8;
                out.push(if format.is_signed() { sample } else { sample ^ 0x80 });
            }
            SampleWidth::Bits16 => {
                let sample = (value * 32767.0).round() as i16 as u16;
                let word = if format.is_signed() { sample } else { sample ^ 0x8000 };
                out.extend_from_slice(&format.endianness.write_u16(word));
            }
        }
    }
}

impl PcmSource for ToneSource {
    fn spec(&self) -> StreamSpec {
        self.spec
    }

    fn read(&mut self, out: &mut Vec<u8>) -> Result<usize, DecodeError> {
        let remaining = self
            .total_frames
            .map_or(CHUNK_FRAMES, |total| total.saturating_sub(self.position));
        let frames = remaining.min(CHUNK_FRAMES);

        let channels = self.spec.format.channels.count();
        let start = out.len();
        out.reserve(frames as usize * self.spec.format.bytes_per_frame());
        for frame in self.position..self.position + frames {
            let value = self.value_at(frame);
            for _ in 0..channels {
                self.encode(value, out);
            }
        }
        self.position += frames;
        Ok(out.len() - start)
    }

    fn seek(&mut self, position_ms: u64) -> Result<u64, DecodeError> {
        let frame = position_ms * self.spec.rate as u64 / 1000;
        self.position = match self.total_frames {
            Some(total) => frame.min(total),
            None => frame,
        };
        Ok(self.position * 1000 / self.spec.rate as u64)
    }

    fn duration_ms(&self) -> Option<u64> {
        self.total_frames
            .map(|frames| frames * 1000 / self.spec.rate as u64)
    }
}
