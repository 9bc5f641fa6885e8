//! 线性插值重采样器

use super::Resampler;

/// 16-bit 有符号样本范围
const SAMPLE_MIN: f64 = -32768.0;
const SAMPLE_MAX: f64 = 32767.0;

/// 线性插值重采样器
///
/// `fractional_index` 以帧为单位，指向 `pending` 中的读位置。
/// 输入不够插值下一帧时提前停止，剩余帧和小数位置留到下一次调用，
/// 保证跨缓冲区边界插值连续。
pub struct LinearResampler {
    channels: usize,
    pitch_ratio: f64,
    fractional_index: f64,
    gains: [f64; 2],
    /// 上次调用未用完的帧 + 本次输入
    pending: Vec<i16>,
}

impl LinearResampler {
    /// `channels`: 1 或 2，`pitch_ratio`: 输入帧 / 输出帧
    pub fn new(channels: usize, pitch_ratio: f64) -> Self {
        debug_assert!(channels == 1 || channels == 2);
        debug_assert!(pitch_ratio > 0.0);
        Self {
            channels,
            pitch_ratio,
            fractional_index: 0.0,
            gains: [1.0, 1.0],
            pending: Vec::new(),
        }
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    #[inline]
    pub fn fractional_index(&self) -> f64 {
        self.fractional_index
    }

    /// 跨调用保留的帧数
    #[inline]
    pub fn pending_frames(&self) -> usize {
        self.pending.len() / self.channels
    }

    #[inline]
    fn gain_unity(&self) -> bool {
        self.gains[0] == 1.0 && self.gains[1] == 1.0
    }

    #[inline]
    fn apply_gain(sample: f64, gain: f64) -> i16 {
        (sample * gain).clamp(SAMPLE_MIN, SAMPLE_MAX) as i16
    }

    /// 比率 1.0：整帧复制（必要时乘增益），不保留尾部
    fn copy_through(&mut self, output: &mut Vec<i16>) -> usize {
        let start = self.fractional_index as usize * self.channels;
        let start = start.min(self.pending.len());
        let frames = &self.pending[start..];

        if self.gain_unity() {
            output.extend_from_slice(frames);
        } else {
            let channels = self.channels;
            output.extend(
                frames
                    .iter()
                    .enumerate()
                    .map(|(i, &s)| Self::apply_gain(s as f64, self.gains[i % channels])),
            );
        }

        let produced = frames.len();
        self.pending.clear();
        self.fractional_index = 0.0;
        produced
    }

    fn interpolate(&mut self, output: &mut Vec<i16>) -> usize {
        let channels = self.channels;
        let frames = self.pending.len() / channels;
        let mut produced = 0;

        loop {
            let i0 = self.fractional_index.floor() as usize;
            if i0 + 1 >= frames {
                break;
            }
            let frac = self.fractional_index - i0 as f64;
            let a = &self.pending[i0 * channels..(i0 + 1) * channels];
            let b = &self.pending[(i0 + 1) * channels..(i0 + 2) * channels];

            for ch in 0..channels {
                let value = a[ch] as f64 * (1.0 - frac) + b[ch] as f64 * frac;
                output.push(Self::apply_gain(value, self.gains[ch]));
            }
            produced += channels;
            self.fractional_index += self.pitch_ratio;
        }

        // 丢弃不再需要的帧，保留小数位置
        let consumed = (self.fractional_index.floor() as usize).min(frames);
        self.pending.drain(..consumed * channels);
        self.fractional_index -= consumed as f64;
        produced
    }
}

impl Resampler for LinearResampler {
    fn process(&mut self, input: &[i16], output: &mut Vec<i16>) -> usize {
        let whole = input.len() - input.len() % self.channels;
        self.pending.extend_from_slice(&input[..whole]);

        if self.pitch_ratio == 1.0 {
            self.copy_through(output)
        } else {
            self.interpolate(output)
        }
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.fractional_index = 0.0;
    }

    fn ratio(&self) -> f64 {
        self.pitch_ratio
    }

    fn set_ratio(&mut self, ratio: f64) {
        if ratio <= 0.0 || !ratio.is_finite() {
            log::warn!("Ignoring invalid resample ratio {}", ratio);
            return;
        }
        // 回到 1.0 时对齐到整数位置，避免漂移
        if ratio == 1.0 && self.pitch_ratio != 1.0 {
            self.fractional_index = self.fractional_index.floor();
        }
        self.pitch_ratio = ratio;
    }

    fn set_gain(&mut self, left: f32, right: f32) {
        let left = left.max(0.0) as f64;
        let right = right.max(0.0) as f64;
        self.gains = if self.channels == 1 {
            // 单声道取左声道增益
            [left, left]
        } else {
            [left, right]
        };
    }

    fn is_identity(&self) -> bool {
        self.pitch_ratio == 1.0 && self.gain_unity()
    }
}
