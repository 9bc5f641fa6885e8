//! 样本格式转换矩阵
//!
//! 在流打开时根据 (源格式, 目标格式) 选出一个 Conversion，之后每个 buffer 复用。
//! 组合顺序固定：修正字节序 → 修正位深 → 修正符号。
//! 位深转换假定主机字节序，所以非主机字节序的 16-bit 输入先交换，
//! 需要输出非主机字节序时最后再交换回去。
//!
//! - 缩窄（16 → 8）原地进行，输出长度 ≤ 输入长度
//! - 扩宽（8 → 16）必须写入调用方提供的 scratch（长度 = 输入 × 2）

use thiserror::Error;

use super::format::{Endianness, SampleFormat, SampleWidth};

/// 转换错误（只会在流打开时出现）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConvertError {
    #[error("conversion cannot change channel count ({src} -> {dst})")]
    ChannelMismatch { src: SampleFormat, dst: SampleFormat },
    #[error("widening conversion {src} -> {dst} cannot run in place")]
    InPlaceWidening { src: SampleFormat, dst: SampleFormat },
}

/// 等长的逐样本变换
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Step {
    /// 交换 16-bit 字的两个字节
    SwapBytes,
    /// 翻转 16-bit 符号位，`order` 是翻转时 buffer 的字节序
    FlipSign16 { order: Endianness },
    /// 翻转 8-bit 符号位
    FlipSign8,
}

/// 位深变化
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Resize {
    Keep,
    /// 取主机字节序 16-bit 样本的高字节
    Narrow,
    /// 8-bit 样本移入主机字节序 16-bit 的高字节，低字节补零
    Widen,
}

/// 选定的转换函数
#[derive(Clone, Debug)]
pub struct Conversion {
    src: SampleFormat,
    dst: SampleFormat,
    before: Vec<Step>,
    resize: Resize,
    after: Vec<Step>,
}

/// 选择 src → dst 的转换
///
/// - 格式兼容返回 `Ok(None)`，调用方直接拷贝
/// - 声道数不同是配置错误（转换从不改变声道数）
pub fn select(src: SampleFormat, dst: SampleFormat) -> Result<Option<Conversion>, ConvertError> {
    let s = src.normalized();
    let d = dst.normalized();

    if s.channels != d.channels {
        return Err(ConvertError::ChannelMismatch { src, dst });
    }
    if s == d {
        return Ok(None);
    }

    let native = Endianness::Native.resolve();
    let sign_differs = s.signedness != d.signedness;
    let mut before = Vec::with_capacity(2);
    let mut after = Vec::with_capacity(2);

    let resize = match (s.width, d.width) {
        (SampleWidth::Bits16, SampleWidth::Bits16) => {
            let mut order = s.endianness;
            if s.endianness != d.endianness {
                before.push(Step::SwapBytes);
                order = d.endianness;
            }
            if sign_differs {
                before.push(Step::FlipSign16 { order });
            }
            Resize::Keep
        }
        (SampleWidth::Bits8, SampleWidth::Bits8) => {
            // 归一化后只剩符号可能不同
            before.push(Step::FlipSign8);
            Resize::Keep
        }
        (SampleWidth::Bits16, SampleWidth::Bits8) => {
            if s.endianness != native {
                before.push(Step::SwapBytes);
            }
            if sign_differs {
                after.push(Step::FlipSign8);
            }
            Resize::Narrow
        }
        (SampleWidth::Bits8, SampleWidth::Bits16) => {
            if sign_differs {
                after.push(Step::FlipSign16 { order: native });
            }
            if d.endianness != native {
                after.push(Step::SwapBytes);
            }
            Resize::Widen
        }
    };

    log::debug!(
        "Conversion {} -> {}: {:?} {:?} {:?}",
        src,
        dst,
        before,
        resize,
        after
    );

    Ok(Some(Conversion {
        src,
        dst,
        before,
        resize,
        after,
    }))
}

impl Conversion {
    pub fn src(&self) -> SampleFormat {
        self.src
    }

    pub fn dst(&self) -> SampleFormat {
        self.dst
    }

    /// 是否需要独立输出缓冲区
    #[inline]
    pub fn widens(&self) -> bool {
        self.resize == Resize::Widen
    }

    /// 给定输入字节数，输出的字节数（不完整的尾样本被丢弃）
    #[inline]
    pub fn output_len(&self, input_len: usize) -> usize {
        let samples = input_len / self.src.bytes_per_sample();
        samples * self.dst.bytes_per_sample()
    }

    /// 原地转换，返回输出字节数
    ///
    /// 扩宽转换会返回错误，请用 [`Conversion::convert`]
    pub fn convert_in_place(&self, buf: &mut [u8]) -> Result<usize, ConvertError> {
        if self.widens() {
            return Err(ConvertError::InPlaceWidening {
                src: self.src,
                dst: self.dst,
            });
        }

        let len = buf.len() - buf.len() % self.src.bytes_per_sample();
        let buf = &mut buf[..len];
        for &step in &self.before {
            apply(step, buf);
        }

        let len = match self.resize {
            Resize::Narrow => narrow_in_place(buf),
            _ => len,
        };
        for &step in &self.after {
            apply(step, &mut buf[..len]);
        }
        Ok(len)
    }

    /// 转换到 scratch，返回输出字节数
    ///
    /// scratch 会被 resize 到输出长度（扩宽时为输入 × 2），
    /// 调用方复用同一个 Vec 时稳态下不分配
    pub fn convert(&self, input: &[u8], scratch: &mut Vec<u8>) -> usize {
        let len = input.len() - input.len() % self.src.bytes_per_sample();
        let input = &input[..len];
        scratch.clear();

        if self.widens() {
            scratch.resize(len * 2, 0);
            widen_into(input, scratch);
            for &step in &self.after {
                apply(step, scratch);
            }
            return scratch.len();
        }

        scratch.extend_from_slice(input);
        match self.convert_in_place(scratch) {
            Ok(n) => {
                scratch.truncate(n);
                n
            }
            Err(_) => 0,
        }
    }
}

/// 等长变换
#[inline]
fn apply(step: Step, buf: &mut [u8]) {
    match step {
        Step::SwapBytes => {
            for word in buf.chunks_exact_mut(2) {
                word.swap(0, 1);
            }
        }
        Step::FlipSign16 { order } => {
            // 符号位在高位字节
            let msb = if order.resolve() == Endianness::Big { 0 } else { 1 };
            for word in buf.chunks_exact_mut(2) {
                word[msb] ^= 0x80;
            }
        }
        Step::FlipSign8 => {
            for b in buf.iter_mut() {
                *b ^= 0x80;
            }
        }
    }
}

/// 主机字节序 16-bit → 8-bit（取高字节），写指针永远不超过读指针
fn narrow_in_place(buf: &mut [u8]) -> usize {
    let samples = buf.len() / 2;
    for i in 0..samples {
        let word = u16::from_ne_bytes([buf[2 * i], buf[2 * i + 1]]);
        buf[i] = (word >> 8) as u8;
    }
    samples
}

/// 8-bit → 主机字节序 16-bit（移入高字节，低字节补零）
fn widen_into(input: &[u8], output: &mut [u8]) {
    for (&b, word) in input.iter().zip(output.chunks_exact_mut(2)) {
        let value = (b as u16) << 8;
        word.copy_from_slice(&value.to_ne_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::{ChannelLayout, Signedness};
    use rand::Rng;

    const ALL_ENCODINGS: [(u16, Signedness, Endianness); 6] = [
        (8, Signedness::Unsigned, Endianness::Native),
        (8, Signedness::Signed, Endianness::Native),
        (16, Signedness::Signed, Endianness::Little),
        (16, Signedness::Signed, Endianness::Big),
        (16, Signedness::Unsigned, Endianness::Little),
        (16, Signedness::Unsigned, Endianness::Big),
    ];

    fn fmt(bits: u16, sign: Signedness, order: Endianness) -> SampleFormat {
        SampleFormat::new(bits, sign, order, 2).unwrap()
    }

    fn run(conv: &Option<Conversion>, input: &[u8]) -> Vec<u8> {
        match conv {
            Some(c) => {
                let mut out = Vec::new();
                let n = c.convert(input, &mut out);
                assert_eq!(n, out.len());
                out
            }
            None => input.to_vec(),
        }
    }

    #[test]
    fn test_identical_is_none() {
        let f = SampleFormat::s16_native(ChannelLayout::Stereo);
        assert!(select(f, f).unwrap().is_none());
        let concrete = f.with_encoding(Signedness::Signed, Endianness::Native.resolve());
        assert!(select(f, concrete).unwrap().is_none());
    }

    #[test]
    fn test_channel_mismatch() {
        let a = SampleFormat::s16_native(ChannelLayout::Stereo);
        let b = SampleFormat::s16_native(ChannelLayout::Mono);
        assert!(matches!(select(a, b), Err(ConvertError::ChannelMismatch { .. })));
    }

    #[test]
    fn test_endian_swap() {
        let conv = select(
            fmt(16, Signedness::Signed, Endianness::Little),
            fmt(16, Signedness::Signed, Endianness::Big),
        )
        .unwrap();
        assert_eq!(run(&conv, &[0x34, 0x12, 0xCD, 0xAB]), vec![0x12, 0x34, 0xAB, 0xCD]);
    }

    #[test]
    fn test_sign_flip_16() {
        let conv = select(
            fmt(16, Signedness::Signed, Endianness::Big),
            fmt(16, Signedness::Unsigned, Endianness::Big),
        )
        .unwrap();
        // 0 → 0x8000, -32768 → 0
        assert_eq!(run(&conv, &[0x00, 0x00, 0x80, 0x00]), vec![0x80, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_swap_and_sign() {
        // S16_LE 0x1234 → U16_BE (0x1234 ^ 0x8000) = 0x9234
        let conv = select(
            fmt(16, Signedness::Signed, Endianness::Little),
            fmt(16, Signedness::Unsigned, Endianness::Big),
        )
        .unwrap();
        assert_eq!(run(&conv, &[0x34, 0x12]), vec![0x92, 0x34]);
    }

    #[test]
    fn test_u8_to_s16_native() {
        let src = SampleFormat::u8(ChannelLayout::Mono);
        let dst = SampleFormat::s16_native(ChannelLayout::Mono);
        let conv = select(src, dst).unwrap().unwrap();
        assert!(conv.widens());

        let mut out = Vec::new();
        assert_eq!(conv.convert(&[0, 128, 255], &mut out), 6);
        let samples: Vec<i16> = out
            .chunks_exact(2)
            .map(|w| i16::from_ne_bytes([w[0], w[1]]))
            .collect();
        assert_eq!(samples, vec![-32768, 0, 32512]);
    }

    #[test]
    fn test_narrow_in_place() {
        let src = SampleFormat::s16_le(ChannelLayout::Mono);
        let dst = SampleFormat::u8(ChannelLayout::Mono);
        let conv = select(src, dst).unwrap().unwrap();

        // -32768, 0, 32512 (LE)
        let mut buf = [0x00, 0x80, 0x00, 0x00, 0x00, 0x7F];
        let n = conv.convert_in_place(&mut buf).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf[..n], &[0, 128, 255]);
    }

    #[test]
    fn test_widen_refuses_in_place() {
        let conv = select(
            SampleFormat::u8(ChannelLayout::Mono),
            SampleFormat::s16_native(ChannelLayout::Mono),
        )
        .unwrap()
        .unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(
            conv.convert_in_place(&mut buf),
            Err(ConvertError::InPlaceWidening { .. })
        ));
    }

    #[test]
    fn test_partial_sample_dropped() {
        let conv = select(
            fmt(16, Signedness::Signed, Endianness::Little),
            fmt(16, Signedness::Signed, Endianness::Big),
        )
        .unwrap()
        .unwrap();
        let mut out = Vec::new();
        assert_eq!(conv.convert(&[1, 2, 3], &mut out), 2);
        assert_eq!(conv.output_len(3), 2);
    }

    /// 所有格式对：src → dst → src 逐字节还原
    ///
    /// 8-bit 只能表达 16-bit 的高字节，所以 16 → 8 → 16 的输入取自扩宽后的值
    #[test]
    fn test_roundtrip_all_pairs() {
        let mut rng = rand::thread_rng();

        for &(sb, ss, se) in &ALL_ENCODINGS {
            for &(db, ds, de) in &ALL_ENCODINGS {
                let src = fmt(sb, ss, se);
                let dst = fmt(db, ds, de);

                let input: Vec<u8> = if sb == 16 && db == 8 {
                    // 低字节（按 src 字节序）为零
                    (0..256)
                        .flat_map(|_| se.write_u16((rng.gen::<u8>() as u16) << 8))
                        .collect()
                } else {
                    (0..512).map(|_| rng.gen()).collect()
                };

                let forward = select(src, dst).unwrap();
                let back = select(dst, src).unwrap();
                let there = run(&forward, &input);
                let again = run(&back, &there);
                assert_eq!(again, input, "roundtrip failed for {} <-> {}", src, dst);
            }
        }
    }

    /// 转换保持样本数值语义（符号 + 位深），与字节序无关
    #[test]
    fn test_value_semantics() {
        let value: i16 = -1234;
        let s16le = value.to_le_bytes();

        let conv = select(
            fmt(16, Signedness::Signed, Endianness::Little),
            fmt(16, Signedness::Unsigned, Endianness::Big),
        )
        .unwrap();
        let out = run(&conv, &s16le);
        let unsigned = u16::from_be_bytes([out[0], out[1]]);
        assert_eq!(unsigned as i32 - 32768, value as i32);
    }
}
