//! 音频格式描述
//!
//! - SampleFormat: 一路 PCM 流的样本编码（位深、符号、字节序、声道）
//! - StreamSpec: SampleFormat + 采样率，用于字节 ↔ 时间换算
//!
//! 流打开后格式不可变。8-bit 样本没有字节序，统一归一化为 Native。

use thiserror::Error;

/// 格式构造错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("unsupported sample width: {0} bits (expected 8 or 16)")]
    UnsupportedBits(u16),
    #[error("unsupported channel count: {0} (expected 1 or 2)")]
    UnsupportedChannels(u16),
    #[error("sample rate must be non-zero")]
    ZeroRate,
}

/// 样本位深
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleWidth {
    Bits8,
    Bits16,
}

impl SampleWidth {
    pub fn from_bits(bits: u16) -> Result<Self, FormatError> {
        match bits {
            8 => Ok(Self::Bits8),
            16 => Ok(Self::Bits16),
            other => Err(FormatError::UnsupportedBits(other)),
        }
    }

    #[inline]
    pub fn bits(self) -> u16 {
        match self {
            Self::Bits8 => 8,
            Self::Bits16 => 16,
        }
    }

    #[inline]
    pub fn bytes(self) -> usize {
        self.bits() as usize / 8
    }
}

/// 符号
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Signedness {
    Signed,
    Unsigned,
}

/// 字节序
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Endianness {
    Little,
    Big,
    /// 主机字节序，比较前会被解析为 Little/Big
    Native,
}

impl Endianness {
    /// 解析为具体字节序
    #[inline]
    pub fn resolve(self) -> Self {
        match self {
            Self::Native => {
                if cfg!(target_endian = "big") {
                    Self::Big
                } else {
                    Self::Little
                }
            }
            other => other,
        }
    }

    #[inline]
    pub fn is_native(self) -> bool {
        self.resolve() == Self::Native.resolve()
    }

    /// 按此字节序解码一个 16-bit 字
    #[inline]
    pub fn read_u16(self, bytes: [u8; 2]) -> u16 {
        match self.resolve() {
            Self::Big => u16::from_be_bytes(bytes),
            _ => u16::from_le_bytes(bytes),
        }
    }

    /// 按此字节序编码一个 16-bit 字
    #[inline]
    pub fn write_u16(self, value: u16) -> [u8; 2] {
        match self.resolve() {
            Self::Big => value.to_be_bytes(),
            _ => value.to_le_bytes(),
        }
    }
}

/// 声道布局（只支持单声道/立体声）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelLayout {
    Mono,
    Stereo,
}

impl ChannelLayout {
    pub fn from_count(channels: u16) -> Result<Self, FormatError> {
        match channels {
            1 => Ok(Self::Mono),
            2 => Ok(Self::Stereo),
            other => Err(FormatError::UnsupportedChannels(other)),
        }
    }

    #[inline]
    pub fn count(self) -> usize {
        match self {
            Self::Mono => 1,
            Self::Stereo => 2,
        }
    }
}

/// PCM 样本格式
///
/// 两个格式兼容（无需转换）当且仅当归一化后四个字段全部相同。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SampleFormat {
    pub width: SampleWidth,
    pub signedness: Signedness,
    pub endianness: Endianness,
    pub channels: ChannelLayout,
}

impl SampleFormat {
    /// 从原始参数构造（位深 8/16，声道 1/2）
    pub fn new(
        bits_per_sample: u16,
        signedness: Signedness,
        endianness: Endianness,
        channels: u16,
    ) -> Result<Self, FormatError> {
        Ok(Self {
            width: SampleWidth::from_bits(bits_per_sample)?,
            signedness,
            endianness,
            channels: ChannelLayout::from_count(channels)?,
        })
    }

    /// 有符号 16-bit 主机字节序（解码器最常见的输出）
    pub fn s16_native(channels: ChannelLayout) -> Self {
        Self {
            width: SampleWidth::Bits16,
            signedness: Signedness::Signed,
            endianness: Endianness::Native,
            channels,
        }
    }

    pub fn s16_le(channels: ChannelLayout) -> Self {
        Self {
            endianness: Endianness::Little,
            ..Self::s16_native(channels)
        }
    }

    pub fn u8(channels: ChannelLayout) -> Self {
        Self {
            width: SampleWidth::Bits8,
            signedness: Signedness::Unsigned,
            endianness: Endianness::Native,
            channels,
        }
    }

    pub fn s8(channels: ChannelLayout) -> Self {
        Self {
            signedness: Signedness::Signed,
            ..Self::u8(channels)
        }
    }

    /// 同位深、同声道，换符号/字节序
    pub fn with_encoding(self, signedness: Signedness, endianness: Endianness) -> Self {
        Self {
            signedness,
            endianness,
            ..self
        }
    }

    pub fn with_width(self, width: SampleWidth) -> Self {
        Self { width, ..self }
    }

    /// 归一化：Native 解析为具体字节序，8-bit 字节序统一为 Native
    pub fn normalized(self) -> Self {
        let endianness = match self.width {
            SampleWidth::Bits8 => Endianness::Native,
            SampleWidth::Bits16 => self.endianness.resolve(),
        };
        Self { endianness, ..self }
    }

    /// 是否无需转换
    #[inline]
    pub fn is_compatible(&self, other: &SampleFormat) -> bool {
        self.normalized() == other.normalized()
    }

    #[inline]
    pub fn is_signed(&self) -> bool {
        self.signedness == Signedness::Signed
    }

    #[inline]
    pub fn bytes_per_sample(&self) -> usize {
        self.width.bytes()
    }

    /// 每帧的字节数
    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.width.bytes() * self.channels.count()
    }
}

impl std::fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = match self.signedness {
            Signedness::Signed => "S",
            Signedness::Unsigned => "U",
        };
        let order = match (self.width, self.endianness) {
            (SampleWidth::Bits8, _) => "",
            (_, Endianness::Little) => "_LE",
            (_, Endianness::Big) => "_BE",
            (_, Endianness::Native) => "_NE",
        };
        write!(
            f,
            "{}{}{} {}ch",
            sign,
            self.width.bits(),
            order,
            self.channels.count()
        )
    }
}

/// 流规格：样本格式 + 采样率
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamSpec {
    pub format: SampleFormat,
    pub rate: u32,
}

impl StreamSpec {
    pub fn new(format: SampleFormat, rate: u32) -> Result<Self, FormatError> {
        if rate == 0 {
            return Err(FormatError::ZeroRate);
        }
        Ok(Self { format, rate })
    }

    /// 每秒字节数
    #[inline]
    pub fn bytes_per_second(&self) -> u32 {
        self.rate * self.format.bytes_per_frame() as u32
    }

    /// 毫秒 → 字节数（向下对齐到整帧）
    pub fn ms_to_bytes(&self, ms: u64) -> usize {
        let frames = ms * self.rate as u64 / 1000;
        frames as usize * self.format.bytes_per_frame()
    }

    /// 字节数 → 毫秒
    #[inline]
    pub fn bytes_to_ms(&self, bytes: u64) -> i64 {
        (bytes * 1000 / self.bytes_per_second() as u64) as i64
    }
}

impl std::fmt::Display for StreamSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} @ {}Hz", self.format, self.rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_resolves() {
        let native = Endianness::Native.resolve();
        assert_ne!(native, Endianness::Native);
        assert!(native.is_native());
        assert!(Endianness::Native.is_native());
    }

    #[test]
    fn test_compatible_after_normalization() {
        let ne = SampleFormat::s16_native(ChannelLayout::Stereo);
        let concrete = ne.with_encoding(Signedness::Signed, Endianness::Native.resolve());
        assert!(ne.is_compatible(&concrete));

        // 8-bit 字节序无意义
        let a = SampleFormat::u8(ChannelLayout::Mono).with_encoding(Signedness::Unsigned, Endianness::Big);
        let b = SampleFormat::u8(ChannelLayout::Mono);
        assert!(a.is_compatible(&b));

        let s16le = SampleFormat::s16_le(ChannelLayout::Stereo);
        let s16be = s16le.with_encoding(Signedness::Signed, Endianness::Big);
        assert!(!s16le.is_compatible(&s16be));
    }

    #[test]
    fn test_new_rejects_invalid() {
        assert_eq!(
            SampleFormat::new(24, Signedness::Signed, Endianness::Little, 2),
            Err(FormatError::UnsupportedBits(24))
        );
        assert_eq!(
            SampleFormat::new(16, Signedness::Signed, Endianness::Little, 6),
            Err(FormatError::UnsupportedChannels(6))
        );
        assert!(StreamSpec::new(SampleFormat::u8(ChannelLayout::Mono), 0).is_err());
    }

    #[test]
    fn test_byte_rates() {
        let spec = StreamSpec::new(SampleFormat::s16_native(ChannelLayout::Stereo), 44100).unwrap();
        assert_eq!(spec.format.bytes_per_frame(), 4);
        assert_eq!(spec.bytes_per_second(), 176_400);
        assert_eq!(spec.bytes_to_ms(176_400), 1000);
        assert_eq!(spec.ms_to_bytes(1000), 176_400);
        // 帧对齐
        assert_eq!(spec.ms_to_bytes(1) % 4, 0);

        let mono8 = StreamSpec::new(SampleFormat::u8(ChannelLayout::Mono), 8000).unwrap();
        assert_eq!(mono8.bytes_per_second(), 8000);
    }

    #[test]
    fn test_u16_codec() {
        assert_eq!(Endianness::Big.read_u16([0x12, 0x34]), 0x1234);
        assert_eq!(Endianness::Little.read_u16([0x12, 0x34]), 0x3412);
        assert_eq!(Endianness::Big.write_u16(0x1234), [0x12, 0x34]);
    }

    #[test]
    fn test_display() {
        assert_eq!(SampleFormat::s16_le(ChannelLayout::Stereo).to_string(), "S16_LE 2ch");
        assert_eq!(SampleFormat::u8(ChannelLayout::Mono).to_string(), "U8 1ch");
    }
}
