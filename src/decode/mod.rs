//! 解码（生产者端）抽象
//!
//! 输出管线只关心 PCM 字节流和它的格式：
//! - FileSource: symphonia 解码音频文件，输出交错的 S16 主机字节序
//! - ToneSource: 正弦波发生器，可输出任意 SampleFormat（诊断和测试用）

mod decoder;
mod tone;

pub use decoder::{AudioInfo, FileSource};
pub use tone::ToneSource;

use thiserror::Error;

use crate::audio::{FormatError, StreamSpec};

/// 解码错误
#[derive(Debug, Error)]
pub enum DecodeError {
    /// 文件打开失败
    #[error("failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),
    /// 格式不支持
    #[error("unsupported audio format")]
    UnsupportedFormat,
    /// 没有找到音频轨道
    #[error("no audio track found")]
    NoAudioTrack,
    /// 输出管线不支持的声道数 / 采样率
    #[error("unsupported stream layout: {0}")]
    Layout(#[from] FormatError),
    /// 解码器创建失败
    #[error("failed to create decoder: {0}")]
    DecoderCreation(String),
    /// 解码失败
    #[error("decode failed: {0}")]
    DecodeFailed(String),
    /// Seek 失败
    #[error("seek failed: {0}")]
    SeekFailed(String),
}

/// PCM 源能力集
pub trait PcmSource: Send {
    /// 输出格式（打开后不变）
    fn spec(&self) -> StreamSpec;

    /// 解码下一块，追加到 `out`
    ///
    /// 返回追加的字节数（整帧），0 表示结束
    fn read(&mut self, out: &mut Vec<u8>) -> Result<usize, DecodeError>;

    /// 跳到指定位置，返回实际位置（毫秒）
    fn seek(&mut self, position_ms: u64) -> Result<u64, DecodeError>;

    /// 总时长（已知时）
    fn duration_ms(&self) -> Option<u64>;
}
