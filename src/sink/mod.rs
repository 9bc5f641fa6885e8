//! 设备（消费者端）抽象
//!
//! 真正发声的后端对管线来说是一个不透明的 sink。
//! 只有消费者端（设备线程或回调）会调用它，生产者从不直接接触设备。
//!
//! 变体：
//! - NullSink: 按墙钟速度消耗数据的虚拟设备（模拟硬件缓冲区）
//! - WavSink: 磁盘写出，把流渲染成 WAV 文件

mod null;
mod wav;

pub use null::NullSink;
pub use wav::WavSink;

use thiserror::Error;

use crate::audio::StreamSpec;

/// 设备错误
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("device refused {spec}: {reason}")]
    Refused { spec: StreamSpec, reason: String },
    #[error("device I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("WAV writer failed: {0}")]
    Wav(#[from] hound::Error),
    #[error("device is not open")]
    NotOpen,
}

/// 设备能力集
pub trait AudioSink: Send {
    /// 设备名称（日志用）
    fn name(&self) -> &str;

    /// 协商设备原生格式
    ///
    /// 返回设备实际会以什么格式/采样率打开。
    /// 声道数必须保持不变，管线不做声道混合。
    fn native_format(&self, requested: &StreamSpec) -> StreamSpec;

    /// 以协商后的格式打开
    fn open(&mut self, spec: &StreamSpec) -> Result<(), SinkError>;

    /// 交付数据，返回设备实际接受的字节数（可能少于交付的字节）
    fn write(&mut self, data: &[u8]) -> usize;

    /// 设备当前还能接受多少字节
    fn free_bytes(&self) -> usize;

    /// 已交给设备但尚未发声的字节数
    fn resident_bytes(&self) -> usize;

    /// 设备是否仍在发声
    fn is_rendering(&self) -> bool;

    fn pause(&mut self, paused: bool);

    /// 丢弃已排队但尚未发声的数据（seek 后调用）
    fn discard(&mut self);

    fn close(&mut self);
}
