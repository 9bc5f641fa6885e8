//! 音频核心模块
//!
//! 包含：
//! - Format: PCM 样本格式和流规格
//! - Convert: 格式转换矩阵（位深、符号、字节序）
//! - Ring Buffer: SPSC 字节传递
//! - Clock: 字节数 → 播放位置
//! - Prebuffer: 预缓冲状态机
//! - Stats: 播放统计
//! - Output: 输出管线编排

pub mod clock;
pub mod convert;
pub mod format;
pub mod output;
pub mod prebuffer;
pub mod ring_buffer;
pub mod stats;

pub use clock::ClockAccountant;
pub use convert::{Conversion, ConvertError};
pub use format::{
    ChannelLayout, Endianness, FormatError, SampleFormat, SampleWidth, Signedness, StreamSpec,
};
pub use output::{
    CloseMode, ConfigError, DeviceHandle, OpenError, OutputConfig, OutputPipeline,
    PipelineState, StreamMonitor,
};
pub use prebuffer::{PrebufferController, PrebufferState};
pub use ring_buffer::{RingBuffer, RingBufferError};
pub use stats::{PlaybackStats, StatsReport};
