//! 实时输出管线
//!
//! 解码线程（生产者）→ 格式转换 / 重采样 → Ring Buffer → 设备（消费者）
//!
//! 状态：Closed → Open(Prebuffering | Playing) ⇄ Paused → Closed
//!
//! 线程模型：
//! - 生产者持有 `OutputPipeline`，调用 open / write / flush / pause / close
//! - 消费者持有 `DeviceHandle`（设备 sink 的唯一所有者），调用 `step`
//!   可以是管线自己启动的设备线程，也可以由外部回调驱动 `step_device`
//! - 生产者从不直接调用设备：暂停、丢弃等请求通过原子标志交给消费者执行，
//!   消费者把设备驻留字节数发布回共享状态供时钟使用

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

use super::clock::ClockAccountant;
use super::convert::{self, Conversion, ConvertError};
use super::format::{FormatError, SampleFormat, StreamSpec};
use super::prebuffer::{PrebufferController, PrebufferState};
use super::ring_buffer::{RingBuffer, RingBufferError};
use super::stats::{PlaybackStats, StatsReport};
use crate::resample::{LinearResampler, Resampler, SampleScratch};
use crate::sink::{AudioSink, SinkError};

/// 输出配置
#[derive(Clone, Debug)]
pub struct OutputConfig {
    /// Ring Buffer 时长（毫秒，按设备字节率计算）
    pub buffer_ms: u32,
    /// Ring Buffer 最小字节数（低码率流也能有可用的缓冲）
    pub min_buffer_bytes: usize,
    /// 预缓冲阈值（占可用容量的百分比）
    pub prebuffer_percent: u8,
    /// 设备仍在发声时跳过预缓冲（连续播放切歌不停顿）
    pub force_start_when_rendering: bool,
    /// 固定设备采样率（None 表示跟随源）
    pub device_rate: Option<u32>,
    /// 用户变速
    pub pitch: f64,
    /// 软件音量
    pub left_gain: f32,
    pub right_gain: f32,
    /// 是否 mlock Ring Buffer
    pub lock_memory: bool,
    /// 设为 Some 时管线自己启动设备线程，按此间隔步进；
    /// None 表示由外部线程/回调调用 `step_device`
    pub device_thread: Option<Duration>,
    /// 排空最长等待时间（close(Drain)，以及引擎在 EOF 之后）
    pub drain_timeout: Duration,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            buffer_ms: 2000,
            min_buffer_bytes: 16384,
            prebuffer_percent: 25,
            force_start_when_rendering: true,
            device_rate: None,
            pitch: 1.0,
            left_gain: 1.0,
            right_gain: 1.0,
            lock_memory: false,
            device_thread: Some(Duration::from_millis(10)),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// 软件音量上限（200%）
const MAX_GAIN: f32 = 2.0;

/// 变速范围
const PITCH_RANGE: std::ops::RangeInclusive<f64> = 0.25..=4.0;

/// 配置错误
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("unknown output option '{0}'")]
    UnknownKey(String),
    #[error("invalid value '{value}' for output option '{key}'")]
    InvalidValue { key: String, value: String },
    #[error("{key} = {value} is out of range")]
    OutOfRange { key: &'static str, value: f64 },
}

impl OutputConfig {
    /// 应用一条持久化的 key/value 配置
    ///
    /// 音量以百分比给出（0..=200），其余按字面数值
    /// 失败时配置保持不变
    pub fn apply_kv(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        let value = value.trim();
        let mut next = self.clone();

        match key.trim() {
            "buffer_ms" => next.buffer_ms = value.parse().map_err(|_| invalid())?,
            "prebuffer_percent" => {
                let percent: u8 = value.parse().map_err(|_| invalid())?;
                if percent > 100 {
                    return Err(ConfigError::OutOfRange {
                        key: "prebuffer_percent",
                        value: percent as f64,
                    });
                }
                next.prebuffer_percent = percent;
            }
            "pitch" => next.pitch = value.parse().map_err(|_| invalid())?,
            "volume_left" => {
                let percent: f32 = value.parse().map_err(|_| invalid())?;
                next.left_gain = percent / 100.0;
            }
            "volume_right" => {
                let percent: f32 = value.parse().map_err(|_| invalid())?;
                next.right_gain = percent / 100.0;
            }
            "device_rate" => {
                next.device_rate = match value {
                    "" | "auto" | "0" => None,
                    rate => Some(rate.parse().map_err(|_| invalid())?),
                }
            }
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }

        next.validate()?;
        *self = next;
        Ok(())
    }

    /// 检查数值范围
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !PITCH_RANGE.contains(&self.pitch) {
            return Err(ConfigError::OutOfRange {
                key: "pitch",
                value: self.pitch,
            });
        }
        for (key, gain) in [("volume_left", self.left_gain), ("volume_right", self.right_gain)] {
            if !(0.0..=MAX_GAIN).contains(&gain) {
                return Err(ConfigError::OutOfRange {
                    key,
                    value: gain as f64 * 100.0,
                });
            }
        }
        if self.prebuffer_percent > 100 {
            return Err(ConfigError::OutOfRange {
                key: "prebuffer_percent",
                value: self.prebuffer_percent as f64,
            });
        }
        Ok(())
    }
}

/// 打开流失败
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("output stream is already open")]
    AlreadyOpen,
    #[error("no output device available")]
    NoDevice,
    #[error("invalid stream format: {0}")]
    Format(#[from] FormatError),
    #[error("invalid output configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("device offers {device} for a {stream} stream: channel count must match")]
    ChannelMismatch {
        stream: SampleFormat,
        device: SampleFormat,
    },
    #[error("no conversion available: {0}")]
    Conversion(#[from] ConvertError),
    #[error("device refused the stream: {0}")]
    Device(#[from] SinkError),
    #[error("ring buffer: {0}")]
    Buffer(#[from] RingBufferError),
    #[error("failed to spawn device thread: {0}")]
    Thread(std::io::Error),
}

/// 关闭方式（必须显式指定）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// 自然结束：播完缓冲区里剩余的音频
    Drain,
    /// 用户停止：立即丢弃
    Discard,
}

/// 管线对外可见的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Closed,
    Prebuffering,
    Playing,
    Paused,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Prebuffering => "prebuffering",
            Self::Playing => "playing",
            Self::Paused => "paused",
        };
        f.write_str(name)
    }
}

/// 生产者和消费者共享的状态
///
/// 流打开时创建，关闭时随最后一个 Arc 释放
struct Shared {
    ring: RingBuffer,
    clock: ClockAccountant,
    prebuffer: PrebufferController,
    stats: PlaybackStats,

    // 消费者发布
    device_resident: AtomicUsize,
    device_rendering: AtomicBool,

    // 生产者请求，消费者执行
    pause_requested: AtomicBool,
    discard_requested: AtomicBool,
    draining: AtomicBool,

    running: AtomicBool,
}

impl Shared {
    fn output_time_ms(&self) -> i64 {
        self.clock
            .output_time_ms(self.device_resident.load(Ordering::Acquire))
    }

    fn state(&self) -> PipelineState {
        if self.pause_requested.load(Ordering::Acquire) {
            return PipelineState::Paused;
        }
        match self.prebuffer.state() {
            PrebufferState::Prebuffering => PipelineState::Prebuffering,
            PrebufferState::Playing => PipelineState::Playing,
        }
    }

    /// 缓冲区或设备里是否还有没播完的音频
    fn has_pending_audio(&self) -> bool {
        self.ring.used_bytes() > 0
            || self.device_resident.load(Ordering::Acquire) > 0
            || self.device_rendering.load(Ordering::Acquire)
    }
}

/// 设备端（消费者）
///
/// 持有设备 sink，每次 `step` 从 Ring Buffer 取出设备此刻能接受的数据交给设备。
/// 只有持有者能调用设备。
pub struct DeviceHandle {
    shared: Arc<Shared>,
    sink: Box<dyn AudioSink>,
    /// 单次最多交付的字节
    scratch: Vec<u8>,
    /// 设备短写剩下的字节，下次优先交付
    carry: Vec<u8>,
    frame_bytes: usize,
    paused: bool,
    in_underrun: bool,
}

impl DeviceHandle {
    /// 消费者步进，返回本次交给设备的字节数
    ///
    /// 暂停或预缓冲期间是无副作用的 no-op，可以随时调用
    pub fn step(&mut self) -> usize {
        let shared = Arc::clone(&self.shared);
        shared.stats.on_step(shared.ring.used_bytes());

        if shared.discard_requested.swap(false, Ordering::AcqRel) {
            self.carry.clear();
            self.sink.discard();
            log::debug!("Device queue discarded");
        }

        let want_pause = shared.pause_requested.load(Ordering::Acquire);
        if want_pause != self.paused {
            self.sink.pause(want_pause);
            self.paused = want_pause;
            log::info!("Output {}", if want_pause { "paused" } else { "resumed" });
        }
        if self.paused {
            self.publish();
            return 0;
        }

        let rendering = self.sink.is_rendering();
        if shared.prebuffer.evaluate(shared.ring.used_bytes(), rendering)
            == PrebufferState::Prebuffering
        {
            self.publish();
            return 0;
        }

        let mut handed = 0;
        if !self.carry.is_empty() {
            let accepted = self.sink.write(&self.carry);
            self.carry.drain(..accepted);
            shared.stats.add_bytes_played(accepted);
            handed += accepted;
            if !self.carry.is_empty() {
                self.publish();
                return handed;
            }
        }

        let room = self.sink.free_bytes().min(self.scratch.len());
        let room = room - room % self.frame_bytes;
        if room == 0 {
            self.publish();
            return handed;
        }

        let clock = &shared.clock;
        let n = shared
            .ring
            .read_then(&mut self.scratch[..room], |n| clock.record_consumed(n));

        if n == 0 {
            if !rendering && !self.in_underrun && !shared.draining.load(Ordering::Acquire) {
                self.in_underrun = true;
                shared.stats.record_underrun();
                log::warn!("Output underrun: ring buffer empty and device idle");
            }
            self.publish();
            return handed;
        }
        self.in_underrun = false;

        let accepted = self.sink.write(&self.scratch[..n]);
        if accepted < n {
            shared.stats.record_short_write();
            log::debug!("Short device write: {} of {} bytes", accepted, n);
            self.carry.extend_from_slice(&self.scratch[accepted..n]);
        }
        shared.stats.add_bytes_played(accepted);
        handed += accepted;

        self.publish();
        handed
    }

    /// 把设备驻留状态发布给生产者 / UI
    fn publish(&self) {
        let resident = self.sink.resident_bytes() + self.carry.len();
        let rendering = self.sink.is_rendering() || !self.carry.is_empty();
        self.shared.device_resident.store(resident, Ordering::Release);
        self.shared.device_rendering.store(rendering, Ordering::Release);
    }

    /// 设备线程主循环
    fn run(mut self, interval: Duration) -> Self {
        log::debug!("Device thread started ({} ms interval)", interval.as_millis());
        while self.shared.running.load(Ordering::Acquire) {
            self.step();
            thread::sleep(interval);
        }
        log::debug!("Device thread finished");
        self
    }

    fn into_sink(self) -> Box<dyn AudioSink> {
        self.sink
    }
}

/// 只读监视句柄（UI 线程轮询用）
#[derive(Clone)]
pub struct StreamMonitor {
    shared: Arc<Shared>,
}

impl StreamMonitor {
    pub fn output_time_ms(&self) -> i64 {
        self.shared.output_time_ms()
    }

    pub fn written_time_ms(&self) -> i64 {
        self.shared.clock.written_time_ms()
    }

    pub fn state(&self) -> PipelineState {
        if self.shared.running.load(Ordering::Acquire) {
            self.shared.state()
        } else {
            PipelineState::Closed
        }
    }

    pub fn fill_ratio(&self) -> f64 {
        self.shared.ring.fill_ratio()
    }

    pub fn underrun_count(&self) -> u64 {
        self.shared.stats.underrun_count()
    }
}

/// 消费者的两种驱动方式
enum Consumer {
    Manual(DeviceHandle),
    Thread(JoinHandle<DeviceHandle>),
}

/// 一条打开的流
struct Stream {
    source: StreamSpec,
    device: StreamSpec,
    shared: Arc<Shared>,

    /// 源 → 设备（不重采样时）
    direct: Option<Conversion>,
    /// 源 → S16 主机字节序（重采样前）
    to_s16: Option<Conversion>,
    /// S16 主机字节序 → 设备（重采样后）
    from_s16: Option<Conversion>,
    resampler: LinearResampler,
    /// 设备侧每秒字节（不含用户变速）
    device_bps: f64,

    // 生产者侧缓冲，稳态下不分配
    stage: Vec<u8>,
    scratch: SampleScratch,
    resampled: Vec<u8>,
    out: Vec<u8>,
    /// 已转换但 Ring Buffer 暂时放不下的设备字节
    backlog: Vec<u8>,

    consumer: Consumer,
}

impl Stream {
    /// 重采样是否生效
    fn resampling(&self) -> bool {
        !self.resampler.is_identity() || self.resampler.pending_frames() > 0
    }

    /// 给定设备字节空间，最多能接受多少源帧
    fn source_frames_for(&self, device_bytes: usize) -> usize {
        let device_frames = device_bytes / self.device.format.bytes_per_frame();
        if self.resampling() {
            // 每个源帧约产生 1/ratio 个设备帧，留一帧余量
            let frames = (device_frames as f64 * self.resampler.ratio()).floor() as usize;
            frames.saturating_sub(1)
        } else {
            device_frames
        }
    }

    /// 源字节 → 设备字节，结果在 self.out
    fn transform(&mut self, input: &[u8]) {
        self.out.clear();

        if !self.resampling() {
            match &self.direct {
                Some(conversion) => {
                    conversion.convert(input, &mut self.out);
                }
                None => self.out.extend_from_slice(input),
            }
            return;
        }

        let s16: &[u8] = match &self.to_s16 {
            Some(conversion) => {
                conversion.convert(input, &mut self.stage);
                &self.stage
            }
            None => input,
        };
        self.resampled.clear();
        self.resampler
            .process_bytes(s16, &mut self.scratch, &mut self.resampled);

        match &self.from_s16 {
            Some(conversion) => {
                conversion.convert(&self.resampled, &mut self.out);
            }
            None => self.out.extend_from_slice(&self.resampled),
        }
    }

    /// 把 backlog 推入 Ring Buffer，返回是否已清空
    fn push_backlog(&mut self) -> bool {
        if self.backlog.is_empty() {
            return true;
        }
        let written = self.push_aligned_from_backlog();
        self.backlog.drain(..written);
        self.backlog.is_empty()
    }

    fn push_aligned_from_backlog(&self) -> usize {
        let free = self.shared.ring.free_bytes();
        let fit = free - free % self.device.format.bytes_per_frame();
        self.shared
            .ring
            .write(&self.backlog[..fit.min(self.backlog.len())])
    }

    /// 排空一步，返回是否已播完
    fn drain_step(&mut self) -> bool {
        // 短于预缓冲阈值的流也要播出来
        self.shared.prebuffer.force_start();
        self.shared.draining.store(true, Ordering::Release);

        self.push_backlog();
        if let Consumer::Manual(handle) = &mut self.consumer {
            handle.step();
        }
        self.backlog.is_empty() && !self.shared.has_pending_audio()
    }

    /// 写 self.out 到 Ring Buffer，放不下的进 backlog
    fn push_out(&mut self) {
        let free = self.shared.ring.free_bytes();
        let fit = (free - free % self.device.format.bytes_per_frame()).min(self.out.len());
        let written = self.shared.ring.write(&self.out[..fit]);
        if written < self.out.len() {
            self.backlog.extend_from_slice(&self.out[written..]);
        }
    }

    /// 让设备线程退出并取回设备
    fn stop_consumer(self) -> Option<DeviceHandle> {
        self.shared.running.store(false, Ordering::Release);
        match self.consumer {
            Consumer::Manual(handle) => Some(handle),
            Consumer::Thread(join) => match join.join() {
                Ok(handle) => Some(handle),
                Err(_) => {
                    log::error!("Device thread panicked; output device lost");
                    None
                }
            },
        }
    }
}

/// 输出管线
pub struct OutputPipeline {
    config: OutputConfig,
    sink: Option<Box<dyn AudioSink>>,
    stream: Option<Stream>,
}

impl OutputPipeline {
    pub fn new(config: OutputConfig, sink: Box<dyn AudioSink>) -> Self {
        Self {
            config,
            sink: Some(sink),
            stream: None,
        }
    }

    pub fn config(&self) -> &OutputConfig {
        &self.config
    }

    /// 打开流
    ///
    /// 协商设备格式、选择转换、分配 Ring Buffer、重置时钟和预缓冲。
    /// 设备拒绝格式或内存不足时返回错误，此后不得调用 write / step_device。
    pub fn open(&mut self, format: SampleFormat, rate: u32) -> Result<(), OpenError> {
        if self.stream.is_some() {
            return Err(OpenError::AlreadyOpen);
        }
        self.config.validate()?;
        let source = StreamSpec::new(format, rate)?;
        let mut sink = self.sink.take().ok_or(OpenError::NoDevice)?;

        match self.build_stream(source, &mut sink) {
            Ok(parts) => {
                let stream = self.start_stream(parts, sink)?;
                log::info!(
                    "Output opened: {} -> {} on {} ({} byte buffer, prebuffer {} bytes)",
                    stream.source,
                    stream.device,
                    self.config
                        .device_thread
                        .map_or("external consumer".to_string(), |d| format!(
                            "device thread @ {}ms",
                            d.as_millis()
                        )),
                    stream.shared.ring.usable_capacity(),
                    stream.shared.prebuffer.threshold()
                );
                self.stream = Some(stream);
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to open output for {}: {}", source, e);
                self.sink = Some(sink);
                Err(e)
            }
        }
    }

    /// 协商 + 分配，设备在这里打开（此时还没有消费者）
    fn build_stream(
        &self,
        source: StreamSpec,
        sink: &mut Box<dyn AudioSink>,
    ) -> Result<StreamParts, OpenError> {
        let requested = StreamSpec {
            format: source.format,
            rate: self.config.device_rate.unwrap_or(source.rate),
        };
        let device = sink.native_format(&requested);
        if device.format.channels != source.format.channels {
            return Err(OpenError::ChannelMismatch {
                stream: source.format,
                device: device.format,
            });
        }
        let device = StreamSpec::new(device.format, device.rate)?;

        let s16 = SampleFormat::s16_native(source.format.channels);
        let direct = convert::select(source.format, device.format)?;
        let to_s16 = convert::select(source.format, s16)?;
        let from_s16 = convert::select(s16, device.format)?;

        let frame = device.format.bytes_per_frame();
        let wanted = device
            .ms_to_bytes(self.config.buffer_ms as u64)
            .max(self.config.min_buffer_bytes);
        // 可用容量对齐到整帧，外加一个保留槽
        let usable = (wanted / frame).max(1) * frame;
        let ring = RingBuffer::new(usable + 1)?;
        if self.config.lock_memory && !ring.lock_memory() {
            log::warn!("Continuing without locked ring buffer memory");
        }

        sink.open(&device)?;
        log::debug!("Device '{}' opened at {}", sink.name(), device);

        let device_bps = device.bytes_per_second() as f64;
        let ratio = source.rate as f64 / device.rate as f64 * self.config.pitch;
        let mut resampler = LinearResampler::new(source.format.channels.count(), ratio);
        resampler.set_gain(self.config.left_gain, self.config.right_gain);

        let prebuffer = PrebufferController::with_percent(
            ring.usable_capacity(),
            self.config.prebuffer_percent,
            self.config.force_start_when_rendering,
        );
        let shared = Arc::new(Shared {
            clock: ClockAccountant::new(source.bytes_per_second(), device_bps / self.config.pitch),
            prebuffer,
            stats: PlaybackStats::new(),
            device_resident: AtomicUsize::new(0),
            device_rendering: AtomicBool::new(false),
            pause_requested: AtomicBool::new(false),
            discard_requested: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            running: AtomicBool::new(true),
            ring,
        });

        Ok(StreamParts {
            source,
            device,
            shared,
            direct,
            to_s16,
            from_s16,
            resampler,
            device_bps,
        })
    }

    fn start_stream(
        &mut self,
        parts: StreamParts,
        sink: Box<dyn AudioSink>,
    ) -> Result<Stream, OpenError> {
        let frame_bytes = parts.device.format.bytes_per_frame();
        let handle = DeviceHandle {
            shared: Arc::clone(&parts.shared),
            sink,
            scratch: vec![0; parts.shared.ring.usable_capacity()],
            carry: Vec::new(),
            frame_bytes,
            paused: false,
            in_underrun: false,
        };

        let consumer = match self.config.device_thread {
            None => Consumer::Manual(handle),
            Some(interval) => {
                // spawn 失败时 handle 已被消耗，设备随之丢失，只能报错
                let spawned = thread::Builder::new()
                    .name("output-device".into())
                    .spawn(move || handle.run(interval));
                match spawned {
                    Ok(join) => Consumer::Thread(join),
                    Err(e) => return Err(OpenError::Thread(e)),
                }
            }
        };

        Ok(Stream {
            source: parts.source,
            device: parts.device,
            shared: parts.shared,
            direct: parts.direct,
            to_s16: parts.to_s16,
            from_s16: parts.from_s16,
            resampler: parts.resampler,
            device_bps: parts.device_bps,
            stage: Vec::new(),
            scratch: SampleScratch::default(),
            resampled: Vec::new(),
            out: Vec::new(),
            backlog: Vec::new(),
            consumer,
        })
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn source_spec(&self) -> Option<StreamSpec> {
        self.stream.as_ref().map(|s| s.source)
    }

    pub fn device_spec(&self) -> Option<StreamSpec> {
        self.stream.as_ref().map(|s| s.device)
    }

    /// 写入解码器输出的 PCM（源格式）
    ///
    /// 返回从输入中消费的字节数（整帧），可能少于输入：调用方应稍后重试。
    /// 绝不阻塞。
    pub fn write(&mut self, pcm: &[u8]) -> usize {
        let Some(stream) = self.stream.as_mut() else {
            return 0;
        };
        if !stream.push_backlog() {
            return 0;
        }

        let source_frame = stream.source.format.bytes_per_frame();
        let max_frames = stream.source_frames_for(stream.shared.ring.free_bytes());
        let frames = (pcm.len() / source_frame).min(max_frames);
        if frames == 0 {
            return 0;
        }

        let input = &pcm[..frames * source_frame];
        stream.transform(input);
        stream.push_out();
        stream.shared.clock.record_write(input.len());
        input.len()
    }

    /// 还能写入多少源格式字节（解码线程据此决定是否 sleep）
    pub fn free_bytes(&self) -> usize {
        match &self.stream {
            Some(stream) if stream.backlog.is_empty() => {
                stream.source_frames_for(stream.shared.ring.free_bytes())
                    * stream.source.format.bytes_per_frame()
            }
            _ => 0,
        }
    }

    /// Ring Buffer 中待播放的设备字节
    pub fn used_bytes(&self) -> usize {
        self.stream
            .as_ref()
            .map_or(0, |s| s.shared.ring.used_bytes() + s.backlog.len())
    }

    /// 外部消费者步进（设备线程模式下为 no-op）
    pub fn step_device(&mut self) -> usize {
        match self.stream.as_mut().map(|s| &mut s.consumer) {
            Some(Consumer::Manual(handle)) => handle.step(),
            _ => 0,
        }
    }

    /// 流结束后的非阻塞排空：强制开播，推送积压，手动模式下驱动一次消费者
    ///
    /// 所有音频都播完时返回 true（没有打开的流也返回 true）。
    /// 不改变暂停状态，也不等待；超时和停止由调用方决定，之后再 `close`
    pub fn drain_step(&mut self) -> bool {
        self.stream.as_mut().map_or(true, Stream::drain_step)
    }

    /// Seek：清空缓冲，时钟从 `target_ms` 重新开始，要求设备丢弃已排队的音频
    pub fn flush(&mut self, target_ms: i64) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        let shared = &stream.shared;
        shared.ring.reset_then(|| {
            shared.clock.on_flush(target_ms);
            shared.prebuffer.reset();
        });
        shared.discard_requested.store(true, Ordering::Release);
        // 排空中 seek：回到正常播放，重新计 underrun
        shared.draining.store(false, Ordering::Release);
        stream.backlog.clear();
        stream.resampler.reset();
        log::info!("Output flushed to {} ms", target_ms);
    }

    /// 暂停 / 恢复（由消费者在下一次步进时转交设备）
    pub fn pause(&mut self, paused: bool) {
        if let Some(stream) = &self.stream {
            stream.shared.pause_requested.store(paused, Ordering::Release);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.stream
            .as_ref()
            .is_some_and(|s| s.shared.pause_requested.load(Ordering::Acquire))
    }

    /// 用户变速，播放中即时生效
    pub fn set_pitch(&mut self, pitch: f64) -> Result<(), ConfigError> {
        if !PITCH_RANGE.contains(&pitch) {
            return Err(ConfigError::OutOfRange {
                key: "pitch",
                value: pitch,
            });
        }
        self.config.pitch = pitch;

        if let Some(stream) = self.stream.as_mut() {
            let resident = stream.shared.device_resident.load(Ordering::Acquire);
            stream
                .shared
                .clock
                .rebase(stream.device_bps / pitch, resident);
            let ratio = stream.source.rate as f64 / stream.device.rate as f64 * pitch;
            stream.resampler.set_ratio(ratio);
            log::info!("Pitch set to {:.2} (resample ratio {:.4})", pitch, ratio);
        }
        Ok(())
    }

    /// 软件音量（增益，1.0 = 原始音量）
    pub fn set_volume(&mut self, left: f32, right: f32) -> Result<(), ConfigError> {
        for (key, gain) in [("volume_left", left), ("volume_right", right)] {
            if !(0.0..=MAX_GAIN).contains(&gain) {
                return Err(ConfigError::OutOfRange {
                    key,
                    value: gain as f64 * 100.0,
                });
            }
        }
        self.config.left_gain = left;
        self.config.right_gain = right;
        if let Some(stream) = self.stream.as_mut() {
            stream.resampler.set_gain(left, right);
        }
        Ok(())
    }

    /// 缓冲区或设备里是否还有音频
    pub fn is_playing(&self) -> bool {
        self.stream
            .as_ref()
            .is_some_and(|s| !s.backlog.is_empty() || s.shared.has_pending_audio())
    }

    pub fn state(&self) -> PipelineState {
        self.stream
            .as_ref()
            .map_or(PipelineState::Closed, |s| s.shared.state())
    }

    /// 解码器进度（毫秒）
    pub fn written_time_ms(&self) -> i64 {
        self.stream
            .as_ref()
            .map_or(0, |s| s.shared.clock.written_time_ms())
    }

    /// 听众当前位置（毫秒）
    pub fn output_time_ms(&self) -> i64 {
        self.stream.as_ref().map_or(0, |s| s.shared.output_time_ms())
    }

    pub fn monitor(&self) -> Option<StreamMonitor> {
        self.stream.as_ref().map(|s| StreamMonitor {
            shared: Arc::clone(&s.shared),
        })
    }

    pub fn stats_report(&self) -> Option<StatsReport> {
        self.stream
            .as_ref()
            .map(|s| s.shared.stats.report(self.config.device_thread))
    }

    /// 关闭流
    ///
    /// Drain：播完剩余音频（最多等待 drain_timeout）；Discard：立即丢弃。
    /// 返回这条流最终的统计报告
    pub fn close(&mut self, mode: CloseMode) -> Option<StatsReport> {
        let mut stream = self.stream.take()?;

        if mode == CloseMode::Drain {
            Self::drain(&mut stream, self.config.drain_timeout, self.config.device_thread);
        }

        let report = stream.shared.stats.report(self.config.device_thread);
        match stream.stop_consumer() {
            Some(handle) => {
                let mut sink = handle.into_sink();
                if mode == CloseMode::Discard {
                    sink.discard();
                }
                sink.close();
                self.sink = Some(sink);
            }
            None => self.sink = None,
        }

        log::info!(
            "Output closed ({:?}): {} underruns, {} short writes, {} bytes played",
            mode,
            report.underrun_count,
            report.short_write_count,
            report.bytes_played
        );
        Some(report)
    }

    fn drain(stream: &mut Stream, timeout: Duration, device_thread: Option<Duration>) {
        stream.shared.pause_requested.store(false, Ordering::Release);

        let wait = device_thread.unwrap_or(Duration::from_millis(1));
        let deadline = Instant::now() + timeout;
        while !stream.drain_step() {
            if Instant::now() >= deadline {
                log::warn!(
                    "Drain timed out with {} bytes still buffered",
                    stream.shared.ring.used_bytes() + stream.backlog.len()
                );
                return;
            }
            thread::sleep(wait);
        }
        log::debug!("Output drained");
    }
}

impl Drop for OutputPipeline {
    fn drop(&mut self) {
        let _ = self.close(CloseMode::Discard);
    }
}

/// open 的中间产物
struct StreamParts {
    source: StreamSpec,
    device: StreamSpec,
    shared: Arc<Shared>,
    direct: Option<Conversion>,
    to_s16: Option<Conversion>,
    from_s16: Option<Conversion>,
    resampler: LinearResampler,
    device_bps: f64,
}
