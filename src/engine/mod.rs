//! 播放引擎
//!
//! 整合解码、输出管线
//! 解码线程持有 `OutputPipeline`（唯一生产者），UI 线程只通过原子命令和 `StreamMonitor` 与之交互

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::audio::{
    CloseMode, OpenError, OutputConfig, OutputPipeline, PipelineState, StatsReport, StreamMonitor,
};
use crate::decode::{DecodeError, FileSource, PcmSource};
use crate::sink::AudioSink;

/// 没有待处理的 seek
const NO_SEEK: i64 = -1;

/// 播放状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
    Buffering,
}

/// 引擎配置
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// 输出配置
    pub output: OutputConfig,
    /// 管线写不下时解码线程的退避时间
    pub poll_interval: Duration,
    /// 每次从解码器取的字节数（上限）
    pub chunk_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output: OutputConfig::default(),
            poll_interval: Duration::from_millis(10),
            chunk_bytes: 4096,
        }
    }
}

/// 引擎错误
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("output error: {0}")]
    Output(#[from] OpenError),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

/// 播放引擎统计
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// 缓冲区填充比例
    pub buffer_fill_ratio: f64,
    /// Underrun 次数
    pub underrun_count: u64,
    /// 听众位置（毫秒）
    pub position_ms: i64,
    /// 解码进度（毫秒）
    pub decoded_ms: i64,
}

/// 解码线程共享状态
///
/// 完全基于原子操作
struct DecoderState {
    /// 是否应该继续运行
    running: AtomicBool,
    /// 请求暂停输出
    paused: AtomicBool,
    /// 待执行的 seek（毫秒，NO_SEEK 表示无）
    seek_to: AtomicI64,
    /// 解码是否已到达 EOF 并播完
    finished: AtomicBool,
}

/// 解码线程的返回值
struct DecoderExit {
    pipeline: OutputPipeline,
    report: Option<StatsReport>,
}

/// 播放引擎
pub struct Engine {
    config: EngineConfig,
    /// 空闲时的输出管线（播放时交给解码线程）
    pipeline: Option<OutputPipeline>,
    decoder_thread: Option<JoinHandle<DecoderExit>>,
    decoder_state: Arc<DecoderState>,
    monitor: Option<StreamMonitor>,
    duration_ms: Option<u64>,
    last_report: Option<StatsReport>,
}

impl Engine {
    /// 创建新引擎
    pub fn new(config: EngineConfig, sink: Box<dyn AudioSink>) -> Self {
        let pipeline = OutputPipeline::new(config.output.clone(), sink);
        let decoder_state = Arc::new(DecoderState {
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            seek_to: AtomicI64::new(NO_SEEK),
            finished: AtomicBool::new(false),
        });

        Self {
            config,
            pipeline: Some(pipeline),
            decoder_thread: None,
            decoder_state,
            monitor: None,
            duration_ms: None,
            last_report: None,
        }
    }

    /// 加载并播放文件
    pub fn play_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), EngineError> {
        let path = path.as_ref();
        log::info!("Loading: {}", path.display());

        let source = FileSource::open(path)?;
        let info = source.info();
        log::info!(
            "Format: {} | Codec: {} | {}Hz {}ch {}bit | Duration: {:.1}s",
            info.format,
            info.codec,
            info.sample_rate,
            info.channels,
            info.bit_depth.unwrap_or(0),
            info.duration_secs.unwrap_or(0.0)
        );
        self.play(Box::new(source))
    }

    /// 播放任意 PCM 源
    pub fn play(&mut self, source: Box<dyn PcmSource>) -> Result<(), EngineError> {
        // 如果正在播放，先停止
        if self.decoder_thread.is_some() {
            self.stop();
        }

        let mut pipeline = self
            .pipeline
            .take()
            .ok_or(EngineError::InvalidState("output device lost"))?;
        let spec = source.spec();
        if let Err(e) = pipeline.open(spec.format, spec.rate) {
            self.pipeline = Some(pipeline);
            return Err(e.into());
        }

        self.monitor = pipeline.monitor();
        self.duration_ms = source.duration_ms();
        self.last_report = None;

        self.decoder_state.running.store(true, Ordering::Release);
        self.decoder_state.paused.store(false, Ordering::Release);
        self.decoder_state.seek_to.store(NO_SEEK, Ordering::Release);
        self.decoder_state.finished.store(false, Ordering::Release);

        let state = Arc::clone(&self.decoder_state);
        let config = self.config.clone();
        let decoder_thread = thread::Builder::new()
            .name("decoder".to_string())
            .spawn(move || Self::decoder_thread_main(source, pipeline, state, config))
            .expect("Failed to spawn decoder thread");
        self.decoder_thread = Some(decoder_thread);

        Ok(())
    }

    /// 解码线程主函数
    ///
    /// 写不下就睡 poll_interval 再试（管线从不阻塞生产者）
    /// EOF 之后逐步排空，不阻塞在 close 里：停止立即丢弃，seek 回到解码
    fn decoder_thread_main(
        mut source: Box<dyn PcmSource>,
        mut pipeline: OutputPipeline,
        state: Arc<DecoderState>,
        config: EngineConfig,
    ) -> DecoderExit {
        // 没有设备线程时由解码线程驱动消费者
        let manual_consumer = config.output.device_thread.is_none();
        let mut pending: Vec<u8> = Vec::with_capacity(config.chunk_bytes * 2);
        let mut offset = 0;
        let mut paused = false;

        log::info!(
            "Decoder thread started, chunk {} bytes, backoff {} ms",
            config.chunk_bytes,
            config.poll_interval.as_millis()
        );

        // EOF 之后的排空期限；排空期间仍响应停止、seek 和暂停
        let mut drain_deadline: Option<Instant> = None;

        let (close_mode, finished) = loop {
            if !state.running.load(Ordering::Acquire) {
                break (CloseMode::Discard, false);
            }

            let seek_to = state.seek_to.swap(NO_SEEK, Ordering::AcqRel);
            if seek_to >= 0 {
                match source.seek(seek_to as u64) {
                    Ok(actual) => {
                        pending.clear();
                        offset = 0;
                        pipeline.flush(actual as i64);
                        drain_deadline = None;
                    }
                    Err(e) => log::error!("Seek to {} ms failed: {}", seek_to, e),
                }
            }

            let want_pause = state.paused.load(Ordering::Acquire);
            if want_pause != paused {
                pipeline.pause(want_pause);
                paused = want_pause;
            }

            if let Some(deadline) = drain_deadline.as_mut() {
                if pipeline.drain_step() {
                    log::debug!("Output drained");
                    break (CloseMode::Drain, true);
                }
                if paused {
                    // 暂停不消耗排空时间
                    *deadline = Instant::now() + config.output.drain_timeout;
                } else if Instant::now() >= *deadline {
                    log::warn!(
                        "Drain timed out with {} bytes still buffered",
                        pipeline.used_bytes()
                    );
                    break (CloseMode::Discard, true);
                }
                thread::sleep(config.poll_interval);
                continue;
            }

            if manual_consumer {
                pipeline.step_device();
            }

            if offset == pending.len() {
                pending.clear();
                offset = 0;
                match source.read(&mut pending) {
                    Ok(0) => {
                        log::info!("Decoder reached end of stream");
                        drain_deadline = Some(Instant::now() + config.output.drain_timeout);
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::error!("Decode error: {}", e);
                        drain_deadline = Some(Instant::now() + config.output.drain_timeout);
                        continue;
                    }
                }
            }

            // 可能只写进一部分，剩下的下一轮再写
            let end = pending.len().min(offset + config.chunk_bytes);
            offset += pipeline.write(&pending[offset..end]);
            if offset < pending.len() && pipeline.free_bytes() == 0 {
                thread::sleep(config.poll_interval);
            }
        };

        let report = pipeline.close(close_mode);
        if finished {
            state.finished.store(true, Ordering::Release);
        }
        if let Some(report) = &report {
            log::debug!("{}", report);
        }
        log::info!("Decoder thread finished");

        DecoderExit { pipeline, report }
    }

    /// 停止播放（丢弃未播放的音频）
    pub fn stop(&mut self) {
        self.decoder_state.running.store(false, Ordering::Release);

        if let Some(thread) = self.decoder_thread.take() {
            match thread.join() {
                Ok(exit) => {
                    self.pipeline = Some(exit.pipeline);
                    self.last_report = exit.report;
                }
                Err(_) => log::error!("Decoder thread panicked, output device lost"),
            }
            log::info!("Playback stopped");
        }
        self.decoder_state.paused.store(false, Ordering::Release);
    }

    /// 暂停/恢复
    pub fn toggle_pause(&mut self) -> Result<(), EngineError> {
        match self.state() {
            PlaybackState::Stopped => Err(EngineError::InvalidState("Cannot pause when stopped")),
            PlaybackState::Paused => {
                self.decoder_state.paused.store(false, Ordering::Release);
                log::info!("Resumed");
                Ok(())
            }
            PlaybackState::Playing | PlaybackState::Buffering => {
                self.decoder_state.paused.store(true, Ordering::Release);
                log::info!("Paused");
                Ok(())
            }
        }
    }

    /// 跳到指定位置（毫秒），由解码线程在下一轮执行
    pub fn seek(&self, position_ms: u64) -> Result<(), EngineError> {
        if self.decoder_thread.is_none() {
            return Err(EngineError::InvalidState("Cannot seek when stopped"));
        }
        let target = position_ms.min(i64::MAX as u64) as i64;
        self.decoder_state.seek_to.store(target, Ordering::Release);
        Ok(())
    }

    /// 获取当前状态
    pub fn state(&self) -> PlaybackState {
        if self.decoder_thread.is_none() {
            return PlaybackState::Stopped;
        }
        if self.decoder_state.paused.load(Ordering::Acquire) {
            return PlaybackState::Paused;
        }
        match self.monitor.as_ref().map(|m| m.state()) {
            Some(PipelineState::Prebuffering) => PlaybackState::Buffering,
            // 恢复请求还没被解码线程转交时管线仍是 Paused
            Some(PipelineState::Playing | PipelineState::Paused) => PlaybackState::Playing,
            Some(PipelineState::Closed) | None => PlaybackState::Stopped,
        }
    }

    /// 获取统计信息
    pub fn stats(&self) -> EngineStats {
        match &self.monitor {
            Some(monitor) => EngineStats {
                buffer_fill_ratio: monitor.fill_ratio(),
                underrun_count: monitor.underrun_count(),
                position_ms: monitor.output_time_ms(),
                decoded_ms: monitor.written_time_ms(),
            },
            None => EngineStats {
                buffer_fill_ratio: 0.0,
                underrun_count: 0,
                position_ms: 0,
                decoded_ms: 0,
            },
        }
    }

    /// 当前音轨总时长
    pub fn duration_ms(&self) -> Option<u64> {
        self.duration_ms
    }

    /// 检查当前音轨是否已播放完毕
    pub fn is_track_finished(&self) -> bool {
        self.decoder_state.finished.load(Ordering::Acquire)
            || self
                .decoder_thread
                .as_ref()
                .is_some_and(|thread| thread.is_finished())
    }

    /// 上一条流关闭时的统计报告
    pub fn last_report(&self) -> Option<&StatsReport> {
        self.last_report.as_ref()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}
