//! 音频文件解码器
//!
//! 使用 symphonia 库解码音频文件
//! 支持：FLAC, WAV, AIFF, MP3
//!
//! 任何源样本格式都统一输出为交错的 S16 主机字节序，
//! 位深/符号/字节序的进一步转换交给输出管线。

use std::fs::File;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;

use super::{DecodeError, PcmSource};
use crate::audio::{ChannelLayout, SampleFormat, StreamSpec};

/// 音频文件信息
#[derive(Debug, Clone)]
pub struct AudioInfo {
    /// 采样率
    pub sample_rate: u32,
    /// 声道数
    pub channels: u32,
    /// 位深度（原始格式）
    pub bit_depth: Option<u32>,
    /// 总帧数（如果已知）
    pub total_frames: Option<u64>,
    /// 总时长（秒）
    pub duration_secs: Option<f64>,
    /// 格式名称
    pub format: String,
    /// 编解码器名称
    pub codec: String,
}

/// 音频文件解码器
pub struct FileSource {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    info: AudioInfo,
    spec: StreamSpec,
    /// 交错 i16 缓冲区，按包大小增长后复用
    sample_buffer: Option<SampleBuffer<i16>>,
    /// seek 落点之前、需要丢弃的帧数
    skip_frames: u64,
}

impl FileSource {
    /// 打开音频文件
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DecodeError> {
        let path = path.as_ref();

        let file = File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        // 提示文件扩展名
        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &MetadataOptions::default())
            .map_err(|_| DecodeError::UnsupportedFormat)?;

        let reader = probed.format;
        let format_name = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|s| s.to_uppercase())
            .unwrap_or_else(|| "Unknown".to_string());

        // 第一个音频轨道
        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(DecodeError::NoAudioTrack)?;

        let track_id = track.id;
        let codec_params = &track.codec_params;

        let sample_rate = codec_params.sample_rate.ok_or(DecodeError::NoAudioTrack)?;
        let channels = codec_params
            .channels
            .map(|c| c.count() as u32)
            .unwrap_or(2);
        let total_frames = codec_params.n_frames;

        let codec_name = symphonia::default::get_codecs()
            .get_codec(codec_params.codec)
            .map(|c| c.short_name.to_string())
            .unwrap_or_else(|| "Unknown".to_string());

        let info = AudioInfo {
            sample_rate,
            channels,
            bit_depth: codec_params.bits_per_sample,
            total_frames,
            duration_secs: total_frames.map(|f| f as f64 / sample_rate as f64),
            format: format_name,
            codec: codec_name,
        };

        // 只支持单声道/立体声
        let layout = ChannelLayout::from_count(channels as u16)?;
        let spec = StreamSpec::new(SampleFormat::s16_native(layout), sample_rate)?;

        let decoder = symphonia::default::get_codecs()
            .make(codec_params, &DecoderOptions::default())
            .map_err(|e| DecodeError::DecoderCreation(e.to_string()))?;

        log::debug!(
            "Opened {} ({} {}, {} Hz, {} ch)",
            path.display(),
            info.format,
            info.codec,
            info.sample_rate,
            info.channels
        );

        Ok(Self {
            reader,
            decoder,
            track_id,
            info,
            spec,
            sample_buffer: None,
            skip_frames: 0,
        })
    }

    /// 获取音频信息
    pub fn info(&self) -> &AudioInfo {
        &self.info
    }
}

impl PcmSource for FileSource {
    fn spec(&self) -> StreamSpec {
        self.spec
    }

    fn read(&mut self, out: &mut Vec<u8>) -> Result<usize, DecodeError> {
        loop {
            let packet = match self.reader.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(0);
                }
                Err(e) => return Err(DecodeError::DecodeFailed(e.to_string())),
            };

            // 跳过非目标轨道
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                // 跳过损坏的帧
                Err(SymphoniaError::DecodeError(e)) => {
                    log::debug!("Skipping corrupt packet: {}", e);
                    continue;
                }
                Err(e) => return Err(DecodeError::DecodeFailed(e.to_string())),
            };
            if decoded.frames() == 0 {
                continue;
            }

            let frames = decoded.frames() as u64;
            let channels = decoded.spec().channels.count();
            if self.skip_frames >= frames {
                self.skip_frames -= frames;
                continue;
            }

            let spec = *decoded.spec();
            let capacity = decoded.capacity();
            if self
                .sample_buffer
                .as_ref()
                .is_some_and(|b| b.capacity() < capacity * channels)
            {
                self.sample_buffer = None;
            }
            let buffer = self
                .sample_buffer
                .get_or_insert_with(|| SampleBuffer::new(capacity as u64, spec));
            buffer.copy_interleaved_ref(decoded);

            let skip = self.skip_frames as usize * channels;
            self.skip_frames = 0;
            let samples = &buffer.samples()[skip..];
            out.reserve(samples.len() * 2);
            for sample in samples {
                out.extend_from_slice(&sample.to_ne_bytes());
            }
            return Ok(samples.len() * 2);
        }
    }

    fn seek(&mut self, position_ms: u64) -> Result<u64, DecodeError> {
        let seek_to = SeekTo::Time {
            time: Time::new(position_ms / 1000, (position_ms % 1000) as f64 / 1000.0),
            track_id: Some(self.track_id),
        };

        let seeked = self
            .reader
            .seek(SeekMode::Accurate, seek_to)
            .map_err(|e| DecodeError::SeekFailed(e.to_string()))?;

        // reader 落在包边界上，解码后丢弃到目标帧
        self.skip_frames = seeked.required_ts.saturating_sub(seeked.actual_ts);

        // 重置解码器状态
        self.decoder.reset();
        Ok(position_ms)
    }

    fn duration_ms(&self) -> Option<u64> {
        self.info.duration_secs.map(|s| (s * 1000.0) as u64)
    }
}
