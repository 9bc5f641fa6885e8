//! 磁盘写出
//!
//! 把管线输出写成 RIFF/WAVE 文件：
//! - 8-bit 以无符号存储（WAV 约定），管线侧交付有符号 8-bit，由 hound 转换
//! - 16-bit 以有符号小端存储
//! - 关闭时回填头部长度
//!
//! 文件写入没有实时约束，设备永远"空闲"，也没有驻留数据。

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use hound::{WavSpec, WavWriter};

use super::{AudioSink, SinkError};
use crate::audio::{SampleFormat, SampleWidth, StreamSpec};

/// 每次最多接受的字节数
const WRITE_CHUNK: usize = 64 * 1024;

/// WAV 文件 sink
pub struct WavSink {
    path: PathBuf,
    writer: Option<WavWriter<BufWriter<File>>>,
    spec: Option<StreamSpec>,
    paused: bool,
    bytes_written: u64,
}

impl WavSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: None,
            spec: None,
            paused: false,
            bytes_written: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn write_samples(&mut self, data: &[u8]) -> Result<usize, SinkError> {
        let spec = self.spec.ok_or(SinkError::NotOpen)?;
        let writer = self.writer.as_mut().ok_or(SinkError::NotOpen)?;

        match spec.format.width {
            SampleWidth::Bits8 => {
                for &byte in data {
                    writer.write_sample(byte as i8)?;
                }
                Ok(data.len())
            }
            SampleWidth::Bits16 => {
                let whole = data.len() - data.len() % 2;
                for pair in data[..whole].chunks_exact(2) {
                    writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
                }
                Ok(whole)
            }
        }
    }
}

impl AudioSink for WavSink {
    fn name(&self) -> &str {
        "wav"
    }

    fn native_format(&self, requested: &StreamSpec) -> StreamSpec {
        let channels = requested.format.channels;
        let format = match requested.format.width {
            SampleWidth::Bits8 => SampleFormat::s8(channels),
            SampleWidth::Bits16 => SampleFormat::s16_le(channels),
        };
        StreamSpec {
            format,
            rate: requested.rate,
        }
    }

    fn open(&mut self, spec: &StreamSpec) -> Result<(), SinkError> {
        let wav_spec = WavSpec {
            channels: spec.format.channels.count() as u16,
            sample_rate: spec.rate,
            bits_per_sample: spec.format.width.bits(),
            sample_format: hound::SampleFormat::Int,
        };
        let writer = WavWriter::create(&self.path, wav_spec)?;

        self.writer = Some(writer);
        self.spec = Some(*spec);
        self.paused = false;
        self.bytes_written = 0;
        log::info!("Writing {} to {}", spec, self.path.display());
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> usize {
        if self.paused {
            return 0;
        }
        let data = &data[..data.len().min(WRITE_CHUNK)];
        match self.write_samples(data) {
            Ok(n) => {
                self.bytes_written += n as u64;
                n
            }
            Err(e) => {
                log::error!("WAV write failed, closing {}: {}", self.path.display(), e);
                // 之后的写入全部返回 0
                self.writer = None;
                0
            }
        }
    }

    fn free_bytes(&self) -> usize {
        if self.writer.is_some() && !self.paused {
            WRITE_CHUNK
        } else {
            0
        }
    }

    fn resident_bytes(&self) -> usize {
        0
    }

    fn is_rendering(&self) -> bool {
        false
    }

    fn pause(&mut self, paused: bool) {
        self.paused = paused;
    }

    fn discard(&mut self) {}

    fn close(&mut self) {
        self.spec = None;
        if let Some(writer) = self.writer.take() {
            match writer.finalize() {
                Ok(()) => log::info!(
                    "Closed {} ({} bytes of audio)",
                    self.path.display(),
                    self.bytes_written
                ),
                Err(e) => log::error!("Failed to finalize {}: {}", self.path.display(), e),
            }
        }
    }
}

impl Drop for WavSink {
    fn drop(&mut self) {
        self.close();
    }
}
