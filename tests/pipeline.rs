//! 输出管线端到端测试（公共 API + 可编程设备）

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use roger_output::audio::{
    ChannelLayout, CloseMode, OutputConfig, OutputPipeline, PipelineState, SampleFormat,
    StreamSpec,
};
use roger_output::decode::{PcmSource, ToneSource};
use roger_output::sink::{AudioSink, SinkError, WavSink};

/// 设备状态：驻留字节由测试脚本"播放"
#[derive(Default)]
struct Device {
    capacity: usize,
    resident: usize,
    written: Vec<u8>,
    discards: usize,
    /// 单次 write 最多接受的字节（模拟短写）
    max_write: Option<usize>,
}

struct ScriptedSink {
    device: Arc<Mutex<Device>>,
    format: Option<SampleFormat>,
}

impl ScriptedSink {
    fn new(capacity: usize, format: Option<SampleFormat>) -> (Self, Arc<Mutex<Device>>) {
        let device = Arc::new(Mutex::new(Device {
            capacity,
            ..Default::default()
        }));
        (
            Self {
                device: Arc::clone(&device),
                format,
            },
            device,
        )
    }
}

impl AudioSink for ScriptedSink {
    fn name(&self) -> &str {
        "scripted"
    }

    fn native_format(&self, requested: &StreamSpec) -> StreamSpec {
        StreamSpec {
            format: self.format.unwrap_or(requested.format),
            rate: requested.rate,
        }
    }

    fn open(&mut self, _spec: &StreamSpec) -> Result<(), SinkError> {
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> usize {
        let mut device = self.device.lock();
        let limit = device.max_write.unwrap_or(usize::MAX);
        let n = data.len().min(device.capacity - device.resident).min(limit);
        device.written.extend_from_slice(&data[..n]);
        device.resident += n;
        n
    }

    fn free_bytes(&self) -> usize {
        let device = self.device.lock();
        device.capacity - device.resident
    }

    fn resident_bytes(&self) -> usize {
        self.device.lock().resident
    }

    fn is_rendering(&self) -> bool {
        self.device.lock().resident > 0
    }

    fn pause(&mut self, _paused: bool) {}

    fn discard(&mut self) {
        let mut device = self.device.lock();
        device.resident = 0;
        device.discards += 1;
    }

    fn close(&mut self) {}
}

fn render(device: &Arc<Mutex<Device>>, bytes: usize) {
    let mut device = device.lock();
    device.resident = device.resident.saturating_sub(bytes);
}

fn manual_config(buffer_ms: u32) -> OutputConfig {
    OutputConfig {
        buffer_ms,
        device_thread: None,
        drain_timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

#[test]
fn test_cd_stream_prebuffer_clock_and_flush() {
    let (sink, device) = ScriptedSink::new(4096, None);
    let mut pipeline = OutputPipeline::new(manual_config(100), Box::new(sink));
    pipeline
        .open(SampleFormat::s16_native(ChannelLayout::Stereo), 44100)
        .unwrap();
    assert_eq!(pipeline.state(), PipelineState::Prebuffering);

    let chunk: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    for _ in 0..4 {
        assert!(pipeline.free_bytes() >= chunk.len());
        assert_eq!(pipeline.write(&chunk), chunk.len());
    }
    assert_eq!(pipeline.used_bytes(), 4 * 4096);
    // 16384 字节 @ 176400 B/s
    assert_eq!(pipeline.written_time_ms(), 92);

    let mut last = pipeline.output_time_ms();
    assert_eq!(last, 0);
    let mut reached_playing = false;
    for _ in 0..12 {
        pipeline.step_device();
        reached_playing |= pipeline.state() == PipelineState::Playing;
        render(&device, 2048);
        pipeline.step_device();

        let now = pipeline.output_time_ms();
        assert!(now >= last, "output time went backwards: {} -> {}", last, now);
        last = now;
    }
    assert!(reached_playing);
    assert!(last > 0);
    assert_eq!(pipeline.used_bytes(), 0);
    assert_eq!(device.lock().written, chunk.repeat(4));

    pipeline.flush(2000);
    assert_eq!(pipeline.output_time_ms(), 2000);
    assert_eq!(pipeline.used_bytes(), 0);
    assert_eq!(pipeline.state(), PipelineState::Prebuffering);

    // 消费者在下一步执行丢弃
    pipeline.step_device();
    assert_eq!(device.lock().discards, 1);
    assert_eq!(pipeline.output_time_ms(), 2000);

    pipeline.close(CloseMode::Discard);
    assert_eq!(pipeline.state(), PipelineState::Closed);
}

#[test]
fn test_u8_mono_widened_for_s16_device() {
    let (sink, device) = ScriptedSink::new(4096, Some(SampleFormat::s16_native(ChannelLayout::Mono)));
    let mut config = manual_config(100);
    config.prebuffer_percent = 0;
    let mut pipeline = OutputPipeline::new(config, Box::new(sink));
    pipeline
        .open(SampleFormat::u8(ChannelLayout::Mono), 8000)
        .unwrap();
    assert_eq!(
        pipeline.device_spec().unwrap().format,
        SampleFormat::s16_native(ChannelLayout::Mono)
    );

    assert_eq!(pipeline.write(&[0, 128, 255]), 3);
    // 源字节率计时：3 字节 @ 8000 B/s
    assert_eq!(pipeline.written_time_ms(), 0);
    assert_eq!(pipeline.step_device(), 6);

    let written = device.lock().written.clone();
    let samples: Vec<i16> = written
        .chunks_exact(2)
        .map(|b| i16::from_ne_bytes([b[0], b[1]]))
        .collect();
    assert_eq!(samples, vec![-32768, 0, 32512]);
}

#[test]
fn test_backpressure_with_device_thread() {
    let (sink, device) = ScriptedSink::new(1024, None);
    let config = OutputConfig {
        buffer_ms: 50,
        min_buffer_bytes: 0,
        device_thread: Some(Duration::from_millis(1)),
        drain_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    let mut pipeline = OutputPipeline::new(config, Box::new(sink));
    pipeline
        .open(SampleFormat::s16_le(ChannelLayout::Stereo), 8000)
        .unwrap();

    // 一个"渲染"线程按固定速度消耗设备驻留数据
    let renderer = {
        let device = Arc::clone(&device);
        thread::spawn(move || {
            for _ in 0..400 {
                render(&device, 256);
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    let data: Vec<u8> = (0..20_000u32).map(|i| (i % 256) as u8).collect();
    let mut offset = 0;
    let mut backoffs = 0;
    while offset < data.len() {
        if pipeline.free_bytes() == 0 {
            backoffs += 1;
            thread::sleep(Duration::from_millis(2));
            continue;
        }
        offset += pipeline.write(&data[offset..]);
    }
    assert!(backoffs > 0);

    let report = pipeline.close(CloseMode::Drain).unwrap();
    renderer.join().unwrap();
    assert_eq!(report.bytes_played, data.len() as u64);
    assert_eq!(device.lock().written, data);
}

#[test]
fn test_tone_to_wav_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tone.wav");

    let spec = StreamSpec::new(SampleFormat::u8(ChannelLayout::Mono), 8000).unwrap();
    let mut tone = ToneSource::new(spec, 1000.0, 0.8).with_duration_ms(250);
    let mut pcm = Vec::new();
    while tone.read(&mut pcm).unwrap() > 0 {}
    assert_eq!(pcm.len(), 2000);

    let config = OutputConfig {
        device_thread: Some(Duration::from_millis(1)),
        ..Default::default()
    };
    let mut pipeline = OutputPipeline::new(config, Box::new(WavSink::new(&path)));
    pipeline.open(spec.format, spec.rate).unwrap();

    let mut offset = 0;
    while offset < pcm.len() {
        let n = pipeline.write(&pcm[offset..]);
        if n == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        offset += n;
    }
    pipeline.close(CloseMode::Drain);

    let mut reader = hound::WavReader::open(&path).unwrap();
    let wav_spec = reader.spec();
    assert_eq!(wav_spec.bits_per_sample, 8);
    assert_eq!(wav_spec.channels, 1);
    assert_eq!(wav_spec.sample_rate, 8000);
    let samples: Vec<i8> = reader.samples::<i8>().map(|s| s.unwrap()).collect();
    let expected: Vec<i8> = pcm.iter().map(|&b| (b ^ 0x80) as i8).collect();
    assert_eq!(samples, expected);
}

#[test]
fn test_short_device_write_carries_remainder() {
    let (sink, device) = ScriptedSink::new(4096, None);
    device.lock().max_write = Some(1000);
    let mut config = manual_config(100);
    config.prebuffer_percent = 0;
    let mut pipeline = OutputPipeline::new(config, Box::new(sink));
    pipeline
        .open(SampleFormat::s16_native(ChannelLayout::Stereo), 44100)
        .unwrap();

    let data: Vec<u8> = (0..4000u32).map(|i| (i % 199) as u8).collect();
    assert_eq!(pipeline.write(&data), data.len());

    // 整块读出 Ring Buffer，设备只收下 1000 字节，其余留在 carry
    assert_eq!(pipeline.step_device(), 1000);
    assert_eq!(pipeline.used_bytes(), 0);
    assert_eq!(pipeline.stats_report().unwrap().short_write_count, 1);
    // carry 也算驻留：位置不能提前
    assert_eq!(pipeline.output_time_ms(), 0);
    assert!(pipeline.is_playing());

    for _ in 0..3 {
        assert_eq!(pipeline.step_device(), 1000);
    }
    assert_eq!(pipeline.step_device(), 0);
    assert_eq!(device.lock().written, data);
    assert_eq!(pipeline.output_time_ms(), 0);

    render(&device, 4000);
    pipeline.step_device();
    // 4000 字节 @ 176400 B/s
    assert_eq!(pipeline.output_time_ms(), 22);

    let report = pipeline.stats_report().unwrap();
    assert_eq!(report.bytes_played, 4000);
    assert_eq!(report.short_write_count, 1);
}

#[test]
fn test_set_pitch_keeps_position_with_device_resident_audio() {
    let (sink, device) = ScriptedSink::new(17_640, None);
    let mut config = manual_config(100);
    config.prebuffer_percent = 0;
    let mut pipeline = OutputPipeline::new(config, Box::new(sink));
    pipeline
        .open(SampleFormat::s16_native(ChannelLayout::Stereo), 44100)
        .unwrap();

    // 50ms 全部交给设备，放掉一半
    let data = vec![0u8; 8820];
    assert_eq!(pipeline.write(&data), data.len());
    assert_eq!(pipeline.step_device(), 8820);
    render(&device, 4410);
    pipeline.step_device();
    assert_eq!(pipeline.output_time_ms(), 25);

    pipeline.set_pitch(2.0).unwrap();
    assert_eq!(pipeline.output_time_ms(), 25);

    // 变速前交付的 25ms 放完，按旧速率计入
    render(&device, 4410);
    pipeline.step_device();
    assert_eq!(pipeline.output_time_ms(), 50);

    // 2 倍速下再放 50ms 曲目时间
    assert_eq!(pipeline.write(&data), data.len());
    assert!(pipeline.step_device() > 0);
    render(&device, 17_640);
    pipeline.step_device();
    let now = pipeline.output_time_ms();
    assert!((99..=100).contains(&now), "position after pitch change: {}", now);
}

#[test]
fn test_is_playing_until_device_drained() {
    let (sink, device) = ScriptedSink::new(4096, None);
    let mut config = manual_config(100);
    config.prebuffer_percent = 0;
    let mut pipeline = OutputPipeline::new(config, Box::new(sink));
    pipeline
        .open(SampleFormat::s16_native(ChannelLayout::Stereo), 44100)
        .unwrap();
    assert!(!pipeline.is_playing());

    // 数据在 Ring Buffer 里
    assert_eq!(pipeline.write(&[0u8; 4000]), 4000);
    assert!(pipeline.is_playing());

    // 数据只在设备里
    assert_eq!(pipeline.step_device(), 4000);
    assert_eq!(pipeline.used_bytes(), 0);
    assert!(pipeline.is_playing());

    render(&device, 4000);
    pipeline.step_device();
    assert!(!pipeline.is_playing());

    // 非阻塞排空：设备放完之前一直返回 false
    assert_eq!(pipeline.write(&[0u8; 400]), 400);
    assert!(!pipeline.drain_step());
    assert!(pipeline.is_playing());
    render(&device, 400);
    assert!(pipeline.drain_step());
    assert!(!pipeline.is_playing());
    assert_eq!(pipeline.stats_report().unwrap().bytes_played, 4400);
}

