//! roger-output - 实时音频输出管线的命令行前端
//!
//! 解码文件（或生成测试音）→ 输出管线 → 空设备 / WAV 文件

use std::io::{self, Read as IoRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};

use roger_output::audio::{ChannelLayout, Endianness, SampleFormat, Signedness, StreamSpec};
use roger_output::decode::ToneSource;
use roger_output::engine::{Engine, EngineConfig, PlaybackState};
use roger_output::sink::{AudioSink, NullSink, WavSink};

/// 每次按键 seek 的步长
const SEEK_STEP_MS: i64 = 5000;

/// 终端原始模式 RAII 守卫
struct RawModeGuard {
    original: libc::termios,
}

impl RawModeGuard {
    /// 进入原始模式，返回守卫（离开作用域自动恢复）
    fn enter() -> Option<Self> {
        unsafe {
            if libc::isatty(libc::STDIN_FILENO) != 1 {
                return None;
            }
            let mut original: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(libc::STDIN_FILENO, &mut original) != 0 {
                return None;
            }

            let mut raw = original;
            // 关闭 canonical 模式和回显
            raw.c_lflag &= !(libc::ICANON | libc::ECHO);
            // 非阻塞读取：VMIN=0, VTIME=0
            raw.c_cc[libc::VMIN] = 0;
            raw.c_cc[libc::VTIME] = 0;

            if libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &raw) != 0 {
                return None;
            }

            Some(Self { original })
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        unsafe {
            libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &self.original);
        }
    }
}

/// 非阻塞读取一个字符
fn read_char_nonblocking() -> Option<u8> {
    let mut buf = [0u8; 1];
    let stdin = io::stdin();
    let mut handle = stdin.lock();
    match handle.read(&mut buf) {
        Ok(1) => Some(buf[0]),
        _ => None,
    }
}

/// 输出设备
#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputKind {
    /// 按墙钟消耗数据的空设备
    Null,
    /// 写入 WAV 文件
    Wav,
}

/// 测试音的样本编码
#[derive(Clone, Copy, Debug, ValueEnum)]
enum ToneEncoding {
    S16le,
    S16be,
    U16le,
    U16be,
    S8,
    U8,
}

impl ToneEncoding {
    fn format(self, channels: u16) -> anyhow::Result<SampleFormat> {
        let (bits, signedness, endianness) = match self {
            Self::S16le => (16, Signedness::Signed, Endianness::Little),
            Self::S16be => (16, Signedness::Signed, Endianness::Big),
            Self::U16le => (16, Signedness::Unsigned, Endianness::Little),
            Self::U16be => (16, Signedness::Unsigned, Endianness::Big),
            Self::S8 => (8, Signedness::Signed, Endianness::Native),
            Self::U8 => (8, Signedness::Unsigned, Endianness::Native),
        };
        Ok(SampleFormat::new(bits, signedness, endianness, channels)?)
    }
}

/// Realtime audio output pipeline driver
#[derive(Parser)]
#[command(name = "roger-output")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Audio file to play
    #[arg(value_name = "PATH", required_unless_present = "tone")]
    file: Option<PathBuf>,

    /// Play a sine tone at this frequency (Hz) instead of a file
    #[arg(long, value_name = "HZ", conflicts_with = "file")]
    tone: Option<f64>,

    /// Tone length in seconds
    #[arg(long, default_value = "5")]
    tone_secs: u64,

    /// Tone sample encoding
    #[arg(long, value_enum, default_value = "s16le")]
    tone_format: ToneEncoding,

    /// Tone sample rate
    #[arg(long, default_value = "44100")]
    tone_rate: u32,

    /// Tone channel count (1 or 2)
    #[arg(long, default_value = "2")]
    tone_channels: u16,

    /// Output device
    #[arg(short, long, value_enum, default_value = "null")]
    output: OutputKind,

    /// Destination for the wav output
    #[arg(long, default_value = "out.wav")]
    wav_path: PathBuf,

    /// Buffer size in milliseconds
    #[arg(short, long, default_value = "2000")]
    buffer_ms: u32,

    /// Prebuffer threshold in percent of the buffer
    #[arg(short, long, default_value = "25")]
    prebuffer: u8,

    /// Playback speed (1.0 = normal)
    #[arg(long, default_value = "1.0")]
    pitch: f64,

    /// Software volume in percent
    #[arg(long, default_value = "100")]
    volume: f32,

    /// Force a device sample rate (resamples when it differs from the source)
    #[arg(long)]
    device_rate: Option<u32>,

    /// Lock the ring buffer into memory
    #[arg(long)]
    lock_memory: bool,

    /// Extra output settings as key=value (buffer_ms, pitch, volume_left, ...)
    #[arg(long = "set", value_name = "KEY=VALUE")]
    settings: Vec<String>,

    /// Show verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    let default_filter = if cli.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let config = create_engine_config(&cli)?;
    let sink: Box<dyn AudioSink> = match cli.output {
        OutputKind::Null => Box::new(NullSink::default()),
        OutputKind::Wav => Box::new(WavSink::new(&cli.wav_path)),
    };
    let mut engine = Engine::new(config, sink);

    match (&cli.file, cli.tone) {
        (Some(file), _) => {
            println!("roger-output - Loading: {}", file.display());
            engine.play_file(file)?;
        }
        (None, Some(frequency)) => {
            let format = cli.tone_format.format(cli.tone_channels)?;
            let spec = StreamSpec::new(format, cli.tone_rate)?;
            println!("roger-output - Tone {:.0} Hz, {}", frequency, spec);
            let tone = ToneSource::new(spec, frequency, 0.5).with_duration_ms(cli.tone_secs * 1000);
            engine.play(Box::new(tone))?;
        }
        (None, None) => bail!("nothing to play"),
    }

    let raw_guard = RawModeGuard::enter();
    if raw_guard.is_some() {
        println!("Controls: [space] pause/resume | [,] back 5s | [.] forward 5s | [q] quit\n");
    } else {
        println!("Press Ctrl+C to stop.\n");
    }

    play_loop(&mut engine, &running, raw_guard.is_some())?;
    drop(raw_guard);

    println!();
    engine.stop();
    if let Some(report) = engine.last_report() {
        println!("{}", report);
    }
    if let OutputKind::Wav = cli.output {
        println!("Wrote {}", cli.wav_path.display());
    }

    Ok(())
}

/// 播放循环：处理按键、刷新状态行，直到播完或被中断
fn play_loop(engine: &mut Engine, running: &AtomicBool, keyboard: bool) -> anyhow::Result<()> {
    let total_ms = engine.duration_ms().unwrap_or(0) as i64;
    let mut ticks = 0u32;

    while running.load(Ordering::SeqCst) && !engine.is_track_finished() {
        if keyboard {
            if let Some(ch) = read_char_nonblocking() {
                let position = engine.stats().position_ms;
                let result = match ch {
                    b' ' => engine.toggle_pause(),
                    b',' => engine.seek((position - SEEK_STEP_MS).max(0) as u64),
                    b'.' => engine.seek((position + SEEK_STEP_MS).max(0) as u64),
                    b'q' => break,
                    _ => Ok(()),
                };
                // 曲目恰好结束时的按键
                if let Err(e) = result {
                    log::warn!("{}", e);
                }
            }
        }

        // 每 250ms 刷新一次状态行
        if ticks % 5 == 0 {
            let stats = engine.stats();
            let state_str = match engine.state() {
                PlaybackState::Playing => "▶",
                PlaybackState::Paused => "⏸",
                PlaybackState::Buffering => "⏳",
                PlaybackState::Stopped => "⏹",
            };
            print!(
                "\r{} {} / {}  |  Buffer: {:5.1}%  |  Underruns: {}  ",
                state_str,
                format_ms(stats.position_ms),
                format_ms(total_ms),
                stats.buffer_fill_ratio * 100.0,
                stats.underrun_count
            );
            io::stdout().flush()?;
        }
        ticks = ticks.wrapping_add(1);

        std::thread::sleep(Duration::from_millis(50)); // 更快响应键盘
    }
    Ok(())
}

fn format_ms(ms: i64) -> String {
    let ms = ms.max(0);
    format!("{:02}:{:05.2}", ms / 60_000, (ms % 60_000) as f64 / 1000.0)
}

/// 创建引擎配置
fn create_engine_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let mut config = EngineConfig::default();
    let output = &mut config.output;
    output.buffer_ms = cli.buffer_ms;
    output.prebuffer_percent = cli.prebuffer;
    output.pitch = cli.pitch;
    output.left_gain = cli.volume / 100.0;
    output.right_gain = cli.volume / 100.0;
    output.device_rate = cli.device_rate;
    output.lock_memory = cli.lock_memory;

    for setting in &cli.settings {
        let (key, value) = setting
            .split_once('=')
            .with_context(|| format!("expected KEY=VALUE, got '{}'", setting))?;
        output.apply_kv(key.trim(), value.trim())?;
    }
    output.validate()?;

    Ok(config)
}
