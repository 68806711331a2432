//! PCM Shared-Memory Bridge - 命令行工具
//!
//! - tone: 作为写者打开 session，按播放时钟节奏写入正弦测试音
//! - monitor: 作为消费者挂载共享段，周期性打印计数器
//! - info / unlink: 布局信息与段清理

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};

use pcm_shm_bridge::audio::format::{HwConstraints, MAX_TRANSFER_BYTES, MIN_TRANSFER_BYTES};
use pcm_shm_bridge::audio::ring_buffer::BUFFER_SIZE;
use pcm_shm_bridge::session::DEFAULT_SEGMENT_NAME;
use pcm_shm_bridge::shm::SHARED_STATE_SIZE;
use pcm_shm_bridge::{AudioFormat, ConsumerView, HwParams, SessionConfig, SharedSegment, TransportSession};

/// PCM Shared-Memory Bridge - playback transport over POSIX shared memory
#[derive(Parser)]
#[command(name = "pcm-shm-bridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Shared memory segment name
    #[arg(short, long, default_value = DEFAULT_SEGMENT_NAME, global = true)]
    segment: String,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show segment layout and the accepted stream format
    Info,

    /// Write a sine test tone as the single writer
    Tone {
        /// Tone frequency in Hz
        #[arg(short, long, default_value = "440")]
        frequency: f32,

        /// Stop after this many seconds (runs until Ctrl+C if omitted)
        #[arg(short, long)]
        duration: Option<u64>,

        /// Frames per write call
        #[arg(short, long, default_value = "1024")]
        period_frames: usize,

        /// How far ahead of the playback clock to keep the queue, in milliseconds
        #[arg(long, default_value = "200")]
        lead_ms: u64,

        /// Lock the mapped segment in memory
        #[arg(long)]
        lock_memory: bool,
    },

    /// Attach as the consumer and print counters
    Monitor {
        /// Poll interval in milliseconds
        #[arg(short, long, default_value = "500")]
        interval_ms: u64,

        /// Report the clock estimate back as played bytes (emulates a real consumer)
        #[arg(long)]
        report_played: bool,
    },

    /// Remove the named segment
    Unlink,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    match cli.command {
        Commands::Info => show_info(&cli.segment),
        Commands::Tone {
            frequency,
            duration,
            period_frames,
            lead_ms,
            lock_memory,
        } => {
            let config = SessionConfig {
                segment_name: cli.segment.clone(),
                lock_memory,
                ..SessionConfig::default()
            };
            let options = ToneOptions {
                frequency,
                duration: duration.map(Duration::from_secs),
                period_frames: period_frames.max(1),
                lead: Duration::from_millis(lead_ms),
            };
            play_tone(&config, &options)
        }
        Commands::Monitor {
            interval_ms,
            report_played,
        } => monitor(&cli.segment, Duration::from_millis(interval_ms), report_played),
        Commands::Unlink => {
            SharedSegment::unlink(&cli.segment)?;
            println!("Removed {}", cli.segment);
            Ok(())
        }
    }
}

/// 安装 Ctrl+C 处理，返回 running 标志
fn install_ctrlc() -> anyhow::Result<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;
    Ok(running)
}

/// 显示布局信息
fn show_info(segment: &str) -> anyhow::Result<()> {
    let format = AudioFormat::BRIDGE;
    let constraints = HwConstraints::bridge();

    println!("=== PCM Shared-Memory Bridge ===\n");
    println!("Segment:       {}", segment);
    println!("Segment size:  {} bytes", SHARED_STATE_SIZE);
    println!("Ring buffer:   {} bytes ({:.2}s of audio)", BUFFER_SIZE, BUFFER_SIZE as f64 / format.byte_rate() as f64);
    println!();
    println!(
        "Format:        S16_LE {}ch {}Hz interleaved, {} bytes/frame",
        format.channels,
        format.sample_rate,
        format.bytes_per_frame()
    );
    println!(
        "Period/buffer: power of two in [{}, {}] bytes",
        MIN_TRANSFER_BYTES, MAX_TRANSFER_BYTES
    );
    println!(
        "Periods:       {} - {}",
        constraints.periods.0, constraints.periods.1
    );

    match ConsumerView::attach(segment) {
        Ok(view) => println!("\nLive segment:  {}", view.snapshot()),
        Err(e) => println!("\nLive segment:  not available ({})", e),
    }

    Ok(())
}

struct ToneOptions {
    frequency: f32,
    duration: Option<Duration>,
    period_frames: usize,
    lead: Duration,
}

/// 交织立体声正弦发生器
struct ToneGenerator {
    phase: f32,
    step: f32,
    samples: Vec<i16>,
    bytes: Vec<u8>,
}

impl ToneGenerator {
    fn new(format: &AudioFormat, frequency: f32, period_frames: usize) -> Self {
        let channels = format.channels as usize;
        Self {
            phase: 0.0,
            step: 2.0 * std::f32::consts::PI * frequency / format.sample_rate as f32,
            samples: vec![0; period_frames * channels],
            bytes: vec![0; format.frames_to_bytes(period_frames)],
        }
    }

    /// 生成下一周期，返回交织字节
    fn next_period(&mut self, format: &AudioFormat) -> &[u8] {
        let channels = format.channels as usize;
        for frame in self.samples.chunks_exact_mut(channels) {
            // -12 dBFS
            let value = (self.phase.sin() * 0.25 * i16::MAX as f32) as i16;
            frame.fill(value);
            self.phase = (self.phase + self.step) % (2.0 * std::f32::consts::PI);
        }
        format.samples_to_bytes(&self.samples, &mut self.bytes);
        &self.bytes
    }
}

/// 写入测试音
///
/// 保持 queued 领先时钟估算 `lead`；环绕截断时在同一周期内补写剩余帧。
fn play_tone(config: &SessionConfig, options: &ToneOptions) -> anyhow::Result<()> {
    let running = install_ctrlc()?;

    let mut session = TransportSession::open(config, &HwParams::default())?;
    let format = *session.format();
    let mut generator = ToneGenerator::new(&format, options.frequency, options.period_frames);

    let lead_bytes = format.byte_rate() as u64 * options.lead.as_millis() as u64 / 1000;
    let period_sleep = Duration::from_micros(
        options.period_frames as u64 * 1_000_000 / format.sample_rate as u64 / 2,
    );

    println!(
        "Writing {:.1} Hz tone to {} (Ctrl+C to stop)",
        options.frequency, config.segment_name
    );

    session.prepare();
    session.start();
    let started = Instant::now();
    let mut total_bytes: u64 = 0;

    while running.load(Ordering::SeqCst) {
        if let Some(limit) = options.duration {
            if started.elapsed() >= limit {
                break;
            }
        }

        let position = session.query_position_now();
        let target = format.frames_to_bytes(position as usize) as u64 + lead_bytes;

        'fill: while total_bytes < target {
            let period = generator.next_period(&format);
            let mut offset = 0;
            while offset < options.period_frames {
                let accepted = session.write(offset, options.period_frames - offset, period);
                if accepted == 0 {
                    log::warn!("Write accepted no frames at offset {}", offset);
                    total_bytes += format.frames_to_bytes(offset) as u64;
                    break 'fill;
                }
                offset += accepted;
            }
            total_bytes += format.frames_to_bytes(offset) as u64;
        }

        std::thread::sleep(period_sleep);
    }

    session.drain();
    log::info!("{}", session.stats().report());
    session.stop();
    session.close();

    println!(
        "Stopped after {:.1}s, {} bytes written",
        started.elapsed().as_secs_f64(),
        total_bytes
    );
    Ok(())
}

/// 以消费者身份周期性打印计数器
fn monitor(segment: &str, interval: Duration, report_played: bool) -> anyhow::Result<()> {
    let running = install_ctrlc()?;
    let view = ConsumerView::attach(segment)?;
    let header = view.header();
    let format = view.format();

    println!(
        "Attached to {} ({}Hz, {} bytes/frame, {} byte ring)",
        segment, header.sample_rate, header.frame_bytes, header.capacity
    );

    while running.load(Ordering::SeqCst) {
        let snapshot = view.snapshot();
        if report_played && snapshot.running {
            // 只回报已经写入的部分
            let played = if snapshot.lead_bytes() >= 0 {
                snapshot.expected_played_bytes
            } else {
                snapshot.queued_bytes
            };
            view.report_played(played);
        }

        // 最近 100ms 的峰值
        let peak = view.recent_peak(format.byte_rate() / 10);
        println!("{} | peak: {}", snapshot, format_dbfs(peak));
        if snapshot.running && snapshot.lead_bytes() < 0 {
            log::warn!("Clock estimate is {} bytes ahead of queued data", -snapshot.lead_bytes());
        }

        std::thread::sleep(interval);
    }

    Ok(())
}

/// 峰值样本 → dBFS 文本
fn format_dbfs(peak: u16) -> String {
    if peak == 0 {
        return "-inf dBFS".to_string();
    }
    let db = 20.0 * (peak as f64 / i16::MAX as f64).log10();
    format!("{:.1} dBFS", db)
}
