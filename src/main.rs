//! slotstream - 双缓冲流式播放
//!
//! 后台生产者按块生成样本，实时回调交替消费两个槽位

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use slotstream::audio::{CpalHost, OutputConfig};
use slotstream::decode::DecoderSource;
use slotstream::source::{SampleSource, ToneSource, Waveform};
use slotstream::{ChannelLayout, Session, SessionConfig};

/// slotstream - double-buffered sample streaming
#[derive(Parser)]
#[command(name = "slotstream")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Samples per block handed from the producer to the audio callback
    #[arg(short, long, default_value = "1024")]
    block_length: usize,

    /// Output gain applied in the audio callback
    #[arg(short, long, default_value = "0.1")]
    gain: f32,

    /// Preferred device sample rate
    #[arg(long, default_value = "48000")]
    sample_rate: u32,

    /// Device buffer size in frames
    #[arg(long, default_value = "512")]
    buffer_frames: u32,

    /// Select output device by name (use 'info' command to list devices)
    #[arg(short, long)]
    device: Option<String>,

    /// Run the sample source on its own thread
    #[arg(long)]
    delegated: bool,

    /// Print stream statistics on exit
    #[arg(long)]
    stats: bool,

    /// Show verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show audio device information
    Info,

    /// Play a generated tone
    Tone {
        /// sine, square, triangle, sawtooth, noise
        #[arg(short, long, default_value = "sine")]
        waveform: Waveform,

        /// Frequency in Hz
        #[arg(short, long, default_value = "440", value_parser = parse_frequency)]
        frequency: f32,

        /// Stop after N seconds (default: until Ctrl+C)
        #[arg(long)]
        seconds: Option<u64>,
    },

    /// Play an audio file
    Play {
        /// Audio file to play
        file: PathBuf,

        /// Loop the file until Ctrl+C
        #[arg(short, long)]
        repeat: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    let default_filter = if cli.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    match cli.command {
        Commands::Info => show_device_info(),
        Commands::Tone {
            waveform,
            frequency,
            seconds,
        } => play_tone(&cli, waveform, frequency, seconds),
        Commands::Play { ref file, repeat } => play_file(&cli, file, repeat),
    }
}

/// 显示设备信息
fn show_device_info() -> anyhow::Result<()> {
    println!("=== Audio Output Devices ===\n");

    let devices = CpalHost::list_devices()?;
    if devices.is_empty() {
        println!("(no output devices)");
    }
    for device in &devices {
        let default_mark = if device.is_default { " *" } else { "" };
        let rate = device
            .default_sample_rate
            .map(|r| format!("{}Hz", r))
            .unwrap_or_else(|| "?".to_string());
        let channels = device
            .channels
            .map(|c| format!("{}ch", c))
            .unwrap_or_else(|| "?".to_string());
        println!("{} ({} {}){}", device.name, rate, channels, default_mark);
    }

    println!();
    println!("* = system default");
    println!("Select device: slotstream -d <NAME> tone");
    Ok(())
}

fn parse_frequency(s: &str) -> Result<f32, String> {
    let frequency: f32 = s.parse().map_err(|e| format!("{}", e))?;
    if !frequency.is_finite() || frequency < 0.0 {
        return Err(format!("expected a finite, non-negative frequency, got {}", s));
    }
    Ok(frequency)
}

fn session_config(cli: &Cli) -> SessionConfig {
    SessionConfig {
        block_length: cli.block_length.max(1),
        gain: cli.gain,
        // 所有内置音源都是单声道
        layout: ChannelLayout::Duplicated,
        output: OutputConfig {
            sample_rate: cli.sample_rate,
            buffer_frames: cli.buffer_frames,
            device_name: cli.device.clone(),
        },
        ..Default::default()
    }
}

fn install_source<S: SampleSource>(
    session: &Session<CpalHost>,
    source: S,
    delegated: bool,
) -> anyhow::Result<()> {
    if delegated {
        session.set_delegated_source(source)?;
    } else {
        session.set_source(source)?;
    }
    Ok(())
}

fn ctrlc_flag() -> anyhow::Result<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;
    Ok(running)
}

fn play_tone(
    cli: &Cli,
    waveform: Waveform,
    frequency: f32,
    seconds: Option<u64>,
) -> anyhow::Result<()> {
    let running = ctrlc_flag()?;
    let session = Session::with_default_host(session_config(cli));
    session.initialize()?;

    let format = session
        .format()
        .ok_or_else(|| anyhow::anyhow!("output stream not available"))?;
    println!(
        "Playing {:?} {}Hz on '{}' ({}Hz {}ch). Press Ctrl+C to stop.",
        waveform, frequency, format.device_name, format.sample_rate, format.channels
    );

    install_source(
        &session,
        ToneSource::new(waveform, frequency, format.sample_rate)?,
        cli.delegated,
    )?;
    session.resume()?;

    let deadline = seconds.map(|s| std::time::Instant::now() + Duration::from_secs(s));
    run_until(&session, &running, || {
        deadline.is_some_and(|d| std::time::Instant::now() >= d)
    });

    finish(&session, cli.stats);
    Ok(())
}

fn play_file(cli: &Cli, file: &Path, repeat: bool) -> anyhow::Result<()> {
    let running = ctrlc_flag()?;
    let source = DecoderSource::open(file, repeat)?;
    let info = source.info().clone();
    let finished = source.finished_flag();

    let session = Session::with_default_host(session_config(cli));
    session.initialize()?;

    let format = session
        .format()
        .ok_or_else(|| anyhow::anyhow!("output stream not available"))?;
    if format.sample_rate != info.sample_rate {
        log::warn!(
            "File sample rate {}Hz differs from device {}Hz, playback speed will be off",
            info.sample_rate,
            format.sample_rate
        );
    }

    println!(
        "Playing {} ({} {}Hz {}ch). Press Ctrl+C to stop.",
        file.display(),
        info.codec,
        info.sample_rate,
        info.channels
    );

    install_source(&session, source, cli.delegated)?;
    session.resume()?;

    run_until(&session, &running, || finished.load(Ordering::Acquire));
    // 最后一块可能还排在另一个槽位里
    let horizon = session.playback_horizon();
    run_until(&session, &running, || {
        session.stream_stats().samples_played() >= horizon
    });

    finish(&session, cli.stats);
    Ok(())
}

/// 每 100ms 刷新一次状态行，直到 Ctrl+C 或 `done` 返回 true
fn run_until(session: &Session<CpalHost>, running: &AtomicBool, mut done: impl FnMut() -> bool) {
    while running.load(Ordering::SeqCst) && !done() {
        let stats = session.stream_stats();
        print!(
            "\rBuffered: {:>6} samples | Played: {:>10} | Underruns: {:>4} | Failures: {:>3}",
            session.buffer().buffered_samples(),
            stats.samples_played(),
            stats.underrun_count(),
            stats.producer_failures()
        );
        let _ = std::io::stdout().flush();
        std::thread::sleep(Duration::from_millis(100));
    }
}

fn finish(session: &Session<CpalHost>, print_stats: bool) {
    println!();
    if let Err(e) = session.suspend() {
        log::warn!("Failed to suspend output: {}", e);
    }
    if print_stats {
        println!("\n{}", session.stats());
    }
    session.stop();
}
