//! cpal 输出宿主
//!
//! cpal::Stream 在部分平台上不是 Send，所以由专门的 "audio-output" 线程持有，
//! 其它线程通过命令通道控制 play / pause / close

use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleFormat, SizedSample, StreamConfig, SupportedBufferSize};
use dasp_sample::FromSample;

use super::output::{DeviceInfo, OutputConfig, OutputError, OutputHost, OutputStream, StreamFormat};
use super::render::RenderCallback;

/// 系统默认 cpal 宿主
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalHost;

impl CpalHost {
    /// 列出所有输出设备
    pub fn list_devices() -> Result<Vec<DeviceInfo>, OutputError> {
        let host = cpal::default_host();
        let default_name = host
            .default_output_device()
            .and_then(|d| d.name().ok());

        let devices = host
            .output_devices()
            .map_err(|e| OutputError::ConfigQuery(e.to_string()))?;

        let mut infos = Vec::new();
        for device in devices {
            let name = device
                .name()
                .unwrap_or_else(|_| "Unknown device".to_string());
            let default_config = device.default_output_config().ok();
            infos.push(DeviceInfo {
                is_default: default_name.as_deref() == Some(name.as_str()),
                default_sample_rate: default_config.as_ref().map(|c| c.sample_rate().0),
                channels: default_config.as_ref().map(|c| c.channels()),
                name,
            });
        }
        Ok(infos)
    }
}

impl OutputHost for CpalHost {
    type Stream = CpalStream;

    fn open(
        &self,
        config: &OutputConfig,
        callback: RenderCallback,
    ) -> Result<CpalStream, OutputError> {
        let (commands, command_rx) = mpsc::channel::<StreamCommand>();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<StreamFormat, OutputError>>(1);
        let config = config.clone();

        let thread = thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || output_thread_main(config, callback, command_rx, ready_tx))
            .map_err(|e| OutputError::ThreadSpawn(e.to_string()))?;

        let format = match ready_rx.recv() {
            Ok(Ok(format)) => format,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(OutputError::Disconnected);
            }
        };

        Ok(CpalStream {
            commands,
            thread: Some(thread),
            format,
        })
    }
}

enum StreamCommand {
    Play(SyncSender<Result<(), OutputError>>),
    Pause(SyncSender<Result<(), OutputError>>),
    Close,
}

/// 由 "audio-output" 线程持有的 cpal 流的句柄
pub struct CpalStream {
    commands: Sender<StreamCommand>,
    thread: Option<JoinHandle<()>>,
    format: StreamFormat,
}

impl CpalStream {
    fn request(
        &self,
        make: fn(SyncSender<Result<(), OutputError>>) -> StreamCommand,
    ) -> Result<(), OutputError> {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.commands
            .send(make(reply_tx))
            .map_err(|_| OutputError::Disconnected)?;
        reply_rx.recv().map_err(|_| OutputError::Disconnected)?
    }
}

impl OutputStream for CpalStream {
    fn play(&mut self) -> Result<(), OutputError> {
        self.request(StreamCommand::Play)
    }

    fn pause(&mut self) -> Result<(), OutputError> {
        self.request(StreamCommand::Pause)
    }

    fn format(&self) -> &StreamFormat {
        &self.format
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        let _ = self.commands.send(StreamCommand::Close);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn output_thread_main(
    config: OutputConfig,
    callback: RenderCallback,
    commands: Receiver<StreamCommand>,
    ready: SyncSender<Result<StreamFormat, OutputError>>,
) {
    let (stream, format) = match open_stream(&config, callback) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    log::info!(
        "Output stream open: '{}' {}Hz {}ch {} (buffer: {})",
        format.device_name,
        format.sample_rate,
        format.channels,
        format.sample_format,
        format
            .buffer_frames
            .map(|f| format!("{} frames", f))
            .unwrap_or_else(|| "device default".to_string())
    );

    if ready.send(Ok(format)).is_err() {
        return;
    }

    for command in commands {
        match command {
            StreamCommand::Play(reply) => {
                let result = stream
                    .play()
                    .map_err(|e| OutputError::Play(e.to_string()));
                let _ = reply.send(result);
            }
            StreamCommand::Pause(reply) => {
                let result = stream
                    .pause()
                    .map_err(|e| OutputError::Pause(e.to_string()));
                let _ = reply.send(result);
            }
            StreamCommand::Close => break,
        }
    }

    drop(stream);
    log::info!("Output stream closed");
}

fn open_stream(
    config: &OutputConfig,
    mut callback: RenderCallback,
) -> Result<(cpal::Stream, StreamFormat), OutputError> {
    let host = cpal::default_host();
    let device = select_device(&host, config.device_name.as_deref())?;
    let device_name = device
        .name()
        .unwrap_or_else(|_| "Unknown device".to_string());

    let (stream_config, sample_format) = select_config(&device, config)?;
    callback.set_channels(stream_config.channels as usize);

    let format = StreamFormat {
        sample_rate: stream_config.sample_rate.0,
        channels: stream_config.channels,
        buffer_frames: match stream_config.buffer_size {
            BufferSize::Fixed(frames) => Some(frames),
            BufferSize::Default => None,
        },
        sample_format: format!("{:?}", sample_format),
        device_name,
    };

    let stream = match sample_format {
        SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, callback)?,
        SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, callback)?,
        SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, callback)?,
        other => return Err(OutputError::UnsupportedFormat(format!("{:?}", other))),
    };

    // 部分后端 build 后即开始回调，统一先暂停，由 Session 决定何时播放
    if let Err(e) = stream.pause() {
        log::debug!("Initial pause not supported by backend: {}", e);
    }

    Ok((stream, format))
}

fn select_device(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device, OutputError> {
    let Some(wanted) = name else {
        return host.default_output_device().ok_or(OutputError::NoDevice);
    };

    let devices = host
        .output_devices()
        .map_err(|e| OutputError::ConfigQuery(e.to_string()))?;
    let wanted_lower = wanted.to_lowercase();
    for device in devices {
        if let Ok(device_name) = device.name() {
            if device_name.to_lowercase().contains(&wanted_lower) {
                return Ok(device);
            }
        }
    }
    Err(OutputError::DeviceNotFound(wanted.to_string()))
}

/// 优先选择支持首选采样率的 F32/I16/U16 配置，否则回退到设备默认配置
fn select_config(
    device: &cpal::Device,
    config: &OutputConfig,
) -> Result<(StreamConfig, SampleFormat), OutputError> {
    let preferred = cpal::SampleRate(config.sample_rate);

    if let Ok(ranges) = device.supported_output_configs() {
        let mut candidates: Vec<_> = ranges
            .filter(|range| {
                matches!(
                    range.sample_format(),
                    SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16
                ) && range.min_sample_rate() <= preferred
                    && range.max_sample_rate() >= preferred
            })
            .collect();
        // f32 优先，省去整数转换
        candidates.sort_by_key(|range| range.sample_format() != SampleFormat::F32);

        if let Some(range) = candidates.into_iter().next() {
            let supported = range.with_sample_rate(preferred);
            let sample_format = supported.sample_format();
            let mut stream_config = supported.config();
            stream_config.buffer_size = choose_buffer_size(supported.buffer_size(), config.buffer_frames);
            return Ok((stream_config, sample_format));
        }
    }

    let supported = device
        .default_output_config()
        .map_err(|e| OutputError::ConfigQuery(e.to_string()))?;
    log::info!(
        "Preferred sample rate {}Hz not available, using device default {}Hz",
        config.sample_rate,
        supported.sample_rate().0
    );
    let sample_format = supported.sample_format();
    let mut stream_config = supported.config();
    stream_config.buffer_size = choose_buffer_size(supported.buffer_size(), config.buffer_frames);
    Ok((stream_config, sample_format))
}

fn choose_buffer_size(supported: &SupportedBufferSize, desired: u32) -> BufferSize {
    match *supported {
        SupportedBufferSize::Range { min, max } => BufferSize::Fixed(desired.clamp(min, max)),
        SupportedBufferSize::Unknown => BufferSize::Default,
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut callback: RenderCallback,
) -> Result<cpal::Stream, OutputError>
where
    T: SizedSample + FromSample<f32>,
{
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| callback.render(data),
            |err| log::error!("Output stream error: {}", err),
            None,
        )
        .map_err(|e| OutputError::BuildStream(e.to_string()))
}
