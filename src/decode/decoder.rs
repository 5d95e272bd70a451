//! 音频文件解码器
//!
//! 使用 symphonia 解码，输出单声道 f32（多声道取平均）。
//! 支持：FLAC, WAV, AIFF, MP3

use std::fs::File;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// 解码错误
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),
    #[error("unsupported audio format")]
    UnsupportedFormat,
    #[error("no audio track found")]
    NoAudioTrack,
    #[error("failed to create decoder: {0}")]
    DecoderCreation(String),
    #[error("decode failed: {0}")]
    DecodeFailed(String),
    #[error("seek failed: {0}")]
    SeekFailed(String),
}

/// 音频文件信息
#[derive(Debug, Clone)]
pub struct AudioInfo {
    pub sample_rate: u32,
    pub channels: u32,
    /// 位深度（原始格式）
    pub bit_depth: Option<u32>,
    pub total_frames: Option<u64>,
    pub duration_secs: Option<f64>,
    /// 格式名称（取自扩展名）
    pub format: String,
    pub codec: String,
}

/// 音频文件解码器
pub struct AudioDecoder {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    info: AudioInfo,
    /// 交错 f32 中间缓冲区，按需扩容后复用
    interleaved: Option<SampleBuffer<f32>>,
    mono: Vec<f32>,
}

impl AudioDecoder {
    /// 打开音频文件
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DecodeError> {
        let path = path.as_ref();

        let file = File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

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

        let codec = symphonia::default::get_codecs()
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
            codec,
        };

        let decoder = symphonia::default::get_codecs()
            .make(codec_params, &DecoderOptions::default())
            .map_err(|e| DecodeError::DecoderCreation(e.to_string()))?;

        Ok(Self {
            reader,
            decoder,
            track_id,
            info,
            interleaved: None,
            mono: Vec::with_capacity(8192),
        })
    }

    pub fn info(&self) -> &AudioInfo {
        &self.info
    }

    /// 解码下一个 packet 并下混为单声道
    ///
    /// 返回空切片表示文件结束
    pub fn decode_next_mono(&mut self) -> Result<&[f32], DecodeError> {
        loop {
            let packet = match self.reader.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    self.mono.clear();
                    return Ok(&self.mono);
                }
                Err(e) => return Err(DecodeError::DecodeFailed(e.to_string())),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::DecodeError(_)) => continue, // 跳过损坏的帧
                Err(e) => return Err(DecodeError::DecodeFailed(e.to_string())),
            };

            let spec = *decoded.spec();
            let channels = spec.channels.count().max(1);
            let frames = decoded.frames();
            if frames == 0 {
                continue;
            }

            let needed = decoded.capacity() * channels;
            let reuse = self
                .interleaved
                .as_ref()
                .is_some_and(|buf| buf.capacity() >= needed);
            if !reuse {
                self.interleaved = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
            }
            let Some(interleaved) = self.interleaved.as_mut() else {
                continue;
            };
            interleaved.copy_interleaved_ref(decoded);

            self.mono.clear();
            self.mono.extend(
                interleaved
                    .samples()
                    .chunks_exact(channels)
                    .map(|frame| frame.iter().sum::<f32>() / channels as f32),
            );
            return Ok(&self.mono);
        }
    }

    /// 回到文件开头
    pub fn rewind(&mut self) -> Result<(), DecodeError> {
        self.reader
            .seek(
                SeekMode::Accurate,
                SeekTo::TimeStamp {
                    ts: 0,
                    track_id: self.track_id,
                },
            )
            .map_err(|e| DecodeError::SeekFailed(e.to_string()))?;

        // 重置解码器状态
        self.decoder.reset();
        Ok(())
    }
}
