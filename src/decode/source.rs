//! 文件音源
//!
//! 把解码器的 packet 流切成请求长度的块，跨块的余量留在 `pending` 里

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::decoder::{AudioDecoder, AudioInfo, DecodeError};
use crate::audio::block::SampleBlock;
use crate::source::{SampleSource, SourceError};

pub struct DecoderSource {
    decoder: AudioDecoder,
    pending: Vec<f32>,
    looping: bool,
    eof: bool,
    finished: Arc<AtomicBool>,
}

impl DecoderSource {
    pub fn open<P: AsRef<Path>>(path: P, looping: bool) -> Result<Self, DecodeError> {
        let decoder = AudioDecoder::open(path)?;
        let info = decoder.info();
        log::info!(
            "Format: {} | Codec: {} | {}Hz {}ch {}bit | Duration: {:.1}s",
            info.format,
            info.codec,
            info.sample_rate,
            info.channels,
            info.bit_depth.unwrap_or(0),
            info.duration_secs.unwrap_or(0.0)
        );
        Ok(Self::new(decoder, looping))
    }

    pub fn new(decoder: AudioDecoder, looping: bool) -> Self {
        Self {
            decoder,
            pending: Vec::new(),
            looping,
            eof: false,
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn info(&self) -> &AudioInfo {
        self.decoder.info()
    }

    /// 所有样本都已交出后置位
    pub fn finished_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.finished)
    }

    fn decode_until(&mut self, length: usize) -> Result<(), DecodeError> {
        // 连续两次回绕仍无数据说明文件为空
        let mut empty_rewinds = 0;
        while self.pending.len() < length && !self.eof {
            let decoded = self.decoder.decode_next_mono()?;
            if !decoded.is_empty() {
                self.pending.extend_from_slice(decoded);
                empty_rewinds = 0;
                continue;
            }

            if self.looping && empty_rewinds < 2 {
                log::debug!("End of file reached, looping");
                self.decoder.rewind()?;
                empty_rewinds += 1;
            } else {
                log::info!("Decoder reached end of file");
                self.eof = true;
            }
        }
        Ok(())
    }
}

impl SampleSource for DecoderSource {
    fn generate(&mut self, length: usize) -> Result<SampleBlock, SourceError> {
        self.decode_until(length)
            .map_err(|e| SourceError::Failed(e.to_string()))?;

        if self.pending.is_empty() {
            self.finished.store(true, Ordering::Release);
            return Err(SourceError::Exhausted);
        }

        let take = length.min(self.pending.len());
        let mut samples: Vec<f32> = self.pending.drain(..take).collect();
        // 文件末尾不足一块时补零
        samples.resize(length, 0.0);
        Ok(SampleBlock::new(samples))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::decoder::tests::write_wav;

    #[test]
    fn test_blocks_span_packets() {
        let samples: Vec<i16> = (0..1000).map(|i| i as i16).collect();
        let path = write_wav("blocks", 1, 8_000, &samples);
        let mut source = DecoderSource::open(&path, false).unwrap();

        let mut collected = Vec::new();
        for _ in 0..3 {
            let block = source.generate(300).unwrap();
            assert_eq!(block.len(), 300);
            collected.extend(block.into_vec());
        }
        let last = source.generate(300).unwrap();
        assert_eq!(last.len(), 300);
        // 最后一块只有 100 个有效样本，其余补零
        assert!(last.as_slice()[100..].iter().all(|&s| s == 0.0));
        collected.extend_from_slice(&last.as_slice()[..100]);

        for (i, s) in collected.iter().enumerate() {
            assert!((s - i as f32 / 32768.0).abs() < 1e-6);
        }

        assert_eq!(source.generate(300), Err(SourceError::Exhausted));
        assert!(source.finished_flag().load(Ordering::Acquire));

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_looping_never_exhausts() {
        let path = write_wav("looping", 1, 8_000, &[8192; 40]);
        let mut source = DecoderSource::open(&path, true).unwrap();

        for _ in 0..10 {
            let block = source.generate(64).unwrap();
            assert!(block.as_slice().iter().all(|&s| (s - 0.25).abs() < 1e-4));
        }
        assert!(!source.finished_flag().load(Ordering::Acquire));

        let _ = std::fs::remove_file(path);
    }
}
