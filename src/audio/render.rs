//! 实时渲染回调
//!
//! 宿主音频线程每个周期调用一次 [`RenderCallback::render`]，
//! 从 StreamBuffer 逐个取样写入输出缓冲区。
//!
//! 此路径上绝对不能：加锁、分配内存、阻塞、打日志

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use dasp_sample::{FromSample, Sample as DeviceSample};

use super::stats::StreamStats;
use super::stream_buffer::StreamBuffer;

/// 多声道输出时样本如何分配到各声道
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelLayout {
    /// 每个输出位置（所有声道）各取一个样本，块内容按交错格式解释
    #[default]
    Interleaved,
    /// 每帧只取一个样本，复制到所有声道（单声道源）
    Duplicated,
}

/// 运行标志，暂停时回调输出静音且不消费样本
pub type RunningFlag = Arc<CachePadded<AtomicBool>>;

pub fn running_flag(initial: bool) -> RunningFlag {
    Arc::new(CachePadded::new(AtomicBool::new(initial)))
}

/// 实时消费端
///
/// 除 StreamBuffer 之外不保留跨周期状态
pub struct RenderCallback {
    buffer: Arc<StreamBuffer>,
    stats: Arc<StreamStats>,
    running: RunningFlag,
    gain: f32,
    channels: usize,
    layout: ChannelLayout,
}

impl RenderCallback {
    pub fn new(buffer: Arc<StreamBuffer>, stats: Arc<StreamStats>, running: RunningFlag) -> Self {
        Self {
            buffer,
            stats,
            running,
            gain: 1.0,
            channels: 1,
            layout: ChannelLayout::default(),
        }
    }

    pub fn with_gain(mut self, gain: f32) -> Self {
        self.gain = gain;
        self
    }

    pub fn with_layout(mut self, layout: ChannelLayout) -> Self {
        self.layout = layout;
        self
    }

    /// 由输出宿主在确定设备声道数后设置
    pub fn set_channels(&mut self, channels: usize) {
        self.channels = channels.max(1);
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// 填满一个输出周期
    ///
    /// `output` 为交错格式，长度 = 帧数 × 声道数
    #[inline]
    pub fn render<T>(&mut self, output: &mut [T])
    where
        T: DeviceSample + FromSample<f32>,
    {
        self.stats.on_callback(&self.buffer);

        if !self.running.load(Ordering::Acquire) {
            output.fill(T::EQUILIBRIUM);
            return;
        }

        let mut silent = 0usize;
        let mut drained = 0usize;

        match self.layout {
            ChannelLayout::Interleaved => {
                for out in output.iter_mut() {
                    *out = self.next_value(&mut drained, &mut silent);
                }
            }
            ChannelLayout::Duplicated => {
                for frame in output.chunks_mut(self.channels) {
                    let value: T = self.next_value(&mut drained, &mut silent);
                    frame.fill(value);
                }
            }
        }

        if silent > 0 {
            self.stats.record_underrun(silent);
        }
        self.stats.add_samples_played(drained as u64);
    }

    #[inline]
    fn next_value<T>(&self, drained: &mut usize, silent: &mut usize) -> T
    where
        T: DeviceSample + FromSample<f32>,
    {
        match self.buffer.drain_sample() {
            Some(sample) => {
                *drained += 1;
                T::from_sample(sample * self.gain)
            }
            None => {
                *silent += 1;
                T::EQUILIBRIUM
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::block::{RefillRequest, SampleBlock};

    fn setup(values: &[f32], running: bool) -> (RenderCallback, Arc<StreamBuffer>, Arc<StreamStats>) {
        let buffer = Arc::new(StreamBuffer::default());
        let stats = Arc::new(StreamStats::new());
        if !values.is_empty() {
            buffer.fill(0, SampleBlock::from(values)).unwrap();
        }
        let callback = RenderCallback::new(
            Arc::clone(&buffer),
            Arc::clone(&stats),
            running_flag(running),
        );
        (callback, buffer, stats)
    }

    #[test]
    fn test_interleaved_drains_every_position() {
        let (mut callback, buffer, stats) = setup(&[1.0, 2.0, 3.0, 4.0], true);
        callback.set_channels(2);

        let mut out = [0.0f32; 4];
        callback.render(&mut out);

        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(
            buffer.take_request(),
            Some(RefillRequest { slot: 0, length: 4 })
        );
        assert_eq!(stats.samples_played(), 4);
        assert_eq!(stats.underrun_count(), 0);
    }

    #[test]
    fn test_duplicated_copies_frame() {
        let (callback, _buffer, _stats) = setup(&[0.5, -0.5], true);
        let mut callback = callback.with_layout(ChannelLayout::Duplicated);
        callback.set_channels(2);

        let mut out = [0.0f32; 4];
        callback.render(&mut out);
        assert_eq!(out, [0.5, 0.5, -0.5, -0.5]);
    }

    #[test]
    fn test_gain_applied() {
        let (callback, _buffer, _stats) = setup(&[1.0, -1.0], true);
        let mut callback = callback.with_gain(0.1);

        let mut out = [0.0f32; 2];
        callback.render(&mut out);
        assert!((out[0] - 0.1).abs() < 1e-6);
        assert!((out[1] + 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_underrun_outputs_silence() {
        let (mut callback, buffer, stats) = setup(&[0.25, 0.25], true);

        let mut out = [1.0f32; 6];
        callback.render(&mut out);

        assert_eq!(out, [0.25, 0.25, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(stats.underrun_count(), 1);
        assert_eq!(stats.silent_samples(), 4);
        assert_eq!(stats.samples_played(), 2);
        // 静音期间不再发请求
        assert_eq!(buffer.take_request().map(|r| r.slot), Some(0));
        assert_eq!(buffer.take_request(), None);
    }

    #[test]
    fn test_paused_does_not_drain() {
        let (mut callback, buffer, stats) = setup(&[1.0, 2.0], false);

        let mut out = [9.0f32; 4];
        callback.render(&mut out);

        assert_eq!(out, [0.0; 4]);
        assert_eq!(stats.samples_played(), 0);
        assert_eq!(buffer.buffered_samples(), 2);
    }

    #[test]
    fn test_integer_formats_silence() {
        let (mut callback, _buffer, _stats) = setup(&[], true);

        let mut out_i16 = [7i16; 4];
        callback.render(&mut out_i16);
        assert_eq!(out_i16, [0; 4]);

        let mut out_u16 = [7u16; 4];
        callback.render(&mut out_u16);
        assert_eq!(out_u16, [32768; 4]);
    }

    #[test]
    fn test_integer_format_conversion() {
        let (mut callback, _buffer, _stats) = setup(&[1.0, -1.0], true);

        let mut out = [0i16; 2];
        callback.render(&mut out);
        assert!(out[0] > 32_000);
        assert!(out[1] < -32_000);
    }
}
