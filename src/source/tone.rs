//! 波表音源
//!
//! 单声道固定频率振荡器，波表查表 + 线性插值

use std::f32::consts::PI;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{SampleSource, SourceError};
use crate::audio::block::SampleBlock;

/// 默认波表长度
pub const DEFAULT_TABLE_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Waveform {
    #[default]
    Sine,
    Square,
    Triangle,
    Sawtooth,
    /// 白噪声，不查表
    Noise,
}

impl Waveform {
    /// 一个周期内 `pos` ∈ [0, 1) 处的值
    pub fn at(self, pos: f32) -> f32 {
        match self {
            Self::Sine => (2.0 * PI * pos).sin(),
            Self::Square => {
                if pos < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            Self::Triangle => 1.0 - 4.0 * (pos - (pos + 0.5).floor()).abs(),
            Self::Sawtooth => 2.0 * (pos - (pos + 0.5).floor()),
            Self::Noise => 0.0,
        }
    }

    pub fn table(self, size: usize) -> Vec<f32> {
        (0..size)
            .map(|n| self.at(n as f32 / size as f32))
            .collect()
    }
}

impl FromStr for Waveform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sine" | "sin" => Ok(Self::Sine),
            "square" => Ok(Self::Square),
            "triangle" | "tri" => Ok(Self::Triangle),
            "sawtooth" | "saw" => Ok(Self::Sawtooth),
            "noise" => Ok(Self::Noise),
            other => Err(format!("unknown waveform: {}", other)),
        }
    }
}

pub struct ToneSource {
    waveform: Waveform,
    table: Vec<f32>,
    /// 波表内的读位置（单位：表项）
    phase: f32,
    /// 每个样本前进的表项数
    increment: f32,
    amplitude: f32,
    rng: StdRng,
}

impl ToneSource {
    /// `frequency` 必须是有限的非负数
    pub fn new(
        waveform: Waveform,
        frequency: f32,
        sample_rate: u32,
    ) -> Result<Self, SourceError> {
        Self::with_table_size(waveform, frequency, sample_rate, DEFAULT_TABLE_SIZE)
    }

    pub fn with_table_size(
        waveform: Waveform,
        frequency: f32,
        sample_rate: u32,
        table_size: usize,
    ) -> Result<Self, SourceError> {
        if !frequency.is_finite() || frequency < 0.0 {
            return Err(SourceError::InvalidParameter(format!(
                "frequency must be finite and non-negative, got {}",
                frequency
            )));
        }

        let table_size = table_size.max(2);
        let increment = frequency * table_size as f32 / sample_rate.max(1) as f32;
        Ok(Self {
            waveform,
            table: waveform.table(table_size),
            phase: 0.0,
            // 超过一整张表的步进等价于取模后的步进
            increment: increment.rem_euclid(table_size as f32),
            amplitude: 1.0,
            rng: StdRng::from_entropy(),
        })
    }

    pub fn with_amplitude(mut self, amplitude: f32) -> Self {
        self.amplitude = amplitude;
        self
    }

    /// 固定噪声种子，便于复现
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    fn next_sample(&mut self) -> f32 {
        if self.waveform == Waveform::Noise {
            return self.rng.gen_range(-1.0..=1.0) * self.amplitude;
        }

        let size = self.table.len();
        let index = self.phase as usize;
        let frac = self.phase - index as f32;
        let a = self.table[index % size];
        let b = self.table[(index + 1) % size];

        self.phase = (self.phase + self.increment).rem_euclid(size as f32);

        (a + (b - a) * frac) * self.amplitude
    }
}

impl SampleSource for ToneSource {
    fn generate(&mut self, length: usize) -> Result<SampleBlock, SourceError> {
        let samples: Vec<f32> = (0..length).map(|_| self.next_sample()).collect();
        Ok(SampleBlock::new(samples))
    }
}
