//! 样本生产者
//!
//! 任何能按需生成指定长度样本块的东西都是 [`SampleSource`]。
//! 生成可以很慢，只在非实时线程上调用

mod delegated;
mod tone;

pub use delegated::DelegatedSource;
pub use tone::{ToneSource, Waveform};

use crate::audio::block::SampleBlock;

/// 生成失败
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("sample generation failed: {0}")]
    Failed(String),
    #[error("invalid source parameter: {0}")]
    InvalidParameter(String),
    #[error("sample source exhausted")]
    Exhausted,
    #[error("sample source worker disconnected")]
    Disconnected,
}

/// 样本生产者
pub trait SampleSource: Send + 'static {
    /// 生成 `length` 个样本
    ///
    /// 返回的长度应等于 `length`，不等时由桥接线程记录警告后照常使用
    fn generate(&mut self, length: usize) -> Result<SampleBlock, SourceError>;
}

impl<F> SampleSource for F
where
    F: FnMut(usize) -> Result<SampleBlock, SourceError> + Send + 'static,
{
    fn generate(&mut self, length: usize) -> Result<SampleBlock, SourceError> {
        self(length)
    }
}

/// 一次生成的结果，交回桥接线程写入对应槽位
#[derive(Debug)]
pub struct Completion {
    pub slot: usize,
    pub length: usize,
    pub result: Result<SampleBlock, SourceError>,
}
