//! 样本块与流消息
//!
//! 生产者和实时回调之间交换的数据单位：
//! - `SampleBlock`：不可变的样本块，交给 StreamBuffer 后只读
//! - `RefillRequest`：槽位耗尽后发出的补充请求（`Copy`，可放进无锁队列）
//! - `StreamMessage`：请求 / 填充两种消息，委托生成线程的通信格式

/// 单个样本（浮点振幅）
pub type Sample = f32;

/// 双缓冲槽位数
pub const SLOT_COUNT: usize = 2;

/// 不可变样本块
///
/// 构造后不提供任何可变访问，保证消费端读取期间内容不变
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SampleBlock {
    samples: Box<[Sample]>,
}

impl SampleBlock {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self {
            samples: samples.into_boxed_slice(),
        }
    }

    /// 全零（静音）块
    pub fn silence(len: usize) -> Self {
        Self::new(vec![0.0; len])
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[Sample] {
        &self.samples
    }

    pub fn into_vec(self) -> Vec<Sample> {
        self.samples.into_vec()
    }
}

impl From<Vec<Sample>> for SampleBlock {
    fn from(samples: Vec<Sample>) -> Self {
        Self::new(samples)
    }
}

impl From<&[Sample]> for SampleBlock {
    fn from(samples: &[Sample]) -> Self {
        Self::new(samples.to_vec())
    }
}

/// 槽位补充请求
///
/// `length` 是刚耗尽的块长度，生产者应生成同样长度的新块
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefillRequest {
    pub slot: usize,
    pub length: usize,
}

/// 流消息
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    /// 实时侧 → 生产者
    RefillRequest { slot: usize, length: usize },
    /// 生产者 → StreamBuffer
    Fill { slot: usize, block: SampleBlock },
}

impl From<RefillRequest> for StreamMessage {
    fn from(request: RefillRequest) -> Self {
        Self::RefillRequest {
            slot: request.slot,
            length: request.length,
        }
    }
}
