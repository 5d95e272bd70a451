//! 音频核心模块
//!
//! 包含：
//! - Block: 样本块与流消息
//! - Ring Buffer: Lock-free 请求队列
//! - Stream Buffer: 双缓冲交接
//! - Render: 实时渲染回调
//! - Timing / Stats: 回调统计
//! - Output: 输出宿主抽象与 cpal 实现

pub mod block;
#[cfg(feature = "cpal-host")]
pub mod cpal_host;
pub mod output;
pub mod render;
pub mod ring_buffer;
pub mod stats;
pub mod stream_buffer;
pub mod timing;

pub use block::{RefillRequest, Sample, SampleBlock, StreamMessage, SLOT_COUNT};
#[cfg(feature = "cpal-host")]
pub use cpal_host::{CpalHost, CpalStream};
pub use output::{DeviceInfo, OutputConfig, OutputError, OutputHost, OutputStream, StreamFormat};
pub use render::{ChannelLayout, RenderCallback};
pub use ring_buffer::RingBuffer;
pub use stats::{StatsReport, StreamStats};
pub use stream_buffer::{FillError, SlotState, StreamBuffer};
