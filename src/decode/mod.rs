//! 文件解码
//!
//! - decoder: symphonia 解码器，输出单声道 f32
//! - source: 按请求长度切块的 SampleSource

pub mod decoder;
pub mod source;

pub use decoder::{AudioDecoder, AudioInfo, DecodeError};
pub use source::DecoderSource;
