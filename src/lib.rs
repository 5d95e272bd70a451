//! slotstream
//!
//! Double-buffered sample streaming: a background producer fills two
//! alternating slots, a real-time audio callback drains them.

pub mod audio;
pub mod decode;
pub mod engine;
pub mod source;

#[cfg(feature = "cpal-host")]
pub use audio::CpalHost;
pub use audio::{
    ChannelLayout, OutputConfig, OutputHost, RefillRequest, SampleBlock, StreamBuffer,
    StreamMessage,
};
pub use engine::{Session, SessionConfig, SessionError, SessionState};
pub use source::{SampleSource, SourceError};
