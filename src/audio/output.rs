//! 输出宿主抽象
//!
//! Session 通过 [`OutputHost`] 打开输出流并注册渲染回调，
//! 不关心底层是 cpal 还是测试用的假设备

use super::render::RenderCallback;

/// 输出配置
#[derive(Clone, Debug)]
pub struct OutputConfig {
    /// 首选采样率，设备不支持时回退到设备默认值
    pub sample_rate: u32,
    /// 缓冲区帧数（会被限制在设备支持的范围内）
    pub buffer_frames: u32,
    /// 按名称（子串匹配）选择输出设备，None 表示系统默认设备
    pub device_name: Option<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            buffer_frames: 512,
            device_name: None,
        }
    }
}

/// 实际打开的输出格式
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// 固定缓冲区帧数，None 表示由设备决定
    pub buffer_frames: Option<u32>,
    pub sample_format: String,
    pub device_name: String,
}

/// 音频输出设备信息
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub default_sample_rate: Option<u32>,
    pub channels: Option<u16>,
}

/// 音频输出错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutputError {
    #[error("no default audio output device")]
    NoDevice,
    #[error("output device not found: {0}")]
    DeviceNotFound(String),
    #[error("failed to query device configuration: {0}")]
    ConfigQuery(String),
    #[error("unsupported sample format: {0}")]
    UnsupportedFormat(String),
    #[error("failed to build output stream: {0}")]
    BuildStream(String),
    #[error("failed to start output stream: {0}")]
    Play(String),
    #[error("failed to pause output stream: {0}")]
    Pause(String),
    #[error("failed to spawn output thread: {0}")]
    ThreadSpawn(String),
    #[error("output thread disconnected")]
    Disconnected,
}

/// 已打开的输出流
///
/// drop 即关闭，关闭后回调不再被调用
pub trait OutputStream: Send {
    fn play(&mut self) -> Result<(), OutputError>;
    fn pause(&mut self) -> Result<(), OutputError>;
    fn format(&self) -> &StreamFormat;
}

/// 输出宿主
///
/// `open` 必须先按设备声道数调用 [`RenderCallback::set_channels`]，
/// 再把回调交给音频线程
pub trait OutputHost: Send + Sync + 'static {
    type Stream: OutputStream;

    fn open(
        &self,
        config: &OutputConfig,
        callback: RenderCallback,
    ) -> Result<Self::Stream, OutputError>;
}
