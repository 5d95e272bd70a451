//! 单调时钟
//!
//! 以进程内第一次调用为纪元，返回纳秒。统计模块在回调里采样用

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// 提前固定纪元，避免第一次初始化落在音频回调里
pub fn init() {
    EPOCH.get_or_init(Instant::now);
}

/// 自纪元起的纳秒数，始终 > 0
#[inline]
pub fn now_ns() -> u64 {
    let elapsed = EPOCH.get_or_init(Instant::now).elapsed();
    (elapsed.as_nanos() as u64).max(1)
}

#[inline]
pub fn ns_to_ms(ns: u64) -> f64 {
    ns as f64 / 1_000_000.0
}
