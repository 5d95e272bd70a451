//! 双缓冲样本交接
//!
//! 两个槽位轮流使用：实时回调从 active 槽逐个取样，
//! 取到块末尾时把该槽标记为空、切换到另一个槽，并发出一个补充请求。
//! 生产者在非实时线程上调用 [`StreamBuffer::fill`] 写入新块。
//!
//! 槽位状态机（每个槽一个 `AtomicU8`）：
//!
//! ```text
//! Empty ──fill──▶ Writing ──▶ Ready ──首次取样──▶ Draining ──取完──▶ Empty
//!                    ▲          │
//!                    └──fill────┘   (覆盖，后写者胜)
//! ```
//!
//! 约束：
//! - `drain_sample` 只能由一个消费者（实时回调）调用
//! - `take_request` 只能由一个线程（桥接线程）调用
//! - 实时侧从不释放内存：被替换的旧块在 `fill` 的调用线程上析构

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::thread::Thread;

use crossbeam_utils::{Backoff, CachePadded};

use super::block::{RefillRequest, Sample, SampleBlock, StreamMessage, SLOT_COUNT};
use super::ring_buffer::RingBuffer;

const EMPTY: u8 = 0;
const WRITING: u8 = 1;
const READY: u8 = 2;
const DRAINING: u8 = 3;

/// 默认请求队列容量
///
/// 协议保证同时最多有两个未处理请求，4 留出余量
pub const DEFAULT_REQUEST_CAPACITY: usize = 4;

/// 槽位状态（诊断用快照）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Writing,
    Ready,
    Draining,
}

impl SlotState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            WRITING => Self::Writing,
            READY => Self::Ready,
            DRAINING => Self::Draining,
            _ => Self::Empty,
        }
    }
}

/// 填充失败（协议误用）
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FillError {
    #[error("slot index {0} out of range (expected 0 or 1)")]
    InvalidSlot(usize),
    #[error("refusing to store an empty block in slot {slot}")]
    EmptyBlock { slot: usize },
    #[error("slot {slot} is being drained by the render callback")]
    SlotDraining { slot: usize },
    #[error("refill request for slot {slot} delivered to the stream buffer")]
    UnexpectedRequest { slot: usize },
}

struct Slot {
    state: CachePadded<AtomicU8>,
    /// 已发布块的长度，供诊断读取（不碰 block 本身）
    len: AtomicUsize,
    block: UnsafeCell<SampleBlock>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: CachePadded::new(AtomicU8::new(EMPTY)),
            len: AtomicUsize::new(0),
            block: UnsafeCell::new(SampleBlock::default()),
        }
    }
}

/// 双缓冲区
pub struct StreamBuffer {
    slots: [Slot; SLOT_COUNT],

    // 以下两个字段只由消费者读写
    active: CachePadded<AtomicUsize>,
    cursor: CachePadded<AtomicUsize>,

    requests: RingBuffer<RefillRequest>,
    waker: OnceLock<Thread>,

    requests_emitted: AtomicU64,
    requests_dropped: AtomicU64,
}

// 安全性：block 的访问由槽位状态机串行化。
// 写者只在持有 WRITING 时触碰 block；消费者只在 DRAINING 时读取 block。
unsafe impl Send for StreamBuffer {}
unsafe impl Sync for StreamBuffer {}

impl StreamBuffer {
    pub fn new(request_capacity: usize) -> Self {
        Self {
            slots: [Slot::new(), Slot::new()],
            active: CachePadded::new(AtomicUsize::new(0)),
            cursor: CachePadded::new(AtomicUsize::new(0)),
            requests: RingBuffer::with_min_capacity(request_capacity),
            waker: OnceLock::new(),
            requests_emitted: AtomicU64::new(0),
            requests_dropped: AtomicU64::new(0),
        }
    }

    /// 存入一个块（非实时线程调用）
    ///
    /// - Ready 槽会被覆盖（后写者胜）
    /// - Draining 槽拒绝写入，active 槽的播放不受影响
    /// - 旧块在当前线程析构
    pub fn fill(&self, slot: usize, block: SampleBlock) -> Result<(), FillError> {
        if slot >= SLOT_COUNT {
            return Err(FillError::InvalidSlot(slot));
        }
        if block.is_empty() {
            return Err(FillError::EmptyBlock { slot });
        }

        let target = &self.slots[slot];
        let backoff = Backoff::new();
        let previous_state = loop {
            let state = target.state.load(Ordering::Acquire);
            match state {
                DRAINING => return Err(FillError::SlotDraining { slot }),
                WRITING => {
                    // 另一个写者正在交换，等它完成
                    backoff.snooze();
                    continue;
                }
                _ => {}
            }
            if target
                .state
                .compare_exchange_weak(state, WRITING, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break state;
            }
        };

        let len = block.len();
        // 安全：持有 WRITING，消费者不会读取该槽
        let previous = unsafe { std::mem::replace(&mut *target.block.get(), block) };
        target.len.store(len, Ordering::Relaxed);
        target.state.store(READY, Ordering::Release);

        if previous_state == READY {
            log::debug!("Slot {} overwritten before playback ({} samples)", slot, len);
        }
        drop(previous);
        Ok(())
    }

    /// 处理一条发往缓冲区的流消息
    ///
    /// 只接受 `Fill`；`RefillRequest` 由缓冲区自己发出，收到时拒绝
    pub fn deliver(&self, message: StreamMessage) -> Result<(), FillError> {
        match message {
            StreamMessage::Fill { slot, block } => self.fill(slot, block),
            StreamMessage::RefillRequest { slot, .. } => {
                Err(FillError::UnexpectedRequest { slot })
            }
        }
    }

    /// 取出下一个样本（实时回调调用）
    ///
    /// 返回 `None` 表示 underrun：active 槽还没有数据，调用者应输出静音。
    /// underrun 时既不切换槽位也不发请求。
    ///
    /// 绝对不能：加锁、分配内存、阻塞
    #[inline]
    pub fn drain_sample(&self) -> Option<Sample> {
        let active = self.active.load(Ordering::Relaxed);
        let slot = &self.slots[active];

        match slot.state.load(Ordering::Acquire) {
            DRAINING => {}
            READY => {
                if slot
                    .state
                    .compare_exchange(READY, DRAINING, Ordering::Acquire, Ordering::Relaxed)
                    .is_err()
                {
                    // 写者抢先进入 WRITING，本次按 underrun 处理
                    return None;
                }
                self.cursor.store(0, Ordering::Relaxed);
            }
            _ => return None,
        }

        // 安全：DRAINING 期间写者不会触碰 block
        let block = unsafe { &*slot.block.get() };
        let cursor = self.cursor.load(Ordering::Relaxed);
        let samples = block.as_slice();
        let len = samples.len();
        let sample = samples[cursor];

        if cursor + 1 >= len {
            // 交还槽位后不再访问 block
            slot.state.store(EMPTY, Ordering::Release);
            self.cursor.store(0, Ordering::Relaxed);
            self.active.store(active ^ 1, Ordering::Relaxed);
            self.emit_request(RefillRequest {
                slot: active,
                length: len,
            });
        } else {
            self.cursor.store(cursor + 1, Ordering::Relaxed);
        }

        Some(sample)
    }

    #[inline]
    fn emit_request(&self, request: RefillRequest) {
        if self.requests.push(request) {
            self.requests_emitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_dropped.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(waker) = self.waker.get() {
            waker.unpark();
        }
    }

    /// 取出下一个补充请求（按耗尽顺序）
    pub fn take_request(&self) -> Option<RefillRequest> {
        self.requests.pop()
    }

    /// 注册请求到达时要唤醒的线程，只能注册一次
    pub fn register_waker(&self, thread: Thread) -> bool {
        self.waker.set(thread).is_ok()
    }

    pub fn active_slot(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn slot_state(&self, slot: usize) -> SlotState {
        self.slots
            .get(slot)
            .map(|s| SlotState::from_raw(s.state.load(Ordering::Acquire)))
            .unwrap_or(SlotState::Empty)
    }

    /// 当前可播放的样本数（active 剩余 + standby 已就绪），仅供诊断
    pub fn buffered_samples(&self) -> usize {
        let active = self.active.load(Ordering::Relaxed);
        let mut total = 0;
        for (index, slot) in self.slots.iter().enumerate() {
            let len = slot.len.load(Ordering::Relaxed);
            match slot.state.load(Ordering::Acquire) {
                READY => total += len,
                DRAINING if index == active => {
                    total += len.saturating_sub(self.cursor.load(Ordering::Relaxed))
                }
                _ => {}
            }
        }
        total
    }

    pub fn requests_emitted(&self) -> u64 {
        self.requests_emitted.load(Ordering::Relaxed)
    }

    /// 请求队列溢出次数，正常协议下应始终为 0
    pub fn requests_dropped(&self) -> u64 {
        self.requests_dropped.load(Ordering::Relaxed)
    }

    pub fn lock_memory(&self) -> bool {
        self.requests.lock_memory()
    }
}

impl Default for StreamBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_CAPACITY)
    }
}
