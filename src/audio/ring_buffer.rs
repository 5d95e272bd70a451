//! Lock-free Single-Producer Single-Consumer 请求队列
//!
//! 实时回调（生产者）把 `RefillRequest` 推入队列，桥接线程（消费者）取出。
//! - 零锁：push / pop 只做原子读写
//! - 零分配：槽位在构造时预分配
//! - 读写位置各占一个 cache line（`CachePadded`），避免 false sharing
//! - 可选 mlock 防止 page fault

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// SPSC 无锁环形队列
pub struct RingBuffer<T: Copy + Default> {
    buffer: Box<[UnsafeCell<T>]>,
    capacity: usize,
    mask: usize,

    write_pos: CachePadded<AtomicUsize>,
    read_pos: CachePadded<AtomicUsize>,

    memory_locked: AtomicBool,
}

unsafe impl<T: Copy + Default + Send> Send for RingBuffer<T> {}
unsafe impl<T: Copy + Default + Send> Sync for RingBuffer<T> {}

impl<T: Copy + Default> RingBuffer<T> {
    /// capacity 必须是 2 的幂
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be power of two");

        let buffer: Vec<UnsafeCell<T>> = (0..capacity)
            .map(|_| UnsafeCell::new(T::default()))
            .collect();

        Self {
            buffer: buffer.into_boxed_slice(),
            capacity,
            mask: capacity - 1,
            write_pos: CachePadded::new(AtomicUsize::new(0)),
            read_pos: CachePadded::new(AtomicUsize::new(0)),
            memory_locked: AtomicBool::new(false),
        }
    }

    /// 自动向上取整到 2 的幂（至少 1）
    pub fn with_min_capacity(min_capacity: usize) -> Self {
        Self::new(min_capacity.max(1).next_power_of_two())
    }

    /// 锁定队列内存，返回是否成功
    pub fn lock_memory(&self) -> bool {
        if self.memory_locked.load(Ordering::Acquire) {
            return true;
        }

        let len = self.byte_len();
        if sys::mlock(self.buffer.as_ptr() as *const u8, len) {
            self.memory_locked.store(true, Ordering::Release);
            log::debug!("Request queue memory locked: {} bytes", len);
            true
        } else {
            log::warn!(
                "Failed to lock request queue memory: {}",
                std::io::Error::last_os_error()
            );
            false
        }
    }

    pub fn unlock_memory(&self) {
        if !self.memory_locked.swap(false, Ordering::AcqRel) {
            return;
        }
        sys::munlock(self.buffer.as_ptr() as *const u8, self.byte_len());
        log::debug!("Request queue memory unlocked");
    }

    fn byte_len(&self) -> usize {
        self.capacity * std::mem::size_of::<UnsafeCell<T>>()
    }

    /// 推入一个元素（生产者调用）
    ///
    /// 队列满时返回 false。wait-free，绝不阻塞
    #[inline]
    pub fn push(&self, item: T) -> bool {
        let write = self.write_pos.load(Ordering::Relaxed);
        let read = self.read_pos.load(Ordering::Acquire);

        if write.wrapping_sub(read) >= self.capacity {
            return false;
        }

        unsafe {
            *self.buffer[write & self.mask].get() = item;
        }
        self.write_pos.store(write.wrapping_add(1), Ordering::Release);
        true
    }

    /// 取出一个元素（消费者调用）
    #[inline]
    pub fn pop(&self) -> Option<T> {
        let read = self.read_pos.load(Ordering::Relaxed);
        let write = self.write_pos.load(Ordering::Acquire);

        if read == write {
            return None;
        }

        let item = unsafe { *self.buffer[read & self.mask].get() };
        self.read_pos.store(read.wrapping_add(1), Ordering::Release);
        Some(item)
    }

    /// 当前排队元素数
    #[inline]
    pub fn len(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: Copy + Default> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        self.unlock_memory();
    }
}

#[cfg(unix)]
mod sys {
    pub fn mlock(ptr: *const u8, len: usize) -> bool {
        unsafe { libc::mlock(ptr as *const libc::c_void, len) == 0 }
    }

    pub fn munlock(ptr: *const u8, len: usize) {
        unsafe {
            libc::munlock(ptr as *const libc::c_void, len);
        }
    }
}

#[cfg(not(unix))]
mod sys {
    pub fn mlock(_ptr: *const u8, _len: usize) -> bool {
        false
    }

    pub fn munlock(_ptr: *const u8, _len: usize) {}
}
