//! 流会话
//!
//! 整合输出、双缓冲、桥接线程。
//! 核心设计：实时回调和样本生产完全解耦，通过 StreamBuffer 交接，
//! 补充请求经 lock-free 队列交给桥接线程
//!
//! 生命周期：
//!
//! ```text
//! Idle ──initialize──▶ Initializing ──▶ Ready ──stop──▶ Stopped
//!                            └──────────▶ Failed
//! ```
//!
//! 初始化是惰性且幂等的：并发调用只会打开一次输出，
//! 其余调用者在 Condvar 上等待结果

mod bridge;

pub use bridge::{MessageHandler, Route};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::audio::block::{RefillRequest, SampleBlock, StreamMessage};
use crate::audio::output::{OutputConfig, OutputError, OutputHost, OutputStream, StreamFormat};
use crate::audio::render::{running_flag, ChannelLayout, RenderCallback, RunningFlag};
use crate::audio::stats::{StatsReport, StreamStats};
use crate::audio::stream_buffer::{FillError, StreamBuffer, DEFAULT_REQUEST_CAPACITY};
use crate::audio::timing;
use crate::source::{DelegatedSource, SampleSource};

use bridge::{Bridge, BridgeCommand};

/// 会话配置
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// 预取时请求的块长度（样本数）
    pub block_length: usize,
    /// 回调内施加的增益
    pub gain: f32,
    pub layout: ChannelLayout,
    pub output: OutputConfig,
    /// 补充请求队列容量（向上取整到 2 的幂）
    pub request_capacity: usize,
    /// 等待其它线程完成初始化的上限
    pub ready_timeout: Duration,
    /// 桥接线程无事可做时的最长休眠
    pub idle_park: Duration,
    /// 尝试 mlock 请求队列
    pub lock_memory: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            block_length: 1024,
            gain: 0.1,
            layout: ChannelLayout::default(),
            output: OutputConfig::default(),
            request_capacity: DEFAULT_REQUEST_CAPACITY,
            ready_timeout: Duration::from_secs(5),
            idle_park: Duration::from_millis(20),
            lock_memory: true,
        }
    }
}

/// 会话错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("output initialization failed: {0}")]
    Init(#[from] OutputError),
    #[error("output stream: {0}")]
    Output(OutputError),
    #[error("session not ready after {0:?}")]
    NotReady(Duration),
    #[error("session stopped")]
    Stopped,
    #[error(transparent)]
    Fill(#[from] FillError),
    #[error("message handler already installed")]
    HandlerInstalled,
    #[error("bridge thread: {0}")]
    Bridge(String),
}

/// 会话状态（对外快照）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Initializing,
    Suspended,
    Running,
    Failed,
    Stopped,
}

struct Active<S> {
    stream: S,
    bridge: Bridge,
    running: bool,
}

enum Lifecycle<S> {
    Idle,
    Initializing,
    Ready(Active<S>),
    Failed(SessionError),
    Stopped,
}

/// 流会话
pub struct Session<H: OutputHost> {
    config: SessionConfig,
    host: H,
    buffer: Arc<StreamBuffer>,
    stats: Arc<StreamStats>,
    running: RunningFlag,
    handler_installed: AtomicBool,
    lifecycle: Mutex<Lifecycle<H::Stream>>,
    ready: Condvar,
}

#[cfg(feature = "cpal-host")]
impl Session<crate::audio::cpal_host::CpalHost> {
    /// 使用系统默认 cpal 宿主
    pub fn with_default_host(config: SessionConfig) -> Self {
        Self::new(config, crate::audio::cpal_host::CpalHost)
    }
}

impl<H: OutputHost> Session<H> {
    pub fn new(config: SessionConfig, host: H) -> Self {
        timing::init();
        Self {
            buffer: Arc::new(StreamBuffer::new(config.request_capacity)),
            stats: Arc::new(StreamStats::new()),
            running: running_flag(false),
            handler_installed: AtomicBool::new(false),
            lifecycle: Mutex::new(Lifecycle::Idle),
            ready: Condvar::new(),
            config,
            host,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle<H::Stream>> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 打开输出并启动桥接线程
    ///
    /// 幂等：已就绪时直接返回；其它线程正在初始化时等待其结果；
    /// 初始化失败是致命的，之后每次调用都返回同一个错误
    pub fn initialize(&self) -> Result<(), SessionError> {
        let mut guard = self.lock();
        loop {
            match &*guard {
                Lifecycle::Ready(_) => return Ok(()),
                Lifecycle::Failed(e) => return Err(e.clone()),
                Lifecycle::Stopped => return Err(SessionError::Stopped),
                Lifecycle::Idle => break,
                Lifecycle::Initializing => {
                    let (next, timeout) = self
                        .ready
                        .wait_timeout_while(guard, self.config.ready_timeout, |state| {
                            matches!(state, Lifecycle::Initializing)
                        })
                        .unwrap_or_else(PoisonError::into_inner);
                    guard = next;
                    if timeout.timed_out() {
                        return Err(SessionError::NotReady(self.config.ready_timeout));
                    }
                }
            }
        }

        *guard = Lifecycle::Initializing;
        drop(guard);

        // 打开设备可能很慢，不持锁
        let result = self.open_output();

        let mut guard = self.lock();
        if matches!(*guard, Lifecycle::Stopped) {
            // 初始化期间被 stop
            drop(guard);
            if let Ok(active) = result {
                Self::teardown(active);
            }
            return Err(SessionError::Stopped);
        }
        let outcome = match result {
            Ok(active) => {
                *guard = Lifecycle::Ready(active);
                log::info!("Stream session ready");
                Ok(())
            }
            Err(e) => {
                log::error!("Stream session initialization failed: {}", e);
                *guard = Lifecycle::Failed(e.clone());
                Err(e)
            }
        };
        self.ready.notify_all();
        outcome
    }

    fn open_output(&self) -> Result<Active<H::Stream>, SessionError> {
        if self.config.lock_memory {
            self.buffer.lock_memory();
        }

        let mut bridge = Bridge::spawn(
            Arc::clone(&self.buffer),
            Arc::clone(&self.stats),
            self.config.block_length,
            self.config.idle_park,
        )?;

        let callback = RenderCallback::new(
            Arc::clone(&self.buffer),
            Arc::clone(&self.stats),
            Arc::clone(&self.running),
        )
        .with_gain(self.config.gain)
        .with_layout(self.config.layout);

        let stream = match self.host.open(&self.config.output, callback) {
            Ok(stream) => stream,
            Err(e) => {
                bridge.shutdown();
                return Err(e.into());
            }
        };

        Ok(Active {
            stream,
            bridge,
            running: false,
        })
    }

    /// 等待就绪后在持锁状态下操作
    fn with_active<R>(
        &self,
        f: impl FnOnce(&mut Active<H::Stream>) -> Result<R, SessionError>,
    ) -> Result<R, SessionError> {
        self.initialize()?;
        let mut guard = self.lock();
        match &mut *guard {
            Lifecycle::Ready(active) => f(active),
            Lifecycle::Failed(e) => Err(e.clone()),
            Lifecycle::Stopped => Err(SessionError::Stopped),
            Lifecycle::Idle | Lifecycle::Initializing => {
                Err(SessionError::NotReady(self.config.ready_timeout))
            }
        }
    }

    /// 开始（或恢复）输出，幂等
    pub fn resume(&self) -> Result<(), SessionError> {
        self.with_active(|active| {
            if active.running {
                return Ok(());
            }
            self.running.store(true, Ordering::Release);
            if let Err(e) = active.stream.play() {
                self.running.store(false, Ordering::Release);
                return Err(SessionError::Output(e));
            }
            active.running = true;
            log::info!("Stream resumed");
            Ok(())
        })
    }

    pub fn start(&self) -> Result<(), SessionError> {
        self.resume()
    }

    /// 暂停输出，幂等；尚未初始化时什么也不做
    pub fn suspend(&self) -> Result<(), SessionError> {
        let mut guard = self.lock();
        let Lifecycle::Ready(active) = &mut *guard else {
            return Ok(());
        };
        if !active.running {
            return Ok(());
        }
        self.running.store(false, Ordering::Release);
        active.stream.pause().map_err(SessionError::Output)?;
        active.running = false;
        log::info!("Stream suspended");
        Ok(())
    }

    /// 手动把一个块交给指定槽位
    pub fn send_block(&self, slot: usize, block: SampleBlock) -> Result<(), SessionError> {
        self.initialize()?;
        self.buffer.deliver(StreamMessage::Fill { slot, block })?;
        self.stats.record_block_delivered();
        Ok(())
    }

    /// 在桥接线程上直接调用音源（替换现有路由）
    pub fn set_source<S: SampleSource>(&self, source: S) -> Result<(), SessionError> {
        self.route(Route::Inline(Box::new(source)))
    }

    /// 在独立线程上运行音源（替换现有路由）
    pub fn set_delegated_source<S: SampleSource>(&self, source: S) -> Result<(), SessionError> {
        self.with_active(|active| {
            let waker = active
                .bridge
                .thread()
                .ok_or_else(|| SessionError::Bridge("bridge thread exited".to_string()))?;
            let delegated = DelegatedSource::spawn(source, waker)
                .map_err(|e| SessionError::Bridge(e.to_string()))?;
            active.bridge.send(BridgeCommand::Route(Route::Delegated(delegated)))
        })
    }

    /// 安装消息回调，接管补充请求的处理
    ///
    /// 每个会话只能安装一次
    pub fn set_message_handler<F>(&self, handler: F) -> Result<(), SessionError>
    where
        F: FnMut(RefillRequest) + Send + 'static,
    {
        self.initialize()?;
        if self
            .handler_installed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SessionError::HandlerInstalled);
        }
        let result = self.route(Route::Handler(Box::new(handler)));
        if result.is_err() {
            // 没装上就不占用名额
            self.handler_installed.store(false, Ordering::Release);
        }
        result
    }

    fn route(&self, route: Route) -> Result<(), SessionError> {
        self.with_active(|active| active.bridge.send(BridgeCommand::Route(route)))
    }

    /// 停止并释放输出，幂等
    ///
    /// 拆除在锁外进行：消息回调可能正在桥接线程上调用 `send_block`
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *self.lock(), Lifecycle::Stopped);
        self.running.store(false, Ordering::Release);
        self.ready.notify_all();

        if let Lifecycle::Ready(active) = previous {
            Self::teardown(active);
            log::info!("Stream session stopped");
        }
    }

    fn teardown(active: Active<H::Stream>) {
        let Active {
            stream, mut bridge, ..
        } = active;
        // 先关流，回调不再产生新请求
        drop(stream);
        bridge.shutdown();
    }

    pub fn state(&self) -> SessionState {
        match &*self.lock() {
            Lifecycle::Idle => SessionState::Idle,
            Lifecycle::Initializing => SessionState::Initializing,
            Lifecycle::Ready(active) if active.running => SessionState::Running,
            Lifecycle::Ready(_) => SessionState::Suspended,
            Lifecycle::Failed(_) => SessionState::Failed,
            Lifecycle::Stopped => SessionState::Stopped,
        }
    }

    /// 实际输出格式，未就绪时为 None
    pub fn format(&self) -> Option<StreamFormat> {
        match &*self.lock() {
            Lifecycle::Ready(active) => Some(active.stream.format().clone()),
            _ => None,
        }
    }

    /// 当前已缓冲的样本全部播完时 `samples_played` 将达到的值
    pub fn playback_horizon(&self) -> u64 {
        self.stats.samples_played() + self.buffer.buffered_samples() as u64
    }

    pub fn buffer(&self) -> &Arc<StreamBuffer> {
        &self.buffer
    }

    pub fn stream_stats(&self) -> &Arc<StreamStats> {
        &self.stats
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn stats(&self) -> StatsReport {
        let (frames, rate) = self
            .format()
            .map(|f| (f.buffer_frames.unwrap_or(0), f.sample_rate))
            .unwrap_or((0, 0));
        self.stats.report(frames, rate)
    }
}

impl<H: OutputHost> Drop for Session<H> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::block::SLOT_COUNT;
    use crate::audio::stream_buffer::SlotState;
    use crate::source::SourceError;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Instant;

    #[derive(Default)]
    struct FakeDevice {
        opens: AtomicUsize,
        plays: AtomicUsize,
        pauses: AtomicUsize,
        callback: Mutex<Option<RenderCallback>>,
    }

    /// 不碰真实设备的宿主，测试里手动驱动回调
    #[derive(Clone, Default)]
    struct FakeHost {
        device: Arc<FakeDevice>,
        open_delay: Duration,
        fail: bool,
        channels: usize,
    }

    impl FakeHost {
        fn render(&self, out: &mut [f32]) {
            let mut guard = self.device.callback.lock().unwrap();
            guard.as_mut().expect("stream not open").render(out);
        }

        fn opens(&self) -> usize {
            self.device.opens.load(Ordering::SeqCst)
        }
    }

    struct FakeStream {
        device: Arc<FakeDevice>,
        format: StreamFormat,
    }

    impl OutputStream for FakeStream {
        fn play(&mut self) -> Result<(), OutputError> {
            self.device.plays.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn pause(&mut self) -> Result<(), OutputError> {
            self.device.pauses.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn format(&self) -> &StreamFormat {
            &self.format
        }
    }

    impl Drop for FakeStream {
        fn drop(&mut self) {
            self.device.callback.lock().unwrap().take();
        }
    }

    impl OutputHost for FakeHost {
        type Stream = FakeStream;

        fn open(
            &self,
            _config: &OutputConfig,
            mut callback: RenderCallback,
        ) -> Result<FakeStream, OutputError> {
            thread::sleep(self.open_delay);
            self.device.opens.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(OutputError::NoDevice);
            }
            let channels = self.channels.max(1);
            callback.set_channels(channels);
            *self.device.callback.lock().unwrap() = Some(callback);
            Ok(FakeStream {
                device: Arc::clone(&self.device),
                format: StreamFormat {
                    sample_rate: 48_000,
                    channels: channels as u16,
                    buffer_frames: Some(64),
                    sample_format: "F32".to_string(),
                    device_name: "fake".to_string(),
                },
            })
        }
    }

    fn test_config(block_length: usize) -> SessionConfig {
        SessionConfig {
            block_length,
            gain: 1.0,
            lock_memory: false,
            idle_park: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn both_ready(session: &Session<FakeHost>) -> bool {
        (0..SLOT_COUNT).all(|slot| session.buffer().slot_state(slot) == SlotState::Ready)
    }

    #[test]
    fn test_concurrent_initialize_opens_once() {
        let host = FakeHost {
            open_delay: Duration::from_millis(50),
            ..Default::default()
        };
        let session = Arc::new(Session::new(test_config(64), host.clone()));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let session = Arc::clone(&session);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    session.initialize()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), Ok(()));
        }
        assert_eq!(host.opens(), 1);
        assert_eq!(session.state(), SessionState::Suspended);

        session.initialize().unwrap();
        assert_eq!(host.opens(), 1);
    }

    #[test]
    fn test_initialize_failure_is_sticky() {
        let host = FakeHost {
            fail: true,
            ..Default::default()
        };
        let session = Session::new(test_config(64), host.clone());

        let expected = Err(SessionError::Init(OutputError::NoDevice));
        assert_eq!(session.initialize(), expected);
        assert_eq!(session.resume(), expected);
        assert_eq!(session.send_block(0, SampleBlock::silence(4)), expected);
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(host.opens(), 1);
    }

    #[test]
    fn test_resume_and_suspend_idempotent() {
        let host = FakeHost::default();
        let session = Session::new(test_config(64), host.clone());

        // 未初始化时 suspend 不触发初始化
        session.suspend().unwrap();
        assert_eq!(session.state(), SessionState::Idle);

        session.resume().unwrap();
        session.start().unwrap();
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(host.device.plays.load(Ordering::SeqCst), 1);

        session.suspend().unwrap();
        session.suspend().unwrap();
        assert_eq!(session.state(), SessionState::Suspended);
        assert_eq!(host.device.pauses.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_source_primes_both_slots() {
        let host = FakeHost::default();
        let session = Session::new(test_config(512), host);
        let lengths = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&lengths);
        session
            .set_source(move |length: usize| -> Result<SampleBlock, SourceError> {
                seen.lock().unwrap().push(length);
                Ok(SampleBlock::silence(length))
            })
            .unwrap();

        wait_until("priming", || both_ready(&session));
        assert_eq!(*lengths.lock().unwrap(), vec![512, 512]);
    }

    #[test]
    fn test_samples_flow_through_render() {
        let host = FakeHost::default();
        let session = Session::new(test_config(4), host.clone());

        let mut next = 0.0f32;
        session
            .set_source(move |length: usize| -> Result<SampleBlock, SourceError> {
                let block: Vec<f32> = (0..length)
                    .map(|_| {
                        next += 1.0;
                        next
                    })
                    .collect();
                Ok(SampleBlock::new(block))
            })
            .unwrap();
        wait_until("priming", || both_ready(&session));
        session.resume().unwrap();

        let mut played = Vec::new();
        for _ in 0..5 {
            let mut out = [0.0f32; 4];
            host.render(&mut out);
            played.extend_from_slice(&out);
            // 每个周期耗尽一个槽位，等桥接线程补上
            wait_until("refill", || both_ready(&session));
        }

        let expected: Vec<f32> = (1..=20).map(|v| v as f32).collect();
        assert_eq!(played, expected);
        assert_eq!(session.stream_stats().underrun_count(), 0);
        assert_eq!(session.buffer().requests_emitted(), 5);
    }

    #[test]
    fn test_producer_failure_degrades_to_silence() {
        let host = FakeHost::default();
        let session = Session::new(test_config(4), host.clone());

        let mut calls = 0;
        session
            .set_source(move |length: usize| -> Result<SampleBlock, SourceError> {
                calls += 1;
                if calls == 1 {
                    Err(SourceError::Failed("first call fails".to_string()))
                } else {
                    Ok(SampleBlock::new(vec![1.0; length]))
                }
            })
            .unwrap();
        wait_until("priming", || both_ready(&session));
        session.resume().unwrap();

        let mut out = [9.0f32; 8];
        host.render(&mut out);
        assert_eq!(out, [0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0]);
        assert_eq!(session.stream_stats().producer_failures(), 1);
        assert_eq!(session.stream_stats().underrun_count(), 0);
    }

    #[test]
    fn test_underrun_outputs_silence_without_source() {
        let host = FakeHost::default();
        let session = Session::new(test_config(4), host.clone());
        session.resume().unwrap();

        let mut out = [1.0f32; 8];
        host.render(&mut out);
        assert_eq!(out, [0.0; 8]);
        assert_eq!(session.stream_stats().silent_samples(), 8);
        assert_eq!(session.buffer().active_slot(), 0);
    }

    #[test]
    fn test_message_handler_with_manual_blocks() {
        let host = FakeHost::default();
        let session = Session::new(test_config(3), host.clone());
        let (tx, rx) = std::sync::mpsc::channel();

        session
            .set_message_handler(move |request| {
                let _ = tx.send(request);
            })
            .unwrap();

        let mut primed: Vec<_> = (0..2)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        primed.sort_by_key(|r| r.slot);
        assert_eq!(
            primed,
            vec![
                RefillRequest { slot: 0, length: 3 },
                RefillRequest { slot: 1, length: 3 }
            ]
        );

        session.send_block(0, SampleBlock::from(vec![0.1, 0.2, 0.3])).unwrap();
        session.send_block(1, SampleBlock::from(vec![0.4, 0.5, 0.6])).unwrap();
        session.resume().unwrap();

        let mut out = [0.0f32; 3];
        host.render(&mut out);
        assert_eq!(out, [0.1, 0.2, 0.3]);

        let request = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(request, RefillRequest { slot: 0, length: 3 });
    }

    #[test]
    fn test_message_handler_installs_once() {
        let session = Session::new(test_config(8), FakeHost::default());
        session.set_message_handler(|_| {}).unwrap();
        assert_eq!(
            session.set_message_handler(|_| {}),
            Err(SessionError::HandlerInstalled)
        );
    }

    #[test]
    fn test_send_block_rejects_bad_slot() {
        let session = Session::new(test_config(8), FakeHost::default());
        assert_eq!(
            session.send_block(2, SampleBlock::silence(4)),
            Err(SessionError::Fill(FillError::InvalidSlot(2)))
        );
        assert_eq!(session.buffer().active_slot(), 0);
    }

    #[test]
    fn test_delegated_source() {
        let host = FakeHost::default();
        let session = Session::new(test_config(16), host.clone());

        session
            .set_delegated_source(|length: usize| -> Result<SampleBlock, SourceError> {
                Ok(SampleBlock::new(vec![0.5; length]))
            })
            .unwrap();
        wait_until("priming", || both_ready(&session));
        session.resume().unwrap();

        let mut out = [0.0f32; 16];
        host.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.5));
        wait_until("refill", || session.stream_stats().blocks_delivered() == 3);
        assert_eq!(session.buffer().slot_state(0), SlotState::Ready);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let host = FakeHost::default();
        let session = Session::new(test_config(8), host.clone());
        session.resume().unwrap();

        session.stop();
        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(host.device.callback.lock().unwrap().is_none());
        assert_eq!(session.resume(), Err(SessionError::Stopped));
        assert_eq!(session.format(), None);
    }

    #[test]
    fn test_format_after_initialize() {
        let host = FakeHost {
            channels: 2,
            ..Default::default()
        };
        let session = Session::new(test_config(8), host);
        assert_eq!(session.format(), None);

        session.initialize().unwrap();
        let format = session.format().unwrap();
        assert_eq!(format.channels, 2);
        assert_eq!(format.sample_rate, 48_000);
    }

    #[test]
    fn test_handler_slot_released_when_routing_fails() {
        let session = Session::new(test_config(8), FakeHost::default());
        // 音源 panic 会带走桥接线程
        wait_until("bridge exit", || {
            session
                .set_source(|_: usize| -> Result<SampleBlock, SourceError> {
                    panic!("source blew up")
                })
                .is_err()
        });

        for _ in 0..2 {
            assert!(matches!(
                session.set_message_handler(|_| {}),
                Err(SessionError::Bridge(_))
            ));
        }
    }

    #[test]
    fn test_replacing_slow_delegated_source_does_not_block() {
        let host = FakeHost::default();
        let session = Session::new(test_config(8), host);
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        session
            .set_delegated_source(move |length: usize| -> Result<SampleBlock, SourceError> {
                counter.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_secs(1));
                Ok(SampleBlock::silence(length))
            })
            .unwrap();
        wait_until("slow generation", || calls.load(Ordering::SeqCst) > 0);

        let started = Instant::now();
        session
            .set_source(|length: usize| -> Result<SampleBlock, SourceError> {
                Ok(SampleBlock::new(vec![0.25; length]))
            })
            .unwrap();
        wait_until("inline priming", || both_ready(&session));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_lost_delegated_worker_fills_requested_length() {
        let host = FakeHost::default();
        let session = Session::new(test_config(4), host.clone());

        // 两个槽位都已就绪，安装路由时不会预取
        session.send_block(0, SampleBlock::new(vec![1.0; 6])).unwrap();
        session.send_block(1, SampleBlock::new(vec![2.0; 2])).unwrap();
        session
            .set_delegated_source(|_: usize| -> Result<SampleBlock, SourceError> {
                panic!("worker lost")
            })
            .unwrap();
        session.resume().unwrap();

        let mut out = [0.0f32; 6];
        host.render(&mut out);
        assert_eq!(out, [1.0; 6]);

        wait_until("silence fill", || {
            session.buffer().slot_state(0) == SlotState::Ready
        });
        assert_eq!(session.buffer().buffered_samples(), 2 + 6);
        assert_eq!(session.stream_stats().producer_failures(), 1);
    }

    #[test]
    fn test_playback_horizon_covers_queued_blocks() {
        let host = FakeHost::default();
        let session = Session::new(test_config(3), host.clone());
        session.send_block(0, SampleBlock::new(vec![0.5; 3])).unwrap();
        session.send_block(1, SampleBlock::new(vec![0.5; 3])).unwrap();
        session.resume().unwrap();

        let mut out = [0.0f32; 3];
        host.render(&mut out);
        let horizon = session.playback_horizon();
        assert_eq!(horizon, 6);

        // 另一个槽位里的块还没播
        assert!(session.stream_stats().samples_played() < horizon);
        host.render(&mut out);
        assert!(session.stream_stats().samples_played() >= horizon);
    }
}
