//! 桥接线程
//!
//! 非实时侧的唯一调度者：
//! 1. 从 StreamBuffer 取出补充请求（按耗尽顺序）
//! 2. 按当前路由交给音源 / 委托线程 / 用户回调
//! 3. 把生成结果写回对应槽位，失败时写入静音块
//!
//! 空闲时 park，实时回调发出请求或委托线程完成时 unpark

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;

use crate::audio::block::{RefillRequest, SampleBlock, StreamMessage, SLOT_COUNT};
use crate::audio::stats::StreamStats;
use crate::audio::stream_buffer::{SlotState, StreamBuffer};
use crate::source::{Completion, DelegatedSource, SampleSource, SourceError};

use super::SessionError;

/// 用户消息回调，收到原始补充请求，通过 `Session::send_block` 回应
pub type MessageHandler = Box<dyn FnMut(RefillRequest) + Send + 'static>;

/// 补充请求的去向（同一时刻只有一个）
pub enum Route {
    /// 无人生产，等待手动 send_block
    Unrouted,
    Inline(Box<dyn SampleSource>),
    Delegated(DelegatedSource),
    Handler(MessageHandler),
}

impl Route {
    fn name(&self) -> &'static str {
        match self {
            Self::Unrouted => "unrouted",
            Self::Inline(_) => "inline source",
            Self::Delegated(_) => "delegated source",
            Self::Handler(_) => "message handler",
        }
    }
}

pub(crate) enum BridgeCommand {
    Route(Route),
    Shutdown,
}

/// 桥接线程句柄
pub(crate) struct Bridge {
    commands: Sender<BridgeCommand>,
    thread: Option<JoinHandle<()>>,
}

impl Bridge {
    pub(crate) fn spawn(
        buffer: Arc<StreamBuffer>,
        stats: Arc<StreamStats>,
        block_length: usize,
        idle_park: Duration,
    ) -> Result<Self, SessionError> {
        let (commands, command_rx) = mpsc::channel();
        let worker = BridgeWorker {
            buffer: Arc::clone(&buffer),
            stats,
            commands: command_rx,
            route: Route::Unrouted,
            in_flight: [None; SLOT_COUNT],
            block_length,
            idle_park,
        };

        let thread = thread::Builder::new()
            .name("stream-bridge".to_string())
            .spawn(move || worker.run())
            .map_err(|e| SessionError::Bridge(e.to_string()))?;

        if !buffer.register_waker(thread.thread().clone()) {
            log::warn!("Stream buffer already has a waker, bridge relies on idle polling");
        }

        Ok(Self {
            commands,
            thread: Some(thread),
        })
    }

    pub(crate) fn thread(&self) -> Option<Thread> {
        self.thread.as_ref().map(|t| t.thread().clone())
    }

    pub(crate) fn send(&self, command: BridgeCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::Bridge("bridge thread exited".to_string()))?;
        if let Some(thread) = &self.thread {
            thread.thread().unpark();
        }
        Ok(())
    }

    pub(crate) fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.commands.send(BridgeCommand::Shutdown);
        thread.thread().unpark();
        if thread.join().is_err() {
            log::error!("Bridge thread panicked");
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct BridgeWorker {
    buffer: Arc<StreamBuffer>,
    stats: Arc<StreamStats>,
    commands: Receiver<BridgeCommand>,
    route: Route,
    /// 每个槽位尚未交付的生成请求长度
    in_flight: [Option<usize>; SLOT_COUNT],
    block_length: usize,
    idle_park: Duration,
}

impl BridgeWorker {
    fn run(mut self) {
        log::debug!("Bridge thread started");

        loop {
            if !self.apply_commands() {
                break;
            }

            while let Some(request) = self.buffer.take_request() {
                self.dispatch(request);
            }

            self.collect_delegated();

            // park/unpark 不丢唤醒：unpark 先于 park 时 park 立即返回
            thread::park_timeout(self.idle_park);
        }

        log::debug!("Bridge thread finished");
    }

    /// 返回 false 表示应退出
    fn apply_commands(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(BridgeCommand::Route(route)) => self.install(route),
                Ok(BridgeCommand::Shutdown) | Err(TryRecvError::Disconnected) => return false,
                Err(TryRecvError::Empty) => return true,
            }
        }
    }

    /// 替换路由并为空槽位预取
    fn install(&mut self, route: Route) {
        log::info!("Refill route: {} -> {}", self.route.name(), route.name());
        // 旧路由（包括委托线程）在这里析构，其未交付的结果一并作废
        self.route = route;
        self.in_flight = [None; SLOT_COUNT];

        for slot in 0..SLOT_COUNT {
            if self.buffer.slot_state(slot) == SlotState::Empty {
                self.dispatch(RefillRequest {
                    slot,
                    length: self.block_length,
                });
            }
        }
    }

    fn dispatch(&mut self, request: RefillRequest) {
        if self.in_flight[request.slot].is_some() {
            log::debug!("Slot {} already has a fill in flight", request.slot);
            return;
        }

        let completion = match &mut self.route {
            Route::Unrouted => {
                log::debug!(
                    "No sample source, slot {} waits for a manual block",
                    request.slot
                );
                return;
            }
            Route::Handler(handler) => {
                handler(request);
                return;
            }
            Route::Delegated(delegated) => match delegated.request(request) {
                Ok(()) => {
                    self.in_flight[request.slot] = Some(request.length);
                    return;
                }
                Err(e) => Completion {
                    slot: request.slot,
                    length: request.length,
                    result: Err(e),
                },
            },
            Route::Inline(source) => Completion {
                slot: request.slot,
                length: request.length,
                result: source.generate(request.length),
            },
        };

        self.complete(completion);
    }

    fn collect_delegated(&mut self) {
        loop {
            let Route::Delegated(delegated) = &self.route else {
                return;
            };
            match delegated.try_complete() {
                Ok(Some(completion)) => self.complete(completion),
                Ok(None) => return,
                Err(e) => {
                    log::error!("Delegated source lost: {}", e);
                    self.route = Route::Unrouted;
                    // 未交付的槽位用静音补上，避免流永久停在 underrun
                    for slot in 0..SLOT_COUNT {
                        if let Some(length) = self.in_flight[slot] {
                            self.complete(Completion {
                                slot,
                                length,
                                result: Err(SourceError::Disconnected),
                            });
                        }
                    }
                    return;
                }
            }
        }
    }

    fn complete(&mut self, completion: Completion) {
        let Completion {
            slot,
            length,
            result,
        } = completion;
        self.in_flight[slot] = None;

        let block = match result {
            Ok(block) if !block.is_empty() => {
                if block.len() != length {
                    log::warn!(
                        "Sample source returned {} samples for slot {} (requested {})",
                        block.len(),
                        slot,
                        length
                    );
                }
                block
            }
            Ok(_) => {
                log::warn!("Sample source returned an empty block for slot {}", slot);
                self.stats.record_producer_failure();
                SampleBlock::silence(length.max(1))
            }
            Err(SourceError::Exhausted) => {
                log::debug!("Sample source exhausted, slot {} gets silence", slot);
                self.stats.record_producer_failure();
                SampleBlock::silence(length.max(1))
            }
            Err(e) => {
                log::warn!("Sample source failed for slot {}: {}", slot, e);
                self.stats.record_producer_failure();
                SampleBlock::silence(length.max(1))
            }
        };

        match self.buffer.deliver(StreamMessage::Fill { slot, block }) {
            Ok(()) => self.stats.record_block_delivered(),
            Err(e) => {
                log::warn!("Dropping generated block: {}", e);
                self.stats.record_rejected_fill();
            }
        }
    }
}
