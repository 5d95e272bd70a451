//! 委托生成
//!
//! 把任意 SampleSource 搬到独立的 "sample-source" 线程上运行。
//! 请求以 `StreamMessage::RefillRequest` 发出，结果经回传通道返回并唤醒桥接线程，
//! 调用方从不同步等待生成结果。
//!
//! 析构时不等待生成线程：排队中的请求作废，正在进行的一次生成结束后线程自行退出

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread};

use super::{Completion, SampleSource, SourceError};
use crate::audio::block::{RefillRequest, StreamMessage};

pub struct DelegatedSource {
    requests: Option<Sender<StreamMessage>>,
    completions: Receiver<Completion>,
    cancelled: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl DelegatedSource {
    /// 启动生成线程，每次完成后 unpark `waker`
    pub fn spawn<S: SampleSource>(mut source: S, waker: Thread) -> Result<Self, SourceError> {
        let (request_tx, request_rx) = mpsc::channel::<StreamMessage>();
        let (completion_tx, completion_rx) = mpsc::channel::<Completion>();
        let cancelled = Arc::new(AtomicBool::new(false));

        let cancel = Arc::clone(&cancelled);
        let worker = thread::Builder::new()
            .name("sample-source".to_string())
            .spawn(move || {
                log::debug!("Sample source thread started");
                for message in request_rx {
                    if cancel.load(Ordering::Acquire) {
                        break;
                    }
                    let StreamMessage::RefillRequest { slot, length } = message else {
                        log::warn!("Sample source thread ignoring unexpected message");
                        continue;
                    };
                    let result = source.generate(length);
                    if completion_tx.send(Completion { slot, length, result }).is_err() {
                        break;
                    }
                    waker.unpark();
                }
                log::debug!("Sample source thread finished");
            })
            .map_err(|e| SourceError::Failed(format!("failed to spawn source thread: {}", e)))?;

        Ok(Self {
            requests: Some(request_tx),
            completions: completion_rx,
            cancelled,
            worker: Some(worker),
        })
    }

    /// 转发一个补充请求，不等待结果
    pub fn request(&self, request: RefillRequest) -> Result<(), SourceError> {
        self.requests
            .as_ref()
            .ok_or(SourceError::Disconnected)?
            .send(request.into())
            .map_err(|_| SourceError::Disconnected)
    }

    /// 取一个已完成的结果
    ///
    /// 生成线程意外退出时返回 `Err(Disconnected)`
    pub fn try_complete(&self) -> Result<Option<Completion>, SourceError> {
        match self.completions.try_recv() {
            Ok(completion) => Ok(Some(completion)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(SourceError::Disconnected),
        }
    }
}

impl Drop for DelegatedSource {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        self.requests.take();
        if let Some(worker) = self.worker.take() {
            if worker.is_finished() {
                let _ = worker.join();
            } else {
                // 不阻塞调用方（通常是桥接线程），让它在当前生成结束后自行退出
                log::debug!("Detaching busy sample source thread");
            }
        }
    }
}
