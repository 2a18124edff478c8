//! 进度聚合与批量通知

use log::info;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard};

pub const DEFAULT_PROGRESS_STEPS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExtractionProgress {
    pub completed_count: u64,
    pub total_count: u64,
    /// 本次运行的最后一条事件
    pub finished: bool,
}

impl ExtractionProgress {
    pub fn fraction(&self) -> f64 {
        if self.total_count == 0 {
            return 1.0;
        }
        self.completed_count as f64 / self.total_count as f64
    }
}

/// 进度事件接收端。事件在计数器锁内依次送达，实现里不要做耗时操作
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: ExtractionProgress);
}

impl ProgressSink for Sender<ExtractionProgress> {
    fn on_progress(&self, progress: ExtractionProgress) {
        // 接收端已关闭时直接丢弃
        let _ = self.send(progress);
    }
}

impl<F> ProgressSink for F
where
    F: Fn(ExtractionProgress) + Send + Sync,
{
    fn on_progress(&self, progress: ExtractionProgress) {
        self(progress)
    }
}

/// 仅输出日志的进度接收端
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn on_progress(&self, progress: ExtractionProgress) {
        info!(
            "📊 Extracted {}/{} images ({:.0}%)",
            progress.completed_count,
            progress.total_count,
            progress.fraction() * 100.0
        );
    }
}

/// 协作式取消标记
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub completed: u64,
    pub skipped: u64,
    pub lost: u64,
    pub total: u64,
}

impl CounterSnapshot {
    pub fn settled(&self) -> u64 {
        self.completed + self.skipped + self.lost
    }
}

#[derive(Debug, Default)]
struct CounterState {
    completed: u64,
    skipped: u64,
    lost: u64,
    finished: bool,
    closed: bool,
}

/// 所有任务共享的计数器：单把锁串行化所有更新与通知
pub struct ProgressCounter {
    total: u64,
    batch_size: u64,
    state: Mutex<CounterState>,
    sink: Arc<dyn ProgressSink>,
    cancel: Option<CancelToken>,
}

impl ProgressCounter {
    pub fn new(total: u64, steps: u64, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            total,
            batch_size: (total / steps.max(1)).max(1),
            state: Mutex::new(CounterState::default()),
            sink,
            cancel: None,
        }
    }

    /// 令牌取消后与 `close` 等效
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn is_silenced(&self, state: &CounterState) -> bool {
        state.closed || self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn batch_size(&self) -> u64 {
        self.batch_size
    }

    fn lock(&self) -> MutexGuard<'_, CounterState> {
        // 计数只做加法，中毒后的状态依然可用
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 空任务集：立即发出唯一的完成事件
    pub fn finish_if_empty(&self) {
        let mut state = self.lock();
        if self.total == 0 && !state.finished && !self.is_silenced(&state) {
            state.finished = true;
            self.sink.on_progress(ExtractionProgress {
                completed_count: 0,
                total_count: 0,
                finished: true,
            });
        }
    }

    /// 成功写入一张图片
    pub fn record_written(&self) {
        let mut state = self.lock();
        state.completed += 1;
        let aligned = state.completed % self.batch_size == 0;
        self.notify(&mut state, aligned);
    }

    /// 单帧被跳过（不计入 completed）
    pub fn record_skipped(&self, count: u64) {
        if count == 0 {
            return;
        }
        let mut state = self.lock();
        state.skipped += count;
        self.notify(&mut state, false);
    }

    /// 视频源中止后再也不会交付的帧
    pub fn record_lost(&self, count: u64) {
        if count == 0 {
            return;
        }
        let mut state = self.lock();
        state.lost += count;
        self.notify(&mut state, false);
    }

    /// 取消后不再发出任何事件
    pub fn close(&self) {
        self.lock().closed = true;
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let state = self.lock();
        CounterSnapshot {
            completed: state.completed,
            skipped: state.skipped,
            lost: state.lost,
            total: self.total,
        }
    }

    fn notify(&self, state: &mut CounterState, aligned: bool) {
        if state.finished || self.is_silenced(state) {
            return;
        }
        let settled = state.completed + state.skipped + state.lost >= self.total;
        if settled {
            state.finished = true;
        } else if !aligned {
            return;
        }
        self.sink.on_progress(ExtractionProgress {
            completed_count: state.completed,
            total_count: self.total,
            finished: state.finished,
        });
    }
}
