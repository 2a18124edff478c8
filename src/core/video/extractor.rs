//! 按标签并发抽帧，生成训练图片

use super::error::ExtractError;
use super::processor::FrameProcessor;
use super::progress::{CancelToken, CounterSnapshot, ProgressCounter, ProgressSink, DEFAULT_PROGRESS_STEPS};
use super::sampler::FrameSampler;
use super::source::{FrameDelivery, VideoAsset, VideoOpener};
use log::{debug, error, info, warn};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// 一个标签对应的视频与输出目录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledSource {
    pub label: String,
    pub video_path: PathBuf,
    pub output_directory: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionState {
    Idle,
    Running,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ExtractionOptions {
    pub sampler: FrameSampler,
    pub processor: FrameProcessor,
    pub progress_steps: u64,
    pub source_timeout: Option<Duration>,
    /// 编码线程数，`None` 时使用 CPU 核数
    pub encode_threads: Option<usize>,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self {
            sampler: FrameSampler::default(),
            processor: FrameProcessor::default(),
            progress_steps: DEFAULT_PROGRESS_STEPS,
            source_timeout: None,
            encode_threads: None,
        }
    }
}

/// 单个视频源的结果
#[derive(Debug)]
pub struct SourceReport {
    pub label: String,
    pub output_directory: PathBuf,
    pub planned: u64,
    pub written: u64,
    pub skipped: u64,
    pub failure: Option<ExtractError>,
}

impl SourceReport {
    fn failed(source: &LabeledSource, planned: u64, failure: ExtractError) -> Self {
        Self {
            label: source.label.clone(),
            output_directory: source.output_directory.clone(),
            planned,
            written: 0,
            skipped: 0,
            failure: Some(failure),
        }
    }

    /// 中止后未交付的帧
    pub fn lost(&self) -> u64 {
        self.planned.saturating_sub(self.written + self.skipped)
    }
}

#[derive(Debug)]
pub struct ExtractionReport {
    pub state: ExtractionState,
    pub total_count: u64,
    pub completed_count: u64,
    pub sources: Vec<SourceReport>,
}

impl ExtractionReport {
    pub fn failed_sources(&self) -> impl Iterator<Item = &SourceReport> {
        self.sources.iter().filter(|s| s.failure.is_some())
    }

    /// 计划总数减去跳过与丢失的帧
    pub fn achievable_total(&self) -> u64 {
        let dropped: u64 = self.sources.iter().map(|s| s.skipped + s.lost()).sum();
        self.total_count.saturating_sub(dropped)
    }

    pub fn is_fully_completed(&self) -> bool {
        self.state == ExtractionState::Completed
            && self.failed_sources().next().is_none()
            && self.completed_count == self.total_count
    }
}

/// 卡死的解码线程在超时或取消后再等待的时长，之后放弃该线程
const ABANDON_GRACE: Duration = Duration::from_millis(250);
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// 单个任务的计数；放弃后任务线程的后续记录全部作废
#[derive(Default)]
struct JobTally {
    state: Mutex<TallyState>,
}

#[derive(Default)]
struct TallyState {
    written: u64,
    skipped: u64,
    lost: u64,
    abandoned: bool,
    settled: bool,
}

impl JobTally {
    fn lock(&self) -> std::sync::MutexGuard<'_, TallyState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn is_abandoned(&self) -> bool {
        self.lock().abandoned
    }

    /// 已放弃时返回 false，调用方需清理刚写出的文件
    fn written(&self, counter: &ProgressCounter) -> bool {
        let mut state = self.lock();
        if state.abandoned {
            return false;
        }
        state.written += 1;
        counter.record_written();
        true
    }

    fn skipped(&self, count: u64, counter: &ProgressCounter) {
        let mut state = self.lock();
        if !state.abandoned {
            state.skipped += count;
            counter.record_skipped(count);
        }
    }

    fn lost(&self, count: u64, counter: &ProgressCounter) {
        let mut state = self.lock();
        if !state.abandoned {
            state.lost += count;
            counter.record_lost(count);
        }
    }

    /// 冻结计数，剩余帧按丢失结算；返回 (written, skipped)
    fn abandon(&self, planned: u64, counter: &ProgressCounter, settle_rest: bool) -> (u64, u64) {
        let mut state = self.lock();
        if !state.abandoned {
            state.abandoned = true;
            if settle_rest {
                let rest = planned.saturating_sub(state.written + state.skipped + state.lost);
                state.lost += rest;
                counter.record_lost(rest);
            }
        }
        (state.written, state.skipped)
    }

    fn counts(&self) -> (u64, u64) {
        let state = self.lock();
        (state.written, state.skipped)
    }

    /// 只有第一次调用返回 true
    fn settle(&self) -> bool {
        !std::mem::replace(&mut self.lock().settled, true)
    }
}

/// 全部任务结束时确定一次终态，此后不再改变
struct RunOutcome {
    remaining: AtomicUsize,
    interrupted: AtomicBool,
    state: OnceLock<ExtractionState>,
}

impl RunOutcome {
    fn new(jobs: usize, token: &CancelToken) -> Self {
        let outcome = Self {
            remaining: AtomicUsize::new(jobs),
            interrupted: AtomicBool::new(false),
            state: OnceLock::new(),
        };
        if jobs == 0 {
            outcome.settle_now(token);
        }
        outcome
    }

    fn job_done(&self, interrupted: bool) {
        if interrupted {
            self.interrupted.store(true, Ordering::SeqCst);
        }
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            let state = if self.interrupted.load(Ordering::SeqCst) {
                ExtractionState::Cancelled
            } else {
                ExtractionState::Completed
            };
            let _ = self.state.set(state);
        }
    }

    fn get(&self) -> Option<ExtractionState> {
        self.state.get().copied()
    }

    fn settle_now(&self, token: &CancelToken) -> ExtractionState {
        *self.state.get_or_init(|| {
            if token.is_cancelled() {
                ExtractionState::Cancelled
            } else {
                ExtractionState::Completed
            }
        })
    }
}

/// 任务线程退出（包括 panic）时结算
struct JobGuard {
    tally: Arc<JobTally>,
    outcome: Arc<RunOutcome>,
    token: CancelToken,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        if self.tally.settle() {
            self.outcome.job_done(self.token.is_cancelled());
        }
    }
}

enum Stall {
    TimedOut(Duration),
    Cancelled,
}

/// 轮询等待任务结束；超时或取消后超过宽限期仍未结束则放弃
fn await_job(
    handle: &JoinHandle<SourceReport>,
    started: Instant,
    timeout: Option<Duration>,
    token: &CancelToken,
) -> Option<Stall> {
    let mut cancelled_at = None;
    while !handle.is_finished() {
        let now = Instant::now();
        if let Some(limit) = timeout {
            if now >= started + limit + ABANDON_GRACE {
                return Some(Stall::TimedOut(limit));
            }
        }
        if token.is_cancelled() {
            let since = *cancelled_at.get_or_insert(now);
            if now >= since + ABANDON_GRACE {
                return Some(Stall::Cancelled);
            }
        }
        thread::sleep(JOIN_POLL_INTERVAL);
    }
    None
}

struct SourceJob {
    source: LabeledSource,
    planned: u64,
    started: Instant,
    tally: Arc<JobTally>,
    handle: Option<JoinHandle<SourceReport>>,
}

impl SourceJob {
    fn abandoned_report(
        &self,
        counter: &ProgressCounter,
        settle_rest: bool,
        failure: Option<ExtractError>,
    ) -> SourceReport {
        let (written, skipped) = self.tally.abandon(self.planned, counter, settle_rest);
        SourceReport {
            label: self.source.label.clone(),
            output_directory: self.source.output_directory.clone(),
            planned: self.planned,
            written,
            skipped,
            failure,
        }
    }
}

struct ActiveRun {
    token: CancelToken,
    counter: Arc<ProgressCounter>,
    outcome: Arc<RunOutcome>,
    timeout: Option<Duration>,
    jobs: Vec<SourceJob>,
    reports: Vec<SourceReport>,
}

impl ActiveRun {
    /// 仍在运行时先取消，再等待全部任务退出
    fn stop(&mut self) {
        if self.outcome.get().is_none() {
            info!("🛑 Stopping unfinished extraction run");
            self.token.cancel();
        }
        self.counter.close();
        self.join();
    }

    fn join(&mut self) {
        for job in &mut self.jobs {
            let Some(handle) = job.handle.take() else {
                continue;
            };

            let report = match await_job(&handle, job.started, self.timeout, &self.token) {
                None => match handle.join() {
                    Ok(report) => report,
                    Err(panic) => {
                        let message = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".to_string());
                        error!("❌ Extraction job for '{}' panicked: {}", job.source.label, message);
                        job.abandoned_report(&self.counter, true, Some(ExtractError::JobPanicked(message)))
                    }
                },
                Some(stall) => {
                    // 线程无法强制结束，丢弃句柄后由 tally 屏蔽其后续写入
                    drop(handle);
                    let (cancelled, failure) = match stall {
                        Stall::TimedOut(limit) => (false, Some(ExtractError::TimedOut(limit))),
                        Stall::Cancelled => (true, None),
                    };
                    warn!(
                        "⚠️ '{}': decoder unresponsive, abandoning worker thread",
                        job.source.label
                    );
                    let report = job.abandoned_report(&self.counter, !cancelled, failure);
                    if job.tally.settle() {
                        self.outcome.job_done(cancelled);
                    }
                    report
                }
            };
            self.reports.push(report);
        }
    }
}

pub struct LabelSetExtractor {
    opener: Arc<dyn VideoOpener>,
    options: ExtractionOptions,
    pool: Arc<ThreadPool>,
    run: Option<ActiveRun>,
}

impl LabelSetExtractor {
    pub fn new(opener: Arc<dyn VideoOpener>) -> Result<Self, ExtractError> {
        Self::with_options(opener, ExtractionOptions::default())
    }

    pub fn with_options(
        opener: Arc<dyn VideoOpener>,
        options: ExtractionOptions,
    ) -> Result<Self, ExtractError> {
        let threads = options.encode_threads.unwrap_or_else(num_cpus::get).max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("frame-encode-{}", i))
            .build()
            .map_err(|e| ExtractError::Io(std::io::Error::other(e)))?;
        debug!("Using {} threads for frame encoding", threads);

        Ok(Self {
            opener,
            options,
            pool: Arc::new(pool),
            run: None,
        })
    }

    pub fn options(&self) -> &ExtractionOptions {
        &self.options
    }

    pub fn state(&self) -> ExtractionState {
        match &self.run {
            None => ExtractionState::Idle,
            Some(run) => match run.outcome.get() {
                Some(state) => state,
                None if run.token.is_cancelled() => ExtractionState::Cancelled,
                None => ExtractionState::Running,
            },
        }
    }

    pub fn snapshot(&self) -> Option<CounterSnapshot> {
        self.run.as_ref().map(|run| run.counter.snapshot())
    }

    pub fn start(
        &mut self,
        sources: Vec<LabeledSource>,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<(), ExtractError> {
        self.start_with_token(sources, sink, CancelToken::new())
    }

    /// 启动新一轮抽帧；已有的运行会先被取消并等待结束
    pub fn start_with_token(
        &mut self,
        sources: Vec<LabeledSource>,
        sink: Arc<dyn ProgressSink>,
        token: CancelToken,
    ) -> Result<(), ExtractError> {
        if let Some(mut previous) = self.run.take() {
            previous.stop();
        }

        let mut reports = Vec::new();
        let mut prepared = Vec::new();
        let mut total = 0u64;

        for source in sources {
            match self.opener.open(&source.video_path) {
                Ok(asset) => {
                    let duration = asset.duration_secs();
                    let times: Vec<Duration> = self.options.sampler.timestamps(duration).collect();
                    debug!(
                        "🎬 '{}': {:.2}s → {} samples",
                        source.label,
                        duration,
                        times.len()
                    );
                    total += times.len() as u64;
                    prepared.push((source, asset, times));
                }
                Err(e) => {
                    warn!("⚠️ Source '{}' unavailable: {}", source.label, e);
                    reports.push(SourceReport::failed(&source, 0, e));
                }
            }
        }

        info!(
            "🚀 Extraction started: {} sources, {} images planned",
            prepared.len(),
            total
        );
        let counter = Arc::new(
            ProgressCounter::new(total, self.options.progress_steps, sink).with_cancel(token.clone()),
        );
        counter.finish_if_empty();

        let outcome = Arc::new(RunOutcome::new(prepared.len(), &token));

        let mut run = ActiveRun {
            token: token.clone(),
            counter: Arc::clone(&counter),
            outcome: Arc::clone(&outcome),
            timeout: self.options.source_timeout,
            jobs: Vec::with_capacity(prepared.len()),
            reports,
        };

        for (source, asset, times) in prepared {
            let planned = times.len() as u64;
            let tally = Arc::new(JobTally::default());
            let ctx = JobContext {
                processor: self.options.processor,
                pool: Arc::clone(&self.pool),
                counter: Arc::clone(&counter),
                tally: Arc::clone(&tally),
                token: token.clone(),
                timeout: self.options.source_timeout,
            };
            let guard_parts = (Arc::clone(&tally), Arc::clone(&outcome), token.clone());
            let job_source = source.clone();
            let started = Instant::now();
            let spawned = thread::Builder::new()
                .name(format!("extract-{}", source.label))
                .spawn(move || {
                    let (tally, outcome, token) = guard_parts;
                    let _guard = JobGuard { tally, outcome, token };
                    run_source_job(job_source, asset, times, ctx)
                });

            match spawned {
                Ok(handle) => run.jobs.push(SourceJob {
                    source,
                    planned,
                    started,
                    tally,
                    handle: Some(handle),
                }),
                Err(e) => {
                    // 已启动的任务随 run 一起取消
                    token.cancel();
                    counter.close();
                    run.join();
                    return Err(ExtractError::Io(e));
                }
            }
        }

        self.run = Some(run);
        Ok(())
    }

    /// 请求取消，重复调用无副作用
    pub fn cancel(&self) {
        if let Some(run) = &self.run {
            if let Some(state) = run.outcome.get() {
                debug!("Extraction already {:?}, cancel ignored", state);
                return;
            }
            if !run.token.is_cancelled() {
                info!("🛑 Extraction cancelled");
            }
            run.token.cancel();
            run.counter.close();
        }
    }

    /// 等待所有任务结束并汇总
    pub fn wait(&mut self) -> Option<ExtractionReport> {
        let run = self.run.as_mut()?;
        run.join();

        let snapshot = run.counter.snapshot();
        let state = run.outcome.settle_now(&run.token);
        let report = ExtractionReport {
            state,
            total_count: snapshot.total,
            completed_count: snapshot.completed,
            sources: std::mem::take(&mut run.reports),
        };

        for failed in report.failed_sources() {
            if let Some(e) = &failed.failure {
                warn!(
                    "⚠️ '{}' finished with {} of {} images: {}",
                    failed.label, failed.written, failed.planned, e
                );
            }
        }
        info!(
            "✅ Extraction {:?}: {}/{} images",
            report.state, report.completed_count, report.total_count
        );
        Some(report)
    }
}

impl Drop for LabelSetExtractor {
    fn drop(&mut self) {
        if let Some(mut run) = self.run.take() {
            run.stop();
        }
        debug!("🗑️ LabelSetExtractor: released");
    }
}

struct JobContext {
    processor: FrameProcessor,
    pool: Arc<ThreadPool>,
    counter: Arc<ProgressCounter>,
    tally: Arc<JobTally>,
    token: CancelToken,
    timeout: Option<Duration>,
}

fn run_source_job(
    source: LabeledSource,
    mut asset: Box<dyn VideoAsset>,
    times: Vec<Duration>,
    ctx: JobContext,
) -> SourceReport {
    let planned = times.len() as u64;

    if let Err(e) = std::fs::create_dir_all(&source.output_directory) {
        ctx.tally.lost(planned, &ctx.counter);
        let failure = ExtractError::Write {
            path: source.output_directory.clone(),
            source: e,
        };
        error!("❌ '{}': {}", source.label, failure);
        return SourceReport::failed(&source, planned, failure);
    }

    let aborted = AtomicBool::new(false);
    let failure: Mutex<Option<ExtractError>> = Mutex::new(None);
    let mut delivered = 0u64;
    let started = Instant::now();

    let fail = |e: ExtractError| {
        aborted.store(true, Ordering::SeqCst);
        let mut slot = failure.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_none() {
            *slot = Some(e);
        }
    };

    ctx.pool.in_place_scope(|scope| {
        asset.generate_frames(&times, &mut |delivery: FrameDelivery| {
            if ctx.token.is_cancelled() || aborted.load(Ordering::SeqCst) || ctx.tally.is_abandoned() {
                return ControlFlow::Break(());
            }
            if let Some(limit) = ctx.timeout {
                if started.elapsed() > limit {
                    fail(ExtractError::TimedOut(limit));
                    return ControlFlow::Break(());
                }
            }

            match delivery.frame {
                Err(e) => {
                    fail(ExtractError::Decode(e));
                    ControlFlow::Break(())
                }
                Ok(None) => {
                    delivered += 1;
                    debug!("'{}': no image at {:?}", source.label, delivery.requested);
                    ctx.tally.skipped(1, &ctx.counter);
                    ControlFlow::Continue(())
                }
                Ok(Some(frame)) => {
                    delivered += 1;
                    let output = source
                        .output_directory
                        .join(format!("{}.jpg", Uuid::new_v4()));
                    let (processor, counter, tally, label) =
                        (&ctx.processor, &ctx.counter, &ctx.tally, &source.label);
                    let fail = &fail;
                    scope.spawn(move |_| match processor.process_to_file(&frame, &output) {
                        Ok(()) => {
                            if !tally.written(counter) {
                                let _ = std::fs::remove_file(&output);
                            }
                        }
                        Err(e) if e.is_frame_level() => {
                            warn!("⚠️ '{}': skipping frame at {:?}: {}", label, frame.timestamp, e);
                            tally.skipped(1, counter);
                        }
                        Err(e) => {
                            error!("❌ '{}': {}", label, e);
                            tally.lost(1, counter);
                            fail(e);
                        }
                    });
                    ControlFlow::Continue(())
                }
            }
        });
    });

    let undelivered = planned - delivered;
    if !ctx.token.is_cancelled() {
        ctx.tally.lost(undelivered, &ctx.counter);
    }

    let (written, skipped) = ctx.tally.counts();
    let failure = failure.into_inner().unwrap_or_else(|p| p.into_inner());
    match &failure {
        Some(e) => warn!("⚠️ '{}' aborted after {} images: {}", source.label, written, e),
        None => info!("✓ '{}': {} images written, {} skipped", source.label, written, skipped),
    }

    SourceReport {
        label: source.label,
        output_directory: source.output_directory,
        planned,
        written,
        skipped,
        failure,
    }
}
