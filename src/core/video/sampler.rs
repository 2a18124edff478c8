//! 采样时间点生成

use std::time::Duration;

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(20);

/// 以固定步长生成 `0, S, 2S, …`（严格小于时长）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSampler {
    step: Duration,
}

impl FrameSampler {
    /// # Panics
    /// `step` 为零时 panic（与 `Iterator::step_by(0)` 一致）
    pub fn new(step: Duration) -> Self {
        assert!(!step.is_zero(), "sample step must be non-zero");
        Self { step }
    }

    pub fn step(&self) -> Duration {
        self.step
    }

    /// 时长 ≤ 0 或非有限值时为 0
    pub fn count(&self, duration_secs: f64) -> usize {
        let Some(duration) = to_duration(duration_secs) else {
            return 0;
        };
        let d = duration.as_nanos();
        let s = self.step.as_nanos();
        usize::try_from(d.div_ceil(s)).unwrap_or(usize::MAX)
    }

    pub fn timestamps(&self, duration_secs: f64) -> SampleTimestamps {
        SampleTimestamps {
            step: self.step,
            next: 0,
            len: self.count(duration_secs),
        }
    }
}

impl Default for FrameSampler {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_INTERVAL)
    }
}

/// 正的时长至少为 1ns，超出范围时取 `Duration::MAX`
fn to_duration(secs: f64) -> Option<Duration> {
    if !secs.is_finite() || secs <= 0.0 {
        return None;
    }
    let duration = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
    Some(duration.max(Duration::from_nanos(1)))
}

const NANOS_PER_SEC: u128 = 1_000_000_000;

#[derive(Debug, Clone)]
pub struct SampleTimestamps {
    step: Duration,
    next: usize,
    len: usize,
}

impl Iterator for SampleTimestamps {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.next >= self.len {
            return None;
        }
        // 时间点小于时长，秒数不会超出 u64
        let nanos = self.step.as_nanos() * self.next as u128;
        self.next += 1;
        let secs = u64::try_from(nanos / NANOS_PER_SEC).unwrap_or(u64::MAX);
        Some(Duration::new(secs, (nanos % NANOS_PER_SEC) as u32))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.len - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for SampleTimestamps {}
