//! Throughput and ETA estimation shared by the fragment orchestrator and the
//! segment assembly engine.
//!
//! [`ProgressCalculator`] keeps a sliding window of `(time, downloaded)` samples
//! and derives an exponentially smoothed speed and ETA from it. Several
//! contributors (one per concurrent fetch) may report cumulative byte counts;
//! each contributor's count is tracked separately so only the delta is added.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const SAMPLING_WINDOW: Duration = Duration::from_secs(3);
const SAMPLING_RATE: Duration = Duration::from_millis(50);
const GRACE_PERIOD: Duration = Duration::from_secs(1);

/// Exponentially smoothed value.
#[derive(Debug, Clone, Copy)]
struct SmoothValue {
    value: Option<f64>,
    smooth: Option<f64>,
    smoothing: f64,
}

impl SmoothValue {
    fn new(initial: Option<f64>, smoothing: f64) -> Self {
        Self {
            value: initial,
            smooth: initial,
            smoothing,
        }
    }

    fn set(&mut self, value: f64) {
        self.value = Some(value);
        self.smooth = Some(match self.smooth {
            None => value,
            Some(previous) => (1.0 - self.smoothing) * value + self.smoothing * previous,
        });
    }

    fn clear(&mut self) {
        self.value = None;
    }
}

#[derive(Debug)]
struct CalculatorState {
    downloaded: u64,
    total: Option<u64>,
    elapsed: Duration,
    speed: SmoothValue,
    eta: SmoothValue,
    last_update: Instant,
    samples: VecDeque<(Instant, u64)>,
    contributors: HashMap<usize, u64>,
}

/// Point-in-time view of a [`ProgressCalculator`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub downloaded: u64,
    pub total: Option<u64>,
    pub elapsed: Duration,
    /// Smoothed speed in bytes per second.
    pub speed: Option<f64>,
    /// Smoothed remaining time in seconds.
    pub eta: Option<f64>,
}

#[derive(Debug)]
pub struct ProgressCalculator {
    start: Instant,
    state: Mutex<CalculatorState>,
}

impl ProgressCalculator {
    pub fn new(initial: u64) -> Self {
        Self::starting_at(initial, Instant::now())
    }

    fn starting_at(initial: u64, start: Instant) -> Self {
        Self {
            start,
            state: Mutex::new(CalculatorState {
                downloaded: initial,
                total: None,
                elapsed: Duration::ZERO,
                speed: SmoothValue::new(Some(0.0), 0.7),
                eta: SmoothValue::new(None, 0.9),
                last_update: start,
                samples: VecDeque::new(),
                contributors: HashMap::new(),
            }),
        }
    }

    /// Set the expected total. A total below what was already downloaded is
    /// raised to the downloaded count.
    pub fn set_total(&self, total: Option<u64>) {
        let mut state = self.state.lock();
        state.total = total.map(|t| t.max(state.downloaded));
    }

    /// Report the cumulative byte count of one contributor.
    pub fn update(&self, contributor: usize, size: u64) {
        self.update_at(contributor, size, Instant::now());
    }

    /// Start a new unit of work for `contributor`; its next report starts from zero.
    pub fn reset_contributor(&self, contributor: usize) {
        self.state.lock().contributors.insert(contributor, 0);
    }

    /// Forget a finished contributor. Bytes it reported stay counted.
    pub fn remove_contributor(&self, contributor: usize) {
        self.state.lock().contributors.remove(&contributor);
    }

    fn update_at(&self, contributor: usize, size: u64, now: Instant) {
        if size == 0 {
            return;
        }
        let mut state = self.state.lock();
        let last = state.contributors.insert(contributor, size).unwrap_or(0);
        let delta = size.saturating_sub(last);
        self.record(&mut state, delta, now);
    }

    fn record(&self, state: &mut CalculatorState, delta: u64, now: Instant) {
        state.downloaded += delta;
        state.elapsed = now.saturating_duration_since(self.start);
        if let Some(total) = state.total
            && state.downloaded > total
        {
            state.total = Some(state.downloaded);
        }

        if !state.samples.is_empty() && state.last_update + SAMPLING_RATE > now {
            return;
        }
        state.last_update = now;
        let downloaded = state.downloaded;
        state.samples.push_back((now, downloaded));

        let window_start = now.checked_sub(SAMPLING_WINDOW);
        while let (Some(window_start), Some(&(t, _))) = (window_start, state.samples.front()) {
            if t >= window_start {
                break;
            }
            state.samples.pop_front();
        }

        let Some(&(first_time, first_bytes)) = state.samples.front() else {
            return;
        };
        let span = now.saturating_duration_since(first_time).as_secs_f64();
        if span <= 0.0 {
            return;
        }
        let speed = (state.downloaded - first_bytes) as f64 / span;
        state.speed.set(speed);

        match state.total {
            Some(total) if speed > 0.0 && state.elapsed > GRACE_PERIOD => {
                state.eta.set(total.saturating_sub(state.downloaded) as f64 / speed);
            }
            _ => state.eta.clear(),
        }
    }

    pub fn downloaded(&self) -> u64 {
        self.state.lock().downloaded
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.state.lock();
        ProgressSnapshot {
            downloaded: state.downloaded,
            total: state.total,
            elapsed: self.start.elapsed(),
            speed: state.speed.smooth,
            eta: state.eta.value.and(state.eta.smooth),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStatus {
    Downloading,
    Finished,
}

/// Payload handed to the progress hook.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub status: ProgressStatus,
    pub filename: PathBuf,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub total_bytes_estimate: Option<u64>,
    pub eta: Option<f64>,
    pub speed: Option<f64>,
    pub elapsed: Duration,
    pub fragment_index: Option<u64>,
    pub fragment_count: Option<u64>,
    /// Slot of this stream when several streams download together.
    pub progress_idx: usize,
}

pub type ProgressHook = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Delivers events to a hook, dropping `downloading` events that arrive faster
/// than the configured interval. `finished` events are always delivered.
pub struct ProgressReporter {
    hook: Option<ProgressHook>,
    interval: Duration,
    last_emit: Mutex<Option<Instant>>,
}

impl ProgressReporter {
    pub fn new(hook: Option<ProgressHook>, interval: Duration) -> Self {
        Self {
            hook,
            interval,
            last_emit: Mutex::new(None),
        }
    }

    pub fn report(&self, event: &ProgressEvent) {
        let Some(hook) = &self.hook else {
            return;
        };
        if event.status == ProgressStatus::Downloading {
            let now = Instant::now();
            let mut last = self.last_emit.lock();
            if let Some(previous) = *last
                && now.saturating_duration_since(previous) < self.interval
            {
                return;
            }
            *last = Some(now);
        }
        hook(event);
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("has_hook", &self.hook.is_some())
            .field("interval", &self.interval)
            .finish()
    }
}
