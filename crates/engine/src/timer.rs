//! Sampling wall-clock timer for node instrumentation.
//!
//! Timing every message would cost more than the work being measured,
//! so only every Nth start/stop pair is sampled. The exported average is
//! a moving mean over the last sampled durations.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Sample every Nth operation by default (10%).
const DEFAULT_SAMPLE_EVERY: u64 = 10;

/// Moving-average window over sampled durations.
const WINDOW: usize = 100;

struct State {
    count: u64,
    started: Option<Instant>,
    samples: VecDeque<u64>,
    sum: u64,
}

struct Inner {
    sample_every: u64,
    state: Mutex<State>,
    avg_ns: AtomicU64,
}

/// Cheap-to-clone handle; all clones share the same average.
#[derive(Clone)]
pub struct Timer {
    inner: Arc<Inner>,
}

impl Timer {
    pub fn new(sample_every: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                sample_every: sample_every.max(1),
                state: Mutex::new(State {
                    count: 0,
                    started: None,
                    samples: VecDeque::with_capacity(WINDOW),
                    sum: 0,
                }),
                avg_ns: AtomicU64::new(0),
            }),
        }
    }

    /// Begin one operation. Only sampled operations record a start time.
    pub fn start(&self) {
        let mut s = self.inner.state.lock().unwrap();
        s.count += 1;
        if s.count % self.inner.sample_every == 0 {
            s.started = Some(Instant::now());
        }
    }

    /// End the operation begun by the matching [`start`].
    ///
    /// [`start`]: Timer::start
    pub fn stop(&self) {
        let mut s = self.inner.state.lock().unwrap();
        if let Some(t0) = s.started.take() {
            let ns = t0.elapsed().as_nanos() as u64;
            if s.samples.len() == WINDOW {
                if let Some(old) = s.samples.pop_front() {
                    s.sum -= old;
                }
            }
            s.samples.push_back(ns);
            s.sum += ns;
            let avg = s.sum / s.samples.len() as u64;
            self.inner.avg_ns.store(avg, Ordering::Relaxed);
        }
    }

    /// Moving average of sampled operation durations.
    pub fn average(&self) -> Duration {
        Duration::from_nanos(self.inner.avg_ns.load(Ordering::Relaxed))
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_EVERY)
    }
}
