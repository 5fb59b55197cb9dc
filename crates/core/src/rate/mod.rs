use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::{Duration, Instant},
};

const NO_TICK: u64 = u64::MAX;

/// Rolling frame-rate estimator.
///
/// `tick` is called from the sensor callback thread that owns the stream;
/// `value` may be read from any other thread. The published value is an
/// atomic snapshot, so readers never contend with the callback thread.
/// Clones share the same state.
#[derive(Clone)]
pub struct RateWatch {
    inner: Arc<RateInner>,
}

struct RateInner {
    window: Duration,
    origin: Instant,
    ticks: Mutex<VecDeque<Instant>>,
    value_bits: AtomicU64,
    last_tick_nanos: AtomicU64,
}

impl RateWatch {
    /// Creates an estimator observing the given window.
    pub fn new(window: Duration) -> Self {
        Self::with_origin(window, Instant::now())
    }

    fn with_origin(window: Duration, origin: Instant) -> Self {
        Self {
            inner: Arc::new(RateInner {
                window,
                origin,
                ticks: Mutex::new(VecDeque::new()),
                value_bits: AtomicU64::new(0f64.to_bits()),
                last_tick_nanos: AtomicU64::new(NO_TICK),
            }),
        }
    }

    pub fn window(&self) -> Duration {
        self.inner.window
    }

    /// Records one processed frame.
    pub fn tick(&self) {
        self.tick_at(Instant::now());
    }

    /// Records one processed frame observed at `now`.
    pub fn tick_at(&self, now: Instant) {
        let inner = &self.inner;
        let mut ticks = inner.ticks.lock().unwrap_or_else(PoisonError::into_inner);
        ticks.push_back(now);
        while let Some(&oldest) = ticks.front() {
            if now.saturating_duration_since(oldest) > inner.window {
                ticks.pop_front();
            } else {
                break;
            }
        }

        let rate = match (ticks.front(), ticks.back()) {
            (Some(first), Some(last)) if ticks.len() > 1 => {
                let elapsed = last.saturating_duration_since(*first).as_secs_f64();
                if elapsed > 0.0 {
                    (ticks.len() - 1) as f64 / elapsed
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };

        let since_origin = now.saturating_duration_since(inner.origin).as_nanos();
        inner
            .last_tick_nanos
            .store(since_origin.min(u128::from(NO_TICK - 1)) as u64, Ordering::Release);
        inner.value_bits.store(rate.to_bits(), Ordering::Release);
    }

    /// Current frames-per-second estimate.
    pub fn value(&self) -> f64 {
        self.value_at(Instant::now())
    }

    /// Frames-per-second estimate as seen at `now`. A stream that has not
    /// ticked for longer than the window reads as zero.
    pub fn value_at(&self, now: Instant) -> f64 {
        let inner = &self.inner;
        let last = inner.last_tick_nanos.load(Ordering::Acquire);
        if last == NO_TICK {
            return 0.0;
        }
        let last_tick = inner.origin + Duration::from_nanos(last);
        if now.saturating_duration_since(last_tick) > inner.window {
            return 0.0;
        }
        f64::from_bits(inner.value_bits.load(Ordering::Acquire))
    }

    /// Clears all recorded ticks.
    pub fn reset(&self) {
        let inner = &self.inner;
        inner
            .ticks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        inner.last_tick_nanos.store(NO_TICK, Ordering::Release);
        inner.value_bits.store(0f64.to_bits(), Ordering::Release);
    }
}

impl Default for RateWatch {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl std::fmt::Debug for RateWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateWatch")
            .field("window", &self.inner.window)
            .field("value", &self.value())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_zero_before_any_tick() {
        let watch = RateWatch::default();
        assert_eq!(watch.value(), 0.0);
        watch.tick();
        assert_eq!(watch.value(), 0.0);
    }

    #[test]
    fn converges_to_uniform_tick_rate() {
        let origin = Instant::now();
        let watch = RateWatch::with_origin(Duration::from_secs(1), origin);
        let interval = Duration::from_micros(33_333);

        // three seconds of ticks at 30 Hz, longer than the window
        let mut last = origin;
        for i in 0..90u32 {
            last = origin + interval * i;
            watch.tick_at(last);
        }

        let fps = watch.value_at(last);
        assert!((fps - 30.0).abs() < 0.5, "fps was {fps}");
    }

    #[test]
    fn discards_ticks_older_than_window() {
        let origin = Instant::now();
        let watch = RateWatch::with_origin(Duration::from_secs(1), origin);

        for i in 0..60u32 {
            watch.tick_at(origin + Duration::from_millis(10) * i);
        }
        // slow down to 5 Hz for two seconds
        let mut last = origin;
        for i in 1..=10u32 {
            last = origin + Duration::from_millis(600) + Duration::from_millis(200) * i;
            watch.tick_at(last);
        }

        let fps = watch.value_at(last);
        assert!((fps - 5.0).abs() < 0.5, "fps was {fps}");
    }

    #[test]
    fn stalled_stream_reads_as_zero() {
        let origin = Instant::now();
        let watch = RateWatch::with_origin(Duration::from_secs(1), origin);
        watch.tick_at(origin);
        watch.tick_at(origin + Duration::from_millis(100));

        assert!(watch.value_at(origin + Duration::from_millis(100)) > 0.0);
        assert_eq!(watch.value_at(origin + Duration::from_secs(5)), 0.0);
    }

    #[test]
    fn clones_share_state_across_threads() {
        let watch = RateWatch::default();
        let reader = watch.clone();
        let origin = Instant::now();

        std::thread::spawn(move || {
            for i in 0..10u32 {
                watch.tick_at(origin + Duration::from_millis(50) * i);
            }
        })
        .join()
        .unwrap();

        let fps = reader.value_at(origin + Duration::from_millis(450));
        assert!((fps - 20.0).abs() < 0.01, "fps was {fps}");
    }
}
