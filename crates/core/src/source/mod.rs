use std::{
    any::Any,
    collections::BTreeMap,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    },
    time::Duration,
};

use tracing::{debug, error, info, warn};

use crate::{
    sensor::{FrameArrival, FrameCallback, FrameReader, RawFrame, Sensor},
    DumpError, FrameDescription, RateWatch, Result, StreamKind, SyncMode,
};

/// Consumer of the frames of one stream kind.
///
/// Handlers run synchronously on the sensor callback thread and must not
/// block: a slow handler delays every other kind of the same notification.
pub trait FrameHandler: Send {
    fn handle(&mut self, frame: &RawFrame<'_>) -> Result<()>;

    /// Called once when the session closes.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<F> FrameHandler for F
where
    F: FnMut(&RawFrame<'_>) -> Result<()> + Send,
{
    fn handle(&mut self, frame: &RawFrame<'_>) -> Result<()> {
        self(frame)
    }
}

/// Lifecycle of a [`FrameSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Started,
    Closed,
}

/// Whether the session may close the sensor it wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorOwnership {
    Exclusive,
    External,
}

type FirstFrameListener = Box<dyn FnOnce(Duration) + Send>;
type ErrorListener = Arc<dyn Fn(&DumpError) + Send + Sync>;

type Handlers = BTreeMap<StreamKind, Box<dyn FrameHandler>>;

struct Dispatcher {
    sensor: Arc<dyn Sensor>,
    ownership: SensorOwnership,
    handlers: Mutex<Handlers>,
    readers: Mutex<Vec<Box<dyn FrameReader>>>,
    live: AtomicBool,
    halted: AtomicBool,
    rates: BTreeMap<StreamKind, RateWatch>,
    first_frame: OnceLock<Duration>,
    first_frame_listener: Mutex<Option<FirstFrameListener>>,
    error_listener: Mutex<Option<ErrorListener>>,
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

impl Dispatcher {
    fn new(sensor: Arc<dyn Sensor>, ownership: SensorOwnership, rate_window: Duration) -> Self {
        Self {
            sensor,
            ownership,
            handlers: Mutex::new(BTreeMap::new()),
            readers: Mutex::new(Vec::new()),
            live: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            rates: StreamKind::ALL
                .iter()
                .map(|&kind| (kind, RateWatch::new(rate_window)))
                .collect(),
            first_frame: OnceLock::new(),
            first_frame_listener: Mutex::new(None),
            error_listener: Mutex::new(None),
        }
    }

    /// Entry point of every reader callback.
    fn dispatch(&self, arrival: &dyn FrameArrival, kinds: &[StreamKind]) {
        let mut handlers = relock(&self.handlers);
        if !self.live.load(Ordering::Acquire) {
            return;
        }
        for &kind in kinds {
            if self.halted.load(Ordering::Acquire) {
                break;
            }
            let Some(handler) = handlers.get_mut(&kind) else {
                continue;
            };
            if let Err(err) = self.deliver(kind, handler.as_mut(), arrival) {
                self.report(err);
            }
        }
        if self.halted.load(Ordering::Acquire) {
            self.tear_down(&mut handlers);
        }
    }

    /// Acquire, invoke, release and tick for a single kind.
    fn deliver(
        &self,
        kind: StreamKind,
        handler: &mut dyn FrameHandler,
        arrival: &dyn FrameArrival,
    ) -> Result<()> {
        let acquired = panic::catch_unwind(AssertUnwindSafe(move || arrival.acquire(kind)))
            .map_err(|payload| DumpError::frame_process(kind, panic_message(payload)))?;
        let Some(lock) = acquired? else {
            return Ok(());
        };

        let outcome = {
            let frame = lock.frame();
            self.note_first_frame(frame.relative_time);
            panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&frame)))
        };
        drop(lock);
        self.rate(kind).tick();

        match outcome {
            Ok(result) => result,
            Err(payload) => Err(DumpError::frame_process(kind, panic_message(payload))),
        }
    }

    fn note_first_frame(&self, relative_time: Duration) {
        if self.first_frame.set(relative_time).is_err() {
            return;
        }
        debug!(?relative_time, "first frame acquired");
        let listener = relock(&self.first_frame_listener).take();
        if let Some(listener) = listener {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(relative_time))).is_err() {
                warn!("first frame listener panicked");
            }
        }
    }

    fn report(&self, err: DumpError) {
        if err.is_fatal() {
            self.halted.store(true, Ordering::Release);
            self.live.store(false, Ordering::Release);
            error!(error = %err, "output failed, halting capture session");
        } else {
            warn!(error = %err, "frame processing failed");
        }
        let listener = relock(&self.error_listener).clone();
        if let Some(listener) = listener {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(&err))).is_err() {
                warn!("error listener panicked");
            }
        }
    }

    fn rate(&self, kind: StreamKind) -> &RateWatch {
        &self.rates[&kind]
    }

    /// Stops dispatching and waits for an in-flight notification to finish.
    fn detach(&self) {
        self.live.store(false, Ordering::Release);
        drop(relock(&self.handlers));
    }

    fn finish_handlers(&self) {
        finish_all(&mut relock(&self.handlers));
    }

    /// Unsubscribes and disposes every reader of the session.
    fn release_readers(&self) {
        dispose_readers(&mut relock(&self.readers));
    }

    fn close_sensor(&self) {
        if self.ownership == SensorOwnership::Exclusive {
            self.sensor.close();
        }
    }

    /// Releases everything a halted session holds. Runs on the callback
    /// thread with the handler map already locked.
    fn tear_down(&self, handlers: &mut Handlers) {
        finish_all(handlers);
        self.release_readers();
        self.close_sensor();
        info!("halted capture session released its readers");
    }
}

fn dispose_readers(readers: &mut Vec<Box<dyn FrameReader>>) {
    for reader in readers.iter_mut() {
        reader.unsubscribe();
    }
    for mut reader in readers.drain(..) {
        reader.dispose();
    }
}

fn finish_all(handlers: &mut Handlers) {
    for (kind, handler) in handlers.iter_mut() {
        if let Err(err) = handler.finish() {
            warn!(%kind, error = %err, "failed to finish frame handler");
        }
    }
    handlers.clear();
}

struct Inner {
    state: SessionState,
}

/// One capture session over a sensor.
///
/// All methods take `&self`; wrap the source in an `Arc` to close it from a
/// thread other than the one that started it. `close` must not be called
/// from inside one of the session's own handlers.
pub struct FrameSource {
    mode: SyncMode,
    dispatcher: Arc<Dispatcher>,
    inner: Mutex<Inner>,
}

impl FrameSource {
    /// Creates a session that owns `sensor` and closes it on `close`.
    pub fn new(sensor: Arc<dyn Sensor>, mode: SyncMode) -> Self {
        Self::with_ownership(sensor, mode, SensorOwnership::Exclusive)
    }

    /// Creates a session over a sensor shared with other sessions. The
    /// sensor is left open on `close`.
    pub fn with_external_sensor(sensor: Arc<dyn Sensor>, mode: SyncMode) -> Self {
        Self::with_ownership(sensor, mode, SensorOwnership::External)
    }

    fn with_ownership(sensor: Arc<dyn Sensor>, mode: SyncMode, ownership: SensorOwnership) -> Self {
        Self {
            mode,
            dispatcher: Arc::new(Dispatcher::new(sensor, ownership, Duration::from_secs(1))),
            inner: Mutex::new(Inner {
                state: SessionState::Created,
            }),
        }
    }

    /// Uses a custom observation window for the per-kind rate estimators.
    ///
    /// Has no effect once the session has started: the reader callbacks
    /// then share the dispatcher and its estimators are kept.
    pub fn with_rate_window(mut self, window: Duration) -> Self {
        match Arc::get_mut(&mut self.dispatcher) {
            Some(dispatcher) => {
                dispatcher.rates = StreamKind::ALL
                    .iter()
                    .map(|&kind| (kind, RateWatch::new(window)))
                    .collect();
            }
            None => warn!(?window, "rate window ignored, the session has already started"),
        }
        self
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn ownership(&self) -> SensorOwnership {
        self.dispatcher.ownership
    }

    pub fn state(&self) -> SessionState {
        if self.dispatcher.halted.load(Ordering::Acquire) {
            return SessionState::Closed;
        }
        self.lock_inner().map(|inner| inner.state).unwrap_or(SessionState::Closed)
    }

    pub fn frame_description(&self, kind: StreamKind) -> Option<FrameDescription> {
        self.dispatcher.sensor.frame_description(kind)
    }

    /// Subscribes `handler` to frames of `kind`. Exactly one handler per
    /// kind; handlers must be registered before `start`.
    pub fn register_handler<H>(&self, kind: StreamKind, handler: H) -> Result<()>
    where
        H: FrameHandler + 'static,
    {
        let inner = self.lock_inner()?;
        match inner.state {
            SessionState::Created => {}
            SessionState::Started => {
                return Err(DumpError::Configuration(
                    "handlers must be registered before start".into(),
                ))
            }
            SessionState::Closed => return Err(DumpError::UseAfterClose),
        }

        let mut handlers = self.lock_handlers()?;
        if handlers.contains_key(&kind) {
            return Err(DumpError::Configuration(format!(
                "a {kind} handler is already registered"
            )));
        }
        handlers.insert(kind, Box::new(handler));
        debug!(%kind, "frame handler registered");
        Ok(())
    }

    /// Registers the listener notified once with the capture time of the
    /// first frame acquired by this session.
    pub fn on_first_frame<F>(&self, listener: F)
    where
        F: FnOnce(Duration) + Send + 'static,
    {
        *relock(&self.dispatcher.first_frame_listener) = Some(Box::new(listener));
    }

    /// Registers the listener receiving every error raised during dispatch.
    pub fn on_process_error<F>(&self, listener: F)
    where
        F: Fn(&DumpError) + Send + Sync + 'static,
    {
        *relock(&self.dispatcher.error_listener) = Some(Arc::new(listener));
    }

    /// Kinds with a registered handler, in a stable order.
    pub fn registered_kinds(&self) -> Vec<StreamKind> {
        relock(&self.dispatcher.handlers).keys().copied().collect()
    }

    /// Opens the readers for every registered kind and starts the sensor.
    ///
    /// Any reader opened before a failure is released again before the
    /// error is returned.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.lock_inner()?;
        match inner.state {
            SessionState::Created => {}
            SessionState::Started => return Err(DumpError::AlreadyStarted),
            SessionState::Closed => return Err(DumpError::UseAfterClose),
        }
        if self.dispatcher.halted.load(Ordering::Acquire) {
            return Err(DumpError::UseAfterClose);
        }

        let kinds = self.registered_kinds();
        if kinds.is_empty() {
            return Err(DumpError::NoConsumers);
        }

        self.dispatcher.live.store(true, Ordering::Release);
        let mut opened = Vec::new();
        if let Err(err) = self.open_readers(&kinds, &mut opened) {
            self.dispatcher.live.store(false, Ordering::Release);
            dispose_readers(&mut opened);
            let err = match err {
                DumpError::DeviceUnavailable(_) => err,
                other => DumpError::DeviceUnavailable(other.to_string()),
            };
            error!(error = %err, "failed to start frame source");
            return Err(err);
        }

        let readers = opened.len();
        relock(&self.dispatcher.readers).extend(opened);
        inner.state = SessionState::Started;
        if self.dispatcher.halted.load(Ordering::Acquire) {
            // a frame failed to write before the readers were handed over
            self.dispatcher.release_readers();
            self.dispatcher.close_sensor();
        }
        info!(mode = ?self.mode, ?kinds, readers, "frame source started");
        Ok(())
    }

    fn open_readers(&self, kinds: &[StreamKind], opened: &mut Vec<Box<dyn FrameReader>>) -> Result<()> {
        let sensor = &self.dispatcher.sensor;
        match self.mode {
            SyncMode::Multiplexed => opened.push(sensor.open_multi_reader(kinds)?),
            SyncMode::Independent => {
                for &kind in kinds {
                    opened.push(sensor.open_reader(kind)?);
                }
            }
        }

        for reader in opened.iter_mut() {
            let dispatcher = Arc::downgrade(&self.dispatcher);
            let covered: Vec<StreamKind> = reader.kinds().to_vec();
            let callback: FrameCallback = Arc::new(move |arrival: &dyn FrameArrival| {
                let Some(dispatcher) = dispatcher.upgrade() else {
                    return;
                };
                let dispatched = panic::catch_unwind(AssertUnwindSafe(|| {
                    dispatcher.dispatch(arrival, &covered)
                }));
                if dispatched.is_err() {
                    error!("frame dispatch panicked");
                }
            });
            reader.subscribe(callback)?;
        }

        sensor.open()
    }

    /// Detaches every callback, releases the readers and closes the sensor
    /// if this session owns it. Idempotent, and also safe after a write
    /// failure already released the session.
    pub fn close(&self) {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inner.state == SessionState::Closed {
            return;
        }

        self.dispatcher.detach();
        self.dispatcher.release_readers();
        self.dispatcher.finish_handlers();
        self.dispatcher.close_sensor();
        inner.state = SessionState::Closed;
        info!(mode = ?self.mode, "frame source closed");
    }

    /// Current frames-per-second estimate of `kind`.
    pub fn fps(&self, kind: StreamKind) -> f64 {
        self.dispatcher.rate(kind).value()
    }

    /// Shared handle on the rate estimator of `kind`, for reporting threads.
    pub fn rate(&self, kind: StreamKind) -> RateWatch {
        self.dispatcher.rate(kind).clone()
    }

    /// Capture time of the first frame, once one was acquired.
    pub fn first_frame_time(&self) -> Option<Duration> {
        self.dispatcher.first_frame.get().copied()
    }

    fn lock_inner(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| DumpError::msg("frame source state has been poisoned"))
    }

    fn lock_handlers(&self) -> Result<MutexGuard<'_, Handlers>> {
        self.dispatcher
            .handlers
            .lock()
            .map_err(|_| DumpError::msg("frame handlers have been poisoned"))
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for FrameSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSource")
            .field("mode", &self.mode)
            .field("ownership", &self.dispatcher.ownership)
            .field("state", &self.state())
            .field("kinds", &self.registered_kinds())
            .finish()
    }
}
