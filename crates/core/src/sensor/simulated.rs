use std::{
    collections::{HashMap, HashSet},
    f32::consts::PI,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::{debug, info};

use super::{FrameArrival, FrameCallback, FrameLock, FramePayload, FrameReader, RawFrame, Sensor};
use crate::{
    body::{Body, CameraSpacePoint, Joint, JointType, TrackingState, BODY_SLOTS},
    DumpError, FrameDescription, ReliableRange, Result, StreamKind,
};

/// Behaviour of a [`SimulatedSensor`].
#[derive(Debug, Clone)]
pub struct SimulationSettings {
    /// Notifications per second produced by the driver thread.
    pub fps: u32,
    /// Number of tracked bodies in body and body index frames.
    pub tracked_bodies: usize,
    /// Reliable range reported with depth and infrared frames.
    pub reliable_range: ReliableRange,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            fps: 30,
            tracked_bodies: 1,
            reliable_range: ReliableRange::new(500, 4500),
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    device_open: bool,
    readers: HashSet<StreamKind>,
    acquire: HashSet<StreamKind>,
    missing: HashSet<StreamKind>,
}

struct ReaderSlot {
    kinds: Vec<StreamKind>,
    callback: Mutex<Option<FrameCallback>>,
    disposed: AtomicBool,
}

struct Shared {
    settings: SimulationSettings,
    open: AtomicBool,
    sequence: AtomicU64,
    readers: Mutex<Vec<Arc<ReaderSlot>>>,
    faults: Mutex<Faults>,
    overrides: Mutex<HashMap<StreamKind, Vec<u8>>>,
    readers_opened: AtomicUsize,
    readers_disposed: AtomicUsize,
    frames_acquired: AtomicUsize,
    frames_released: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Synthetic motion sensor. Clones share the same device.
#[derive(Clone)]
pub struct SimulatedSensor {
    shared: Arc<Shared>,
}

impl SimulatedSensor {
    pub fn new(settings: SimulationSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                open: AtomicBool::new(false),
                sequence: AtomicU64::new(0),
                readers: Mutex::new(Vec::new()),
                faults: Mutex::new(Faults::default()),
                overrides: Mutex::new(HashMap::new()),
                readers_opened: AtomicUsize::new(0),
                readers_disposed: AtomicUsize::new(0),
                frames_acquired: AtomicUsize::new(0),
                frames_released: AtomicUsize::new(0),
            }),
        }
    }

    pub fn settings(&self) -> &SimulationSettings {
        &self.shared.settings
    }

    /// Replaces the generated samples of `kind` with a fixed buffer.
    pub fn set_samples(&self, kind: StreamKind, samples: Vec<u8>) {
        lock(&self.shared.overrides).insert(kind, samples);
    }

    /// Makes `open` fail until cleared.
    pub fn fail_device_open(&self, fail: bool) {
        lock(&self.shared.faults).device_open = fail;
    }

    /// Makes opening a reader that covers `kind` fail.
    pub fn fail_reader(&self, kind: StreamKind) {
        lock(&self.shared.faults).readers.insert(kind);
    }

    /// Makes acquiring a `kind` sub-frame return an error.
    pub fn fail_acquire(&self, kind: StreamKind) {
        lock(&self.shared.faults).acquire.insert(kind);
    }

    /// Makes acquiring a `kind` sub-frame report that no frame is ready.
    pub fn withhold_frames(&self, kind: StreamKind) {
        lock(&self.shared.faults).missing.insert(kind);
    }

    pub fn clear_faults(&self) {
        *lock(&self.shared.faults) = Faults::default();
    }

    pub fn readers_opened(&self) -> usize {
        self.shared.readers_opened.load(Ordering::Acquire)
    }

    pub fn readers_disposed(&self) -> usize {
        self.shared.readers_disposed.load(Ordering::Acquire)
    }

    /// Readers opened and not yet disposed.
    pub fn active_readers(&self) -> usize {
        lock(&self.shared.readers).len()
    }

    pub fn frames_acquired(&self) -> usize {
        self.shared.frames_acquired.load(Ordering::Acquire)
    }

    pub fn frames_released(&self) -> usize {
        self.shared.frames_released.load(Ordering::Acquire)
    }

    /// Delivers one notification to every subscribed reader on the calling
    /// thread. Returns the number of callbacks invoked. Nothing is
    /// delivered while the device is closed.
    pub fn pump(&self) -> usize {
        if !self.is_open() {
            return 0;
        }
        let sequence = self.shared.sequence.fetch_add(1, Ordering::AcqRel);
        let slots: Vec<Arc<ReaderSlot>> = lock(&self.shared.readers).clone();

        let mut delivered = 0;
        for slot in slots {
            let Some(callback) = lock(&slot.callback).clone() else {
                continue;
            };
            let arrival = SimulatedArrival {
                shared: &self.shared,
                kinds: &slot.kinds,
                sequence,
            };
            callback(&arrival as &dyn FrameArrival);
            delivered += 1;
        }
        delivered
    }

    /// Spawns a thread pumping notifications at the configured rate until
    /// the returned handle is stopped or dropped.
    pub fn spawn_driver(&self) -> Result<DriverHandle> {
        let fps = self.shared.settings.fps.max(1);
        let interval = Duration::from_secs(1) / fps;
        let (stop, stopped) = bounded::<()>(1);
        let sensor = self.clone();

        let join = thread::Builder::new()
            .name("simulated-sensor".into())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        sensor.pump();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        info!(fps, "simulated sensor driver started");
        Ok(DriverHandle {
            stop,
            join: Some(join),
        })
    }

    fn register_reader(&self, kinds: Vec<StreamKind>) -> Result<Box<dyn FrameReader>> {
        {
            let faults = lock(&self.shared.faults);
            if let Some(kind) = kinds.iter().find(|kind| faults.readers.contains(*kind)) {
                return Err(DumpError::DeviceUnavailable(format!(
                    "could not open {kind} reader"
                )));
            }
        }
        let slot = Arc::new(ReaderSlot {
            kinds,
            callback: Mutex::new(None),
            disposed: AtomicBool::new(false),
        });
        lock(&self.shared.readers).push(slot.clone());
        self.shared.readers_opened.fetch_add(1, Ordering::AcqRel);
        debug!(kinds = ?slot.kinds, "simulated reader opened");
        Ok(Box::new(SimulatedReader {
            slot,
            shared: self.shared.clone(),
        }))
    }
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self::new(SimulationSettings::default())
    }
}

impl Sensor for SimulatedSensor {
    fn frame_description(&self, kind: StreamKind) -> Option<FrameDescription> {
        kind.native_description()
    }

    fn open_reader(&self, kind: StreamKind) -> Result<Box<dyn FrameReader>> {
        self.register_reader(vec![kind])
    }

    fn open_multi_reader(&self, kinds: &[StreamKind]) -> Result<Box<dyn FrameReader>> {
        if kinds.is_empty() {
            return Err(DumpError::Configuration(
                "a multi-source reader needs at least one stream".into(),
            ));
        }
        self.register_reader(kinds.to_vec())
    }

    fn open(&self) -> Result<()> {
        if lock(&self.shared.faults).device_open {
            return Err(DumpError::DeviceUnavailable(
                "simulated sensor refused to open".into(),
            ));
        }
        if !self.shared.open.swap(true, Ordering::AcqRel) {
            info!("simulated sensor opened");
        }
        Ok(())
    }

    fn close(&self) {
        if self.shared.open.swap(false, Ordering::AcqRel) {
            info!("simulated sensor closed");
        }
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for SimulatedSensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedSensor")
            .field("settings", &self.shared.settings)
            .field("open", &self.is_open())
            .field("active_readers", &self.active_readers())
            .finish()
    }
}

/// Stops the driver thread when stopped or dropped.
pub struct DriverHandle {
    stop: Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl DriverHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop.try_send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for DriverHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct SimulatedReader {
    slot: Arc<ReaderSlot>,
    shared: Arc<Shared>,
}

impl FrameReader for SimulatedReader {
    fn kinds(&self) -> &[StreamKind] {
        &self.slot.kinds
    }

    fn subscribe(&mut self, callback: FrameCallback) -> Result<()> {
        if self.slot.disposed.load(Ordering::Acquire) {
            return Err(DumpError::UseAfterClose);
        }
        *lock(&self.slot.callback) = Some(callback);
        Ok(())
    }

    fn unsubscribe(&mut self) {
        lock(&self.slot.callback).take();
    }

    fn dispose(&mut self) {
        if self.slot.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        lock(&self.slot.callback).take();
        lock(&self.shared.readers).retain(|slot| !Arc::ptr_eq(slot, &self.slot));
        self.shared.readers_disposed.fetch_add(1, Ordering::AcqRel);
    }
}

impl Drop for SimulatedReader {
    fn drop(&mut self) {
        self.dispose();
    }
}

struct SimulatedArrival<'s> {
    shared: &'s Shared,
    kinds: &'s [StreamKind],
    sequence: u64,
}

impl FrameArrival for SimulatedArrival<'_> {
    fn acquire(&self, kind: StreamKind) -> Result<Option<Box<dyn FrameLock + '_>>> {
        if !self.kinds.contains(&kind) {
            return Ok(None);
        }
        {
            let faults = lock(&self.shared.faults);
            if faults.acquire.contains(&kind) {
                return Err(DumpError::frame_process(kind, "simulated acquisition failure"));
            }
            if faults.missing.contains(&kind) {
                return Ok(None);
            }
        }

        let settings = &self.shared.settings;
        let relative_time = Duration::from_secs(1) / settings.fps.max(1) * self.sequence as u32;
        let content = match kind.native_description() {
            Some(description) => {
                let data = lock(&self.shared.overrides)
                    .get(&kind)
                    .cloned()
                    .unwrap_or_else(|| synthesize(kind, description, self.sequence, settings));
                Content::Samples {
                    description,
                    data,
                    reliable: matches!(kind, StreamKind::Depth | StreamKind::Infrared)
                        .then_some(settings.reliable_range),
                }
            }
            None => Content::Bodies(synthesize_bodies(self.sequence, settings.tracked_bodies)),
        };

        self.shared.frames_acquired.fetch_add(1, Ordering::AcqRel);
        Ok(Some(Box::new(SimulatedLock {
            kind,
            relative_time,
            content,
            released: &self.shared.frames_released,
        })))
    }
}

enum Content {
    Samples {
        description: FrameDescription,
        data: Vec<u8>,
        reliable: Option<ReliableRange>,
    },
    Bodies(Vec<Body>),
}

struct SimulatedLock<'s> {
    kind: StreamKind,
    relative_time: Duration,
    content: Content,
    released: &'s AtomicUsize,
}

impl FrameLock for SimulatedLock<'_> {
    fn frame(&self) -> RawFrame<'_> {
        let (description, payload) = match &self.content {
            Content::Samples {
                description,
                data,
                reliable,
            } => (
                *description,
                FramePayload::Samples {
                    data,
                    reliable: *reliable,
                },
            ),
            Content::Bodies(bodies) => (FrameDescription::new(0, 0, 0), FramePayload::Bodies(bodies)),
        };
        RawFrame {
            kind: self.kind,
            description,
            relative_time: self.relative_time,
            payload,
        }
    }
}

impl Drop for SimulatedLock<'_> {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::AcqRel);
    }
}

fn synthesize(
    kind: StreamKind,
    description: FrameDescription,
    sequence: u64,
    settings: &SimulationSettings,
) -> Vec<u8> {
    let FrameDescription { width, height, .. } = description;
    let mut data = Vec::with_capacity(description.byte_len());
    let shift = (sequence % 4096) as u32;
    for y in 0..height {
        for x in 0..width {
            match kind {
                StreamKind::Depth => {
                    let depth = 500 + ((x + y + shift * 8) % 4000) as u16;
                    data.extend_from_slice(&depth.to_le_bytes());
                }
                StreamKind::Infrared => {
                    let ir = ((x * 128 + shift * 256) % 65536) as u16;
                    data.extend_from_slice(&ir.to_le_bytes());
                }
                StreamKind::BodyIndex => {
                    data.push(body_slot_at(x, y, width, shift, settings.tracked_bodies));
                }
                StreamKind::Color => {
                    data.extend_from_slice(&[x as u8, y as u8, shift as u8, 0xFF]);
                }
                StreamKind::Body => {}
            }
        }
    }
    data
}

/// Body slot occupying pixel `(x, y)`: one vertical band per tracked body,
/// drifting horizontally with the frame sequence.
fn body_slot_at(x: u32, y: u32, width: u32, shift: u32, bodies: usize) -> u8 {
    const BACKGROUND: u8 = 0xFF;
    if bodies == 0 || y < 40 {
        return BACKGROUND;
    }
    let band = (width / (bodies.min(BODY_SLOTS) as u32 * 2)).max(1);
    let position = (x + width - (shift * 2) % width) % width;
    let slot = position / band;
    if slot % 2 == 0 && ((slot / 2) as usize) < bodies.min(BODY_SLOTS) {
        (slot / 2) as u8
    } else {
        BACKGROUND
    }
}

fn synthesize_bodies(sequence: u64, tracked: usize) -> Vec<Body> {
    let phase = sequence as f32 / 30.0 * 2.0 * PI;
    (0..BODY_SLOTS)
        .map(|slot| {
            if slot >= tracked {
                return Body::untracked();
            }
            let offset = slot as f32 * 0.6 - 0.3;
            let joints = JointType::ALL
                .iter()
                .enumerate()
                .map(|(index, &joint_type)| Joint {
                    joint_type,
                    position: CameraSpacePoint {
                        x: offset + 0.05 * phase.sin(),
                        y: 0.8 - index as f32 * 0.06,
                        z: 2.0 + 0.1 * phase.cos(),
                    },
                    tracking_state: TrackingState::Tracked,
                })
                .collect();
            Body {
                tracking_id: 72057594037927936 + slot as u64,
                is_tracked: true,
                joints,
            }
        })
        .collect()
}
