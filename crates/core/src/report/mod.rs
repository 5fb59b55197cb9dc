use std::{
    fmt::Write as _,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use serde::Serialize;
use tracing::debug;

use crate::{RateWatch, Result, StreamKind};

/// Snapshot of one stream at report time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StreamReport {
    pub kind: StreamKind,
    pub fps: f64,
    /// Tracked bodies, for the body stream only.
    pub bodies: Option<usize>,
}

/// Set of streams observed by a [`StatusReporter`].
#[derive(Debug, Clone, Default)]
pub struct RateBoard {
    entries: Vec<(StreamKind, RateWatch)>,
    bodies: Option<Arc<AtomicUsize>>,
}

impl RateBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch(&mut self, kind: StreamKind, rate: RateWatch) {
        self.entries.push((kind, rate));
    }

    pub fn track_bodies(&mut self, tracked: Arc<AtomicUsize>) {
        self.bodies = Some(tracked);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Vec<StreamReport> {
        self.entries
            .iter()
            .map(|(kind, rate)| StreamReport {
                kind: *kind,
                fps: rate.value(),
                bodies: match kind {
                    StreamKind::Body => self
                        .bodies
                        .as_ref()
                        .map(|tracked| tracked.load(Ordering::Acquire)),
                    _ => None,
                },
            })
            .collect()
    }
}

/// Renders a snapshot as a single status line, e.g.
/// `1 Skeleton(s) @ 30.0 Fps - depth @ 30.0 Fps`.
pub fn format_status(reports: &[StreamReport]) -> String {
    let mut line = String::new();
    for report in reports {
        if !line.is_empty() {
            line.push_str(" - ");
        }
        let _ = match (report.kind, report.bodies) {
            (StreamKind::Body, Some(bodies)) => {
                write!(line, "{bodies} Skeleton(s) @ {:.1} Fps", report.fps)
            }
            (kind, _) => write!(line, "{kind} @ {:.1} Fps", report.fps),
        };
    }
    line
}

/// Background thread publishing a [`RateBoard`] snapshot at a fixed
/// interval until stopped or dropped.
pub struct StatusReporter {
    stop: Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl StatusReporter {
    pub fn spawn<F>(board: RateBoard, interval: Duration, mut publish: F) -> Result<Self>
    where
        F: FnMut(&[StreamReport]) + Send + 'static,
    {
        let (stop, stopped) = bounded::<()>(1);
        let join = thread::Builder::new()
            .name("status-reporter".into())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => publish(&board.snapshot()),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        debug!(?interval, "status reporter started");
        Ok(Self {
            stop,
            join: Some(join),
        })
    }

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

impl Drop for StatusReporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}
