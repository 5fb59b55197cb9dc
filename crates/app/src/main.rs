use std::{
    io::Write,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use clap::Parser;
use crossbeam_channel::{after, bounded, never, select, unbounded};
use kinect_dump_core::{
    dump, format_status, AppConfig, BodyDumper, CaptureConfig, DumpError, FrameSource, RateBoard,
    Sensor, SessionState, SimulatedSensor, SimulationSettings, StatusReporter, StreamDumper,
    StreamKind, SyncMode,
};
use tracing_subscriber::EnvFilter;

fn main() -> kinect_dump_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = cli.load_config()?;
    run(&config, &cli)
}

/// Error raised by one of the capture sessions.
struct SessionEvent {
    session: usize,
    message: String,
    fatal: bool,
}

fn run(config: &AppConfig, cli: &Cli) -> kinect_dump_core::Result<()> {
    let groups = session_groups(&config.capture)?;
    tracing::info!(
        mode = ?config.capture.sync_mode,
        sessions = groups.len(),
        directory = %config.output.directory.display(),
        "starting capture"
    );

    let sensor = SimulatedSensor::new(SimulationSettings {
        fps: cli.fps,
        ..Default::default()
    });
    let device: Arc<dyn Sensor> = Arc::new(sensor.clone());
    let (events, event_rx) = unbounded::<SessionEvent>();
    let mut board = RateBoard::new();
    let mut sessions = Vec::with_capacity(groups.len());

    for (index, kinds) in groups.iter().enumerate() {
        let source = if groups.len() == 1 {
            FrameSource::new(device.clone(), config.capture.sync_mode)
        } else {
            FrameSource::with_external_sensor(device.clone(), config.capture.sync_mode)
        }
        .with_rate_window(config.capture.rate_window());

        for &kind in kinds {
            if kind == StreamKind::Body {
                let dumper = BodyDumper::from_config(&config.output)?;
                board.track_bodies(dumper.tracked_bodies());
                source.register_handler(kind, dumper)?;
            } else {
                let dumper = StreamDumper::from_config(
                    kind,
                    &config.output,
                    source.frame_description(kind),
                )?;
                source.register_handler(kind, dumper)?;
            }
            board.watch(kind, source.rate(kind));
        }

        let label = kinds
            .iter()
            .map(StreamKind::to_string)
            .collect::<Vec<_>>()
            .join("+");
        source.on_first_frame(move |relative_time| {
            tracing::info!(session = %label, ?relative_time, "first frame received");
        });
        let sink = events.clone();
        source.on_process_error(move |err: &DumpError| {
            let _ = sink.send(SessionEvent {
                session: index,
                message: err.to_string(),
                fatal: err.is_fatal(),
            });
        });

        source.start()?;
        sessions.push(source);
    }

    let driver = sensor.spawn_driver()?;
    let reporter = StatusReporter::spawn(board, config.capture.report_interval(), |reports| {
        let mut stdout = std::io::stdout().lock();
        let _ = write!(stdout, "\r{}", format_status(reports));
        let _ = stdout.flush();
    })?;

    let (interrupt, interrupted) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = interrupt.try_send(());
    })
    .map_err(|err| DumpError::msg(format!("failed to install Ctrl-C handler: {err}")))?;

    let deadline = match cli.duration {
        Some(seconds) => after(Duration::from_secs_f64(seconds.max(0.0))),
        None => never(),
    };

    loop {
        select! {
            recv(interrupted) -> _ => {
                tracing::info!("interrupted, shutting down");
                break;
            }
            recv(deadline) -> _ => {
                tracing::info!("capture duration elapsed");
                break;
            }
            recv(event_rx) -> event => {
                let Ok(event) = event else { break };
                if event.fatal {
                    tracing::error!(session = event.session, error = %event.message, "closing session");
                    sessions[event.session].close();
                } else {
                    tracing::warn!(session = event.session, error = %event.message, "frame skipped");
                }
                if sessions.iter().all(|source| source.state() == SessionState::Closed) {
                    tracing::error!("every capture session has stopped");
                    break;
                }
            }
        }
    }

    reporter.stop();
    driver.stop();
    for source in &sessions {
        source.close();
    }
    device.close();
    println!();

    let captured: Vec<StreamKind> = groups.into_iter().flatten().collect();
    for path in dump::output_paths(&captured, &config.output) {
        tracing::info!(path = %path.display(), "output written");
    }
    Ok(())
}

/// Splits the configured streams into capture sessions. Independent
/// streams get one session each unless a shared session is requested;
/// multiplexed streams always share one.
fn session_groups(capture: &CaptureConfig) -> kinect_dump_core::Result<Vec<Vec<StreamKind>>> {
    let mut streams = capture.streams.clone();
    streams.sort();
    streams.dedup();
    if streams.is_empty() {
        return Err(DumpError::Configuration("no stream selected".into()));
    }

    if capture.session_per_stream && capture.sync_mode == SyncMode::Independent {
        Ok(streams.into_iter().map(|kind| vec![kind]).collect())
    } else {
        Ok(vec![streams])
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

fn parse_stream(value: &str) -> Result<StreamKind, String> {
    value.parse().map_err(|err: DumpError| err.to_string())
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Dump motion sensor streams to disk", long_about = None)]
struct Cli {
    /// JSON configuration file. Flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Record one video file per image stream.
    #[arg(long)]
    video: bool,
    /// Do not write a PNG file per frame.
    #[arg(long)]
    no_stills: bool,
    /// Deliver every stream as one correlated frame set.
    #[arg(long)]
    synchronize: bool,
    /// Capture every stream in a single session.
    #[arg(long)]
    shared_session: bool,
    /// File name prefix of video and skeleton outputs.
    #[arg(long)]
    prefix: Option<String>,
    /// Directory receiving every output.
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Comma separated streams to capture: body, color, depth, infrared, bodyIndex.
    #[arg(long, value_delimiter = ',', value_parser = parse_stream)]
    streams: Vec<StreamKind>,
    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long)]
    duration: Option<f64>,
    /// Frame rate of the simulated sensor.
    #[arg(long, default_value_t = 30)]
    fps: u32,
}

impl Cli {
    fn load_config(&self) -> kinect_dump_core::Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => AppConfig::from_json_file(path)?,
            None => AppConfig::default(),
        };

        if self.video {
            config.output.video = true;
        }
        if self.no_stills {
            config.output.stills = false;
        }
        if self.synchronize {
            config.capture.sync_mode = SyncMode::Multiplexed;
            config.capture.session_per_stream = false;
        }
        if self.shared_session {
            config.capture.session_per_stream = false;
        }
        if let Some(prefix) = &self.prefix {
            config.output.prefix = prefix.clone();
        }
        if let Some(directory) = &self.output_dir {
            config.output.directory = directory.clone();
        }
        if !self.streams.is_empty() {
            config.capture.streams = self.streams.clone();
        }
        Ok(config)
    }
}
