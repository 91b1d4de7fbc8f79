// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! SpecBreeze - Spectrometer Acquisition Controller
//!
//! Headless front end for the acquisition core:
//! - Opens the (simulated) spectrometer and starts the acquisition worker
//! - Optionally searches for the best integration time against a white standard
//! - Walks the dark/white calibration when reflectance is requested
//! - Logs accepted live captures and hands them to the save queue

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use crossbeam::channel::{self, Receiver};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use specbreeze::acquisition::{
    CollectionMode, SpectrometerClient, SpectrometerResult, SpectrometerSettings, WorkerHandle, WorkerOptions,
};
use specbreeze::auto_integration::{AutoIntegrationParams, AutoIntegrationRunner};
use specbreeze::hardware::{DeviceInfo, SceneControl, SceneTarget, SimulatorDriver};
use specbreeze::live_view::{DisplayScale, LiveView};
use specbreeze::persistence::{save_queue, SaveQueue, SaveRequest};
use specbreeze::{Config, VERSION};

/// How often the live loop polls for events
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Extra time allowed for a reference capture on top of its exposures
const REFERENCE_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

/// Collection mode selectable on the command line
#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Raw,
    Reflectance,
}

impl From<ModeArg> for CollectionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Raw => CollectionMode::Raw,
            ModeArg::Reflectance => CollectionMode::Reflectance,
        }
    }
}

/// SpecBreeze - Spectrometer Acquisition Controller
#[derive(Parser, Debug)]
#[command(name = "specbreeze")]
#[command(author = "SpecBreeze Project")]
#[command(version = VERSION)]
#[command(about = "Concurrent acquisition controller for scanning spectrometers")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Enable trace-level logging
    #[arg(long)]
    trace: bool,

    /// Collection mode
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    /// Integration time in milliseconds
    #[arg(long)]
    integration_ms: Option<u32>,

    /// Additional scans averaged into each capture
    #[arg(long)]
    scans: Option<u32>,

    /// Search for the integration time before going live
    #[arg(long)]
    auto_integrate: bool,

    /// Stop after this many accepted live captures
    #[arg(long)]
    captures: Option<u64>,

    /// Real seconds slept per simulated exposure second (0 = no sleeping)
    #[arg(long)]
    time_scale: Option<f64>,

    /// Data output directory
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.trace {
        Level::TRACE
    } else if args.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(args.debug)
        .with_line_number(args.debug)
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("SpecBreeze v{} - Spectrometer Acquisition Controller", VERSION);

    // Load or create configuration
    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load_or_create(&config_path)?;

    // Override with command line args
    if let Some(mode) = args.mode {
        config.spectrometer.default_collection_mode = mode.into();
    }
    if let Some(ms) = args.integration_ms {
        config.spectrometer.default_integration_time_us = ms.saturating_mul(1000);
    }
    if let Some(scans) = args.scans {
        config.spectrometer.default_scans_to_average = scans;
    }
    if let Some(time_scale) = args.time_scale {
        config.simulator.time_scale = time_scale.max(0.0);
    }
    if let Some(data_dir) = args.data_dir.clone() {
        config.data_dir = data_dir;
    }
    config.validate().context("invalid configuration after command line overrides")?;

    info!("Configuration loaded from {:?}", config_path);
    info!("Data directory: {:?}", config.data_dir);

    if !config.capabilities.spectrometer {
        warn!("No spectrometer configured on this unit, nothing to do");
        return Ok(());
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_headless(config, args))
}

/// Run the acquisition core until done or interrupted
async fn run_headless(config: Config, args: Args) -> Result<()> {
    info!("Initializing headless mode...");

    let scene = SceneControl::new(SceneTarget::Sample);
    let mut driver = SimulatorDriver::new(config.simulator.clone(), config.spectrometer.clone(), scene.clone());
    let settings = config.initial_settings();
    debug!("Initial settings: {}", serde_json::to_string(&settings)?);

    let (worker, client) = WorkerHandle::spawn(&mut driver, settings, WorkerOptions::from_config(&config))?;
    let device = worker.device_info().clone();

    // Stand-in for the persistence collaborator: report where each capture would go
    let (saves, save_rx) = save_queue(config.channels.save_capacity);
    let data_dir = config.data_dir.clone();
    let saver = std::thread::Builder::new()
        .name("save-drain".to_string())
        .spawn(move || {
            let mut count = 0u64;
            for request in save_rx.iter() {
                count += 1;
                info!(
                    "Save #{}: {} capture, {} bins, {} ms -> {:?}{}",
                    count,
                    request.spectra_type,
                    request.intensities.len(),
                    request.integration_time_ms,
                    request.day_path(&data_dir),
                    if request.wants_plot() { " (+plot)" } else { "" }
                );
            }
            count
        })?;

    let (stop_tx, stop_rx) = channel::bounded::<()>(1);
    let session = Session {
        config,
        device,
        client,
        scene,
        saves,
        stop: stop_rx,
        auto_integrate: args.auto_integrate,
        captures: args.captures,
    };

    info!("SpecBreeze running in headless mode");
    info!("   Press Ctrl+C to shutdown");

    let mut live = tokio::task::spawn_blocking(move || session.run());
    let accepted = tokio::select! {
        res = &mut live => res??,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, cleaning up...");
            let _ = stop_tx.send(());
            live.await??
        }
    };
    info!("{} live capture(s) accepted", accepted);

    tokio::task::spawn_blocking(move || worker.shutdown()).await??;

    match saver.join() {
        Ok(saved) => info!("{} capture(s) handed to the save queue", saved),
        Err(e) => warn!("Save drain panicked: {:?}", e),
    }

    info!("SpecBreeze shutdown complete");
    Ok(())
}

/// Everything the blocking live loop needs
struct Session {
    config: Config,
    device: DeviceInfo,
    client: SpectrometerClient,
    scene: SceneControl,
    saves: SaveQueue,
    stop: Receiver<()>,
    auto_integrate: bool,
    captures: Option<u64>,
}

impl Session {
    fn run(self) -> Result<u64> {
        let mut settings = self.config.initial_settings();
        let mut rescale = false;

        if self.config.capabilities.temperature_sensor {
            warn!("Temperature sensor enabled but no driver is available, captures are saved without it");
        }

        if self.auto_integrate {
            if let Some(integration_time_us) = self.search_integration(&settings) {
                settings.integration_time_us = integration_time_us;
                rescale = true;
            }
        }

        let scale = DisplayScale::new(
            self.config.display.clone(),
            self.device.max_adc_count,
            settings.collection_mode,
        );
        let mut view = LiveView::new(self.client.clone(), settings, self.config.spectrometer.lens_type, scale)
            .with_integration_range(self.config.spectrometer.integration_range());
        if rescale {
            view.request_rescale();
        }

        if settings.collection_mode == CollectionMode::Reflectance && !self.calibrate(&mut view)? {
            return Ok(0);
        }

        self.scene.set_target(SceneTarget::Sample);
        view.enter()?;

        let mut accepted = 0u64;
        'live: loop {
            if self.stop.try_recv().is_ok() {
                break;
            }
            for result in view.poll()? {
                if result.spectra_type.is_plottable() {
                    accepted += 1;
                    info!(
                        "Session {} capture #{}: {} peak {:.3} at {} ms",
                        result.session_id,
                        accepted,
                        result.spectra_type,
                        result.max_intensity().unwrap_or(0.0),
                        result.integration_time_ms()
                    );
                }
                self.save(&result);
                if self.captures.is_some_and(|limit| accepted >= limit) {
                    break 'live;
                }
            }
            if let Some(missing) = view.calibration_required() {
                warn!("Worker refused to capture, missing {:?} reference(s)", missing);
                break;
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        view.exit()?;
        Ok(accepted)
    }

    /// Search against the white standard and apply the result
    fn search_integration(&self, current: &SpectrometerSettings) -> Option<u32> {
        self.scene.set_target(SceneTarget::White);
        let params = AutoIntegrationParams::new(
            &self.config.auto_integration,
            self.device.integration_limits,
            self.device.max_adc_count,
        );
        let margin = Duration::from_millis(self.config.auto_integration.probe_timeout_margin_ms);
        let mut runner = AutoIntegrationRunner::new(self.client.clone(), params, margin);

        match runner.run(current.integration_time_us, current) {
            Ok((reason, integration_time_us)) => {
                info!("Auto-integration proposes {} us ({})", integration_time_us, reason);
                match runner.confirm(current.scans_to_average) {
                    Ok(_) => Some(integration_time_us),
                    Err(e) => {
                        warn!("Could not apply auto-integration result: {}", e);
                        runner.reject();
                        None
                    }
                }
            }
            Err(e) => {
                warn!("Auto-integration failed: {}", e);
                None
            }
        }
    }

    /// Capture dark then white. Returns false if interrupted or timed out.
    fn calibrate(&self, view: &mut LiveView) -> Result<bool> {
        let timeout = view.settings().capture_duration() + REFERENCE_TIMEOUT_MARGIN;

        info!("Capturing dark reference (probe capped)");
        self.scene.set_target(SceneTarget::Dark);
        view.capture_dark()?;
        if !self.wait_for(view, timeout, LiveView::has_dark)? {
            warn!("No dark reference, giving up");
            return Ok(false);
        }

        info!("Capturing white reference (white standard)");
        self.scene.set_target(SceneTarget::White);
        view.capture_white()?;
        if !self.wait_for(view, timeout, LiveView::has_white)? {
            warn!("No white reference, giving up");
            return Ok(false);
        }
        Ok(true)
    }

    fn wait_for(&self, view: &mut LiveView, timeout: Duration, done: fn(&LiveView) -> bool) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.stop.try_recv().is_ok() {
                return Ok(false);
            }
            for result in view.poll()? {
                self.save(&result);
            }
            if done(view) {
                return Ok(true);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        Ok(false)
    }

    fn save(&self, result: &SpectrometerResult) {
        let request = match SaveRequest::from_result(result, self.config.spectrometer.lens_type, None) {
            Ok(request) => request,
            Err(e) => {
                debug!("Not saving capture: {}", e);
                return;
            }
        };
        if let Err(e) = self.saves.submit(request) {
            warn!("Capture not saved: {}", e);
        }
    }
}
