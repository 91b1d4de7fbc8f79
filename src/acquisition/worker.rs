// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! The acquisition worker
//!
//! Sole owner of the device handle. Runs on its own thread, pulls commands
//! from the command queue between captures and posts every capture and every
//! acknowledgement to the event queue. A blocking exposure is never
//! interrupted; commands that arrive meanwhile wait for it to finish.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use crossbeam::channel::{Receiver, TryRecvError};
use tracing::{debug, error, info, trace, warn};

use super::{
    channels, CollectionMode, CommandAck, CommandEnvelope, CommandOutcome, CommandSender, EventPublisher,
    ScanAccumulator, SessionCounter, SessionId, SessionObserver, SpectraType, SpectrometerClient, SpectrometerCommand,
    SpectrometerResult, SpectrometerSettings, Ticket, WorkerEndpoints, WorkerEvent,
};
use crate::calibration::{compute_reflectance, ReferenceKind, ReferenceStore};
use crate::config::Config;
use crate::error::{AcquisitionError, AcquisitionResult};
use crate::hardware::{DeviceInfo, IntegrationLimits, SpectrometerDevice, SpectrometerDriver};

/// How long `shutdown` waits for room in a saturated command queue
const SHUTDOWN_SUBMIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Queue sizes and limits the worker is started with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Command queue capacity
    pub command_capacity: usize,
    /// Event queue capacity
    pub event_capacity: usize,
    /// Upper bound for `scans_to_average`
    pub max_scans_to_average: u32,
}

impl WorkerOptions {
    /// Options from the `channels` and `spectrometer` sections
    pub fn from_config(config: &Config) -> Self {
        Self {
            command_capacity: config.channels.command_capacity,
            event_capacity: config.channels.result_capacity,
            max_scans_to_average: config.spectrometer.max_scans_to_average,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

enum Capture {
    Complete(Vec<f64>),
    /// Abandoned between exposures because a shutdown is waiting
    Interrupted,
}

/// Owns the device and runs the command loop
pub struct AcquisitionWorker<D: SpectrometerDevice> {
    device: D,
    wavelengths: Arc<[f64]>,
    limits: IntegrationLimits,
    settings: SpectrometerSettings,
    max_scans_to_average: u32,
    session: SessionCounter,
    armed: bool,
    /// Ticket of the command that armed the current session
    armed_by: Ticket,
    references: ReferenceStore,
    commands: Receiver<CommandEnvelope>,
    events: EventPublisher,
    /// Commands received while a capture was in progress
    pending: VecDeque<CommandEnvelope>,
}

impl<D: SpectrometerDevice> AcquisitionWorker<D> {
    /// Take ownership of an opened device. Starts disarmed.
    pub fn new(
        device: D,
        settings: SpectrometerSettings,
        max_scans_to_average: u32,
        endpoints: WorkerEndpoints,
    ) -> AcquisitionResult<Self> {
        let wavelengths: Arc<[f64]> = device.wavelengths().into();
        if wavelengths.is_empty() {
            return Err(AcquisitionError::InvalidSettings(
                "device reported an empty wavelength table".to_string(),
            ));
        }
        if settings.scans_to_average > max_scans_to_average {
            return Err(AcquisitionError::InvalidSettings(format!(
                "scans to average {} exceeds the maximum of {}",
                settings.scans_to_average, max_scans_to_average
            )));
        }

        let limits = device.info().integration_limits;
        let mut worker = Self {
            device,
            wavelengths,
            limits,
            settings,
            max_scans_to_average,
            session: SessionCounter::new(),
            armed: false,
            armed_by: 0,
            references: ReferenceStore::new(),
            commands: endpoints.commands,
            events: endpoints.events,
            pending: VecDeque::new(),
        };
        worker.settings.integration_time_us = worker.clamp_integration(settings.integration_time_us);
        Ok(worker)
    }

    /// Read access to the session counter, usable after `run` moves the worker
    pub fn session_observer(&self) -> SessionObserver {
        self.session.observer()
    }

    /// Command loop. Returns after `Shutdown` or once every client is gone.
    pub fn run(mut self) {
        let info = self.device.info();
        info!(
            "Acquisition worker started on {} (serial {}, {} bins, {}..={} us)",
            info.model,
            info.serial_number,
            self.wavelengths.len(),
            self.limits.min_us(),
            self.limits.max_us()
        );

        loop {
            if let Some(envelope) = self.pending.pop_front() {
                if self.handle(envelope) == Flow::Stop {
                    break;
                }
                continue;
            }

            if self.armed {
                match self.commands.try_recv() {
                    Ok(envelope) => {
                        if self.handle(envelope) == Flow::Stop {
                            break;
                        }
                    }
                    Err(TryRecvError::Empty) => self.capture_live(),
                    Err(TryRecvError::Disconnected) => {
                        info!("All clients gone, stopping acquisition worker");
                        break;
                    }
                }
            } else {
                match self.commands.recv() {
                    Ok(envelope) => {
                        if self.handle(envelope) == Flow::Stop {
                            break;
                        }
                    }
                    Err(_) => {
                        info!("All clients gone, stopping acquisition worker");
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.device.close() {
            warn!("Failed to close spectrometer: {}", e);
        }
        info!("Acquisition worker stopped");
    }

    fn handle(&mut self, envelope: CommandEnvelope) -> Flow {
        let CommandEnvelope { ticket, command } = envelope;
        debug!("Handling {} (#{})", command.name(), ticket);

        let mut flow = Flow::Continue;
        let outcome = match &command {
            SpectrometerCommand::StartSession => self.arm(ticket),
            SpectrometerCommand::StopSession => {
                self.disarm();
                CommandOutcome::Applied
            }
            SpectrometerCommand::UpdateSettings {
                integration_time_us,
                scans_to_average,
            } => self.update_settings(ticket, *integration_time_us, *scans_to_average),
            SpectrometerCommand::SetCollectionMode { mode } => self.set_collection_mode(ticket, *mode),
            SpectrometerCommand::CaptureDarkReference => self.capture_reference(ticket, ReferenceKind::Dark),
            SpectrometerCommand::CaptureWhiteReference => self.capture_reference(ticket, ReferenceKind::White),
            SpectrometerCommand::AutoIntegrationProbe { test_integration_us } => {
                self.probe(ticket, *test_integration_us)
            }
            SpectrometerCommand::Shutdown => {
                self.armed = false;
                flow = Flow::Stop;
                CommandOutcome::Applied
            }
        };

        if let CommandOutcome::Rejected(e) = &outcome {
            warn!("{} (#{}) rejected: {}", command.name(), ticket, e);
        }

        self.events.publish(WorkerEvent::Ack(CommandAck {
            ticket,
            command,
            session_id: self.session.current(),
            armed: self.armed,
            settings: self.settings,
            outcome,
        }));
        flow
    }

    /// Arm a fresh session, unless reflectance mode lacks usable references
    fn arm(&mut self, ticket: Ticket) -> CommandOutcome {
        if self.settings.collection_mode == CollectionMode::Reflectance {
            let missing = self.references.missing(&self.settings);
            if !missing.is_empty() {
                self.armed = false;
                warn!("Reflectance capture needs {:?} reference(s), not arming", missing);
                return CommandOutcome::CalibrationRequired { missing };
            }
        }

        let id = self.session.advance();
        self.armed = true;
        self.armed_by = ticket;
        info!(
            "Session {} armed ({}, {} us, {} scans)",
            id, self.settings.collection_mode, self.settings.integration_time_us, self.settings.scans_to_average
        );
        CommandOutcome::Applied
    }

    fn disarm(&mut self) {
        if self.armed {
            info!("Session {} disarmed", self.session.current());
        }
        self.armed = false;
    }

    fn update_settings(&mut self, ticket: Ticket, integration_time_us: u32, scans_to_average: u32) -> CommandOutcome {
        if integration_time_us == 0 {
            return CommandOutcome::Rejected(AcquisitionError::InvalidSettings(
                "integration time must be positive".to_string(),
            ));
        }
        if scans_to_average > self.max_scans_to_average {
            return CommandOutcome::Rejected(AcquisitionError::InvalidSettings(format!(
                "scans to average {} exceeds the maximum of {}",
                scans_to_average, self.max_scans_to_average
            )));
        }

        let integration_time_us = self.clamp_integration(integration_time_us);
        if integration_time_us != self.settings.integration_time_us
            || scans_to_average != self.settings.scans_to_average
        {
            self.references.clear();
        }
        self.settings.integration_time_us = integration_time_us;
        self.settings.scans_to_average = scans_to_average;
        info!(
            "Settings now {} us, {} scans to average",
            integration_time_us, scans_to_average
        );

        if self.armed {
            self.arm(ticket)
        } else {
            CommandOutcome::Applied
        }
    }

    fn set_collection_mode(&mut self, ticket: Ticket, mode: CollectionMode) -> CommandOutcome {
        self.settings.collection_mode = mode;
        info!("Collection mode set to {}", mode);

        if self.armed {
            return self.arm(ticket);
        }
        match mode {
            CollectionMode::Reflectance => {
                let missing = self.references.missing(&self.settings);
                if missing.is_empty() {
                    CommandOutcome::Applied
                } else {
                    CommandOutcome::CalibrationRequired { missing }
                }
            }
            CollectionMode::Raw => CommandOutcome::Applied,
        }
    }

    /// Pause live capture, take an averaged RAW capture as the new reference, re-arm
    fn capture_reference(&mut self, ticket: Ticket, kind: ReferenceKind) -> CommandOutcome {
        let was_armed = self.armed;
        self.armed = false;

        let session_id = self.session.current();
        let settings = SpectrometerSettings {
            collection_mode: CollectionMode::Raw,
            ..self.settings
        };
        info!("Capturing {} reference at {} us", kind, settings.integration_time_us);

        let outcome = match self.capture_averaged(&settings) {
            Ok(Capture::Complete(counts)) => {
                let result = self.new_result(session_id, ticket, kind.into(), &settings, Ok(counts));
                self.references.accept_reference(kind, &result);
                self.events.publish(WorkerEvent::Spectrum(result));
                CommandOutcome::Applied
            }
            Ok(Capture::Interrupted) => return CommandOutcome::Rejected(AcquisitionError::Cancelled),
            Err(e) => {
                error!("{} reference capture failed, keeping the previous one: {}", kind, e);
                let result = self.new_result(session_id, ticket, kind.into(), &settings, Err(e.clone()));
                self.events.publish(WorkerEvent::Spectrum(result));
                CommandOutcome::Rejected(e)
            }
        };

        if was_armed {
            match self.arm(ticket) {
                CommandOutcome::Applied => outcome,
                refused => match outcome {
                    CommandOutcome::Applied => refused,
                    failed => failed,
                },
            }
        } else {
            outcome
        }
    }

    /// Single un-averaged RAW exposure. Leaves settings and session alone.
    fn probe(&mut self, ticket: Ticket, test_integration_us: u32) -> CommandOutcome {
        let integration_time_us = self.clamp_integration(test_integration_us);
        let settings = SpectrometerSettings {
            integration_time_us,
            scans_to_average: 0,
            collection_mode: CollectionMode::Raw,
        };
        let session_id = self.session.current();

        let counts = self.read_exposure(integration_time_us);
        let failure = counts.as_ref().err().cloned();
        let mut result = self.new_result(session_id, ticket, SpectraType::AutoProbe, &settings, counts);
        result.peak_value = result.max_intensity();
        result.test_integration_us = Some(integration_time_us);
        debug!("Probe at {} us peaked at {:?}", integration_time_us, result.peak_value);
        self.events.publish(WorkerEvent::Spectrum(result));

        match failure {
            Some(e) => CommandOutcome::Rejected(e),
            None => CommandOutcome::Applied,
        }
    }

    fn capture_live(&mut self) {
        let session_id = self.session.current();
        let ticket = self.armed_by;
        let settings = self.settings;

        let result = match self.capture_averaged(&settings) {
            Ok(Capture::Complete(raw)) => match settings.collection_mode {
                CollectionMode::Raw => self.new_result(session_id, ticket, SpectraType::Raw, &settings, Ok(raw)),
                CollectionMode::Reflectance => {
                    let Some((dark, white)) = self.references.pair(&settings) else {
                        warn!("References no longer usable, disarming session {}", session_id);
                        self.armed = false;
                        return;
                    };
                    let reflectance = compute_reflectance(&raw, &dark.intensities, &white.intensities);
                    let mut result =
                        self.new_result(session_id, ticket, SpectraType::Reflectance, &settings, Ok(reflectance));
                    result.raw_intensities = Some(raw);
                    result
                }
            },
            Ok(Capture::Interrupted) => return,
            Err(e) => {
                error!("Capture in session {} failed: {}", session_id, e);
                let spectra_type = match settings.collection_mode {
                    CollectionMode::Raw => SpectraType::Raw,
                    CollectionMode::Reflectance => SpectraType::Reflectance,
                };
                self.new_result(session_id, ticket, spectra_type, &settings, Err(e))
            }
        };

        trace!("Posting capture from session {}", session_id);
        self.events.publish(WorkerEvent::Spectrum(result));
    }

    /// Average `scans_to_average + 1` exposures
    fn capture_averaged(&mut self, settings: &SpectrometerSettings) -> AcquisitionResult<Capture> {
        let mut accumulator = ScanAccumulator::new(self.wavelengths.len());

        for exposure in 0..settings.exposures_per_capture() {
            if exposure > 0 && self.shutdown_waiting() {
                info!("Shutdown requested, abandoning capture after {} exposure(s)", exposure);
                return Ok(Capture::Interrupted);
            }
            let counts = self.read_exposure(settings.integration_time_us)?;
            accumulator.add(&counts);
        }

        accumulator
            .mean()
            .map(Capture::Complete)
            .ok_or_else(|| AcquisitionError::HardwareRead("no exposures taken".to_string()))
    }

    fn read_exposure(&mut self, integration_time_us: u32) -> AcquisitionResult<Vec<f64>> {
        let counts = self.device.read(integration_time_us)?;
        if counts.len() != self.wavelengths.len() {
            return Err(AcquisitionError::HardwareRead(format!(
                "expected {} bins, device returned {}",
                self.wavelengths.len(),
                counts.len()
            )));
        }
        Ok(counts)
    }

    /// Move queued commands aside and report whether one of them is a shutdown
    fn shutdown_waiting(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(envelope) => self.pending.push_back(envelope),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return true,
            }
        }
        self.pending
            .iter()
            .any(|envelope| envelope.command == SpectrometerCommand::Shutdown)
    }

    fn clamp_integration(&self, integration_time_us: u32) -> u32 {
        let clamped = self.limits.clamp(integration_time_us);
        if clamped != integration_time_us {
            info!(
                "Clamped integration time {} us to {} us",
                integration_time_us, clamped
            );
        }
        clamped
    }

    fn new_result(
        &self,
        session_id: SessionId,
        ticket: Ticket,
        spectra_type: SpectraType,
        settings: &SpectrometerSettings,
        intensities: AcquisitionResult<Vec<f64>>,
    ) -> SpectrometerResult {
        let (intensities, is_valid, error) = match intensities {
            Ok(values) => (values, true, None),
            Err(e) => (Vec::new(), false, Some(e)),
        };

        SpectrometerResult {
            wavelengths: Arc::clone(&self.wavelengths),
            intensities,
            raw_intensities: None,
            timestamp: Utc::now(),
            integration_time_us: settings.integration_time_us,
            scans_to_average: settings.scans_to_average,
            collection_mode: settings.collection_mode,
            session_id,
            ticket,
            spectra_type,
            peak_value: None,
            test_integration_us: None,
            is_valid,
            error,
        }
    }
}

/// Owner's handle onto a running worker thread
pub struct WorkerHandle {
    device: DeviceInfo,
    commands: CommandSender,
    sessions: SessionObserver,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Open the device and start the worker thread.
    ///
    /// Returns the handle and a client for the queues.
    pub fn spawn<Drv: SpectrometerDriver>(
        driver: &mut Drv,
        settings: SpectrometerSettings,
        options: WorkerOptions,
    ) -> AcquisitionResult<(Self, SpectrometerClient)> {
        let device = driver.open()?;
        let info = device.info().clone();
        let (client, endpoints) = channels(options.command_capacity, options.event_capacity);
        let worker = AcquisitionWorker::new(device, settings, options.max_scans_to_average, endpoints)?;
        let sessions = worker.session_observer();

        let thread = std::thread::Builder::new()
            .name("acquisition-worker".to_string())
            .spawn(move || worker.run())
            .map_err(|e| AcquisitionError::WorkerSpawn(e.to_string()))?;

        let handle = Self {
            device: info,
            commands: client.commands.clone(),
            sessions,
            thread: Some(thread),
        };
        Ok((handle, client))
    }

    /// Identity and limits of the device the worker owns
    pub fn device_info(&self) -> &DeviceInfo {
        &self.device
    }

    /// Session id the worker considers current
    pub fn current_session(&self) -> SessionId {
        self.sessions.current()
    }

    /// Read access to the worker's session counter
    pub fn session_observer(&self) -> SessionObserver {
        self.sessions.clone()
    }

    /// Whether the worker thread is still alive
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Ask the worker to stop and wait for it.
    ///
    /// An exposure in progress completes first, so this can block for up to
    /// one integration time.
    pub fn shutdown(mut self) -> AcquisitionResult<()> {
        match self
            .commands
            .submit_timeout(SpectrometerCommand::Shutdown, SHUTDOWN_SUBMIT_TIMEOUT)
        {
            Ok(_) | Err(AcquisitionError::Disconnected) => {}
            Err(e) => return Err(e),
        }
        self.join();
        Ok(())
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if let Err(e) = thread.join() {
                error!("Acquisition worker panicked: {:?}", e);
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            // Best effort; the thread exits on its own once every client is gone
            let _ = self.commands.submit(SpectrometerCommand::Shutdown);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SimulatorConfig, SpectrometerConfig};
    use crate::hardware::{SceneControl, SceneTarget, SimulatorDriver};
    use std::time::Instant;

    const COUNTS_PER_US: f64 = 0.5;
    const WAIT: Duration = Duration::from_secs(5);

    fn settings(integration_time_us: u32, scans_to_average: u32, collection_mode: CollectionMode) -> SpectrometerSettings {
        SpectrometerSettings {
            integration_time_us,
            scans_to_average,
            collection_mode,
        }
    }

    fn spawn(initial: SpectrometerSettings, target: SceneTarget) -> (WorkerHandle, SpectrometerClient, SceneControl) {
        let simulator = SimulatorConfig {
            pixels: 16,
            linear_response: true,
            counts_per_us: COUNTS_PER_US,
            time_scale: 1.0,
            ..SimulatorConfig::default()
        };
        let scene = SceneControl::new(target);
        let mut driver = SimulatorDriver::new(simulator, SpectrometerConfig::default(), scene.clone()).with_seed(1);
        let options = WorkerOptions {
            command_capacity: 16,
            event_capacity: 256,
            max_scans_to_average: 50,
        };
        let (handle, client) = WorkerHandle::spawn(&mut driver, initial, options).unwrap();
        (handle, client, scene)
    }

    fn wait_ack(client: &SpectrometerClient, ticket: Ticket) -> CommandAck {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if let Some(WorkerEvent::Ack(ack)) = client.events.recv_timeout(Duration::from_millis(50)).unwrap() {
                if ack.ticket == ticket {
                    return ack;
                }
            }
        }
        panic!("no ack for #{}", ticket);
    }

    fn next_spectrum(client: &SpectrometerClient) -> SpectrometerResult {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if let Some(WorkerEvent::Spectrum(result)) = client.events.recv_timeout(Duration::from_millis(50)).unwrap() {
                return result;
            }
        }
        panic!("no spectrum");
    }

    fn submit_and_wait(client: &SpectrometerClient, command: SpectrometerCommand) -> CommandAck {
        let ticket = client.submit(command).unwrap();
        wait_ack(client, ticket)
    }

    #[test]
    fn test_sessions_strictly_increase() {
        let (handle, client, _) = spawn(settings(5000, 0, CollectionMode::Raw), SceneTarget::White);

        let first = submit_and_wait(&client, SpectrometerCommand::StartSession);
        assert!(first.armed);
        assert_eq!(next_spectrum(&client).session_id, first.session_id);

        let second = submit_and_wait(&client, SpectrometerCommand::StartSession);
        assert!(second.session_id > first.session_id);
        for _ in 0..3 {
            // Everything after the ack was started under the new session
            assert_eq!(next_spectrum(&client).session_id, second.session_id);
        }
        assert_eq!(handle.current_session(), second.session_id);

        handle.shutdown().unwrap();
    }

    #[test]
    fn test_starts_disarmed() {
        let (handle, client, scene) = spawn(settings(5000, 0, CollectionMode::Raw), SceneTarget::White);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(scene.reads(), 0);
        assert!(client.events.drain().is_empty());
        handle.shutdown().unwrap();
    }

    #[test]
    fn test_reference_capture_averages_exposures() {
        let (handle, client, scene) = spawn(settings(5000, 2, CollectionMode::Raw), SceneTarget::White);

        let ticket = client.submit(SpectrometerCommand::CaptureWhiteReference).unwrap();
        let result = next_spectrum(&client);
        let ack = wait_ack(&client, ticket);

        assert_eq!(ack.outcome, CommandOutcome::Applied);
        assert!(!ack.armed);
        assert_eq!(result.spectra_type, SpectraType::White);
        assert_eq!(result.ticket, ticket);
        assert_eq!(result.scans_to_average, 2);
        assert!(result.is_valid);
        assert!(result.intensities.iter().all(|&c| (c - 2500.0).abs() < 1e-9));
        assert_eq!(scene.reads(), 3);

        handle.shutdown().unwrap();
    }

    #[test]
    fn test_hardware_failure_yields_invalid_result_and_recovers() {
        let (handle, client, scene) = spawn(settings(5000, 0, CollectionMode::Raw), SceneTarget::White);
        scene.fail_next_reads(1);

        let ack = submit_and_wait(&client, SpectrometerCommand::StartSession);
        let failed = next_spectrum(&client);
        assert!(!failed.is_valid);
        assert!(failed.intensities.is_empty());
        assert!(matches!(failed.error, Some(AcquisitionError::HardwareRead(_))));
        assert_eq!(failed.session_id, ack.session_id);

        let recovered = next_spectrum(&client);
        assert!(recovered.is_valid);
        assert_eq!(recovered.session_id, ack.session_id);

        handle.shutdown().unwrap();
    }

    #[test]
    fn test_failed_exposure_aborts_whole_average() {
        let (handle, client, scene) = spawn(settings(5000, 2, CollectionMode::Raw), SceneTarget::White);
        scene.fail_reads_after(1, 1);

        let ticket = client.submit(SpectrometerCommand::CaptureDarkReference).unwrap();
        let failed = next_spectrum(&client);
        assert_eq!(failed.ticket, ticket);
        assert_eq!(failed.spectra_type, SpectraType::Dark);
        assert!(!failed.is_valid);
        assert!(failed.intensities.is_empty());
        assert!(matches!(failed.error, Some(AcquisitionError::HardwareRead(_))));

        let ack = wait_ack(&client, ticket);
        assert!(matches!(ack.outcome, CommandOutcome::Rejected(AcquisitionError::HardwareRead(_))));
        // Third exposure never taken
        assert_eq!(scene.reads(), 2);

        handle.shutdown().unwrap();
    }

    #[test]
    fn test_failed_reference_keeps_previous() {
        let (handle, client, scene) = spawn(settings(5000, 0, CollectionMode::Reflectance), SceneTarget::Dark);

        let ack = submit_and_wait(&client, SpectrometerCommand::CaptureDarkReference);
        assert_eq!(ack.outcome, CommandOutcome::Applied);

        scene.fail_next_reads(1);
        let ack = submit_and_wait(&client, SpectrometerCommand::CaptureDarkReference);
        assert!(matches!(ack.outcome, CommandOutcome::Rejected(AcquisitionError::HardwareRead(_))));

        scene.set_target(SceneTarget::White);
        let ack = submit_and_wait(&client, SpectrometerCommand::CaptureWhiteReference);
        assert_eq!(ack.outcome, CommandOutcome::Applied);

        let ack = submit_and_wait(&client, SpectrometerCommand::StartSession);
        assert_eq!(ack.outcome, CommandOutcome::Applied);
        assert!(ack.armed);

        let live = next_spectrum(&client);
        assert!(live.is_valid);
        assert_eq!(live.spectra_type, SpectraType::Reflectance);
        assert_eq!(live.session_id, ack.session_id);

        handle.shutdown().unwrap();
    }

    #[test]
    fn test_reflectance_requires_references() {
        let (handle, client, scene) = spawn(settings(5000, 0, CollectionMode::Raw), SceneTarget::Sample);

        let ack = submit_and_wait(
            &client,
            SpectrometerCommand::SetCollectionMode {
                mode: CollectionMode::Reflectance,
            },
        );
        assert!(ack.calibration_required());
        assert_eq!(ack.settings.collection_mode, CollectionMode::Reflectance);

        let ack = submit_and_wait(&client, SpectrometerCommand::StartSession);
        assert_eq!(
            ack.outcome,
            CommandOutcome::CalibrationRequired {
                missing: vec![ReferenceKind::Dark, ReferenceKind::White]
            }
        );
        assert!(!ack.armed);
        assert_eq!(scene.reads(), 0);

        handle.shutdown().unwrap();
    }

    #[test]
    fn test_reflectance_and_reference_invalidation() {
        let (handle, client, scene) = spawn(settings(5000, 0, CollectionMode::Reflectance), SceneTarget::Dark);

        assert_eq!(
            submit_and_wait(&client, SpectrometerCommand::CaptureDarkReference).outcome,
            CommandOutcome::Applied
        );
        scene.set_target(SceneTarget::White);
        assert_eq!(
            submit_and_wait(&client, SpectrometerCommand::CaptureWhiteReference).outcome,
            CommandOutcome::Applied
        );
        scene.set_target(SceneTarget::Sample);

        let ack = submit_and_wait(&client, SpectrometerCommand::StartSession);
        assert!(ack.armed);
        let result = next_spectrum(&client);
        assert_eq!(result.spectra_type, SpectraType::Reflectance);
        assert!(result.raw_intensities.is_some());
        assert!(result.intensities.iter().all(|&r| (0.1..=0.75).contains(&r)));

        // Changing the exposure makes both references stale
        let ack = submit_and_wait(
            &client,
            SpectrometerCommand::UpdateSettings {
                integration_time_us: 6000,
                scans_to_average: 0,
            },
        );
        assert!(!ack.armed);
        assert_eq!(
            ack.outcome,
            CommandOutcome::CalibrationRequired {
                missing: vec![ReferenceKind::Dark, ReferenceKind::White]
            }
        );

        // Going back does not resurrect them
        let ack = submit_and_wait(
            &client,
            SpectrometerCommand::UpdateSettings {
                integration_time_us: 5000,
                scans_to_average: 0,
            },
        );
        assert!(!ack.armed);
        assert_eq!(ack.outcome, CommandOutcome::Applied);
        assert!(submit_and_wait(&client, SpectrometerCommand::StartSession).calibration_required());

        handle.shutdown().unwrap();
    }

    #[test]
    fn test_trial_exposure_clamps_and_leaves_state_alone() {
        let (handle, client, _) = spawn(settings(5000, 3, CollectionMode::Raw), SceneTarget::White);

        let ticket = client
            .submit(SpectrometerCommand::AutoIntegrationProbe { test_integration_us: 1000 })
            .unwrap();
        let result = next_spectrum(&client);
        let ack = wait_ack(&client, ticket);

        assert_eq!(result.spectra_type, SpectraType::AutoProbe);
        assert_eq!(result.ticket, ticket);
        assert_eq!(result.test_integration_us, Some(3800));
        assert_eq!(result.peak_value, Some(1900.0));
        assert_eq!(result.session_id, 0);
        assert_eq!(ack.session_id, 0);
        assert_eq!(ack.settings, settings(5000, 3, CollectionMode::Raw));

        handle.shutdown().unwrap();
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let (handle, client, _) = spawn(settings(5000, 0, CollectionMode::Raw), SceneTarget::White);

        let ack = submit_and_wait(
            &client,
            SpectrometerCommand::UpdateSettings {
                integration_time_us: 5000,
                scans_to_average: 51,
            },
        );
        assert!(matches!(ack.outcome, CommandOutcome::Rejected(AcquisitionError::InvalidSettings(_))));

        let ack = submit_and_wait(
            &client,
            SpectrometerCommand::UpdateSettings {
                integration_time_us: 0,
                scans_to_average: 0,
            },
        );
        assert!(matches!(ack.outcome, CommandOutcome::Rejected(AcquisitionError::InvalidSettings(_))));
        assert_eq!(ack.settings.integration_time_us, 5000);

        // Out of range but usable values are clamped
        let ack = submit_and_wait(
            &client,
            SpectrometerCommand::UpdateSettings {
                integration_time_us: 10,
                scans_to_average: 0,
            },
        );
        assert_eq!(ack.outcome, CommandOutcome::Applied);
        assert_eq!(ack.settings.integration_time_us, 3800);

        handle.shutdown().unwrap();
    }

    #[test]
    fn test_stop_update_start_yields_one_fresh_session() {
        let (handle, client, _) = spawn(settings(5000, 0, CollectionMode::Raw), SceneTarget::White);

        let started = submit_and_wait(&client, SpectrometerCommand::StartSession);
        next_spectrum(&client);

        let stopped = submit_and_wait(&client, SpectrometerCommand::StopSession);
        assert!(!stopped.armed);
        let updated = submit_and_wait(
            &client,
            SpectrometerCommand::UpdateSettings {
                integration_time_us: 8000,
                scans_to_average: 0,
            },
        );
        assert!(!updated.armed);
        assert_eq!(updated.session_id, started.session_id);

        let restarted = submit_and_wait(&client, SpectrometerCommand::StartSession);
        assert_eq!(restarted.session_id, started.session_id + 1);
        let result = next_spectrum(&client);
        assert_eq!(result.session_id, restarted.session_id);
        assert_eq!(result.integration_time_us, 8000);
        assert_eq!(result.intensities[0], 4000.0);

        handle.shutdown().unwrap();
    }

    #[test]
    fn test_reference_capture_rearms_live_session() {
        let (handle, client, _) = spawn(settings(5000, 0, CollectionMode::Raw), SceneTarget::White);

        let started = submit_and_wait(&client, SpectrometerCommand::StartSession);
        let ack = submit_and_wait(&client, SpectrometerCommand::CaptureDarkReference);
        assert!(ack.armed);
        assert!(ack.session_id > started.session_id);

        handle.shutdown().unwrap();
    }

    #[test]
    fn test_shutdown_stops_worker() {
        let (handle, client, _) = spawn(settings(5000, 0, CollectionMode::Raw), SceneTarget::White);
        submit_and_wait(&client, SpectrometerCommand::StartSession);
        assert!(handle.is_running());

        handle.shutdown().unwrap();
        assert_eq!(
            client.submit(SpectrometerCommand::StartSession),
            Err(AcquisitionError::Disconnected)
        );
    }
}
