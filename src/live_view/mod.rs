// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Live view consumer
//!
//! The client-side counterpart of the worker: issues commands, filters the
//! event stream down to captures of the session it asked for, tracks which
//! references exist and keeps the plot scaling.

mod display;

pub use display::DisplayScale;

use std::collections::{HashSet, VecDeque};
use std::mem;

use tracing::{debug, info, trace, warn};

use crate::acquisition::{
    CollectionMode, CommandAck, CommandOutcome, SessionFilter, SpectraType, SpectrometerClient, SpectrometerCommand,
    SpectrometerResult, SpectrometerSettings, Ticket, WorkerEvent,
};
use crate::calibration::ReferenceKind;
use crate::config::IntegrationRange;
use crate::error::{AcquisitionError, AcquisitionResult};
use crate::persistence::{LensType, SaveRequest};

/// What the screen is showing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    /// Not capturing
    Idle,
    /// Showing live captures
    Live,
    /// Holding a spectrum
    Frozen,
}

/// Live spectrum view backed by the acquisition worker
pub struct LiveView {
    client: SpectrometerClient,
    filter: SessionFilter,
    settings: SpectrometerSettings,
    lens_type: LensType,
    state: ViewState,
    has_dark: bool,
    has_white: bool,
    calibration_required: Option<Vec<ReferenceKind>>,
    /// Reference captures we asked for and have not seen acknowledged
    reference_tickets: HashSet<Ticket>,
    current: Option<SpectrometerResult>,
    frozen: Option<SpectrometerResult>,
    scale: DisplayScale,
    /// Commands that met a full queue, retried on every poll
    deferred: VecDeque<SpectrometerCommand>,
    discarded: u64,
    /// Exposures the user may pick, when restricted
    integration_range: Option<IntegrationRange>,
}

impl LiveView {
    /// Idle view over `client`
    pub fn new(
        client: SpectrometerClient,
        settings: SpectrometerSettings,
        lens_type: LensType,
        scale: DisplayScale,
    ) -> Self {
        Self {
            client,
            filter: SessionFilter::new(),
            settings,
            lens_type,
            state: ViewState::Idle,
            has_dark: false,
            has_white: false,
            calibration_required: None,
            reference_tickets: HashSet::new(),
            current: None,
            frozen: None,
            scale,
            deferred: VecDeque::new(),
            discarded: 0,
            integration_range: None,
        }
    }

    /// Snap requested exposures to `range` in [`set_settings`](Self::set_settings)
    pub fn with_integration_range(mut self, range: IntegrationRange) -> Self {
        self.integration_range = Some(range);
        self
    }

    /// Sync settings to the worker, then arm a session
    pub fn enter(&mut self) -> AcquisitionResult<()> {
        info!("Entering live view ({})", self.settings.collection_mode);
        self.state = ViewState::Live;
        self.frozen = None;
        self.scale.reset(self.settings.collection_mode);

        self.issue(SpectrometerCommand::UpdateSettings {
            integration_time_us: self.settings.integration_time_us,
            scans_to_average: self.settings.scans_to_average,
        })?;
        self.issue(SpectrometerCommand::SetCollectionMode {
            mode: self.settings.collection_mode,
        })?;
        self.issue(SpectrometerCommand::StartSession)
    }

    /// Stop capturing. An exposure in flight still lands and is discarded.
    pub fn exit(&mut self) -> AcquisitionResult<()> {
        info!("Leaving live view");
        self.state = ViewState::Idle;
        self.issue(SpectrometerCommand::StopSession)
    }

    /// Change exposure and averaging. References no longer apply afterwards.
    ///
    /// The exposure is snapped to the configured integration range first.
    pub fn set_settings(&mut self, integration_time_us: u32, scans_to_average: u32) -> AcquisitionResult<()> {
        let integration_time_us = match self.integration_range {
            Some(range) => range.snap(integration_time_us),
            None => integration_time_us,
        };
        if integration_time_us != self.settings.integration_time_us
            || scans_to_average != self.settings.scans_to_average
        {
            self.has_dark = false;
            self.has_white = false;
        }
        self.settings.integration_time_us = integration_time_us;
        self.settings.scans_to_average = scans_to_average;
        self.issue(SpectrometerCommand::UpdateSettings {
            integration_time_us,
            scans_to_average,
        })
    }

    /// Switch mode; resets the y-axis
    pub fn set_collection_mode(&mut self, mode: CollectionMode) -> AcquisitionResult<()> {
        self.settings.collection_mode = mode;
        self.scale.reset(mode);
        self.issue(SpectrometerCommand::SetCollectionMode { mode })
    }

    /// Ask the worker for a dark reference
    pub fn capture_dark(&mut self) -> AcquisitionResult<()> {
        self.issue(SpectrometerCommand::CaptureDarkReference)
    }

    /// Ask the worker for a white reference
    pub fn capture_white(&mut self) -> AcquisitionResult<()> {
        self.issue(SpectrometerCommand::CaptureWhiteReference)
    }

    /// Optics recorded with saved captures
    pub fn set_lens_type(&mut self, lens_type: LensType) {
        self.lens_type = lens_type;
    }

    /// Retry deferred commands and process everything queued.
    ///
    /// Returns the accepted captures: live spectra of the current session and
    /// the references this view asked for.
    pub fn poll(&mut self) -> AcquisitionResult<Vec<SpectrometerResult>> {
        self.flush_deferred()?;

        let mut accepted = Vec::new();
        while let Some(event) = self.client.events.try_recv()? {
            match event {
                WorkerEvent::Ack(ack) => self.on_ack(ack),
                WorkerEvent::Spectrum(result) => {
                    if let Some(result) = self.on_spectrum(result) {
                        accepted.push(result);
                    }
                }
            }
        }
        Ok(accepted)
    }

    /// Hold the current spectrum on screen
    pub fn freeze(&mut self) -> bool {
        match &self.current {
            Some(current) => {
                self.frozen = Some(current.clone());
                self.state = ViewState::Frozen;
                true
            }
            None => {
                debug!("No spectrum to freeze");
                false
            }
        }
    }

    /// Back to live
    pub fn unfreeze(&mut self) {
        self.frozen = None;
        if self.state == ViewState::Frozen {
            self.state = ViewState::Live;
        }
    }

    /// Save request for the frozen spectrum, or the current one when not frozen
    pub fn save_request(&self, temperature_c: Option<f64>) -> Option<SaveRequest> {
        let result = self.frozen.as_ref().or(self.current.as_ref())?;
        SaveRequest::from_result(result, self.lens_type, temperature_c).ok()
    }

    /// Fit the y-axis to the current spectrum
    pub fn rescale(&mut self) -> Option<f64> {
        let current = self.current.as_ref()?;
        Some(self.scale.rescale(&current.intensities))
    }

    /// Rescale once the next live capture arrives (exposure changed)
    pub fn request_rescale(&mut self) {
        self.scale.request_rescale();
    }

    /// What the screen shows
    pub fn state(&self) -> ViewState {
        self.state
    }

    /// Settings this view last asked for
    pub fn settings(&self) -> &SpectrometerSettings {
        &self.settings
    }

    /// A dark reference matching the current settings was captured
    pub fn has_dark(&self) -> bool {
        self.has_dark
    }

    /// A white reference matching the current settings was captured
    pub fn has_white(&self) -> bool {
        self.has_white
    }

    /// References the worker reported missing when it last refused to arm
    pub fn calibration_required(&self) -> Option<&[ReferenceKind]> {
        self.calibration_required.as_deref()
    }

    /// Latest accepted live capture
    pub fn current(&self) -> Option<&SpectrometerResult> {
        self.current.as_ref()
    }

    /// Held spectrum
    pub fn frozen(&self) -> Option<&SpectrometerResult> {
        self.frozen.as_ref()
    }

    /// Current y-axis ceiling
    pub fn y_max(&self) -> f64 {
        self.scale.y_max()
    }

    /// Session filter state
    pub fn filter(&self) -> &SessionFilter {
        &self.filter
    }

    /// Commands waiting for room in the queue
    pub fn deferred_commands(&self) -> usize {
        self.deferred.len()
    }

    /// Captures rejected by the session filter so far
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Underlying queues
    pub fn client(&self) -> &SpectrometerClient {
        &self.client
    }

    fn issue(&mut self, command: SpectrometerCommand) -> AcquisitionResult<()> {
        if !self.deferred.is_empty() {
            // Keep submission order behind what is already waiting
            self.defer(command);
            return Ok(());
        }
        match self.submit(command.clone()) {
            Ok(()) => Ok(()),
            Err(AcquisitionError::QueueFull) => {
                self.defer(command);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn submit(&mut self, command: SpectrometerCommand) -> AcquisitionResult<()> {
        let affecting = command.is_session_affecting();
        let reference = matches!(
            command,
            SpectrometerCommand::CaptureDarkReference | SpectrometerCommand::CaptureWhiteReference
        );
        let ticket = self.client.submit(command)?;
        if affecting {
            self.filter.on_issued(ticket);
        }
        if reference {
            self.reference_tickets.insert(ticket);
        }
        Ok(())
    }

    fn defer(&mut self, command: SpectrometerCommand) {
        let kind = mem::discriminant(&command);
        if let Some(pos) = self.deferred.iter().position(|c| mem::discriminant(c) == kind) {
            debug!("Coalescing deferred {}", command.name());
            self.deferred.remove(pos);
        } else {
            warn!("Command queue full, deferring {}", command.name());
        }
        if command.is_session_affecting() {
            self.filter.invalidate();
        }
        self.deferred.push_back(command);
    }

    fn flush_deferred(&mut self) -> AcquisitionResult<()> {
        while let Some(command) = self.deferred.pop_front() {
            match self.submit(command.clone()) {
                Ok(()) => {}
                Err(AcquisitionError::QueueFull) => {
                    self.deferred.push_front(command);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn on_ack(&mut self, ack: CommandAck) {
        if self.reference_tickets.remove(&ack.ticket) {
            if let CommandOutcome::Rejected(e) = &ack.outcome {
                warn!("{} failed: {}", ack.command.name(), e);
            }
        }

        if !self.filter.on_ack(&ack) {
            trace!("Ack #{} does not concern the session filter", ack.ticket);
            return;
        }

        match &ack.outcome {
            CommandOutcome::CalibrationRequired { missing } => {
                warn!("Calibration required: missing {:?}", missing);
                self.has_dark = !missing.contains(&ReferenceKind::Dark);
                self.has_white = !missing.contains(&ReferenceKind::White);
                self.calibration_required = Some(missing.clone());
            }
            _ => self.calibration_required = None,
        }
        // The worker may have clamped what we asked for
        self.settings.integration_time_us = ack.settings.integration_time_us;
    }

    fn on_spectrum(&mut self, result: SpectrometerResult) -> Option<SpectrometerResult> {
        match result.spectra_type {
            SpectraType::Dark | SpectraType::White => {
                if !self.reference_tickets.contains(&result.ticket) || !result.is_valid {
                    return None;
                }
                if result.spectra_type == SpectraType::Dark {
                    self.has_dark = true;
                } else {
                    self.has_white = true;
                }
                info!("{} reference updated", result.spectra_type);
                Some(result)
            }
            SpectraType::AutoProbe => None,
            SpectraType::Raw | SpectraType::Reflectance => {
                if !self.filter.accepts(&result) {
                    self.discarded += 1;
                    trace!(
                        "Discarded capture from session {} (snapshot {:?}, valid {})",
                        result.session_id,
                        self.filter.snapshot(),
                        result.is_valid
                    );
                    return None;
                }
                if let Some(y_max) = self.scale.apply_pending(&result.intensities) {
                    info!("Y-axis rescaled to {:.2} after exposure change", y_max);
                }
                self.current = Some(result.clone());
                Some(result)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::{channels, CommandEnvelope, WorkerEndpoints, WorkerHandle, WorkerOptions};
    use crate::config::{DisplayConfig, SimulatorConfig, SpectrometerConfig};
    use crate::hardware::{SceneControl, SceneTarget, SimulatorDriver};
    use chrono::Utc;
    use std::time::{Duration, Instant};

    fn settings(mode: CollectionMode) -> SpectrometerSettings {
        SpectrometerSettings {
            integration_time_us: 5000,
            scans_to_average: 0,
            collection_mode: mode,
        }
    }

    fn view(client: SpectrometerClient, mode: CollectionMode) -> LiveView {
        let scale = DisplayScale::new(DisplayConfig::default(), 16383.0, mode);
        LiveView::new(client, settings(mode), LensType::Fiber, scale)
    }

    fn spawn(target: SceneTarget) -> (WorkerHandle, SpectrometerClient, SceneControl) {
        let simulator = SimulatorConfig {
            pixels: 16,
            linear_response: true,
            counts_per_us: 0.5,
            time_scale: 1.0,
            ..SimulatorConfig::default()
        };
        let scene = SceneControl::new(target);
        let mut driver = SimulatorDriver::new(simulator, SpectrometerConfig::default(), scene.clone());
        let options = WorkerOptions {
            command_capacity: 16,
            event_capacity: 256,
            max_scans_to_average: 50,
        };
        let (handle, client) = WorkerHandle::spawn(&mut driver, settings(CollectionMode::Raw), options).unwrap();
        (handle, client, scene)
    }

    fn poll_until(view: &mut LiveView, mut done: impl FnMut(&LiveView, &[SpectrometerResult]) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            let accepted = view.poll().unwrap();
            if done(view, &accepted) {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached");
    }

    fn spectrum(session_id: u64, ticket: Ticket) -> WorkerEvent {
        WorkerEvent::Spectrum(SpectrometerResult {
            wavelengths: vec![400.0].into(),
            intensities: vec![100.0],
            raw_intensities: None,
            timestamp: Utc::now(),
            integration_time_us: 5000,
            scans_to_average: 0,
            collection_mode: CollectionMode::Raw,
            session_id,
            ticket,
            spectra_type: SpectraType::Raw,
            peak_value: None,
            test_integration_us: None,
            is_valid: true,
            error: None,
        })
    }

    fn ack(envelope: &CommandEnvelope, session_id: u64, armed: bool) -> WorkerEvent {
        WorkerEvent::Ack(CommandAck {
            ticket: envelope.ticket,
            command: envelope.command.clone(),
            session_id,
            armed,
            settings: settings(CollectionMode::Raw),
            outcome: CommandOutcome::Applied,
        })
    }

    fn next_command(endpoints: &WorkerEndpoints) -> CommandEnvelope {
        endpoints.commands.try_recv().unwrap()
    }

    #[test]
    fn test_late_result_from_previous_session_discarded() {
        let (client, endpoints) = channels(8, 16);
        let mut view = view(client, CollectionMode::Raw);

        view.issue(SpectrometerCommand::StartSession).unwrap();
        let first = next_command(&endpoints);
        endpoints.events.publish(ack(&first, 1, true));
        endpoints.events.publish(spectrum(1, first.ticket));
        assert_eq!(view.poll().unwrap().len(), 1);

        view.issue(SpectrometerCommand::StartSession).unwrap();
        // Session 1 exposure finishes before and after the worker acks session 2
        endpoints.events.publish(spectrum(1, first.ticket));
        let second = next_command(&endpoints);
        endpoints.events.publish(ack(&second, 2, true));
        endpoints.events.publish(spectrum(2, second.ticket));
        endpoints.events.publish(spectrum(1, first.ticket));

        let accepted = view.poll().unwrap();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].session_id, 2);
        assert_eq!(view.discarded(), 2);
        assert_eq!(view.current().unwrap().session_id, 2);
    }

    #[test]
    fn test_set_settings_snaps_to_integration_range() {
        let (client, endpoints) = channels(8, 16);
        let range = SpectrometerConfig::default().integration_range();
        let mut view = view(client, CollectionMode::Raw).with_integration_range(range);

        view.set_settings(1_024_999, 3).unwrap();
        assert_eq!(
            next_command(&endpoints).command,
            SpectrometerCommand::UpdateSettings {
                integration_time_us: 1_000_000,
                scans_to_average: 3,
            }
        );
        assert_eq!(view.settings().integration_time_us, 1_000_000);

        view.set_settings(10, 3).unwrap();
        assert_eq!(
            next_command(&endpoints).command,
            SpectrometerCommand::UpdateSettings {
                integration_time_us: 100_000,
                scans_to_average: 3,
            }
        );
    }

    #[test]
    fn test_queue_full_coalesces() {
        let (client, endpoints) = channels(1, 16);
        let mut view = view(client, CollectionMode::Raw);

        view.enter().unwrap();
        // UpdateSettings fits, the other two wait
        assert_eq!(view.deferred_commands(), 2);
        view.exit().unwrap();
        view.exit().unwrap();
        assert_eq!(view.deferred_commands(), 3);
        assert_eq!(view.filter().snapshot(), None);

        let mut seen = vec![next_command(&endpoints).command];
        for _ in 0..3 {
            view.poll().unwrap();
            seen.push(next_command(&endpoints).command);
        }
        assert_eq!(view.deferred_commands(), 0);
        assert_eq!(seen[1], SpectrometerCommand::SetCollectionMode { mode: CollectionMode::Raw });
        assert_eq!(seen[2], SpectrometerCommand::StartSession);
        assert_eq!(seen[3], SpectrometerCommand::StopSession);
        assert!(endpoints.commands.try_recv().is_err());
    }

    #[test]
    fn test_live_capture_freeze_and_save() {
        let (handle, client, _) = spawn(SceneTarget::White);
        let mut view = view(client, CollectionMode::Raw);

        view.enter().unwrap();
        let mut results = Vec::new();
        poll_until(&mut view, |_, accepted| {
            results.extend(accepted.iter().cloned());
            results.len() >= 2
        });
        let session = view.filter().snapshot().unwrap();
        assert!(results.iter().all(|r| r.session_id == session && r.is_valid));
        assert!(results.iter().all(|r| r.intensities.len() == r.wavelengths.len()));

        assert!(view.freeze());
        assert_eq!(view.state(), ViewState::Frozen);
        let request = view.save_request(None).unwrap();
        assert_eq!(request.spectra_type, SpectraType::Raw);
        assert_eq!(request.integration_time_ms, 5);
        assert_eq!(request.lens_type, LensType::Fiber);

        view.unfreeze();
        assert_eq!(view.state(), ViewState::Live);
        assert_eq!(view.rescale(), Some(2500.0 * 1.2));

        view.exit().unwrap();
        handle.shutdown().unwrap();
    }

    #[test]
    fn test_reference_tracking() {
        let (handle, client, scene) = spawn(SceneTarget::Dark);
        let mut view = view(client, CollectionMode::Raw);

        view.capture_dark().unwrap();
        poll_until(&mut view, |v, _| v.has_dark());
        scene.set_target(SceneTarget::White);
        view.capture_white().unwrap();
        poll_until(&mut view, |v, _| v.has_white());

        view.set_settings(7000, 0).unwrap();
        assert!(!view.has_dark());
        assert!(!view.has_white());

        handle.shutdown().unwrap();
    }

    #[test]
    fn test_reflectance_without_references_reports_calibration() {
        let (handle, client, _) = spawn(SceneTarget::Sample);
        let mut view = view(client, CollectionMode::Reflectance);

        view.enter().unwrap();
        poll_until(&mut view, |v, _| v.calibration_required().is_some());
        assert_eq!(
            view.calibration_required(),
            Some(&[ReferenceKind::Dark, ReferenceKind::White][..])
        );
        assert_eq!(view.filter().snapshot(), None);
        assert!(view.current().is_none());

        handle.shutdown().unwrap();
    }

    #[test]
    fn test_pending_rescale_after_exposure_change() {
        let (handle, client, _) = spawn(SceneTarget::White);
        let mut view = view(client, CollectionMode::Raw);
        view.enter().unwrap();
        poll_until(&mut view, |v, _| v.current().is_some());

        view.request_rescale();
        view.set_settings(10_000, 0).unwrap();
        poll_until(&mut view, |v, _| {
            v.current().map(|r| r.integration_time_us) == Some(10_000)
        });
        assert!((view.y_max() - 5000.0 * 1.2).abs() < 1e-9);

        handle.shutdown().unwrap();
    }
}
