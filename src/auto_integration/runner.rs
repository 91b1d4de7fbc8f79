// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Drives the auto-integration controller over the worker's queues

use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use super::{AcceptReason, AutoIntegrationController, AutoIntegrationParams, Phase, Step};
use crate::acquisition::{
    CommandAck, SpectraType, SpectrometerClient, SpectrometerCommand, SpectrometerSettings, Ticket,
    WorkerEvent,
};
use crate::error::{AcquisitionError, AcquisitionResult};

/// Runs one search at a time.
///
/// Consumes events from the shared queue while running, so nothing else
/// should be polling the same client during [`run`](Self::run) or
/// [`confirm`](Self::confirm).
pub struct AutoIntegrationRunner {
    client: SpectrometerClient,
    controller: AutoIntegrationController,
    timeout_margin: Duration,
    /// Worker exposure when the search stopped live capture
    baseline_us: Option<u32>,
}

impl AutoIntegrationRunner {
    /// Runner over `client`; `timeout_margin` is added to every wait on the worker
    pub fn new(client: SpectrometerClient, params: AutoIntegrationParams, timeout_margin: Duration) -> Self {
        Self {
            client,
            controller: AutoIntegrationController::new(params),
            timeout_margin,
            baseline_us: None,
        }
    }

    /// The underlying state machine
    pub fn controller(&self) -> &AutoIntegrationController {
        &self.controller
    }

    /// Stop live capture and search from `initial_us`.
    ///
    /// `current` are the settings the worker is running with; an averaged
    /// capture at those settings may have to finish before the first probe.
    /// Returns the proposal; nothing is applied until [`confirm`](Self::confirm).
    /// A failed or unanswered probe cancels the run.
    pub fn run(&mut self, initial_us: u32, current: &SpectrometerSettings) -> AcquisitionResult<(AcceptReason, u32)> {
        let stop = self.client.submit(SpectrometerCommand::StopSession)?;
        let ack = match self.wait_ack(stop, current.capture_duration()) {
            Ok(ack) => ack,
            Err(e) => {
                warn!("Live capture did not stop for auto-integration: {}", e);
                self.controller.cancel();
                return Err(e);
            }
        };
        self.baseline_us = Some(ack.settings.integration_time_us);

        let mut test_us = self.controller.start(initial_us);
        loop {
            let peak = match self.probe(test_us) {
                Ok(peak) => peak,
                Err(e) => {
                    warn!("Auto-integration probe at {} us failed: {}", test_us, e);
                    self.controller.cancel();
                    return Err(e);
                }
            };

            match self.controller.on_probe(peak) {
                Some(Step::Probe(next)) => test_us = next,
                Some(Step::Accept {
                    reason,
                    integration_time_us,
                }) => return Ok((reason, integration_time_us)),
                None => return Err(AcquisitionError::Cancelled),
            }
        }
    }

    /// Feed an acknowledgement seen by whoever polls the queue.
    ///
    /// A pending proposal is dropped once the worker's exposure moves away
    /// from the one the search started from. Returns true if it was dropped.
    pub fn on_ack(&mut self, ack: &CommandAck) -> bool {
        if !matches!(self.controller.phase(), Phase::Confirm(_)) {
            return false;
        }
        if Some(ack.settings.integration_time_us) == self.baseline_us {
            return false;
        }
        info!(
            "Integration time changed to {} us, dropping auto-integration proposal",
            ack.settings.integration_time_us
        );
        self.controller.cancel();
        true
    }

    /// Apply the proposal, keeping the current averaging.
    ///
    /// Synchronises with the worker first and refuses with
    /// [`AcquisitionError::Cancelled`] if the exposure was changed since the
    /// search. Changing the exposure invalidates both references.
    pub fn confirm(&mut self, scans_to_average: u32) -> AcquisitionResult<Ticket> {
        if self.controller.accepted_integration_us().is_none() {
            return Err(AcquisitionError::InvalidSettings(
                "no auto-integration result to confirm".to_string(),
            ));
        }

        let sync = self.client.submit(SpectrometerCommand::StopSession)?;
        let ack = self.wait_ack(sync, Duration::ZERO)?;
        self.on_ack(&ack);
        let Some(integration_time_us) = self.controller.accepted_integration_us() else {
            return Err(AcquisitionError::Cancelled);
        };

        let ticket = self.client.submit(SpectrometerCommand::UpdateSettings {
            integration_time_us,
            scans_to_average,
        })?;
        info!("Auto-integration confirmed at {} us", integration_time_us);
        self.controller.reset();
        self.baseline_us = None;
        Ok(ticket)
    }

    /// Discard the proposal; settings stay as they were
    pub fn reject(&mut self) {
        if let Phase::Confirm(_) | Phase::Running = self.controller.phase() {
            self.controller.cancel();
        }
        self.baseline_us = None;
    }

    /// Wait for the ack of `ticket`.
    ///
    /// The worker may be busy for `busy` first. Every other ack extends the
    /// deadline by one capture at the settings it reports.
    fn wait_ack(&mut self, ticket: Ticket, busy: Duration) -> AcquisitionResult<CommandAck> {
        let started = Instant::now();
        let mut deadline = started + busy + self.timeout_margin;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(AcquisitionError::ProbeTimeout {
                    ticket,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }

            match self.client.events.recv_timeout(remaining)? {
                Some(WorkerEvent::Ack(ack)) if ack.ticket == ticket => return Ok(ack),
                Some(WorkerEvent::Ack(ack)) => {
                    self.on_ack(&ack);
                    deadline = deadline.max(Instant::now() + ack.settings.capture_duration() + self.timeout_margin);
                }
                Some(WorkerEvent::Spectrum(result)) => {
                    trace!("Ignoring session {} capture while waiting for #{}", result.session_id, ticket)
                }
                None => {}
            }
        }
    }

    fn probe(&self, test_integration_us: u32) -> AcquisitionResult<f64> {
        let ticket = self
            .client
            .submit(SpectrometerCommand::AutoIntegrationProbe { test_integration_us })?;
        let timeout = Duration::from_micros(test_integration_us as u64) + self.timeout_margin;
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(AcquisitionError::ProbeTimeout {
                    ticket,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }

            match self.client.events.recv_timeout(remaining)? {
                Some(WorkerEvent::Spectrum(result))
                    if result.ticket == ticket && result.spectra_type == SpectraType::AutoProbe =>
                {
                    if !result.is_valid {
                        return Err(result
                            .error
                            .unwrap_or_else(|| AcquisitionError::HardwareRead("probe failed".to_string())));
                    }
                    debug!("Probe #{} answered in {:?}", ticket, started.elapsed());
                    return result
                        .peak_value
                        .ok_or_else(|| AcquisitionError::HardwareRead("probe carried no peak".to_string()));
                }
                Some(other) => trace!("Ignoring {} while waiting for probe #{}", event_kind(&other), ticket),
                None => {}
            }
        }
    }
}

fn event_kind(event: &WorkerEvent) -> &'static str {
    match event {
        WorkerEvent::Spectrum(_) => "spectrum",
        WorkerEvent::Ack(_) => "ack",
    }
}
