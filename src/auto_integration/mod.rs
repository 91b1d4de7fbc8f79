// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Auto-integration
//!
//! Closed-loop search for the exposure that puts the spectrum's peak between
//! 80% and 95% (by default) of the detector's full scale. The controller is a
//! pure state machine; [`AutoIntegrationRunner`] drives it over the worker's
//! queues.

mod runner;

pub use runner::AutoIntegrationRunner;

use std::fmt;

use tracing::{debug, info};

use crate::config::AutoIntegrationConfig;
use crate::hardware::IntegrationLimits;

/// Why the search stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptReason {
    /// Peak landed inside the target window
    TargetAchieved,
    /// Shortest exposure the device allows is still too bright
    AtMinimumSaturated,
    /// Longest exposure the device allows is still too dim
    AtMaximumLow,
    /// Ran out of iterations; last probe is proposed
    IterationBudgetExhausted,
}

impl fmt::Display for AcceptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AcceptReason::TargetAchieved => "target achieved",
            AcceptReason::AtMinimumSaturated => "at minimum, still saturated",
            AcceptReason::AtMaximumLow => "at maximum, still low",
            AcceptReason::IterationBudgetExhausted => "iteration budget exhausted",
        };
        f.write_str(text)
    }
}

/// SETUP -> RUNNING -> CONFIRM | CANCELLED
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Not started
    Setup,
    /// Probing
    Running,
    /// Stopped with a proposal awaiting confirmation
    Confirm(AcceptReason),
    /// Abandoned; nothing to confirm
    Cancelled,
}

/// What to do after a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Probe again at this exposure
    Probe(u32),
    /// Stop; this exposure is the proposal
    Accept {
        /// Why the search stopped
        reason: AcceptReason,
        /// Proposed exposure
        integration_time_us: u32,
    },
}

/// Tuning resolved against a concrete device
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutoIntegrationParams {
    /// Lower edge of the target window, in counts
    pub target_low_adc: f64,
    /// Upper edge of the target window, in counts
    pub target_high_adc: f64,
    /// Probe budget
    pub max_iterations: u32,
    /// Fraction of the proportional correction applied per step
    pub proportional_gain: f64,
    /// Smallest step, in microseconds
    pub min_adjustment_us: u32,
    /// Step multiplier after a direction change
    pub oscillation_damping_factor: f64,
    /// Device exposure limits
    pub limits: IntegrationLimits,
}

impl AutoIntegrationParams {
    /// Resolve percentages against the detector's full scale
    pub fn new(config: &AutoIntegrationConfig, limits: IntegrationLimits, max_adc_count: f64) -> Self {
        Self {
            target_low_adc: max_adc_count * config.target_low_percent / 100.0,
            target_high_adc: max_adc_count * config.target_high_percent / 100.0,
            max_iterations: config.max_iterations,
            proportional_gain: config.proportional_gain,
            min_adjustment_us: config.min_adjustment_us,
            oscillation_damping_factor: config.oscillation_damping_factor,
            limits,
        }
    }

    /// Middle of the target window
    pub fn target_mid_adc(&self) -> f64 {
        (self.target_low_adc + self.target_high_adc) / 2.0
    }

    /// Whether `peak` lies in the target window
    pub fn in_target(&self, peak: f64) -> bool {
        (self.target_low_adc..=self.target_high_adc).contains(&peak)
    }
}

/// Proportional controller with oscillation damping
#[derive(Debug, Clone)]
pub struct AutoIntegrationController {
    params: AutoIntegrationParams,
    phase: Phase,
    test_integration_us: u32,
    iteration: u32,
    last_step: f64,
    last_peak: Option<f64>,
}

impl AutoIntegrationController {
    /// Idle controller
    pub fn new(params: AutoIntegrationParams) -> Self {
        Self {
            params,
            phase: Phase::Setup,
            test_integration_us: params.limits.min_us(),
            iteration: 0,
            last_step: 0.0,
            last_peak: None,
        }
    }

    /// Resolved tuning
    pub fn params(&self) -> &AutoIntegrationParams {
        &self.params
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Exposure of the probe in flight, or of the proposal once confirmed
    pub fn test_integration_us(&self) -> u32 {
        self.test_integration_us
    }

    /// Probes evaluated in this run
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Peak of the latest probe
    pub fn last_peak(&self) -> Option<f64> {
        self.last_peak
    }

    /// The proposed exposure, once the search has stopped
    pub fn accepted_integration_us(&self) -> Option<u32> {
        match self.phase {
            Phase::Confirm(_) => Some(self.test_integration_us),
            _ => None,
        }
    }

    /// Begin a run at `initial_us` (clamped). Returns the first probe exposure.
    pub fn start(&mut self, initial_us: u32) -> u32 {
        self.phase = Phase::Running;
        self.test_integration_us = self.params.limits.clamp(initial_us);
        self.iteration = 0;
        self.last_step = 0.0;
        self.last_peak = None;
        info!(
            "Auto-integration started at {} us, target {:.0}-{:.0} counts",
            self.test_integration_us, self.params.target_low_adc, self.params.target_high_adc
        );
        self.test_integration_us
    }

    /// Feed the peak of the probe at [`test_integration_us`](Self::test_integration_us).
    ///
    /// `None` unless the controller is running.
    pub fn on_probe(&mut self, peak: f64) -> Option<Step> {
        if self.phase != Phase::Running {
            return None;
        }
        self.last_peak = Some(peak);

        let p = &self.params;
        let t = self.test_integration_us;
        debug!(
            "Auto-integration iteration {}: {} us peaked at {:.0}",
            self.iteration, t, peak
        );

        let reason = if p.in_target(peak) {
            Some(AcceptReason::TargetAchieved)
        } else if t <= p.limits.min_us() && peak >= p.target_high_adc {
            Some(AcceptReason::AtMinimumSaturated)
        } else if t >= p.limits.max_us() && peak < p.target_low_adc {
            Some(AcceptReason::AtMaximumLow)
        } else if self.iteration >= p.max_iterations {
            Some(AcceptReason::IterationBudgetExhausted)
        } else {
            None
        };

        if let Some(reason) = reason {
            self.phase = Phase::Confirm(reason);
            info!("Auto-integration stopped at {} us: {}", t, reason);
            return Some(Step::Accept {
                reason,
                integration_time_us: t,
            });
        }

        let t = t as f64;
        let ratio = p.target_mid_adc() / peak.max(1.0);
        let mut step = (t * ratio - t) * p.proportional_gain;
        if self.last_step != 0.0 && step.signum() != self.last_step.signum() {
            step *= p.oscillation_damping_factor;
        }
        let min_step = p.min_adjustment_us as f64;
        if step.abs() < min_step {
            step = min_step.copysign(step);
        }
        self.last_step = step;

        let next = (t + step).round().clamp(0.0, u32::MAX as f64) as u32;
        self.test_integration_us = p.limits.clamp(next);
        self.iteration += 1;
        Some(Step::Probe(self.test_integration_us))
    }

    /// Back to SETUP once a proposal has been applied
    pub fn reset(&mut self) {
        self.phase = Phase::Setup;
        self.iteration = 0;
        self.last_step = 0.0;
    }

    /// Abandon the run
    pub fn cancel(&mut self) {
        if self.phase != Phase::Cancelled {
            info!("Auto-integration cancelled");
        }
        self.phase = Phase::Cancelled;
    }
}
