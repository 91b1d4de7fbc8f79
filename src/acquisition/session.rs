// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Session tracking
//!
//! The worker owns a strictly increasing session counter and stamps every
//! capture with the id current when the capture *started*. Consumers keep
//! their own snapshot of the session they expect and drop anything else, so a
//! multi-second exposure that finishes after the user moved on simply fails
//! the comparison. Nothing is cancelled at the hardware level.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::trace;

use super::{CommandAck, SpectrometerResult, Ticket};

/// Session identifier. Never reused within a worker's lifetime.
pub type SessionId = u64;

/// Worker-side session counter.
///
/// Single writer (the worker thread); the current value is published through
/// an atomic so other threads can observe it without locking.
#[derive(Debug)]
pub struct SessionCounter {
    current: SessionId,
    published: Arc<AtomicU64>,
}

impl SessionCounter {
    /// Counter at 0, nothing armed yet
    pub fn new() -> Self {
        Self {
            current: 0,
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Id of the latest session
    pub fn current(&self) -> SessionId {
        self.current
    }

    /// Arm a new session and return its id
    pub fn advance(&mut self) -> SessionId {
        self.current += 1;
        self.published.store(self.current, Ordering::Release);
        self.current
    }

    /// Read-only view for other threads
    pub fn observer(&self) -> SessionObserver {
        SessionObserver {
            published: Arc::clone(&self.published),
        }
    }
}

impl Default for SessionCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock-free read access to the worker's current session id
#[derive(Debug, Clone)]
pub struct SessionObserver {
    published: Arc<AtomicU64>,
}

impl SessionObserver {
    /// Latest session id the worker published
    pub fn current(&self) -> SessionId {
        self.published.load(Ordering::Acquire)
    }
}

/// Consumer-side validity filter.
///
/// The snapshot is cleared synchronously when the consumer issues a
/// session-affecting command, and re-installed from the worker's
/// acknowledgement of that command. Until then every result is rejected.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    snapshot: Option<SessionId>,
    awaiting: Option<Ticket>,
}

impl SessionFilter {
    /// Filter that rejects everything until the first ack
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot; `None` while waiting for an acknowledgement or when disarmed
    pub fn snapshot(&self) -> Option<SessionId> {
        self.snapshot
    }

    /// Waiting for the ack of an issued command
    pub fn is_awaiting(&self) -> bool {
        self.awaiting.is_some()
    }

    /// Record that a session-affecting command went out under `ticket`
    pub fn on_issued(&mut self, ticket: Ticket) {
        self.snapshot = None;
        self.awaiting = Some(ticket);
    }

    /// Feed a worker acknowledgement. Returns true if it updated the snapshot.
    ///
    /// The worker handles commands in ticket order, so an ack at or after the
    /// awaited ticket reflects the state after our command.
    pub fn on_ack(&mut self, ack: &CommandAck) -> bool {
        match self.awaiting {
            Some(awaited) if ack.ticket >= awaited => {}
            _ => return false,
        }
        self.awaiting = None;
        self.snapshot = ack.armed.then_some(ack.session_id);
        trace!("Session snapshot now {:?} (ack #{})", self.snapshot, ack.ticket);
        true
    }

    /// Accept iff the result belongs to the snapshot session and is valid
    pub fn accepts(&self, result: &SpectrometerResult) -> bool {
        self.snapshot == Some(result.session_id) && result.is_valid
    }

    /// Reject everything until the next issued command is acknowledged
    pub fn invalidate(&mut self) {
        self.snapshot = None;
        self.awaiting = None;
    }

    /// Accept results stamped with `session_id` without waiting for an ack
    pub fn force(&mut self, session_id: SessionId) {
        self.awaiting = None;
        self.snapshot = Some(session_id);
    }
}
