// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Bounded command and event queues between clients and the worker

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError, TrySendError};
use tracing::{debug, warn};

use super::{SpectrometerCommand, WorkerEvent};
use crate::error::{AcquisitionError, AcquisitionResult};

/// Client-assigned command sequence number, echoed back by the worker
pub type Ticket = u64;

/// A command plus the ticket it was submitted under
#[derive(Debug, Clone)]
pub struct CommandEnvelope {
    /// Sequence number the ack will echo
    pub ticket: Ticket,
    /// What to do
    pub command: SpectrometerCommand,
}

/// Create the command and event queues.
///
/// Returns the client halves and the worker halves.
pub fn channels(command_capacity: usize, event_capacity: usize) -> (SpectrometerClient, WorkerEndpoints) {
    let (command_tx, command_rx) = channel::bounded(command_capacity);
    let (event_tx, event_rx) = channel::bounded(event_capacity);

    let client = SpectrometerClient {
        commands: CommandSender {
            tx: command_tx,
            next_ticket: Arc::new(AtomicU64::new(1)),
        },
        events: EventReceiver { rx: event_rx.clone() },
    };

    let worker = WorkerEndpoints {
        commands: command_rx,
        events: EventPublisher {
            tx: event_tx,
            overflow: event_rx,
        },
    };

    (client, worker)
}

/// Non-blocking command submission. Cheap to clone; clones share the ticket sequence.
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: Sender<CommandEnvelope>,
    next_ticket: Arc<AtomicU64>,
}

impl CommandSender {
    /// Enqueue a command without blocking.
    ///
    /// Fails with [`AcquisitionError::QueueFull`] when the buffer is saturated;
    /// the caller should coalesce rather than spin.
    pub fn submit(&self, command: SpectrometerCommand) -> AcquisitionResult<Ticket> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let name = command.name();
        match self.tx.try_send(CommandEnvelope { ticket, command }) {
            Ok(()) => {
                debug!("Submitted {} as #{}", name, ticket);
                Ok(ticket)
            }
            Err(TrySendError::Full(_)) => Err(AcquisitionError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(AcquisitionError::Disconnected),
        }
    }

    /// Enqueue a command, waiting up to `timeout` for room
    pub fn submit_timeout(&self, command: SpectrometerCommand, timeout: Duration) -> AcquisitionResult<Ticket> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let name = command.name();
        match self.tx.send_timeout(CommandEnvelope { ticket, command }, timeout) {
            Ok(()) => {
                debug!("Submitted {} as #{}", name, ticket);
                Ok(ticket)
            }
            Err(SendTimeoutError::Timeout(_)) => Err(AcquisitionError::QueueFull),
            Err(SendTimeoutError::Disconnected(_)) => Err(AcquisitionError::Disconnected),
        }
    }

    /// Commands waiting for the worker
    pub fn pending(&self) -> usize {
        self.tx.len()
    }

    /// Whether the next `submit` would fail with `QueueFull`
    pub fn is_full(&self) -> bool {
        self.tx.is_full()
    }
}

/// Client side of the event queue
#[derive(Debug, Clone)]
pub struct EventReceiver {
    rx: Receiver<WorkerEvent>,
}

impl EventReceiver {
    /// Next event if one is already queued
    pub fn try_recv(&self) -> AcquisitionResult<Option<WorkerEvent>> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(AcquisitionError::Disconnected),
        }
    }

    /// Wait up to `timeout` for the next event
    pub fn recv_timeout(&self, timeout: Duration) -> AcquisitionResult<Option<WorkerEvent>> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(AcquisitionError::Disconnected),
        }
    }

    /// Everything queued right now
    pub fn drain(&self) -> Vec<WorkerEvent> {
        self.rx.try_iter().collect()
    }
}

/// Both client halves together
#[derive(Debug, Clone)]
pub struct SpectrometerClient {
    /// Command half
    pub commands: CommandSender,
    /// Event half
    pub events: EventReceiver,
}

impl SpectrometerClient {
    /// Shorthand for `commands.submit`
    pub fn submit(&self, command: SpectrometerCommand) -> AcquisitionResult<Ticket> {
        self.commands.submit(command)
    }
}

/// Worker halves of the queues
#[derive(Debug)]
pub struct WorkerEndpoints {
    /// Commands in submission order
    pub commands: Receiver<CommandEnvelope>,
    /// Where captures and acks go
    pub events: EventPublisher,
}

/// Worker side of the event queue.
///
/// Never blocks: when the queue is saturated the oldest event is dropped to
/// make room, so consumers always see the most recent captures.
#[derive(Debug)]
pub struct EventPublisher {
    tx: Sender<WorkerEvent>,
    overflow: Receiver<WorkerEvent>,
}

impl EventPublisher {
    /// Post an event without blocking
    pub fn publish(&self, event: WorkerEvent) {
        let event = match self.tx.try_send(event) {
            Ok(()) => return,
            Err(TrySendError::Full(event)) => event,
            Err(TrySendError::Disconnected(_)) => return,
        };

        warn!("Result queue full, dropping oldest event");
        let _ = self.overflow.try_recv();
        if self.tx.try_send(event).is_err() {
            warn!("Result queue still full, dropping newest event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::{CollectionMode, CommandAck, CommandOutcome, SpectrometerSettings};

    fn ack(ticket: Ticket) -> WorkerEvent {
        WorkerEvent::Ack(CommandAck {
            ticket,
            command: SpectrometerCommand::StopSession,
            session_id: 0,
            armed: false,
            settings: SpectrometerSettings {
                integration_time_us: 1000,
                scans_to_average: 0,
                collection_mode: CollectionMode::Raw,
            },
            outcome: CommandOutcome::Applied,
        })
    }

    #[test]
    fn test_submit_reports_queue_full() {
        let (client, worker) = channels(2, 4);
        let first = client.submit(SpectrometerCommand::StartSession).unwrap();
        let second = client.submit(SpectrometerCommand::StopSession).unwrap();
        assert!(second > first);
        assert!(client.commands.is_full());

        assert_eq!(
            client.submit(SpectrometerCommand::StartSession),
            Err(AcquisitionError::QueueFull)
        );

        let envelope = worker.commands.try_recv().unwrap();
        assert_eq!(envelope.ticket, first);
        assert!(client.submit(SpectrometerCommand::StartSession).is_ok());
    }

    #[test]
    fn test_submit_after_worker_gone() {
        let (client, worker) = channels(2, 4);
        drop(worker);
        assert_eq!(
            client.submit(SpectrometerCommand::StartSession),
            Err(AcquisitionError::Disconnected)
        );
    }

    #[test]
    fn test_tickets_shared_between_clones() {
        let (client, _worker) = channels(8, 4);
        let other = client.commands.clone();
        let a = client.submit(SpectrometerCommand::StartSession).unwrap();
        let b = other.submit(SpectrometerCommand::StopSession).unwrap();
        let c = client.submit(SpectrometerCommand::StartSession).unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_publisher_drops_oldest_when_full() {
        let (client, worker) = channels(2, 2);
        worker.events.publish(ack(1));
        worker.events.publish(ack(2));
        worker.events.publish(ack(3));

        let tickets: Vec<Ticket> = client
            .events
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                WorkerEvent::Ack(a) => Some(a.ticket),
                _ => None,
            })
            .collect();
        assert_eq!(tickets, vec![2, 3]);
    }
}
