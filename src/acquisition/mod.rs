// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Acquisition core
//!
//! Commands go in through a bounded queue, captures and acknowledgements come
//! out through another. The worker thread behind them is the only code that
//! touches the device.

mod averaging;
mod channels;
mod session;
mod types;
mod worker;

pub use averaging::ScanAccumulator;
pub use channels::{
    channels, CommandEnvelope, CommandSender, EventPublisher, EventReceiver, SpectrometerClient, Ticket,
    WorkerEndpoints,
};
pub use session::{SessionCounter, SessionFilter, SessionId, SessionObserver};
pub use types::{
    CollectionMode, CommandAck, CommandOutcome, SpectraType, SpectrometerCommand, SpectrometerResult,
    SpectrometerSettings, WorkerEvent,
};
pub use worker::{AcquisitionWorker, WorkerHandle, WorkerOptions};
