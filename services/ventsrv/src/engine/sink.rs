//! Consumer boundary of the engine
//!
//! A `ResultSink` receives every published sweep, every connectivity
//! transition and the last-poll status. Callbacks run on engine tasks and
//! must not block.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::model::{MeasurementSet, RegisterTable};

/// "Last poll" indicator shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// Sweep finished at `at`
    Completed { at: DateTime<Utc> },
    /// Sweep or command could not reach the device
    NoConnection,
}

pub trait ResultSink: Send + Sync {
    /// One call per sweep, including partial sweeps
    fn on_measurement(&self, measurements: &MeasurementSet);

    /// One call per connection state transition
    fn on_connectivity_change(&self, connected: bool);

    fn on_poll_status(&self, status: PollStatus);
}

/// Writes results to the tracing log, calibrated with the register table
pub struct LogSink {
    device: String,
    table: Arc<RegisterTable>,
}

impl LogSink {
    pub fn new(device: impl Into<String>, table: Arc<RegisterTable>) -> Self {
        Self {
            device: device.into(),
            table,
        }
    }
}

impl ResultSink for LogSink {
    fn on_measurement(&self, measurements: &MeasurementSet) {
        for (name, m) in measurements {
            let divisor = self.table.get(name).and_then(|def| def.divisor);
            match m.calibrated(divisor) {
                Some(value) if divisor.is_some() => {
                    info!("[{}] {} ({}) = {:.1}", self.device, name, m.label, value)
                },
                _ => info!("[{}] {} ({}) = {}", self.device, name, m.label, m.value),
            }
        }
    }

    fn on_connectivity_change(&self, connected: bool) {
        if connected {
            info!("[{}] Device available", self.device);
        } else {
            warn!("[{}] Device unavailable", self.device);
        }
    }

    fn on_poll_status(&self, status: PollStatus) {
        match status {
            PollStatus::Completed { at } => info!(
                "[{}] Last poll: {}",
                self.device,
                at.with_timezone(&chrono::Local).format("%d.%m.%Y, %H:%M:%S")
            ),
            PollStatus::NoConnection => warn!("[{}] Last poll: No connection", self.device),
        }
    }
}

/// Event forwarded by `ChannelSink`
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Measurement(MeasurementSet),
    Connectivity(bool),
    PollStatus(PollStatus),
}

/// Forwards every callback into an unbounded channel
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: SinkEvent) {
        // Receiver gone means nobody is listening any more
        let _ = self.tx.send(event);
    }
}

impl ResultSink for ChannelSink {
    fn on_measurement(&self, measurements: &MeasurementSet) {
        self.forward(SinkEvent::Measurement(measurements.clone()));
    }

    fn on_connectivity_change(&self, connected: bool) {
        self.forward(SinkEvent::Connectivity(connected));
    }

    fn on_poll_status(&self, status: PollStatus) {
        self.forward(SinkEvent::PollStatus(status));
    }
}
