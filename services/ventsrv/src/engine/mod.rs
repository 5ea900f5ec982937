//! Connection, poll and command engine

pub mod connection;
pub mod debouncer;
pub mod device;
pub mod poller;
pub mod sink;

#[cfg(test)]
pub mod test_utils;

pub use connection::{ConnectionManager, ConnectionState, Session};
pub use debouncer::{
    CommandDebouncer, CommandState, CommandValue, DebounceSettings, PendingCommand, WriteCommand,
    WriteStep,
};
pub use device::{ActionTable, ActionValue, DeviceEngine, EngineSettings};
pub use poller::{PollOutcome, PollScheduler};
pub use sink::{ChannelSink, LogSink, PollStatus, ResultSink, SinkEvent};
