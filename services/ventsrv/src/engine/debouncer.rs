//! Debounced write commands
//!
//! Each logical action owns one slot: Idle -> Pending (timer armed) -> Sent
//! -> Idle. A request arriving while Pending replaces the queued command and
//! re-arms the window, so only the last value of a burst reaches the device.
//! Fired commands run one at a time in fire order.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::connection::ConnectionManager;
use super::poller::PollScheduler;
use super::sink::{PollStatus, ResultSink};
use crate::error::{Result, VentSrvError};

/// Value carried by a single write; the variant selects FC05 or FC06
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandValue {
    Coil(bool),
    /// Pre-scaled register value
    Register(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteCommand {
    pub address: u16,
    pub value: CommandValue,
}

impl WriteCommand {
    pub fn coil(address: u16, value: bool) -> Self {
        Self {
            address,
            value: CommandValue::Coil(value),
        }
    }

    pub fn register(address: u16, value: u16) -> Self {
        Self {
            address,
            value: CommandValue::Register(value),
        }
    }
}

impl fmt::Display for WriteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value {
            CommandValue::Coil(v) => write!(f, "coil {} = {}", self.address, v),
            CommandValue::Register(v) => write!(f, "register {} = {}", self.address, v),
        }
    }
}

/// One write followed by a pause before the next step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteStep {
    pub command: WriteCommand,
    pub delay_after: Duration,
}

impl WriteStep {
    pub fn new(command: WriteCommand) -> Self {
        Self {
            command,
            delay_after: Duration::ZERO,
        }
    }

    pub fn then_wait(mut self, delay: Duration) -> Self {
        self.delay_after = delay;
        self
    }
}

/// Command waiting for its debounce window to elapse
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub action: String,
    pub steps: Vec<WriteStep>,
    pub scheduled_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandState {
    #[default]
    Idle,
    Pending,
    Sent,
}

#[derive(Default)]
struct Slot {
    state: CommandState,
    pending: Option<PendingCommand>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

/// Debounce and dispatch timing
#[derive(Debug, Clone, Copy)]
pub struct DebounceSettings {
    pub window: Duration,
    pub settle: Duration,
    pub refresh_after_write: bool,
}

impl Default for DebounceSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(1),
            settle: Duration::from_secs(5),
            refresh_after_write: true,
        }
    }
}

pub struct CommandDebouncer {
    name: String,
    connection: Arc<ConnectionManager>,
    scheduler: Arc<PollScheduler>,
    sink: Arc<dyn ResultSink>,
    settings: DebounceSettings,
    slots: Mutex<HashMap<String, Slot>>,
    dispatch: AsyncMutex<()>,
    refresh: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl CommandDebouncer {
    pub fn new(
        name: impl Into<String>,
        connection: Arc<ConnectionManager>,
        scheduler: Arc<PollScheduler>,
        sink: Arc<dyn ResultSink>,
        settings: DebounceSettings,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            connection,
            scheduler,
            sink,
            settings,
            slots: Mutex::new(HashMap::new()),
            dispatch: AsyncMutex::new(()),
            refresh: Mutex::new(None),
            shutdown,
        })
    }

    /// Queue `steps` for `action`, superseding a queued command for it
    pub fn request_write(self: &Arc<Self>, action: &str, steps: Vec<WriteStep>) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(VentSrvError::state("Engine is shut down"));
        }
        if steps.is_empty() {
            return Err(VentSrvError::validation(format!(
                "Action {} produced no writes",
                action
            )));
        }

        let mut slots = self.slots.lock();
        let slot = slots.entry(action.to_string()).or_default();

        if slot.state == CommandState::Pending {
            if let Some(timer) = slot.timer.take() {
                timer.abort();
            }
            debug!("[{}] {} superseded by newer request", self.name, action);
        }

        slot.generation += 1;
        slot.state = CommandState::Pending;
        slot.pending = Some(PendingCommand {
            action: action.to_string(),
            steps,
            scheduled_at: Instant::now() + self.settings.window,
        });

        let generation = slot.generation;
        let debouncer = Arc::clone(self);
        let action = action.to_string();
        let window = self.settings.window;
        slot.timer = Some(tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(window) => {},
                _ = debouncer.shutdown.cancelled() => return,
            }
            debouncer.fire(&action, generation).await;
        }));

        Ok(())
    }

    pub fn state(&self, action: &str) -> CommandState {
        self.slots
            .lock()
            .get(action)
            .map(|slot| slot.state)
            .unwrap_or_default()
    }

    /// Actions with an armed timer
    pub fn pending_count(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| slot.state == CommandState::Pending)
            .count()
    }

    /// Drop every queued command and the pending refresh
    pub fn cancel_all(&self) {
        let mut slots = self.slots.lock();
        for (action, slot) in slots.iter_mut() {
            if slot.state == CommandState::Pending {
                if let Some(timer) = slot.timer.take() {
                    timer.abort();
                }
                slot.pending = None;
                slot.generation += 1;
                slot.state = CommandState::Idle;
                debug!("[{}] Cancelled pending {}", self.name, action);
            }
        }
        drop(slots);

        if let Some(refresh) = self.refresh.lock().take() {
            refresh.abort();
        }
    }

    async fn fire(self: &Arc<Self>, action: &str, generation: u64) {
        let command = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(action) else {
                return;
            };
            if slot.generation != generation {
                return;
            }
            slot.timer = None;
            match slot.pending.take() {
                Some(command) => {
                    slot.state = CommandState::Sent;
                    command
                },
                None => {
                    slot.state = CommandState::Idle;
                    return;
                },
            }
        };

        let outcome = self.dispatch(&command).await;

        {
            let mut slots = self.slots.lock();
            if let Some(slot) = slots.get_mut(action) {
                if slot.generation == generation {
                    slot.state = CommandState::Idle;
                }
            }
        }

        match outcome {
            Ok(()) => {
                info!(
                    "[{}] {} sent ({} writes)",
                    self.name,
                    action,
                    command.steps.len()
                );
                if self.settings.refresh_after_write {
                    self.schedule_refresh();
                }
            },
            Err(e) => {
                error!("[{}] {} failed: {}", self.name, action, e);
                if !self.shutdown.is_cancelled() {
                    self.sink.on_poll_status(PollStatus::NoConnection);
                }
            },
        }
    }

    /// Run all steps in order under the dispatch lock
    async fn dispatch(&self, command: &PendingCommand) -> Result<()> {
        let _order = self.dispatch.lock().await;

        let ready = tokio::select! {
            ready = self.connection.wait_ready() => ready,
            _ = self.shutdown.cancelled() => false,
        };
        if !ready {
            return Err(VentSrvError::state("Engine shut down before dispatch"));
        }

        let mut session = self.connection.session().await?;
        let last = command.steps.len().saturating_sub(1);
        for (index, step) in command.steps.iter().enumerate() {
            debug!("[{}] {} step {}: {}", self.name, command.action, index + 1, step.command);
            session.write(&step.command).await?;

            if index < last && !step.delay_after.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(step.delay_after) => {},
                    _ = self.shutdown.cancelled() => {
                        return Err(VentSrvError::state("Engine shut down mid-sequence"));
                    },
                }
            }
        }
        drop(session);

        self.scheduler.skip_next();
        Ok(())
    }

    /// Sweep once the device has settled; later writes push it back
    fn schedule_refresh(self: &Arc<Self>) {
        let scheduler = Arc::clone(&self.scheduler);
        let shutdown = self.shutdown.clone();
        let settle = self.settings.settle;
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(settle) => {},
                _ = shutdown.cancelled() => return,
            }
            scheduler.force_poll().await;
        });

        if let Some(previous) = self.refresh.lock().replace(handle) {
            previous.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::poller::PollOutcome;
    use crate::engine::sink::{ChannelSink, SinkEvent};
    use crate::engine::test_utils::{drain, MockDevice};
    use crate::model::{RegisterDefinition, RegisterTable, WireType};
    use crate::protocols::modbus::Endpoint;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        device: Arc<MockDevice>,
        connection: Arc<ConnectionManager>,
        scheduler: Arc<PollScheduler>,
        debouncer: Arc<CommandDebouncer>,
        rx: UnboundedReceiver<SinkEvent>,
        shutdown: CancellationToken,
    }

    fn fixture(settings: DebounceSettings) -> Fixture {
        let device = MockDevice::new();
        let (sink, rx) = ChannelSink::new();
        let sink: Arc<dyn ResultSink> = Arc::new(sink);
        let shutdown = CancellationToken::new();
        let connection = ConnectionManager::new(
            "test",
            Endpoint::new("127.0.0.1", 502),
            device.connector(),
            Arc::clone(&sink),
            Duration::from_secs(30),
            shutdown.clone(),
        );
        let table: RegisterTable = [(
            "eco_mode",
            RegisterDefinition::coil(40, WireType::Uint32, "eco Mode"),
        )]
        .into_iter()
        .collect();
        let scheduler = PollScheduler::new(
            "test",
            Arc::clone(&connection),
            Arc::new(table),
            Arc::clone(&sink),
            shutdown.clone(),
        );
        let debouncer = CommandDebouncer::new(
            "test",
            Arc::clone(&connection),
            Arc::clone(&scheduler),
            sink,
            settings,
            shutdown.clone(),
        );
        Fixture {
            device,
            connection,
            scheduler,
            debouncer,
            rx,
            shutdown,
        }
    }

    fn eco(value: bool) -> Vec<WriteStep> {
        vec![WriteStep::new(WriteCommand::coil(40, value))]
    }

    fn no_refresh() -> DebounceSettings {
        DebounceSettings {
            refresh_after_write: false,
            ..DebounceSettings::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_write_wins_within_window() {
        let fx = fixture(no_refresh());
        fx.connection.connect().await;

        fx.debouncer.request_write("eco_mode", eco(true)).unwrap();
        assert_eq!(fx.debouncer.state("eco_mode"), CommandState::Pending);
        tokio::time::sleep(Duration::from_millis(200)).await;
        fx.debouncer.request_write("eco_mode", eco(false)).unwrap();
        assert_eq!(fx.debouncer.pending_count(), 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(fx.device.writes(), vec![WriteCommand::coil(40, false)]);
        assert_eq!(fx.debouncer.state("eco_mode"), CommandState::Idle);
        assert_eq!(fx.debouncer.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_requests_sends_once() {
        let fx = fixture(no_refresh());
        fx.connection.connect().await;

        for value in 150..=220u16 {
            fx.debouncer
                .request_write(
                    "target_temperature",
                    vec![WriteStep::new(WriteCommand::register(135, value))],
                )
                .unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(fx.device.writes(), vec![WriteCommand::register(135, 220)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_actions_debounce_independently() {
        let fx = fixture(no_refresh());
        fx.connection.connect().await;

        fx.debouncer.request_write("eco_mode", eco(true)).unwrap();
        fx.debouncer
            .request_write(
                "target_temperature",
                vec![WriteStep::new(WriteCommand::register(135, 200))],
            )
            .unwrap();
        assert_eq!(fx.debouncer.pending_count(), 2);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let writes = fx.device.writes();
        assert_eq!(writes.len(), 2);
        assert!(writes.contains(&WriteCommand::coil(40, true)));
        assert!(writes.contains(&WriteCommand::register(135, 200)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_runs_in_order_with_delays() {
        let fx = fixture(no_refresh());
        fx.connection.connect().await;

        let second = Duration::from_secs(1);
        let steps = vec![
            WriteStep::new(WriteCommand::coil(0, false)).then_wait(second),
            WriteStep::new(WriteCommand::coil(10, false)).then_wait(second),
            WriteStep::new(WriteCommand::coil(1, true)),
        ];
        fx.debouncer.request_write("status_mode", steps).unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(fx.device.writes().len(), 1);
        assert_eq!(fx.debouncer.state("status_mode"), CommandState::Sent);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            fx.device.writes(),
            vec![
                WriteCommand::coil(0, false),
                WriteCommand::coil(10, false),
                WriteCommand::coil(1, true),
            ]
        );
        assert_eq!(fx.debouncer.state("status_mode"), CommandState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_write_skips_next_tick_and_refreshes() {
        let mut fx = fixture(DebounceSettings::default());
        fx.connection.connect().await;
        drain(&mut fx.rx);

        fx.debouncer.request_write("eco_mode", eco(true)).unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(fx.device.writes().len(), 1);
        assert_eq!(fx.scheduler.sweeps(), 0);

        // Settle delay, then a forced sweep
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fx.scheduler.sweeps(), 1);
        let events = drain(&mut fx.rx);
        assert!(events.iter().any(|e| matches!(
            e,
            SinkEvent::Measurement(set) if set["eco_mode"].value == "1"
        )));

        // Forced refresh left the skip flag for the scheduled tick
        assert_eq!(fx.scheduler.tick().await, PollOutcome::Skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_step_abandons_sequence() {
        let mut fx = fixture(DebounceSettings::default());
        fx.connection.connect().await;
        drain(&mut fx.rx);

        fx.device.fail_transport_at(10);
        let steps = vec![
            WriteStep::new(WriteCommand::coil(0, false)).then_wait(Duration::from_secs(1)),
            WriteStep::new(WriteCommand::coil(10, false)).then_wait(Duration::from_secs(1)),
            WriteStep::new(WriteCommand::coil(3, true)),
        ];
        fx.debouncer.request_write("status_mode", steps).unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(fx.device.writes(), vec![WriteCommand::coil(0, false)]);
        let events = drain(&mut fx.rx);
        assert!(events.contains(&SinkEvent::PollStatus(PollStatus::NoConnection)));
        assert_eq!(fx.debouncer.state("status_mode"), CommandState::Idle);
        // No refresh sweep and no skip after a failure
        assert_eq!(fx.scheduler.sweeps(), 0);
        assert!(!fx.debouncer.connection.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_waits_for_connection() {
        let fx = fixture(no_refresh());
        fx.device.set_reachable(false);
        fx.connection.connect().await;

        fx.debouncer.request_write("eco_mode", eco(true)).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(fx.device.writes().is_empty());
        assert_eq!(fx.debouncer.state("eco_mode"), CommandState::Sent);

        fx.device.set_reachable(true);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fx.device.writes(), vec![WriteCommand::coil(40, true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_drops_pending() {
        let fx = fixture(no_refresh());
        fx.connection.connect().await;

        fx.debouncer.request_write("eco_mode", eco(true)).unwrap();
        fx.debouncer.cancel_all();
        assert_eq!(fx.debouncer.pending_count(), 0);
        assert_eq!(fx.debouncer.state("eco_mode"), CommandState::Idle);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(fx.device.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_after_shutdown() {
        let fx = fixture(no_refresh());
        fx.shutdown.cancel();
        assert!(matches!(
            fx.debouncer.request_write("eco_mode", eco(true)),
            Err(VentSrvError::StateError(_))
        ));
        assert!(fx.debouncer.request_write("eco_mode", vec![]).is_err());
    }
}
