//! Periodic register sweeps
//!
//! A sweep reads every register of the table in order through one session,
//! decodes each reply and publishes the whole set once. At most one sweep is
//! in flight; the in-progress flag is released by a drop guard so a
//! cancelled sweep can never wedge the scheduler.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::{ConnectionManager, Session};
use super::sink::{PollStatus, ResultSink};
use crate::error::{Result, VentSrvError};
use crate::model::{
    Measurement, MeasurementSet, RegisterDefinition, RegisterSource, RegisterTable, WireType,
    SCALE_SUFFIX,
};
use crate::protocols::modbus::{coils_to_bytes, registers_to_bytes, RegisterCodec};

/// What a `tick` or `force_poll` call did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Every register was attempted and the set was published
    Completed,
    /// Transport dropped mid-sweep; partial set published
    Aborted,
    /// Skip flag consumed
    Skipped,
    /// Another sweep is in flight
    Busy,
    /// Shut down while waiting for the connection
    Cancelled,
}

struct InProgress<'a>(&'a AtomicBool);

impl<'a> InProgress<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InProgress(flag))
    }
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct PollScheduler {
    name: String,
    connection: Arc<ConnectionManager>,
    table: Arc<RegisterTable>,
    sink: Arc<dyn ResultSink>,
    in_progress: AtomicBool,
    skip_next: AtomicBool,
    last_success: Mutex<Option<DateTime<Utc>>>,
    sweeps: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl PollScheduler {
    pub fn new(
        name: impl Into<String>,
        connection: Arc<ConnectionManager>,
        table: Arc<RegisterTable>,
        sink: Arc<dyn ResultSink>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            connection,
            table,
            sink,
            in_progress: AtomicBool::new(false),
            skip_next: AtomicBool::new(false),
            last_success: Mutex::new(None),
            sweeps: AtomicU64::new(0),
            task: Mutex::new(None),
            shutdown,
        })
    }

    /// Spawn the tick loop; the first tick fires immediately
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = scheduler.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let outcome = scheduler.tick().await;
                        debug!("[{}] Tick: {:?}", scheduler.name, outcome);
                    },
                }
            }
        });

        info!(
            "[{}] Polling every {}s",
            self.name,
            interval.as_secs_f64()
        );
        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Abort the tick loop
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    /// Scheduled sweep; honours and consumes the skip flag
    pub async fn tick(&self) -> PollOutcome {
        self.poll(true).await
    }

    /// Sweep now regardless of the skip flag
    pub async fn force_poll(&self) -> PollOutcome {
        self.poll(false).await
    }

    /// Suppress the next scheduled tick
    pub fn skip_next(&self) {
        self.skip_next.store(true, Ordering::Release);
    }

    pub fn is_polling(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        *self.last_success.lock()
    }

    /// Sweeps that reached the register reads
    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::SeqCst)
    }

    async fn poll(&self, honour_skip: bool) -> PollOutcome {
        let Some(_guard) = InProgress::acquire(&self.in_progress) else {
            debug!("[{}] Sweep already in progress", self.name);
            return PollOutcome::Busy;
        };

        if honour_skip && self.skip_next.swap(false, Ordering::AcqRel) {
            debug!("[{}] Skipping tick after write", self.name);
            return PollOutcome::Skipped;
        }

        let ready = tokio::select! {
            ready = self.connection.wait_ready() => ready,
            _ = self.shutdown.cancelled() => false,
        };
        if !ready {
            return PollOutcome::Cancelled;
        }

        self.sweep().await
    }

    async fn sweep(&self) -> PollOutcome {
        self.sweeps.fetch_add(1, Ordering::SeqCst);
        let mut results = MeasurementSet::new();
        let mut lost: Option<VentSrvError> = None;

        match self.connection.session().await {
            Ok(mut session) => {
                for (name, definition) in self.table.iter() {
                    if lost.is_some() {
                        results.insert(name.to_string(), Measurement::unavailable(&definition.label));
                        continue;
                    }
                    let measurement = match read_raw(&mut session, definition).await {
                        Ok(raw) => RegisterCodec::decode_measurement(name, definition, &raw),
                        Err(e) => {
                            warn!("[{}] Register {} unavailable: {}", self.name, name, e);
                            if e.is_transport() {
                                lost = Some(e);
                            }
                            Measurement::unavailable(&definition.label)
                        },
                    };
                    results.insert(name.to_string(), measurement);
                }
            },
            Err(e) => {
                lost = Some(e);
                for (name, definition) in self.table.iter() {
                    results.insert(name.to_string(), Measurement::unavailable(&definition.label));
                }
            },
        }

        apply_scales(&self.table, &mut results);
        self.sink.on_measurement(&results);

        match lost {
            Some(e) => {
                warn!("[{}] Sweep aborted: {}", self.name, e);
                self.sink.on_poll_status(PollStatus::NoConnection);
                PollOutcome::Aborted
            },
            None => {
                let now = Utc::now();
                *self.last_success.lock() = Some(now);
                self.sink.on_poll_status(PollStatus::Completed { at: now });
                debug!("[{}] Sweep completed: {} registers", self.name, results.len());
                PollOutcome::Completed
            },
        }
    }
}

async fn read_raw(session: &mut Session<'_>, definition: &RegisterDefinition) -> Result<Vec<u8>> {
    match definition.source {
        RegisterSource::Holding => {
            let words = session
                .read_holding_registers(definition.address, definition.quantity)
                .await?;
            Ok(registers_to_bytes(&words))
        },
        RegisterSource::Coil => {
            let coils = session
                .read_coils(definition.address, definition.quantity)
                .await?;
            Ok(coils_to_bytes(&coils))
        },
    }
}

/// `<base>_scale` SCALE registers fill the `scale` field of `<base>`
fn apply_scales(table: &RegisterTable, results: &mut MeasurementSet) {
    for (name, definition) in table.iter() {
        if definition.wire_type != WireType::Scale {
            continue;
        }
        let Some(base) = name.strip_suffix(SCALE_SUFFIX) else {
            continue;
        };
        let Some(scale) = results.get(name).map(|m| m.value.clone()) else {
            continue;
        };
        if let Some(target) = results.get_mut(base) {
            target.scale = scale;
        }
    }
}
