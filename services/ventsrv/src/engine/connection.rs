//! Connection lifecycle for one Modbus endpoint
//!
//! State machine:
//! ```text
//! Disconnected -> Connecting -> Connected
//! Connected | Connecting -> Retrying -> Connecting
//! any -> Disconnected   (explicit disconnect only)
//! ```
//! Exactly one transport exists per manager and at most one retry timer is
//! armed. Duplicate disconnect events collapse on the pending retry because
//! `Retrying -> Retrying` is not an edge.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, Mutex as AsyncMutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::debouncer::{CommandValue, WriteCommand};
use super::sink::ResultSink;
use crate::error::{Result, VentSrvError};
use crate::protocols::modbus::{Connector, Endpoint, ModbusTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Retrying,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Retrying => "retrying",
        };
        f.write_str(name)
    }
}

type TransportSlot = Option<Box<dyn ModbusTransport>>;

/// Owner of the single transport of a device
pub struct ConnectionManager {
    name: String,
    endpoint: RwLock<Endpoint>,
    connector: Arc<dyn Connector>,
    sink: Arc<dyn ResultSink>,
    retry_backoff: Duration,
    state: watch::Sender<ConnectionState>,
    transport: AsyncMutex<TransportSlot>,
    retry_timer: Mutex<Option<JoinHandle<()>>>,
    retries_scheduled: AtomicU64,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        name: impl Into<String>,
        endpoint: Endpoint,
        connector: Arc<dyn Connector>,
        sink: Arc<dyn ResultSink>,
        retry_backoff: Duration,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            name: name.into(),
            endpoint: RwLock::new(endpoint),
            connector,
            sink,
            retry_backoff,
            state,
            transport: AsyncMutex::new(None),
            retry_timer: Mutex::new(None),
            retries_scheduled: AtomicU64::new(0),
            shutdown,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Liveness indicator for pollers and command dispatch
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint.read().clone()
    }

    /// Used by the next `connect`
    pub fn set_endpoint(&self, endpoint: Endpoint) -> Result<()> {
        endpoint.validate()?;
        info!("[{}] Endpoint set to {}", self.name, endpoint);
        *self.endpoint.write() = endpoint;
        Ok(())
    }

    /// True while a retry timer is armed
    pub fn retry_pending(&self) -> bool {
        self.retry_timer
            .lock()
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    /// Retry timers armed since creation
    pub fn retries_scheduled(&self) -> u64 {
        self.retries_scheduled.load(Ordering::SeqCst)
    }

    /// Open the transport; no-op while Connecting or Connected
    ///
    /// Failures never surface here, they move the manager to Retrying.
    pub async fn connect(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        if !self.transition(
            &[ConnectionState::Disconnected, ConnectionState::Retrying],
            ConnectionState::Connecting,
        ) {
            debug!("[{}] Connect ignored in state {}", self.name, self.state());
            return;
        }

        // A manual connect supersedes the armed retry
        if let Some(timer) = self.retry_timer.lock().take() {
            timer.abort();
        }

        let endpoint = self.endpoint();
        debug!("[{}] Connecting to {}", self.name, endpoint);

        let result = tokio::select! {
            result = self.connector.connect(&endpoint) => result,
            _ = self.shutdown.cancelled() => return,
        };

        match result {
            Ok(mut transport) => {
                let mut slot = self.transport.lock().await;
                if self.state() != ConnectionState::Connecting {
                    drop(slot);
                    debug!("[{}] Connect raced with disconnect, closing", self.name);
                    transport.close().await;
                    return;
                }
                if let Some(mut stale) = slot.replace(transport) {
                    stale.close().await;
                }
                self.transition(&[ConnectionState::Connecting], ConnectionState::Connected);
            },
            Err(e) => {
                warn!("[{}] Connect to {} failed: {}", self.name, endpoint, e);
                self.on_disconnect_event(&e.to_string());
            },
        }
    }

    /// Tear down: cancel the retry, close the transport exactly once
    pub async fn disconnect(&self) {
        if let Some(timer) = self.retry_timer.lock().take() {
            timer.abort();
        }

        self.transition(
            &[
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Retrying,
            ],
            ConnectionState::Disconnected,
        );

        let taken = self.transport.lock().await.take();
        if let Some(mut transport) = taken {
            transport.close().await;
            info!("[{}] Transport closed", self.name);
        }
    }

    /// Error, close or timeout reported for the live transport
    ///
    /// Ignored when Disconnected or already Retrying.
    pub fn on_disconnect_event(self: &Arc<Self>, reason: &str) {
        if self.shutdown.is_cancelled() {
            return;
        }
        if !self.transition(
            &[ConnectionState::Connected, ConnectionState::Connecting],
            ConnectionState::Retrying,
        ) {
            debug!(
                "[{}] Disconnect event ignored in state {}: {}",
                self.name,
                self.state(),
                reason
            );
            return;
        }

        warn!(
            "[{}] Connection lost ({}), retrying in {}s",
            self.name,
            reason,
            self.retry_backoff.as_secs_f64()
        );
        self.schedule_retry();
    }

    fn schedule_retry(self: &Arc<Self>) {
        let mut timer = self.retry_timer.lock();
        if let Some(previous) = timer.take() {
            previous.abort();
        }

        let manager = Arc::downgrade(self);
        let backoff = self.retry_backoff;
        let shutdown = self.shutdown.clone();
        self.retries_scheduled.fetch_add(1, Ordering::SeqCst);

        *timer = Some(tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {},
                _ = shutdown.cancelled() => return,
            }
            if let Some(manager) = manager.upgrade() {
                manager.retry_timer.lock().take();
                manager.connect().await;
            }
        }));
    }

    /// Wait until Connected; false on shutdown
    pub async fn wait_ready(&self) -> bool {
        let mut rx = self.state.subscribe();
        tokio::select! {
            result = rx.wait_for(|state| *state == ConnectionState::Connected) => result.is_ok(),
            _ = self.shutdown.cancelled() => false,
        }
    }

    /// Exclusive access to the transport for a sequence of exchanges
    pub async fn session(self: &Arc<Self>) -> Result<Session<'_>> {
        if !self.is_ready() {
            return Err(VentSrvError::not_connected());
        }
        let slot = self.transport.lock().await;
        if slot.is_none() {
            return Err(VentSrvError::not_connected());
        }
        Ok(Session {
            manager: self,
            slot,
        })
    }

    /// Apply a guarded transition and notify the sink
    fn transition(&self, from: &[ConnectionState], to: ConnectionState) -> bool {
        let mut previous = to;
        let changed = self.state.send_if_modified(|current| {
            if *current == to || !from.contains(current) {
                return false;
            }
            previous = *current;
            *current = to;
            true
        });

        if changed {
            info!("[{}] Connection {} -> {}", self.name, previous, to);
            self.sink
                .on_connectivity_change(to == ConnectionState::Connected);
        }
        changed
    }
}

/// Locked transport; a transport-class failure drops it and starts a retry
pub struct Session<'a> {
    manager: &'a Arc<ConnectionManager>,
    slot: MutexGuard<'a, TransportSlot>,
}

impl Session<'_> {
    pub async fn read_holding_registers(&mut self, address: u16, quantity: u16) -> Result<Vec<u16>> {
        let result = match self.slot.as_mut() {
            Some(transport) => transport.read_holding_registers(address, quantity).await,
            None => Err(VentSrvError::not_connected()),
        };
        self.check(result).await
    }

    pub async fn read_coils(&mut self, address: u16, quantity: u16) -> Result<Vec<bool>> {
        let result = match self.slot.as_mut() {
            Some(transport) => transport.read_coils(address, quantity).await,
            None => Err(VentSrvError::not_connected()),
        };
        self.check(result).await
    }

    pub async fn write(&mut self, command: &WriteCommand) -> Result<()> {
        let result = match self.slot.as_mut() {
            Some(transport) => match command.value {
                CommandValue::Coil(value) => transport.write_single_coil(command.address, value).await,
                CommandValue::Register(value) => {
                    transport.write_single_register(command.address, value).await
                },
            },
            None => Err(VentSrvError::not_connected()),
        };
        self.check(result).await
    }

    async fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_transport() {
                if let Some(mut broken) = self.slot.take() {
                    broken.close().await;
                    self.manager.on_disconnect_event(&e.to_string());
                }
            }
        }
        result
    }
}
