//! Per-device facade
//!
//! Wires one connection manager, poll scheduler and command debouncer around
//! a shared cancellation token and exposes the command API to the hub.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::connection::{ConnectionManager, ConnectionState};
use super::debouncer::{CommandDebouncer, DebounceSettings, WriteStep};
use super::poller::{PollOutcome, PollScheduler};
use super::sink::ResultSink;
use crate::error::{Result, VentSrvError};
use crate::model::RegisterTable;
use crate::protocols::modbus::{Connector, Endpoint};

/// User-facing value handed to an action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl ActionValue {
    /// Accepts booleans, 0/1 and their textual forms
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ActionValue::Bool(v) => Some(*v),
            ActionValue::Number(n) if *n == 0.0 => Some(false),
            ActionValue::Number(n) if *n == 1.0 => Some(true),
            ActionValue::Number(_) => None,
            ActionValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "on" => Some(true),
                "0" | "false" | "off" => Some(false),
                _ => None,
            },
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            ActionValue::Number(n) if n.is_finite() => Some(*n),
            ActionValue::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            _ => None,
        }
    }

    /// Mode selector as text ("0", "1", ...)
    pub fn as_mode(&self) -> Option<String> {
        match self {
            ActionValue::Text(s) => Some(s.trim().to_string()),
            ActionValue::Number(n) if n.fract() == 0.0 && *n >= 0.0 => Some(format!("{}", *n as u64)),
            _ => None,
        }
    }
}

impl fmt::Display for ActionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionValue::Bool(v) => write!(f, "{}", v),
            ActionValue::Number(n) => write!(f, "{}", n),
            ActionValue::Text(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<bool> for ActionValue {
    fn from(value: bool) -> Self {
        ActionValue::Bool(value)
    }
}

impl From<f64> for ActionValue {
    fn from(value: f64) -> Self {
        ActionValue::Number(value)
    }
}

impl From<&str> for ActionValue {
    fn from(value: &str) -> Self {
        ActionValue::Text(value.to_string())
    }
}

/// Maps a logical action and user value to ordered register writes
pub trait ActionTable: Send + Sync {
    /// Must reject invalid values with `ValidationError` without side effects
    fn resolve(&self, action: &str, value: &ActionValue) -> Result<Vec<WriteStep>>;

    fn actions(&self) -> &[&'static str];
}

/// Timing and addressing for one device
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub name: String,
    pub endpoint: Endpoint,
    pub poll_interval: Duration,
    pub retry_backoff: Duration,
    pub debounce: DebounceSettings,
}

impl EngineSettings {
    pub fn new(name: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            name: name.into(),
            endpoint,
            poll_interval: Duration::from_secs(60),
            retry_backoff: Duration::from_secs(30),
            debounce: DebounceSettings::default(),
        }
    }
}

pub struct DeviceEngine {
    name: String,
    connection: Arc<ConnectionManager>,
    scheduler: Arc<PollScheduler>,
    debouncer: Arc<CommandDebouncer>,
    actions: Arc<dyn ActionTable>,
    shutdown: CancellationToken,
    stopped: AtomicBool,
}

impl DeviceEngine {
    /// Build the components, start connecting and start the poll loop
    pub fn start(
        settings: EngineSettings,
        table: Arc<RegisterTable>,
        actions: Arc<dyn ActionTable>,
        connector: Arc<dyn Connector>,
        sink: Arc<dyn ResultSink>,
    ) -> Result<Arc<Self>> {
        settings.endpoint.validate()?;
        if settings.poll_interval.is_zero() || settings.retry_backoff.is_zero() {
            return Err(VentSrvError::config(format!(
                "Device {}: poll interval and retry backoff must be non-zero",
                settings.name
            )));
        }
        if table.is_empty() {
            return Err(VentSrvError::config(format!(
                "Device {}: register table is empty",
                settings.name
            )));
        }

        let shutdown = CancellationToken::new();
        let connection = ConnectionManager::new(
            settings.name.clone(),
            settings.endpoint.clone(),
            connector,
            Arc::clone(&sink),
            settings.retry_backoff,
            shutdown.clone(),
        );
        let scheduler = PollScheduler::new(
            settings.name.clone(),
            Arc::clone(&connection),
            table,
            Arc::clone(&sink),
            shutdown.clone(),
        );
        let debouncer = CommandDebouncer::new(
            settings.name.clone(),
            Arc::clone(&connection),
            Arc::clone(&scheduler),
            sink,
            settings.debounce,
            shutdown.clone(),
        );

        let engine = Arc::new(Self {
            name: settings.name.clone(),
            connection,
            scheduler,
            debouncer,
            actions,
            shutdown,
            stopped: AtomicBool::new(false),
        });

        {
            let connection = Arc::clone(&engine.connection);
            tokio::spawn(async move { connection.connect().await });
        }
        engine.scheduler.start(settings.poll_interval);

        info!(
            "[{}] Engine started for {}",
            settings.name, settings.endpoint
        );
        Ok(engine)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolve and queue a user command; only validation fails synchronously
    pub fn request_write(&self, action: &str, value: ActionValue) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(VentSrvError::state(format!("Device {} is shut down", self.name)));
        }
        let steps = self.actions.resolve(action, &value)?;
        info!("[{}] {} <- {}", self.name, action, value);
        self.debouncer.request_write(action, steps)
    }

    pub fn supported_actions(&self) -> &[&'static str] {
        self.actions.actions()
    }

    pub async fn force_immediate_poll(&self) -> PollOutcome {
        self.scheduler.force_poll().await
    }

    /// Switch to a new address; the old transport is closed first
    pub async fn reconfigure_endpoint(&self, host: &str, port: u16) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(VentSrvError::state(format!("Device {} is shut down", self.name)));
        }
        let current = self.connection.endpoint();
        let endpoint = Endpoint {
            host: host.to_string(),
            port,
            ..current
        };
        endpoint.validate()?;

        info!("[{}] Reconnecting to {}", self.name, endpoint);
        self.connection.disconnect().await;
        self.connection.set_endpoint(endpoint)?;
        self.connection.connect().await;
        Ok(())
    }

    /// Stop every timer and close the transport; safe to call repeatedly
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        self.debouncer.cancel_all();
        self.scheduler.stop();
        self.connection.disconnect().await;
        info!("[{}] Engine stopped", self.name);
    }

    pub fn is_shut_down(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn last_successful_poll(&self) -> Option<DateTime<Utc>> {
        self.scheduler.last_success()
    }

    pub fn pending_commands(&self) -> usize {
        self.debouncer.pending_count()
    }
}

impl Drop for DeviceEngine {
    fn drop(&mut self) {
        if !self.stopped.load(Ordering::Acquire) {
            warn!("[{}] Engine dropped without shutdown", self.name);
            self.shutdown.cancel();
            self.scheduler.stop();
        }
    }
}
