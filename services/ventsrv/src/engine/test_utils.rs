//! Scripted in-memory device for engine unit tests

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;

use super::debouncer::{CommandValue, WriteCommand};
use super::sink::SinkEvent;
use crate::error::{Result, VentSrvError};
use crate::protocols::modbus::{Connector, Endpoint, ModbusTransport};

#[derive(Default)]
pub struct MockDevice {
    holding: Mutex<HashMap<u16, u16>>,
    coils: Mutex<HashMap<u16, bool>>,
    protocol_faults: Mutex<HashSet<u16>>,
    /// One-shot transport failure at this address
    transport_fault: Mutex<Option<u16>>,
    unreachable: AtomicBool,
    read_delay: Mutex<Duration>,
    writes: Mutex<Vec<WriteCommand>>,
    connect_attempts: AtomicUsize,
    closes: AtomicUsize,
    reads: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            device: Arc::clone(self),
        })
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn set_holding(&self, address: u16, value: u16) {
        self.holding.lock().insert(address, value);
    }

    pub fn set_coil(&self, address: u16, value: bool) {
        self.coils.lock().insert(address, value);
    }

    pub fn fail_protocol_at(&self, address: u16) {
        self.protocol_faults.lock().insert(address);
    }

    pub fn fail_transport_at(&self, address: u16) {
        *self.transport_fault.lock() = Some(address);
    }

    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock() = delay;
    }

    pub fn writes(&self) -> Vec<WriteCommand> {
        self.writes.lock().clone()
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping requests observed
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn request<T>(&self, address: u16, op: impl FnOnce() -> T) -> Result<T> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let delay = *self.read_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        {
            let mut fault = self.transport_fault.lock();
            if *fault == Some(address) {
                *fault = None;
                return Err(VentSrvError::io("connection reset by peer"));
            }
        }
        if self.protocol_faults.lock().contains(&address) {
            return Err(VentSrvError::protocol(
                "Modbus exception response: code 02 (Illegal Data Address)",
            ));
        }
        Ok(op())
    }
}

struct MockConnector {
    device: Arc<MockDevice>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn ModbusTransport>> {
        self.device.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if self.device.unreachable.load(Ordering::SeqCst) {
            return Err(VentSrvError::connection(format!(
                "connect {} refused",
                endpoint.address()
            )));
        }
        Ok(Box::new(MockTransport {
            device: Arc::clone(&self.device),
        }))
    }
}

struct MockTransport {
    device: Arc<MockDevice>,
}

#[async_trait]
impl ModbusTransport for MockTransport {
    async fn read_holding_registers(&mut self, address: u16, quantity: u16) -> Result<Vec<u16>> {
        self.device.reads.fetch_add(1, Ordering::SeqCst);
        let device = Arc::clone(&self.device);
        self.device
            .request(address, || {
                let holding = device.holding.lock();
                (0..quantity)
                    .map(|i| holding.get(&(address + i)).copied().unwrap_or(0))
                    .collect()
            })
            .await
    }

    async fn read_coils(&mut self, address: u16, quantity: u16) -> Result<Vec<bool>> {
        self.device.reads.fetch_add(1, Ordering::SeqCst);
        let device = Arc::clone(&self.device);
        self.device
            .request(address, || {
                let coils = device.coils.lock();
                (0..quantity)
                    .map(|i| coils.get(&(address + i)).copied().unwrap_or(false))
                    .collect()
            })
            .await
    }

    async fn write_single_coil(&mut self, address: u16, value: bool) -> Result<()> {
        let device = Arc::clone(&self.device);
        self.device
            .request(address, || {
                device.coils.lock().insert(address, value);
                device.writes.lock().push(WriteCommand {
                    address,
                    value: CommandValue::Coil(value),
                });
            })
            .await
    }

    async fn write_single_register(&mut self, address: u16, value: u16) -> Result<()> {
        let device = Arc::clone(&self.device);
        self.device
            .request(address, || {
                device.holding.lock().insert(address, value);
                device.writes.lock().push(WriteCommand {
                    address,
                    value: CommandValue::Register(value),
                });
            })
            .await
    }

    async fn close(&mut self) {
        self.device.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Collect every event already queued
pub fn drain(rx: &mut UnboundedReceiver<SinkEvent>) -> Vec<SinkEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
