//! Modbus TCP simulator for testing
//!
//! In-memory holding registers and coils served through the tokio-modbus
//! server (FC01/03/05/06). Addresses are PDU addresses, no 1-based offset.
//! Tests can inject exception replies per address, delay replies and sever
//! live sockets.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::DuplexStream;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_modbus::prelude::{ExceptionCode, Request, Response};
use tokio_modbus::server::tcp::Server;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::Result;

const MAX_READ_REGISTERS: u16 = 125;
const MAX_READ_COILS: u16 = 2000;

/// Buffer between the client socket and the served end of the relay
const RELAY_BUFFER: usize = 1024;

/// A write the simulator accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatorWrite {
    Coil { address: u16, value: bool },
    Register { address: u16, value: u16 },
}

#[derive(Default)]
struct SimulatorState {
    holding_registers: RwLock<HashMap<u16, u16>>,
    coils: RwLock<HashMap<u16, bool>>,
    exception_addresses: RwLock<HashSet<u16>>,
    writes: RwLock<Vec<SimulatorWrite>>,
    response_delay: RwLock<Duration>,
    accepted: AtomicUsize,
    /// Replaced on every `drop_connections`
    connections: parking_lot::Mutex<CancellationToken>,
    shutdown: CancellationToken,
}

impl SimulatorState {
    async fn process(&self, request: Request<'static>) -> std::result::Result<Response, ExceptionCode> {
        match request {
            Request::ReadHoldingRegisters(address, count) => {
                self.check_read(address, count, MAX_READ_REGISTERS).await?;
                let holding = self.holding_registers.read().await;
                let words = (0..count)
                    .map(|i| holding.get(&address.wrapping_add(i)).copied().unwrap_or(0))
                    .collect();
                Ok(Response::ReadHoldingRegisters(words))
            },
            Request::ReadCoils(address, count) => {
                self.check_read(address, count, MAX_READ_COILS).await?;
                let coils = self.coils.read().await;
                let states = (0..count)
                    .map(|i| coils.get(&address.wrapping_add(i)).copied().unwrap_or(false))
                    .collect();
                Ok(Response::ReadCoils(states))
            },
            Request::WriteSingleCoil(address, value) => {
                self.check_address(address, 1).await?;
                self.coils.write().await.insert(address, value);
                self.writes
                    .write()
                    .await
                    .push(SimulatorWrite::Coil { address, value });
                Ok(Response::WriteSingleCoil(address, value))
            },
            Request::WriteSingleRegister(address, value) => {
                self.check_address(address, 1).await?;
                self.holding_registers.write().await.insert(address, value);
                self.writes
                    .write()
                    .await
                    .push(SimulatorWrite::Register { address, value });
                Ok(Response::WriteSingleRegister(address, value))
            },
            other => {
                debug!("Simulator rejected unsupported request: {:?}", other);
                Err(ExceptionCode::IllegalFunction)
            },
        }
    }

    async fn check_read(&self, address: u16, count: u16, limit: u16) -> std::result::Result<(), ExceptionCode> {
        if count == 0 || count > limit {
            return Err(ExceptionCode::IllegalDataValue);
        }
        self.check_address(address, count).await
    }

    async fn check_address(&self, start: u16, count: u16) -> std::result::Result<(), ExceptionCode> {
        let faulty = self.exception_addresses.read().await;
        if (0..count).any(|i| faulty.contains(&start.wrapping_add(i))) {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        Ok(())
    }
}

/// Per-connection service handed to the tokio-modbus server
struct SimulatorService {
    state: Arc<SimulatorState>,
}

impl tokio_modbus::server::Service for SimulatorService {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Response, ExceptionCode>> + Send>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let state = Arc::clone(&self.state);
        Box::pin(async move {
            let reply = state.process(req).await;
            let delay = *state.response_delay.read().await;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            reply
        })
    }
}

/// Simple Modbus TCP simulator
#[derive(Clone, Default)]
pub struct ModbusSimulator {
    state: Arc<SimulatorState>,
}

impl ModbusSimulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_holding_register(&self, address: u16, value: u16) {
        self.state
            .holding_registers
            .write()
            .await
            .insert(address, value);
    }

    pub async fn set_coil(&self, address: u16, value: bool) {
        self.state.coils.write().await.insert(address, value);
    }

    pub async fn holding_register(&self, address: u16) -> Option<u16> {
        self.state.holding_registers.read().await.get(&address).copied()
    }

    pub async fn coil(&self, address: u16) -> Option<bool> {
        self.state.coils.read().await.get(&address).copied()
    }

    /// Requests touching `address` answer with Illegal Data Address
    pub async fn inject_exception(&self, address: u16) {
        self.state.exception_addresses.write().await.insert(address);
    }

    pub async fn clear_exception(&self, address: u16) {
        self.state.exception_addresses.write().await.remove(&address);
    }

    pub async fn set_response_delay(&self, delay: Duration) {
        *self.state.response_delay.write().await = delay;
    }

    /// Writes accepted so far, in arrival order
    pub async fn writes(&self) -> Vec<SimulatorWrite> {
        self.state.writes.read().await.clone()
    }

    /// Number of TCP connections accepted since start
    pub fn accepted_connections(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Close every live client socket; the listener keeps accepting
    pub fn drop_connections(&self) {
        let mut token = self.state.connections.lock();
        token.cancel();
        *token = CancellationToken::new();
    }

    /// Stop accepting and close every client
    pub fn shutdown(&self) {
        self.state.shutdown.cancel();
        self.drop_connections();
    }

    /// Start simulator server on 127.0.0.1 (port 0 picks a free port)
    pub async fn start(&self, port: u16) -> Result<SocketAddr> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let local_addr = listener.local_addr()?;
        info!("Modbus simulator listening on {}", local_addr);

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let server = Server::new(listener);
            let on_connected = |stream: TcpStream, peer: SocketAddr| {
                let state = Arc::clone(&state);
                async move {
                    debug!("Simulator connection from {}", peer);
                    state.accepted.fetch_add(1, Ordering::SeqCst);
                    let token = state.connections.lock().clone();
                    let (served, relayed) = tokio::io::duplex(RELAY_BUFFER);
                    tokio::spawn(relay(stream, relayed, token, peer));
                    Ok::<_, std::io::Error>(Some((SimulatorService { state }, served)))
                }
            };
            let on_process_error = |err: std::io::Error| {
                debug!("Simulator connection error: {}", err);
            };

            tokio::select! {
                _ = state.shutdown.cancelled() => debug!("Simulator on {} stopped", local_addr),
                result = server.serve(&on_connected, on_process_error) => {
                    if let Err(e) = result {
                        error!("Simulator server error: {}", e);
                    }
                },
            }
        });

        Ok(local_addr)
    }
}

/// Pipe the client socket into the served stream until either side closes
/// or the connection generation is cancelled
async fn relay(
    mut socket: TcpStream,
    mut served: DuplexStream,
    token: CancellationToken,
    peer: SocketAddr,
) {
    tokio::select! {
        _ = token.cancelled() => debug!("Simulator dropped {}", peer),
        result = tokio::io::copy_bidirectional(&mut socket, &mut served) => {
            if let Err(e) = result {
                debug!("Simulator relay for {} ended: {}", peer, e);
            }
        },
    }
}
