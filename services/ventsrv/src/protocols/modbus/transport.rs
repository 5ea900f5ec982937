//! Modbus TCP transport
//!
//! A `ModbusTransport` is one live socket exchanging one request at a time.
//! A `Connector` opens transports; the connection manager owns the result.
//! Framing and transaction ids are handled by tokio-modbus.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::error::Elapsed;
use tokio::time::timeout;
use tokio_modbus::client::{tcp, Client, Context};
use tokio_modbus::prelude::{Reader, Slave, Writer};
use tracing::{debug, info, warn};

use crate::error::{Result, VentSrvError};

/// Where and how to reach one controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id: 1,
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(3),
        }
    }

    pub fn with_unit_id(mut self, unit_id: u8) -> Self {
        self.unit_id = unit_id;
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, response: Duration) -> Self {
        self.connect_timeout = connect;
        self.response_timeout = response;
        self
    }

    /// Reject settings that can never connect
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(VentSrvError::config("Endpoint host is empty"));
        }
        if self.port == 0 {
            return Err(VentSrvError::config("Endpoint port must be non-zero"));
        }
        if self.connect_timeout.is_zero() || self.response_timeout.is_zero() {
            return Err(VentSrvError::config("Endpoint timeouts must be non-zero"));
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} (unit {})", self.host, self.port, self.unit_id)
    }
}

/// One request/response session with a Modbus server
#[async_trait]
pub trait ModbusTransport: Send {
    /// FC03
    async fn read_holding_registers(&mut self, address: u16, quantity: u16) -> Result<Vec<u16>>;

    /// FC01
    async fn read_coils(&mut self, address: u16, quantity: u16) -> Result<Vec<bool>>;

    /// FC05
    async fn write_single_coil(&mut self, address: u16, value: bool) -> Result<()>;

    /// FC06
    async fn write_single_register(&mut self, address: u16, value: u16) -> Result<()>;

    /// Close the socket
    async fn close(&mut self);
}

/// Opens transports for the connection manager
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn ModbusTransport>>;
}

/// FC03 reply must fit one PDU
const MAX_READ_REGISTERS: u16 = 125;
/// FC01 limit defined by the protocol
const MAX_READ_COILS: u16 = 2000;

/// tokio-modbus client context over a TCP stream
pub struct TcpTransport {
    context: Context,
    peer: String,
    response_timeout: Duration,
    /// Set while a request is outstanding. Still set on entry means an
    /// earlier caller was cancelled or failed before its reply was read,
    /// so the stream can no longer be trusted.
    in_exchange: bool,
}

impl TcpTransport {
    pub async fn connect(endpoint: &Endpoint) -> Result<Self> {
        let addr = endpoint.address();
        debug!("Connecting to Modbus TCP endpoint: {}", addr);

        let stream = match timeout(endpoint.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(VentSrvError::connection(format!(
                    "Failed to connect to {}: {}",
                    addr, e
                )));
            },
            Err(_) => {
                return Err(VentSrvError::timeout(format!(
                    "Connection to {} timed out",
                    addr
                )));
            },
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        info!("Connected to Modbus TCP endpoint: {}", endpoint);
        Ok(Self {
            context: tcp::attach_slave(stream, Slave(endpoint.unit_id)),
            peer: addr,
            response_timeout: endpoint.response_timeout,
            in_exchange: false,
        })
    }

    fn begin(&mut self, function: &str) -> Result<()> {
        if self.in_exchange {
            return Err(VentSrvError::connection(format!(
                "{} to {} refused: previous request was abandoned before its reply",
                function, self.peer
            )));
        }
        self.in_exchange = true;
        Ok(())
    }

    /// Exceptions leave the stream in step; anything else keeps it poisoned
    fn complete<T>(
        &mut self,
        function: &str,
        outcome: std::result::Result<tokio_modbus::Result<T>, Elapsed>,
    ) -> Result<T> {
        match outcome {
            Ok(Ok(Ok(value))) => {
                self.in_exchange = false;
                Ok(value)
            },
            Ok(Ok(Err(exception))) => {
                self.in_exchange = false;
                Err(VentSrvError::protocol(format!(
                    "Modbus exception response to {}: {}",
                    function, exception
                )))
            },
            Ok(Err(tokio_modbus::Error::Transport(e))) => {
                debug!("{} to {} failed: {}", function, self.peer, e);
                Err(VentSrvError::from(e))
            },
            Ok(Err(e)) => Err(VentSrvError::connection(format!(
                "{} reply from {} out of step: {}",
                function, self.peer, e
            ))),
            Err(_) => Err(VentSrvError::timeout(format!(
                "No {} response from {} within {}ms",
                function,
                self.peer,
                self.response_timeout.as_millis()
            ))),
        }
    }
}

fn check_quantity(function: &str, quantity: u16, max: u16) -> Result<()> {
    if quantity == 0 || quantity > max {
        return Err(VentSrvError::validation(format!(
            "Invalid {} quantity: {} (1..={})",
            function, quantity, max
        )));
    }
    Ok(())
}

fn check_len<T>(function: &str, values: Vec<T>, quantity: u16) -> Result<Vec<T>> {
    if values.len() != usize::from(quantity) {
        return Err(VentSrvError::protocol(format!(
            "{} returned {} values, expected {}",
            function,
            values.len(),
            quantity
        )));
    }
    Ok(values)
}

#[async_trait]
impl ModbusTransport for TcpTransport {
    async fn read_holding_registers(&mut self, address: u16, quantity: u16) -> Result<Vec<u16>> {
        check_quantity("FC03", quantity, MAX_READ_REGISTERS)?;
        self.begin("FC03")?;
        let outcome = timeout(
            self.response_timeout,
            self.context.read_holding_registers(address, quantity),
        )
        .await;
        let words = self.complete("FC03", outcome)?;
        check_len("FC03", words, quantity)
    }

    async fn read_coils(&mut self, address: u16, quantity: u16) -> Result<Vec<bool>> {
        check_quantity("FC01", quantity, MAX_READ_COILS)?;
        self.begin("FC01")?;
        let outcome = timeout(self.response_timeout, self.context.read_coils(address, quantity)).await;
        let coils = self.complete("FC01", outcome)?;
        check_len("FC01", coils, quantity)
    }

    async fn write_single_coil(&mut self, address: u16, value: bool) -> Result<()> {
        self.begin("FC05")?;
        let outcome = timeout(
            self.response_timeout,
            self.context.write_single_coil(address, value),
        )
        .await;
        self.complete("FC05", outcome)
    }

    async fn write_single_register(&mut self, address: u16, value: u16) -> Result<()> {
        self.begin("FC06")?;
        let outcome = timeout(
            self.response_timeout,
            self.context.write_single_register(address, value),
        )
        .await;
        self.complete("FC06", outcome)
    }

    async fn close(&mut self) {
        if let Err(e) = self.context.disconnect().await {
            debug!("Error during Modbus disconnect from {}: {}", self.peer, e);
        }
    }
}

/// Production connector
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn ModbusTransport>> {
        let transport = TcpTransport::connect(endpoint).await?;
        Ok(Box::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_validation() {
        assert!(Endpoint::new("192.168.1.50", 502).validate().is_ok());
        assert!(matches!(
            Endpoint::new("  ", 502).validate(),
            Err(VentSrvError::ConfigError(_))
        ));
        assert!(Endpoint::new("host", 0).validate().is_err());
        assert!(Endpoint::new("host", 502)
            .with_timeouts(Duration::ZERO, Duration::from_secs(1))
            .validate()
            .is_err());
    }

    #[test]
    fn test_endpoint_display() {
        let ep = Endpoint::new("10.0.0.2", 5020).with_unit_id(3);
        assert_eq!(ep.to_string(), "10.0.0.2:5020 (unit 3)");
        assert_eq!(ep.address(), "10.0.0.2:5020");
    }

    #[test]
    fn test_read_quantity_limits() {
        assert!(check_quantity("FC03", 1, MAX_READ_REGISTERS).is_ok());
        assert!(check_quantity("FC03", 0, MAX_READ_REGISTERS).is_err());
        assert!(matches!(
            check_quantity("FC03", 126, MAX_READ_REGISTERS),
            Err(VentSrvError::ValidationError(_))
        ));
        assert!(check_quantity("FC01", 2000, MAX_READ_COILS).is_ok());
        assert!(check_len("FC01", vec![true], 2).is_err());
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        // Bind then drop to get a port with nothing listening
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = TcpConnector
            .connect(&Endpoint::new("127.0.0.1", port))
            .await
            .err()
            .unwrap();
        assert!(err.is_transport());
    }
}
