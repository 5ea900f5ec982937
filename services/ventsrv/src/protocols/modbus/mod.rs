//! Modbus TCP client pieces used by the engine

pub mod codec;
pub mod simulator;
pub mod transport;

pub use codec::{coils_to_bytes, registers_to_bytes, RegisterCodec};
pub use simulator::{ModbusSimulator, SimulatorWrite};
pub use transport::{Connector, Endpoint, ModbusTransport, TcpConnector, TcpTransport};
