//! ventsrv - Modbus TCP engine for Exvent ventilation units
//!
//! One [`engine::DeviceEngine`] per unit keeps a single Modbus TCP session
//! alive, sweeps the unit's register table on a fixed interval and applies
//! debounced user commands without overlapping the sweeps.

pub mod config;
pub mod devices;
pub mod engine;
pub mod error;
pub mod model;
pub mod protocols;

pub use config::AppConfig;
pub use devices::DeviceModel;
pub use engine::{ActionValue, DeviceEngine, ResultSink};
pub use error::{Result, VentSrvError};
pub use model::{Measurement, MeasurementSet, RegisterDefinition, RegisterTable, WireType};
