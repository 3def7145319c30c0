pub mod error;
pub mod quant;
pub mod config;
pub mod device;
pub mod pool;
pub mod tensor;
pub mod kernels;
pub mod dispatch;
pub mod cli;

pub use config::{MatMulStrategy, Precision, RuntimeConfig};
pub use device::{Driver, SimDeviceSpec, SimDriver};
pub use dispatch::{DeviceStatus, HostBuffer, Op, Runtime};
pub use error::{DriverError, OffloadError};
pub use pool::{DevicePool, PoolStats};
pub use quant::GgmlType;
pub use tensor::{Location, Tensor};
