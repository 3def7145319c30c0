use thiserror::Error;

use crate::quant::GgmlType;

/// Errors returned by the fallible setup surface (configuration, tensor
/// description, host buffers).
///
/// Failures that happen while an operator is running are not represented
/// here: they go through [`device_check!`](crate::device_check) and abort.
#[derive(Error, Debug)]
pub enum OffloadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Unknown tensor type: {0}")]
    UnknownTensorType(u32),

    #[error("Row length {row_len} is not a multiple of the {ty} block size {block}")]
    RowNotBlockAligned {
        ty: GgmlType,
        row_len: usize,
        block: usize,
    },

    #[error("Data length {actual} does not match expected {expected} bytes")]
    DataLength { expected: usize, actual: usize },

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),
}

/// Failure of a raw device primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("invalid device ordinal {0}")]
    InvalidDevice(usize),

    #[error("out of memory on device {device}: requested {requested} bytes, {free} free")]
    OutOfMemory {
        device: usize,
        requested: usize,
        free: usize,
    },

    #[error("invalid device pointer {0}")]
    InvalidPointer(String),

    #[error("access of {len} bytes at offset {offset} exceeds allocation of {size} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("invalid stream handle {0}")]
    InvalidStream(usize),

    #[error("invalid event handle {0}")]
    InvalidEvent(usize),

    #[error("pinned host allocation of {0} bytes failed")]
    HostAllocFailed(usize),

    #[error("kernel '{name}' failed: {reason}")]
    LaunchFailed { name: &'static str, reason: String },

    #[error("circular wait between streams")]
    Deadlock,
}

/// Unwrap a driver result or abort with the call site and error.
///
/// Device faults have no recovery path: a half-finished operator would leave
/// partially written outputs behind.
#[macro_export]
macro_rules! device_check {
    ($call:expr) => {
        match $call {
            Ok(value) => value,
            Err(err) => panic!(
                "device error at {}:{}: {} failed: {}",
                file!(),
                line!(),
                stringify!($call),
                err
            ),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_check_passes_ok_through() {
        let value: Result<u32, DriverError> = Ok(7);
        assert_eq!(device_check!(value), 7);
    }

    #[test]
    #[should_panic(expected = "device error at")]
    fn test_device_check_panics_with_location() {
        let failed: Result<u32, DriverError> = Err(DriverError::InvalidDevice(3));
        device_check!(failed);
    }

    #[test]
    fn test_error_messages() {
        let e = OffloadError::RowNotBlockAligned {
            ty: GgmlType::Q4_0,
            row_len: 33,
            block: 32,
        };
        assert_eq!(
            e.to_string(),
            "Row length 33 is not a multiple of the Q4_0 block size 32"
        );
        let e = DriverError::OutOfMemory {
            device: 1,
            requested: 10,
            free: 4,
        };
        assert!(e.to_string().contains("device 1"));
    }
}
