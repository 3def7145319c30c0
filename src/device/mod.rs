//! Device runtime abstraction.
//!
//! A [`Driver`] exposes the raw primitives the engine builds on: memory
//! info, raw allocate/free, pinned host registration, ordered streams,
//! completion events, async and synchronous copies, memset and kernel launch.
//! Everything above this layer (pool, dispatcher, kernels) talks to devices
//! only through these calls.
//!
//! Kernels are Rust closures executed by the driver against one device's
//! memory ([`DeviceHeap`]) when their stream reaches them. [`sim::SimDriver`]
//! runs them on host memory with deferred, in-order stream queues.

use std::collections::HashMap;

use crate::error::DriverError;

pub mod sim;

pub use sim::{SimDeviceSpec, SimDriver, SimStats};

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// A pointer into one device's memory: an allocation plus a byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr {
    pub device: usize,
    pub alloc: u64,
    pub offset: usize,
}

impl DevicePtr {
    /// Pointer `bytes` further into the same allocation.
    #[inline]
    pub fn add(self, bytes: usize) -> Self {
        Self {
            offset: self.offset + bytes,
            ..self
        }
    }
}

impl std::fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dev{}:{:#x}+{}", self.device, self.alloc, self.offset)
    }
}

/// An ordered command queue on one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stream {
    pub device: usize,
    pub(crate) id: usize,
}

/// A completion marker recorded into a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Event {
    pub device: usize,
    pub(crate) id: usize,
}

/// Static description of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProperties {
    pub name: String,
    pub total_memory: usize,
    /// Capability tier, e.g. 610 or 860. Gates kernel variants.
    pub capability: u32,
}

/// Current memory usage of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    pub free: usize,
    pub total: usize,
}

/// Device-side work: runs with exclusive access to its device's memory.
pub type Kernel = Box<dyn FnOnce(&mut DeviceHeap) -> Result<(), DriverError> + Send>;

// ---------------------------------------------------------------------------
// Driver trait
// ---------------------------------------------------------------------------

/// Raw device primitives.
///
/// Calls that take a [`Stream`] are asynchronous: they are ordered after all
/// work previously submitted to that stream, and only `memcpy_d2h`,
/// `stream_synchronize` and `event_synchronize` block the calling thread.
/// Errors raised by queued work are reported by the next synchronizing call
/// on the same stream.
pub trait Driver: Send + Sync {
    fn device_count(&self) -> usize;
    fn properties(&self, device: usize) -> Result<DeviceProperties, DriverError>;
    fn mem_info(&self, device: usize) -> Result<MemInfo, DriverError>;

    /// Allocate `size` bytes of device memory.
    fn malloc(&self, device: usize, size: usize) -> Result<DevicePtr, DriverError>;
    /// Release an allocation returned by `malloc`. `ptr.offset` must be 0.
    fn free(&self, ptr: DevicePtr) -> Result<(), DriverError>;

    /// Page-lock `size` bytes of host memory for fast transfers.
    fn host_register(&self, size: usize) -> Result<(), DriverError>;
    fn host_unregister(&self, size: usize) -> Result<(), DriverError>;

    fn create_stream(&self, device: usize) -> Result<Stream, DriverError>;
    fn destroy_stream(&self, stream: Stream) -> Result<(), DriverError>;
    fn stream_synchronize(&self, stream: Stream) -> Result<(), DriverError>;

    fn create_event(&self, device: usize) -> Result<Event, DriverError>;
    fn destroy_event(&self, event: Event) -> Result<(), DriverError>;
    /// Mark the point in `stream` reached by all work submitted so far.
    fn record_event(&self, event: Event, stream: Stream) -> Result<(), DriverError>;
    /// Make later work on `stream` wait for the latest record of `event`.
    fn stream_wait_event(&self, stream: Stream, event: Event) -> Result<(), DriverError>;
    /// Block the host until the latest record of `event` has completed.
    fn event_synchronize(&self, event: Event) -> Result<(), DriverError>;

    /// Queue a host-to-device copy. `src` is captured at submission.
    fn memcpy_h2d_async(&self, dst: DevicePtr, src: &[u8], stream: Stream)
        -> Result<(), DriverError>;
    /// Copy device memory to the host, waiting for `stream` first.
    fn memcpy_d2h(&self, dst: &mut [u8], src: DevicePtr, stream: Stream)
        -> Result<(), DriverError>;
    /// Queue a device-to-device copy; `src` and `dst` may live on different
    /// devices (peer copy).
    fn memcpy_d2d_async(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        len: usize,
        stream: Stream,
    ) -> Result<(), DriverError>;
    /// Queue a pitched copy of `height` rows of `width` bytes.
    #[allow(clippy::too_many_arguments)]
    fn memcpy_2d_async(
        &self,
        dst: DevicePtr,
        dst_pitch: usize,
        src: DevicePtr,
        src_pitch: usize,
        width: usize,
        height: usize,
        stream: Stream,
    ) -> Result<(), DriverError>;
    fn memset_async(
        &self,
        dst: DevicePtr,
        value: u8,
        len: usize,
        stream: Stream,
    ) -> Result<(), DriverError>;

    /// Queue `kernel` on `stream`. `name` identifies it in errors and logs.
    fn launch(&self, stream: Stream, name: &'static str, kernel: Kernel)
        -> Result<(), DriverError>;
}

// ---------------------------------------------------------------------------
// DeviceHeap
// ---------------------------------------------------------------------------

/// The memory of one device as seen by running kernels.
#[derive(Debug, Default)]
pub struct DeviceHeap {
    device: usize,
    allocs: HashMap<u64, Vec<u8>>,
}

impl DeviceHeap {
    pub fn new(device: usize) -> Self {
        Self {
            device,
            allocs: HashMap::new(),
        }
    }

    pub fn device(&self) -> usize {
        self.device
    }

    pub(crate) fn insert(&mut self, alloc: u64, size: usize) {
        self.allocs.insert(alloc, vec![0u8; size]);
    }

    pub(crate) fn remove(&mut self, alloc: u64) -> Option<usize> {
        self.allocs.remove(&alloc).map(|v| v.len())
    }

    fn alloc(&self, ptr: DevicePtr) -> Result<&Vec<u8>, DriverError> {
        if ptr.device != self.device {
            return Err(DriverError::InvalidPointer(ptr.to_string()));
        }
        self.allocs
            .get(&ptr.alloc)
            .ok_or_else(|| DriverError::InvalidPointer(ptr.to_string()))
    }

    fn check(ptr: DevicePtr, len: usize, size: usize) -> Result<(), DriverError> {
        if ptr.offset.checked_add(len).map_or(true, |end| end > size) {
            return Err(DriverError::OutOfBounds {
                offset: ptr.offset,
                len,
                size,
            });
        }
        Ok(())
    }

    /// Borrow `len` bytes at `ptr`.
    pub fn bytes(&self, ptr: DevicePtr, len: usize) -> Result<&[u8], DriverError> {
        let buf = self.alloc(ptr)?;
        Self::check(ptr, len, buf.len())?;
        Ok(&buf[ptr.offset..ptr.offset + len])
    }

    /// Mutably borrow `len` bytes at `ptr`.
    pub fn bytes_mut(&mut self, ptr: DevicePtr, len: usize) -> Result<&mut [u8], DriverError> {
        if ptr.device != self.device {
            return Err(DriverError::InvalidPointer(ptr.to_string()));
        }
        let buf = self
            .allocs
            .get_mut(&ptr.alloc)
            .ok_or_else(|| DriverError::InvalidPointer(ptr.to_string()))?;
        Self::check(ptr, len, buf.len())?;
        Ok(&mut buf[ptr.offset..ptr.offset + len])
    }

    /// Copy `n` f32 values out of device memory.
    pub fn read_f32(&self, ptr: DevicePtr, n: usize) -> Result<Vec<f32>, DriverError> {
        let bytes = self.bytes(ptr, n * 4)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Write f32 values into device memory.
    pub fn write_f32(&mut self, ptr: DevicePtr, values: &[f32]) -> Result<(), DriverError> {
        let bytes = self.bytes_mut(ptr, values.len() * 4)?;
        for (chunk, v) in bytes.chunks_exact_mut(4).zip(values) {
            chunk.copy_from_slice(&v.to_le_bytes());
        }
        Ok(())
    }

    /// Copy bytes out of device memory.
    pub fn read_bytes(&self, ptr: DevicePtr, len: usize) -> Result<Vec<u8>, DriverError> {
        Ok(self.bytes(ptr, len)?.to_vec())
    }

    /// Size of the allocation behind `ptr`, ignoring its offset.
    pub fn alloc_size(&self, ptr: DevicePtr) -> Result<usize, DriverError> {
        Ok(self.alloc(ptr)?.len())
    }
}

// ---------------------------------------------------------------------------
// CompletionSignal
// ---------------------------------------------------------------------------

/// A cross-stream completion token.
///
/// `record` marks a point in a producer stream without blocking; `wait_on`
/// makes a consumer stream wait for that point without blocking the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionSignal {
    event: Event,
}

impl CompletionSignal {
    pub fn new(driver: &dyn Driver, device: usize) -> Result<Self, DriverError> {
        Ok(Self {
            event: driver.create_event(device)?,
        })
    }

    pub fn device(&self) -> usize {
        self.event.device
    }

    pub fn record(&self, driver: &dyn Driver, stream: Stream) -> Result<(), DriverError> {
        driver.record_event(self.event, stream)
    }

    pub fn wait_on(&self, driver: &dyn Driver, stream: Stream) -> Result<(), DriverError> {
        driver.stream_wait_event(stream, self.event)
    }

    /// Block the host until the last recorded point completes.
    pub fn synchronize(&self, driver: &dyn Driver) -> Result<(), DriverError> {
        driver.event_synchronize(self.event)
    }

    pub fn release(self, driver: &dyn Driver) -> Result<(), DriverError> {
        driver.destroy_event(self.event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_ptr_add_keeps_allocation() {
        let p = DevicePtr {
            device: 1,
            alloc: 7,
            offset: 16,
        };
        let q = p.add(48);
        assert_eq!(q.device, 1);
        assert_eq!(q.alloc, 7);
        assert_eq!(q.offset, 64);
    }

    #[test]
    fn test_heap_bounds_and_device_checks() {
        let mut heap = DeviceHeap::new(0);
        heap.insert(1, 16);
        let p = DevicePtr {
            device: 0,
            alloc: 1,
            offset: 0,
        };
        heap.write_f32(p.add(4), &[1.5, -2.0]).unwrap();
        assert_eq!(heap.read_f32(p.add(4), 2).unwrap(), vec![1.5, -2.0]);
        assert!(matches!(
            heap.bytes(p.add(12), 8),
            Err(DriverError::OutOfBounds { .. })
        ));
        let foreign = DevicePtr { device: 1, ..p };
        assert!(matches!(
            heap.bytes(foreign, 4),
            Err(DriverError::InvalidPointer(_))
        ));
        assert_eq!(heap.alloc_size(p.add(8)).unwrap(), 16);
        assert_eq!(heap.remove(1), Some(16));
        assert!(heap.bytes(p, 1).is_err());
    }
}
