//! Moving tensor data onto and off the devices.

use tracing::{debug, warn};

use super::split::{row_alignment, row_padding_bytes, row_windows};
use super::Runtime;
use crate::device::{CompletionSignal, DevicePtr};
use crate::device_check;
use crate::error::OffloadError;
use crate::tensor::{DeviceData, DeviceSlice, Location, Storage, Tensor};

/// Wrap-around arena for intermediate tensors on the main device.
#[derive(Debug)]
pub(crate) struct ScratchArena {
    pub(crate) ptr: DevicePtr,
    size: usize,
    offset: usize,
}

/// Host memory for staging transfers, page-locked when possible.
#[derive(Debug)]
pub struct HostBuffer {
    data: Vec<u8>,
    pinned: bool,
}

impl HostBuffer {
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Runtime {
    /// Upload a host tensor's data to `location`.
    ///
    /// [`Location::Device`] places the whole tensor on the main device.
    /// [`Location::Split`] partitions the rows of a 2-D tensor across devices
    /// by the configured split; the last device holding rows gets zeroed
    /// padding so that padded activation rows can be read against it. The
    /// host copy is dropped.
    pub fn transform_tensor(&mut self, tensor: &mut Tensor, location: Location) -> Result<(), OffloadError> {
        let data = match &tensor.storage {
            Storage::Host(v) => v,
            _ => {
                return Err(OffloadError::Config(format!(
                    "tensor '{}' is {}, expected host data",
                    tensor.name(),
                    tensor.location()
                )))
            }
        };
        let n_dev = self.devices.len();
        let main = self.config.main_device;
        let nrows = tensor.nrows();
        let row_size = tensor.row_size();
        let mut slices: Vec<Option<DeviceSlice>> = (0..n_dev).map(|_| None).collect();

        let split = match location {
            Location::Device => {
                let size = data.len();
                let ptr = device_check!(self.driver.malloc(main, size.max(1)));
                device_check!(self.driver.memcpy_h2d_async(ptr, data, self.streams[main]));
                slices[main] = Some(DeviceSlice {
                    ptr,
                    size,
                    row_low: 0,
                    row_high: nrows,
                    owned: true,
                    signal: None,
                });
                false
            }
            Location::Split => {
                let ne = tensor.ne();
                if ne[2] != 1 || ne[3] != 1 {
                    return Err(OffloadError::Config(format!(
                        "tensor '{}' with shape {:?} cannot be split; only 2-D tensors can",
                        tensor.name(),
                        ne
                    )));
                }
                let windows = row_windows(&self.split_starts, nrows, row_alignment(tensor.ty()));
                let last = windows.iter().rposition(|&(lo, hi)| hi > lo);
                for (d, &(lo, hi)) in windows.iter().enumerate() {
                    if hi <= lo {
                        continue;
                    }
                    let bytes = (hi - lo) * row_size;
                    let pad = if Some(d) == last {
                        row_padding_bytes(tensor.ty(), ne[0])
                    } else {
                        0
                    };
                    let stream = self.streams[d];
                    let ptr = device_check!(self.driver.malloc(d, bytes + pad));
                    if pad > 0 {
                        device_check!(self.driver.memset_async(ptr.add(bytes), 0, pad, stream));
                    }
                    device_check!(self.driver.memcpy_h2d_async(
                        ptr,
                        &data[lo * row_size..hi * row_size],
                        stream
                    ));
                    let signal = device_check!(CompletionSignal::new(self.driver.as_ref(), d));
                    device_check!(signal.record(self.driver.as_ref(), stream));
                    debug!(tensor = tensor.name(), device = d, row_low = lo, row_high = hi, pad, "split slice");
                    slices[d] = Some(DeviceSlice {
                        ptr,
                        size: bytes + pad,
                        row_low: lo,
                        row_high: hi,
                        owned: true,
                        signal: Some(signal),
                    });
                }
                true
            }
            other => {
                return Err(OffloadError::Config(format!(
                    "cannot move tensor '{}' to {}",
                    tensor.name(),
                    other
                )))
            }
        };

        debug!(tensor = tensor.name(), location = %location, bytes = tensor.byte_size(), "uploaded tensor");
        tensor.storage = Storage::Device(DeviceData::new(split, slices));
        Ok(())
    }

    /// Release a tensor's device data, signals and secondary buffers. The
    /// tensor is left unassigned. Host tensors are untouched.
    pub fn free_data(&mut self, tensor: &mut Tensor) {
        if !tensor.is_on_device() {
            return;
        }
        let Storage::Device(data) = std::mem::take(&mut tensor.storage) else {
            return;
        };
        for buf in data.take_all_secondaries() {
            self.pool.unallocate(buf.ptr);
        }
        for slice in data.slices.into_iter().flatten() {
            if slice.owned {
                device_check!(self.driver.free(slice.ptr));
            }
            if let Some(signal) = slice.signal {
                device_check!(signal.release(self.driver.as_ref()));
            }
        }
        debug!(tensor = tensor.name(), "freed device data");
    }

    /// Give an intermediate tensor storage on the main device.
    ///
    /// With `scratch` the tensor is placed in the wrap-around scratch arena
    /// and does not own its memory; later placements may overwrite it once
    /// the arena wraps. Otherwise it gets a dedicated allocation. Host data
    /// present on the tensor is uploaded.
    pub fn assign_buffers(&mut self, tensor: &mut Tensor, scratch: bool) -> Result<(), OffloadError> {
        if tensor.is_on_device() {
            return Err(OffloadError::Config(format!(
                "tensor '{}' already has device data",
                tensor.name()
            )));
        }
        let main = self.config.main_device;
        let size = tensor.byte_size();

        let (ptr, owned) = if scratch {
            if size > self.config.scratch_size {
                return Err(OffloadError::Config(format!(
                    "tensor '{}' needs {} bytes, scratch arena holds {}",
                    tensor.name(),
                    size,
                    self.config.scratch_size
                )));
            }
            if self.scratch.is_none() {
                let ptr = device_check!(self.driver.malloc(main, self.config.scratch_size));
                debug!(device = main, size = self.config.scratch_size, "allocated scratch arena");
                self.scratch = Some(ScratchArena {
                    ptr,
                    size: self.config.scratch_size,
                    offset: 0,
                });
            }
            let Some(arena) = self.scratch.as_mut() else {
                unreachable!("scratch arena allocated above");
            };
            if arena.offset + size > arena.size {
                arena.offset = 0;
            }
            let ptr = arena.ptr.add(arena.offset);
            arena.offset += size;
            (ptr, false)
        } else {
            (device_check!(self.driver.malloc(main, size.max(1))), true)
        };

        if let Storage::Host(data) = &tensor.storage {
            device_check!(self.driver.memcpy_h2d_async(ptr, data, self.streams[main]));
        }
        let mut slices: Vec<Option<DeviceSlice>> = (0..self.devices.len()).map(|_| None).collect();
        slices[main] = Some(DeviceSlice {
            ptr,
            size,
            row_low: 0,
            row_high: tensor.nrows(),
            owned,
            signal: None,
        });
        tensor.storage = Storage::Device(DeviceData::new(false, slices));
        Ok(())
    }

    /// Release the scratch arena. Tensors placed in it lose their memory.
    pub fn free_scratch(&mut self) {
        if let Some(arena) = self.scratch.take() {
            device_check!(self.driver.free(arena.ptr));
            debug!(size = arena.size, "freed scratch arena");
        }
    }

    /// Allocate a host buffer, pinned when enabled and available.
    ///
    /// A failed pinned allocation falls back to ordinary memory.
    pub fn host_malloc(&self, size: usize) -> HostBuffer {
        let pinned = self.config.pinned_host
            && match self.driver.host_register(size) {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, size, "failed to allocate pinned host memory, using pageable memory");
                    false
                }
            };
        HostBuffer {
            data: vec![0u8; size],
            pinned,
        }
    }

    pub fn host_free(&self, buf: HostBuffer) {
        if buf.pinned {
            if let Err(e) = self.driver.host_unregister(buf.data.len()) {
                warn!(error = %e, "failed to release pinned host memory");
            }
        }
    }

    /// Copy a tensor's contiguous data back to the host, gathering the rows
    /// of a split tensor.
    pub fn read_back(&self, tensor: &Tensor) -> Result<Vec<u8>, OffloadError> {
        match &tensor.storage {
            Storage::Host(v) => Ok(v.clone()),
            Storage::Unassigned => Err(OffloadError::Config(format!(
                "tensor '{}' has no data",
                tensor.name()
            ))),
            Storage::Device(data) => {
                if !tensor.is_contiguous() {
                    return Err(OffloadError::Config(format!(
                        "tensor '{}' is not contiguous",
                        tensor.name()
                    )));
                }
                let row_size = tensor.row_size();
                let mut out = vec![0u8; tensor.byte_size()];
                for d in data.devices() {
                    let Some(slice) = data.slice(d) else {
                        continue;
                    };
                    let (lo, hi) = if data.is_split() {
                        (slice.row_low, slice.row_high)
                    } else {
                        (0, tensor.nrows())
                    };
                    let dst = &mut out[lo * row_size..hi * row_size];
                    self.driver.memcpy_d2h(dst, slice.ptr, self.streams[d])?;
                }
                Ok(out)
            }
        }
    }
}
