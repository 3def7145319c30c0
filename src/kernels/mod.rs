//! Device kernels.
//!
//! Every kernel is a plain function over slices plus a launcher that queues
//! it on a stream. Launchers capture device pointers and dimensions only;
//! the data is read from and written back to device memory when the stream
//! reaches the kernel. Launch failures are fatal.
//!
//! Kernels that model a lane group (`mmvq`, `mmq`, `dmmv`) keep per-lane
//! partial sums and combine them with [`warp_reduce_sum`], so results are
//! reduced in the same order a 32-lane device group would produce.

pub mod convert;
pub mod dense;
pub mod dmmv;
pub mod elementwise;
pub mod mmq;
pub mod mmvq;

use crate::device::{DeviceHeap, DevicePtr, Driver, Stream};
use crate::device_check;
use crate::error::{DriverError, OffloadError};

/// Lanes per cooperating group.
pub const WARP_SIZE: usize = 32;

/// Xor-butterfly reduction: after five exchange rounds every lane holds the
/// sum of all lanes.
#[inline]
pub fn warp_reduce_sum(lanes: &mut [f32; WARP_SIZE]) {
    let mut mask = WARP_SIZE / 2;
    while mask > 0 {
        let prev = *lanes;
        for (lane, v) in lanes.iter_mut().enumerate() {
            *v = prev[lane] + prev[lane ^ mask];
        }
        mask /= 2;
    }
}

/// Xor-butterfly max reduction.
#[inline]
pub fn warp_reduce_max(lanes: &mut [f32; WARP_SIZE]) {
    let mut mask = WARP_SIZE / 2;
    while mask > 0 {
        let prev = *lanes;
        for (lane, v) in lanes.iter_mut().enumerate() {
            *v = prev[lane].max(prev[lane ^ mask]);
        }
        mask /= 2;
    }
}

/// Queue `kernel` on `stream`, aborting if the driver rejects it.
pub(crate) fn launch<F>(driver: &dyn Driver, stream: Stream, name: &'static str, kernel: F)
where
    F: FnOnce(&mut DeviceHeap) -> Result<(), DriverError> + Send + 'static,
{
    tracing::trace!(device = stream.device, kernel = name, "launch");
    device_check!(driver.launch(stream, name, Box::new(kernel)));
}

/// Convert a codec error raised inside a kernel into a launch failure.
pub(crate) fn kernel_error(name: &'static str) -> impl Fn(OffloadError) -> DriverError {
    move |e| DriverError::LaunchFailed {
        name,
        reason: e.to_string(),
    }
}

/// Queue an f32 map kernel: reads `n` values at `src` and, when given,
/// `m` values at `src1`, writes `n` values to `dst`.
pub(crate) fn launch_map<F>(
    driver: &dyn Driver,
    stream: Stream,
    name: &'static str,
    src: DevicePtr,
    src1: Option<(DevicePtr, usize)>,
    dst: DevicePtr,
    n: usize,
    f: F,
) where
    F: FnOnce(&[f32], Option<&[f32]>, &mut [f32]) + Send + 'static,
{
    launch(driver, stream, name, move |heap| {
        let x = heap.read_f32(src, n)?;
        let y = match src1 {
            Some((p, m)) => Some(heap.read_f32(p, m)?),
            None => None,
        };
        let mut out = vec![0.0f32; n];
        f(&x, y.as_deref(), &mut out);
        heap.write_f32(dst, &out)
    });
}
