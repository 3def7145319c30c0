//! Multi-device operator dispatch.
//!
//! A [`Runtime`] owns everything that lives for the whole process: the
//! driver, the per-device status table, the buffer pool, one stream and one
//! completion signal per device, and the scratch arena. Every operator
//! request goes through [`Runtime::try_compute`], which plans row windows,
//! stages operands into device memory, launches kernels, gathers results and
//! releases scratch buffers.
//!
//! # Threading
//!
//! A runtime is driven by a single controlling host thread. The retention
//! decision for secondary buffers reads live free memory between
//! allocations and is only meaningful under that precondition.

mod matmul;
pub mod ops;
pub mod split;
mod upload;

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::config::{MatMulStrategy, RuntimeConfig};
use crate::device::{CompletionSignal, DevicePtr, Driver, Stream};
use crate::device_check;
use crate::error::OffloadError;
use crate::kernels::elementwise::{launch_cpy, StridedRef};
use crate::pool::{DevicePool, PoolStats};
use crate::quant::GgmlType;
use crate::tensor::{contiguous_strides, Storage, Tensor};

pub use matmul::select_strategy;
pub use ops::Op;
use ops::{RowArgs, RowKernel};
pub use upload::HostBuffer;
use upload::ScratchArena;

/// Status of one device as seen at startup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub index: usize,
    pub name: String,
    pub total_memory: usize,
    pub capability: u32,
    /// Cumulative fraction of split-tensor rows held by lower devices.
    pub split_start: f32,
}

/// Pool buffers borrowed for the duration of one operator.
#[derive(Debug, Default)]
pub(crate) struct ScratchSet {
    buffers: Vec<(DevicePtr, usize)>,
}

impl ScratchSet {
    pub(crate) fn alloc(&mut self, pool: &DevicePool, device: usize, size: usize) -> DevicePtr {
        let (ptr, actual) = pool.allocate(device, size.max(1));
        self.buffers.push((ptr, actual));
        ptr
    }

    pub(crate) fn release(self, pool: &DevicePool) {
        for (ptr, size) in self.buffers {
            pool.free(ptr, size);
        }
    }
}

/// Process-wide device context.
///
/// Must be driven by one controlling thread; see the module docs.
pub struct Runtime {
    driver: Arc<dyn Driver>,
    config: RuntimeConfig,
    devices: Vec<DeviceStatus>,
    split_starts: Vec<f32>,
    pool: DevicePool,
    streams: Vec<Stream>,
    signals: Vec<CompletionSignal>,
    scratch: Option<ScratchArena>,
    last_strategies: Vec<Option<MatMulStrategy>>,
    shut_down: bool,
}

impl Runtime {
    /// Discover devices, create streams and signals, and set up the pool.
    pub fn new(driver: Arc<dyn Driver>, config: RuntimeConfig) -> Result<Self, OffloadError> {
        let count = driver.device_count();
        config.validate(count)?;

        let mut devices = Vec::with_capacity(count);
        for index in 0..count {
            let props = driver.properties(index)?;
            devices.push(DeviceStatus {
                index,
                name: props.name,
                total_memory: props.total_memory,
                capability: props.capability,
                split_start: 0.0,
            });
        }
        let totals: Vec<usize> = devices.iter().map(|d| d.total_memory).collect();
        let split_starts = split::split_starts(&config.tensor_split, &totals);
        for (status, &start) in devices.iter_mut().zip(&split_starts) {
            status.split_start = start;
            info!(
                device = status.index,
                name = %status.name,
                total_mb = status.total_memory / (1024 * 1024),
                capability = status.capability,
                split_start = start,
                "device found"
            );
        }

        let mut streams = Vec::with_capacity(count);
        let mut signals = Vec::with_capacity(count);
        for d in 0..count {
            streams.push(driver.create_stream(d)?);
            signals.push(CompletionSignal::new(driver.as_ref(), d)?);
        }
        let pool = DevicePool::new(driver.clone(), config.pool_slots, config.pool_tolerance);

        info!(devices = count, main = config.main_device, "runtime ready");
        Ok(Self {
            driver,
            devices,
            split_starts,
            pool,
            streams,
            signals,
            scratch: None,
            last_strategies: vec![None; count],
            shut_down: false,
            config,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn devices(&self) -> &[DeviceStatus] {
        &self.devices
    }

    pub fn main_device(&self) -> usize {
        self.config.main_device
    }

    pub fn split_starts(&self) -> &[f32] {
        &self.split_starts
    }

    /// The stream of `device`.
    pub fn stream(&self, device: usize) -> Stream {
        self.streams[device]
    }

    pub fn pool_stats(&self, device: usize) -> PoolStats {
        self.pool.stats(device)
    }

    /// Strategy each device used in the most recent matrix multiply.
    pub fn last_matmul_strategies(&self) -> &[Option<MatMulStrategy>] {
        &self.last_strategies
    }

    /// Release free pool buffers used fewer than `min_access_count` times on
    /// every device. Returns the number of buffers released.
    pub fn purge_pool(&self, min_access_count: u64) -> usize {
        (0..self.devices.len())
            .map(|d| self.pool.purge(min_access_count, d))
            .sum()
    }

    pub fn reset_pool_counters(&self) {
        for d in 0..self.devices.len() {
            self.pool.reset_counters(d);
        }
    }

    /// Block until every stream has finished its queued work.
    pub fn synchronize(&self) -> Result<(), OffloadError> {
        for &stream in &self.streams {
            self.driver.stream_synchronize(stream)?;
        }
        Ok(())
    }

    /// Whether a matrix multiply with host-resident operands is worth
    /// offloading.
    ///
    /// Requires F32 activations and output and a supported weight type;
    /// small products stay on the host unless the weights already live on a
    /// device.
    pub fn can_mul_mat(&self, src0: &Tensor, src1: &Tensor, dst: &Tensor) -> bool {
        let ne0 = dst.ne()[0];
        let ne1 = dst.ne()[1];
        let ne10 = src1.ne()[0];
        src1.ty() == GgmlType::F32
            && dst.ty() == GgmlType::F32
            && matmul::weight_type_supported(src0.ty())
            && (src0.is_on_device() || (ne0 >= 32 && ne1 >= 32 && ne10 >= 32))
    }

    /// Run `op` on the devices if it has a device strategy and touches
    /// device-resident data (or is a matrix multiply worth offloading).
    ///
    /// Returns false, without side effects, when the operator is left to the
    /// caller. Device failures and unsupported type combinations of a handled
    /// operator abort.
    pub fn try_compute(
        &mut self,
        op: &Op,
        src0: &Tensor,
        src1: Option<&Tensor>,
        dst: &mut Tensor,
    ) -> bool {
        let Some(strategy) = op.strategy() else {
            trace!(op = %op, "no device strategy");
            return false;
        };
        let any_on_device = src0.is_on_device()
            || src1.map_or(false, |t| t.is_on_device())
            || dst.is_on_device();
        if !any_on_device {
            let offload = match (op, src1) {
                (Op::MulMat, Some(src1)) => self.can_mul_mat(src0, src1, dst),
                _ => false,
            };
            if !offload {
                return false;
            }
        }
        assert!(!self.shut_down, "runtime used after shutdown");

        debug!(
            op = strategy.name(),
            src0 = src0.name(),
            src0_location = %src0.location(),
            dst = dst.name(),
            "compute"
        );
        strategy.compute(self, src0, src1, dst);
        true
    }

    // -----------------------------------------------------------------------
    // Staging
    // -----------------------------------------------------------------------

    /// Raw bytes of a host tensor uploaded to pool scratch on `device`.
    pub(crate) fn upload_host(&self, t: &Tensor, device: usize, scratch: &mut ScratchSet) -> DevicePtr {
        let data = match &t.storage {
            Storage::Host(v) => v,
            _ => panic!("tensor '{}' is {}, expected host data", t.name(), t.location()),
        };
        let ptr = scratch.alloc(&self.pool, device, data.len());
        device_check!(self.driver.memcpy_h2d_async(ptr, data, self.streams[device]));
        trace!(tensor = t.name(), device, bytes = data.len(), "staged host data");
        ptr
    }

    /// Contiguous copy of `t` in its own type on `device`.
    ///
    /// Resident contiguous data on the same device is referenced directly.
    /// Views are compacted on their own device first; data on another device
    /// is peer-copied. Peer copies read data produced on the owning stream,
    /// so the caller orders them with a signal wait.
    pub(crate) fn stage_contiguous(&self, t: &Tensor, device: usize, scratch: &mut ScratchSet) -> DevicePtr {
        let data = match &t.storage {
            Storage::Unassigned => panic!("tensor '{}' has no data", t.name()),
            Storage::Host(_) => return self.upload_host(t, device, scratch),
            Storage::Device(d) if d.is_split() => {
                panic!("tensor '{}' is split; only matmul weights may be split", t.name())
            }
            Storage::Device(d) => d,
        };
        let slice = data
            .devices()
            .next()
            .and_then(|i| data.slice(i))
            .unwrap_or_else(|| panic!("tensor '{}' has no device slice", t.name()));
        let home = slice.ptr.device;
        let bytes = t.byte_size();

        let compact = if t.is_contiguous() {
            slice.ptr
        } else {
            let ptr = scratch.alloc(&self.pool, home, bytes);
            launch_cpy(
                self.driver.as_ref(),
                self.streams[home],
                StridedRef {
                    ptr: slice.ptr,
                    ty: t.ty(),
                    ne: t.ne(),
                    nb: t.nb(),
                },
                StridedRef {
                    ptr,
                    ty: t.ty(),
                    ne: t.ne(),
                    nb: contiguous_strides(t.ty(), &t.ne()),
                },
            );
            ptr
        };
        if home == device {
            return compact;
        }
        let ptr = scratch.alloc(&self.pool, device, bytes);
        device_check!(self
            .driver
            .memcpy_d2d_async(ptr, compact, bytes, self.streams[device]));
        trace!(tensor = t.name(), from = home, to = device, bytes, "peer copy");
        ptr
    }

    /// Read `len` bytes at `ptr` back to the host.
    pub(crate) fn download(&self, ptr: DevicePtr, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        device_check!(self.driver.memcpy_d2h(&mut out, ptr, self.streams[ptr.device]));
        out
    }

    // -----------------------------------------------------------------------
    // Row-wise operators
    // -----------------------------------------------------------------------

    /// Run a row kernel on the main device.
    pub(crate) fn run_rowwise<K: RowKernel + ?Sized>(
        &mut self,
        kernel: &K,
        src0: &Tensor,
        src1: Option<&Tensor>,
        dst: &mut Tensor,
    ) {
        let name = kernel.name();
        let src1 = if kernel.uses_src1() {
            Some(src1.unwrap_or_else(|| panic!("{}: missing src1", name)))
        } else {
            None
        };
        let types_ok = src0.ty() == GgmlType::F32
            && dst.ty() == GgmlType::F32
            && src1.map_or(true, |t| t.ty() == GgmlType::F32);
        assert!(
            types_ok,
            "{}: unsupported type combination {} x {} -> {}",
            name,
            src0.ty(),
            src1.map_or("-".to_string(), |t| t.ty().to_string()),
            dst.ty()
        );
        assert_eq!(
            src0.n_elements(),
            dst.n_elements(),
            "{}: element count mismatch",
            name
        );
        if let Some(d) = dst.device_data() {
            assert!(!d.is_split(), "{}: split destination", name);
        }

        let main = self.config.main_device;
        let stream = self.streams[main];
        let mut scratch = ScratchSet::default();

        let x = self.stage_contiguous(src0, main, &mut scratch);
        let y = src1.map(|t| (self.stage_contiguous(t, main, &mut scratch), t.n_elements()));

        let direct = match dst.device_data() {
            Some(d) if dst.is_contiguous() => d.slice(main).map(|s| s.ptr),
            _ => None,
        };
        let out = direct.unwrap_or_else(|| scratch.alloc(&self.pool, main, dst.byte_size()));

        let ne = src0.ne();
        let ncols = ne[0];
        let driver = self.driver.as_ref();
        if kernel.flatten_rows() {
            let args = RowArgs {
                src0: x,
                src1: y,
                dst: out,
                ncols,
                nrows: src0.nrows(),
                i02: 0,
                rows_per_channel: ne[1],
            };
            kernel.launch(driver, stream, &args);
        } else {
            let channel = ne[0] * ne[1] * 4;
            for i3 in 0..ne[3] {
                for i2 in 0..ne[2] {
                    let off = (i3 * ne[2] + i2) * channel;
                    let args = RowArgs {
                        src0: x.add(off),
                        src1: y,
                        dst: out.add(off),
                        ncols,
                        nrows: ne[1],
                        i02: i2,
                        rows_per_channel: ne[1],
                    };
                    kernel.launch(driver, stream, &args);
                }
            }
        }

        if direct.is_none() {
            self.write_back(out, dst);
        }
        scratch.release(&self.pool);
    }

    /// Move a contiguous F32/F16 result at `src` on the main device into
    /// `dst`: scattered into device-resident strides, or downloaded into host
    /// storage.
    fn write_back(&self, src: DevicePtr, dst: &mut Tensor) {
        let main = self.config.main_device;
        let target = dst
            .device_data()
            .and_then(|d| d.slice(main))
            .map(|s| s.ptr);
        match target {
            Some(ptr) => launch_cpy(
                self.driver.as_ref(),
                self.streams[main],
                StridedRef {
                    ptr: src,
                    ty: dst.ty(),
                    ne: dst.ne(),
                    nb: contiguous_strides(dst.ty(), &dst.ne()),
                },
                StridedRef {
                    ptr,
                    ty: dst.ty(),
                    ne: dst.ne(),
                    nb: dst.nb(),
                },
            ),
            None => {
                if dst.is_on_device() {
                    panic!("tensor '{}' has no slice on the main device", dst.name());
                }
                let bytes = self.download(src, dst.byte_size());
                dst.storage = Storage::Host(bytes);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Copy
    // -----------------------------------------------------------------------

    /// Copy `src` into `dst` element by element in logical order, converting
    /// between F32 and F16.
    pub(crate) fn run_copy(&mut self, src: &Tensor, dst: &mut Tensor) {
        let float = |t: GgmlType| matches!(t, GgmlType::F32 | GgmlType::F16);
        assert!(
            float(src.ty()) && float(dst.ty()),
            "cpy: unsupported type combination {} -> {}",
            src.ty(),
            dst.ty()
        );
        assert_eq!(src.n_elements(), dst.n_elements(), "cpy: element count mismatch");

        let main = self.config.main_device;
        let mut scratch = ScratchSet::default();

        let source = match src.device_data() {
            Some(d) => {
                assert!(!d.is_split(), "cpy: split source '{}'", src.name());
                let slice = d
                    .slice(main)
                    .unwrap_or_else(|| panic!("cpy: '{}' has no slice on the main device", src.name()));
                StridedRef {
                    ptr: slice.ptr,
                    ty: src.ty(),
                    ne: src.ne(),
                    nb: src.nb(),
                }
            }
            None => StridedRef {
                ptr: self.upload_host(src, main, &mut scratch),
                ty: src.ty(),
                ne: src.ne(),
                nb: contiguous_strides(src.ty(), &src.ne()),
            },
        };

        match dst.device_data() {
            Some(d) => {
                assert!(!d.is_split(), "cpy: split destination '{}'", dst.name());
                let slice = d
                    .slice(main)
                    .unwrap_or_else(|| panic!("cpy: '{}' has no slice on the main device", dst.name()));
                let target = StridedRef {
                    ptr: slice.ptr,
                    ty: dst.ty(),
                    ne: dst.ne(),
                    nb: dst.nb(),
                };
                launch_cpy(self.driver.as_ref(), self.streams[main], source, target);
            }
            None => {
                let out = scratch.alloc(&self.pool, main, dst.byte_size());
                let target = StridedRef {
                    ptr: out,
                    ty: dst.ty(),
                    ne: dst.ne(),
                    nb: contiguous_strides(dst.ty(), &dst.ne()),
                };
                launch_cpy(self.driver.as_ref(), self.streams[main], source, target);
                let bytes = self.download(out, dst.byte_size());
                dst.storage = Storage::Host(bytes);
            }
        }
        scratch.release(&self.pool);
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Wait for outstanding work and release every device resource the
    /// runtime owns. Idempotent; also run on drop.
    ///
    /// Device data of tensors is owned by the tensors and must be released
    /// with [`free_data`](Self::free_data) beforehand.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        let driver = self.driver.clone();
        for &stream in &self.streams {
            if let Err(e) = driver.stream_synchronize(stream) {
                warn!(error = %e, device = stream.device, "stream failed during shutdown");
            }
        }
        if let Some(arena) = self.scratch.take() {
            if let Err(e) = driver.free(arena.ptr) {
                warn!(error = %e, "failed to free scratch arena");
            }
        }
        self.pool.release_all();
        for signal in self.signals.drain(..) {
            if let Err(e) = signal.release(driver.as_ref()) {
                warn!(error = %e, "failed to release completion signal");
            }
        }
        for stream in self.streams.drain(..) {
            if let Err(e) = driver.destroy_stream(stream) {
                warn!(error = %e, device = stream.device, "failed to destroy stream");
            }
        }
        info!("runtime shut down");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device::SimDriver;
    use crate::kernels::elementwise;
    use crate::kernels::testing::{max_abs_diff, random_values};
    use crate::tensor::Location;

    pub(crate) fn runtime(devices: usize, capability: u32, config: RuntimeConfig) -> (Arc<SimDriver>, Runtime) {
        let sim = Arc::new(SimDriver::uniform(devices, 256 << 20, capability));
        let rt = Runtime::new(sim.clone(), config).unwrap();
        (sim, rt)
    }

    fn on_device(rt: &mut Runtime, t: Tensor) -> Tensor {
        let mut t = t;
        rt.transform_tensor(&mut t, Location::Device).unwrap();
        t
    }

    #[test]
    fn test_no_strategy_host_tensors_untouched() {
        let (sim, mut rt) = runtime(1, 860, RuntimeConfig::default());
        let a = Tensor::from_f32("a", GgmlType::F32, &[4], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let mut dst = Tensor::zeros("dst", &[4]).unwrap();
        let before = sim.stats(0);
        assert!(!rt.try_compute(&Op::Sqr, &a, None, &mut dst));
        assert!(!rt.try_compute(&Op::GetRows, &a, None, &mut dst));
        assert_eq!(sim.stats(0), before);
        assert_eq!(dst.host_data().unwrap(), &[0u8; 16][..]);
        assert_eq!(rt.pool_stats(0).in_use_slots + rt.pool_stats(0).free_slots, 0);
    }

    #[test]
    fn test_host_only_elementwise_is_declined() {
        let (_sim, mut rt) = runtime(1, 860, RuntimeConfig::default());
        let a = Tensor::zeros("a", &[8]).unwrap();
        let mut dst = Tensor::zeros("dst", &[8]).unwrap();
        assert!(!rt.try_compute(&Op::Gelu, &a, None, &mut dst));
    }

    #[test]
    fn test_small_host_matmul_is_declined() {
        let (_sim, mut rt) = runtime(1, 860, RuntimeConfig::default());
        let w = Tensor::zeros("w", &[32, 4]).unwrap();
        let x = Tensor::zeros("x", &[32, 1]).unwrap();
        let mut dst = Tensor::zeros("dst", &[4, 1]).unwrap();
        assert!(!rt.can_mul_mat(&w, &x, &dst));
        assert!(!rt.try_compute(&Op::MulMat, &w, Some(&x), &mut dst));
    }

    #[test]
    fn test_device_init_reports_devices() {
        let sim = Arc::new(SimDriver::new(vec![
            crate::device::SimDeviceSpec::new("big", 3 << 30, 860),
            crate::device::SimDeviceSpec::new("small", 1 << 30, 610),
        ]));
        let rt = Runtime::new(sim, RuntimeConfig::default()).unwrap();
        let devs = rt.devices();
        assert_eq!(devs.len(), 2);
        assert_eq!(devs[1].name, "small");
        assert_eq!(devs[1].capability, 610);
        assert!((devs[1].split_start - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_main_device_is_rejected() {
        let sim = Arc::new(SimDriver::uniform(1, 1 << 20, 860));
        let config = RuntimeConfig {
            main_device: 2,
            ..Default::default()
        };
        assert!(matches!(
            Runtime::new(sim, config),
            Err(OffloadError::Config(_))
        ));
    }

    #[test]
    fn test_rowwise_ops_match_host() {
        let (_sim, mut rt) = runtime(1, 860, RuntimeConfig::default());
        let (ncols, nrows) = (64, 3);
        let values = random_values(ncols * nrows, 21, 2.0);
        let bias = random_values(ncols, 22, 1.0);
        let mut x = on_device(&mut rt, Tensor::from_f32("x", GgmlType::F32, &[ncols, nrows], &values).unwrap());
        let b = Tensor::from_f32("b", GgmlType::F32, &[ncols], &bias).unwrap();

        let mut expected = vec![0.0f32; values.len()];
        let mut dst = Tensor::zeros("dst", &[ncols, nrows]).unwrap();

        assert!(rt.try_compute(&Op::Add, &x, Some(&b), &mut dst));
        elementwise::add(&values, &bias, &mut expected);
        assert!(max_abs_diff(&dst.to_f32().unwrap(), &expected) < 1e-6);

        assert!(rt.try_compute(&Op::RmsNorm { eps: 1e-6 }, &x, None, &mut dst));
        elementwise::rms_norm(&values, ncols, 1e-6, &mut expected);
        assert!(max_abs_diff(&dst.to_f32().unwrap(), &expected) < 1e-5);

        assert!(rt.try_compute(&Op::SoftMax, &x, None, &mut dst));
        elementwise::soft_max(&values, ncols, &mut expected);
        assert!(max_abs_diff(&dst.to_f32().unwrap(), &expected) < 1e-6);

        assert!(rt.try_compute(&Op::Scale { factor: 0.5 }, &x, None, &mut dst));
        elementwise::scale(&values, 0.5, &mut expected);
        assert!(max_abs_diff(&dst.to_f32().unwrap(), &expected) < 1e-6);

        rt.free_data(&mut x);
        assert_eq!(x.location(), Location::Unassigned);
    }

    #[test]
    fn test_rope_positions_follow_outer_index() {
        let (_sim, mut rt) = runtime(1, 860, RuntimeConfig::default());
        let (ncols, nrows, nch) = (8, 2, 3);
        let values = random_values(ncols * nrows * nch, 5, 1.0);
        let x = on_device(
            &mut rt,
            Tensor::from_f32("q", GgmlType::F32, &[ncols, nrows, nch], &values).unwrap(),
        );
        let op = Op::Rope {
            n_past: 4,
            n_dims: 8,
            mode: 0,
            freq_base: 10000.0,
            freq_scale: 1.0,
        };
        let mut dst = Tensor::zeros("out", &[ncols, nrows, nch]).unwrap();
        assert!(rt.try_compute(&op, &x, None, &mut dst));

        let params = elementwise::RopeParams {
            n_dims: 8,
            mode: 0,
            freq_base: 10000.0,
            freq_scale: 1.0,
        };
        let channel = ncols * nrows;
        let mut expected = vec![0.0f32; values.len()];
        for i2 in 0..nch {
            let r = i2 * channel..(i2 + 1) * channel;
            elementwise::rope(&values[r.clone()], ncols, 4 + i2, &params, &mut expected[r]);
        }
        assert!(max_abs_diff(&dst.to_f32().unwrap(), &expected) < 1e-6);
    }

    #[test]
    fn test_device_destination_stays_on_device() {
        let (_sim, mut rt) = runtime(1, 860, RuntimeConfig::default());
        let values = random_values(32, 9, 1.0);
        let x = on_device(&mut rt, Tensor::from_f32("x", GgmlType::F32, &[32], &values).unwrap());
        let mut y = Tensor::new("y", GgmlType::F32, &[32]).unwrap();
        rt.assign_buffers(&mut y, false).unwrap();
        assert!(rt.try_compute(&Op::Silu, &x, None, &mut y));
        assert_eq!(y.location(), Location::Device);

        let mut expected = vec![0.0f32; 32];
        elementwise::silu(&values, &mut expected);
        let got: Vec<f32> = rt
            .read_back(&y)
            .unwrap()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert!(max_abs_diff(&got, &expected) < 1e-6);
    }

    #[test]
    fn test_cpy_through_transposed_view() {
        let (_sim, mut rt) = runtime(1, 860, RuntimeConfig::default());
        let values = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let x = on_device(&mut rt, Tensor::from_f32("x", GgmlType::F32, &[3, 2], &values).unwrap());
        let mut xt = x.permuted("xt", [1, 0, 2, 3]).unwrap();
        assert!(!xt.is_contiguous());
        assert!(rt.try_compute(&Op::Transpose, &x, None, &mut xt));

        let mut out = Tensor::new("out", GgmlType::F16, &[2, 3]).unwrap();
        assert!(rt.try_compute(&Op::Cpy, &xt, None, &mut out));
        assert_eq!(out.location(), Location::Host);
        assert_eq!(out.to_f32().unwrap(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    #[should_panic(expected = "unsupported type combination")]
    fn test_rowwise_rejects_quantized_input() {
        let (_sim, mut rt) = runtime(1, 860, RuntimeConfig::default());
        let x = on_device(
            &mut rt,
            Tensor::from_f32("x", GgmlType::Q8_0, &[32], &random_values(32, 1, 1.0)).unwrap(),
        );
        let mut dst = Tensor::zeros("dst", &[32]).unwrap();
        rt.try_compute(&Op::Gelu, &x, None, &mut dst);
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let (sim, mut rt) = runtime(2, 860, RuntimeConfig::default());
        let mut t = Tensor::zeros("t", &[64]).unwrap();
        rt.transform_tensor(&mut t, Location::Device).unwrap();
        let mut s = Tensor::new("s", GgmlType::F32, &[16]).unwrap();
        rt.assign_buffers(&mut s, true).unwrap();
        let mut dst = Tensor::zeros("dst", &[64]).unwrap();
        assert!(rt.try_compute(&Op::Gelu, &t, None, &mut dst));
        rt.free_data(&mut t);
        rt.free_data(&mut s);
        rt.shutdown();
        rt.shutdown();
        assert_eq!(sim.stats(0).bytes_in_use, 0);
        assert_eq!(sim.stats(1).bytes_in_use, 0);
    }
}
