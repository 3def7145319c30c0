//! Matrix multiply across devices.
//!
//! `dst = src0 x src1` with `src0` the weights (`ne01` rows of `ne00`),
//! `src1` the f32 activations (`ne11` columns of `ne10 == ne00`) and `dst`
//! f32 with `dst[c * ne0 + r]`. Outer dimensions of `src1` broadcast over
//! those of `src0`. Split weights are processed by every device holding rows;
//! each device computes its row window and the results are scattered into
//! their absolute row positions.

use tracing::{debug, trace, warn};

use super::{Runtime, ScratchSet};
use crate::config::{MatMulStrategy, Precision, RuntimeConfig, MIN_CC_DP4A};
use crate::device::{CompletionSignal, DevicePtr, Stream};
use crate::device_check;
use crate::kernels::convert::{launch_convert, launch_quantize_q8_1, q8_1_row_bytes};
use crate::kernels::dense::launch_gemm;
use crate::kernels::dmmv::launch_dequantize_mul_mat_vec;
use crate::kernels::mmq::launch_mul_mat_q;
use crate::kernels::mmvq::launch_mul_mat_vec_q;
use crate::quant::{BlockQ8_1, GgmlType};
use crate::tensor::{SecondaryBuffer, Storage, Tensor};

/// Weight types with a device matmul path.
pub(crate) fn weight_type_supported(ty: GgmlType) -> bool {
    matches!(ty, GgmlType::F32 | GgmlType::F16 | GgmlType::BF16) || ty.has_vec_dot_q8_1()
}

fn native_precision(ty: GgmlType) -> Option<Precision> {
    match ty {
        GgmlType::F32 => Some(Precision::F32),
        GgmlType::F16 => Some(Precision::F16),
        GgmlType::BF16 => Some(Precision::BF16),
        _ => None,
    }
}

fn default_strategy(config: &RuntimeConfig, ty: GgmlType, ne11: usize) -> MatMulStrategy {
    match ty {
        GgmlType::F32 => MatMulStrategy::Dense(Precision::F32),
        GgmlType::F16 | GgmlType::BF16 if ne11 == 1 => MatMulStrategy::Dmmv,
        GgmlType::F16 | GgmlType::BF16 => MatMulStrategy::Dense(config.dense_precision),
        _ if ne11 == 1 => MatMulStrategy::VecQ,
        _ if ne11 <= config.mmq_max_batch => MatMulStrategy::TiledQ,
        _ => MatMulStrategy::Dense(config.dense_precision),
    }
}

/// Strategy for `ty` weights times `ne11` activation columns on a device of
/// capability tier `capability`.
///
/// `force_strategy` replaces the default choice. Either way, a strategy the
/// device cannot run falls back to one it can: the vector kernel to DMMV,
/// the tiled kernel to the dense path, and dense precisions BF16 → F16 → F32.
pub fn select_strategy(
    config: &RuntimeConfig,
    ty: GgmlType,
    ne11: usize,
    capability: u32,
) -> MatMulStrategy {
    let preferred = match config
        .force_strategy
        .unwrap_or_else(|| default_strategy(config, ty, ne11))
    {
        MatMulStrategy::VecQ | MatMulStrategy::TiledQ if !ty.has_vec_dot_q8_1() => {
            MatMulStrategy::Dense(config.dense_precision)
        }
        s => s,
    };
    let chosen = match preferred {
        MatMulStrategy::VecQ if capability < MIN_CC_DP4A => MatMulStrategy::Dmmv,
        MatMulStrategy::TiledQ if capability < MIN_CC_DP4A => {
            MatMulStrategy::Dense(config.dense_precision.degrade_for(capability))
        }
        MatMulStrategy::Dense(p) => MatMulStrategy::Dense(p.degrade_for(capability)),
        s => s,
    };
    if chosen != preferred {
        warn!(
            preferred = %preferred,
            chosen = %chosen,
            capability,
            "device lacks capability for matmul strategy, falling back"
        );
    }
    chosen
}

/// Operands of one product on one device.
#[derive(Debug, Clone, Copy)]
struct Product {
    /// Weights in their stored type.
    x: DevicePtr,
    /// Weights converted for the dense path.
    dense_x: Option<DevicePtr>,
    /// Contiguous f32 activations.
    y: DevicePtr,
    out: DevicePtr,
    ncols_x: usize,
    nrows: usize,
    ncols_y: usize,
}

impl Runtime {
    pub(crate) fn mul_mat(&mut self, src0: &Tensor, src1: &Tensor, dst: &mut Tensor) {
        let ty = src0.ty();
        assert!(
            src1.ty() == GgmlType::F32 && dst.ty() == GgmlType::F32 && weight_type_supported(ty),
            "mul_mat: unsupported type combination {} x {} -> {}",
            ty,
            src1.ty(),
            dst.ty()
        );
        let [ne00, ne01, ne02, ne03] = src0.ne();
        let [ne10, ne11, ne12, ne13] = src1.ne();
        let [ne0, ne1, ne2, ne3] = dst.ne();
        assert!(
            ne00 == ne10 && ne01 == ne0 && ne11 == ne1 && ne12 == ne2 && ne13 == ne3,
            "mul_mat: shape mismatch {:?} x {:?} -> {:?}",
            src0.ne(),
            src1.ne(),
            dst.ne()
        );
        assert!(
            ne12 % ne02 == 0 && ne13 % ne03 == 0,
            "mul_mat: cannot broadcast {:?} over {:?}",
            src0.ne(),
            src1.ne()
        );
        assert!(src0.is_contiguous(), "mul_mat: non-contiguous weights '{}'", src0.name());
        assert!(dst.is_contiguous(), "mul_mat: non-contiguous destination '{}'", dst.name());

        if dst.n_elements() == 0 {
            trace!(dst = dst.name(), "mul_mat: empty product");
            if !dst.is_on_device() {
                dst.storage = Storage::Host(Vec::new());
            }
            return;
        }

        let main = self.config.main_device;
        let n_dev = self.devices.len();
        let split = src0.device_data().map_or(false, |d| d.is_split());

        // Plan: row window per device.
        let windows: Vec<(usize, usize)> = (0..n_dev)
            .map(|d| match src0.device_data() {
                Some(dd) if split => dd.slice(d).map_or((0, 0), |s| (s.row_low, s.row_high)),
                _ if d == main => (0, ne01),
                _ => (0, 0),
            })
            .collect();
        let active: Vec<usize> = (0..n_dev).filter(|&d| windows[d].1 > windows[d].0).collect();
        for s in self.last_strategies.iter_mut() {
            *s = None;
        }

        let dst_main = match dst.device_data() {
            Some(dd) => {
                assert!(!dd.is_split(), "mul_mat: split destination '{}'", dst.name());
                Some(
                    dd.slice(main)
                        .map(|s| s.ptr)
                        .unwrap_or_else(|| panic!("mul_mat: '{}' has no slice on the main device", dst.name())),
                )
            }
            None => None,
        };
        let mut host_out = match dst_main {
            Some(_) => None,
            None => Some(match std::mem::take(&mut dst.storage) {
                Storage::Host(v) if v.len() == dst.byte_size() => v,
                _ => vec![0u8; dst.byte_size()],
            }),
        };

        let driver = self.driver.clone();
        let main_stream = self.streams[main];
        let mut scratch = ScratchSet::default();

        // Stage activations: device-resident activations are made contiguous
        // on the main device and published to the other devices.
        let src1_bytes = src1.n_elements() * 4;
        let src1_main = if src1.is_on_device() {
            Some(self.stage_contiguous(src1, main, &mut scratch))
        } else {
            None
        };
        device_check!(self.signals[main].record(driver.as_ref(), main_stream));

        let r2 = ne12 / ne02;
        let r3 = ne13 / ne03;
        let row_size = src0.row_size();
        let mut contributors: Vec<CompletionSignal> = Vec::new();
        // Host-bound results, collected only after every device has its work
        // queued: (buffer, row_low, rows, slab).
        let mut gathers: Vec<(DevicePtr, usize, usize, usize)> = Vec::new();

        for &d in &active {
            let (lo, hi) = windows[d];
            let nr = hi - lo;
            let stream = self.streams[d];
            let strategy = select_strategy(&self.config, ty, ne11, self.devices[d].capability);
            self.last_strategies[d] = Some(strategy);
            debug!(device = d, row_low = lo, row_high = hi, strategy = %strategy, "mul_mat plan");

            if d != main {
                device_check!(self.signals[main].wait_on(driver.as_ref(), stream));
            }
            let y_base = match src1_main {
                Some(p) if d == main => p,
                Some(p) => {
                    let q = scratch.alloc(&self.pool, d, src1_bytes);
                    device_check!(driver.memcpy_d2d_async(q, p, src1_bytes, stream));
                    q
                }
                None => self.upload_host(src1, d, &mut scratch),
            };

            let x_base = match src0.device_data() {
                Some(dd) => dd
                    .slice(d)
                    .map(|s| s.ptr)
                    .unwrap_or_else(|| panic!("mul_mat: '{}' has no slice on device {}", src0.name(), d)),
                None => self.upload_host(src0, d, &mut scratch),
            };
            let dense_base = match strategy {
                MatMulStrategy::Dense(p) => {
                    let n = if split { nr * ne00 } else { src0.n_elements() };
                    Some((self.dense_weights(src0, d, x_base, n, p, &mut scratch), p))
                }
                _ => None,
            };

            let direct = dst_main.filter(|_| d == main && lo == 0 && hi == ne01);
            for i13 in 0..ne13 {
                for i12 in 0..ne12 {
                    let slab0 = if split { 0 } else { (i13 / r3) * ne02 + i12 / r2 };
                    let slab1 = i13 * ne12 + i12;
                    let out = match direct {
                        Some(base) => base.add(slab1 * ne1 * ne0 * 4),
                        None => scratch.alloc(&self.pool, d, nr * ne11 * 4),
                    };
                    let product = Product {
                        x: x_base.add(slab0 * ne01 * row_size),
                        dense_x: dense_base.map(|(w, p)| w.add(slab0 * ne01 * ne00 * p.size())),
                        y: y_base.add(slab1 * ne11 * ne10 * 4),
                        out,
                        ncols_x: ne00,
                        nrows: nr,
                        ncols_y: ne11,
                    };
                    self.launch_product(strategy, ty, stream, &product, &mut scratch);

                    if direct.is_some() {
                        continue;
                    }
                    match dst_main {
                        Some(base) => {
                            let slab = base.add(slab1 * ne1 * ne0 * 4);
                            device_check!(driver.memcpy_2d_async(
                                slab.add(lo * 4),
                                ne0 * 4,
                                out,
                                nr * 4,
                                nr * 4,
                                ne11,
                                stream
                            ));
                        }
                        None => gathers.push((out, lo, nr, slab1)),
                    }
                }
            }

            if d != main {
                let signal = src0
                    .device_data()
                    .and_then(|dd| dd.slice(d))
                    .and_then(|s| s.signal)
                    .unwrap_or(self.signals[d]);
                device_check!(signal.record(driver.as_ref(), stream));
                contributors.push(signal);
            }
        }

        for signal in &contributors {
            device_check!(signal.wait_on(driver.as_ref(), main_stream));
        }
        if let Some(host) = host_out.as_mut() {
            for &(out, lo, nr, slab1) in &gathers {
                let bytes = self.download(out, nr * ne11 * 4);
                for c in 0..ne11 {
                    let at = ((slab1 * ne1 + c) * ne0 + lo) * 4;
                    host[at..at + nr * 4].copy_from_slice(&bytes[c * nr * 4..(c + 1) * nr * 4]);
                }
            }
        }
        for &d in &active {
            self.settle_secondary(src0, d);
        }
        scratch.release(&self.pool);
        if let Some(host) = host_out {
            dst.storage = Storage::Host(host);
        }
    }

    /// Weights of `src0` on `device` in dense precision `p`.
    ///
    /// Device-resident weights are converted once into a secondary buffer
    /// tagged with the tensor; a cached copy in another precision is evicted.
    fn dense_weights(
        &self,
        src0: &Tensor,
        device: usize,
        x: DevicePtr,
        n_elements: usize,
        p: Precision,
        scratch: &mut ScratchSet,
    ) -> DevicePtr {
        if native_precision(src0.ty()) == Some(p) {
            return x;
        }
        let stream = self.streams[device];
        let Some(dd) = src0.device_data() else {
            let buf = scratch.alloc(&self.pool, device, n_elements * p.size());
            launch_convert(self.driver.as_ref(), stream, src0.ty(), x, buf, n_elements, p);
            return buf;
        };
        if let Some(cached) = dd.secondary(device) {
            if cached.precision == p {
                trace!(tensor = src0.name(), device, precision = %p, "secondary buffer hit");
                return cached.ptr;
            }
            dd.take_secondary(device);
            self.pool.unallocate(cached.ptr);
            debug!(
                tensor = src0.name(),
                device,
                cached = %cached.precision,
                wanted = %p,
                "evicted secondary buffer in wrong precision"
            );
        }
        let (ptr, size) = self.pool.allocate(device, n_elements * p.size());
        self.pool.tag(ptr, src0.id());
        launch_convert(self.driver.as_ref(), stream, src0.ty(), x, ptr, n_elements, p);
        dd.set_secondary(
            device,
            SecondaryBuffer {
                ptr,
                size,
                precision: p,
            },
        );
        ptr
    }

    /// Keep the secondary buffer of `src0` on `device` only while the device
    /// has more than `reserved_vram` free and retention is enabled.
    fn settle_secondary(&self, src0: &Tensor, device: usize) {
        let Some(dd) = src0.device_data() else {
            return;
        };
        let Some(buf) = dd.secondary(device) else {
            return;
        };
        let free = device_check!(self.driver.mem_info(device)).free;
        if self.config.no_secondary_offload || free <= self.config.reserved_vram {
            dd.take_secondary(device);
            self.pool.free(buf.ptr, buf.size);
            debug!(tensor = src0.name(), device, free, "released secondary buffer");
        }
    }

    fn launch_product(
        &self,
        strategy: MatMulStrategy,
        ty: GgmlType,
        stream: Stream,
        a: &Product,
        scratch: &mut ScratchSet,
    ) {
        let driver = self.driver.as_ref();
        let device = stream.device;
        match strategy {
            MatMulStrategy::VecQ | MatMulStrategy::TiledQ => {
                let row_bytes = q8_1_row_bytes(a.ncols_x);
                let q8 = scratch.alloc(&self.pool, device, row_bytes * a.ncols_y);
                launch_quantize_q8_1(driver, stream, a.y, q8, a.ncols_x, a.ncols_y);
                let y_stride = row_bytes / std::mem::size_of::<BlockQ8_1>();
                if strategy == MatMulStrategy::VecQ {
                    launch_mul_mat_vec_q(
                        driver, stream, ty, a.x, q8, a.out, a.ncols_x, a.nrows, a.ncols_y, y_stride,
                    );
                } else {
                    launch_mul_mat_q(
                        driver, stream, ty, a.x, q8, a.out, a.ncols_x, a.nrows, a.ncols_y, y_stride,
                    );
                }
            }
            MatMulStrategy::Dmmv => launch_dequantize_mul_mat_vec(
                driver, stream, ty, a.x, a.y, a.out, a.ncols_x, a.nrows, a.ncols_y,
            ),
            MatMulStrategy::Dense(p) => {
                let w = a.dense_x.unwrap_or(a.x);
                let y = if p == Precision::F32 {
                    a.y
                } else {
                    let n = a.ncols_x * a.ncols_y;
                    let buf = scratch.alloc(&self.pool, device, n * p.size());
                    launch_convert(driver, stream, GgmlType::F32, a.y, buf, n, p);
                    buf
                };
                launch_gemm(driver, stream, p, w, y, a.out, a.nrows, a.ncols_x, a.ncols_y);
            }
        }
    }
}
