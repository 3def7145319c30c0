//! Quantized matrix-vector product (MMVQ).
//!
//! One 32-lane group per output row. Lanes are assigned to slices of weight
//! blocks: with `SLICES` lanes per block, the group covers
//! `WARP_SIZE / SLICES` blocks per step and strides across the row. Each lane
//! accumulates integer dot products against the matching Q8_1 activation
//! blocks, then the group reduces with an xor butterfly.

use super::convert::q8_1_span_bytes;
use super::{kernel_error, launch, warp_reduce_sum, WARP_SIZE};
use crate::device::{DeviceHeap, DevicePtr, Driver, Stream};
use crate::error::DriverError;
use crate::quant::{as_blocks, BlockQ8_1, GgmlType, VecDotQ8_1, QK};

/// Expand `$body` once per weight type with a Q8_1 dot product.
macro_rules! with_vec_dot_block {
    ($ty:expr, $b:ident => $body:expr, other => $other:expr) => {
        match $ty {
            $crate::quant::GgmlType::Q4_0 => { type $b = $crate::quant::BlockQ4_0; $body }
            $crate::quant::GgmlType::Q4_1 => { type $b = $crate::quant::BlockQ4_1; $body }
            $crate::quant::GgmlType::Q5_0 => { type $b = $crate::quant::BlockQ5_0; $body }
            $crate::quant::GgmlType::Q5_1 => { type $b = $crate::quant::BlockQ5_1; $body }
            $crate::quant::GgmlType::Q8_0 => { type $b = $crate::quant::BlockQ8_0; $body }
            $crate::quant::GgmlType::Q2K => { type $b = $crate::quant::BlockQ2K; $body }
            $crate::quant::GgmlType::Q3K => { type $b = $crate::quant::BlockQ3K; $body }
            $crate::quant::GgmlType::Q4K => { type $b = $crate::quant::BlockQ4K; $body }
            $crate::quant::GgmlType::Q5K => { type $b = $crate::quant::BlockQ5K; $body }
            $crate::quant::GgmlType::Q6K => { type $b = $crate::quant::BlockQ6K; $body }
            _ => $other,
        }
    };
}
pub(crate) use with_vec_dot_block;

/// Row-by-vector products for `ncols_y` activation columns.
///
/// `x` holds `nrows` rows of `ncols_x / B::QK` blocks; column `c` of `y`
/// starts at block `c * y_stride`. Output is column-major:
/// `dst[c * nrows + row]`.
pub fn mul_mat_vec_q<B: VecDotQ8_1>(
    x: &[B],
    y: &[BlockQ8_1],
    dst: &mut [f32],
    ncols_x: usize,
    nrows: usize,
    ncols_y: usize,
    y_stride: usize,
) {
    let blocks_per_row = ncols_x / B::QK;
    let blocks_per_warp = WARP_SIZE / B::SLICES;
    let y_per_block = B::QK / QK;

    for col in 0..ncols_y {
        let y_col = &y[col * y_stride..];
        for row in 0..nrows {
            let x_row = &x[row * blocks_per_row..(row + 1) * blocks_per_row];
            let mut lanes = [0.0f32; WARP_SIZE];
            for (lane, acc) in lanes.iter_mut().enumerate() {
                let slice = lane % B::SLICES;
                let mut ib = lane / B::SLICES;
                while ib < blocks_per_row {
                    let iy = ib * y_per_block;
                    *acc += x_row[ib].vec_dot_q8_1(&y_col[iy..iy + y_per_block], slice);
                    ib += blocks_per_warp;
                }
            }
            warp_reduce_sum(&mut lanes);
            dst[col * nrows + row] = lanes[0];
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Args {
    x: DevicePtr,
    y: DevicePtr,
    dst: DevicePtr,
    ncols_x: usize,
    nrows: usize,
    ncols_y: usize,
    y_stride: usize,
}

fn run<B: VecDotQ8_1>(heap: &mut DeviceHeap, a: Args) -> Result<(), DriverError> {
    if a.nrows == 0 || a.ncols_y == 0 {
        return Ok(());
    }
    let err = kernel_error("mul_mat_vec_q");
    let x_bytes = heap.read_bytes(a.x, a.nrows * (a.ncols_x / B::QK) * std::mem::size_of::<B>())?;
    let y_len = q8_1_span_bytes(a.ncols_x, a.ncols_y, a.y_stride);
    let y_bytes = heap.read_bytes(a.y, y_len)?;
    let x = as_blocks::<B>(&x_bytes).map_err(&err)?;
    let y = as_blocks::<BlockQ8_1>(&y_bytes).map_err(&err)?;
    let mut out = vec![0.0f32; a.nrows * a.ncols_y];
    mul_mat_vec_q(x, y, &mut out, a.ncols_x, a.nrows, a.ncols_y, a.y_stride);
    heap.write_f32(a.dst, &out)
}

/// Queue MMVQ for weight type `ty`.
///
/// # Panics
/// Panics if `ty` has no Q8_1 dot product.
#[allow(clippy::too_many_arguments)]
pub fn launch_mul_mat_vec_q(
    driver: &dyn Driver,
    stream: Stream,
    ty: GgmlType,
    x: DevicePtr,
    y: DevicePtr,
    dst: DevicePtr,
    ncols_x: usize,
    nrows: usize,
    ncols_y: usize,
    y_stride: usize,
) {
    let args = Args {
        x,
        y,
        dst,
        ncols_x,
        nrows,
        ncols_y,
        y_stride,
    };
    with_vec_dot_block!(ty, B => launch(driver, stream, "mul_mat_vec_q", move |heap| run::<B>(heap, args)),
        other => panic!("mul_mat_vec_q: unsupported weight type {}", ty));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimDriver;
    use crate::kernels::convert::{launch_quantize_q8_1, q8_1_row_bytes};
    use crate::kernels::testing::{matmul_reference, random_values};
    use crate::quant::{dequantize, quantize, quantize_row_q8_1_padded};

    fn check(ty: GgmlType, ncols_x: usize, nrows: usize) {
        let w = random_values(nrows * ncols_x, 7, 1.0);
        let a = random_values(ncols_x, 8, 1.0);
        let packed = quantize(ty, &w).unwrap();
        let wd = dequantize(ty, &packed).unwrap();
        let reference = matmul_reference(&wd, &a, nrows, ncols_x, 1);

        let q = quantize_row_q8_1_padded(&a);
        let y = as_blocks::<BlockQ8_1>(&q).unwrap();
        let mut out = vec![0.0f32; nrows];
        with_vec_dot_block!(ty, B => {
            let xb = as_blocks::<B>(&packed).unwrap();
            mul_mat_vec_q(xb, y, &mut out, ncols_x, nrows, 1, y.len());
        }, other => unreachable!());

        let scale: f32 = a.iter().map(|v| v.abs()).sum::<f32>() / ncols_x as f32;
        for (got, want) in out.iter().zip(&reference) {
            // Activation quantization error is at most half a step per value.
            let tol = ncols_x as f32 * scale * 0.02 + 1e-3;
            assert!((got - want).abs() <= tol, "{}: {} vs {}", ty, got, want);
        }
    }

    #[test]
    fn test_mmvq_matches_reference_all_formats() {
        for ty in [
            GgmlType::Q4_0,
            GgmlType::Q4_1,
            GgmlType::Q5_0,
            GgmlType::Q5_1,
            GgmlType::Q8_0,
            GgmlType::Q2K,
            GgmlType::Q3K,
            GgmlType::Q4K,
            GgmlType::Q5K,
            GgmlType::Q6K,
        ] {
            check(ty, 512, 5);
        }
    }

    #[test]
    fn test_mmvq_kernel_on_device() {
        let driver = SimDriver::uniform(1, 1 << 22, 860);
        let stream = driver.create_stream(0).unwrap();
        let (ncols_x, nrows) = (256, 8);
        let w = random_values(nrows * ncols_x, 1, 2.0);
        let a = random_values(ncols_x, 2, 1.0);
        let packed = quantize(GgmlType::Q4K, &w).unwrap();

        let xp = driver.malloc(0, packed.len()).unwrap();
        let af = driver.malloc(0, ncols_x * 4).unwrap();
        let yq = driver.malloc(0, q8_1_row_bytes(ncols_x)).unwrap();
        let dst = driver.malloc(0, nrows * 4).unwrap();
        driver.memcpy_h2d_async(xp, &packed, stream).unwrap();
        let a_bytes: Vec<u8> = a.iter().flat_map(|v| v.to_le_bytes()).collect();
        driver.memcpy_h2d_async(af, &a_bytes, stream).unwrap();
        launch_quantize_q8_1(&driver, stream, af, yq, ncols_x, 1);
        launch_mul_mat_vec_q(&driver, stream, GgmlType::Q4K, xp, yq, dst, ncols_x, nrows, 1, 0);

        let mut out = vec![0u8; nrows * 4];
        driver.memcpy_d2h(&mut out, dst, stream).unwrap();
        let got: Vec<f32> = out
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let reference = matmul_reference(&dequantize(GgmlType::Q4K, &packed).unwrap(), &a, nrows, ncols_x, 1);
        for (g, r) in got.iter().zip(&reference) {
            assert!((g - r).abs() < 0.4, "{} vs {}", g, r);
        }
    }

    #[test]
    #[should_panic(expected = "unsupported weight type")]
    fn test_mmvq_rejects_dense_weights() {
        let driver = SimDriver::uniform(1, 1 << 20, 860);
        let stream = driver.create_stream(0).unwrap();
        let p = driver.malloc(0, 16).unwrap();
        launch_mul_mat_vec_q(&driver, stream, GgmlType::F16, p, p, p, 32, 1, 1, 0);
    }
}
