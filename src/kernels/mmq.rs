//! Tiled quantized matrix-matrix product (MMQ).
//!
//! The output is covered by tiles of `MMQ_Y` weight rows by `MMQ_X`
//! activation columns. For each tile the group walks the shared dimension in
//! chunks, staging the chunk's weight blocks and Q8_1 activation blocks into
//! tile storage; every thread of the `NWARPS x WARP_SIZE` group then
//! accumulates a `MMQ_Y / WARP_SIZE` by `MMQ_X / NWARPS` block of outputs
//! from the staged tiles.

use super::convert::q8_1_span_bytes;
use super::mmvq::with_vec_dot_block;
use super::{kernel_error, launch, WARP_SIZE};
use crate::device::{DeviceHeap, DevicePtr, Driver, Stream};
use crate::error::DriverError;
use crate::quant::{as_blocks, BlockQ8_1, GgmlType, VecDotQ8_1, QK, QK_K};

/// Weight rows per tile. Split row windows of quantized tensors are aligned
/// to this.
pub const MMQ_Y: usize = 64;
/// Activation columns per tile.
pub const MMQ_X: usize = 32;
/// Lane groups per tile.
pub const NWARPS: usize = 4;

/// Values of the shared dimension staged per chunk.
const TILE_K: usize = QK_K;

/// Tiled product for `ncols_y` activation columns.
///
/// Layouts as in [`mul_mat_vec_q`](super::mmvq::mul_mat_vec_q); output is
/// `dst[c * nrows + row]`.
pub fn mul_mat_q<B: VecDotQ8_1>(
    x: &[B],
    y: &[BlockQ8_1],
    dst: &mut [f32],
    ncols_x: usize,
    nrows: usize,
    ncols_y: usize,
    y_stride: usize,
) {
    let blocks_per_row = ncols_x / B::QK;
    let y_per_block = B::QK / QK;
    let chunk_blocks = (TILE_K / B::QK).max(1);

    let mut tile_x: Vec<B> = Vec::with_capacity(MMQ_Y * chunk_blocks);
    let mut tile_y: Vec<BlockQ8_1> = Vec::with_capacity(MMQ_X * chunk_blocks * y_per_block);
    let mut acc = vec![0.0f32; MMQ_X * MMQ_Y];

    for row0 in (0..nrows).step_by(MMQ_Y) {
        for col0 in (0..ncols_y).step_by(MMQ_X) {
            acc.fill(0.0);
            for kb0 in (0..blocks_per_row).step_by(chunk_blocks) {
                let kb = chunk_blocks.min(blocks_per_row - kb0);

                // Stage; rows and columns past the edge repeat the last one.
                tile_x.clear();
                for i in 0..MMQ_Y {
                    let row = (row0 + i).min(nrows - 1);
                    let start = row * blocks_per_row + kb0;
                    tile_x.extend_from_slice(&x[start..start + kb]);
                }
                tile_y.clear();
                for j in 0..MMQ_X {
                    let col = (col0 + j).min(ncols_y - 1);
                    let start = col * y_stride + kb0 * y_per_block;
                    tile_y.extend_from_slice(&y[start..start + kb * y_per_block]);
                }

                for warp in 0..NWARPS {
                    for lane in 0..WARP_SIZE {
                        for j in (warp..MMQ_X).step_by(NWARPS) {
                            let ty = &tile_y[j * kb * y_per_block..(j + 1) * kb * y_per_block];
                            for i in (lane..MMQ_Y).step_by(WARP_SIZE) {
                                let tx = &tile_x[i * kb..(i + 1) * kb];
                                let mut sum = 0.0f32;
                                for (k, xb) in tx.iter().enumerate() {
                                    let yk = &ty[k * y_per_block..(k + 1) * y_per_block];
                                    sum += xb.vec_dot_q8_1_full(yk);
                                }
                                acc[j * MMQ_Y + i] += sum;
                            }
                        }
                    }
                }
            }

            for j in 0..MMQ_X.min(ncols_y - col0) {
                for i in 0..MMQ_Y.min(nrows - row0) {
                    dst[(col0 + j) * nrows + row0 + i] = acc[j * MMQ_Y + i];
                }
            }
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
    let err = kernel_error("mul_mat_q");
    let x_bytes = heap.read_bytes(a.x, a.nrows * (a.ncols_x / B::QK) * std::mem::size_of::<B>())?;
    let y_len = q8_1_span_bytes(a.ncols_x, a.ncols_y, a.y_stride);
    let y_bytes = heap.read_bytes(a.y, y_len)?;
    let x = as_blocks::<B>(&x_bytes).map_err(&err)?;
    let y = as_blocks::<BlockQ8_1>(&y_bytes).map_err(&err)?;
    let mut out = vec![0.0f32; a.nrows * a.ncols_y];
    mul_mat_q(x, y, &mut out, a.ncols_x, a.nrows, a.ncols_y, a.y_stride);
    heap.write_f32(a.dst, &out)
}

/// Queue MMQ for weight type `ty`.
///
/// # Panics
/// Panics if `ty` has no Q8_1 dot product.
#[allow(clippy::too_many_arguments)]
pub fn launch_mul_mat_q(
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
    with_vec_dot_block!(ty, B => launch(driver, stream, "mul_mat_q", move |heap| run::<B>(heap, args)),
        other => panic!("mul_mat_q: unsupported weight type {}", ty));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::mmvq::mul_mat_vec_q;
    use crate::kernels::testing::{max_abs_diff, random_values};
    use crate::quant::{
        quantize, quantize_row_q8_1_padded, BlockQ2K, BlockQ3K, BlockQ4K, BlockQ4_0, BlockQ4_1,
        BlockQ5K, BlockQ5_0, BlockQ5_1, BlockQ6K, BlockQ8_0,
    };

    fn activations(ncols_x: usize, ncols_y: usize) -> (Vec<u8>, usize) {
        let mut out = Vec::new();
        let mut stride = 0;
        for c in 0..ncols_y {
            let col = quantize_row_q8_1_padded(&random_values(ncols_x, 100 + c as u64, 1.0));
            stride = col.len() / std::mem::size_of::<BlockQ8_1>();
            out.extend_from_slice(&col);
        }
        (out, stride)
    }

    /// Tiled and vector kernels compute the same block dot products, only
    /// summed in a different order.
    fn check_against_mmvq<B: VecDotQ8_1>(ncols_x: usize, nrows: usize, ncols_y: usize) {
        let w = random_values(nrows * ncols_x, 5, 1.5);
        let packed = quantize(B::TYPE, &w).unwrap();
        let x = as_blocks::<B>(&packed).unwrap();
        let (yb, stride) = activations(ncols_x, ncols_y);
        let y = as_blocks::<BlockQ8_1>(&yb).unwrap();

        let mut tiled = vec![0.0f32; nrows * ncols_y];
        mul_mat_q(x, y, &mut tiled, ncols_x, nrows, ncols_y, stride);
        let mut vector = vec![0.0f32; nrows * ncols_y];
        mul_mat_vec_q(x, y, &mut vector, ncols_x, nrows, ncols_y, stride);

        let diff = max_abs_diff(&tiled, &vector);
        assert!(diff < 1e-3, "{}: max diff {}", B::TYPE, diff);
    }

    #[test]
    fn test_mmq_matches_mmvq_partial_tiles() {
        // 70 rows and 35 columns leave partial tiles in both directions.
        check_against_mmvq::<BlockQ4_0>(96, 70, 35);
        check_against_mmvq::<BlockQ8_0>(288, 70, 3);
        check_against_mmvq::<BlockQ6K>(512, 65, 33);
    }

    #[test]
    fn test_mmq_all_formats_small() {
        check_against_mmvq::<BlockQ4_1>(256, 9, 4);
        check_against_mmvq::<BlockQ5_0>(256, 9, 4);
        check_against_mmvq::<BlockQ5_1>(256, 9, 4);
        check_against_mmvq::<BlockQ2K>(256, 9, 4);
        check_against_mmvq::<BlockQ3K>(256, 9, 4);
        check_against_mmvq::<BlockQ4K>(256, 9, 4);
        check_against_mmvq::<BlockQ5K>(256, 9, 4);
    }

    #[test]
    fn test_mmq_empty_batch_leaves_output_untouched() {
        let driver = crate::device::SimDriver::uniform(1, 1 << 20, 860);
        let stream = driver.create_stream(0).unwrap();
        let x = driver.malloc(0, 64).unwrap();
        let dst = driver.malloc(0, 16).unwrap();
        driver.memcpy_h2d_async(dst, &[7u8; 16], stream).unwrap();
        launch_mul_mat_q(&driver, stream, GgmlType::Q4_0, x, x, dst, 32, 4, 0, 0);
        let mut out = [0u8; 16];
        driver.memcpy_d2h(&mut out, dst, stream).unwrap();
        assert_eq!(out, [7u8; 16]);
    }
}
