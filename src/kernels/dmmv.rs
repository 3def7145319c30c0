//! Dequantize-mat-vec (DMMV): decode weight rows on the fly and dot them
//! with f32 activations.
//!
//! Used for single-column products when integer dot products are not
//! available on the device, and for F16/BF16 weights. Lane `l` of the group
//! handles elements `l, l + 32, ...` of the decoded row.

use super::{kernel_error, launch, warp_reduce_sum, WARP_SIZE};
use crate::device::{DevicePtr, Driver, Stream};
use crate::error::OffloadError;
use crate::quant::{convert_row, GgmlType};

/// `dst[c * nrows + row] = dot(decode(x[row]), y[c])` for every column.
pub fn dequantize_mul_mat_vec(
    ty: GgmlType,
    x: &[u8],
    y: &[f32],
    dst: &mut [f32],
    ncols_x: usize,
    nrows: usize,
    ncols_y: usize,
) -> Result<(), OffloadError> {
    let row_size = ty.row_size(ncols_x);
    let mut decoded = vec![0.0f32; ncols_x];
    for row in 0..nrows {
        convert_row::<f32>(ty, &x[row * row_size..(row + 1) * row_size], &mut decoded)?;
        for col in 0..ncols_y {
            let yc = &y[col * ncols_x..(col + 1) * ncols_x];
            let mut lanes = [0.0f32; WARP_SIZE];
            for (i, (w, a)) in decoded.iter().zip(yc).enumerate() {
                lanes[i % WARP_SIZE] += w * a;
            }
            warp_reduce_sum(&mut lanes);
            dst[col * nrows + row] = lanes[0];
        }
    }
    Ok(())
}

/// Queue DMMV. `y` holds `ncols_y` contiguous f32 columns of `ncols_x`.
#[allow(clippy::too_many_arguments)]
pub fn launch_dequantize_mul_mat_vec(
    driver: &dyn Driver,
    stream: Stream,
    ty: GgmlType,
    x: DevicePtr,
    y: DevicePtr,
    dst: DevicePtr,
    ncols_x: usize,
    nrows: usize,
    ncols_y: usize,
) {
    let x_len = nrows * ty.row_size(ncols_x);
    launch(driver, stream, "dequantize_mul_mat_vec", move |heap| {
        let xb = heap.read_bytes(x, x_len)?;
        let yv = heap.read_f32(y, ncols_x * ncols_y)?;
        let mut out = vec![0.0f32; nrows * ncols_y];
        dequantize_mul_mat_vec(ty, &xb, &yv, &mut out, ncols_x, nrows, ncols_y)
            .map_err(kernel_error("dequantize_mul_mat_vec"))?;
        heap.write_f32(dst, &out)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::testing::{matmul_reference, max_abs_diff, random_values};
    use crate::quant::{dequantize, quantize};

    #[test]
    fn test_dmmv_matches_decoded_reference() {
        let (ncols_x, nrows) = (256, 6);
        let a = random_values(ncols_x * 2, 3, 1.0);
        for ty in [GgmlType::F16, GgmlType::BF16, GgmlType::Q4_0, GgmlType::Q5K, GgmlType::Q8_0] {
            let w = random_values(nrows * ncols_x, 4, 1.0);
            let packed = quantize(ty, &w).unwrap();
            let wd = dequantize(ty, &packed).unwrap();
            let reference = matmul_reference(&wd, &a, nrows, ncols_x, 2);
            let mut out = vec![0.0f32; nrows * 2];
            dequantize_mul_mat_vec(ty, &packed, &a, &mut out, ncols_x, nrows, 2).unwrap();
            // Exact operands; only the summation order differs.
            assert!(max_abs_diff(&out, &reference) < 1e-4, "{}", ty);
        }
    }
}
