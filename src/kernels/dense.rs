//! Dense fallback GEMM over F32, F16 or BF16 operands with f32 accumulation.

use half::{bf16, f16};

use super::launch;
use crate::config::Precision;
use crate::device::{DevicePtr, Driver, Stream};
use crate::quant::FloatStore;

/// `dst[c * nrows + r] = sum_k w[r][k] * y[c][k]` over little-endian `T`
/// operands: `w` is `nrows` rows of `k`, `y` is `ncols_y` columns of `k`.
pub fn gemm<T: FloatStore>(
    w: &[u8],
    y: &[u8],
    dst: &mut [f32],
    nrows: usize,
    k: usize,
    ncols_y: usize,
) {
    let decode = |bytes: &[u8]| -> Vec<f32> {
        bytes
            .chunks_exact(T::SIZE)
            .map(|c| T::read_le(c).to_f32())
            .collect()
    };
    let wv = decode(&w[..nrows * k * T::SIZE]);
    let yv = decode(&y[..ncols_y * k * T::SIZE]);
    for c in 0..ncols_y {
        let yc = &yv[c * k..(c + 1) * k];
        for r in 0..nrows {
            let wr = &wv[r * k..(r + 1) * k];
            dst[c * nrows + r] = wr.iter().zip(yc).map(|(a, b)| a * b).sum();
        }
    }
}

/// Queue a dense GEMM with both operands stored in `precision`.
#[allow(clippy::too_many_arguments)]
pub fn launch_gemm(
    driver: &dyn Driver,
    stream: Stream,
    precision: Precision,
    w: DevicePtr,
    y: DevicePtr,
    dst: DevicePtr,
    nrows: usize,
    k: usize,
    ncols_y: usize,
) {
    let name = match precision {
        Precision::F32 => "gemm_f32",
        Precision::F16 => "gemm_f16",
        Precision::BF16 => "gemm_bf16",
    };
    let size = precision.size();
    launch(driver, stream, name, move |heap| {
        let wb = heap.read_bytes(w, nrows * k * size)?;
        let yb = heap.read_bytes(y, ncols_y * k * size)?;
        let mut out = vec![0.0f32; nrows * ncols_y];
        match precision {
            Precision::F32 => gemm::<f32>(&wb, &yb, &mut out, nrows, k, ncols_y),
            Precision::F16 => gemm::<f16>(&wb, &yb, &mut out, nrows, k, ncols_y),
            Precision::BF16 => gemm::<bf16>(&wb, &yb, &mut out, nrows, k, ncols_y),
        }
        heap.write_f32(dst, &out)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimDriver;
    use crate::kernels::testing::{matmul_reference, max_abs_diff, random_values};

    fn encode<T: FloatStore>(values: &[f32]) -> Vec<u8> {
        let mut out = vec![0u8; values.len() * T::SIZE];
        for (v, c) in values.iter().zip(out.chunks_exact_mut(T::SIZE)) {
            T::from_f32(*v).write_le(c);
        }
        out
    }

    #[test]
    fn test_gemm_precisions_within_rounding() {
        let (nrows, k, ncols) = (7, 64, 3);
        let w = random_values(nrows * k, 11, 1.0);
        let y = random_values(ncols * k, 12, 1.0);
        let reference = matmul_reference(&w, &y, nrows, k, ncols);

        let mut out = vec![0.0f32; nrows * ncols];
        gemm::<f32>(&encode::<f32>(&w), &encode::<f32>(&y), &mut out, nrows, k, ncols);
        assert!(max_abs_diff(&out, &reference) < 1e-4);

        // Both operands rounded: relative error 2^-11 (f16) or 2^-8 (bf16)
        // per factor, summed over k terms of magnitude <= 1.
        gemm::<f16>(&encode::<f16>(&w), &encode::<f16>(&y), &mut out, nrows, k, ncols);
        assert!(max_abs_diff(&out, &reference) < k as f32 * 2.0 * 4.9e-4);
        gemm::<bf16>(&encode::<bf16>(&w), &encode::<bf16>(&y), &mut out, nrows, k, ncols);
        assert!(max_abs_diff(&out, &reference) < k as f32 * 2.0 * 3.9e-3);
    }

    #[test]
    fn test_launch_gemm() {
        let driver = SimDriver::uniform(1, 1 << 20, 860);
        let stream = driver.create_stream(0).unwrap();
        let w = encode::<f16>(&[1.0, 2.0, 3.0, 4.0]);
        let y = encode::<f16>(&[1.0, 1.0, 0.5, -1.0]);
        let wp = driver.malloc(0, w.len()).unwrap();
        let yp = driver.malloc(0, y.len()).unwrap();
        let dp = driver.malloc(0, 16).unwrap();
        driver.memcpy_h2d_async(wp, &w, stream).unwrap();
        driver.memcpy_h2d_async(yp, &y, stream).unwrap();
        launch_gemm(&driver, stream, Precision::F16, wp, yp, dp, 2, 2, 2);
        let mut out = vec![0u8; 16];
        driver.memcpy_d2h(&mut out, dp, stream).unwrap();
        let got: Vec<f32> = out
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(got, vec![3.0, 7.0, -1.5, -2.5]);
    }
}
