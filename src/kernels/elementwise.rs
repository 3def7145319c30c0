//! Elementwise, normalization and attention-support kernels over f32 rows.

use half::f16;

use super::launch;
use crate::device::{DevicePtr, Driver, Stream};
use crate::error::DriverError;
use crate::quant::{FloatStore, GgmlType};
use crate::tensor::MAX_DIMS;

/// `dst[i] = x[i] + y[i % y.len()]`
pub fn add(x: &[f32], y: &[f32], dst: &mut [f32]) {
    for (i, (d, &a)) in dst.iter_mut().zip(x).enumerate() {
        *d = a + y[i % y.len()];
    }
}

/// `dst[i] = x[i] * y[i % y.len()]`
pub fn mul(x: &[f32], y: &[f32], dst: &mut [f32]) {
    for (i, (d, &a)) in dst.iter_mut().zip(x).enumerate() {
        *d = a * y[i % y.len()];
    }
}

pub fn scale(x: &[f32], factor: f32, dst: &mut [f32]) {
    for (d, &a) in dst.iter_mut().zip(x) {
        *d = a * factor;
    }
}

/// Exact GELU: `0.5 * x * (1 + erf(x / sqrt(2)))`.
pub fn gelu(x: &[f32], dst: &mut [f32]) {
    let sqrt_2_inv = std::f32::consts::FRAC_1_SQRT_2;
    for (d, &a) in dst.iter_mut().zip(x) {
        *d = 0.5 * a * (1.0 + libm::erff(a * sqrt_2_inv));
    }
}

/// SiLU: `x / (1 + exp(-x))`.
pub fn silu(x: &[f32], dst: &mut [f32]) {
    for (d, &a) in dst.iter_mut().zip(x) {
        *d = a / (1.0 + (-a).exp());
    }
}

/// Per-row `(x - mean) / sqrt(var + eps)`.
pub fn norm(x: &[f32], ncols: usize, eps: f32, dst: &mut [f32]) {
    for (row, out) in x.chunks_exact(ncols).zip(dst.chunks_exact_mut(ncols)) {
        let mean = row.iter().sum::<f32>() / ncols as f32;
        let var = row.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>() / ncols as f32;
        let inv = 1.0 / (var + eps).sqrt();
        for (o, &v) in out.iter_mut().zip(row) {
            *o = (v - mean) * inv;
        }
    }
}

/// Per-row `x / sqrt(mean(x^2) + eps)`.
pub fn rms_norm(x: &[f32], ncols: usize, eps: f32, dst: &mut [f32]) {
    for (row, out) in x.chunks_exact(ncols).zip(dst.chunks_exact_mut(ncols)) {
        let mean_sq = row.iter().map(|&v| v * v).sum::<f32>() / ncols as f32;
        let inv = 1.0 / (mean_sq + eps).sqrt();
        for (o, &v) in out.iter_mut().zip(row) {
            *o = v * inv;
        }
    }
}

/// Per-row softmax with max subtraction.
pub fn soft_max(x: &[f32], ncols: usize, dst: &mut [f32]) {
    for (row, out) in x.chunks_exact(ncols).zip(dst.chunks_exact_mut(ncols)) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0f32;
        for (o, &v) in out.iter_mut().zip(row) {
            *o = (v - max).exp();
            sum += *o;
        }
        if sum > 0.0 {
            for o in out.iter_mut() {
                *o /= sum;
            }
        }
    }
}

/// Causal mask: column `c` of row `r` becomes `-inf` when
/// `c > n_past + r % rows_per_channel`.
pub fn diag_mask_inf(x: &[f32], ncols: usize, rows_per_channel: usize, n_past: usize, dst: &mut [f32]) {
    for (r, (row, out)) in x.chunks_exact(ncols).zip(dst.chunks_exact_mut(ncols)).enumerate() {
        let limit = n_past + r % rows_per_channel;
        for (c, (o, &v)) in out.iter_mut().zip(row).enumerate() {
            *o = if c > limit { f32::NEG_INFINITY } else { v };
        }
    }
}

/// Rotary position embedding parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RopeParams {
    /// Rotated dimensions per row; the rest are copied.
    pub n_dims: usize,
    /// Bit 1 selects the split-half (NeoX) pairing.
    pub mode: u32,
    pub freq_base: f32,
    pub freq_scale: f32,
}

impl RopeParams {
    pub fn is_neox(&self) -> bool {
        self.mode & 2 != 0
    }
}

/// Rotate every row of `x` for position `pos`.
pub fn rope(x: &[f32], ncols: usize, pos: usize, p: &RopeParams, dst: &mut [f32]) {
    let theta_scale = p.freq_base.powf(-2.0 / p.n_dims as f32);
    let base = pos as f32 * p.freq_scale;
    for (row, out) in x.chunks_exact(ncols).zip(dst.chunks_exact_mut(ncols)) {
        out.copy_from_slice(row);
        let half = p.n_dims / 2;
        let mut theta = base;
        for i in 0..half {
            let (cos, sin) = (theta.cos(), theta.sin());
            let (a, b) = if p.is_neox() { (i, i + half) } else { (2 * i, 2 * i + 1) };
            let (x0, x1) = (row[a], row[b]);
            out[a] = x0 * cos - x1 * sin;
            out[b] = x0 * sin + x1 * cos;
            theta *= theta_scale;
        }
    }
}

// ---------------------------------------------------------------------------
// Strided copy
// ---------------------------------------------------------------------------

/// Byte span covered by a strided tensor of `elem` byte elements.
pub fn strided_span(ne: &[usize; MAX_DIMS], nb: &[usize; MAX_DIMS], elem: usize) -> usize {
    if ne.iter().any(|&n| n == 0) {
        return 0;
    }
    ne.iter().zip(nb).map(|(&n, &b)| (n - 1) * b).sum::<usize>() + elem
}

/// Byte offset of flat element `i` in a tensor of extents `ne` and strides `nb`.
#[inline]
fn element_offset(mut i: usize, ne: &[usize; MAX_DIMS], nb: &[usize; MAX_DIMS]) -> usize {
    let mut off = 0;
    for d in 0..MAX_DIMS {
        off += (i % ne[d]) * nb[d];
        i /= ne[d];
    }
    off
}

/// Copy elements in logical order from a strided source into a strided
/// destination of the same element count, converting between float
/// encodings. Source and destination shapes may differ.
pub fn cpy_strided<S: FloatStore, D: FloatStore>(
    src: &[u8],
    ne_src: &[usize; MAX_DIMS],
    nb_src: &[usize; MAX_DIMS],
    dst: &mut [u8],
    ne_dst: &[usize; MAX_DIMS],
    nb_dst: &[usize; MAX_DIMS],
) {
    let n: usize = ne_src.iter().product();
    debug_assert_eq!(n, ne_dst.iter().product::<usize>());
    for i in 0..n {
        let so = element_offset(i, ne_src, nb_src);
        let d0 = element_offset(i, ne_dst, nb_dst);
        let v = S::read_le(&src[so..so + S::SIZE]).to_f32();
        D::from_f32(v).write_le(&mut dst[d0..d0 + D::SIZE]);
    }
}

/// Source or destination of a strided copy.
#[derive(Debug, Clone, Copy)]
pub struct StridedRef {
    pub ptr: DevicePtr,
    pub ty: GgmlType,
    pub ne: [usize; MAX_DIMS],
    pub nb: [usize; MAX_DIMS],
}

impl StridedRef {
    fn span(&self) -> usize {
        strided_span(&self.ne, &self.nb, self.ty.type_size())
    }
}

/// Queue a strided copy between F32/F16 tensors on one device.
pub fn launch_cpy(driver: &dyn Driver, stream: Stream, src: StridedRef, dst: StridedRef) {
    let (src_span, dst_span) = (src.span(), dst.span());
    launch(driver, stream, "cpy", move |heap| {
        let data = heap.read_bytes(src.ptr, src_span)?;
        let out = heap.bytes_mut(dst.ptr, dst_span)?;
        let (s, d) = (&src, &dst);
        match (s.ty, d.ty) {
            (GgmlType::F32, GgmlType::F32) => cpy_strided::<f32, f32>(&data, &s.ne, &s.nb, out, &d.ne, &d.nb),
            (GgmlType::F32, GgmlType::F16) => cpy_strided::<f32, f16>(&data, &s.ne, &s.nb, out, &d.ne, &d.nb),
            (GgmlType::F16, GgmlType::F32) => cpy_strided::<f16, f32>(&data, &s.ne, &s.nb, out, &d.ne, &d.nb),
            (GgmlType::F16, GgmlType::F16) => cpy_strided::<f16, f16>(&data, &s.ne, &s.nb, out, &d.ne, &d.nb),
            (a, b) => {
                return Err(DriverError::LaunchFailed {
                    name: "cpy",
                    reason: format!("unsupported copy {} -> {}", a, b),
                })
            }
        }
        Ok(())
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::testing::max_abs_diff;

    #[test]
    fn test_add_broadcasts_rows() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let mut out = [0.0; 4];
        add(&x, &[10.0, 20.0], &mut out);
        assert_eq!(out, [11.0, 22.0, 13.0, 24.0]);
        mul(&x, &[2.0], &mut out);
        assert_eq!(out, [2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn test_activations() {
        let x = [-2.0f32, 0.0, 1.0, 3.0];
        let mut out = [0.0; 4];
        gelu(&x, &mut out);
        assert!(max_abs_diff(&out, &[-0.04550, 0.0, 0.84134, 2.99595]) < 1e-4);
        silu(&x, &mut out);
        assert!(max_abs_diff(&out, &[-0.23841, 0.0, 0.73106, 2.85772]) < 1e-4);
    }

    #[test]
    fn test_norms() {
        let x = [1.0f32, 2.0, 3.0, 4.0, 2.0, 2.0, 2.0, 2.0];
        let mut out = [0.0; 8];
        norm(&x, 4, 1e-5, &mut out);
        let mean: f32 = out[..4].iter().sum();
        assert!(mean.abs() < 1e-5);
        let var: f32 = out[..4].iter().map(|v| v * v).sum::<f32>() / 4.0;
        assert!((var - 1.0).abs() < 1e-3);
        assert!(out[4..].iter().all(|&v| v.abs() < 1e-3));

        rms_norm(&x, 4, 0.0, &mut out);
        let rms = (30.0f32 / 4.0).sqrt();
        assert!((out[3] - 4.0 / rms).abs() < 1e-6);
        assert!(out[4..].iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_soft_max_rows_sum_to_one() {
        let x = [1.0f32, 2.0, 3.0, 1000.0, 1000.0, 1000.0];
        let mut out = [0.0; 6];
        soft_max(&x, 3, &mut out);
        assert!((out[..3].iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(out[2] > out[1] && out[1] > out[0]);
        assert!(out[3..].iter().all(|&v| (v - 1.0 / 3.0).abs() < 1e-6));
    }

    #[test]
    fn test_soft_max_after_mask() {
        let x = [0.5f32; 9];
        let mut masked = [0.0; 9];
        diag_mask_inf(&x, 3, 3, 0, &mut masked);
        assert_eq!(masked[1], f32::NEG_INFINITY);
        assert_eq!(masked[3], 0.5);
        assert_eq!(masked[5], f32::NEG_INFINITY);
        let mut out = [0.0; 9];
        soft_max(&masked, 3, &mut out);
        assert_eq!(&out[..3], &[1.0, 0.0, 0.0]);
        assert!((out[3] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_diag_mask_with_past() {
        let x = [1.0f32; 8];
        let mut out = [0.0; 8];
        diag_mask_inf(&x, 4, 2, 2, &mut out);
        // row 0 sees columns 0..=2, row 1 sees 0..=3
        assert_eq!(out[3], f32::NEG_INFINITY);
        assert_eq!(out[2], 1.0);
        assert!(out[4..].iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_rope_position_zero_is_identity() {
        let x: Vec<f32> = (0..8).map(|i| i as f32).collect();
        let mut out = vec![0.0; 8];
        let p = RopeParams {
            n_dims: 8,
            mode: 0,
            freq_base: 10000.0,
            freq_scale: 1.0,
        };
        rope(&x, 8, 0, &p, &mut out);
        assert!(max_abs_diff(&x, &out) < 1e-6);
    }

    #[test]
    fn test_rope_pairs_and_norm() {
        let x = [1.0f32, 0.0, 0.0, 1.0, 5.0, 6.0];
        let mut out = [0.0; 6];
        let p = RopeParams {
            n_dims: 4,
            mode: 0,
            freq_base: 10000.0,
            freq_scale: 1.0,
        };
        rope(&x, 6, 3, &p, &mut out);
        // First pair rotates by exactly `pos` radians.
        assert!((out[0] - 3.0f32.cos()).abs() < 1e-6);
        assert!((out[1] - 3.0f32.sin()).abs() < 1e-6);
        // Unrotated tail.
        assert_eq!(&out[4..], &[5.0, 6.0]);

        let neox = RopeParams { mode: 2, ..p };
        rope(&x, 6, 3, &neox, &mut out);
        // NeoX pairs element 0 with element 2.
        assert!((out[0] - 3.0f32.cos()).abs() < 1e-6);
        assert!((out[2] - 3.0f32.sin()).abs() < 1e-6);
        for pair in [(0, 2), (1, 3)] {
            let before = x[pair.0].hypot(x[pair.1]);
            let after = out[pair.0].hypot(out[pair.1]);
            assert!((before - after).abs() < 1e-5);
        }
    }

    #[test]
    fn test_cpy_strided_transpose_to_f16() {
        // 2x3 row-major f32 read as its 3x2 transpose.
        let values = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let src: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let ne = [2, 3, 1, 1];
        let nb_src = [12, 4, 24, 24];
        let nb_dst = [2, 4, 12, 12];
        let mut dst = vec![0u8; 12];
        cpy_strided::<f32, f16>(&src, &ne, &nb_src, &mut dst, &ne, &nb_dst);
        let got: Vec<f32> = dst
            .chunks_exact(2)
            .map(|c| f16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
            .collect();
        assert_eq!(got, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert_eq!(strided_span(&ne, &nb_src, 4), 24);
    }

    #[test]
    fn test_cpy_strided_reshapes_in_logical_order() {
        let values = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let src: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut dst = vec![0u8; 24];
        // 3x2 contiguous into 6x1 contiguous keeps element order.
        cpy_strided::<f32, f32>(&src, &[3, 2, 1, 1], &[4, 12, 24, 24], &mut dst, &[6, 1, 1, 1], &[4, 24, 24, 24]);
        assert_eq!(dst, src);
    }
}
