//! Row windows of split tensors.
//!
//! Device `i` owns rows `[row_low, row_high)` derived from its cumulative
//! split fraction, rounded down to the row alignment. The last device always
//! ends at `nrows`, so rounding remainders land on it.

use crate::kernels::mmq::MMQ_Y;
use crate::quant::{GgmlType, MATRIX_ROW_PADDING};

/// Cumulative start fraction of every device.
///
/// `weights` are the configured split proportions; when empty, devices are
/// weighted by total memory. Missing trailing entries count as zero.
pub fn split_starts(weights: &[f32], total_memory: &[usize]) -> Vec<f32> {
    let n = total_memory.len();
    let w: Vec<f64> = if weights.is_empty() {
        total_memory.iter().map(|&m| m as f64).collect()
    } else {
        (0..n).map(|i| weights.get(i).copied().unwrap_or(0.0) as f64).collect()
    };
    let total: f64 = w.iter().sum();
    let mut starts = Vec::with_capacity(n);
    let mut acc = 0.0f64;
    for &wi in &w {
        starts.push(if total > 0.0 { (acc / total) as f32 } else { 0.0 });
        acc += wi;
    }
    starts
}

/// Rows of device `device` for a tensor of `nrows` rows.
pub fn row_window(starts: &[f32], device: usize, nrows: usize, align: usize) -> (usize, usize) {
    let bound = |i: usize| -> usize {
        let r = (nrows as f64 * starts[i] as f64) as usize;
        (r - r % align).min(nrows)
    };
    let low = if device == 0 { 0 } else { bound(device) };
    let high = if device + 1 == starts.len() {
        nrows
    } else {
        bound(device + 1)
    };
    (low, high.max(low))
}

/// Windows of every device, in device order.
pub fn row_windows(starts: &[f32], nrows: usize, align: usize) -> Vec<(usize, usize)> {
    (0..starts.len())
        .map(|d| row_window(starts, d, nrows, align))
        .collect()
}

/// Row alignment of split windows for `ty`.
pub fn row_alignment(ty: GgmlType) -> usize {
    if ty.is_quantized() {
        MMQ_Y
    } else {
        1
    }
}

/// Extra bytes allocated after the last row so that padded activation rows
/// can be read against it.
pub fn row_padding_bytes(ty: GgmlType, ne0: usize) -> usize {
    let rem = ne0 % MATRIX_ROW_PADDING;
    if rem == 0 {
        0
    } else {
        ty.row_size(MATRIX_ROW_PADDING - rem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_two_devices_even_split() {
        let starts = split_starts(&[0.5, 0.5], &[1, 1]);
        assert_eq!(starts, vec![0.0, 0.5]);
        assert_eq!(row_windows(&starts, 1024, 512), vec![(0, 512), (512, 1024)]);
    }

    #[test]
    fn test_split_by_memory_when_unset() {
        let starts = split_starts(&[], &[3 << 30, 1 << 30]);
        assert_eq!(starts, vec![0.0, 0.75]);
        assert_eq!(row_windows(&starts, 100, 1), vec![(0, 75), (75, 100)]);
    }

    #[test]
    fn test_remainder_goes_to_last_device() {
        let starts = split_starts(&[1.0, 1.0, 1.0], &[1, 1, 1]);
        let w = row_windows(&starts, 200, 64);
        assert_eq!(w, vec![(0, 64), (64, 128), (128, 200)]);
    }

    #[test]
    fn test_zero_weight_device_is_empty() {
        let starts = split_starts(&[1.0, 0.0, 1.0], &[1, 1, 1]);
        let w = row_windows(&starts, 128, 1);
        assert_eq!(w[1].0, w[1].1);
        assert_eq!(w, vec![(0, 64), (64, 64), (64, 128)]);
    }

    #[test]
    fn test_padding_bytes() {
        assert_eq!(row_padding_bytes(GgmlType::F32, 512), 0);
        assert_eq!(row_padding_bytes(GgmlType::F32, 500), 48);
        assert_eq!(row_padding_bytes(GgmlType::Q4K, 256), 144);
        assert_eq!(row_alignment(GgmlType::Q4_0), MMQ_Y);
        assert_eq!(row_alignment(GgmlType::F16), 1);
    }

    proptest! {
        #[test]
        fn prop_windows_partition_rows(
            nrows in 0usize..5000,
            weights in prop::collection::vec(0.0f32..4.0, 1..6),
            align in prop::sample::select(vec![1usize, 32, 64, 512]),
        ) {
            prop_assume!(weights.iter().sum::<f32>() > 0.0);
            let starts = split_starts(&weights, &vec![1; weights.len()]);
            let w = row_windows(&starts, nrows, align);
            prop_assert_eq!(w[0].0, 0);
            prop_assert_eq!(w[w.len() - 1].1, nrows);
            for pair in w.windows(2) {
                prop_assert_eq!(pair[0].1, pair[1].0);
            }
            for (i, &(lo, hi)) in w.iter().enumerate() {
                prop_assert!(lo <= hi);
                // Only the last window may end off the alignment grid.
                if i + 1 < w.len() {
                    prop_assert!(hi % align == 0 || hi == nrows);
                }
            }
            let covered: usize = w.iter().map(|&(lo, hi)| hi - lo).sum();
            prop_assert_eq!(covered, nrows);
        }
    }
}
