//! Integer dot products between weight blocks and Q8_1 activation blocks.
//!
//! A weight block is split into `SLICES` independent partial sums so that
//! several lanes can share one block; summing every slice gives the full
//! block dot product.

use super::{
    f16_to_f32, BlockQ2K, BlockQ3K, BlockQ4K, BlockQ4_0, BlockQ4_1, BlockQ5K, BlockQ5_0,
    BlockQ5_1, BlockQ6K, BlockQ8_0, BlockQ8_1, QuantBlock, QK,
};

/// Dot product of one weight block against the Q8_1 blocks covering the same
/// activation range (one for 32-value formats, eight for K-quants).
pub trait VecDotQ8_1: QuantBlock {
    /// Number of partial sums a block is split into.
    const SLICES: usize;

    /// Partial dot product for `slice` in `0..SLICES`.
    fn vec_dot_q8_1(&self, y: &[BlockQ8_1], slice: usize) -> f32;

    /// Full dot product of the block.
    fn vec_dot_q8_1_full(&self, y: &[BlockQ8_1]) -> f32 {
        (0..Self::SLICES).map(|s| self.vec_dot_q8_1(y, s)).sum()
    }
}

/// Element indices of a 32-value block covered by `slice` when the block is
/// split `slices` ways. Each slice takes matching columns from both halves,
/// the way nibble-packed bytes are laid out.
#[inline]
fn half_columns(slice: usize, slices: usize) -> impl Iterator<Item = usize> {
    let width = QK / 2 / slices;
    (slice * width..(slice + 1) * width).flat_map(|j| [j, j + QK / 2])
}

/// Sum of `code(i) * y.qs[i]` over the slice.
#[inline]
fn sum_products<F: Fn(usize) -> i32>(y: &BlockQ8_1, slice: usize, slices: usize, code: F) -> i32 {
    half_columns(slice, slices)
        .map(|i| code(i) * y.qs[i] as i32)
        .sum()
}

// ---------------------------------------------------------------------------
// 32-value formats
// ---------------------------------------------------------------------------

#[inline]
fn nibble(qs: &[u8; QK / 2], i: usize) -> i32 {
    let b = qs[i % (QK / 2)];
    (if i < QK / 2 { b & 0xF } else { b >> 4 }) as i32
}

impl VecDotQ8_1 for BlockQ4_0 {
    const SLICES: usize = 2;

    fn vec_dot_q8_1(&self, y: &[BlockQ8_1], slice: usize) -> f32 {
        let qs = self.qs;
        let sumi = sum_products(&y[0], slice, Self::SLICES, |i| nibble(&qs, i));
        let d = f16_to_f32(self.d);
        // Codes carry a +8 bias; the activation sum cancels it.
        d * (y[0].delta() * sumi as f32 - 8.0 * y[0].sum() / Self::SLICES as f32)
    }
}

impl VecDotQ8_1 for BlockQ4_1 {
    const SLICES: usize = 2;

    fn vec_dot_q8_1(&self, y: &[BlockQ8_1], slice: usize) -> f32 {
        let qs = self.qs;
        let sumi = sum_products(&y[0], slice, Self::SLICES, |i| nibble(&qs, i));
        let d = f16_to_f32(self.d);
        let m = f16_to_f32(self.m);
        d * y[0].delta() * sumi as f32 + m * y[0].sum() / Self::SLICES as f32
    }
}

impl VecDotQ8_1 for BlockQ5_0 {
    const SLICES: usize = 2;

    fn vec_dot_q8_1(&self, y: &[BlockQ8_1], slice: usize) -> f32 {
        let sumi = sum_products(&y[0], slice, Self::SLICES, |i| self.code(i));
        let d = f16_to_f32(self.d);
        d * (y[0].delta() * sumi as f32 - 16.0 * y[0].sum() / Self::SLICES as f32)
    }
}

impl VecDotQ8_1 for BlockQ5_1 {
    const SLICES: usize = 2;

    fn vec_dot_q8_1(&self, y: &[BlockQ8_1], slice: usize) -> f32 {
        let sumi = sum_products(&y[0], slice, Self::SLICES, |i| self.code(i));
        let d = f16_to_f32(self.d);
        let m = f16_to_f32(self.m);
        d * y[0].delta() * sumi as f32 + m * y[0].sum() / Self::SLICES as f32
    }
}

impl VecDotQ8_1 for BlockQ8_0 {
    const SLICES: usize = 2;

    fn vec_dot_q8_1(&self, y: &[BlockQ8_1], slice: usize) -> f32 {
        let qs = self.qs;
        let sumi = sum_products(&y[0], slice, Self::SLICES, |i| qs[i] as i32);
        f16_to_f32(self.d) * y[0].delta() * sumi as f32
    }
}

// ---------------------------------------------------------------------------
// K-quants: one slice per 32-value activation block
// ---------------------------------------------------------------------------

/// `(sum of code * q8, sum of q8)` over elements `start..start + len` of a
/// super-block, against activation block `y` (which covers 32 elements).
#[inline]
fn k_partial<F: Fn(usize) -> i32>(y: &BlockQ8_1, start: usize, len: usize, code: F) -> (i32, i32) {
    let mut sumi = 0i32;
    let mut sumy = 0i32;
    for i in start..start + len {
        let q8 = y.qs[i % QK] as i32;
        sumi += code(i) * q8;
        sumy += q8;
    }
    (sumi, sumy)
}

impl VecDotQ8_1 for BlockQ2K {
    const SLICES: usize = 8;

    fn vec_dot_q8_1(&self, y: &[BlockQ8_1], slice: usize) -> f32 {
        let ya = &y[slice];
        let d8 = ya.delta();
        let mut acc = 0.0f32;
        for half in 0..2 {
            // Sub-blocks are 16 wide, so one activation block spans two.
            let j = 2 * slice + half;
            let (sumi, sumy) = k_partial(ya, 16 * j, 16, |i| self.code(i));
            let (step, offset) = self.sub_block(j);
            acc += d8 * (step * sumi as f32 - offset * sumy as f32);
        }
        acc
    }
}

impl VecDotQ8_1 for BlockQ3K {
    const SLICES: usize = 8;

    fn vec_dot_q8_1(&self, y: &[BlockQ8_1], slice: usize) -> f32 {
        let ya = &y[slice];
        let mut acc = 0.0f32;
        for half in 0..2 {
            let j = 2 * slice + half;
            let (sumi, _) = k_partial(ya, 16 * j, 16, |i| self.code(i));
            acc += self.sub_scale(j) * sumi as f32;
        }
        ya.delta() * acc
    }
}

impl VecDotQ8_1 for BlockQ4K {
    const SLICES: usize = 8;

    fn vec_dot_q8_1(&self, y: &[BlockQ8_1], slice: usize) -> f32 {
        let ya = &y[slice];
        let (sumi, _) = k_partial(ya, 32 * slice, 32, |i| self.code(i));
        let (step, offset) = self.sub_block(slice);
        step * ya.delta() * sumi as f32 - offset * ya.sum()
    }
}

impl VecDotQ8_1 for BlockQ5K {
    const SLICES: usize = 8;

    fn vec_dot_q8_1(&self, y: &[BlockQ8_1], slice: usize) -> f32 {
        let ya = &y[slice];
        let (sumi, _) = k_partial(ya, 32 * slice, 32, |i| self.code(i));
        let (step, offset) = self.sub_block(slice);
        step * ya.delta() * sumi as f32 - offset * ya.sum()
    }
}

impl VecDotQ8_1 for BlockQ6K {
    const SLICES: usize = 8;

    fn vec_dot_q8_1(&self, y: &[BlockQ8_1], slice: usize) -> f32 {
        let ya = &y[slice];
        let mut acc = 0.0f32;
        for half in 0..2 {
            let j = 2 * slice + half;
            let (sumi, _) = k_partial(ya, 16 * j, 16, |i| self.code(i));
            acc += self.sub_scale(j) * sumi as f32;
        }
        ya.delta() * acc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quant::QK_K;

    fn values(n: usize, seed: u32, scale: f32) -> Vec<f32> {
        let mut s = seed;
        (0..n)
            .map(|_| {
                s = s.wrapping_mul(22_695_477).wrapping_add(1);
                (((s >> 9) % 4001) as f32 / 2000.0 - 1.0) * scale
            })
            .collect()
    }

    /// Compare the integer dot against a float dot of the decoded operands.
    fn check<B: VecDotQ8_1>() {
        for seed in 0..8 {
            let w = values(B::QK, seed, 2.0);
            let a = values(B::QK, seed + 100, 1.5);
            let wb = B::quantize(&w);
            let ab: Vec<BlockQ8_1> = a.chunks_exact(QK).map(BlockQ8_1::quantize).collect();

            let mut wd = vec![0.0f32; B::QK];
            wb.dequantize(&mut wd);
            let mut ad = vec![0.0f32; B::QK];
            for (blk, out) in ab.iter().zip(ad.chunks_exact_mut(QK)) {
                blk.dequantize(out);
            }
            let reference: f32 = wd.iter().zip(&ad).map(|(x, y)| x * y).sum();
            let magnitude: f32 = wd.iter().zip(&ad).map(|(x, y)| (x * y).abs()).sum();

            let got = wb.vec_dot_q8_1_full(&ab);
            let tol = magnitude * 2e-3 + 1e-4;
            assert!(
                (got - reference).abs() <= tol,
                "{}: got {} expected {} (seed {})",
                B::TYPE,
                got,
                reference,
                seed
            );
        }
    }

    #[test]
    fn test_simple_formats_match_float_dot() {
        check::<BlockQ4_0>();
        check::<BlockQ4_1>();
        check::<BlockQ5_0>();
        check::<BlockQ5_1>();
        check::<BlockQ8_0>();
    }

    #[test]
    fn test_k_formats_match_float_dot() {
        check::<BlockQ2K>();
        check::<BlockQ3K>();
        check::<BlockQ4K>();
        check::<BlockQ5K>();
        check::<BlockQ6K>();
    }

    #[test]
    fn test_slices_cover_every_element_once() {
        let mut seen = [0u32; QK];
        for s in 0..2 {
            for i in half_columns(s, 2) {
                seen[i] += 1;
            }
        }
        assert!(seen.iter().all(|&c| c == 1));
        assert_eq!(QK_K / QK, BlockQ4K::SLICES);
    }
}
