// Single-level block formats: 32 values per block, one f16 delta and an
// optional f16 minimum.

use super::{f16_to_f32, nearest_int, stored_f16, GgmlType, QuantBlock, QK};

/// Largest absolute value and the signed value it came from.
pub(super) fn signed_absmax(x: &[f32]) -> (f32, f32) {
    let mut amax = 0.0f32;
    let mut max = 0.0f32;
    for &v in x {
        if v.abs() > amax {
            amax = v.abs();
            max = v;
        }
    }
    (amax, max)
}

pub(super) fn min_max(x: &[f32]) -> (f32, f32) {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for &v in x {
        min = min.min(v);
        max = max.max(v);
    }
    (min, max)
}

#[inline]
pub(super) fn inverse(d: f32) -> f32 {
    if d != 0.0 {
        1.0 / d
    } else {
        0.0
    }
}

// ---------------------------------------------------------------------------
// Q4_0: 18 bytes per block of 32 values
// ---------------------------------------------------------------------------

/// Q4_0 block: 4-bit codes with an offset of 8 and one f16 delta.
///
/// Layout: `d: f16 | qs: [u8; 16]` = 18 bytes. The low nibble of `qs[j]` holds
/// element `j`, the high nibble element `j + 16`.
/// Dequantization: `y = (q - 8) * d`.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct BlockQ4_0 {
    pub d: u16,
    pub qs: [u8; QK / 2],
}

const _: () = assert!(std::mem::size_of::<BlockQ4_0>() == 18);

impl QuantBlock for BlockQ4_0 {
    const TYPE: GgmlType = GgmlType::Q4_0;
    const QK: usize = QK;

    fn quantize(x: &[f32]) -> Self {
        // The max-abs value maps to code 0 (-8); its mirror clips at 15.
        let (_, max) = signed_absmax(x);
        let (d_bits, d) = stored_f16(max / -8.0);
        let id = inverse(d);
        let mut qs = [0u8; QK / 2];
        for j in 0..QK / 2 {
            let q0 = ((x[j] * id + 8.5).floor() as i32).clamp(0, 15) as u8;
            let q1 = ((x[j + QK / 2] * id + 8.5).floor() as i32).clamp(0, 15) as u8;
            qs[j] = q0 | (q1 << 4);
        }
        Self { d: d_bits, qs }
    }

    fn dequantize(&self, y: &mut [f32]) {
        let d = f16_to_f32(self.d);
        for j in 0..QK / 2 {
            let low = (self.qs[j] & 0x0F) as i32 - 8;
            let high = (self.qs[j] >> 4) as i32 - 8;
            y[j] = low as f32 * d;
            y[j + QK / 2] = high as f32 * d;
        }
    }
}

// ---------------------------------------------------------------------------
// Q4_1: 20 bytes per block of 32 values
// ---------------------------------------------------------------------------

/// Q4_1 block: 4-bit codes with f16 delta `d` and f16 minimum `m`.
///
/// Layout: `d: f16 | m: f16 | qs: [u8; 16]` = 20 bytes.
/// Dequantization: `y = q * d + m`.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct BlockQ4_1 {
    pub d: u16,
    pub m: u16,
    pub qs: [u8; QK / 2],
}

const _: () = assert!(std::mem::size_of::<BlockQ4_1>() == 20);

impl QuantBlock for BlockQ4_1 {
    const TYPE: GgmlType = GgmlType::Q4_1;
    const QK: usize = QK;

    fn quantize(x: &[f32]) -> Self {
        let (min, max) = min_max(x);
        let (d_bits, d) = stored_f16((max - min) / 15.0);
        let (m_bits, m) = stored_f16(min);
        let id = inverse(d);
        let mut qs = [0u8; QK / 2];
        for j in 0..QK / 2 {
            let q0 = nearest_int((x[j] - m) * id).clamp(0, 15) as u8;
            let q1 = nearest_int((x[j + QK / 2] - m) * id).clamp(0, 15) as u8;
            qs[j] = q0 | (q1 << 4);
        }
        Self {
            d: d_bits,
            m: m_bits,
            qs,
        }
    }

    fn dequantize(&self, y: &mut [f32]) {
        let d = f16_to_f32(self.d);
        let m = f16_to_f32(self.m);
        for j in 0..QK / 2 {
            y[j] = (self.qs[j] & 0x0F) as f32 * d + m;
            y[j + QK / 2] = (self.qs[j] >> 4) as f32 * d + m;
        }
    }
}

// ---------------------------------------------------------------------------
// Q5_0: 22 bytes per block of 32 values
// ---------------------------------------------------------------------------

/// Q5_0 block: 5-bit codes with an offset of 16 and one f16 delta.
///
/// Layout: `d: f16 | qh: [u8; 4] | qs: [u8; 16]` = 22 bytes. Bit `j` of the
/// little-endian `qh` word is the fifth bit of element `j`.
/// Dequantization: `y = (q - 16) * d`.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct BlockQ5_0 {
    pub d: u16,
    pub qh: [u8; 4],
    pub qs: [u8; QK / 2],
}

const _: () = assert!(std::mem::size_of::<BlockQ5_0>() == 22);

impl BlockQ5_0 {
    /// Full 5-bit code of element `i`.
    #[inline]
    pub(crate) fn code(&self, i: usize) -> i32 {
        let qh = u32::from_le_bytes(self.qh);
        let j = i % (QK / 2);
        let nibble = if i < QK / 2 {
            self.qs[j] & 0x0F
        } else {
            self.qs[j] >> 4
        };
        (nibble as i32) | ((((qh >> i) & 1) as i32) << 4)
    }
}

impl QuantBlock for BlockQ5_0 {
    const TYPE: GgmlType = GgmlType::Q5_0;
    const QK: usize = QK;

    fn quantize(x: &[f32]) -> Self {
        let (_, max) = signed_absmax(x);
        let (d_bits, d) = stored_f16(max / -16.0);
        let id = inverse(d);
        let mut qs = [0u8; QK / 2];
        let mut qh = 0u32;
        for j in 0..QK / 2 {
            let q0 = ((x[j] * id + 16.5).floor() as i32).clamp(0, 31) as u32;
            let q1 = ((x[j + QK / 2] * id + 16.5).floor() as i32).clamp(0, 31) as u32;
            qs[j] = ((q0 & 0x0F) | ((q1 & 0x0F) << 4)) as u8;
            qh |= ((q0 & 0x10) >> 4) << j;
            qh |= ((q1 & 0x10) >> 4) << (j + QK / 2);
        }
        Self {
            d: d_bits,
            qh: qh.to_le_bytes(),
            qs,
        }
    }

    fn dequantize(&self, y: &mut [f32]) {
        let d = f16_to_f32(self.d);
        for (i, out) in y.iter_mut().enumerate().take(QK) {
            *out = (self.code(i) - 16) as f32 * d;
        }
    }
}

// ---------------------------------------------------------------------------
// Q5_1: 24 bytes per block of 32 values
// ---------------------------------------------------------------------------

/// Q5_1 block: 5-bit codes with f16 delta and f16 minimum.
///
/// Layout: `d: f16 | m: f16 | qh: [u8; 4] | qs: [u8; 16]` = 24 bytes.
/// Dequantization: `y = q * d + m`.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct BlockQ5_1 {
    pub d: u16,
    pub m: u16,
    pub qh: [u8; 4],
    pub qs: [u8; QK / 2],
}

const _: () = assert!(std::mem::size_of::<BlockQ5_1>() == 24);

impl BlockQ5_1 {
    #[inline]
    pub(crate) fn code(&self, i: usize) -> i32 {
        let qh = u32::from_le_bytes(self.qh);
        let j = i % (QK / 2);
        let nibble = if i < QK / 2 {
            self.qs[j] & 0x0F
        } else {
            self.qs[j] >> 4
        };
        (nibble as i32) | ((((qh >> i) & 1) as i32) << 4)
    }
}

impl QuantBlock for BlockQ5_1 {
    const TYPE: GgmlType = GgmlType::Q5_1;
    const QK: usize = QK;

    fn quantize(x: &[f32]) -> Self {
        let (min, max) = min_max(x);
        let (d_bits, d) = stored_f16((max - min) / 31.0);
        let (m_bits, m) = stored_f16(min);
        let id = inverse(d);
        let mut qs = [0u8; QK / 2];
        let mut qh = 0u32;
        for j in 0..QK / 2 {
            let q0 = nearest_int((x[j] - m) * id).clamp(0, 31) as u32;
            let q1 = nearest_int((x[j + QK / 2] - m) * id).clamp(0, 31) as u32;
            qs[j] = ((q0 & 0x0F) | ((q1 & 0x0F) << 4)) as u8;
            qh |= ((q0 & 0x10) >> 4) << j;
            qh |= ((q1 & 0x10) >> 4) << (j + QK / 2);
        }
        Self {
            d: d_bits,
            m: m_bits,
            qh: qh.to_le_bytes(),
            qs,
        }
    }

    fn dequantize(&self, y: &mut [f32]) {
        let d = f16_to_f32(self.d);
        let m = f16_to_f32(self.m);
        for (i, out) in y.iter_mut().enumerate().take(QK) {
            *out = self.code(i) as f32 * d + m;
        }
    }
}

// ---------------------------------------------------------------------------
// Q8_0: 34 bytes per block of 32 values
// ---------------------------------------------------------------------------

/// Q8_0 block: 8-bit signed codes with one f16 delta.
///
/// Layout: `d: f16 | qs: [i8; 32]` = 34 bytes.
/// Dequantization: `y = q * d`.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct BlockQ8_0 {
    pub d: u16,
    pub qs: [i8; QK],
}

const _: () = assert!(std::mem::size_of::<BlockQ8_0>() == 34);

fn quantize_i8(x: &[f32], id: f32) -> [i8; QK] {
    let mut qs = [0i8; QK];
    for (q, &v) in qs.iter_mut().zip(x) {
        *q = nearest_int(v * id).clamp(-127, 127) as i8;
    }
    qs
}

impl QuantBlock for BlockQ8_0 {
    const TYPE: GgmlType = GgmlType::Q8_0;
    const QK: usize = QK;

    fn quantize(x: &[f32]) -> Self {
        let (amax, _) = signed_absmax(x);
        let (d_bits, d) = stored_f16(amax / 127.0);
        Self {
            d: d_bits,
            qs: quantize_i8(x, inverse(d)),
        }
    }

    fn dequantize(&self, y: &mut [f32]) {
        let d = f16_to_f32(self.d);
        for (out, &q) in y.iter_mut().zip(&self.qs) {
            *out = q as f32 * d;
        }
    }
}

// ---------------------------------------------------------------------------
// Q8_1: 36 bytes per block of 32 values (activation format)
// ---------------------------------------------------------------------------

/// Q8_1 block: Q8_0 plus `s = d * sum(qs)`.
///
/// Layout: `d: f16 | s: f16 | qs: [i8; 32]` = 36 bytes. `s` is the block's
/// sum of decoded values; integer dot kernels use it to cancel the zero
/// point or minimum of the weight block.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct BlockQ8_1 {
    pub d: u16,
    pub s: u16,
    pub qs: [i8; QK],
}

const _: () = assert!(std::mem::size_of::<BlockQ8_1>() == 36);

impl BlockQ8_1 {
    /// Scale as f32.
    #[inline]
    pub fn delta(&self) -> f32 {
        f16_to_f32(self.d)
    }

    /// Sum of decoded values as f32.
    #[inline]
    pub fn sum(&self) -> f32 {
        f16_to_f32(self.s)
    }
}

impl QuantBlock for BlockQ8_1 {
    const TYPE: GgmlType = GgmlType::Q8_1;
    const QK: usize = QK;

    fn quantize(x: &[f32]) -> Self {
        let (amax, _) = signed_absmax(x);
        let (d_bits, d) = stored_f16(amax / 127.0);
        let qs = quantize_i8(x, inverse(d));
        let sum: i32 = qs.iter().map(|&q| q as i32).sum();
        Self {
            d: d_bits,
            s: stored_f16(sum as f32 * d).0,
            qs,
        }
    }

    fn dequantize(&self, y: &mut [f32]) {
        let d = f16_to_f32(self.d);
        for (out, &q) in y.iter_mut().zip(&self.qs) {
            *out = q as f32 * d;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(seed: u32, scale: f32) -> [f32; QK] {
        let mut out = [0.0f32; QK];
        let mut s = seed;
        for v in out.iter_mut() {
            s = s.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            *v = ((s >> 8) % 2001) as f32 / 1000.0 - 1.0;
            *v *= scale;
        }
        out
    }

    fn decode<B: QuantBlock>(b: &B) -> [f32; QK] {
        let mut y = [0.0f32; QK];
        b.dequantize(&mut y);
        y
    }

    fn max_err(x: &[f32], y: &[f32]) -> f32 {
        x.iter().zip(y).map(|(a, b)| (a - b).abs()).fold(0.0, f32::max)
    }

    #[test]
    fn test_q8_0_identical_values_within_one_step() {
        // 32 copies of v decode to v within one code step.
        for v in [0.37f32, -5.0, 1234.5, 0.01] {
            let x = [v; QK];
            let b = BlockQ8_0::quantize(&x);
            let d = f16_to_f32(b.d);
            for y in decode(&b) {
                assert!((y - v).abs() <= d, "v={} y={} d={}", v, y, d);
            }
        }
    }

    #[test]
    fn test_q8_0_error_within_half_step() {
        for seed in 0..20 {
            let x = sample(seed, 3.0);
            let b = BlockQ8_0::quantize(&x);
            let d = f16_to_f32(b.d);
            assert!(max_err(&x, &decode(&b)) <= d * 0.501);
        }
    }

    #[test]
    fn test_q8_1_sum_side_value() {
        let x = sample(7, 2.0);
        let b = BlockQ8_1::quantize(&x);
        let decoded: f32 = decode(&b).iter().sum();
        assert!((b.sum() - decoded).abs() <= decoded.abs() * 1e-3 + 1e-2);
        assert!(max_err(&x, &decode(&b)) <= b.delta() * 0.501);
    }

    #[test]
    fn test_q4_0_error_within_one_step() {
        for seed in 0..20 {
            let x = sample(seed, 1.5);
            let b = BlockQ4_0::quantize(&x);
            let d = f16_to_f32(b.d).abs();
            assert!(max_err(&x, &decode(&b)) <= d * 1.01, "seed {}", seed);
        }
    }

    #[test]
    fn test_q4_0_known_layout() {
        let mut b = BlockQ4_0::zeroed();
        b.d = crate::quant::f32_to_f16(1.0);
        for j in 0..16u8 {
            b.qs[j as usize] = j | (j << 4);
        }
        let y = decode(&b);
        for j in 0..16 {
            assert_eq!(y[j], j as f32 - 8.0);
            assert_eq!(y[j + 16], j as f32 - 8.0);
        }
    }

    #[test]
    fn test_q4_1_error_within_half_step() {
        for seed in 0..20 {
            let x = sample(seed, 4.0);
            let b = BlockQ4_1::quantize(&x);
            let d = f16_to_f32(b.d);
            let (min, max) = min_max(&x);
            let bound = d * 0.5 + (min.abs() + max.abs()) / 1024.0;
            assert!(max_err(&x, &decode(&b)) <= bound, "seed {}", seed);
        }
    }

    #[test]
    fn test_q5_0_error_within_one_step() {
        for seed in 0..20 {
            let x = sample(seed, 0.8);
            let b = BlockQ5_0::quantize(&x);
            let d = f16_to_f32(b.d).abs();
            assert!(max_err(&x, &decode(&b)) <= d * 1.01, "seed {}", seed);
        }
    }

    #[test]
    fn test_q5_1_error_within_half_step() {
        for seed in 0..20 {
            let x = sample(seed, 10.0);
            let b = BlockQ5_1::quantize(&x);
            let d = f16_to_f32(b.d);
            let (min, max) = min_max(&x);
            let bound = d * 0.5 + (min.abs() + max.abs()) / 1024.0;
            assert!(max_err(&x, &decode(&b)) <= bound, "seed {}", seed);
        }
    }

    #[test]
    fn test_q5_0_high_bit_layout() {
        // Value 15 * d needs the fifth bit: code 31.
        let mut x = [0.0f32; QK];
        x[3] = -16.0;
        x[20] = 15.0;
        let b = BlockQ5_0::quantize(&x);
        assert_eq!(b.code(3), 0);
        assert_eq!(b.code(20), 31);
        let y = decode(&b);
        assert_eq!(y[3], -16.0);
        assert_eq!(y[20], 15.0);
    }

    #[test]
    fn test_value_at_matches_block_decode() {
        let x = sample(3, 1.0);
        let b = BlockQ5_1::quantize(&x);
        let y = decode(&b);
        for i in [0, 5, 16, 31] {
            assert_eq!(b.value_at(i), y[i]);
        }
    }
}
