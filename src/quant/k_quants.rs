// K-quant super-block formats: 256 values per block, split into sub-blocks
// whose scales are themselves quantized against one or two f16 super-scales.

use super::simple::{inverse, min_max, signed_absmax};
use super::{f16_to_f32, nearest_int, stored_f16, GgmlType, QuantBlock, K_SCALE_SIZE, QK_K};

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Extract the 6-bit scale and min of sub-block `j` from the packed Q4_K /
/// Q5_K scales array.
///
/// The 12 bytes hold 8 (scale, min) pairs. Pairs 0..4 sit in the low 6 bits
/// of bytes 0..8; pairs 4..8 keep their low nibbles in bytes 8..12 and their
/// top two bits in the spare high bits of bytes 0..8.
#[inline]
pub fn get_scale_min_k4(j: usize, scales: &[u8; K_SCALE_SIZE]) -> (u8, u8) {
    if j < 4 {
        (scales[j] & 63, scales[j + 4] & 63)
    } else {
        (
            (scales[j + 4] & 0xF) | ((scales[j - 4] >> 6) << 4),
            (scales[j + 4] >> 4) | ((scales[j] >> 6) << 4),
        )
    }
}

/// Inverse of [`get_scale_min_k4`]. Sub-blocks must be packed in order.
fn set_scale_min_k4(j: usize, ls: u8, lm: u8, scales: &mut [u8; K_SCALE_SIZE]) {
    if j < 4 {
        scales[j] = ls;
        scales[j + 4] = lm;
    } else {
        scales[j + 4] = (ls & 0xF) | ((lm & 0xF) << 4);
        scales[j - 4] |= (ls >> 4) << 6;
        scales[j] |= (lm >> 4) << 6;
    }
}

/// Asymmetric sub-block parameters: per sub-block step and (positive) offset
/// so that `x ≈ step * q - offset` with `q` in `0..=max_code`.
fn affine_params<const N: usize>(x: &[f32], sub: usize, max_code: f32) -> ([f32; N], [f32; N]) {
    let mut steps = [0.0f32; N];
    let mut offsets = [0.0f32; N];
    for (j, chunk) in x.chunks_exact(sub).enumerate().take(N) {
        let (lo, hi) = min_max(chunk);
        let lo = lo.min(0.0);
        steps[j] = (hi - lo) / max_code;
        offsets[j] = -lo;
    }
    (steps, offsets)
}

/// Quantize a sub-scale against a super-scale into `0..=max`.
#[inline]
fn scale_code(v: f32, inv: f32, max: i32) -> u8 {
    nearest_int(v * inv).clamp(0, max) as u8
}

/// Code of `x` under `x ≈ step * q - offset`, clamped to `0..=max`.
#[inline]
fn affine_code(x: f32, step: f32, offset: f32, max: i32) -> u8 {
    if step > 0.0 {
        nearest_int((x + offset) / step).clamp(0, max) as u8
    } else {
        0
    }
}

/// Code of `x` under `x ≈ step * q`, clamped to `lo..=hi`.
#[inline]
fn symmetric_code(x: f32, step: f32, lo: i32, hi: i32) -> i32 {
    if step != 0.0 {
        nearest_int(x / step).clamp(lo, hi)
    } else {
        0
    }
}

fn max_of(v: &[f32]) -> f32 {
    v.iter().copied().fold(0.0, f32::max)
}

fn decode_with<F: Fn(usize) -> f32>(y: &mut [f32], value: F) {
    for (i, out) in y.iter_mut().enumerate().take(QK_K) {
        *out = value(i);
    }
}

// ---------------------------------------------------------------------------
// Q2_K: 84 bytes per super-block of 256 values
// ---------------------------------------------------------------------------

/// Q2_K block: 2-bit codes, 16 sub-blocks of 16 values with 4-bit scale and
/// min codes.
///
/// Element `128n + 32k + l` lives in bits `2k..2k+2` of `qs[32n + l]`.
/// `scales[j]` holds the scale code in the low nibble and the min code in the
/// high nibble. Dequantization: `y = d * sc * q - dmin * m`.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct BlockQ2K {
    pub scales: [u8; QK_K / 16],
    pub qs: [u8; QK_K / 4],
    pub d: u16,
    pub dmin: u16,
}

const _: () = assert!(std::mem::size_of::<BlockQ2K>() == 84);

impl BlockQ2K {
    #[inline]
    pub(crate) fn code(&self, i: usize) -> i32 {
        let n = i / 128;
        let k = (i % 128) / 32;
        let l = i % 32;
        ((self.qs[32 * n + l] >> (2 * k)) & 3) as i32
    }

    /// Decoded step and offset of 16-value sub-block `j`.
    #[inline]
    pub(crate) fn sub_block(&self, j: usize) -> (f32, f32) {
        let sc = self.scales[j];
        (
            f16_to_f32(self.d) * (sc & 0xF) as f32,
            f16_to_f32(self.dmin) * (sc >> 4) as f32,
        )
    }
}

impl QuantBlock for BlockQ2K {
    const TYPE: GgmlType = GgmlType::Q2K;
    const QK: usize = QK_K;

    fn quantize(x: &[f32]) -> Self {
        let (steps, offsets) = affine_params::<16>(x, 16, 3.0);
        let (d_bits, d) = stored_f16(max_of(&steps) / 15.0);
        let (dmin_bits, dmin) = stored_f16(max_of(&offsets) / 15.0);
        let (id, idmin) = (inverse(d), inverse(dmin));

        let mut block = Self::zeroed();
        block.d = d_bits;
        block.dmin = dmin_bits;
        for j in 0..QK_K / 16 {
            let ls = scale_code(steps[j], id, 15);
            let lm = scale_code(offsets[j], idmin, 15);
            block.scales[j] = ls | (lm << 4);
            let step = d * ls as f32;
            let offset = dmin * lm as f32;
            for i in 16 * j..16 * j + 16 {
                let q = affine_code(x[i], step, offset, 3);
                let (n, k, l) = (i / 128, (i % 128) / 32, i % 32);
                block.qs[32 * n + l] |= q << (2 * k);
            }
        }
        block
    }

    fn dequantize(&self, y: &mut [f32]) {
        let mut sub = [(0.0f32, 0.0f32); QK_K / 16];
        for (j, s) in sub.iter_mut().enumerate() {
            *s = self.sub_block(j);
        }
        decode_with(y, |i| {
            let (step, offset) = sub[i / 16];
            step * self.code(i) as f32 - offset
        });
    }
}

// ---------------------------------------------------------------------------
// Q3_K: 110 bytes per super-block of 256 values
// ---------------------------------------------------------------------------

/// Q3_K block: 3-bit signed codes, 16 sub-blocks of 16 values with 6-bit
/// signed scales. No mins.
///
/// The low two bits of element `128n + 32k + l` sit in `qs[32n + l]` at shift
/// `2k`; bit `4n + k` of `hmask[l]` is the high bit. A clear high bit means the
/// low bits are offset by -4. Scales are stored biased by 32: low nibbles in
/// `scales[0..8]`, top two bits in `scales[8..12]`.
/// Dequantization: `y = d * (sc - 32) * q`.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct BlockQ3K {
    pub hmask: [u8; QK_K / 8],
    pub qs: [u8; QK_K / 4],
    pub scales: [u8; K_SCALE_SIZE],
    pub d: u16,
}

const _: () = assert!(std::mem::size_of::<BlockQ3K>() == 110);

impl BlockQ3K {
    /// Signed scale code of sub-block `j` in `-32..=31`.
    #[inline]
    pub(crate) fn scale_code(&self, j: usize) -> i32 {
        let low = if j < 8 {
            self.scales[j] & 0xF
        } else {
            self.scales[j - 8] >> 4
        };
        let high = (self.scales[8 + j % 4] >> (2 * (j / 4))) & 3;
        (low | (high << 4)) as i32 - 32
    }

    /// Signed code of element `i` in `-4..=3`.
    #[inline]
    pub(crate) fn code(&self, i: usize) -> i32 {
        let n = i / 128;
        let k = (i % 128) / 32;
        let l = i % 32;
        let low = ((self.qs[32 * n + l] >> (2 * k)) & 3) as i32;
        if self.hmask[l] & (1 << (4 * n + k)) != 0 {
            low
        } else {
            low - 4
        }
    }

    #[inline]
    pub(crate) fn sub_scale(&self, j: usize) -> f32 {
        f16_to_f32(self.d) * self.scale_code(j) as f32
    }
}

impl QuantBlock for BlockQ3K {
    const TYPE: GgmlType = GgmlType::Q3K;
    const QK: usize = QK_K;

    fn quantize(x: &[f32]) -> Self {
        // Each sub-block's signed extreme maps to code -4.
        let mut steps = [0.0f32; QK_K / 16];
        for (j, chunk) in x.chunks_exact(16).enumerate() {
            steps[j] = signed_absmax(chunk).1 / -4.0;
        }
        let (_, smax) = signed_absmax(&steps);
        let (d_bits, d) = stored_f16(smax / -32.0);
        let id = inverse(d);

        let mut block = Self::zeroed();
        block.d = d_bits;
        for j in 0..QK_K / 16 {
            let ls = nearest_int(steps[j] * id).clamp(-32, 31);
            let biased = (ls + 32) as u8;
            if j < 8 {
                block.scales[j] |= biased & 0xF;
            } else {
                block.scales[j - 8] |= (biased & 0xF) << 4;
            }
            block.scales[8 + j % 4] |= (biased >> 4) << (2 * (j / 4));

            let step = d * ls as f32;
            for i in 16 * j..16 * j + 16 {
                let u = (symmetric_code(x[i], step, -4, 3) + 4) as u8;
                let (n, k, l) = (i / 128, (i % 128) / 32, i % 32);
                block.qs[32 * n + l] |= (u & 3) << (2 * k);
                if u > 3 {
                    block.hmask[l] |= 1 << (4 * n + k);
                }
            }
        }
        block
    }

    fn dequantize(&self, y: &mut [f32]) {
        let mut sub = [0.0f32; QK_K / 16];
        for (j, s) in sub.iter_mut().enumerate() {
            *s = self.sub_scale(j);
        }
        decode_with(y, |i| sub[i / 16] * self.code(i) as f32);
    }
}

// ---------------------------------------------------------------------------
// Q4_K: 144 bytes per super-block of 256 values
// ---------------------------------------------------------------------------

/// Q4_K block: 4-bit codes, 8 sub-blocks of 32 values with 6-bit packed
/// scales and mins.
///
/// Pair `p` of sub-blocks shares `qs[32p..32p + 32]`: the low nibbles hold
/// sub-block `2p`, the high nibbles sub-block `2p + 1`.
/// Dequantization: `y = d * sc * q - dmin * m`.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct BlockQ4K {
    pub d: u16,
    pub dmin: u16,
    pub scales: [u8; K_SCALE_SIZE],
    pub qs: [u8; QK_K / 2],
}

const _: () = assert!(std::mem::size_of::<BlockQ4K>() == 144);

/// Position of element `i` in the paired-nibble layout: byte column, and
/// whether it is the high half of its pair.
#[inline]
fn nibble_pos(i: usize) -> (usize, usize, bool) {
    let p = i / 64;
    let l = i % 32;
    (p, l, i % 64 >= 32)
}

/// Step and offset of 32-value sub-block `j` of a Q4_K / Q5_K block.
#[inline]
fn k4_sub_block(d: u16, dmin: u16, scales: &[u8; K_SCALE_SIZE], j: usize) -> (f32, f32) {
    let (sc, m) = get_scale_min_k4(j, scales);
    (f16_to_f32(d) * sc as f32, f16_to_f32(dmin) * m as f32)
}

/// Shared encoder for Q4_K and Q5_K. Returns `(d, dmin, scales, codes)`.
fn quantize_k4(x: &[f32], max_code: i32) -> (u16, u16, [u8; K_SCALE_SIZE], [u8; QK_K]) {
    let (steps, offsets) = affine_params::<8>(x, 32, max_code as f32);
    let (d_bits, d) = stored_f16(max_of(&steps) / 63.0);
    let (dmin_bits, dmin) = stored_f16(max_of(&offsets) / 63.0);
    let (id, idmin) = (inverse(d), inverse(dmin));

    let mut scales = [0u8; K_SCALE_SIZE];
    let mut codes = [0u8; QK_K];
    for j in 0..QK_K / 32 {
        let ls = scale_code(steps[j], id, 63);
        let lm = scale_code(offsets[j], idmin, 63);
        set_scale_min_k4(j, ls, lm, &mut scales);
        let step = d * ls as f32;
        let offset = dmin * lm as f32;
        for i in 32 * j..32 * j + 32 {
            codes[i] = affine_code(x[i], step, offset, max_code);
        }
    }
    (d_bits, dmin_bits, scales, codes)
}

impl BlockQ4K {
    #[inline]
    pub(crate) fn code(&self, i: usize) -> i32 {
        let (p, l, high) = nibble_pos(i);
        let byte = self.qs[32 * p + l];
        (if high { byte >> 4 } else { byte & 0xF }) as i32
    }

    #[inline]
    pub(crate) fn sub_block(&self, j: usize) -> (f32, f32) {
        k4_sub_block(self.d, self.dmin, &self.scales, j)
    }
}

impl QuantBlock for BlockQ4K {
    const TYPE: GgmlType = GgmlType::Q4K;
    const QK: usize = QK_K;

    fn quantize(x: &[f32]) -> Self {
        let (d, dmin, scales, codes) = quantize_k4(x, 15);
        let mut qs = [0u8; QK_K / 2];
        for (i, &q) in codes.iter().enumerate() {
            let (p, l, high) = nibble_pos(i);
            qs[32 * p + l] |= if high { q << 4 } else { q };
        }
        Self {
            d,
            dmin,
            scales,
            qs,
        }
    }

    fn dequantize(&self, y: &mut [f32]) {
        let q = &self.qs;
        let mut out = 0usize;
        for p in 0..4 {
            // 64 values per pair of sub-blocks
            let (d1, m1) = self.sub_block(2 * p);
            let (d2, m2) = self.sub_block(2 * p + 1);
            for l in 0..32 {
                y[out + l] = d1 * (q[32 * p + l] & 0xF) as f32 - m1;
                y[out + 32 + l] = d2 * (q[32 * p + l] >> 4) as f32 - m2;
            }
            out += 64;
        }
    }
}

// ---------------------------------------------------------------------------
// Q5_K: 176 bytes per super-block of 256 values
// ---------------------------------------------------------------------------

/// Q5_K block: Q4_K plus a fifth code bit per element.
///
/// Bit `2p` of `qh[l]` extends the low-nibble element of pair `p`, bit
/// `2p + 1` the high-nibble one.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct BlockQ5K {
    pub d: u16,
    pub dmin: u16,
    pub scales: [u8; K_SCALE_SIZE],
    pub qh: [u8; QK_K / 8],
    pub qs: [u8; QK_K / 2],
}

const _: () = assert!(std::mem::size_of::<BlockQ5K>() == 176);

impl BlockQ5K {
    #[inline]
    pub(crate) fn code(&self, i: usize) -> i32 {
        let (p, l, high) = nibble_pos(i);
        let byte = self.qs[32 * p + l];
        let low = if high { byte >> 4 } else { byte & 0xF };
        let bit = (self.qh[l] >> (2 * p + high as usize)) & 1;
        (low | (bit << 4)) as i32
    }

    #[inline]
    pub(crate) fn sub_block(&self, j: usize) -> (f32, f32) {
        k4_sub_block(self.d, self.dmin, &self.scales, j)
    }
}

impl QuantBlock for BlockQ5K {
    const TYPE: GgmlType = GgmlType::Q5K;
    const QK: usize = QK_K;

    fn quantize(x: &[f32]) -> Self {
        let (d, dmin, scales, codes) = quantize_k4(x, 31);
        let mut qs = [0u8; QK_K / 2];
        let mut qh = [0u8; QK_K / 8];
        for (i, &q) in codes.iter().enumerate() {
            let (p, l, high) = nibble_pos(i);
            let low = q & 0xF;
            qs[32 * p + l] |= if high { low << 4 } else { low };
            qh[l] |= (q >> 4) << (2 * p + high as usize);
        }
        Self {
            d,
            dmin,
            scales,
            qh,
            qs,
        }
    }

    fn dequantize(&self, y: &mut [f32]) {
        let mut sub = [(0.0f32, 0.0f32); QK_K / 32];
        for (j, s) in sub.iter_mut().enumerate() {
            *s = self.sub_block(j);
        }
        decode_with(y, |i| {
            let (step, offset) = sub[i / 32];
            step * self.code(i) as f32 - offset
        });
    }
}

// ---------------------------------------------------------------------------
// Q6_K: 210 bytes per super-block of 256 values
// ---------------------------------------------------------------------------

/// Q6_K block: 6-bit signed codes, 16 sub-blocks of 16 values with 8-bit
/// signed scales. No mins.
///
/// Within each 128-value half `n`, element `32k + l` takes its low nibble
/// from `ql[64n + l]` (k = 0, 2) or `ql[64n + 32 + l]` (k = 1, 3), low for
/// k < 2, and its top two bits from `qh[32n + l]` at shift `2k`.
/// Dequantization: `y = d * sc * (q - 32)`.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct BlockQ6K {
    pub ql: [u8; QK_K / 2],
    pub qh: [u8; QK_K / 4],
    pub scales: [i8; QK_K / 16],
    pub d: u16,
}

const _: () = assert!(std::mem::size_of::<BlockQ6K>() == 210);

impl BlockQ6K {
    /// Signed code of element `i` in `-32..=31`.
    #[inline]
    pub(crate) fn code(&self, i: usize) -> i32 {
        let n = i / 128;
        let k = (i % 128) / 32;
        let l = i % 32;
        let byte = self.ql[64 * n + 32 * (k & 1) + l];
        let low = if k < 2 { byte & 0xF } else { byte >> 4 };
        let high = (self.qh[32 * n + l] >> (2 * k)) & 3;
        (low | (high << 4)) as i32 - 32
    }

    #[inline]
    pub(crate) fn sub_scale(&self, j: usize) -> f32 {
        f16_to_f32(self.d) * self.scales[j] as f32
    }
}

impl QuantBlock for BlockQ6K {
    const TYPE: GgmlType = GgmlType::Q6K;
    const QK: usize = QK_K;

    fn quantize(x: &[f32]) -> Self {
        let mut steps = [0.0f32; QK_K / 16];
        for (j, chunk) in x.chunks_exact(16).enumerate() {
            steps[j] = signed_absmax(chunk).1 / -32.0;
        }
        let (_, smax) = signed_absmax(&steps);
        let (d_bits, d) = stored_f16(smax / -128.0);
        let id = inverse(d);

        let mut block = Self::zeroed();
        block.d = d_bits;
        for j in 0..QK_K / 16 {
            let ls = nearest_int(steps[j] * id).clamp(-128, 127);
            block.scales[j] = ls as i8;
            let step = d * ls as f32;
            for i in 16 * j..16 * j + 16 {
                let u = (symmetric_code(x[i], step, -32, 31) + 32) as u8;
                let (n, k, l) = (i / 128, (i % 128) / 32, i % 32);
                let low = u & 0xF;
                block.ql[64 * n + 32 * (k & 1) + l] |= if k < 2 { low } else { low << 4 };
                block.qh[32 * n + l] |= (u >> 4) << (2 * k);
            }
        }
        block
    }

    fn dequantize(&self, y: &mut [f32]) {
        let d = f16_to_f32(self.d);
        let ql = &self.ql;
        let qh = &self.qh;
        let sc = &self.scales;
        for n in 0..2 {
            let (lo, hi, s) = (64 * n, 32 * n, 8 * n);
            let out = &mut y[128 * n..128 * n + 128];
            for l in 0..32 {
                let is = l / 16;
                let q1 = ((ql[lo + l] & 0xF) | ((qh[hi + l] & 3) << 4)) as i32 - 32;
                let q2 = ((ql[lo + l + 32] & 0xF) | (((qh[hi + l] >> 2) & 3) << 4)) as i32 - 32;
                let q3 = ((ql[lo + l] >> 4) | (((qh[hi + l] >> 4) & 3) << 4)) as i32 - 32;
                let q4 = ((ql[lo + l + 32] >> 4) | (((qh[hi + l] >> 6) & 3) << 4)) as i32 - 32;
                out[l] = d * sc[s + is] as f32 * q1 as f32;
                out[l + 32] = d * sc[s + is + 2] as f32 * q2 as f32;
                out[l + 64] = d * sc[s + is + 4] as f32 * q3 as f32;
                out[l + 96] = d * sc[s + is + 6] as f32 * q4 as f32;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Q8_K: 292 bytes per super-block of 256 values
// ---------------------------------------------------------------------------

/// Q8_K block: 8-bit codes with an f32 scale and per-16 code sums.
///
/// Used as the activation side of K-quant dot products on the host.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct BlockQ8K {
    pub d: f32,
    pub qs: [i8; QK_K],
    pub bsums: [i16; QK_K / 16],
}

const _: () = assert!(std::mem::size_of::<BlockQ8K>() == 292);

impl QuantBlock for BlockQ8K {
    const TYPE: GgmlType = GgmlType::Q8K;
    const QK: usize = QK_K;

    fn quantize(x: &[f32]) -> Self {
        let (amax, _) = signed_absmax(x);
        let d = amax / 127.0;
        let id = inverse(d);
        let mut qs = [0i8; QK_K];
        for (q, &v) in qs.iter_mut().zip(x) {
            *q = nearest_int(v * id).clamp(-127, 127) as i8;
        }
        let mut bsums = [0i16; QK_K / 16];
        for (sum, chunk) in bsums.iter_mut().zip(qs.chunks_exact(16)) {
            *sum = chunk.iter().map(|&q| q as i16).sum();
        }
        Self { d, qs, bsums }
    }

    fn dequantize(&self, y: &mut [f32]) {
        let d = self.d;
        for (out, &q) in y.iter_mut().zip(&self.qs) {
            *out = q as f32 * d;
        }
    }
}
