//! Block quantization codec: GGML-compatible formats, encode/decode, and the
//! mixed-precision conversion path.
//!
//! Every format is a `#[repr(C, packed)]` block struct implementing
//! [`QuantBlock`]. Row-level entry points ([`quantize_row`],
//! [`dequantize_row`], [`convert_row`]) dispatch on [`GgmlType`] so callers
//! holding raw tensor bytes never need to name a block type.

mod convert;
mod dot;
mod k_quants;
mod simple;

pub use convert::{convert_row, FloatStore};
pub(crate) use convert::convert_to_bytes;
pub use dot::VecDotQ8_1;
pub use k_quants::{get_scale_min_k4, BlockQ2K, BlockQ3K, BlockQ4K, BlockQ5K, BlockQ6K, BlockQ8K};
pub use simple::{BlockQ4_0, BlockQ4_1, BlockQ5_0, BlockQ5_1, BlockQ8_0, BlockQ8_1};

use crate::error::OffloadError;

/// Number of elements per K-quant super-block.
pub const QK_K: usize = 256;

/// Number of elements per simple block.
pub const QK: usize = 32;

/// Size of the packed scale/min array in Q3_K, Q4_K and Q5_K blocks.
pub const K_SCALE_SIZE: usize = 12;

/// Activation rows are padded to a multiple of this many elements before
/// quantization so tiled kernels may read past the logical row end.
pub const MATRIX_ROW_PADDING: usize = 512;

/// Tensor element types understood by the engine.
///
/// Discriminants are the GGML type ids used in model files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u32)]
pub enum GgmlType {
    F32 = 0,
    F16 = 1,
    Q4_0 = 2,
    Q4_1 = 3,
    Q5_0 = 6,
    Q5_1 = 7,
    Q8_0 = 8,
    Q8_1 = 9,
    Q2K = 10,
    Q3K = 11,
    Q4K = 12,
    Q5K = 13,
    Q6K = 14,
    Q8K = 15,
    BF16 = 30,
}

impl GgmlType {
    /// Convert a raw GGML type id into a `GgmlType`.
    pub fn from_u32(v: u32) -> Result<Self, OffloadError> {
        match v {
            0 => Ok(Self::F32),
            1 => Ok(Self::F16),
            2 => Ok(Self::Q4_0),
            3 => Ok(Self::Q4_1),
            6 => Ok(Self::Q5_0),
            7 => Ok(Self::Q5_1),
            8 => Ok(Self::Q8_0),
            9 => Ok(Self::Q8_1),
            10 => Ok(Self::Q2K),
            11 => Ok(Self::Q3K),
            12 => Ok(Self::Q4K),
            13 => Ok(Self::Q5K),
            14 => Ok(Self::Q6K),
            15 => Ok(Self::Q8K),
            30 => Ok(Self::BF16),
            _ => Err(OffloadError::UnknownTensorType(v)),
        }
    }

    /// Number of elements per quantization block (1 for dense types).
    pub fn block_size(self) -> usize {
        match self {
            Self::F32 | Self::F16 | Self::BF16 => 1,
            Self::Q4_0 | Self::Q4_1 | Self::Q5_0 | Self::Q5_1 | Self::Q8_0 | Self::Q8_1 => QK,
            Self::Q2K | Self::Q3K | Self::Q4K | Self::Q5K | Self::Q6K | Self::Q8K => QK_K,
        }
    }

    /// Size in bytes of one block (one element for dense types).
    pub fn type_size(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 | Self::BF16 => 2,
            Self::Q4_0 => std::mem::size_of::<BlockQ4_0>(),
            Self::Q4_1 => std::mem::size_of::<BlockQ4_1>(),
            Self::Q5_0 => std::mem::size_of::<BlockQ5_0>(),
            Self::Q5_1 => std::mem::size_of::<BlockQ5_1>(),
            Self::Q8_0 => std::mem::size_of::<BlockQ8_0>(),
            Self::Q8_1 => std::mem::size_of::<BlockQ8_1>(),
            Self::Q2K => std::mem::size_of::<BlockQ2K>(),
            Self::Q3K => std::mem::size_of::<BlockQ3K>(),
            Self::Q4K => std::mem::size_of::<BlockQ4K>(),
            Self::Q5K => std::mem::size_of::<BlockQ5K>(),
            Self::Q6K => std::mem::size_of::<BlockQ6K>(),
            Self::Q8K => std::mem::size_of::<BlockQ8K>(),
        }
    }

    /// Whether values are stored in quantized blocks.
    pub fn is_quantized(self) -> bool {
        !matches!(self, Self::F32 | Self::F16 | Self::BF16)
    }

    /// Whether the type has an integer dot product against Q8_1 activations.
    ///
    /// Q8_1 and Q8_K are activation formats and never appear as weights.
    pub fn has_vec_dot_q8_1(self) -> bool {
        self.is_quantized() && !matches!(self, Self::Q8_1 | Self::Q8K)
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            Self::F32 => "F32",
            Self::F16 => "F16",
            Self::BF16 => "BF16",
            Self::Q4_0 => "Q4_0",
            Self::Q4_1 => "Q4_1",
            Self::Q5_0 => "Q5_0",
            Self::Q5_1 => "Q5_1",
            Self::Q8_0 => "Q8_0",
            Self::Q8_1 => "Q8_1",
            Self::Q2K => "Q2_K",
            Self::Q3K => "Q3_K",
            Self::Q4K => "Q4_K",
            Self::Q5K => "Q5_K",
            Self::Q6K => "Q6_K",
            Self::Q8K => "Q8_K",
        }
    }

    /// Parse a type name as printed by [`GgmlType::name`] (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        const ALL: [GgmlType; 15] = [
            GgmlType::F32,
            GgmlType::F16,
            GgmlType::BF16,
            GgmlType::Q4_0,
            GgmlType::Q4_1,
            GgmlType::Q5_0,
            GgmlType::Q5_1,
            GgmlType::Q8_0,
            GgmlType::Q8_1,
            GgmlType::Q2K,
            GgmlType::Q3K,
            GgmlType::Q4K,
            GgmlType::Q5K,
            GgmlType::Q6K,
            GgmlType::Q8K,
        ];
        ALL.into_iter().find(|t| t.name().eq_ignore_ascii_case(name))
    }

    /// Bytes needed for one row of `ne0` elements.
    ///
    /// # Panics
    /// Panics if `ne0` is not a multiple of the block size.
    pub fn row_size(self, ne0: usize) -> usize {
        assert!(
            ne0 % self.block_size() == 0,
            "row length {} is not a multiple of the {} block size {}",
            ne0,
            self,
            self.block_size()
        );
        ne0 / self.block_size() * self.type_size()
    }
}

impl std::fmt::Display for GgmlType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Half-precision helpers
// ---------------------------------------------------------------------------

/// Convert IEEE 754 half-precision bits to f32.
#[inline]
pub fn f16_to_f32(bits: u16) -> f32 {
    half::f16::from_bits(bits).to_f32()
}

/// Convert an f32 to IEEE 754 half-precision bits (round to nearest).
#[inline]
pub fn f32_to_f16(value: f32) -> u16 {
    half::f16::from_f32(value).to_bits()
}

/// Round an f32 through f16 and back, returning the value a block will
/// actually store.
#[inline]
pub(crate) fn stored_f16(value: f32) -> (u16, f32) {
    let bits = f32_to_f16(value);
    (bits, f16_to_f32(bits))
}

/// Round-half-away-from-zero to the nearest integer.
#[inline]
pub(crate) fn nearest_int(x: f32) -> i32 {
    x.round() as i32
}

// ---------------------------------------------------------------------------
// Block trait and byte views
// ---------------------------------------------------------------------------

/// A fixed-size packed quantization block.
///
/// Implementors are `#[repr(C, packed)]` structs made only of integer fields,
/// so any byte pattern of the right length is a valid block and byte slices
/// can be viewed as block slices without copying.
pub trait QuantBlock: Copy + Send + Sync + 'static {
    /// The GGML type this block encodes.
    const TYPE: GgmlType;
    /// Elements per block.
    const QK: usize;

    /// Encode exactly `QK` values.
    fn quantize(x: &[f32]) -> Self;

    /// Decode into exactly `QK` values.
    fn dequantize(&self, y: &mut [f32]);

    /// Decode the single element at `index`.
    fn value_at(&self, index: usize) -> f32 {
        assert!(index < Self::QK, "index {} out of block of {}", index, Self::QK);
        let mut buf = [0.0f32; QK_K];
        self.dequantize(&mut buf[..Self::QK]);
        buf[index]
    }

    /// An all-zero block (scale 0, decodes to zeros for every format).
    fn zeroed() -> Self {
        // SAFETY: blocks are packed plain-old-data integer structs; the
        // all-zero bit pattern is a valid value of every field.
        unsafe { std::mem::zeroed() }
    }
}

/// View a byte slice as a slice of blocks.
///
/// Returns an error if the byte length is not a multiple of the block size.
pub fn as_blocks<B: QuantBlock>(data: &[u8]) -> Result<&[B], OffloadError> {
    let block_size = std::mem::size_of::<B>();
    if data.len() % block_size != 0 {
        return Err(OffloadError::DataLength {
            expected: data.len() / block_size * block_size,
            actual: data.len(),
        });
    }
    let n_blocks = data.len() / block_size;
    // SAFETY: B is repr(C, packed) (alignment 1, no padding) and every bit
    // pattern is valid; the length was checked above.
    let blocks = unsafe { std::slice::from_raw_parts(data.as_ptr() as *const B, n_blocks) };
    Ok(blocks)
}

/// View a mutable byte slice as a slice of blocks.
pub fn as_blocks_mut<B: QuantBlock>(data: &mut [u8]) -> Result<&mut [B], OffloadError> {
    let block_size = std::mem::size_of::<B>();
    if data.len() % block_size != 0 {
        return Err(OffloadError::DataLength {
            expected: data.len() / block_size * block_size,
            actual: data.len(),
        });
    }
    let n_blocks = data.len() / block_size;
    // SAFETY: same rationale as `as_blocks`; the exclusive borrow of `data`
    // is carried over to the returned slice.
    let blocks =
        unsafe { std::slice::from_raw_parts_mut(data.as_mut_ptr() as *mut B, n_blocks) };
    Ok(blocks)
}

/// Bytes needed to store `n_elements` values of `ty`.
pub fn tensor_byte_size(ty: GgmlType, n_elements: usize) -> usize {
    let bs = ty.block_size();
    (n_elements + bs - 1) / bs * ty.type_size()
}

// ---------------------------------------------------------------------------
// Row-level dispatch
// ---------------------------------------------------------------------------

/// Expand `$body` once per quantized block type, binding the type to `$b`.
macro_rules! with_block_type {
    ($ty:expr, $b:ident => $body:expr, dense => $dense:expr) => {
        match $ty {
            $crate::quant::GgmlType::Q4_0 => { type $b = $crate::quant::BlockQ4_0; $body }
            $crate::quant::GgmlType::Q4_1 => { type $b = $crate::quant::BlockQ4_1; $body }
            $crate::quant::GgmlType::Q5_0 => { type $b = $crate::quant::BlockQ5_0; $body }
            $crate::quant::GgmlType::Q5_1 => { type $b = $crate::quant::BlockQ5_1; $body }
            $crate::quant::GgmlType::Q8_0 => { type $b = $crate::quant::BlockQ8_0; $body }
            $crate::quant::GgmlType::Q8_1 => { type $b = $crate::quant::BlockQ8_1; $body }
            $crate::quant::GgmlType::Q2K => { type $b = $crate::quant::BlockQ2K; $body }
            $crate::quant::GgmlType::Q3K => { type $b = $crate::quant::BlockQ3K; $body }
            $crate::quant::GgmlType::Q4K => { type $b = $crate::quant::BlockQ4K; $body }
            $crate::quant::GgmlType::Q5K => { type $b = $crate::quant::BlockQ5K; $body }
            $crate::quant::GgmlType::Q6K => { type $b = $crate::quant::BlockQ6K; $body }
            $crate::quant::GgmlType::Q8K => { type $b = $crate::quant::BlockQ8K; $body }
            $crate::quant::GgmlType::F32 | $crate::quant::GgmlType::F16 | $crate::quant::GgmlType::BF16 => $dense,
        }
    };
}
pub(crate) use with_block_type;

fn check_row(ty: GgmlType, n: usize) -> Result<(), OffloadError> {
    if n % ty.block_size() != 0 {
        return Err(OffloadError::RowNotBlockAligned {
            ty,
            row_len: n,
            block: ty.block_size(),
        });
    }
    Ok(())
}

fn quantize_blocks<B: QuantBlock>(src: &[f32], dst: &mut [u8]) -> Result<(), OffloadError> {
    let blocks = as_blocks_mut::<B>(dst)?;
    if blocks.len() * B::QK != src.len() {
        return Err(OffloadError::DataLength {
            expected: src.len() / B::QK * std::mem::size_of::<B>(),
            actual: blocks.len() * std::mem::size_of::<B>(),
        });
    }
    for (block, chunk) in blocks.iter_mut().zip(src.chunks_exact(B::QK)) {
        *block = B::quantize(chunk);
    }
    Ok(())
}

/// Encode `src` into `dst` as `ty`.
///
/// `src.len()` must be a multiple of the block size and `dst` must be exactly
/// `tensor_byte_size(ty, src.len())` bytes.
pub fn quantize_row(ty: GgmlType, src: &[f32], dst: &mut [u8]) -> Result<(), OffloadError> {
    check_row(ty, src.len())?;
    let expected = tensor_byte_size(ty, src.len());
    if dst.len() != expected {
        return Err(OffloadError::DataLength {
            expected,
            actual: dst.len(),
        });
    }
    with_block_type!(ty, B => quantize_blocks::<B>(src, dst), dense => {
        for (i, &v) in src.iter().enumerate() {
            match ty {
                GgmlType::F32 => dst[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes()),
                GgmlType::F16 => dst[i * 2..i * 2 + 2]
                    .copy_from_slice(&half::f16::from_f32(v).to_bits().to_le_bytes()),
                _ => dst[i * 2..i * 2 + 2]
                    .copy_from_slice(&half::bf16::from_f32(v).to_bits().to_le_bytes()),
            }
        }
        Ok(())
    })
}

/// Encode a row and return the packed bytes.
pub fn quantize(ty: GgmlType, src: &[f32]) -> Result<Vec<u8>, OffloadError> {
    check_row(ty, src.len())?;
    let mut out = vec![0u8; tensor_byte_size(ty, src.len())];
    quantize_row(ty, src, &mut out)?;
    Ok(out)
}

/// Decode `src` bytes of type `ty` into f32 values.
pub fn dequantize_row(ty: GgmlType, src: &[u8], dst: &mut [f32]) -> Result<(), OffloadError> {
    convert_row::<f32>(ty, src, dst)
}

/// Decode a whole buffer and return the values.
pub fn dequantize(ty: GgmlType, src: &[u8]) -> Result<Vec<f32>, OffloadError> {
    let n = src.len() / ty.type_size() * ty.block_size();
    let mut out = vec![0.0f32; n];
    dequantize_row(ty, src, &mut out)?;
    Ok(out)
}

/// Quantize one activation row to Q8_1, zero-padding it to a multiple of
/// [`MATRIX_ROW_PADDING`] elements.
pub fn quantize_row_q8_1_padded(src: &[f32]) -> Vec<u8> {
    let padded = (src.len() + MATRIX_ROW_PADDING - 1) / MATRIX_ROW_PADDING * MATRIX_ROW_PADDING;
    let n_blocks = padded / QK;
    let mut out = vec![0u8; n_blocks * std::mem::size_of::<BlockQ8_1>()];
    // Lengths are derived above, the view cannot fail.
    if let Ok(blocks) = as_blocks_mut::<BlockQ8_1>(&mut out) {
        let mut tmp = [0.0f32; QK];
        for (ib, block) in blocks.iter_mut().enumerate() {
            for (j, slot) in tmp.iter_mut().enumerate() {
                *slot = src.get(ib * QK + j).copied().unwrap_or(0.0);
            }
            *block = BlockQ8_1::quantize(&tmp);
        }
    }
    out
}
