//! Mixed-precision decode: any stored type into f32, f16 or bf16.

use half::{bf16, f16};

use super::{as_blocks, check_row, with_block_type, GgmlType, QuantBlock, QK_K};
use crate::error::OffloadError;

/// A floating representation a decoded value can be stored as.
pub trait FloatStore: Copy + Default + Send + Sync + 'static {
    /// Stored size in bytes.
    const SIZE: usize;

    fn from_f32(v: f32) -> Self;
    fn to_f32(self) -> f32;
    fn write_le(self, out: &mut [u8]);
    fn read_le(bytes: &[u8]) -> Self;
}

impl FloatStore for f32 {
    const SIZE: usize = 4;

    #[inline]
    fn from_f32(v: f32) -> Self {
        v
    }
    #[inline]
    fn to_f32(self) -> f32 {
        self
    }
    #[inline]
    fn write_le(self, out: &mut [u8]) {
        out[..4].copy_from_slice(&self.to_le_bytes());
    }
    #[inline]
    fn read_le(bytes: &[u8]) -> Self {
        f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

impl FloatStore for f16 {
    const SIZE: usize = 2;

    #[inline]
    fn from_f32(v: f32) -> Self {
        f16::from_f32(v)
    }
    #[inline]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }
    #[inline]
    fn write_le(self, out: &mut [u8]) {
        out[..2].copy_from_slice(&self.to_bits().to_le_bytes());
    }
    #[inline]
    fn read_le(bytes: &[u8]) -> Self {
        f16::from_bits(u16::from_le_bytes([bytes[0], bytes[1]]))
    }
}

impl FloatStore for bf16 {
    const SIZE: usize = 2;

    #[inline]
    fn from_f32(v: f32) -> Self {
        bf16::from_f32(v)
    }
    #[inline]
    fn to_f32(self) -> f32 {
        bf16::to_f32(self)
    }
    #[inline]
    fn write_le(self, out: &mut [u8]) {
        out[..2].copy_from_slice(&self.to_bits().to_le_bytes());
    }
    #[inline]
    fn read_le(bytes: &[u8]) -> Self {
        bf16::from_bits(u16::from_le_bytes([bytes[0], bytes[1]]))
    }
}

fn decode_blocks<B: QuantBlock, T: FloatStore>(
    src: &[u8],
    dst: &mut [T],
) -> Result<(), OffloadError> {
    let blocks = as_blocks::<B>(src)?;
    if blocks.len() * B::QK != dst.len() {
        return Err(OffloadError::DataLength {
            expected: dst.len() / B::QK * std::mem::size_of::<B>(),
            actual: src.len(),
        });
    }
    let mut tmp = [0.0f32; QK_K];
    for (block, out) in blocks.iter().zip(dst.chunks_exact_mut(B::QK)) {
        block.dequantize(&mut tmp[..B::QK]);
        for (o, &v) in out.iter_mut().zip(&tmp[..B::QK]) {
            *o = T::from_f32(v);
        }
    }
    Ok(())
}

fn decode_dense<T: FloatStore>(
    ty: GgmlType,
    src: &[u8],
    dst: &mut [T],
) -> Result<(), OffloadError> {
    let ts = ty.type_size();
    if src.len() != dst.len() * ts {
        return Err(OffloadError::DataLength {
            expected: dst.len() * ts,
            actual: src.len(),
        });
    }
    for (o, bytes) in dst.iter_mut().zip(src.chunks_exact(ts)) {
        let v = match ty {
            GgmlType::F32 => f32::read_le(bytes),
            GgmlType::F16 => f16::read_le(bytes).to_f32(),
            _ => bf16::read_le(bytes).to_f32(),
        };
        *o = T::from_f32(v);
    }
    Ok(())
}

/// Decode `src` (stored as `ty`) into `dst` in the precision `T`.
///
/// The decode arithmetic is the same for every `T`; only the final store
/// narrows.
pub fn convert_row<T: FloatStore>(
    ty: GgmlType,
    src: &[u8],
    dst: &mut [T],
) -> Result<(), OffloadError> {
    check_row(ty, dst.len())?;
    with_block_type!(ty, B => decode_blocks::<B, T>(src, dst), dense => decode_dense(ty, src, dst))
}

/// Decode into a little-endian byte buffer of `T` values.
pub(crate) fn convert_to_bytes<T: FloatStore>(
    ty: GgmlType,
    src: &[u8],
    n_elements: usize,
) -> Result<Vec<u8>, OffloadError> {
    let mut values = vec![T::default(); n_elements];
    convert_row(ty, src, &mut values)?;
    let mut out = vec![0u8; n_elements * T::SIZE];
    for (v, chunk) in values.iter().zip(out.chunks_exact_mut(T::SIZE)) {
        v.write_le(chunk);
    }
    Ok(out)
}
