//! Conversion kernels: activation quantization to Q8_1 and decoding of
//! stored data into a dense precision.

use half::{bf16, f16};

use super::{kernel_error, launch};
use crate::config::Precision;
use crate::device::{DevicePtr, Driver, Stream};
use crate::quant::{
    convert_to_bytes, quantize_row_q8_1_padded, tensor_byte_size, BlockQ8_1, GgmlType,
    MATRIX_ROW_PADDING, QK,
};

/// Elements of an activation row after padding.
pub fn padded_len(ne10: usize) -> usize {
    (ne10 + MATRIX_ROW_PADDING - 1) / MATRIX_ROW_PADDING * MATRIX_ROW_PADDING
}

/// Bytes of one padded Q8_1 activation row.
pub fn q8_1_row_bytes(ne10: usize) -> usize {
    padded_len(ne10) / QK * std::mem::size_of::<BlockQ8_1>()
}

/// Bytes a quantized matmul kernel reads from Q8_1 activations: `ncols_y`
/// columns starting `y_stride` blocks apart, each covering `ncols_x` values.
pub fn q8_1_span_bytes(ncols_x: usize, ncols_y: usize, y_stride: usize) -> usize {
    match ncols_y {
        0 => 0,
        n => ((n - 1) * y_stride + ncols_x / QK) * std::mem::size_of::<BlockQ8_1>(),
    }
}

/// Quantize `ncols` contiguous f32 rows of `ne10` values at `src` into
/// padded Q8_1 rows at `dst`.
pub fn launch_quantize_q8_1(
    driver: &dyn Driver,
    stream: Stream,
    src: DevicePtr,
    dst: DevicePtr,
    ne10: usize,
    ncols: usize,
) {
    let row_bytes = q8_1_row_bytes(ne10);
    launch(driver, stream, "quantize_q8_1", move |heap| {
        let x = heap.read_f32(src, ne10 * ncols)?;
        let out = heap.bytes_mut(dst, row_bytes * ncols)?;
        for (row, chunk) in x.chunks_exact(ne10.max(1)).zip(out.chunks_exact_mut(row_bytes)) {
            chunk.copy_from_slice(&quantize_row_q8_1_padded(row));
        }
        Ok(())
    });
}

/// Decode `n_elements` values stored as `ty` at `src` into `precision` at `dst`.
pub fn launch_convert(
    driver: &dyn Driver,
    stream: Stream,
    ty: GgmlType,
    src: DevicePtr,
    dst: DevicePtr,
    n_elements: usize,
    precision: Precision,
) {
    let name = match precision {
        Precision::F32 => "convert_f32",
        Precision::F16 => "convert_f16",
        Precision::BF16 => "convert_bf16",
    };
    let src_bytes = tensor_byte_size(ty, n_elements);
    launch(driver, stream, name, move |heap| {
        let data = heap.read_bytes(src, src_bytes)?;
        let converted = match precision {
            Precision::F32 => convert_to_bytes::<f32>(ty, &data, n_elements),
            Precision::F16 => convert_to_bytes::<f16>(ty, &data, n_elements),
            Precision::BF16 => convert_to_bytes::<bf16>(ty, &data, n_elements),
        }
        .map_err(kernel_error(name))?;
        heap.bytes_mut(dst, converted.len())?.copy_from_slice(&converted);
        Ok(())
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimDriver;
    use crate::quant::{as_blocks, quantize, QuantBlock};

    #[test]
    fn test_q8_1_span_bytes() {
        let block = std::mem::size_of::<BlockQ8_1>();
        assert_eq!(q8_1_span_bytes(256, 0, 16), 0);
        assert_eq!(q8_1_span_bytes(256, 1, 16), 8 * block);
        assert_eq!(q8_1_span_bytes(256, 3, 16), (2 * 16 + 8) * block);
    }

    #[test]
    fn test_padding_sizes() {
        assert_eq!(padded_len(1), 512);
        assert_eq!(padded_len(512), 512);
        assert_eq!(padded_len(4096 + 32), 4608);
        assert_eq!(q8_1_row_bytes(64), 16 * 36);
    }

    #[test]
    fn test_quantize_kernel_pads_with_zero_blocks() {
        let driver = SimDriver::uniform(1, 1 << 20, 860);
        let stream = driver.create_stream(0).unwrap();
        let src = driver.malloc(0, 2 * 64 * 4).unwrap();
        let dst = driver.malloc(0, 2 * q8_1_row_bytes(64)).unwrap();
        let values: Vec<u8> = (0..128)
            .flat_map(|i| (i as f32 * 0.5 - 20.0).to_le_bytes())
            .collect();
        driver.memcpy_h2d_async(src, &values, stream).unwrap();
        launch_quantize_q8_1(&driver, stream, src, dst, 64, 2);

        let mut out = vec![0u8; 2 * q8_1_row_bytes(64)];
        driver.memcpy_d2h(&mut out, dst, stream).unwrap();
        let blocks = as_blocks::<BlockQ8_1>(&out).unwrap();
        assert_eq!(blocks.len(), 32);
        // Column 1 starts after the 16 padded blocks of column 0.
        assert!((blocks[16].value_at(0) - 12.0).abs() < 0.2);
        assert!(blocks[2..16].iter().all(|b| b.delta() == 0.0));
    }

    #[test]
    fn test_convert_kernel_matches_host_decode() {
        let driver = SimDriver::uniform(1, 1 << 20, 860);
        let stream = driver.create_stream(0).unwrap();
        let values: Vec<f32> = (0..256).map(|i| (i as f32 - 128.0) / 16.0).collect();
        let packed = quantize(GgmlType::Q4K, &values).unwrap();
        let src = driver.malloc(0, packed.len()).unwrap();
        let dst = driver.malloc(0, 256 * 2).unwrap();
        driver.memcpy_h2d_async(src, &packed, stream).unwrap();
        launch_convert(&driver, stream, GgmlType::Q4K, src, dst, 256, Precision::F16);

        let mut out = vec![0u8; 512];
        driver.memcpy_d2h(&mut out, dst, stream).unwrap();
        let expected = convert_to_bytes::<f16>(GgmlType::Q4K, &packed, 256).unwrap();
        assert_eq!(out, expected);
    }
}
