//! Transposed convolution with an externally supplied kernel.
//!
//! The tied kernel is not owned by a `ConvTranspose2d` module, so the
//! primitive works directly on `(input, kernel)` pairs:
//!   - `DeconvDispatch` picks a backend implementation of the full (unpadded)
//!     transposed convolution. NdArray gets an im2col-style GEMM + col2im path
//!     through ndarray (→ BLAS); other backends use Burn's built-in op.
//!   - `conv_transpose2d_to_shape` crops/pads the full result to an exact
//!     target size with the same alignment as a "valid"/"same" convolution
//!     gradient.
//!
//! Layouts: input `[N, C_in, H, W]`, kernel `[C_in, C_out, KH, KW]`.

use burn::backend::wgpu::Wgpu;
use burn::backend::{Autodiff, NdArray};
use burn::prelude::*;
use burn::tensor::module::conv_transpose2d;
use burn::tensor::ops::ConvTransposeOptions;
use burn::tensor::TensorPrimitive;
use burn_ndarray::{NdArrayTensor, NdArrayTensorFloat};
use ndarray::{ArcArray, Array2, ArrayView2, ArrayViewMut2, IxDyn};

use crate::config::PaddingMode;
use crate::error::{LayerError, Result};
use crate::shape::conv_output_length;

// ── DeconvDispatch trait ─────────────────────────────────────────────────────

/// Backend-specific full transposed convolution.
pub trait DeconvDispatch: Backend {
    /// Output is `[N, C_out, (H - 1) * SH + KH, (W - 1) * SW + KW]`.
    fn conv_transpose2d_full(
        input: Tensor<Self, 4>,
        kernel: Tensor<Self, 4>,
        stride: [usize; 2],
    ) -> Tensor<Self, 4>;
}

impl DeconvDispatch for NdArray {
    fn conv_transpose2d_full(
        input: Tensor<Self, 4>,
        kernel: Tensor<Self, 4>,
        stride: [usize; 2],
    ) -> Tensor<Self, 4> {
        conv_t2d_full_ndarray(input, kernel, stride)
    }
}

impl DeconvDispatch for Wgpu {
    fn conv_transpose2d_full(
        input: Tensor<Self, 4>,
        kernel: Tensor<Self, 4>,
        stride: [usize; 2],
    ) -> Tensor<Self, 4> {
        conv_transpose2d_full_reference(input, kernel, stride)
    }
}

// The GEMM path leaves the autodiff graph, so training goes through Burn's op.
impl DeconvDispatch for Autodiff<NdArray> {
    fn conv_transpose2d_full(
        input: Tensor<Self, 4>,
        kernel: Tensor<Self, 4>,
        stride: [usize; 2],
    ) -> Tensor<Self, 4> {
        conv_transpose2d_full_reference(input, kernel, stride)
    }
}

/// Burn's own transposed convolution with zero padding.
pub fn conv_transpose2d_full_reference<B: Backend>(
    input: Tensor<B, 4>,
    kernel: Tensor<B, 4>,
    stride: [usize; 2],
) -> Tensor<B, 4> {
    let options = ConvTransposeOptions::new(stride, [0, 0], [0, 0], [1, 1], 1);
    conv_transpose2d(input, kernel, None, options)
}

// ── Exact-shape wrapper ──────────────────────────────────────────────────────

/// Transposed convolution producing exactly `target = [height, width]`.
///
/// The target must be consistent with the input: a forward convolution of the
/// target with the same kernel, stride and padding yields the input size.
/// For "same" padding the full result is cropped by `floor(T / 2)` leading
/// rows/columns (`T` = full length minus target); a target larger than the
/// full result is zero-padded at the end.
pub fn conv_transpose2d_to_shape<B: DeconvDispatch>(
    input: Tensor<B, 4>,
    kernel: Tensor<B, 4>,
    target: [usize; 2],
    stride: [usize; 2],
    padding: PaddingMode,
) -> Result<Tensor<B, 4>> {
    let [_, c_in, h_in, w_in] = input.dims();
    let [k_in, _, kh, kw] = kernel.dims();
    if c_in != k_in {
        return Err(LayerError::ShapeMismatch(format!(
            "input has {c_in} channels but the kernel expects {k_in}"
        )));
    }

    for (axis, len_in, len_out, k, s) in [
        ("height", h_in, target[0], kh, stride[0]),
        ("width", w_in, target[1], kw, stride[1]),
    ] {
        let expected = conv_output_length(len_out, k, s, padding);
        if expected != len_in {
            return Err(LayerError::ShapeMismatch(format!(
                "output {axis} {len_out} is incompatible with input {axis} {len_in} \
                 (kernel {k}, stride {s}, padding {padding}); expected input {axis} {expected}"
            )));
        }
    }

    log::debug!(
        "conv_transpose2d: input {:?}, kernel {:?}, target {:?}, stride {:?}, padding {}",
        input.dims(),
        kernel.dims(),
        target,
        stride,
        padding
    );

    let full = B::conv_transpose2d_full(input, kernel, stride);
    let [n, c_out, full_h, full_w] = full.dims();

    let (top, keep_h) = crop_window(full_h, target[0], padding);
    let (left, keep_w) = crop_window(full_w, target[1], padding);

    let mut out = full.slice([0..n, 0..c_out, top..top + keep_h, left..left + keep_w]);
    let (pad_bottom, pad_right) = (target[0] - keep_h, target[1] - keep_w);
    if pad_bottom > 0 || pad_right > 0 {
        out = out.pad((0, pad_right, 0, pad_bottom), 0.0);
    }
    Ok(out)
}

/// Leading offset and kept length when cutting `target` out of `full`.
fn crop_window(full: usize, target: usize, padding: PaddingMode) -> (usize, usize) {
    let start = match padding {
        PaddingMode::Valid => 0,
        PaddingMode::Same => full.saturating_sub(target) / 2,
    };
    (start, target.min(full - start))
}

// ── NdArray fast tensor access ───────────────────────────────────────────────

/// Extract f32 data from a Tensor<NdArray, 4> in logical (row-major) order.
fn nd_extract(tensor: Tensor<NdArray, 4>) -> Vec<f32> {
    let float_prim = tensor.into_primitive().tensor();
    match float_prim {
        NdArrayTensorFloat::F32(t) => arc_to_vec_f32(t.array),
        NdArrayTensorFloat::F64(t) => t.array.iter().map(|&v| v as f32).collect(),
    }
}

fn arc_to_vec_f32(arr: ArcArray<f32, IxDyn>) -> Vec<f32> {
    if arr.is_standard_layout() {
        match arr.try_into_owned_nocopy() {
            Ok(owned) => owned.into_raw_vec_and_offset().0,
            Err(arr) => arr.iter().copied().collect(),
        }
    } else {
        // Permuted views (swapped kernel axes, channels-last inputs) land here.
        arr.iter().copied().collect()
    }
}

fn nd_create(data: Vec<f32>, shape: [usize; 4]) -> Tensor<NdArray, 4> {
    let array = ndarray::ArrayD::from_shape_vec(IxDyn(&shape), data)
        .expect("output buffer length matches its shape")
        .into_shared();
    let nd_tensor = NdArrayTensor::new(array);
    Tensor::from_primitive(TensorPrimitive::Float(NdArrayTensorFloat::F32(nd_tensor)))
}

// ── ConvTranspose2d (NdArray) ────────────────────────────────────────────────

fn conv_t2d_full_ndarray(
    input: Tensor<NdArray, 4>,
    kernel: Tensor<NdArray, 4>,
    stride: [usize; 2],
) -> Tensor<NdArray, 4> {
    let [batch, c_in, h_in, w_in] = input.dims();
    let [_, c_out, kh, kw] = kernel.dims();
    let [sh, sw] = stride;

    let out_h = h_in.saturating_sub(1) * sh + kh;
    let out_w = w_in.saturating_sub(1) * sw + kw;
    let col_k = c_out * kh * kw;
    let spatial_in = h_in * w_in;
    let spatial_out = out_h * out_w;

    let mut output_flat = vec![0.0f32; batch * c_out * spatial_out];
    if spatial_in == 0 || c_in == 0 {
        return nd_create(output_flat, [batch, c_out, out_h, out_w]);
    }

    let weight_nd = Array2::from_shape_vec((c_in, col_k), nd_extract(kernel))
        .expect("kernel buffer length matches its shape");
    let input_data = nd_extract(input);

    // Tile by input rows, 128 MiB of columns per tile.
    let max_floats = 32 * 1024 * 1024;
    let tile_rows = (max_floats / (col_k * w_in).max(1)).max(1).min(h_in);
    let max_tile_spatial = tile_rows * w_in;

    let mut in_tile = vec![0.0f32; c_in * max_tile_spatial];
    let mut col_buf = vec![0.0f32; col_k * max_tile_spatial];

    for b_idx in 0..batch {
        let in_off = b_idx * c_in * spatial_in;
        let out_off = b_idx * c_out * spatial_out;

        for tile_start in (0..h_in).step_by(tile_rows) {
            let tile_h = (tile_start + tile_rows).min(h_in) - tile_start;
            let tile_spatial = tile_h * w_in;

            for c in 0..c_in {
                let src = in_off + c * spatial_in + tile_start * w_in;
                let dst = c * tile_spatial;
                in_tile[dst..dst + tile_spatial]
                    .copy_from_slice(&input_data[src..src + tile_spatial]);
            }

            // ── GEMM: [col_k, c_in] x [c_in, tile] ───────────────
            let in_view =
                ArrayView2::from_shape((c_in, tile_spatial), &in_tile[..c_in * tile_spatial])
                    .expect("input tile matches its shape");
            let mut col_view = ArrayViewMut2::from_shape(
                (col_k, tile_spatial),
                &mut col_buf[..col_k * tile_spatial],
            )
            .expect("column tile matches its shape");
            ndarray::linalg::general_mat_mul(
                1.0f32,
                &weight_nd.t(),
                &in_view,
                0.0f32,
                &mut col_view,
            );

            // ── col2im ────────────────────────────────────────────
            for c in 0..c_out {
                let out_c_base = out_off + c * spatial_out;
                for kkh in 0..kh {
                    for kkw in 0..kw {
                        let col_row = (c * kh * kw + kkh * kw + kkw) * tile_spatial;
                        for th in 0..tile_h {
                            let oh = (tile_start + th) * sh + kkh;
                            let out_row = out_c_base + oh * out_w;
                            let col_src = col_row + th * w_in;

                            let mut ow = kkw;
                            for iw in 0..w_in {
                                output_flat[out_row + ow] += col_buf[col_src + iw];
                                ow += sw;
                            }
                        }
                    }
                }
            }
        }
    }

    nd_create(output_flat, [batch, c_out, out_h, out_w])
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;

    type TestBackend = NdArray;

    fn assert_close(actual: Tensor<TestBackend, 4>, expected: Tensor<TestBackend, 4>) {
        assert_eq!(actual.dims(), expected.dims());
        let a: Vec<f32> = actual.into_data().to_vec().unwrap();
        let e: Vec<f32> = expected.into_data().to_vec().unwrap();
        for (i, (x, y)) in a.iter().zip(e.iter()).enumerate() {
            assert!((x - y).abs() < 1e-4, "element {i}: {x} != {y}");
        }
    }

    #[test]
    fn single_pixel_input_stamps_the_kernel() {
        let device = Default::default();
        let input = Tensor::<TestBackend, 4>::ones([1, 1, 1, 1], &device);
        let kernel = Tensor::<TestBackend, 1>::from_floats([1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &device)
            .reshape([1, 1, 2, 3]);

        let out = TestBackend::conv_transpose2d_full(input, kernel.clone(), [1, 1]);
        assert_close(out, kernel);
    }

    #[test]
    fn fast_path_matches_burn_reference() {
        let device = Default::default();
        for stride in [[1, 1], [2, 2], [3, 2]] {
            let input = Tensor::<TestBackend, 4>::random(
                [2, 3, 5, 4],
                Distribution::Uniform(-1.0, 1.0),
                &device,
            );
            let kernel = Tensor::<TestBackend, 4>::random(
                [3, 2, 3, 2],
                Distribution::Uniform(-1.0, 1.0),
                &device,
            );
            let fast = TestBackend::conv_transpose2d_full(input.clone(), kernel.clone(), stride);
            let reference = conv_transpose2d_full_reference(input, kernel, stride);
            assert_close(fast, reference);
        }
    }

    #[test]
    fn fast_path_handles_permuted_operands() {
        let device = Default::default();
        let input_nhwc = Tensor::<TestBackend, 4>::random(
            [1, 4, 4, 2],
            Distribution::Uniform(-1.0, 1.0),
            &device,
        );
        let kernel = Tensor::<TestBackend, 4>::random(
            [2, 3, 3, 3],
            Distribution::Uniform(-1.0, 1.0),
            &device,
        )
        .swap_dims(2, 3);
        let input = input_nhwc.permute([0, 3, 1, 2]);

        let fast = TestBackend::conv_transpose2d_full(input.clone(), kernel.clone(), [2, 1]);
        let reference = conv_transpose2d_full_reference(input, kernel, [2, 1]);
        assert_close(fast, reference);
    }

    #[test]
    fn same_padding_crops_centered_window() {
        let device = Default::default();
        let input = Tensor::<TestBackend, 4>::random(
            [1, 2, 6, 6],
            Distribution::Uniform(-1.0, 1.0),
            &device,
        );
        let kernel = Tensor::<TestBackend, 4>::random(
            [2, 1, 3, 3],
            Distribution::Uniform(-1.0, 1.0),
            &device,
        );

        let out = conv_transpose2d_to_shape(
            input.clone(),
            kernel.clone(),
            [6, 6],
            [1, 1],
            PaddingMode::Same,
        )
        .unwrap();
        // Same padding with stride 1 and a 3x3 kernel is burn's symmetric padding of 1.
        let options = ConvTransposeOptions::new([1, 1], [1, 1], [0, 0], [1, 1], 1);
        let expected = conv_transpose2d(input, kernel, None, options);
        assert_close(out, expected);
    }

    #[test]
    fn target_beyond_full_output_is_zero_padded() {
        let device = Default::default();
        // Kernel smaller than stride: "same" target 2*3 = 6 exceeds the full length 5.
        let input = Tensor::<TestBackend, 4>::ones([1, 1, 3, 3], &device);
        let kernel = Tensor::<TestBackend, 4>::ones([1, 1, 1, 1], &device);

        let out =
            conv_transpose2d_to_shape(input, kernel, [6, 6], [2, 2], PaddingMode::Same).unwrap();
        assert_eq!(out.dims(), [1, 1, 6, 6]);
        let data: Vec<f32> = out.into_data().to_vec().unwrap();
        let expected: Vec<f32> = (0..36)
            .map(|i| {
                let (r, c) = (i / 6, i % 6);
                if r % 2 == 0 && c % 2 == 0 { 1.0 } else { 0.0 }
            })
            .collect();
        assert_eq!(data, expected);
    }

    #[test]
    fn incompatible_target_is_rejected() {
        let device = Default::default();
        let input = Tensor::<TestBackend, 4>::ones([1, 1, 4, 4], &device);
        let kernel = Tensor::<TestBackend, 4>::ones([1, 1, 3, 3], &device);
        let err = conv_transpose2d_to_shape(input, kernel, [9, 6], [1, 1], PaddingMode::Valid)
            .unwrap_err();
        assert!(matches!(err, LayerError::ShapeMismatch(_)));
    }

    #[test]
    fn channel_mismatch_is_rejected() {
        let device = Default::default();
        let input = Tensor::<TestBackend, 4>::ones([1, 2, 4, 4], &device);
        let kernel = Tensor::<TestBackend, 4>::ones([3, 1, 3, 3], &device);
        let err = conv_transpose2d_to_shape(input, kernel, [6, 6], [1, 1], PaddingMode::Valid)
            .unwrap_err();
        assert!(matches!(err, LayerError::ShapeMismatch(_)));
    }
}
