//! Shape arithmetic for transposed convolutions.
//!
//! Shapes are rank-4 arrays of `Option<usize>`; `None` marks a dimension that
//! is only known once a tensor flows through (typically the batch size).

use crate::config::{DataFormat, PaddingMode};
use crate::error::{format_shape, LayerError, Result};

/// Partially known rank-4 shape.
pub type Shape4 = [Option<usize>; 4];

/// Output length of a transposed convolution along one axis.
///
///   valid: `(L - 1) * S + K`
///   same:  `L * S`
pub fn deconv_length(
    len: Option<usize>,
    stride: usize,
    kernel: usize,
    padding: PaddingMode,
) -> Option<usize> {
    let len = len?;
    match padding {
        PaddingMode::Valid => Some(len.saturating_sub(1) * stride + kernel),
        PaddingMode::Same => Some(len * stride),
    }
}

/// Output length of the forward convolution along one axis.
///
/// This is the length a transposed convolution with output length `len`
/// must be fed with.
pub fn conv_output_length(len: usize, kernel: usize, stride: usize, padding: PaddingMode) -> usize {
    match padding {
        PaddingMode::Valid => {
            if len + 1 < kernel {
                0
            } else {
                (len + 1 - kernel).div_ceil(stride)
            }
        }
        PaddingMode::Same => len.div_ceil(stride),
    }
}

/// Reorder a shape from `format` to channels-last.
pub fn to_channels_last<T: Copy>(shape: [T; 4], format: DataFormat) -> [T; 4] {
    match format {
        DataFormat::ChannelsFirst => [shape[0], shape[2], shape[3], shape[1]],
        DataFormat::ChannelsLast => shape,
    }
}

/// Reorder a channels-last shape to `format`.
pub fn from_channels_last<T: Copy>(shape: [T; 4], format: DataFormat) -> [T; 4] {
    match format {
        DataFormat::ChannelsFirst => [shape[0], shape[3], shape[1], shape[2]],
        DataFormat::ChannelsLast => shape,
    }
}

/// Turn a configured or cached output shape into the concrete channels-last
/// shape handed to the transposed-convolution primitive.
///
/// An unresolved batch slot takes `batch`; any other unresolved slot is an error.
pub fn resolve_target_shape(shape: Shape4, format: DataFormat, batch: usize) -> Result<[usize; 4]> {
    let [n, h, w, c] = to_channels_last(shape, format);
    let unresolved = || {
        LayerError::ShapeMismatch(format!(
            "output shape {} has an unresolved non-batch dimension",
            format_shape(&shape)
        ))
    };
    Ok([
        n.unwrap_or(batch),
        h.ok_or_else(unresolved)?,
        w.ok_or_else(unresolved)?,
        c.ok_or_else(unresolved)?,
    ])
}

/// Check an input shape has rank 4 and return it as a fixed array.
pub fn expect_rank4(shape: &[Option<usize>]) -> Result<Shape4> {
    <Shape4>::try_from(shape).map_err(|_| LayerError::invalid_rank(shape))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_length_follows_inverse_conv_formula() {
        for (len, stride, kernel) in [(10, 1, 3), (7, 2, 3), (4, 3, 2), (1, 2, 5)] {
            assert_eq!(
                deconv_length(Some(len), stride, kernel, PaddingMode::Valid),
                Some((len - 1) * stride + kernel)
            );
        }
    }

    #[test]
    fn same_length_is_input_times_stride() {
        for (len, stride, kernel) in [(10, 1, 3), (7, 2, 3), (4, 3, 5)] {
            assert_eq!(
                deconv_length(Some(len), stride, kernel, PaddingMode::Same),
                Some(len * stride)
            );
        }
    }

    #[test]
    fn unknown_length_stays_unknown() {
        assert_eq!(deconv_length(None, 2, 3, PaddingMode::Valid), None);
    }

    #[test]
    fn forward_length_inverts_deconv_length() {
        for padding in [PaddingMode::Valid, PaddingMode::Same] {
            for (len, stride, kernel) in [(10, 1, 3), (7, 2, 3), (4, 3, 2), (5, 2, 4)] {
                let out = deconv_length(Some(len), stride, kernel, padding).unwrap();
                assert_eq!(conv_output_length(out, kernel, stride, padding), len);
            }
        }
    }

    #[test]
    fn channels_first_shape_is_reordered_and_batch_filled() {
        let configured = [None, Some(8), Some(12), Some(14)];
        let resolved = resolve_target_shape(configured, DataFormat::ChannelsFirst, 5).unwrap();
        assert_eq!(resolved, [5, 12, 14, 8]);
    }

    #[test]
    fn channels_last_shape_keeps_explicit_batch() {
        let configured = [Some(2), Some(12), Some(14), Some(8)];
        let resolved = resolve_target_shape(configured, DataFormat::ChannelsLast, 5).unwrap();
        assert_eq!(resolved, [2, 12, 14, 8]);
    }

    #[test]
    fn unresolved_spatial_dimension_is_rejected() {
        let configured = [None, None, Some(14), Some(8)];
        let err = resolve_target_shape(configured, DataFormat::ChannelsLast, 1).unwrap_err();
        assert!(matches!(err, LayerError::ShapeMismatch(_)));
    }

    #[test]
    fn reordering_round_trips() {
        let nhwc = [1, 2, 3, 4];
        let nchw = from_channels_last(nhwc, DataFormat::ChannelsFirst);
        assert_eq!(nchw, [1, 4, 2, 3]);
        assert_eq!(to_channels_last(nchw, DataFormat::ChannelsFirst), nhwc);
    }

    #[test]
    fn rank_other_than_four_is_rejected() {
        let err = expect_rank4(&[Some(1), Some(10), Some(10)]).unwrap_err();
        assert!(matches!(err, LayerError::InvalidRank { .. }));
        assert!(expect_rank4(&[None, Some(10), Some(10), Some(3)]).is_ok());
    }
}
