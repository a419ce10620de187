//! Errors raised by the tied transposed-convolution layer.

use thiserror::Error;

/// Failures surfaced while configuring, building or invoking a layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayerError {
    #[error("inputs should have rank 4; received input shape: {shape}")]
    InvalidRank { shape: String },
    #[error("the channel dimension of the inputs should be defined, found `None`")]
    UndefinedChannel,
    #[error("tied layer `{0}` is not registered")]
    TiedLayerNotFound(String),
    #[error("layer has not been built; call `build` or `call` first")]
    NotBuilt,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
}

impl LayerError {
    pub(crate) fn invalid_rank(shape: &[Option<usize>]) -> Self {
        Self::InvalidRank {
            shape: format_shape(shape),
        }
    }
}

/// Render a partially known shape as `(None, 10, 10, 4)`.
pub fn format_shape(shape: &[Option<usize>]) -> String {
    let dims: Vec<String> = shape
        .iter()
        .map(|d| match d {
            Some(v) => v.to_string(),
            None => "None".to_string(),
        })
        .collect();
    format!("({})", dims.join(", "))
}

pub type Result<T> = std::result::Result<T, LayerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_error_names_the_shape() {
        let err = LayerError::invalid_rank(&[None, Some(10), Some(4)]);
        assert_eq!(
            err.to_string(),
            "inputs should have rank 4; received input shape: (None, 10, 4)"
        );
    }
}
