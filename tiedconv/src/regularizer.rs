//! Weight penalties and projections for the bias vector and the layer output.

use burn::prelude::*;
use serde::{Deserialize, Serialize};

const NORM_EPSILON: f64 = 1e-7;

/// Penalty added to the training loss.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regularizer {
    /// `l1 * sum(|x|)`
    L1 { l1: f64 },
    /// `l2 * sum(x^2)`
    L2 { l2: f64 },
    L1L2 { l1: f64, l2: f64 },
}

impl Regularizer {
    /// Scalar penalty (shape `[1]`) for a tensor of any rank.
    pub fn penalty<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, 1> {
        match *self {
            Self::L1 { l1 } => x.abs().sum().mul_scalar(l1),
            Self::L2 { l2 } => x.powf_scalar(2.0).sum().mul_scalar(l2),
            Self::L1L2 { l1, l2 } => {
                let l1_term = x.clone().abs().sum().mul_scalar(l1);
                l1_term + x.powf_scalar(2.0).sum().mul_scalar(l2)
            }
        }
    }
}

/// Projection applied to the bias vector after an update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    NonNeg,
    /// Rescale so the L2 norm does not exceed `max_value`.
    MaxNorm { max_value: f64 },
    UnitNorm,
}

impl Constraint {
    pub fn apply<B: Backend>(&self, x: Tensor<B, 1>) -> Tensor<B, 1> {
        match *self {
            Self::NonNeg => x.clamp_min(0.0),
            Self::MaxNorm { max_value } => {
                let norm = l2_norm(x.clone());
                let desired = norm.clone().clamp(0.0, max_value);
                x * (desired / norm.add_scalar(NORM_EPSILON))
            }
            Self::UnitNorm => {
                let norm = l2_norm(x.clone());
                x / norm.add_scalar(NORM_EPSILON)
            }
        }
    }
}

fn l2_norm<B: Backend>(x: Tensor<B, 1>) -> Tensor<B, 1> {
    x.powf_scalar(2.0).sum().sqrt()
}
