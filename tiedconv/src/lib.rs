//! Transposed 2D convolution whose kernel is tied to an existing `Conv2d`.
//!
//! A [`TiedConvTranspose2d`] derives its kernel from a convolution registered
//! in a [`LayerRegistry`] instead of learning one, so an encoder convolution
//! and its decoder share a single set of weights.

pub mod activation;
pub mod config;
pub mod deconv;
pub mod error;
pub mod layer;
pub mod registry;
pub mod regularizer;
pub mod shape;

pub use activation::Activation;
pub use config::{image_data_format, set_image_data_format, DataFormat, PaddingMode};
pub use error::LayerError;
pub use layer::{LazyTiedConvTranspose2d, TiedConvTranspose2d, TiedConvTranspose2dConfig};
pub use registry::LayerRegistry;
