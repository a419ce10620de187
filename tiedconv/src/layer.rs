//! Transposed 2D convolution whose kernel is tied to an existing `Conv2d`.
//!
//! The layer never learns a kernel of its own. On every forward pass it reads
//! the current kernel of the tied convolution (resolved by name through a
//! [`LayerRegistry`]) and exchanges its two spatial axes. HWIO layouts store
//! those as the leading axes; burn stores convolution kernels as
//! `[out, in, kh, kw]`, so here they are axes 2 and 3. Read as a
//! transposed-convolution kernel (`[in, out, kh, kw]`) the result maps the tied
//! layer's output channels back to its input channels.
//!
//! Lifecycle: a [`LazyTiedConvTranspose2d`] goes from `Unbuilt` to `Built`
//! exactly once, on the first shape-bearing input. The built
//! [`TiedConvTranspose2d`] is a burn `Module` and can be nested in models. The
//! output shape inferred on its first invocation is written once and reused
//! afterwards.

use std::sync::OnceLock;

use burn::config::Config;
use burn::module::{Ignored, Param};
use burn::nn::Initializer;
use burn::prelude::*;
use serde_json::{json, Map, Value};

use crate::activation::Activation;
use crate::config::{image_data_format, DataFormat, PaddingMode};
use crate::deconv::{conv_transpose2d_to_shape, DeconvDispatch};
use crate::error::{self, format_shape, LayerError};
use crate::regularizer::{Constraint, Regularizer};
use crate::registry::LayerRegistry;
use crate::shape::{
    deconv_length, expect_rank4, from_channels_last, resolve_target_shape, Shape4,
};

/// Configuration of a [`TiedConvTranspose2d`].
#[derive(Config, Debug)]
pub struct TiedConvTranspose2dConfig {
    /// Output channels; the input channel count of the tied convolution.
    pub filters: usize,
    /// Spatial size `[height, width]` of the derived kernel.
    pub kernel_size: [usize; 2],
    /// Name of the tied `Conv2d` in the registry.
    pub tied_to: String,
    #[config(default = "[1, 1]")]
    pub strides: [usize; 2],
    #[config(default = "PaddingMode::Valid")]
    pub padding: PaddingMode,
    /// Falls back to the process-wide [`image_data_format`] when unset.
    pub data_format: Option<DataFormat>,
    /// Accepted for parity with ordinary convolutions; not used by the forward pass.
    #[config(default = "[1, 1]")]
    pub dilation_rate: [usize; 2],
    #[config(default = "Activation::Linear")]
    pub activation: Activation,
    #[config(default = true)]
    pub use_bias: bool,
    #[config(default = "Initializer::Zeros")]
    pub bias_initializer: Initializer,
    pub bias_regularizer: Option<Regularizer>,
    pub bias_constraint: Option<Constraint>,
    pub activity_regularizer: Option<Regularizer>,
    /// Fixed output shape in `data_format` order; a `None` batch slot is
    /// replaced by the runtime batch size.
    pub output_shape: Option<Shape4>,
}

impl TiedConvTranspose2dConfig {
    /// Check the convolution hyper-parameters.
    pub fn validate(&self) -> error::Result<()> {
        if self.filters == 0 {
            return Err(LayerError::InvalidConfig("filters must be positive".into()));
        }
        for (name, values) in [
            ("kernel_size", self.kernel_size),
            ("strides", self.strides),
            ("dilation_rate", self.dilation_rate),
        ] {
            if values.contains(&0) {
                return Err(LayerError::InvalidConfig(format!(
                    "{name} values must be positive, got {values:?}"
                )));
            }
        }
        let strided = self.strides.iter().any(|&s| s != 1);
        let dilated = self.dilation_rate.iter().any(|&d| d != 1);
        if strided && dilated {
            return Err(LayerError::InvalidConfig(format!(
                "specifying any stride value != 1 is incompatible with specifying \
                 any dilation_rate value != 1 (strides {:?}, dilation_rate {:?})",
                self.strides, self.dilation_rate
            )));
        }
        Ok(())
    }

    /// Channel ordering, taking the process-wide default when unset.
    pub fn resolved_data_format(&self) -> DataFormat {
        self.data_format.unwrap_or_else(image_data_format)
    }

    fn resolved(&self) -> Self {
        self.clone().with_data_format(Some(self.resolved_data_format()))
    }

    /// Create an unbuilt layer, resolving the channel ordering now.
    pub fn init<B: Backend>(&self) -> error::Result<LazyTiedConvTranspose2d<B>> {
        self.validate()?;
        Ok(LazyTiedConvTranspose2d::Unbuilt(self.resolved()))
    }

    /// Build the layer for inputs of `input_shape`.
    ///
    /// Checks the input against the tied convolution and allocates the bias.
    pub fn build<B: Backend>(
        &self,
        input_shape: &[Option<usize>],
        registry: &LayerRegistry<B>,
    ) -> error::Result<TiedConvTranspose2d<B>> {
        self.validate()?;
        let config = self.resolved();
        let data_format = config.resolved_data_format();

        let shape = expect_rank4(input_shape)?;
        let input_dim = shape[data_format.channel_axis()].ok_or(LayerError::UndefinedChannel)?;

        let [kh, kw] = self.kernel_size;
        let filters = self.filters;
        // Shape a separately learned kernel would have; the tied kernel replaces it.
        let kernel_shape = [kh, kw, filters, input_dim];

        let kernel = config.tied_kernel(registry)?;
        let k_in = kernel.dims()[0];
        if k_in != input_dim {
            return Err(LayerError::ShapeMismatch(format!(
                "inputs have {input_dim} channels but `{}` produces {k_in}",
                self.tied_to
            )));
        }

        let device = kernel.device();
        let bias = self.use_bias.then(|| {
            let receptive = kh * kw;
            self.bias_initializer.init_with::<B, 1, _>(
                [filters],
                Some(input_dim * receptive),
                Some(filters * receptive),
                &device,
            )
        });

        log::debug!(
            "built tied deconvolution on `{}`: input {}, nominal kernel {:?}, tied kernel {:?}, bias {}",
            self.tied_to,
            format_shape(&shape),
            kernel_shape,
            kernel.dims(),
            bias.is_some()
        );

        Ok(TiedConvTranspose2d {
            bias,
            input_channels: input_dim,
            config: Ignored(config),
            inferred_shape: Ignored(OnceLock::new()),
        })
    }

    /// Current kernel of the tied convolution as `[in, out, kh, kw]`, checked
    /// against `kernel_size` and `filters`.
    fn tied_kernel<B: Backend>(&self, registry: &LayerRegistry<B>) -> error::Result<Tensor<B, 4>> {
        let kernel = registry.kernel(&self.tied_to)?.swap_dims(2, 3);
        let [_, k_out, k_h, k_w] = kernel.dims();

        if [k_h, k_w] != self.kernel_size {
            return Err(LayerError::InvalidConfig(format!(
                "kernel_size {:?} does not match the {}x{} kernel derived from `{}`",
                self.kernel_size, k_h, k_w, self.tied_to
            )));
        }
        if k_out != self.filters {
            return Err(LayerError::InvalidConfig(format!(
                "filters is {} but `{}` takes {k_out} input channels",
                self.filters, self.tied_to
            )));
        }
        Ok(kernel)
    }

    /// Output shape in `data_format` order for the given spatial lengths.
    fn infer_output_shape(
        &self,
        batch: Option<usize>,
        height: Option<usize>,
        width: Option<usize>,
    ) -> Shape4 {
        let [kh, kw] = self.kernel_size;
        let [sh, sw] = self.strides;
        let out_h = deconv_length(height, sh, kh, self.padding);
        let out_w = deconv_length(width, sw, kw, self.padding);
        from_channels_last(
            [batch, out_h, out_w, Some(self.filters)],
            self.resolved_data_format(),
        )
    }

    /// Output shape for `input_shape` before any input has been seen: the
    /// configured shape verbatim, else the inferred one.
    pub fn compute_output_shape(&self, input_shape: &[Option<usize>]) -> error::Result<Shape4> {
        let shape = expect_rank4(input_shape)?;
        if let Some(fixed) = self.output_shape {
            return Ok(fixed);
        }
        let (h_axis, w_axis) = self.resolved_data_format().spatial_axes();
        Ok(self.infer_output_shape(shape[0], shape[h_axis], shape[w_axis]))
    }

    /// Serializable configuration: the convolution keys plus `tied_to` and
    /// `output_shape`.
    pub fn get_config(&self) -> Map<String, Value> {
        let mut config = self.base_config();
        config.insert("tied_to".into(), json!(self.tied_to));
        config.insert("output_shape".into(), json!(self.output_shape));
        config
    }

    fn base_config(&self) -> Map<String, Value> {
        let mut config = Map::new();
        config.insert("filters".into(), json!(self.filters));
        config.insert("kernel_size".into(), json!(self.kernel_size));
        config.insert("strides".into(), json!(self.strides));
        config.insert("padding".into(), json!(self.padding));
        config.insert("data_format".into(), json!(self.resolved_data_format()));
        config.insert("dilation_rate".into(), json!(self.dilation_rate));
        config.insert("activation".into(), json!(self.activation));
        config.insert("use_bias".into(), json!(self.use_bias));
        config.insert("bias_initializer".into(), json!(self.bias_initializer));
        config.insert("bias_regularizer".into(), json!(self.bias_regularizer));
        config.insert("bias_constraint".into(), json!(self.bias_constraint));
        config.insert("activity_regularizer".into(), json!(self.activity_regularizer));
        config
    }

    /// Rebuild a configuration from a map produced by `get_config`.
    pub fn from_config(config: &Map<String, Value>) -> error::Result<Self> {
        let parsed: Self = serde_json::from_value(Value::Object(config.clone()))
            .map_err(|e| LayerError::InvalidConfig(format!("malformed layer config: {e}")))?;
        parsed.validate()?;
        Ok(parsed)
    }
}

/// Transposed convolution reusing the kernel of another convolution.
///
/// Only the bias is a parameter of this module; the kernel belongs to the
/// tied `Conv2d` and is looked up on each forward pass.
#[derive(Module, Debug)]
pub struct TiedConvTranspose2d<B: Backend> {
    bias: Option<Param<Tensor<B, 1>>>,
    input_channels: usize,
    /// Configuration with `data_format` resolved.
    config: Ignored<TiedConvTranspose2dConfig>,
    /// Output shape in `data_format` order with an unresolved batch slot.
    inferred_shape: Ignored<OnceLock<Shape4>>,
}

impl<B: Backend> TiedConvTranspose2d<B> {
    pub fn config(&self) -> &TiedConvTranspose2dConfig {
        &self.config
    }

    pub fn data_format(&self) -> DataFormat {
        self.config.resolved_data_format()
    }

    pub fn input_channels(&self) -> usize {
        self.input_channels
    }

    pub fn bias(&self) -> Option<&Param<Tensor<B, 1>>> {
        self.bias.as_ref()
    }

    /// Kernel the next forward pass will use, `[in, out, kh, kw]`.
    pub fn tied_kernel(&self, registry: &LayerRegistry<B>) -> error::Result<Tensor<B, 4>> {
        let kernel = self.config.tied_kernel(registry)?;
        let k_in = kernel.dims()[0];
        if k_in != self.input_channels {
            return Err(LayerError::ShapeMismatch(format!(
                "layer was built for {} input channels but `{}` now produces {k_in}",
                self.input_channels, self.config.tied_to
            )));
        }
        Ok(kernel)
    }

    /// Static output-shape query.
    ///
    /// Returns the configured shape verbatim, else the shape cached by the
    /// first invocation (batch taken from `input_shape`), else the shape
    /// inferred from `input_shape`.
    pub fn compute_output_shape(&self, input_shape: &[Option<usize>]) -> error::Result<Shape4> {
        let shape = expect_rank4(input_shape)?;
        if self.config.output_shape.is_none() {
            if let Some(cached) = self.inferred_shape.get() {
                let mut out = *cached;
                out[0] = shape[0];
                return Ok(out);
            }
        }
        self.config.compute_output_shape(&shape)
    }

    /// Bias regularization penalty, if any.
    pub fn regularization_loss(&self) -> Option<Tensor<B, 1>> {
        let regularizer = self.config.bias_regularizer?;
        let bias = self.bias.as_ref()?;
        Some(regularizer.penalty(bias.val()))
    }

    /// Activity regularization penalty for an output of this layer, if any.
    pub fn activity_loss(&self, outputs: &Tensor<B, 4>) -> Option<Tensor<B, 1>> {
        self.config
            .activity_regularizer
            .map(|regularizer| regularizer.penalty(outputs.clone()))
    }

    /// Project the bias through the configured constraint.
    pub fn apply_constraints(&mut self) {
        if let Some(constraint) = self.config.bias_constraint {
            self.bias = self
                .bias
                .take()
                .map(|bias| bias.map(|tensor| constraint.apply(tensor)));
        }
    }

    pub fn get_config(&self) -> Map<String, Value> {
        self.config.get_config()
    }
}

impl<B: Backend + DeconvDispatch> TiedConvTranspose2d<B> {
    /// Forward pass with the tied convolution's current kernel.
    ///
    /// The bias is allocated at build time but is not added to the result.
    pub fn forward(&self, input: Tensor<B, 4>, registry: &LayerRegistry<B>) -> error::Result<Tensor<B, 4>> {
        let data_format = self.data_format();
        let dims = input.dims();

        let channels = dims[data_format.channel_axis()];
        if channels != self.input_channels {
            return Err(LayerError::ShapeMismatch(format!(
                "layer was built for {} input channels, got {channels}",
                self.input_channels
            )));
        }

        let configured = match self.config.output_shape {
            Some(fixed) => fixed,
            None => *self.inferred_shape.get_or_init(|| {
                let (h_axis, w_axis) = data_format.spatial_axes();
                let inferred = self
                    .config
                    .infer_output_shape(None, Some(dims[h_axis]), Some(dims[w_axis]));
                log::debug!("inferred output shape {}", format_shape(&inferred));
                inferred
            }),
        };

        let target = resolve_target_shape(configured, data_format, dims[0])?;
        let [batch, out_h, out_w, out_c] = target;
        if batch != dims[0] || out_c != self.config.filters {
            return Err(LayerError::ShapeMismatch(format!(
                "output shape {} cannot be produced from {} inputs with {} filters",
                format_shape(&configured),
                dims[0],
                self.config.filters
            )));
        }

        let kernel = self.tied_kernel(registry)?;
        let x = match data_format {
            DataFormat::ChannelsFirst => input,
            DataFormat::ChannelsLast => input.permute([0, 3, 1, 2]),
        };
        let y = conv_transpose2d_to_shape(
            x,
            kernel,
            [out_h, out_w],
            self.config.strides,
            self.config.padding,
        )?;
        let y = match data_format {
            DataFormat::ChannelsFirst => y,
            DataFormat::ChannelsLast => y.permute([0, 2, 3, 1]),
        };
        let outputs = y.reshape(from_channels_last(target, data_format));

        Ok(self.config.activation.apply(outputs))
    }
}

/// A tied layer that builds itself from the first input it sees.
#[derive(Debug)]
pub enum LazyTiedConvTranspose2d<B: Backend> {
    Unbuilt(TiedConvTranspose2dConfig),
    Built(TiedConvTranspose2d<B>),
}

impl<B: Backend> LazyTiedConvTranspose2d<B> {
    pub fn config(&self) -> &TiedConvTranspose2dConfig {
        match self {
            Self::Unbuilt(config) => config,
            Self::Built(layer) => layer.config(),
        }
    }

    pub fn is_built(&self) -> bool {
        matches!(self, Self::Built(_))
    }

    pub fn layer(&self) -> Option<&TiedConvTranspose2d<B>> {
        match self {
            Self::Built(layer) => Some(layer),
            Self::Unbuilt(_) => None,
        }
    }

    pub fn layer_mut(&mut self) -> Option<&mut TiedConvTranspose2d<B>> {
        match self {
            Self::Built(layer) => Some(layer),
            Self::Unbuilt(_) => None,
        }
    }

    /// The built module, for nesting in a model.
    pub fn into_layer(self) -> error::Result<TiedConvTranspose2d<B>> {
        match self {
            Self::Built(layer) => Ok(layer),
            Self::Unbuilt(_) => Err(LayerError::NotBuilt),
        }
    }

    /// Build for `input_shape`. Does nothing once built.
    pub fn build(&mut self, input_shape: &[Option<usize>], registry: &LayerRegistry<B>) -> error::Result<()> {
        if let Self::Unbuilt(config) = self {
            let layer = config.build(input_shape, registry)?;
            *self = Self::Built(layer);
        }
        Ok(())
    }

    pub fn compute_output_shape(&self, input_shape: &[Option<usize>]) -> error::Result<Shape4> {
        match self {
            Self::Unbuilt(config) => config.compute_output_shape(input_shape),
            Self::Built(layer) => layer.compute_output_shape(input_shape),
        }
    }

    pub fn get_config(&self) -> Map<String, Value> {
        self.config().get_config()
    }
}

impl<B: Backend + DeconvDispatch> LazyTiedConvTranspose2d<B> {
    pub fn forward(&self, input: Tensor<B, 4>, registry: &LayerRegistry<B>) -> error::Result<Tensor<B, 4>> {
        match self {
            Self::Built(layer) => layer.forward(input, registry),
            Self::Unbuilt(_) => Err(LayerError::NotBuilt),
        }
    }

    /// Build from the input's shape if needed, then run the forward pass.
    pub fn call(&mut self, input: Tensor<B, 4>, registry: &LayerRegistry<B>) -> error::Result<Tensor<B, 4>> {
        if !self.is_built() {
            let shape: Vec<Option<usize>> = input.dims().iter().map(|&d| Some(d)).collect();
            self.build(&shape, registry)?;
        }
        self.forward(input, registry)
    }
}
