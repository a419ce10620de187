use anyhow::Result;
use burn::backend::wgpu::{Wgpu, WgpuDevice};
use burn::backend::NdArray;
use burn::nn::conv::Conv2dConfig;
use burn::prelude::*;
use burn::tensor::Distribution;
use clap::{Args, Parser, Subcommand};

use tiedconv::config::DeviceKind;
use tiedconv::deconv::DeconvDispatch;
use tiedconv::error::format_shape;
use tiedconv::shape::from_channels_last;
use tiedconv::{Activation, DataFormat, LayerRegistry, PaddingMode, TiedConvTranspose2dConfig};

/// Name under which the demo registers the tied convolution.
const ENCODER: &str = "encoder";

/// Tied transposed convolution: decode with the transposed kernel of an encoder convolution.
///
/// The demo creates a `Conv2d` (the encoder), registers it, and ties a
/// transposed convolution to it. The tied layer maps the encoder's output
/// channels back to its input channels without a kernel of its own.
#[derive(Parser)]
#[command(name = "tiedconv", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Push a random input through a tied layer and print shapes and config.
    Run {
        #[command(flatten)]
        layer: LayerArgs,

        /// Batch size of the random input.
        #[arg(long, default_value_t = 1)]
        batch: usize,

        /// Input height.
        #[arg(long, default_value_t = 10)]
        height: usize,

        /// Input width.
        #[arg(long, default_value_t = 10)]
        width: usize,

        /// Compute device (cpu or gpu).
        #[arg(long, default_value = "cpu", value_enum)]
        device: DeviceKind,
    },

    /// Print the output shape for an input shape without running anything.
    Shape {
        #[command(flatten)]
        layer: LayerArgs,

        /// Batch size; unknown when omitted.
        #[arg(long)]
        batch: Option<usize>,

        /// Input height; unknown when omitted.
        #[arg(long)]
        height: Option<usize>,

        /// Input width; unknown when omitted.
        #[arg(long)]
        width: Option<usize>,
    },
}

#[derive(Args)]
struct LayerArgs {
    /// Input channels of the encoder convolution (output channels of the tied layer).
    #[arg(long, default_value_t = 8)]
    in_channels: usize,

    /// Output channels of the encoder convolution (input channels of the tied layer).
    #[arg(long, default_value_t = 4)]
    out_channels: usize,

    /// Square kernel size.
    #[arg(long, default_value_t = 3)]
    kernel: usize,

    /// Stride along both spatial axes.
    #[arg(long, default_value_t = 1)]
    stride: usize,

    #[arg(long, default_value = "valid", value_enum)]
    padding: PaddingMode,

    #[arg(long, default_value = "channels-last", value_enum)]
    data_format: DataFormat,

    #[arg(long, default_value = "linear", value_enum)]
    activation: Activation,

    /// Skip allocating the bias vector.
    #[arg(long)]
    no_bias: bool,
}

impl LayerArgs {
    fn layer_config(&self) -> TiedConvTranspose2dConfig {
        TiedConvTranspose2dConfig::new(
            self.in_channels,
            [self.kernel, self.kernel],
            ENCODER.to_string(),
        )
        .with_strides([self.stride, self.stride])
        .with_padding(self.padding)
        .with_data_format(Some(self.data_format))
        .with_activation(self.activation)
        .with_use_bias(!self.no_bias)
    }
}

/// Run the demo with a specific backend.
fn run_demo<B: Backend + DeconvDispatch>(
    args: &LayerArgs,
    batch: usize,
    height: usize,
    width: usize,
    device: B::Device,
) -> Result<()> {
    let encoder = Conv2dConfig::new([args.in_channels, args.out_channels], [args.kernel, args.kernel])
        .with_stride([args.stride, args.stride])
        .init::<B>(&device);
    let registry = LayerRegistry::new().with(ENCODER, &encoder);

    let mut lazy = args.layer_config().init::<B>()?;

    let shape = from_channels_last([batch, height, width, args.out_channels], args.data_format);
    let input = Tensor::<B, 4>::random(shape, Distribution::Uniform(-1.0, 1.0), &device);
    let output = lazy.call(input, &registry)?;
    let layer = lazy.into_layer()?;

    println!("Input:  {shape:?} ({})", args.data_format);
    println!("Output: {:?}", output.dims());
    println!(
        "Kernel: {:?} (tied to `{ENCODER}`)",
        layer.tied_kernel(&registry)?.dims()
    );
    if let Some(bias) = layer.bias() {
        println!("Bias:   {:?} (allocated, not applied)", bias.val().dims());
    }
    println!("Parameters: {} own, {} in the encoder", layer.num_params(), encoder.num_params());
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::Value::Object(layer.get_config()))?
    );
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            layer,
            batch,
            height,
            width,
            device,
        } => match device {
            DeviceKind::Cpu => {
                run_demo::<NdArray>(&layer, batch, height, width, Default::default())?;
            }
            DeviceKind::Gpu => {
                eprintln!("Using GPU (WGPU)");
                run_demo::<Wgpu>(&layer, batch, height, width, WgpuDevice::default())?;
            }
        },

        Commands::Shape {
            layer,
            batch,
            height,
            width,
        } => {
            // Shape queries need no weights or backend.
            let config = layer.layer_config();
            config.validate()?;
            let input = from_channels_last(
                [batch, height, width, Some(layer.out_channels)],
                layer.data_format,
            );
            let output = config.compute_output_shape(&input)?;
            println!("{} -> {}", format_shape(&input), format_shape(&output));
        }
    }

    Ok(())
}
