use std::fmt::{Display, Formatter};

use burn::nn::Initializer;
use burn::prelude::{Backend, Tensor};
use burn::tensor::activation::{relu, sigmoid, softmax, tanh};
use serde::Deserialize;

use digitrain_core::error::{TrainError, TrainResult};
use digitrain_core::settings::ComponentSettings;

use crate::models::ai::optim::{Updater, UpdaterSettings};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Identity,
    Relu,
    Sigmoid,
    Tanh,
    Softmax,
}

impl Activation {
    pub fn apply<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Activation::Identity => x,
            Activation::Relu => relu(x),
            Activation::Sigmoid => sigmoid(x),
            Activation::Tanh => tanh(x),
            Activation::Softmax => softmax(x, D - 1),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossFunction {
    #[default]
    NegativeLogLikelihood,
    Mcxent,
    SquaredError,
}

impl LossFunction {
    fn needs_softmax(&self) -> bool {
        matches!(
            self,
            LossFunction::NegativeLogLikelihood | LossFunction::Mcxent
        )
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolingType {
    #[default]
    Max,
    Avg,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightInit {
    /// Gaussian with variance `2 / (fan_in + fan_out)`.
    #[default]
    Xavier,
    XavierUniform,
    /// He initialisation for rectified units.
    Relu,
    /// Uniform in `[-1/sqrt(fan_in), 1/sqrt(fan_in)]`.
    Uniform,
    Zero,
}

impl WeightInit {
    pub fn initializer(&self) -> Initializer {
        match self {
            WeightInit::Xavier => Initializer::XavierNormal { gain: 1.0 },
            WeightInit::XavierUniform => Initializer::XavierUniform { gain: 1.0 },
            WeightInit::Relu => Initializer::KaimingNormal {
                gain: 2.0f64.sqrt(),
                fan_out_only: false,
            },
            WeightInit::Uniform => Initializer::KaimingUniform {
                gain: 1.0 / 3.0f64.sqrt(),
                fan_out_only: false,
            },
            WeightInit::Zero => Initializer::Zeros,
        }
    }
}

fn unit_stride() -> [usize; 2] {
    [1, 1]
}

fn softmax_activation() -> Activation {
    Activation::Softmax
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConvolutionSpec {
    pub kernel: [usize; 2],
    #[serde(default = "unit_stride")]
    pub stride: [usize; 2],
    #[serde(default)]
    pub padding: [usize; 2],
    pub n_in: Option<usize>,
    pub n_out: usize,
    #[serde(default)]
    pub activation: Activation,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubsamplingSpec {
    #[serde(default)]
    pub pooling: PoolingType,
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DenseSpec {
    pub n_in: Option<usize>,
    pub n_out: usize,
    #[serde(default)]
    pub activation: Activation,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OutputSpec {
    pub n_in: Option<usize>,
    pub n_out: Option<usize>,
    #[serde(default = "softmax_activation")]
    pub activation: Activation,
    #[serde(default)]
    pub loss: LossFunction,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LayerSpec {
    Convolution(ConvolutionSpec),
    Subsampling(SubsamplingSpec),
    Dense(DenseSpec),
    Output(OutputSpec),
}

impl LayerSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            LayerSpec::Convolution(_) => "convolution",
            LayerSpec::Subsampling(_) => "subsampling",
            LayerSpec::Dense(_) => "dense",
            LayerSpec::Output(_) => "output",
        }
    }
}

/// Images are fed as `[channels, height, width]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct InputType {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl InputType {
    pub fn convolutional_flat(height: usize, width: usize, channels: usize) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub seed: u64,
    pub l2: f64,
    #[serde(default)]
    pub weight_init: WeightInit,
    #[serde(default)]
    pub bias_init: f64,
    pub num_classes: usize,
    pub updater: UpdaterSettings,
    pub input: InputType,
    pub layers: Vec<LayerSpec>,
}

impl ComponentSettings for NetworkSettings {}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            seed: 123,
            l2: 0.0005,
            weight_init: WeightInit::Xavier,
            bias_init: 0.0,
            num_classes: 10,
            updater: UpdaterSettings::default(),
            input: InputType::convolutional_flat(28, 28, 1),
            layers: vec![
                LayerSpec::Convolution(ConvolutionSpec {
                    kernel: [5, 5],
                    stride: [1, 1],
                    padding: [0, 0],
                    n_in: Some(1),
                    n_out: 20,
                    activation: Activation::Identity,
                }),
                LayerSpec::Subsampling(SubsamplingSpec {
                    pooling: PoolingType::Max,
                    kernel: [2, 2],
                    stride: [2, 2],
                }),
                LayerSpec::Convolution(ConvolutionSpec {
                    kernel: [5, 5],
                    stride: [1, 1],
                    padding: [0, 0],
                    n_in: None,
                    n_out: 50,
                    activation: Activation::Identity,
                }),
                LayerSpec::Subsampling(SubsamplingSpec {
                    pooling: PoolingType::Max,
                    kernel: [2, 2],
                    stride: [2, 2],
                }),
                LayerSpec::Dense(DenseSpec {
                    n_in: None,
                    n_out: 500,
                    activation: Activation::Relu,
                }),
                LayerSpec::Output(OutputSpec {
                    n_in: None,
                    n_out: Some(10),
                    activation: Activation::Softmax,
                    loss: LossFunction::NegativeLogLikelihood,
                }),
            ],
        }
    }
}

/// Activation shape between two layers, batch dimension excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Spatial {
        channels: usize,
        height: usize,
        width: usize,
    },
    Flat(usize),
}

impl Shape {
    pub fn size(&self) -> usize {
        match self {
            Shape::Spatial {
                channels,
                height,
                width,
            } => channels * height * width,
            Shape::Flat(units) => *units,
        }
    }
}

impl Display for Shape {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Shape::Spatial {
                channels,
                height,
                width,
            } => write!(f, "{}x{}x{}", channels, height, width),
            Shape::Flat(units) => write!(f, "{}", units),
        }
    }
}

/// A layer spec whose input and output shapes have been resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedLayer {
    pub index: usize,
    pub spec: LayerSpec,
    pub input: Shape,
    pub output: Shape,
    pub params: usize,
}

/// The validated form of [`NetworkSettings`]. Building one performs every shape check, so a
/// plan can always be turned into a network.
#[derive(Debug, Clone)]
pub struct NetworkPlan {
    pub(crate) seed: u64,
    pub(crate) l2: f64,
    pub(crate) weight_init: WeightInit,
    pub(crate) bias_init: f64,
    pub(crate) num_classes: usize,
    pub(crate) updater: UpdaterSettings,
    pub(crate) layers: Vec<PlannedLayer>,
}

impl NetworkPlan {
    pub fn validate(settings: &NetworkSettings) -> TrainResult<Self> {
        settings.updater.validate()?;
        if settings.l2 < 0.0 {
            return Err(TrainError::config("l2 coefficient must not be negative"));
        }
        if settings.num_classes == 0 {
            return Err(TrainError::config("class count must be positive"));
        }
        let input = &settings.input;
        if input.height == 0 || input.width == 0 || input.channels == 0 {
            return Err(TrainError::config(format!("invalid input type {:?}", input)));
        }
        match settings.layers.last() {
            Some(LayerSpec::Output(_)) => {}
            _ => return Err(TrainError::config("the network must end with an output layer")),
        }

        let input = Shape::Spatial {
            channels: input.channels,
            height: input.height,
            width: input.width,
        };
        let last = settings.layers.len() - 1;
        let mut current = input;
        let mut layers = Vec::with_capacity(settings.layers.len());

        for (index, spec) in settings.layers.iter().enumerate() {
            let (output, params) = match spec {
                LayerSpec::Convolution(conv) => Self::plan_convolution(index, conv, current)?,
                LayerSpec::Subsampling(pool) => Self::plan_subsampling(index, pool, current)?,
                LayerSpec::Dense(dense) => {
                    Self::plan_dense(index, dense.n_in, Some(dense.n_out), current)?
                }
                LayerSpec::Output(output) => {
                    if index != last {
                        return Err(TrainError::config(format!(
                            "layer {}: output layer must be the last layer",
                            index
                        )));
                    }
                    Self::check_output(index, output, settings.num_classes)?;
                    Self::plan_dense(index, output.n_in, output.n_out, current)?
                }
            };
            layers.push(PlannedLayer {
                index,
                spec: spec.clone(),
                input: current,
                output,
                params,
            });
            current = output;
        }

        Ok(Self {
            seed: settings.seed,
            l2: settings.l2,
            weight_init: settings.weight_init,
            bias_init: settings.bias_init,
            num_classes: settings.num_classes,
            updater: settings.updater.clone(),
            layers,
        })
    }

    fn window(
        index: usize,
        extent: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
    ) -> TrainResult<usize> {
        if kernel == 0 || stride == 0 {
            return Err(TrainError::config(format!(
                "layer {}: kernel and stride must be positive",
                index
            )));
        }
        let padded = extent + 2 * padding;
        if kernel > padded {
            return Err(TrainError::config(format!(
                "layer {}: kernel {} does not fit an input extent of {}",
                index, kernel, padded
            )));
        }
        Ok((padded - kernel) / stride + 1)
    }

    fn spatial(index: usize, kind: &str, shape: Shape) -> TrainResult<(usize, usize, usize)> {
        match shape {
            Shape::Spatial {
                channels,
                height,
                width,
            } => Ok((channels, height, width)),
            Shape::Flat(units) => Err(TrainError::config(format!(
                "layer {}: {} layer cannot follow a flat activation of {} units",
                index, kind, units
            ))),
        }
    }

    fn plan_convolution(
        index: usize,
        conv: &ConvolutionSpec,
        input: Shape,
    ) -> TrainResult<(Shape, usize)> {
        let (channels, height, width) = Self::spatial(index, "convolution", input)?;
        if let Some(n_in) = conv.n_in {
            if n_in != channels {
                return Err(TrainError::config(format!(
                    "layer {}: declared n_in {} but the previous layer produces {} channels",
                    index, n_in, channels
                )));
            }
        }
        if conv.n_out == 0 {
            return Err(TrainError::config(format!(
                "layer {}: convolution needs at least one filter",
                index
            )));
        }
        let height = Self::window(index, height, conv.kernel[0], conv.stride[0], conv.padding[0])?;
        let width = Self::window(index, width, conv.kernel[1], conv.stride[1], conv.padding[1])?;
        let params = conv.n_out * channels * conv.kernel[0] * conv.kernel[1] + conv.n_out;
        let output = Shape::Spatial {
            channels: conv.n_out,
            height,
            width,
        };
        Ok((output, params))
    }

    fn plan_subsampling(
        index: usize,
        pool: &SubsamplingSpec,
        input: Shape,
    ) -> TrainResult<(Shape, usize)> {
        let (channels, height, width) = Self::spatial(index, "subsampling", input)?;
        let height = Self::window(index, height, pool.kernel[0], pool.stride[0], 0)?;
        let width = Self::window(index, width, pool.kernel[1], pool.stride[1], 0)?;
        let output = Shape::Spatial {
            channels,
            height,
            width,
        };
        Ok((output, 0))
    }

    fn plan_dense(
        index: usize,
        n_in: Option<usize>,
        n_out: Option<usize>,
        input: Shape,
    ) -> TrainResult<(Shape, usize)> {
        let inferred = input.size();
        if let Some(n_in) = n_in {
            if n_in != inferred {
                return Err(TrainError::config(format!(
                    "layer {}: declared n_in {} but the previous layer produces {} values",
                    index, n_in, inferred
                )));
            }
        }
        let n_out = match n_out {
            Some(0) | None => {
                return Err(TrainError::config(format!(
                    "layer {}: unit count is unspecified",
                    index
                )))
            }
            Some(n_out) => n_out,
        };
        Ok((Shape::Flat(n_out), inferred * n_out + n_out))
    }

    fn check_output(index: usize, output: &OutputSpec, num_classes: usize) -> TrainResult<()> {
        match output.n_out {
            Some(n_out) if n_out != num_classes => Err(TrainError::config(format!(
                "layer {}: output layer has {} units for {} classes",
                index, n_out, num_classes
            ))),
            _ if output.loss.needs_softmax() && output.activation != Activation::Softmax => {
                Err(TrainError::config(format!(
                    "layer {}: {:?} loss needs a softmax output activation",
                    index, output.loss
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn param_count(&self) -> usize {
        self.layers.iter().map(|layer| layer.params).sum()
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn updater(&self) -> TrainResult<Updater> {
        Updater::new(&self.updater, self.l2)
    }

    pub fn learning_rate(&self) -> f64 {
        self.updater.learning_rate
    }

    pub fn layers(&self) -> &[PlannedLayer] {
        &self.layers
    }

    pub fn summary(&self) -> Vec<String> {
        self.layers
            .iter()
            .map(|layer| {
                format!(
                    "layer {} {:<12} {:>10} -> {:<10} params {}",
                    layer.index,
                    layer.spec.kind(),
                    layer.input.to_string(),
                    layer.output.to_string(),
                    layer.params
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_rejected(settings: &NetworkSettings, fragment: &str) {
        match NetworkPlan::validate(settings) {
            Err(TrainError::Configuration(message)) => {
                assert!(message.contains(fragment), "unexpected message: {}", message)
            }
            other => panic!("expected a configuration error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_default_topology_shapes() {
        let plan = NetworkPlan::validate(&NetworkSettings::default()).unwrap();
        let outputs: Vec<String> = plan.layers().iter().map(|l| l.output.to_string()).collect();
        assert_eq!(
            outputs,
            vec!["20x24x24", "20x12x12", "50x8x8", "50x4x4", "500", "10"]
        );
        assert_eq!(
            plan.layers()[4].input,
            Shape::Spatial {
                channels: 50,
                height: 4,
                width: 4
            }
        );
        assert_eq!(plan.param_count(), 520 + 25_050 + 400_500 + 5_010);
        assert_eq!(plan.num_classes(), 10);
        assert_eq!(plan.summary().len(), 6);
    }

    #[test]
    fn test_mismatched_n_in() {
        let mut settings = NetworkSettings::default();
        settings.layers[4] = LayerSpec::Dense(DenseSpec {
            n_in: Some(784),
            n_out: 500,
            activation: Activation::Relu,
        });
        assert_rejected(&settings, "declared n_in 784");
    }

    #[test]
    fn test_kernel_larger_than_input() {
        let mut settings = NetworkSettings::default();
        settings.layers[2] = LayerSpec::Convolution(ConvolutionSpec {
            kernel: [13, 13],
            stride: [1, 1],
            padding: [0, 0],
            n_in: None,
            n_out: 50,
            activation: Activation::Identity,
        });
        assert_rejected(&settings, "does not fit");
    }

    #[test]
    fn test_convolution_after_dense() {
        let mut settings = NetworkSettings::default();
        settings.layers.swap(3, 4);
        assert_rejected(&settings, "cannot follow a flat activation");
    }

    #[test]
    fn test_unspecified_output_units() {
        let mut settings = NetworkSettings::default();
        settings.layers[5] = LayerSpec::Output(OutputSpec {
            n_in: None,
            n_out: None,
            activation: Activation::Softmax,
            loss: LossFunction::NegativeLogLikelihood,
        });
        assert_rejected(&settings, "unspecified");
    }

    #[test]
    fn test_output_units_must_match_classes() {
        let mut settings = NetworkSettings::default();
        settings.num_classes = 12;
        assert_rejected(&settings, "10 units for 12 classes");
    }

    #[test]
    fn test_missing_output_layer() {
        let mut settings = NetworkSettings::default();
        settings.layers.pop();
        assert_rejected(&settings, "must end with an output layer");
    }

    #[test]
    fn test_output_layer_not_last() {
        let mut settings = NetworkSettings::default();
        let output = settings.layers[5].clone();
        settings.layers.insert(4, output);
        assert_rejected(&settings, "must be the last layer");
    }

    #[test]
    fn test_likelihood_needs_softmax() {
        let mut settings = NetworkSettings::default();
        settings.layers[5] = LayerSpec::Output(OutputSpec {
            n_in: None,
            n_out: Some(10),
            activation: Activation::Sigmoid,
            loss: LossFunction::Mcxent,
        });
        assert_rejected(&settings, "softmax");
    }

    #[test]
    fn test_layers_from_toml() {
        let layers: Vec<LayerSpec> = toml::from_str::<toml::Table>(
            r#"
            [[layers]]
            kind = "convolution"
            kernel = [3, 3]
            n_out = 4
            activation = "relu"

            [[layers]]
            kind = "subsampling"
            pooling = "avg"
            kernel = [2, 2]
            stride = [2, 2]

            [[layers]]
            kind = "output"
            n_out = 10
            loss = "negative_log_likelihood"
            "#,
        )
        .unwrap()["layers"]
            .clone()
            .try_into()
            .unwrap();
        assert_eq!(layers.len(), 3);
        match &layers[0] {
            LayerSpec::Convolution(conv) => {
                assert_eq!(conv.stride, [1, 1]);
                assert_eq!(conv.activation, Activation::Relu);
                assert_eq!(conv.n_in, None);
            }
            other => panic!("unexpected layer {:?}", other),
        }
        match &layers[2] {
            LayerSpec::Output(output) => assert_eq!(output.activation, Activation::Softmax),
            other => panic!("unexpected layer {:?}", other),
        }
    }
}
