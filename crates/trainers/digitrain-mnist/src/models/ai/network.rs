use burn::module::{Ignored, Module, Param};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::loss::{CrossEntropyLossConfig, MseLoss, Reduction};
use burn::nn::pool::{AvgPool2d, AvgPool2dConfig, MaxPool2d, MaxPool2dConfig};
use burn::nn::{Linear, LinearConfig, PaddingConfig2d};
use burn::prelude::{Backend, Tensor};
use burn::tensor::backend::AutodiffBackend;
use burn::train::{ClassificationOutput, TrainOutput, TrainStep, ValidStep};

use crate::models::ai::layers::{
    Activation, ConvolutionSpec, LayerSpec, LossFunction, NetworkPlan, PlannedLayer, PoolingType,
    Shape, SubsamplingSpec,
};
use crate::models::data::mnist::MnistBatch;

/// Activations flowing between layers.
enum Features<B: Backend> {
    Spatial(Tensor<B, 4>),
    Flat(Tensor<B, 2>),
}

impl<B: Backend> Features<B> {
    fn spatial(self, shape: Shape) -> Tensor<B, 4> {
        match (self, shape) {
            (Features::Spatial(x), _) => x,
            (
                Features::Flat(x),
                Shape::Spatial {
                    channels,
                    height,
                    width,
                },
            ) => {
                let [batch_size, _] = x.dims();
                x.reshape([batch_size, channels, height, width])
            }
            (Features::Flat(x), Shape::Flat(units)) => {
                let [batch_size, _] = x.dims();
                x.reshape([batch_size, units, 1, 1])
            }
        }
    }

    fn flat(self) -> Tensor<B, 2> {
        match self {
            Features::Spatial(x) => {
                let [batch_size, channels, height, width] = x.dims();
                x.reshape([batch_size, channels * height * width])
            }
            Features::Flat(x) => x,
        }
    }
}

/// One layer of the network. Exactly one of the optional modules is set.
#[derive(Module, Debug)]
pub struct LayerUnit<B: Backend> {
    pub(crate) conv: Option<Conv2d<B>>,
    pub(crate) max_pool: Option<MaxPool2d>,
    pub(crate) avg_pool: Option<AvgPool2d>,
    pub(crate) dense: Option<Linear<B>>,
    activation: Ignored<Activation>,
    input: Ignored<Shape>,
}

impl<B: Backend> LayerUnit<B> {
    fn empty(activation: Activation, input: Shape) -> Self {
        Self {
            conv: None,
            max_pool: None,
            avg_pool: None,
            dense: None,
            activation: Ignored(activation),
            input: Ignored(input),
        }
    }

    fn convolution(
        plan: &NetworkPlan,
        layer: &PlannedLayer,
        conv: &ConvolutionSpec,
        device: &B::Device,
    ) -> Self {
        let channels = match layer.input {
            Shape::Spatial { channels, .. } => channels,
            Shape::Flat(units) => units,
        };
        let mut module = Conv2dConfig::new([channels, conv.n_out], conv.kernel)
            .with_stride(conv.stride)
            .with_padding(PaddingConfig2d::Explicit(conv.padding[0], conv.padding[1]))
            .with_initializer(plan.weight_init.initializer())
            .init(device);
        // Materialise the lazy weight now, while the backend seed is in effect.
        let _ = module.weight.val();
        module.bias = Some(Param::from_tensor(Tensor::full(
            [conv.n_out],
            plan.bias_init,
            device,
        )));

        let mut unit = Self::empty(conv.activation, layer.input);
        unit.conv = Some(module);
        unit
    }

    fn subsampling(layer: &PlannedLayer, pool: &SubsamplingSpec) -> Self {
        let mut unit = Self::empty(Activation::Identity, layer.input);
        match pool.pooling {
            PoolingType::Max => {
                unit.max_pool = Some(
                    MaxPool2dConfig::new(pool.kernel)
                        .with_strides(pool.stride)
                        .init(),
                )
            }
            PoolingType::Avg => {
                unit.avg_pool = Some(
                    AvgPool2dConfig::new(pool.kernel)
                        .with_strides(pool.stride)
                        .init(),
                )
            }
        }
        unit
    }

    fn dense(
        plan: &NetworkPlan,
        layer: &PlannedLayer,
        activation: Activation,
        device: &B::Device,
    ) -> Self {
        let n_out = layer.output.size();
        let mut module = LinearConfig::new(layer.input.size(), n_out)
            .with_initializer(plan.weight_init.initializer())
            .init(device);
        // Materialise the lazy weight now, while the backend seed is in effect.
        let _ = module.weight.val();
        module.bias = Some(Param::from_tensor(Tensor::full(
            [n_out],
            plan.bias_init,
            device,
        )));

        let mut unit = Self::empty(activation, layer.input);
        unit.dense = Some(module);
        unit
    }

    fn forward(&self, x: Features<B>) -> Features<B> {
        let activation = self.activation.0;
        if let Some(conv) = &self.conv {
            let x = conv.forward(x.spatial(self.input.0));
            return Features::Spatial(activation.apply(x));
        }
        if let Some(pool) = &self.max_pool {
            return Features::Spatial(pool.forward(x.spatial(self.input.0)));
        }
        if let Some(pool) = &self.avg_pool {
            return Features::Spatial(pool.forward(x.spatial(self.input.0)));
        }
        if let Some(dense) = &self.dense {
            return Features::Flat(activation.apply(dense.forward(x.flat())));
        }
        x
    }
}

/// A sequential classifier built from a validated [`NetworkPlan`].
///
/// The output layer's activation is not part of [`Network::forward`]; the loss consumes the
/// raw scores and [`Network::predict`] applies the activation.
#[derive(Module, Debug)]
pub struct Network<B: Backend> {
    pub(crate) layers: Vec<LayerUnit<B>>,
    output_activation: Ignored<Activation>,
    loss: Ignored<LossFunction>,
    num_classes: Ignored<usize>,
}

impl<B: Backend> Network<B> {
    /// Builds the layers in order after seeding the backend, so the same plan and seed always
    /// give the same initial parameters.
    pub fn new(plan: &NetworkPlan, device: &B::Device) -> Self {
        B::seed(plan.seed);
        let mut layers = Vec::with_capacity(plan.layers.len());
        let mut output_activation = Activation::Softmax;
        let mut loss = LossFunction::default();

        for layer in plan.layers.iter() {
            let unit = match &layer.spec {
                LayerSpec::Convolution(conv) => LayerUnit::convolution(plan, layer, conv, device),
                LayerSpec::Subsampling(pool) => LayerUnit::subsampling(layer, pool),
                LayerSpec::Dense(dense) => LayerUnit::dense(plan, layer, dense.activation, device),
                LayerSpec::Output(output) => {
                    output_activation = output.activation;
                    loss = output.loss;
                    LayerUnit::dense(plan, layer, Activation::Identity, device)
                }
            };
            layers.push(unit);
        }

        Self {
            layers,
            output_activation: Ignored(output_activation),
            loss: Ignored(loss),
            num_classes: Ignored(plan.num_classes),
        }
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.layers
            .iter()
            .fold(Features::Spatial(images), |x, layer| layer.forward(x))
            .flat()
    }

    /// Class probabilities, or whatever the output activation produces.
    pub fn predict(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.output_activation.0.apply(self.forward(images))
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes.0
    }

    pub fn loss(&self, output: Tensor<B, 2>, batch: &MnistBatch<B>) -> Tensor<B, 1> {
        match self.loss.0 {
            LossFunction::NegativeLogLikelihood | LossFunction::Mcxent => {
                CrossEntropyLossConfig::new()
                    .init(&output.device())
                    .forward(output, batch.targets.clone())
            }
            LossFunction::SquaredError => MseLoss::new().forward(
                self.output_activation.0.apply(output),
                batch.labels.clone(),
                Reduction::Mean,
            ),
        }
    }

    pub fn forward_classification(&self, batch: MnistBatch<B>) -> ClassificationOutput<B> {
        let output = self.forward(batch.images.clone());
        let loss = self.loss(output.clone(), &batch);

        ClassificationOutput {
            loss,
            output,
            targets: batch.targets,
        }
    }
}

impl<B: AutodiffBackend> TrainStep<MnistBatch<B>, ClassificationOutput<B>> for Network<B> {
    fn step(&self, batch: MnistBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let item = self.forward_classification(batch);
        TrainOutput::new(self, item.loss.backward(), item)
    }
}

impl<B: Backend> ValidStep<MnistBatch<B>, ClassificationOutput<B>> for Network<B> {
    fn step(&self, batch: MnistBatch<B>) -> ClassificationOutput<B> {
        self.forward_classification(batch)
    }
}
