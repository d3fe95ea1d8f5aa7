use burn::module::{Module, Param};
use burn::prelude::{Backend, Tensor};
use log::debug;

use digitrain_core::error::{TrainError, TrainResult};

use crate::models::ai::network::Network;

/// How parameters reach the averaging device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    Direct,
    ThroughHost,
}

impl Transfer {
    pub fn new(cross_device_access: bool) -> Self {
        match cross_device_access {
            true => Transfer::Direct,
            false => Transfer::ThroughHost,
        }
    }
}

/// Averages worker replicas into a single network and hands copies back to the workers.
#[derive(Clone)]
pub(crate) struct ParameterAverager<B: Backend> {
    device: B::Device,
    transfer: Transfer,
}

impl<B: Backend> ParameterAverager<B> {
    pub(crate) fn new(device: B::Device, transfer: Transfer) -> Self {
        Self { device, transfer }
    }

    /// Element-wise mean of every parameter. Parameter ids are taken from the first replica so
    /// optimizer state stays attached to the averaged values.
    pub(crate) fn average(&self, replicas: Vec<Network<B>>) -> TrainResult<Network<B>> {
        let mut replicas = replicas.into_iter();
        let mut global = replicas
            .next()
            .ok_or_else(|| TrainError::Computation("no replicas to average".to_string()))?;
        let others: Vec<Network<B>> = replicas.collect();
        debug!("Averaging {} replicas", others.len() + 1);

        for (index, layer) in global.layers.iter_mut().enumerate() {
            if let Some(conv) = layer.conv.as_mut() {
                conv.weight = self.average_param(&conv.weight, &others, |other| {
                    other.layers.get(index)?.conv.as_ref().map(|conv| &conv.weight)
                })?;
                conv.bias = match &conv.bias {
                    Some(bias) => Some(self.average_param(bias, &others, |other| {
                        other.layers.get(index)?.conv.as_ref()?.bias.as_ref()
                    })?),
                    None => None,
                };
            }
            if let Some(dense) = layer.dense.as_mut() {
                dense.weight = self.average_param(&dense.weight, &others, |other| {
                    other.layers.get(index)?.dense.as_ref().map(|dense| &dense.weight)
                })?;
                dense.bias = match &dense.bias {
                    Some(bias) => Some(self.average_param(bias, &others, |other| {
                        other.layers.get(index)?.dense.as_ref()?.bias.as_ref()
                    })?),
                    None => None,
                };
            }
        }
        Ok(global)
    }

    /// One copy of the network per device, each with a fresh gradient graph.
    pub(crate) fn broadcast(&self, network: &Network<B>, devices: &[B::Device]) -> Vec<Network<B>> {
        devices
            .iter()
            .map(|device| network.clone().fork(device))
            .collect()
    }

    fn average_param<const D: usize, F>(
        &self,
        param: &Param<Tensor<B, D>>,
        others: &[Network<B>],
        pick: F,
    ) -> TrainResult<Param<Tensor<B, D>>>
    where
        F: Fn(&Network<B>) -> Option<&Param<Tensor<B, D>>>,
    {
        let mut weights = Vec::with_capacity(others.len());
        for other in others {
            let weight = pick(other).ok_or_else(|| {
                TrainError::Computation("replicas do not share the same layout".to_string())
            })?;
            if weight.val().dims() != param.val().dims() {
                return Err(TrainError::Computation(format!(
                    "cannot average parameters of shapes {:?} and {:?}",
                    param.val().dims(),
                    weight.val().dims()
                )));
            }
            weights.push(self.move_tensor(weight.val()));
        }
        let average = Self::get_average_tensor(self.move_tensor(param.val()), weights);
        Ok(Param::initialized(param.id, average.require_grad()))
    }

    fn move_tensor<const D: usize>(&self, tensor: Tensor<B, D>) -> Tensor<B, D> {
        let tensor = tensor.detach();
        match self.transfer {
            Transfer::Direct => tensor.to_device(&self.device),
            Transfer::ThroughHost => Tensor::from_data(tensor.into_data(), &self.device),
        }
    }

    fn get_average_tensor<const D: usize>(
        first: Tensor<B, D>,
        weights: Vec<Tensor<B, D>>,
    ) -> Tensor<B, D> {
        let total_weights = (weights.len() + 1) as f32;
        weights
            .into_iter()
            .fold(first, |sum, tensor| sum.add(tensor))
            .div_scalar(total_weights)
    }
}
