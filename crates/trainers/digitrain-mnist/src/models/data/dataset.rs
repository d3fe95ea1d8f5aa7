use std::fmt::{Display, Formatter};

use burn::prelude::Backend;
use serde::Deserialize;
use typed_builder::TypedBuilder;

/// Converts groups of dataset items into tensors on the device of the consuming worker.
#[derive(Clone, TypedBuilder)]
pub struct SampleBatcher<B: Backend> {
    pub device: B::Device,
}

impl<B: Backend> SampleBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

/// A simple enum to define test and train data types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatasetSplit {
    Train,
    Test,
}

impl Display for DatasetSplit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DatasetSplit::Train => write!(f, "train"),
            DatasetSplit::Test => write!(f, "test"),
        }
    }
}

/// What to do with the last group of an epoch when it holds fewer items than the batch size.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Remainder {
    #[default]
    Drop,
    Keep,
}
