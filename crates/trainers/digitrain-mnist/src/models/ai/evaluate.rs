use burn::data::dataset::vision::MnistItem;
use burn::data::dataset::Dataset;
use burn::prelude::Backend;
use log::debug;

use digitrain_core::error::TrainResult;
use digitrain_core::eval::{Evaluation, EvaluationSettings};
use digitrain_core::settings::Component;

use crate::models::ai::network::Network;
use crate::models::data::dataset::SampleBatcher;
use crate::models::data::iterator::BatchIterator;

/// Scores a network against a full pass of the test iterator.
pub(crate) struct Evaluator<B: Backend> {
    batcher: SampleBatcher<B>,
}

impl<B: Backend> Evaluator<B> {
    pub(crate) fn new(device: B::Device) -> Self {
        Self {
            batcher: SampleBatcher::new(device),
        }
    }

    /// The iterator is rewound before and after the pass.
    pub(crate) fn evaluate<D: Dataset<MnistItem>>(
        &self,
        network: &Network<B>,
        iterator: &mut BatchIterator<D>,
    ) -> TrainResult<Evaluation> {
        iterator.reset();
        let evaluation = self.score(network, iterator);
        iterator.reset();
        evaluation
    }

    fn score<D: Dataset<MnistItem>>(
        &self,
        network: &Network<B>,
        iterator: &mut BatchIterator<D>,
    ) -> TrainResult<Evaluation> {
        let settings = EvaluationSettings {
            num_classes: network.num_classes(),
        };
        let mut evaluation = Evaluation::with_settings(&settings);
        for batch in iterator.batches(&self.batcher) {
            let batch = batch?;
            let predicted: Vec<usize> = network
                .predict(batch.images)
                .argmax(1)
                .flatten::<1>(0, 1)
                .into_data()
                .iter::<i64>()
                .map(|class| class as usize)
                .collect();
            let actual: Vec<usize> = batch
                .targets
                .into_data()
                .iter::<i64>()
                .map(|class| class as usize)
                .collect();
            evaluation.record_all(actual, predicted)?;
        }
        debug!("Evaluated {} examples", evaluation.total());
        Ok(evaluation)
    }
}
