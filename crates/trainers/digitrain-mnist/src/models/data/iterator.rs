use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::vision::MnistItem;
use burn::data::dataset::Dataset;
use burn::prelude::Backend;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_pcg::Pcg64;
use serde::Deserialize;

use digitrain_core::error::{TrainError, TrainResult};
use digitrain_core::settings::ComponentSettings;

use crate::models::data::dataset::{DatasetSplit, Remainder, SampleBatcher};
use crate::models::data::mnist::{MnistBatch, MNIST_CLASSES};

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DataSettings {
    pub batch_size: usize,
    pub shuffle: bool,
    pub seed: u64,
    #[serde(default)]
    pub train_remainder: Remainder,
    #[serde(default = "keep_remainder")]
    pub test_remainder: Remainder,
}

fn keep_remainder() -> Remainder {
    Remainder::Keep
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            batch_size: 128,
            shuffle: true,
            seed: 12345,
            train_remainder: Remainder::Drop,
            test_remainder: Remainder::Keep,
        }
    }
}

impl ComponentSettings for DataSettings {}

impl DataSettings {
    pub fn iterator_settings(&self, split: DatasetSplit) -> IteratorSettings {
        let remainder = match split {
            DatasetSplit::Train => self.train_remainder,
            DatasetSplit::Test => self.test_remainder,
        };
        IteratorSettings {
            batch_size: self.batch_size,
            shuffle: self.shuffle,
            seed: self.seed,
            remainder,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IteratorSettings {
    pub batch_size: usize,
    pub shuffle: bool,
    pub seed: u64,
    pub remainder: Remainder,
}

/// A finite, restartable walk over a dataset in groups of `batch_size` items. The visiting
/// order is derived from the seed alone, so a reset always replays the same sequence.
pub struct BatchIterator<D> {
    dataset: D,
    settings: IteratorSettings,
    order: Vec<usize>,
    cursor: usize,
}

impl<D: Dataset<MnistItem>> BatchIterator<D> {
    pub fn new(dataset: D, settings: IteratorSettings) -> TrainResult<Self> {
        if settings.batch_size == 0 {
            return Err(TrainError::config("batch size must be positive"));
        }
        let order = Self::ordering(dataset.len(), &settings);
        Ok(Self {
            dataset,
            settings,
            order,
            cursor: 0,
        })
    }

    fn ordering(len: usize, settings: &IteratorSettings) -> Vec<usize> {
        let mut order: Vec<usize> = (0..len).collect();
        if settings.shuffle {
            let mut rng = Pcg64::seed_from_u64(settings.seed);
            order.shuffle(&mut rng);
        }
        order
    }

    pub fn reset(&mut self) {
        self.order = Self::ordering(self.dataset.len(), &self.settings);
        self.cursor = 0;
    }

    pub fn reshuffle(&mut self, seed: u64) {
        self.settings.seed = seed;
        self.reset();
    }

    pub fn seed(&self) -> u64 {
        self.settings.seed
    }

    pub fn num_items(&self) -> usize {
        self.dataset.len()
    }

    pub fn batches_per_epoch(&self) -> usize {
        let len = self.dataset.len();
        match self.settings.remainder {
            Remainder::Drop => len / self.settings.batch_size,
            Remainder::Keep => len.div_ceil(self.settings.batch_size),
        }
    }

    pub fn has_next(&self) -> bool {
        let remaining = self.order.len() - self.cursor;
        match self.settings.remainder {
            Remainder::Drop => remaining >= self.settings.batch_size,
            Remainder::Keep => remaining > 0,
        }
    }

    fn fetch(&self, index: usize) -> TrainResult<MnistItem> {
        let item = self
            .dataset
            .get(index)
            .ok_or_else(|| TrainError::data(format!("item {} is missing from the dataset", index)))?;
        if item.label as usize >= MNIST_CLASSES {
            return Err(TrainError::data(format!(
                "item {} has label {} outside of {} classes",
                index, item.label, MNIST_CLASSES
            )));
        }
        Ok(item)
    }

    /// Batches the remaining groups of this pass on the device of `batcher`.
    pub fn batches<'a, B: Backend>(
        &'a mut self,
        batcher: &'a SampleBatcher<B>,
    ) -> impl Iterator<Item = TrainResult<MnistBatch<B>>> + 'a {
        self.map(|items| items.map(|items| batcher.batch(items)))
    }
}

impl<D: Dataset<MnistItem>> Iterator for BatchIterator<D> {
    type Item = TrainResult<Vec<MnistItem>>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.has_next() {
            self.cursor = self.order.len();
            return None;
        }
        let end = usize::min(self.cursor + self.settings.batch_size, self.order.len());
        let indices = &self.order[self.cursor..end];
        let items = indices.iter().map(|index| self.fetch(*index)).collect();
        self.cursor = end;
        Some(items)
    }
}
